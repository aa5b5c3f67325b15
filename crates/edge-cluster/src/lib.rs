//! Uniform async interface over the cluster back-ends a service manager can
//! deploy/scale workloads on, grounded on
//! `original_source/cluster/{Cluster,K8sCluster,DockerCluster}.py`.
//!
//! The original's "try, fall back" exception handling becomes typed result
//! values here: every fallible operation returns a [`ClusterError`] carrying
//! a [`ClusterErrorKind`] the caller can branch on without downcasting.

mod backend;
mod manifest;

pub use backend::docker::DockerBackend;
pub use backend::kubernetes::KubernetesBackend;
pub use manifest::ServiceManifest;

use async_trait::async_trait;
use edge_core::{Deployment, ServiceInstance};
use thiserror::Error;

/// Coarse classification of cluster-adapter failures, matching
/// `SPEC_FULL.md` §9's typed replacement for the original's exception-driven
/// control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterErrorKind {
    /// Likely to succeed on retry: API timeout, 5xx, container start failure.
    Transient,
    /// The referenced object does not exist in the cluster.
    NotFound,
    /// The adapter's credentials don't allow the operation.
    PermissionDenied,
    /// The cluster API itself could not be reached.
    Unavailable,
}

#[derive(Debug, Error)]
#[error("{kind:?}: {message}")]
pub struct ClusterError {
    pub kind: ClusterErrorKind,
    pub message: String,
}

impl ClusterError {
    pub fn new(kind: ClusterErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ClusterErrorKind::Transient, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ClusterErrorKind::NotFound, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ClusterErrorKind::Unavailable, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(ClusterErrorKind::PermissionDenied, message)
    }

    /// Whether the caller should retry the operation (`ServiceManager`
    /// retries transient failures up to 3 times, per `SPEC_FULL.md` §4.3).
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind, ClusterErrorKind::Transient)
    }
}

/// The label annotation every cluster object carries so instances can be
/// matched back to their `Service` after a controller restart.
pub const LABEL_NAME: &str = "edge.service";
/// Docker-only: the container port label, since Docker containers don't
/// carry a structured service-port field the way a K8s Service object does.
pub const LABEL_PORT: &str = "edge.port";

/// Uniform interface over a single cluster attachment, implemented by
/// [`KubernetesBackend`] and [`DockerBackend`].
#[async_trait]
pub trait ClusterAdapter: Send + Sync {
    /// Establishes (or verifies) connectivity to the cluster API.
    async fn connect(&self) -> Result<(), ClusterError>;

    /// Applies `manifest`, returning the resulting instance. Does not wait
    /// for readiness; callers needing that call [`ClusterAdapter::scale`]
    /// or poll [`ClusterAdapter::deployments`] afterwards.
    async fn deploy(&self, manifest: &ServiceManifest) -> Result<ServiceInstance, ClusterError>;

    /// Scales `instance` to `replicas`. Idempotent: scaling an already-ready
    /// instance to 1, or an already-stopped instance to 0, is a no-op.
    async fn scale(&self, instance: &ServiceInstance, replicas: u32) -> Result<(), ClusterError>;

    /// Lists service instances, optionally filtered by label.
    async fn services(&self, label: Option<&str>) -> Result<Vec<ServiceInstance>, ClusterError>;

    /// Lists deployment readiness records, optionally filtered by label.
    async fn deployments(&self, label: Option<&str>) -> Result<Vec<Deployment>, ClusterError>;

    /// Lists running pod/container IPs, optionally filtered by label.
    async fn pods(&self, label: Option<&str>) -> Result<Vec<edge_core::Ipv4Addr>, ClusterError>;
}

//! Kubernetes cluster back-end, grounded on
//! `original_source/util/K8sCluster.py` (and its later variant
//! `util/ClusterK8s.py`), ported to the `kube`/`k8s-openapi` crates rather
//! than the official Python client.

use crate::{ClusterAdapter, ClusterError, ServiceManifest, LABEL_NAME};
use async_trait::async_trait;
use edge_core::{Deployment, Ipv4Addr, ServiceInstance};
use futures_util::StreamExt;
use k8s_openapi::api::apps::v1::Deployment as K8sDeployment;
use k8s_openapi::api::core::v1::{Pod, Service as K8sService};
use kube::api::{Api, DynamicObject, ListParams, Patch, PatchParams};
use kube::core::{ApiResource, GroupVersionKind};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, ResourceExt};
use std::time::Duration;

/// A single Kubernetes API server attachment. `namespace` and `api_server`
/// mirror the constructor arguments of `K8sCluster`; the token-file based
/// auth of the original is replaced by `kube::Client::try_default()`, which
/// reads the ambient kubeconfig/in-cluster service-account the same way
/// every Rust operator in the retrieval pack expects to authenticate.
pub struct KubernetesBackend {
    api_server: String,
    namespace: String,
    client: tokio::sync::OnceCell<Client>,
}

impl KubernetesBackend {
    pub fn new(api_server: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            api_server: api_server.into(),
            namespace: namespace.into(),
            client: tokio::sync::OnceCell::new(),
        }
    }

    async fn client(&self) -> Result<&Client, ClusterError> {
        self.client
            .get_or_try_init(|| async {
                Client::try_default()
                    .await
                    .map_err(|e| ClusterError::unavailable(format!("kube client for {}: {e}", self.api_server)))
            })
            .await
    }

    fn label_selector(label: Option<&str>) -> ListParams {
        match label {
            Some(l) => ListParams::default().labels(&format!("{LABEL_NAME}={l}")),
            None => ListParams::default().labels(LABEL_NAME),
        }
    }
}

#[async_trait]
impl ClusterAdapter for KubernetesBackend {
    async fn connect(&self) -> Result<(), ClusterError> {
        self.client().await.map(|_| ())
    }

    async fn deploy(&self, manifest: &ServiceManifest) -> Result<ServiceInstance, ClusterError> {
        let client = self.client().await?;
        let mut manifest = manifest.clone();
        manifest.annotate(None, 0);

        for doc in &manifest.docs {
            let kind = doc
                .get("kind")
                .and_then(|v| v.as_str())
                .ok_or_else(|| ClusterError::transient("manifest document missing `kind`"))?;
            let api_version = doc
                .get("apiVersion")
                .and_then(|v| v.as_str())
                .unwrap_or("v1");
            let obj: DynamicObject = serde_yaml::from_value(doc.clone())
                .map_err(|e| ClusterError::transient(format!("invalid manifest document: {e}")))?;

            let (group, version) = api_version.split_once('/').map_or(("", api_version), |(g, v)| (g, v));
            let gvk = GroupVersionKind::gvk(group, version, kind);
            let plural = format!("{}s", kind.to_lowercase());
            let ar = ApiResource::from_gvk_with_plural(&gvk, &plural);
            let api: Api<DynamicObject> = Api::namespaced_with(client.clone(), &self.namespace, &ar);

            api.patch(
                &obj.name_any(),
                &PatchParams::apply("edge-dispatcher").force(),
                &Patch::Apply(&obj),
            )
            .await
            .map_err(|e| ClusterError::transient(format!("apply {kind}/{}: {e}", obj.name_any())))?;
        }

        let mut instances = self.services(Some(&manifest.label)).await?;
        instances
            .pop()
            .ok_or_else(|| ClusterError::not_found(format!("no Service object found for label {}", manifest.label)))
    }

    async fn scale(&self, instance: &ServiceInstance, replicas: u32) -> Result<(), ClusterError> {
        let client = self.client().await?;
        let api: Api<K8sDeployment> = Api::namespaced(client.clone(), &self.namespace);

        let current = self.deployments(Some(&instance.service.label)).await?;
        if let Some(dep) = current.first() {
            let idempotent = (replicas >= 1 && dep.is_ready()) || (replicas == 0 && dep.ready_replicas == 0);
            if idempotent {
                return Ok(());
            }
        }

        let patch = serde_json::json!({ "spec": { "replicas": replicas } });
        api.patch(
            &instance.service.label,
            &PatchParams::apply("edge-dispatcher"),
            &Patch::Merge(&patch),
        )
        .await
        .map_err(|e| ClusterError::transient(format!("scale {}: {e}", instance.service.label)))?;

        if replicas >= 1 {
            self.wait_for_ready(&instance.service.label, Duration::from_secs(60)).await?;
        }
        Ok(())
    }

    async fn services(&self, label: Option<&str>) -> Result<Vec<ServiceInstance>, ClusterError> {
        let client = self.client().await?;
        let api: Api<K8sService> = Api::namespaced(client.clone(), &self.namespace);
        let items = api
            .list(&Self::label_selector(label))
            .await
            .map_err(|e| ClusterError::transient(format!("list services: {e}")))?;

        let mut out = Vec::new();
        for item in items {
            let Some(svc_label) = item.labels().get(LABEL_NAME).cloned() else {
                continue;
            };
            let cluster_ip = item
                .spec
                .as_ref()
                .and_then(|s| s.cluster_ip.clone())
                .and_then(|ip| ip.parse::<Ipv4Addr>().ok());
            let port = item
                .spec
                .as_ref()
                .and_then(|s| s.ports.as_ref())
                .and_then(|p| p.first())
                .map(|p| p.port as u16)
                .unwrap_or(0);

            let service = edge_core::Service::new(
                edge_core::SocketAddr4::new(cluster_ip.unwrap_or(Ipv4Addr::new(0)), port),
                svc_label,
            );
            let mut instance = ServiceInstance::new(service, Ipv4Addr::new(0));
            instance.cluster_addr = cluster_ip.map(|ip| edge_core::SocketAddr4::new(ip, port));
            out.push(instance);
        }
        Ok(out)
    }

    async fn deployments(&self, label: Option<&str>) -> Result<Vec<Deployment>, ClusterError> {
        let client = self.client().await?;
        let api: Api<K8sDeployment> = Api::namespaced(client.clone(), &self.namespace);
        let items = api
            .list(&Self::label_selector(label))
            .await
            .map_err(|e| ClusterError::transient(format!("list deployments: {e}")))?;

        Ok(items
            .into_iter()
            .map(|d| {
                let status = d.status.unwrap_or_default();
                Deployment::new(
                    status.replicas.unwrap_or(0) as u32,
                    status.ready_replicas.unwrap_or(0) as u32,
                )
            })
            .collect())
    }

    async fn pods(&self, label: Option<&str>) -> Result<Vec<Ipv4Addr>, ClusterError> {
        let client = self.client().await?;
        let api: Api<Pod> = Api::namespaced(client.clone(), &self.namespace);
        let items = api
            .list(&Self::label_selector(label))
            .await
            .map_err(|e| ClusterError::transient(format!("list pods: {e}")))?;

        Ok(items
            .into_iter()
            .filter_map(|p| p.status.and_then(|s| s.pod_ip).and_then(|ip| ip.parse().ok()))
            .collect())
    }
}

impl KubernetesBackend {
    /// Watches the Deployment until `ready_replicas >= 1`, matching
    /// `SPEC_FULL.md` §5: the watch runs on its own task with a 60s request
    /// timeout and is stopped explicitly (aborted) the moment readiness is
    /// observed or the timeout elapses, rather than polling `deployments()`
    /// in a sleep loop.
    async fn wait_for_ready(&self, label: &str, timeout: Duration) -> Result<(), ClusterError> {
        let client = self.client().await?.clone();
        let api: Api<K8sDeployment> = Api::namespaced(client, &self.namespace);
        let wc = watcher::Config::default().labels(&format!("{LABEL_NAME}={label}"));
        let label_owned = label.to_string();

        let mut handle = tokio::spawn(async move {
            let mut stream = watcher(api, wc).applied_objects().boxed();
            while let Some(event) = stream.next().await {
                match event {
                    Ok(dep) => {
                        let ready = dep.status.as_ref().and_then(|s| s.ready_replicas).unwrap_or(0);
                        if ready >= 1 {
                            return Ok(());
                        }
                    }
                    Err(e) => return Err(ClusterError::transient(format!("watch deployment {label_owned}: {e}"))),
                }
            }
            Err(ClusterError::transient(format!(
                "watch stream for deployment {label_owned} ended without becoming ready"
            )))
        });

        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(ClusterError::transient(format!("readiness watch task panicked: {join_err}"))),
            Err(_) => {
                handle.abort();
                Err(ClusterError::transient(format!(
                    "deployment {label} did not become ready within {timeout:?}"
                )))
            }
        }
    }
}

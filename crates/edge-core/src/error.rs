use thiserror::Error;

/// Shared error type for the addressing, configuration and small utility
/// surface `edge-core` exposes directly. Higher-level crates define their own
/// error enums (`edge_cluster::ClusterError`, `edge_manager::ManagerError`,
/// ...) rather than wrapping this one, so that each crate's failure modes
/// stay local to its own boundary.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid address '{input}': {detail}")]
    InvalidAddress { input: String, detail: String },

    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

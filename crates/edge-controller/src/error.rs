use edge_core::ConfigError;
use edge_manager::ManagerError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("config: {0}")]
    Config(#[from] ConfigError),

    #[error("switch topology: {0}")]
    Manager(#[from] ManagerError),

    #[error("switch '{dpid}' has an invalid gateway address '{gateway}'")]
    InvalidGateway { dpid: String, gateway: String },

    #[error("edge '{ip}' on switch '{dpid}' has an invalid address")]
    InvalidEdgeAddress { dpid: String, ip: String },

    #[error("edge '{ip}' declares an invalid service CIDR '{cidr}'")]
    InvalidServiceCidr { ip: String, cidr: String },

    #[error("edge '{ip}' declares an unrecognized route target '{target}'")]
    InvalidRouteTarget { ip: String, target: String },

    #[error("no scheduler registered under the name '{class}'")]
    UnknownSchedulerClass { class: String },
}

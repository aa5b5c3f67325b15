//! Service catalog loading, per-edge instance inventory, and the
//! book/deploy/wait coordination protocol, grounded on
//! `original_source/ryu_ctrl/ServiceManager.py` and `util/EdgeTools.py`.

mod manager;
mod topology;

pub use manager::{DeployKind, DeployTiming, ManagerError, ServiceManager};
pub use topology::{Edge, Switch};

//! Binary-only crate: the controller shell that loads configuration,
//! assembles the switch topology, and wires the service manager, dispatcher
//! and pipeline together, grounded on
//! `original_source/ryu_ctrl/EdgeController.py`.

mod controller;
mod error;
mod sink;
mod topology;

pub use controller::Controller;
pub use error::ControllerError;
pub use sink::LoggingFlowSink;

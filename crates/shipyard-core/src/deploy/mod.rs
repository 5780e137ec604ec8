//! Deployment orchestration: descriptor to live, routed services.

pub mod address;
pub mod orchestrator;

pub use address::resolve_address;
pub use orchestrator::Deployer;

//! Shipyard Core Library
//!
//! Domain logic for deploying services to a fleet of hosts: port allocation,
//! unit rendering, staged cutovers and proxy membership synchronization.

pub mod build;
pub mod command;
pub mod cutover;
pub mod deploy;
pub mod descriptor;
pub mod error;
pub mod fs;
pub mod layout;
pub mod port;
pub mod proxy;
pub mod report;
pub mod settings;
pub mod transport;
pub mod unit;

/// Re-exports of commonly used types
pub mod prelude {
    // Descriptors and settings
    pub use crate::descriptor::{
        AppKind, ApplicationDescriptor, BuildKind, DeployTarget, EnvironmentSpec,
        load_descriptors,
    };
    pub use crate::settings::{BuildLocation, Consistency, Settings, SettingsStore};

    // Orchestration
    pub use crate::cutover::CutoverEngine;
    pub use crate::deploy::Deployer;
    pub use crate::report::{ApplicationReport, DeploymentReport, ProxyOutcome, ServerOutcome};

    // Proxy
    pub use crate::proxy::{
        ProxyApplication, ProxyConfig, ProxyConfigStore, ProxyServer, RenderOptions,
    };

    // Transport
    pub use crate::transport::{Connection, ConnectionPool, SshTransport, Transport};

    // Errors
    pub use crate::error::{ConfigError, DeployError, TransportError, causal_chain};
}

//! Error taxonomy for deployment runs.
//!
//! Each failure class maps to a different propagation policy:
//! - [`ConfigError`]: fatal for the whole run, raised before any remote action
//! - [`TransportError`]: a connection, command or transfer failure on one host
//! - [`BuildError`]: fatal for one application, other applications continue
//! - [`CutoverError`]: fatal for one server, collected by the orchestrator
//! - [`ProxySyncError`]: fatal for one proxy, collected by the orchestrator

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

/// Descriptor or settings problems detected before anything touches a host.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no deployment descriptor found in {root} (expected deploy.toml or deploy.json)")]
    MissingDescriptor { root: PathBuf },

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("application '{app}' is missing required field `{field}`")]
    MissingField { app: String, field: String },

    #[error("application '{app}' has unknown field `{field}` (environments must be tables)")]
    UnknownField { app: String, field: String },

    #[error("application '{app}' has an invalid `{field}`: {message}")]
    InvalidField {
        app: String,
        field: String,
        message: String,
    },

    #[error("invalid {what} name '{name}': use ASCII letters, digits, '-', '_' or '.', starting with a letter or digit")]
    InvalidName { what: &'static str, name: String },

    #[error("application '{app}' environment `{environment}` has an invalid `{field}`: {message}")]
    InvalidEnvironment {
        app: String,
        environment: String,
        field: String,
        message: String,
    },

    #[error("application '{app}' environment `{environment}` is malformed: {message}")]
    MalformedEnvironment {
        app: String,
        environment: String,
        message: String,
    },

    #[error("application '{app}' has no `{environment}` environment")]
    UnknownEnvironment { app: String, environment: String },

    #[error("descriptor declares no applications")]
    NoApplications,

    #[error("invalid setting `{key}`: {message}")]
    InvalidSetting { key: String, message: String },
}

/// A failed interaction with one remote host.
///
/// Transport failures are never retried; the host and the operation that
/// failed are always carried so the operator can tell which step broke.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{host}: {operation} failed: {message}")]
pub struct TransportError {
    pub host: String,
    pub operation: String,
    pub message: String,
}

impl TransportError {
    pub fn new(
        host: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            operation: operation.into(),
            message: message.into(),
        }
    }
}

/// Failures while preparing or compiling an application.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("failed to prepare sources for '{app}': {message}")]
    Prepare { app: String, message: String },

    #[error("local build of '{app}' failed: {message}")]
    Local { app: String, message: String },

    #[error("remote build of '{app}' failed")]
    Remote {
        app: String,
        #[source]
        source: TransportError,
    },
}

/// Port allocation failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PortError {
    /// Every port from the base up to 65535 is bound. This is a host
    /// misconfiguration and is never papered over.
    #[error("no free TCP port at or above {base}")]
    Exhausted { base: u16 },
}

/// The cutover step during which a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CutoverStep {
    Stop,
    Swap,
    Allocate,
    Install,
    Start,
}

impl CutoverStep {
    pub fn as_str(self) -> &'static str {
        match self {
            CutoverStep::Stop => "stop",
            CutoverStep::Swap => "swap",
            CutoverStep::Allocate => "allocate",
            CutoverStep::Install => "install",
            CutoverStep::Start => "start",
        }
    }
}

impl fmt::Display for CutoverStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened to the service after a cutover failed midway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum Recovery {
    /// The failure happened before the service was touched.
    NotNeeded,
    /// A restart was attempted with whatever is in `current` and succeeded.
    Restarted,
    /// A restart was attempted and failed: the service is down.
    RestartFailed { message: String },
}

/// Underlying cause of a cutover failure.
#[derive(Debug, Error)]
pub enum CutoverCause {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Port(#[from] PortError),

    #[error("failed to stage unit file locally: {0}")]
    Io(#[from] std::io::Error),
}

/// A cutover that aborted on one server.
#[derive(Debug, Error)]
#[error("cutover of '{app}' on {host} failed at step `{step}`")]
pub struct CutoverError {
    pub host: String,
    pub app: String,
    pub step: CutoverStep,
    pub recovery: Recovery,
    #[source]
    pub cause: CutoverCause,
}

/// Failures of a single proxy document operation.
#[derive(Debug, Error)]
pub enum ProxyStoreError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("failed to serialize proxy config: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to stage proxy files locally: {0}")]
    Io(#[from] std::io::Error),

    /// The document and its rendering were written, only the reload failed.
    #[error("proxy files were written but reload failed")]
    Reload(#[source] TransportError),

    #[error("proxy config changed concurrently {attempts} time(s) in a row")]
    Conflict { attempts: u32 },

    #[error("proxy update did not complete: {0}")]
    Aborted(String),
}

/// Which proxy synchronization phase failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProxyOperation {
    Withdraw,
    Upsert,
}

impl fmt::Display for ProxyOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyOperation::Withdraw => f.write_str("withdraw"),
            ProxyOperation::Upsert => f.write_str("upsert"),
        }
    }
}

/// A proxy that could not be brought in sync for one application.
#[derive(Debug, Error)]
#[error("{operation} of '{app}' on proxy {proxy} failed")]
pub struct ProxySyncError {
    pub proxy: String,
    pub app: String,
    pub operation: ProxyOperation,
    #[source]
    pub cause: ProxyStoreError,
}

/// Any failure a deployment run can report.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Cutover(#[from] CutoverError),

    #[error(transparent)]
    ProxySync(#[from] ProxySyncError),

    /// A per-host task panicked or was cancelled before reporting back.
    #[error("{task} of '{app}' on {host} did not complete: {message}")]
    TaskFailed {
        host: String,
        app: String,
        task: &'static str,
        message: String,
    },
}

/// Render an error and all of its sources as `a: b: c`.
pub fn causal_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut parts = vec![err.to_string()];
    let mut current = err.source();
    while let Some(source) = current {
        parts.push(source.to_string());
        current = source.source();
    }
    parts.join(": ")
}

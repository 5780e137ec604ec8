//! Outcome of a deployment run.
//!
//! A run never stops at the first host failure, so the report is the only
//! place that says which servers and proxies ended up in which state.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::descriptor::AppKind;
use crate::error::{CutoverStep, DeployError, ProxyOperation, Recovery, causal_chain};

/// Where a server's pipeline stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServerPhase {
    Connect,
    Stage,
    Build,
    Cutover,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerOutcome {
    pub host: String,
    /// Address published to the proxies.
    pub address: Option<String>,
    /// Port the new release listens on, when the cutover completed.
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<ServerPhase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<CutoverStep>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recovery: Option<Recovery>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ServerOutcome {
    pub fn pending(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            address: None,
            port: None,
            failed_at: None,
            step: None,
            recovery: None,
            error: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.port.is_some() && self.error.is_none()
    }

    pub fn fail(&mut self, phase: ServerPhase, err: &(dyn std::error::Error + 'static)) {
        self.failed_at = Some(phase);
        self.error = Some(causal_chain(err));
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProxyOutcome {
    pub host: String,
    pub operation: ProxyOperation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProxyOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApplicationReport {
    pub name: String,
    pub kind: AppKind,
    /// blake3 digest of the tree shipped to the servers.
    pub digest: Option<String>,
    /// Failure that aborted the whole application, such as a build error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub servers: Vec<ServerOutcome>,
    pub proxies: Vec<ProxyOutcome>,
}

impl ApplicationReport {
    pub fn new(name: impl Into<String>, kind: AppKind) -> Self {
        Self {
            name: name.into(),
            kind,
            digest: None,
            error: None,
            servers: Vec::new(),
            proxies: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
            && self.servers.iter().all(ServerOutcome::succeeded)
            && self.proxies.iter().all(ProxyOutcome::succeeded)
    }

    pub fn server(&self, host: &str) -> Option<&ServerOutcome> {
        self.servers.iter().find(|s| s.host == host)
    }
}

#[derive(Debug, Serialize)]
pub struct DeploymentReport {
    pub environment: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub applications: Vec<ApplicationReport>,
    /// Typed failures behind the error strings above, in the order they
    /// happened.
    #[serde(skip)]
    pub errors: Vec<DeployError>,
}

impl DeploymentReport {
    pub fn new(environment: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            environment: environment.into(),
            started_at: now,
            finished_at: now,
            applications: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn finish(&mut self) {
        self.finished_at = Utc::now();
    }

    pub fn is_success(&self) -> bool {
        self.errors.is_empty() && self.applications.iter().all(ApplicationReport::is_success)
    }

    pub fn application(&self, name: &str) -> Option<&ApplicationReport> {
        self.applications.iter().find(|a| a.name == name)
    }

    /// One line per failure, each with its full causal chain.
    pub fn failures(&self) -> Vec<String> {
        self.errors.iter().map(|e| causal_chain(e)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;

    #[test]
    fn a_failed_server_fails_the_run() {
        let mut app = ApplicationReport::new("api", AppKind::Web);
        let mut ok = ServerOutcome::pending("web-1");
        ok.port = Some(9000);
        let mut bad = ServerOutcome::pending("web-2");
        let err = TransportError::new("web-2", "connect", "Connection refused");
        bad.fail(ServerPhase::Connect, &err);
        app.servers = vec![ok, bad];

        assert!(!app.is_success());
        assert_eq!(
            app.server("web-2").unwrap().error.as_deref(),
            Some("web-2: connect failed: Connection refused")
        );

        let mut report = DeploymentReport::new("production");
        report.applications.push(app);
        report.errors.push(err.into());
        assert!(!report.is_success());
        assert_eq!(report.failures().len(), 1);
    }

    #[test]
    fn serializes_without_empty_failure_fields() {
        let mut app = ApplicationReport::new("api", AppKind::Service);
        let mut ok = ServerOutcome::pending("web-1");
        ok.address = Some("10.0.0.1".to_string());
        ok.port = Some(9000);
        app.servers.push(ok);
        let mut report = DeploymentReport::new("production");
        report.applications.push(app);
        report.finish();

        let json = serde_json::to_value(&report).unwrap();
        let server = &json["applications"][0]["servers"][0];
        assert_eq!(server["port"], 9000);
        assert!(server.get("error").is_none());
        assert_eq!(json["applications"][0]["kind"], "service");
        assert!(report.is_success());
    }
}

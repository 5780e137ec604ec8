//! Application descriptors: what to deploy, where, and how it is reached.
//!
//! Descriptors are read once per run from the source root and are immutable
//! afterwards. All validation happens here, before any host is contacted.

pub mod parser;
pub mod schema;

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::Serialize;

use crate::error::ConfigError;

pub use parser::{JSON_DESCRIPTOR, TOML_DESCRIPTOR, load_descriptors, parse_json_str, parse_toml_str};

/// How an application is compiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildKind {
    Go,
}

impl BuildKind {
    fn parse(app: &str, value: &str) -> Result<Self, ConfigError> {
        match value {
            "go" => Ok(BuildKind::Go),
            other => Err(ConfigError::InvalidField {
                app: app.to_string(),
                field: "build".to_string(),
                message: format!("unsupported build kind '{other}' (expected \"go\")"),
            }),
        }
    }
}

/// Whether an application is published through the proxies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AppKind {
    Service,
    Web,
}

impl AppKind {
    fn parse(app: &str, value: &str) -> Result<Self, ConfigError> {
        match value {
            "service" => Ok(AppKind::Service),
            "web" => Ok(AppKind::Web),
            other => Err(ConfigError::InvalidField {
                app: app.to_string(),
                field: "type".to_string(),
                message: format!("unknown application type '{other}' (expected \"service\" or \"web\")"),
            }),
        }
    }
}

/// Hosts and domains of one application in one environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvironmentSpec {
    /// Ordered, without duplicates.
    pub servers: Vec<String>,
    pub proxies: Vec<String>,
    pub domains: BTreeSet<String>,
}

impl EnvironmentSpec {
    /// Every distinct host the application touches, servers first.
    pub fn hosts(&self) -> Vec<&str> {
        let mut seen = BTreeSet::new();
        self.servers
            .iter()
            .chain(&self.proxies)
            .map(String::as_str)
            .filter(|host| seen.insert(*host))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationDescriptor {
    pub name: String,
    /// Source subtree, relative to the source root, `/`-separated.
    pub folder: String,
    pub build: BuildKind,
    pub kind: AppKind,
    pub environments: BTreeMap<String, EnvironmentSpec>,
}

impl ApplicationDescriptor {
    pub fn folder_path(&self) -> &Path {
        Path::new(&self.folder)
    }

    pub fn is_web(&self) -> bool {
        self.kind == AppKind::Web
    }

    pub fn environment(&self, name: &str) -> Result<&EnvironmentSpec, ConfigError> {
        self.environments
            .get(name)
            .ok_or_else(|| ConfigError::UnknownEnvironment {
                app: self.name.clone(),
                environment: name.to_string(),
            })
    }
}

/// One application bound to the environment being deployed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployTarget {
    pub app: ApplicationDescriptor,
    pub environment: String,
    pub spec: EnvironmentSpec,
}

/// Bind every application to `environment`. Fails if any application does
/// not declare it, so a run never starts with a partial plan.
pub fn select_environment(
    apps: Vec<ApplicationDescriptor>,
    environment: &str,
) -> Result<Vec<DeployTarget>, ConfigError> {
    validate_name("environment", environment)?;
    apps.into_iter()
        .map(|app| {
            let spec = app.environment(environment)?.clone();
            Ok(DeployTarget {
                app,
                environment: environment.to_string(),
                spec,
            })
        })
        .collect()
}

/// Names become directories, unit names and load-balancer identifiers.
pub fn validate_name(what: &'static str, name: &str) -> Result<(), ConfigError> {
    let mut chars = name.chars();
    let valid = chars.next().is_some_and(|c| c.is_ascii_alphanumeric())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidName {
            what,
            name: name.to_string(),
        })
    }
}

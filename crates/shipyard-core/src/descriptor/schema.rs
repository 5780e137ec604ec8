//! On-disk shape of `deploy.toml` / `deploy.json`.
//!
//! Every field is optional here so that a missing field surfaces as a
//! [`ConfigError::MissingField`](crate::error::ConfigError::MissingField)
//! naming the application, instead of a bare deserializer message.

use std::collections::BTreeMap;

use serde::Deserialize;

/// Top level: application name to its block.
pub type RawDescriptor = BTreeMap<String, RawApplication>;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawApplication {
    #[serde(default)]
    pub folder: Option<String>,

    #[serde(default)]
    pub build: Option<String>,

    #[serde(default, rename = "type")]
    pub kind: Option<String>,

    /// Every other key. Tables are environment blocks, anything else is a
    /// misspelled field.
    #[serde(flatten)]
    pub environments: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawEnvironment {
    #[serde(default)]
    pub servers: Option<Vec<String>>,

    #[serde(default)]
    pub proxies: Option<Vec<String>>,

    #[serde(default)]
    pub domains: Option<Vec<String>>,
}

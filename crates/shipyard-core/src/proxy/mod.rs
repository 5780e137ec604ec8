//! Proxy membership: the shared routing document and its rendering.
//!
//! Every proxy node holds a [`ProxyConfig`] document listing, per
//! application, the domains routed to it and its live backends. The
//! load-balancer configuration is regenerated from that document on every
//! write and is never edited on its own.

pub mod render;
pub mod store;

use std::collections::BTreeSet;

use serde::{Deserialize, Deserializer, Serialize};
use tracing::warn;

pub use render::{RenderOptions, render};
pub use store::ProxyConfigStore;

/// One backend endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProxyServer {
    pub host: String,
    pub port: u16,
}

impl ProxyServer {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProxyApplication {
    pub name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub domains: BTreeSet<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub servers: Vec<ProxyServer>,
}

impl ProxyApplication {
    pub fn new<I, S>(name: impl Into<String>, domains: I, servers: Vec<ProxyServer>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            domains: domains.into_iter().map(Into::into).collect(),
            servers,
        }
    }
}

/// The routing document. Field names match the documents already present
/// on existing proxy nodes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProxyConfig {
    #[serde(default, deserialize_with = "null_as_default")]
    pub applications: Vec<ProxyApplication>,
}

impl ProxyConfig {
    /// Parse a stored document. Blank or unparseable documents yield an
    /// empty config: a node that has never been configured is valid.
    pub fn from_document(text: &str) -> Self {
        if text.trim().is_empty() {
            return Self::default();
        }
        match serde_json::from_str(text) {
            Ok(cfg) => cfg,
            Err(err) => {
                warn!(error = %err, "unparseable proxy config, starting from an empty one");
                Self::default()
            }
        }
    }

    /// Canonical serialization: pretty JSON with a trailing newline.
    pub fn to_document(&self) -> Result<String, serde_json::Error> {
        let mut text = serde_json::to_string_pretty(self)?;
        text.push('\n');
        Ok(text)
    }

    pub fn find(&self, name: &str) -> Option<&ProxyApplication> {
        self.applications.iter().find(|app| app.name == name)
    }

    /// Clear the backends of every entry named `name`, keeping its domains.
    /// Returns whether any entry matched.
    pub fn withdraw(&mut self, name: &str) -> bool {
        let mut matched = false;
        for app in self.applications.iter_mut().filter(|app| app.name == name) {
            app.servers.clear();
            matched = true;
        }
        matched
    }

    /// Replace any entry with the same name by `app`, appended last.
    pub fn upsert(&mut self, app: ProxyApplication) {
        self.applications.retain(|existing| existing.name != app.name);
        self.applications.push(app);
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api(servers: Vec<ProxyServer>) -> ProxyApplication {
        ProxyApplication::new("api", ["api.example.com"], servers)
    }

    #[test]
    fn upsert_twice_keeps_one_entry() {
        let mut cfg = ProxyConfig::default();
        let app = api(vec![ProxyServer::new("10.0.0.1", 9001)]);

        cfg.upsert(app.clone());
        cfg.upsert(app.clone());

        assert_eq!(cfg.applications, vec![app]);
    }

    #[test]
    fn upsert_moves_replaced_entry_last() {
        let mut cfg = ProxyConfig::default();
        cfg.upsert(api(vec![]));
        cfg.upsert(ProxyApplication::new("www", ["example.com"], vec![]));
        cfg.upsert(api(vec![ProxyServer::new("10.0.0.2", 9000)]));

        let names: Vec<_> = cfg.applications.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, ["www", "api"]);
    }

    #[test]
    fn withdraw_keeps_domains() {
        let mut cfg = ProxyConfig::default();
        cfg.upsert(api(vec![ProxyServer::new("10.0.0.1", 9001)]));

        assert!(cfg.withdraw("api"));
        assert!(!cfg.withdraw("missing"));

        let app = cfg.find("api").unwrap();
        assert!(app.servers.is_empty());
        assert!(app.domains.contains("api.example.com"));
    }

    #[test]
    fn withdraw_then_upsert_leaves_no_residual_servers() {
        let mut cfg = ProxyConfig::default();
        cfg.upsert(api(vec![
            ProxyServer::new("10.0.0.1", 9001),
            ProxyServer::new("10.0.0.2", 9001),
        ]));

        cfg.withdraw("api");
        cfg.upsert(api(vec![ProxyServer::new("10.0.0.3", 9004)]));

        let app = cfg.find("api").unwrap();
        assert_eq!(app.servers, vec![ProxyServer::new("10.0.0.3", 9004)]);
        assert_eq!(app.domains.len(), 1);
    }

    #[test]
    fn reads_documents_with_null_lists() {
        let cfg = ProxyConfig::from_document(
            r#"{"Applications":[{"Name":"api","Domains":null,"Servers":null}]}"#,
        );
        assert_eq!(cfg.applications.len(), 1);
        assert!(cfg.applications[0].domains.is_empty());
        assert!(cfg.applications[0].servers.is_empty());
    }

    #[test]
    fn garbage_document_is_empty_config() {
        assert_eq!(ProxyConfig::from_document("{not json"), ProxyConfig::default());
        assert_eq!(ProxyConfig::from_document("  \n"), ProxyConfig::default());
    }

    #[test]
    fn canonical_document_is_stable() {
        let mut cfg = ProxyConfig::default();
        cfg.upsert(ProxyApplication::new(
            "api",
            ["b.example.com", "a.example.com"],
            vec![ProxyServer::new("10.0.0.1", 9001)],
        ));

        let text = cfg.to_document().unwrap();
        let reparsed = ProxyConfig::from_document(&text);
        assert_eq!(reparsed, cfg);
        assert_eq!(reparsed.to_document().unwrap(), text);
        assert!(text.find("a.example.com").unwrap() < text.find("b.example.com").unwrap());
    }
}

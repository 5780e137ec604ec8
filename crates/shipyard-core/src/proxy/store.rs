//! Load, mutate and save the routing document on a proxy node.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use super::{ProxyApplication, ProxyConfig, RenderOptions, render};
use crate::command::{REPLACED, RemoteCommand, ServiceAction};
use crate::error::ProxyStoreError;
use crate::settings::{Consistency, ProxySettings};
use crate::transport::{Connection, stage_text};

/// Reads and rewrites [`ProxyConfig`] documents on proxy hosts.
///
/// The store never caches a document: every mutation re-reads it first.
/// Mutations against the same host are serialized through a per-host lock;
/// different hosts never wait on each other.
#[derive(Debug)]
pub struct ProxyConfigStore {
    settings: ProxySettings,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ProxyConfigStore {
    pub fn new(settings: ProxySettings) -> Self {
        Self {
            settings,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn render_options(&self) -> RenderOptions {
        RenderOptions {
            bind: self.settings.bind.clone(),
        }
    }

    /// Fetch the current document. Absent, blank or unparseable documents
    /// yield an empty config; only a failure to talk to the host is an error.
    pub async fn load(&self, conn: &dyn Connection) -> Result<ProxyConfig, ProxyStoreError> {
        let text = self.read_document(conn).await?;
        Ok(ProxyConfig::from_document(&text))
    }

    /// Write the document, write its rendering, then reload the load
    /// balancer. A failed reload leaves both files updated and is reported
    /// as [`ProxyStoreError::Reload`].
    pub async fn save(&self, conn: &dyn Connection, cfg: &ProxyConfig) -> Result<(), ProxyStoreError> {
        let document = cfg.to_document()?;
        let staged = stage_text(&document)?;
        conn.send_file(staged.path(), &self.settings.document_path)
            .await?;
        // Only now: the rendering never describes a document not on disk.
        self.publish(conn, cfg).await
    }

    /// Write the rendering of a document already on disk and reload.
    async fn publish(&self, conn: &dyn Connection, cfg: &ProxyConfig) -> Result<(), ProxyStoreError> {
        let rendered = render(cfg, &self.render_options());
        let staged = stage_text(&rendered)?;
        conn.send_file(staged.path(), &self.settings.rendered_path)
            .await?;

        conn.execute(&RemoteCommand::service(
            ServiceAction::Reload,
            self.settings.service.as_str(),
        ))
        .await
        .map_err(ProxyStoreError::Reload)?;

        debug!(
            host = conn.host(),
            applications = cfg.applications.len(),
            "proxy config saved"
        );
        Ok(())
    }

    /// Withdraw every route to `name` while keeping its domain bindings.
    pub async fn remove_application(
        &self,
        conn: &dyn Connection,
        name: &str,
    ) -> Result<(), ProxyStoreError> {
        info!(host = conn.host(), app = name, "withdrawing routes");
        self.update(conn, |cfg| {
            if !cfg.withdraw(name) {
                debug!(app = name, "application not present in proxy config");
            }
        })
        .await
    }

    /// Replace the entry for `app.name` with `app`.
    pub async fn upsert_application(
        &self,
        conn: &dyn Connection,
        app: &ProxyApplication,
    ) -> Result<(), ProxyStoreError> {
        info!(
            host = conn.host(),
            app = %app.name,
            backends = app.servers.len(),
            "publishing routes"
        );
        self.update(conn, |cfg| cfg.upsert(app.clone())).await
    }

    async fn update<F>(&self, conn: &dyn Connection, mutate: F) -> Result<(), ProxyStoreError>
    where
        F: Fn(&mut ProxyConfig) + Send + Sync,
    {
        let lock = self.host_lock(conn.host());
        let _guard = lock.lock().await;

        match self.settings.consistency {
            Consistency::LastWriteWins => {
                let mut cfg = self.load(conn).await?;
                mutate(&mut cfg);
                self.save(conn, &cfg).await
            }
            Consistency::CheckRevision => {
                let attempts = self.settings.max_conflict_retries + 1;
                for attempt in 1..=attempts {
                    let base = self.read_document(conn).await?;
                    let mut cfg = ProxyConfig::from_document(&base);
                    mutate(&mut cfg);

                    if self.replace_if_unchanged(conn, &base, &cfg).await? {
                        return self.publish(conn, &cfg).await;
                    }
                    warn!(
                        host = conn.host(),
                        attempt, "proxy config changed while updating, retrying"
                    );
                }
                Err(ProxyStoreError::Conflict { attempts })
            }
        }
    }

    /// Upload `cfg` next to the live document and swap it in only if the
    /// live document still reads as `base`. The comparison and the move run
    /// in one remote command under `flock`.
    async fn replace_if_unchanged(
        &self,
        conn: &dyn Connection,
        base: &str,
        cfg: &ProxyConfig,
    ) -> Result<bool, ProxyStoreError> {
        let path = &self.settings.document_path;
        let base_path = format!("{}.{}.base", path, std::process::id());
        let next_path = format!("{}.{}.next", path, std::process::id());

        let staged = stage_text(base)?;
        conn.send_file(staged.path(), &base_path).await?;
        let staged = stage_text(&cfg.to_document()?)?;
        conn.send_file(staged.path(), &next_path).await?;

        let output = conn
            .execute(&RemoteCommand::ReplaceIfUnchanged {
                path: path.clone(),
                base: base_path,
                next: next_path,
            })
            .await?;
        Ok(output.trim() == REPLACED)
    }

    async fn read_document(&self, conn: &dyn Connection) -> Result<String, ProxyStoreError> {
        let text = conn
            .execute(&RemoteCommand::ReadFile {
                path: self.settings.document_path.clone(),
            })
            .await?;
        Ok(text)
    }

    fn host_lock(&self, host: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(host.to_string()).or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandKind;
    use crate::proxy::ProxyServer;
    use crate::transport::{MemoryHost, MemoryTransport, Transport};

    const DOC: &str = "/etc/haproxy/config.json";
    const CFG: &str = "/etc/haproxy/haproxy.cfg";

    async fn proxy_host() -> (MemoryTransport, Arc<dyn Connection>) {
        let transport = MemoryTransport::new();
        transport.add_host("lb-1", MemoryHost::with_address("10.0.0.100"));
        let conn = transport.connect("lb-1").await.unwrap();
        (transport, conn)
    }

    fn api(servers: Vec<ProxyServer>) -> ProxyApplication {
        ProxyApplication::new("api", ["api.example.com"], servers)
    }

    #[tokio::test]
    async fn missing_document_loads_as_empty() {
        let (_transport, conn) = proxy_host().await;
        let store = ProxyConfigStore::new(ProxySettings::default());
        assert_eq!(store.load(conn.as_ref()).await.unwrap(), ProxyConfig::default());
    }

    #[tokio::test]
    async fn save_of_load_keeps_the_document() {
        let (transport, conn) = proxy_host().await;
        let store = ProxyConfigStore::new(ProxySettings::default());
        store
            .upsert_application(conn.as_ref(), &api(vec![ProxyServer::new("10.0.0.1", 9001)]))
            .await
            .unwrap();
        let before = transport.host("lb-1").file(DOC).unwrap().to_string();

        let cfg = store.load(conn.as_ref()).await.unwrap();
        store.save(conn.as_ref(), &cfg).await.unwrap();

        assert_eq!(transport.host("lb-1").file(DOC).unwrap(), before);
    }

    #[tokio::test]
    async fn upsert_writes_document_rendering_and_reloads() {
        let (transport, conn) = proxy_host().await;
        let store = ProxyConfigStore::new(ProxySettings::default());
        let app = api(vec![ProxyServer::new("10.0.0.1", 9001)]);

        store.upsert_application(conn.as_ref(), &app).await.unwrap();
        store.upsert_application(conn.as_ref(), &app).await.unwrap();

        let host = transport.host("lb-1");
        let cfg = ProxyConfig::from_document(host.file(DOC).unwrap());
        assert_eq!(cfg.applications, vec![app]);

        let rendered = host.file(CFG).unwrap();
        assert!(rendered.contains("acl host_api hdr(host) -i api.example.com"));
        assert!(rendered.contains("server api-1 10.0.0.1:9001 check"));

        let tail: Vec<_> = host.history.iter().rev().take(3).rev().cloned().collect();
        assert_eq!(
            tail,
            vec![
                format!("send {DOC}"),
                format!("send {CFG}"),
                "systemctl reload haproxy".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn remove_then_upsert_replaces_servers() {
        let (transport, conn) = proxy_host().await;
        let store = ProxyConfigStore::new(ProxySettings::default());
        store
            .upsert_application(
                conn.as_ref(),
                &api(vec![
                    ProxyServer::new("10.0.0.1", 9001),
                    ProxyServer::new("10.0.0.2", 9001),
                ]),
            )
            .await
            .unwrap();

        store.remove_application(conn.as_ref(), "api").await.unwrap();
        let withdrawn = store.load(conn.as_ref()).await.unwrap();
        let entry = withdrawn.find("api").unwrap();
        assert!(entry.servers.is_empty());
        assert!(entry.domains.contains("api.example.com"));
        assert!(!transport.host("lb-1").file(CFG).unwrap().contains("10.0.0.1"));

        store
            .upsert_application(conn.as_ref(), &api(vec![ProxyServer::new("10.0.0.3", 9004)]))
            .await
            .unwrap();
        let cfg = store.load(conn.as_ref()).await.unwrap();
        assert_eq!(
            cfg.find("api").unwrap().servers,
            vec![ProxyServer::new("10.0.0.3", 9004)]
        );
    }

    #[tokio::test]
    async fn removing_unknown_application_still_saves() {
        let (transport, conn) = proxy_host().await;
        let store = ProxyConfigStore::new(ProxySettings::default());
        store.remove_application(conn.as_ref(), "ghost").await.unwrap();

        let host = transport.host("lb-1");
        assert_eq!(ProxyConfig::from_document(host.file(DOC).unwrap()), ProxyConfig::default());
    }

    #[tokio::test]
    async fn failed_reload_leaves_files_written() {
        let (transport, conn) = proxy_host().await;
        transport.fail_command("lb-1", CommandKind::Service(ServiceAction::Reload));
        let store = ProxyConfigStore::new(ProxySettings::default());

        let err = store
            .upsert_application(conn.as_ref(), &api(vec![ProxyServer::new("10.0.0.1", 9001)]))
            .await
            .unwrap_err();

        assert!(matches!(err, ProxyStoreError::Reload(_)));
        let host = transport.host("lb-1");
        assert!(host.file(DOC).unwrap().contains("10.0.0.1"));
        assert!(host.file(CFG).unwrap().contains("10.0.0.1"));
    }

    #[tokio::test]
    async fn failed_document_write_skips_rendering() {
        let (transport, conn) = proxy_host().await;
        transport.fail_transfers("lb-1");
        let store = ProxyConfigStore::new(ProxySettings::default());

        let err = store.remove_application(conn.as_ref(), "api").await.unwrap_err();

        assert!(matches!(err, ProxyStoreError::Transport(_)));
        let host = transport.host("lb-1");
        assert!(host.file(DOC).is_none());
        assert!(host.file(CFG).is_none());
        assert!(!host.history.iter().any(|line| line.starts_with("systemctl reload")));
    }

    #[tokio::test]
    async fn unreadable_document_is_an_error_not_an_empty_config() {
        let (transport, conn) = proxy_host().await;
        transport.fail_command("lb-1", CommandKind::ReadFile);
        let store = ProxyConfigStore::new(ProxySettings::default());

        let err = store.remove_application(conn.as_ref(), "api").await.unwrap_err();

        assert!(matches!(err, ProxyStoreError::Transport(_)));
        assert!(transport.host("lb-1").file(DOC).is_none());
    }

    fn check_revision() -> ProxySettings {
        ProxySettings {
            consistency: Consistency::CheckRevision,
            max_conflict_retries: 2,
            ..ProxySettings::default()
        }
    }

    #[tokio::test]
    async fn check_revision_retries_after_a_concurrent_write() {
        let (transport, conn) = proxy_host().await;
        let other = ProxyConfig {
            applications: vec![ProxyApplication::new(
                "www",
                ["example.com"],
                vec![ProxyServer::new("10.0.0.9", 9000)],
            )],
        };
        transport.interfere("lb-1", DOC, &[other.to_document().unwrap().as_str()]);
        let store = ProxyConfigStore::new(check_revision());

        store
            .upsert_application(conn.as_ref(), &api(vec![ProxyServer::new("10.0.0.1", 9001)]))
            .await
            .unwrap();

        let cfg = store.load(conn.as_ref()).await.unwrap();
        let names: Vec<_> = cfg.applications.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, ["www", "api"]);
        let replaces: Vec<_> = transport
            .host("lb-1")
            .history
            .iter()
            .filter(|line| line.starts_with("flock "))
            .cloned()
            .collect();
        assert_eq!(replaces.len(), 2);
    }

    #[tokio::test]
    async fn check_revision_gives_up_after_repeated_conflicts() {
        let (transport, conn) = proxy_host().await;
        // Every read is followed by a different write.
        let versions: Vec<String> = (0..20).map(|i| format!("{{}}{}", " ".repeat(i))).collect();
        let versions: Vec<&str> = versions.iter().map(String::as_str).collect();
        transport.interfere("lb-1", DOC, &versions);
        let store = ProxyConfigStore::new(check_revision());

        let err = store.remove_application(conn.as_ref(), "api").await.unwrap_err();

        assert!(matches!(err, ProxyStoreError::Conflict { attempts: 3 }));
        let host = transport.host("lb-1");
        // The last concurrent version stays, nothing was rendered or reloaded.
        assert_eq!(host.file(DOC), Some(versions[2]));
        assert!(host.file(CFG).is_none());
        assert!(!host.history.iter().any(|line| line.starts_with("systemctl reload")));
        assert_eq!(host.tree("/etc/haproxy"), ["config.json"]);
    }

    #[tokio::test]
    async fn check_revision_creates_a_missing_document() {
        let (transport, conn) = proxy_host().await;
        let store = ProxyConfigStore::new(check_revision());

        store
            .upsert_application(conn.as_ref(), &api(vec![ProxyServer::new("10.0.0.1", 9001)]))
            .await
            .unwrap();

        let host = transport.host("lb-1");
        assert!(host.file(DOC).unwrap().contains("10.0.0.1"));
        assert!(host.file(CFG).unwrap().contains("10.0.0.1:9001"));
        assert_eq!(host.tree("/etc/haproxy"), ["config.json", "haproxy.cfg"]);
        assert!(host.history.last().unwrap().starts_with("systemctl reload"));
    }

    #[tokio::test]
    async fn last_write_wins_ignores_concurrent_writes() {
        let (transport, conn) = proxy_host().await;
        transport.interfere("lb-1", DOC, &["{}", "{ }"]);
        let store = ProxyConfigStore::new(ProxySettings::default());

        store
            .upsert_application(conn.as_ref(), &api(vec![ProxyServer::new("10.0.0.1", 9001)]))
            .await
            .unwrap();

        let cfg = store.load(conn.as_ref()).await.unwrap();
        assert_eq!(cfg.applications.len(), 1);
    }
}

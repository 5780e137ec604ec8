//! In-process transport for tests.
//!
//! Hosts are plain data: a flat map of file paths to contents, a set of
//! listening ports, interface addresses and service states. Typed commands
//! are interpreted against that data, so a test can run a whole deployment
//! and then inspect exactly what each host ended up with.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use super::{Connection, Transport};
use crate::command::{CONFLICT, CommandKind, REPLACED, RemoteCommand, ServiceAction};
use crate::error::TransportError;

/// Simulated state of one unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceState {
    pub enabled: bool,
    pub running: bool,
    /// Port the running process holds, read from its unit file.
    pub port: Option<u16>,
}

/// A simulated host.
#[derive(Debug, Clone, Default)]
pub struct MemoryHost {
    pub files: BTreeMap<String, String>,
    pub dirs: BTreeSet<String>,
    pub listening: BTreeSet<u16>,
    /// IPv4 addresses reported by `ip addr`, loopback excluded.
    pub addresses: Vec<String>,
    pub services: BTreeMap<String, ServiceState>,
    /// Every operation performed, in order, as shell lines or
    /// `send <path>` / `sync <path>` markers.
    pub history: Vec<String>,
}

impl MemoryHost {
    pub fn with_address(address: &str) -> Self {
        Self {
            addresses: vec![address.to_string()],
            ..Self::default()
        }
    }

    pub fn with_listening(mut self, ports: &[u16]) -> Self {
        self.listening.extend(ports.iter().copied());
        self
    }

    pub fn file(&self, path: &str) -> Option<&str> {
        self.files.get(path).map(String::as_str)
    }

    /// Relative paths of every file under `dir`.
    pub fn tree(&self, dir: &str) -> Vec<String> {
        let prefix = format!("{}/", dir.trim_end_matches('/'));
        self.files
            .keys()
            .filter_map(|path| path.strip_prefix(&prefix))
            .map(str::to_string)
            .collect()
    }

    fn clear_dir(&mut self, dir: &str) {
        let prefix = format!("{}/", dir.trim_end_matches('/'));
        self.files.retain(|path, _| !path.starts_with(&prefix));
    }

    fn unit_port(&self, unit: &str) -> Option<u16> {
        let suffix = format!("/{}", unit);
        self.files
            .iter()
            .find(|(path, _)| path.ends_with(&suffix))
            .and_then(|(_, content)| {
                content
                    .lines()
                    .find_map(|line| line.strip_prefix("Environment=PORT="))
                    .and_then(|port| port.trim().parse().ok())
            })
    }

    fn listen_table(&self) -> String {
        self.listening
            .iter()
            .map(|port| format!("LISTEN 0      4096         0.0.0.0:{port}        0.0.0.0:*\n"))
            .collect()
    }

    fn interface_table(&self) -> String {
        let mut out = String::from(
            "1: lo: <LOOPBACK,UP,LOWER_UP> mtu 65536\n    inet 127.0.0.1/8 scope host lo\n",
        );
        for (i, address) in self.addresses.iter().enumerate() {
            out.push_str(&format!(
                "{}: eth{}: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500\n    inet {}/24 brd 0.0.0.0 scope global eth{}\n",
                i + 2,
                i,
                address,
                i
            ));
        }
        out
    }

    fn apply(&mut self, host: &str, command: &RemoteCommand) -> Result<String, TransportError> {
        let line = command.to_shell();
        let fail = |message: &str| Err(TransportError::new(host, line.clone(), message));
        match command {
            RemoteCommand::Service { action, unit } => {
                let port = self.unit_port(unit);
                let state = self.services.entry(unit.clone()).or_default();
                match action {
                    ServiceAction::Stop => {
                        if !state.running {
                            return fail("Unit not loaded.");
                        }
                        state.running = false;
                        if let Some(port) = state.port.take() {
                            self.listening.remove(&port);
                        }
                    }
                    ServiceAction::Start => {
                        if port.is_none() {
                            return fail("Unit not found.");
                        }
                        state.running = true;
                        state.port = port;
                        if let Some(port) = port {
                            self.listening.insert(port);
                        }
                    }
                    ServiceAction::Enable => state.enabled = true,
                    ServiceAction::Reload => {}
                }
                Ok(String::new())
            }
            RemoteCommand::DaemonReload | RemoteCommand::Provision { .. } => Ok(String::new()),
            RemoteCommand::EnsureDirs { paths } => {
                self.dirs.extend(paths.iter().cloned());
                Ok(String::new())
            }
            RemoteCommand::ClearDir { path } => {
                self.clear_dir(path);
                Ok(String::new())
            }
            RemoteCommand::CopyTree { from, to } => {
                let to = to.trim_end_matches('/');
                let copied: Vec<(String, String)> = self
                    .tree(from)
                    .into_iter()
                    .map(|rel| {
                        let content = self.files[&format!("{}/{}", from.trim_end_matches('/'), rel)].clone();
                        (format!("{}/{}", to, rel), content)
                    })
                    .collect();
                self.files.extend(copied);
                Ok(String::new())
            }
            RemoteCommand::PruneFiles { root, pattern } => {
                let prefix = format!("{}/", root.trim_end_matches('/'));
                let suffix = pattern.trim_start_matches('*');
                self.files
                    .retain(|path, _| !(path.starts_with(&prefix) && path.ends_with(suffix)));
                Ok(String::new())
            }
            RemoteCommand::ListeningPorts => Ok(self.listen_table()),
            RemoteCommand::InterfaceAddresses => Ok(self.interface_table()),
            RemoteCommand::ReadFile { path } => {
                Ok(self.files.get(path).cloned().unwrap_or_default())
            }
            RemoteCommand::GoBuild { output, .. } => {
                self.files.insert(output.clone(), "\u{7f}ELF".to_string());
                Ok(String::new())
            }
            RemoteCommand::ReplaceIfUnchanged { path, base, next } => {
                let live = self.files.get(path).cloned().unwrap_or_default();
                let expected = self.files.remove(base).unwrap_or_default();
                let Some(contents) = self.files.remove(next) else {
                    return fail("mv: cannot stat: No such file or directory");
                };
                if live == expected {
                    self.files.insert(path.clone(), contents);
                    Ok(format!("{REPLACED}\n"))
                } else {
                    Ok(format!("{CONFLICT}\n"))
                }
            }
        }
    }
}

#[derive(Debug, Default)]
struct State {
    hosts: BTreeMap<String, MemoryHost>,
    failing_commands: HashSet<(String, CommandKind)>,
    panicking_commands: HashSet<(String, CommandKind)>,
    failing_transfers: HashSet<String>,
    /// (host, path) -> contents written after each read, oldest first.
    interference: BTreeMap<(String, String), VecDeque<String>>,
    opened: usize,
    closed: usize,
}

/// Shared handle to a set of simulated hosts.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    state: Arc<Mutex<State>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panicking test thread must not hide the state from the others.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_host(&self, name: &str, host: MemoryHost) {
        self.lock().hosts.insert(name.to_string(), host);
    }

    /// Write a file on an existing host, as another tool would.
    pub fn add_file(&self, host: &str, path: &str, contents: &str) {
        if let Some(host) = self.lock().hosts.get_mut(host) {
            host.files.insert(path.to_string(), contents.to_string());
        }
    }

    /// Snapshot of a host. Panics if the host was never added.
    pub fn host(&self, name: &str) -> MemoryHost {
        self.lock()
            .hosts
            .get(name)
            .cloned()
            .unwrap_or_else(|| panic!("unknown memory host {name}"))
    }

    /// Make every command of `kind` on `host` fail.
    pub fn fail_command(&self, host: &str, kind: CommandKind) {
        self.lock()
            .failing_commands
            .insert((host.to_string(), kind));
    }

    /// Make every command of `kind` on `host` panic, as a bug in the task
    /// driving that host would.
    pub fn panic_on(&self, host: &str, kind: CommandKind) {
        self.lock()
            .panicking_commands
            .insert((host.to_string(), kind));
    }

    /// Make file transfers and directory syncs to `host` fail.
    pub fn fail_transfers(&self, host: &str) {
        self.lock().failing_transfers.insert(host.to_string());
    }

    /// Simulate a concurrent writer: after each read of `path` on `host`,
    /// the file is replaced by the next entry of `versions` until they run out.
    pub fn interfere(&self, host: &str, path: &str, versions: &[&str]) {
        self.lock()
            .interference
            .entry((host.to_string(), path.to_string()))
            .or_default()
            .extend(versions.iter().map(|v| v.to_string()));
    }

    pub fn connections_opened(&self) -> usize {
        self.lock().opened
    }

    pub fn connections_closed(&self) -> usize {
        self.lock().closed
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, host: &str) -> Result<Arc<dyn Connection>, TransportError> {
        let mut state = self.lock();
        if !state.hosts.contains_key(host) {
            return Err(TransportError::new(
                host,
                "connect",
                "Could not resolve hostname",
            ));
        }
        state.opened += 1;
        Ok(Arc::new(MemoryConnection {
            host: host.to_string(),
            transport: self.clone(),
        }))
    }
}

struct MemoryConnection {
    host: String,
    transport: MemoryTransport,
}

impl MemoryConnection {
    fn run(&self, command: &RemoteCommand) -> Result<String, TransportError> {
        let line = command.to_shell();
        let key = (self.host.clone(), command.kind());
        let mut guard = self.transport.lock();
        if guard.panicking_commands.contains(&key) {
            drop(guard);
            panic!("{}: `{}` panicked", self.host, line);
        }
        let state = &mut *guard;
        let failing = state.failing_commands.contains(&key);
        let host = state
            .hosts
            .get_mut(&self.host)
            .ok_or_else(|| TransportError::new(&self.host, &line, "host vanished"))?;
        host.history.push(line.clone());
        if failing {
            return Err(TransportError::new(&self.host, &line, "exit status 1"));
        }
        let output = host.apply(&self.host, command)?;

        if let RemoteCommand::ReadFile { path } = command {
            let key = (self.host.clone(), path.clone());
            let next = state
                .interference
                .get_mut(&key)
                .and_then(VecDeque::pop_front);
            if let Some(contents) = next {
                if let Some(host) = state.hosts.get_mut(&self.host) {
                    host.files.insert(path.clone(), contents);
                }
            }
        }
        Ok(output)
    }

    fn with_host<T>(
        &self,
        f: impl FnOnce(&mut MemoryHost) -> Result<T, TransportError>,
    ) -> Result<T, TransportError> {
        let mut state = self.transport.lock();
        let host = state
            .hosts
            .get_mut(&self.host)
            .ok_or_else(|| TransportError::new(&self.host, "exec", "host vanished"))?;
        f(host)
    }

    fn check_transfer(&self, operation: &str) -> Result<(), TransportError> {
        if self.transport.lock().failing_transfers.contains(&self.host) {
            return Err(TransportError::new(
                &self.host,
                operation,
                "Connection reset by peer",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn host(&self) -> &str {
        &self.host
    }

    async fn execute(&self, command: &RemoteCommand) -> Result<String, TransportError> {
        let result = self.run(command);
        // Every command is a suspension point, as a network round trip is,
        // so concurrent tasks on one host interleave between commands.
        tokio::task::yield_now().await;
        result
    }

    async fn send_file(&self, local: &Path, remote: &str) -> Result<(), TransportError> {
        let operation = format!("send {}", remote);
        self.check_transfer(&operation)?;
        let contents = std::fs::read_to_string(local)
            .map_err(|e| TransportError::new(&self.host, &operation, e.to_string()))?;
        self.with_host(|host| {
            host.history.push(operation.clone());
            host.files.insert(remote.to_string(), contents);
            Ok(())
        })
    }

    async fn sync_directory(&self, local: &Path, remote: &str) -> Result<(), TransportError> {
        let operation = format!("sync {}", remote);
        self.check_transfer(&operation)?;
        let mut files = Vec::new();
        collect_files(local, "", &mut files)
            .map_err(|e| TransportError::new(&self.host, &operation, e.to_string()))?;
        let remote = remote.trim_end_matches('/').to_string();
        self.with_host(|host| {
            host.history.push(operation.clone());
            host.clear_dir(&remote);
            for (rel, content) in files {
                host.files.insert(format!("{}/{}", remote, rel), content);
            }
            Ok(())
        })
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.transport.lock().closed += 1;
        Ok(())
    }
}

fn collect_files(
    dir: &Path,
    base: &str,
    out: &mut Vec<(String, String)>,
) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        let rel = if base.is_empty() {
            name
        } else {
            format!("{}/{}", base, name)
        };
        if entry.file_type()?.is_dir() {
            collect_files(&entry.path(), &rel, out)?;
        } else {
            let bytes = std::fs::read(entry.path())?;
            out.push((rel, String::from_utf8_lossy(&bytes).to_string()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn services_bind_the_port_from_their_unit_file() {
        let transport = MemoryTransport::new();
        transport.add_host("web-1", MemoryHost::with_address("10.0.0.1"));
        let conn = transport.connect("web-1").await.unwrap();

        let unit = crate::transport::stage_text("[Service]\nEnvironment=PORT=9000\n").unwrap();
        conn.send_file(unit.path(), "/etc/systemd/system/api.service")
            .await
            .unwrap();
        conn.execute(&RemoteCommand::service(ServiceAction::Start, "api.service"))
            .await
            .unwrap();
        assert!(transport.host("web-1").listening.contains(&9000));

        conn.execute(&RemoteCommand::service(ServiceAction::Stop, "api.service"))
            .await
            .unwrap();
        assert!(transport.host("web-1").listening.is_empty());
    }

    #[tokio::test]
    async fn conditional_replace_only_over_the_expected_contents() {
        let transport = MemoryTransport::new();
        let mut host = MemoryHost::default();
        host.files.insert("/doc".to_string(), "v1".to_string());
        transport.add_host("lb", host);
        let conn = transport.connect("lb").await.unwrap();
        let stage = |base: &str, next: &str| {
            transport.add_file("lb", "/doc.base", base);
            transport.add_file("lb", "/doc.next", next);
        };
        let replace = RemoteCommand::ReplaceIfUnchanged {
            path: "/doc".to_string(),
            base: "/doc.base".to_string(),
            next: "/doc.next".to_string(),
        };

        stage("v0", "v2");
        assert_eq!(conn.execute(&replace).await.unwrap().trim(), CONFLICT);
        assert_eq!(transport.host("lb").file("/doc"), Some("v1"));

        stage("v1", "v2");
        assert_eq!(conn.execute(&replace).await.unwrap().trim(), REPLACED);
        let host = transport.host("lb");
        assert_eq!(host.file("/doc"), Some("v2"));
        assert_eq!(host.tree("/"), ["doc"]);
    }

    #[tokio::test]
    async fn commands_yield_between_each_other() {
        let transport = MemoryTransport::new();
        transport.add_host("h", MemoryHost::default());
        let first = transport.connect("h").await.unwrap();
        let second = transport.connect("h").await.unwrap();
        let read = RemoteCommand::ReadFile {
            path: "/a".to_string(),
        };
        let clear = RemoteCommand::ClearDir {
            path: "/b".to_string(),
        };

        let run = |conn: Arc<dyn Connection>| {
            let (read, clear) = (read.clone(), clear.clone());
            async move {
                conn.execute(&read).await.unwrap();
                conn.execute(&clear).await.unwrap();
            }
        };
        tokio::join!(run(first), run(second));

        let history = transport.host("h").history;
        assert_eq!(history[0], history[1]);
        assert_eq!(history[2], history[3]);
        assert_ne!(history[0], history[2]);
    }

    #[tokio::test]
    async fn copy_tree_copies_contents_only() {
        let transport = MemoryTransport::new();
        let mut host = MemoryHost::default();
        host.files.insert("/opt/a/_staging/a".to_string(), "bin".to_string());
        host.files
            .insert("/opt/a/_staging/static/index.html".to_string(), "<p>".to_string());
        transport.add_host("h", host);
        let conn = transport.connect("h").await.unwrap();

        conn.execute(&RemoteCommand::CopyTree {
            from: "/opt/a/_staging".to_string(),
            to: "/opt/a/current".to_string(),
        })
        .await
        .unwrap();

        assert_eq!(
            transport.host("h").tree("/opt/a/current"),
            vec!["a".to_string(), "static/index.html".to_string()]
        );
    }
}

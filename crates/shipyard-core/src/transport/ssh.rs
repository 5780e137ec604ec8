//! OpenSSH-backed transport.
//!
//! A connection is an ssh control-master socket. Commands, scp transfers and
//! rsync mirrors all multiplex over that socket, so each host is
//! authenticated once per application.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::{Connection, Transport};
use crate::command::{RemoteCommand, quote};
use crate::error::TransportError;
use crate::settings::SshSettings;

static SOCKET_COUNTER: AtomicUsize = AtomicUsize::new(0);

#[derive(Debug, Clone)]
pub struct SshTransport {
    settings: SshSettings,
}

impl SshTransport {
    pub fn new(settings: SshSettings) -> Self {
        Self { settings }
    }

    fn control_dir(&self) -> PathBuf {
        self.settings
            .control_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn connect(&self, host: &str) -> Result<Arc<dyn Connection>, TransportError> {
        // Short names: unix socket paths are limited to ~100 bytes.
        let socket = self.control_dir().join(format!(
            "sy-{}-{}.sock",
            std::process::id(),
            SOCKET_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        let conn = SshConnection {
            host: host.to_string(),
            settings: self.settings.clone(),
            socket,
        };

        let mut args = vec![
            "-M".to_string(),
            "-S".to_string(),
            conn.socket_arg(),
            "-o".to_string(),
            "ControlPersist=yes".to_string(),
            "-fN".to_string(),
        ];
        args.extend(conn.common_args());
        args.push(conn.target());
        run("ssh", &args, host, "connect").await?;

        debug!(host, socket = %conn.socket.display(), "control master started");
        Ok(Arc::new(conn))
    }
}

#[derive(Debug)]
pub struct SshConnection {
    host: String,
    settings: SshSettings,
    socket: PathBuf,
}

impl SshConnection {
    fn target(&self) -> String {
        match &self.settings.user {
            Some(user) => format!("{}@{}", user, self.host),
            None => self.host.clone(),
        }
    }

    fn socket_arg(&self) -> String {
        self.socket.to_string_lossy().to_string()
    }

    /// Options shared by ssh invocations (not scp, which spells the port
    /// flag differently).
    fn common_args(&self) -> Vec<String> {
        let mut args = vec!["-o".to_string(), "BatchMode=yes".to_string()];
        if let Some(port) = self.settings.port {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        if let Some(identity) = &self.settings.identity_file {
            args.push("-i".to_string());
            args.push(identity.to_string_lossy().to_string());
        }
        args.extend(self.settings.extra_args.iter().cloned());
        args
    }

    /// Remote shell used by rsync, as one word.
    fn rsync_shell(&self) -> String {
        let mut words = vec!["ssh".to_string(), "-S".to_string(), self.socket_arg()];
        words.extend(self.common_args());
        words.iter().map(|w| quote(w)).collect::<Vec<_>>().join(" ")
    }
}

#[async_trait]
impl Connection for SshConnection {
    fn host(&self) -> &str {
        &self.host
    }

    async fn execute(&self, command: &RemoteCommand) -> Result<String, TransportError> {
        let line = command.to_shell();
        debug!(host = %self.host, command = %line, "exec");
        let mut args = vec!["-S".to_string(), self.socket_arg()];
        args.extend(self.common_args());
        args.push(self.target());
        args.push("--".to_string());
        args.push(line.clone());
        run("ssh", &args, &self.host, &line).await
    }

    async fn send_file(&self, local: &Path, remote: &str) -> Result<(), TransportError> {
        let mut args = vec![
            "-q".to_string(),
            "-o".to_string(),
            format!("ControlPath={}", self.socket_arg()),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
        ];
        if let Some(port) = self.settings.port {
            args.push("-P".to_string());
            args.push(port.to_string());
        }
        args.push(local.to_string_lossy().to_string());
        args.push(format!("{}:{}", self.target(), remote));
        run("scp", &args, &self.host, &format!("send {}", remote))
            .await
            .map(|_| ())
    }

    async fn sync_directory(&self, local: &Path, remote: &str) -> Result<(), TransportError> {
        let args = vec![
            "--archive".to_string(),
            "--compress".to_string(),
            "--delete".to_string(),
            "-e".to_string(),
            self.rsync_shell(),
            format!("{}/", local.to_string_lossy().trim_end_matches('/')),
            format!("{}:{}/", self.target(), remote.trim_end_matches('/')),
        ];
        run("rsync", &args, &self.host, &format!("sync {}", remote))
            .await
            .map(|_| ())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let args = vec![
            "-S".to_string(),
            self.socket_arg(),
            "-O".to_string(),
            "exit".to_string(),
            self.target(),
        ];
        run("ssh", &args, &self.host, "close").await.map(|_| ())
    }
}

/// Run a local program and map failures to a [`TransportError`] for `host`.
async fn run(
    program: &str,
    args: &[String],
    host: &str,
    operation: &str,
) -> Result<String, TransportError> {
    let output = Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| TransportError::new(host, operation, format!("failed to run {program}: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let detail = if stderr.trim().is_empty() {
            stdout.trim().to_string()
        } else {
            stderr.trim().to_string()
        };
        return Err(TransportError::new(
            host,
            operation,
            format!("{} ({})", output.status, detail),
        ));
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection(settings: SshSettings) -> SshConnection {
        SshConnection {
            host: "web-1".to_string(),
            settings,
            socket: PathBuf::from("/tmp/sy-1-0.sock"),
        }
    }

    #[test]
    fn target_includes_user_when_configured() {
        let conn = connection(SshSettings {
            user: Some("deploy".to_string()),
            ..SshSettings::default()
        });
        assert_eq!(conn.target(), "deploy@web-1");
        assert_eq!(connection(SshSettings::default()).target(), "web-1");
    }

    #[test]
    fn rsync_shell_reuses_control_socket() {
        let conn = connection(SshSettings {
            port: Some(2222),
            ..SshSettings::default()
        });
        assert_eq!(
            conn.rsync_shell(),
            "ssh -S /tmp/sy-1-0.sock -o BatchMode=yes -p 2222"
        );
    }
}

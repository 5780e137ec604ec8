//! Typed remote commands.
//!
//! Every shell line shipyard sends to a host is produced here, so quoting is
//! handled in one place instead of at each call site.

use std::fmt;

/// systemctl verbs used by the cutover engine and the proxy store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceAction {
    Stop,
    Start,
    Enable,
    Reload,
}

impl ServiceAction {
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceAction::Stop => "stop",
            ServiceAction::Start => "start",
            ServiceAction::Enable => "enable",
            ServiceAction::Reload => "reload",
        }
    }
}

/// Discriminant of a [`RemoteCommand`], handy for logging and matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Service(ServiceAction),
    DaemonReload,
    EnsureDirs,
    ClearDir,
    CopyTree,
    PruneFiles,
    ListeningPorts,
    InterfaceAddresses,
    ReadFile,
    GoBuild,
    Provision,
    ReplaceIfUnchanged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCommand {
    /// `systemctl <action> <unit>`
    Service { action: ServiceAction, unit: String },
    /// Make systemd pick up a rewritten unit file.
    DaemonReload,
    /// Create directories (and parents) writable by the service user.
    EnsureDirs { paths: Vec<String> },
    /// Delete everything inside `path`, keeping the directory itself.
    ClearDir { path: String },
    /// Copy the contents of `from` into `to`, hidden entries included.
    CopyTree { from: String, to: String },
    /// Delete regular files matching a glob anywhere under `root`.
    PruneFiles { root: String, pattern: String },
    /// Print the TCP listen table.
    ListeningPorts,
    /// Print IPv4 interface addresses.
    InterfaceAddresses,
    /// Print a file. A missing file prints nothing and is not an error.
    ReadFile { path: String },
    /// Compile the Go package in `dir` into `output`.
    GoBuild { dir: String, output: String },
    /// Create the base directory a fresh host needs.
    Provision { root: String },
    /// Holding `flock` on `<path>.lock`: when `path` (missing reads as
    /// empty) still has the contents of `base`, move `next` over it and
    /// print [`REPLACED`]; otherwise discard both and print [`CONFLICT`].
    ReplaceIfUnchanged {
        path: String,
        base: String,
        next: String,
    },
}

/// Output of [`RemoteCommand::ReplaceIfUnchanged`] when the file was replaced.
pub const REPLACED: &str = "replaced";
/// Output of [`RemoteCommand::ReplaceIfUnchanged`] when the file had changed.
pub const CONFLICT: &str = "conflict";

impl RemoteCommand {
    pub fn service(action: ServiceAction, unit: impl Into<String>) -> Self {
        RemoteCommand::Service {
            action,
            unit: unit.into(),
        }
    }

    pub fn kind(&self) -> CommandKind {
        match self {
            RemoteCommand::Service { action, .. } => CommandKind::Service(*action),
            RemoteCommand::DaemonReload => CommandKind::DaemonReload,
            RemoteCommand::EnsureDirs { .. } => CommandKind::EnsureDirs,
            RemoteCommand::ClearDir { .. } => CommandKind::ClearDir,
            RemoteCommand::CopyTree { .. } => CommandKind::CopyTree,
            RemoteCommand::PruneFiles { .. } => CommandKind::PruneFiles,
            RemoteCommand::ListeningPorts => CommandKind::ListeningPorts,
            RemoteCommand::InterfaceAddresses => CommandKind::InterfaceAddresses,
            RemoteCommand::ReadFile { .. } => CommandKind::ReadFile,
            RemoteCommand::GoBuild { .. } => CommandKind::GoBuild,
            RemoteCommand::Provision { .. } => CommandKind::Provision,
            RemoteCommand::ReplaceIfUnchanged { .. } => CommandKind::ReplaceIfUnchanged,
        }
    }

    /// Render the command as a single shell line.
    pub fn to_shell(&self) -> String {
        match self {
            RemoteCommand::Service { action, unit } => {
                format!("systemctl {} {}", action.as_str(), quote(unit))
            }
            RemoteCommand::DaemonReload => "systemctl daemon-reload".to_string(),
            RemoteCommand::EnsureDirs { paths } => {
                let joined = join_quoted(paths);
                format!("mkdir -p {joined} && chmod 777 {joined}")
            }
            RemoteCommand::ClearDir { path } => {
                format!("find {} -mindepth 1 -delete", quote(path))
            }
            RemoteCommand::CopyTree { from, to } => {
                format!("cp -R {} {}", quote(&format!("{from}/.")), quote(&format!("{to}/")))
            }
            RemoteCommand::PruneFiles { root, pattern } => {
                format!(
                    "find {} -type f -name {} -delete",
                    quote(root),
                    quote(pattern)
                )
            }
            RemoteCommand::ListeningPorts => "ss -Hltn 2>/dev/null || netstat -lnt".to_string(),
            RemoteCommand::InterfaceAddresses => "ip -4 addr show".to_string(),
            RemoteCommand::ReadFile { path } => {
                let path = quote(path);
                format!("test ! -e {path} || cat {path}")
            }
            RemoteCommand::GoBuild { dir, output } => {
                format!("cd {} && go build -v -o {} .", quote(dir), quote(output))
            }
            RemoteCommand::Provision { root } => {
                let root = quote(root);
                format!("sudo mkdir -p {root} && sudo chmod 777 {root}")
            }
            RemoteCommand::ReplaceIfUnchanged { path, base, next } => {
                let (live, base, next) = (quote(path), quote(base), quote(next));
                let script = format!(
                    "if cat {live} 2>/dev/null | cmp -s {base} -; \
                     then mv {next} {live} && rm -f {base} && echo {REPLACED}; \
                     else rm -f {base} {next} && echo {CONFLICT}; fi"
                );
                format!("flock {} sh -c {}", quote(&format!("{path}.lock")), quote(&script))
            }
        }
    }
}

impl fmt::Display for RemoteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_shell())
    }
}

/// Quote a word for POSIX sh. Words made only of safe characters pass
/// through unchanged.
pub fn quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./:=@%+,".contains(c));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

fn join_quoted(words: &[String]) -> String {
    words
        .iter()
        .map(|w| quote(w))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_words_are_not_quoted() {
        assert_eq!(quote("/opt/api/_staging"), "/opt/api/_staging");
        assert_eq!(quote("api.service"), "api.service");
    }

    #[test]
    fn unsafe_words_are_single_quoted() {
        assert_eq!(quote("*.go"), "'*.go'");
        assert_eq!(quote("a b"), "'a b'");
        assert_eq!(quote(""), "''");
        assert_eq!(quote("it's"), r"'it'\''s'");
        assert_eq!(quote("x; rm -rf /"), "'x; rm -rf /'");
    }

    #[test]
    fn service_kinds_are_distinct_keys() {
        let failing: std::collections::HashSet<(String, CommandKind)> = [
            ("web-1".to_string(), CommandKind::Service(ServiceAction::Stop)),
            ("web-1".to_string(), CommandKind::Service(ServiceAction::Start)),
            ("web-1".to_string(), CommandKind::Service(ServiceAction::Stop)),
        ]
        .into_iter()
        .collect();

        assert_eq!(failing.len(), 2);
        let start = RemoteCommand::service(ServiceAction::Start, "api.service");
        assert!(failing.contains(&("web-1".to_string(), start.kind())));
        let enable = RemoteCommand::service(ServiceAction::Enable, "api.service");
        assert!(!failing.contains(&("web-1".to_string(), enable.kind())));
    }

    #[test]
    fn conditional_replace_runs_under_a_lock() {
        let line = RemoteCommand::ReplaceIfUnchanged {
            path: "/etc/haproxy/config.json".to_string(),
            base: "/etc/haproxy/config.json.7.base".to_string(),
            next: "/etc/haproxy/config.json.7.next".to_string(),
        }
        .to_shell();

        assert!(line.starts_with("flock /etc/haproxy/config.json.lock sh -c 'if cat "), "{line}");
        assert!(line.contains("cmp -s /etc/haproxy/config.json.7.base -"), "{line}");
        assert!(line.contains("mv /etc/haproxy/config.json.7.next /etc/haproxy/config.json"), "{line}");
        assert!(line.ends_with("echo conflict; fi'"), "{line}");
    }

    #[test]
    fn renders_swap_commands() {
        assert_eq!(
            RemoteCommand::ClearDir {
                path: "/opt/api/current".to_string()
            }
            .to_shell(),
            "find /opt/api/current -mindepth 1 -delete"
        );
        assert_eq!(
            RemoteCommand::CopyTree {
                from: "/opt/api/_staging".to_string(),
                to: "/opt/api/current".to_string()
            }
            .to_shell(),
            "cp -R /opt/api/_staging/. /opt/api/current/"
        );
    }

    #[test]
    fn renders_service_and_dirs() {
        assert_eq!(
            RemoteCommand::service(ServiceAction::Stop, "api.service").to_shell(),
            "systemctl stop api.service"
        );
        assert_eq!(
            RemoteCommand::EnsureDirs {
                paths: vec!["/opt/api/_staging".to_string(), "/opt/api/current".to_string()]
            }
            .to_shell(),
            "mkdir -p /opt/api/_staging /opt/api/current && chmod 777 /opt/api/_staging /opt/api/current"
        );
    }

    #[test]
    fn prune_pattern_is_quoted() {
        let cmd = RemoteCommand::PruneFiles {
            root: "/opt/api/current".to_string(),
            pattern: "*.go".to_string(),
        };
        assert_eq!(cmd.to_shell(), "find /opt/api/current -type f -name '*.go' -delete");
        assert_eq!(cmd.kind(), CommandKind::PruneFiles);
    }
}

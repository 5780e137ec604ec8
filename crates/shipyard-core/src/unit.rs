//! systemd unit rendering.
//!
//! Rendering is a pure function of [`UnitSpec`]; writing the text to a host
//! is the cutover engine's job.

use std::fmt::Write;

use crate::layout::RemoteLayout;
use crate::settings::Settings;

/// Environment variable carrying the listening port.
pub const PORT_VAR: &str = "PORT";

/// Environment variable carrying the environment name, when paths include it.
pub const ENV_VAR: &str = "APP_ENV";

/// Everything a unit file needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitSpec {
    pub name: String,
    pub port: u16,
    pub environment: Option<String>,
    pub exec_start: String,
    pub working_directory: String,
    pub user: String,
    pub group: String,
}

impl UnitSpec {
    pub fn new(layout: &RemoteLayout, port: u16, settings: &Settings) -> Self {
        Self {
            name: layout.name().to_string(),
            port,
            environment: layout.environment().map(str::to_string),
            exec_start: layout.binary_path(),
            working_directory: layout.current_dir(),
            user: settings.service_user.clone(),
            group: settings.service_group.clone(),
        }
    }
}

pub fn render(spec: &UnitSpec) -> String {
    let description = match &spec.environment {
        Some(env) => format!("{} ({})", spec.name, env),
        None => spec.name.clone(),
    };

    let mut out = String::new();
    out.push_str("[Unit]\n");
    let _ = writeln!(out, "Description={}", description);
    out.push_str("After=syslog.target\n");
    out.push_str("After=network.target\n");
    out.push('\n');
    out.push_str("[Service]\n");
    out.push_str("Type=simple\n");
    let _ = writeln!(out, "ExecStart={}", spec.exec_start);
    let _ = writeln!(out, "User={}", spec.user);
    let _ = writeln!(out, "Group={}", spec.group);
    out.push_str("Restart=always\n");
    let _ = writeln!(out, "WorkingDirectory={}", spec.working_directory);
    let _ = writeln!(out, "Environment={}={}", PORT_VAR, spec.port);
    if let Some(env) = &spec.environment {
        let _ = writeln!(out, "Environment={}={}", ENV_VAR, env);
    }
    out.push('\n');
    out.push_str("[Install]\n");
    out.push_str("WantedBy=multi-user.target\n");
    out
}

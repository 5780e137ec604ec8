//! HAProxy configuration rendering.
//!
//! The output is a pure function of the document: applications are emitted
//! in list order, one routing rule per application in the shared frontend
//! and one backend pool per application.

use std::fmt::Write;

use super::{ProxyApplication, ProxyConfig};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderOptions {
    /// Frontend bind address, e.g. `*:80`.
    pub bind: String,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            bind: "*:80".to_string(),
        }
    }
}

const HEADER: &str = "\
# Generated by shipyard from the routing document. Do not edit by hand.
global
    daemon
    maxconn 4096
    log /dev/log local0

defaults
    log global
    mode http
    option httplog
    option forwardfor
    timeout connect 5s
    timeout client 30s
    timeout server 30s
";

pub fn render(cfg: &ProxyConfig, options: &RenderOptions) -> String {
    let mut out = String::from(HEADER);

    out.push('\n');
    out.push_str("frontend http\n");
    let _ = writeln!(out, "    bind {}", options.bind);
    for app in &cfg.applications {
        write_routing_rule(&mut out, app);
    }

    for app in &cfg.applications {
        out.push('\n');
        write_backend(&mut out, app);
    }
    out
}

/// Backend identifier for an application.
pub fn backend_name(app: &str) -> String {
    format!("app_{}", app)
}

fn write_routing_rule(out: &mut String, app: &ProxyApplication) {
    // An acl without values is a config error in HAProxy.
    if app.domains.is_empty() {
        return;
    }
    let acl = format!("host_{}", app.name);
    let domains = app
        .domains
        .iter()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(" ");
    let _ = writeln!(out, "    acl {} hdr(host) -i {}", acl, domains);
    let _ = writeln!(out, "    use_backend {} if {}", backend_name(&app.name), acl);
}

fn write_backend(out: &mut String, app: &ProxyApplication) {
    let _ = writeln!(out, "backend {}", backend_name(&app.name));
    out.push_str("    balance roundrobin\n");
    for (i, server) in app.servers.iter().enumerate() {
        let _ = writeln!(
            out,
            "    server {}-{} {} check",
            app.name,
            i + 1,
            server.address()
        );
    }
}

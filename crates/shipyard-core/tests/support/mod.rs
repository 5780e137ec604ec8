//! Shared fixtures: source trees on disk and simulated fleets.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use shipyard_core::deploy::Deployer;
use shipyard_core::proxy::ProxyConfig;
use shipyard_core::settings::Settings;
use shipyard_core::transport::{MemoryHost, MemoryTransport};

pub const DOCUMENT: &str = "/etc/haproxy/config.json";
pub const RENDERED: &str = "/etc/haproxy/haproxy.cfg";

/// One web application on three servers behind one proxy.
pub const WEB_DESCRIPTOR: &str = r#"
[api]
folder = "services/api"
build = "go"
type = "web"

[api.production]
servers = ["web-1", "web-2", "web-3"]
proxies = ["lb-1"]
domains = ["api.example.com"]
"#;

pub fn write_tree(root: &Path, files: &[(&str, &str)]) {
    for (rel, content) in files {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }
}

/// A source root holding `descriptor` and the `api` sources.
pub fn source_root(descriptor: &str) -> tempfile::TempDir {
    let root = tempfile::TempDir::new().unwrap();
    write_tree(
        root.path(),
        &[
            ("deploy.toml", descriptor),
            ("services/api/main.go", "package main\n"),
            ("services/api/static/index.html", "<h1>api</h1>\n"),
            ("services/api/.env", "SECRET=1\n"),
            ("cmd/worker/main.go", "package main\n"),
        ],
    );
    root
}

/// web-1..3 at 10.0.0.1..3, web-2 already serving something on 9000, and
/// one proxy.
pub fn web_fleet() -> MemoryTransport {
    let transport = MemoryTransport::new();
    transport.add_host("web-1", MemoryHost::with_address("10.0.0.1"));
    transport.add_host("web-2", MemoryHost::with_address("10.0.0.2").with_listening(&[9000]));
    transport.add_host("web-3", MemoryHost::with_address("10.0.0.3"));
    transport.add_host("lb-1", MemoryHost::with_address("10.0.0.100"));
    transport
}

pub fn deployer(transport: &MemoryTransport) -> Deployer {
    deployer_with(transport, Settings::default())
}

pub fn deployer_with(transport: &MemoryTransport, settings: Settings) -> Deployer {
    Deployer::new(Arc::new(transport.clone()), settings)
}

pub fn proxy_config(transport: &MemoryTransport, host: &str) -> ProxyConfig {
    ProxyConfig::from_document(transport.host(host).file(DOCUMENT).unwrap_or_default())
}

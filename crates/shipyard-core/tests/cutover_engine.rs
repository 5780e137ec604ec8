use std::sync::Arc;

use shipyard_core::cutover::CutoverEngine;
use shipyard_core::layout::RemoteLayout;
use shipyard_core::settings::Settings;
use shipyard_core::transport::{MemoryHost, MemoryTransport, Transport};

fn staged_host(apps: &[&str], listening: &[u16]) -> MemoryHost {
    let mut host = MemoryHost::with_address("10.0.0.1").with_listening(listening);
    for app in apps {
        host.files
            .insert(format!("/opt/{app}/_staging/{app}"), "\u{7f}ELF".to_string());
        host.files.insert(
            format!("/opt/{app}/_staging/src/{app}/main.go"),
            "package main\n".to_string(),
        );
    }
    host
}

#[tokio::test]
async fn picks_the_first_free_port_above_the_base() {
    let transport = MemoryTransport::new();
    transport.add_host("web-1", staged_host(&["api"], &[22, 9000, 9001, 9002]));
    let settings = Arc::new(Settings::default());
    let engine = CutoverEngine::new(Arc::clone(&settings));
    let conn = transport.connect("web-1").await.unwrap();

    let port = engine
        .run(conn.as_ref(), &RemoteLayout::new(&settings, "api", "production"))
        .await
        .unwrap();

    assert_eq!(port, 9003);
    let host = transport.host("web-1");
    let unit = host.file("/etc/systemd/system/api.service").unwrap();
    assert!(unit.contains("Environment=PORT=9003\n"));
    assert!(unit.contains("WorkingDirectory=/opt/api/current\n"));
    assert!(host.services["api.service"].enabled);
    assert!(host.listening.contains(&9003));
}

#[tokio::test]
async fn applications_sharing_a_host_get_distinct_ports() {
    let transport = MemoryTransport::new();
    transport.add_host("web-1", staged_host(&["api", "worker"], &[]));
    let settings = Arc::new(Settings::default());
    let engine = CutoverEngine::new(Arc::clone(&settings));
    let conn = transport.connect("web-1").await.unwrap();

    let api = engine
        .run(conn.as_ref(), &RemoteLayout::new(&settings, "api", "production"))
        .await
        .unwrap();
    let worker = engine
        .run(conn.as_ref(), &RemoteLayout::new(&settings, "worker", "production"))
        .await
        .unwrap();
    // A redeploy frees its own port before allocating.
    let api_again = engine
        .run(conn.as_ref(), &RemoteLayout::new(&settings, "api", "production"))
        .await
        .unwrap();

    assert_eq!((api, worker, api_again), (9000, 9001, 9000));
    let host = transport.host("web-1");
    assert_eq!(host.tree("/opt/worker/current"), ["worker"]);
}

#[tokio::test]
async fn environments_side_by_side_on_one_host() {
    let transport = MemoryTransport::new();
    transport.add_host("web-1", staged_host(&["api"], &[]));
    let settings = Arc::new(Settings {
        environment_in_path: true,
        ..Settings::default()
    });
    let engine = CutoverEngine::new(Arc::clone(&settings));
    let conn = transport.connect("web-1").await.unwrap();

    let production = engine
        .run(conn.as_ref(), &RemoteLayout::new(&settings, "api", "production"))
        .await
        .unwrap();
    let staging = engine
        .run(conn.as_ref(), &RemoteLayout::new(&settings, "api", "staging"))
        .await
        .unwrap();

    assert_eq!((production, staging), (9000, 9001));
    let host = transport.host("web-1");
    assert!(host.services["api-production.service"].running);
    assert!(host.services["api-staging.service"].running);
    assert_eq!(host.tree("/opt/api/staging"), ["api"]);
}

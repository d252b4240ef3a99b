//! Tunnel lifecycle tests: discovery, teardown, flaps, manual toggles, and
//! failure escalation, driven tick by tick through the real reconciler.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use port_mirror::control::Command;
use port_mirror::registry::TunnelStatus;
use port_mirror::Error;

use crate::common::{test_config, wait_until, Rig};

async fn connect(port: u16) -> TcpStream {
    timeout(
        Duration::from_secs(2),
        TcpStream::connect(("127.0.0.1", port)),
    )
    .await
    .expect("connect timed out")
    .expect("connect failed")
}

/// Write a payload and read the echo back, leaving the stream open.
async fn echo_roundtrip(stream: &mut TcpStream, payload: &[u8]) {
    stream.write_all(payload).await.unwrap();
    let mut received = vec![0u8; payload.len()];
    timeout(Duration::from_secs(2), stream.read_exact(&mut received))
        .await
        .expect("echo timed out")
        .expect("echo read failed");
    assert_eq!(received, payload);
}

#[tokio::test]
async fn forwards_a_discovered_port_end_to_end() {
    let mut rig = Rig::new(test_config((21000, 21010)));
    rig.scanner.set_ports(&[(21005, "python3")]);

    rig.tick().await.unwrap();

    let snapshot = rig.snapshot();
    let tunnel = snapshot.tunnel(21005).expect("tunnel should exist");
    assert_eq!(tunnel.local_port, 21005);
    assert_eq!(tunnel.process_name.as_deref(), Some("python3"));
    assert_eq!(tunnel.status, TunnelStatus::Active);
    assert_eq!(snapshot.remote_ports.len(), 1);

    let mut client = connect(21005).await;
    echo_roundtrip(&mut client, b"ping").await;
    drop(client);

    assert_eq!(rig.transport.channels_opened(), 1);

    // Remote listener goes away: tunnel is destroyed and the port released.
    rig.scanner.clear();
    rig.tick().await.unwrap();
    let registry = rig.registry.clone();
    assert!(wait_until(|| registry.is_empty(), 2000).await);

    // The next tick publishes the now-empty state.
    rig.tick().await.unwrap();
    assert!(rig.snapshot().tunnel(21005).is_none());
}

#[tokio::test]
async fn repeated_ticks_change_nothing() {
    let mut rig = Rig::new(test_config((21100, 21110)));
    rig.scanner.set_ports(&[(21105, "redis-server")]);

    rig.tick().await.unwrap();
    let first = rig.snapshot().tunnel(21105).cloned().unwrap();

    rig.tick().await.unwrap();
    rig.tick().await.unwrap();

    let after = rig.snapshot();
    assert_eq!(after.tunnels.len(), 1);
    let tunnel = after.tunnel(21105).unwrap();
    assert_eq!(tunnel.local_port, first.local_port);
    // Same entry, not a recreation.
    assert_eq!(tunnel.created_at, first.created_at);
}

#[tokio::test]
async fn scan_failure_leaves_tunnels_untouched() {
    let mut rig = Rig::new(test_config((21200, 21210)));
    rig.scanner.set_ports(&[(21205, "node")]);
    rig.tick().await.unwrap();
    let before = rig.snapshot().tunnel(21205).cloned().unwrap();

    rig.scanner.fail_next("ss: command not found");
    rig.tick().await.unwrap();

    let after = rig.snapshot().tunnel(21205).cloned().unwrap();
    assert_eq!(after.status, TunnelStatus::Active);
    assert_eq!(after.local_port, before.local_port);
    assert_eq!(after.created_at, before.created_at);

    // And the tunnel still carries traffic.
    let mut client = connect(21205).await;
    echo_roundtrip(&mut client, b"still alive").await;
}

#[tokio::test]
async fn flap_recreates_the_tunnel_without_a_stale_port() {
    let mut rig = Rig::new(test_config((21300, 21310)));
    rig.scanner.set_ports(&[(21305, "api")]);
    rig.tick().await.unwrap();
    let original = rig.snapshot().tunnel(21305).cloned().unwrap();

    // Hold a connection open through the teardown.
    let mut client = connect(21305).await;
    echo_roundtrip(&mut client, b"hello").await;

    rig.scanner.clear();
    rig.tick().await.unwrap();

    // The local port is not reused until the old tunnel has fully drained.
    let registry = rig.registry.clone();
    assert!(wait_until(|| registry.is_empty(), 2000).await);
    drop(client);

    rig.scanner.set_ports(&[(21305, "api")]);
    rig.tick().await.unwrap();

    let recreated = rig.snapshot().tunnel(21305).cloned().unwrap();
    assert_eq!(recreated.local_port, 21305);
    assert_eq!(recreated.status, TunnelStatus::Active);
    assert!(recreated.created_at > original.created_at);
}

#[tokio::test]
async fn local_conflicts_resolve_to_the_next_free_port() {
    let mut rig = Rig::new(test_config((21400, 21410)));
    // 21406 is taken by an unrelated local process.
    let _squatter = std::net::TcpListener::bind(("127.0.0.1", 21406)).unwrap();

    rig.scanner.set_ports(&[(21405, "web"), (21406, "worker")]);
    rig.tick().await.unwrap();

    let snapshot = rig.snapshot();
    assert_eq!(snapshot.tunnel(21405).unwrap().local_port, 21405);
    assert_eq!(snapshot.tunnel(21406).unwrap().local_port, 21407);

    let mut client = connect(21407).await;
    echo_roundtrip(&mut client, b"routed around the conflict").await;
}

#[tokio::test]
async fn manual_close_sticks_until_retoggled() {
    let mut rig = Rig::new(test_config((23000, 23010)));
    rig.scanner.set_ports(&[(23005, "web")]);
    rig.tick().await.unwrap();

    // User closes the tunnel while the remote port is still listening.
    rig.command(Command::Toggle(23005)).await.unwrap();
    let registry = rig.registry.clone();
    assert!(wait_until(|| registry.is_empty(), 2000).await);

    // Scans keep showing the port; it stays closed.
    rig.tick().await.unwrap();
    rig.tick().await.unwrap();
    assert!(rig.snapshot().tunnel(23005).is_none());

    // Toggling again reopens it, now marked manual.
    rig.command(Command::Toggle(23005)).await.unwrap();
    let tunnel = rig.snapshot().tunnel(23005).cloned().unwrap();
    assert_eq!(tunnel.status, TunnelStatus::Active);
    assert!(rig.registry.manual_ports().contains(&23005));

    // A flap clears the suppression for good.
    rig.scanner.clear();
    rig.tick().await.unwrap();
    assert!(wait_until(|| registry.is_empty(), 2000).await);
    rig.scanner.set_ports(&[(23005, "web")]);
    rig.tick().await.unwrap();
    let tunnel = rig.snapshot().tunnel(23005).cloned().unwrap();
    assert_eq!(tunnel.status, TunnelStatus::Active);
    assert!(rig.registry.manual_ports().is_empty());
}

#[tokio::test]
async fn system_ports_are_only_forwarded_manually() {
    let mut rig = Rig::new(test_config((23100, 23110)));
    rig.scanner.set_ports(&[(443, "nginx")]);

    rig.tick().await.unwrap();
    let snapshot = rig.snapshot();
    assert!(snapshot.tunnel(443).is_none());
    // Still visible in the inventory for a UI to offer.
    assert_eq!(snapshot.remote_ports.len(), 1);

    rig.command(Command::Toggle(443)).await.unwrap();
    let tunnel = rig.snapshot().tunnel(443).cloned().unwrap();
    assert_eq!(tunnel.status, TunnelStatus::Active);
    // 443 is outside the local range, so the allocator starts at its min.
    assert_eq!(tunnel.local_port, 23100);

    let mut client = connect(23100).await;
    echo_roundtrip(&mut client, b"GET / HTTP/1.0\r\n\r\n").await;
}

#[tokio::test]
async fn repeated_channel_failures_fail_the_tunnel() {
    let mut rig = Rig::new(test_config((24000, 24010)));
    rig.transport.refuse_port(24005, 3);
    rig.scanner.set_ports(&[(24005, "flaky")]);
    rig.tick().await.unwrap();

    // Each connection hits a refused channel; the third failure in a row
    // tears the tunnel down.
    for _ in 0..3 {
        let mut client = connect(24005).await;
        let mut buf = [0u8; 1];
        let _ = timeout(Duration::from_secs(2), client.read(&mut buf)).await;
    }

    let registry = rig.registry.clone();
    assert!(wait_until(|| registry.is_empty(), 2000).await);

    // The failed port is damped: still listed remotely, not recreated.
    rig.tick().await.unwrap();
    assert!(rig.snapshot().tunnel(24005).is_none());

    // Once the remote listener cycles, forwarding resumes.
    rig.scanner.clear();
    rig.tick().await.unwrap();
    rig.scanner.set_ports(&[(24005, "flaky")]);
    rig.tick().await.unwrap();
    let tunnel = rig.snapshot().tunnel(24005).cloned().unwrap();
    assert_eq!(tunnel.status, TunnelStatus::Active);
}

#[tokio::test]
async fn transport_loss_is_fatal_and_fails_all_tunnels() {
    let mut rig = Rig::new(test_config((25000, 25010)));
    rig.scanner.set_ports(&[(25005, "db"), (25006, "cache")]);
    rig.tick().await.unwrap();
    assert_eq!(rig.snapshot().tunnels.len(), 2);

    rig.transport.disconnect();
    rig.scanner.fail_next("connection reset by peer");

    let err = rig.tick().await.unwrap_err();
    assert!(matches!(err, Error::ConnectionLost));

    // The snapshot published on the way out shows every tunnel failed.
    let snapshot = rig.snapshot();
    for port in [25005, 25006] {
        assert_eq!(snapshot.tunnel(port).unwrap().status, TunnelStatus::Failed);
    }

    let registry = rig.registry.clone();
    assert!(wait_until(|| registry.is_empty(), 2000).await);
}

#[tokio::test]
async fn toggle_for_an_unknown_port_does_nothing() {
    let mut rig = Rig::new(test_config((25100, 25110)));
    rig.tick().await.unwrap();

    rig.command(Command::Toggle(25105)).await.unwrap();
    assert!(rig.registry.is_empty());
    assert!(rig.snapshot().tunnels.is_empty());
}

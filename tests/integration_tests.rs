//! End-to-end tests across discovery, tunnel, and the lifecycle engine.

use haven_core::{ConnectionEvent, ConnectionManager, ConnectionStatus, RecoveryConfig};
use haven_integration_tests::{fast_manager_config, manager_with_interface};
use haven_discovery::{DiscoveryConfig, DiscoveryEvent, DiscoveryService, PresenceMessage};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;

async fn next_event(rx: &mut broadcast::Receiver<ConnectionEvent>) -> ConnectionEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no event within deadline")
        .expect("event channel closed")
}

#[tokio::test]
async fn discovery_round_trip_and_loss() {
    let loopback = IpAddr::V4(Ipv4Addr::LOCALHOST);
    let config = |target| DiscoveryConfig {
        bind_addr: loopback,
        port: 0,
        broadcast_target: target,
        broadcast_interval: Duration::from_millis(50),
        peer_timeout: Duration::from_millis(400),
        reap_interval: Duration::from_millis(50),
        event_buffer: 16,
    };

    // B listens on an ephemeral port; A broadcasts straight at it.
    let (observer, mut observer_events) = DiscoveryService::start(
        config("127.0.0.1:9".parse().unwrap()),
        PresenceMessage::new("observer", loopback, 1),
    )
    .await
    .unwrap();

    let (announcer, _announcer_events) = DiscoveryService::start(
        config(observer.local_addr()),
        PresenceMessage::new("announcer", loopback, 12345),
    )
    .await
    .unwrap();

    // Discovered within one broadcast interval (plus scheduling slack).
    let event = tokio::time::timeout(Duration::from_millis(500), observer_events.recv())
        .await
        .expect("peer not discovered within a broadcast interval")
        .unwrap();
    match event {
        DiscoveryEvent::Discovered(record) => {
            assert_eq!(record.name, "announcer");
            assert_eq!(record.port, 12345);
        }
        other => panic!("expected Discovered, got {other:?}"),
    }

    // Silence beyond the timeout yields a lost event.
    announcer.stop().await;
    let event = tokio::time::timeout(Duration::from_secs(2), observer_events.recv())
        .await
        .expect("silent peer never reported lost")
        .unwrap();
    assert!(matches!(event, DiscoveryEvent::Lost(name) if name == "announcer"));

    observer.stop().await;
}

#[tokio::test]
async fn discovered_peer_record_connects_end_to_end() {
    let loopback = IpAddr::V4(Ipv4Addr::LOCALHOST);
    let (host, _host_iface) = manager_with_interface();
    let addr = host.start_hosting(0, "mesh-pass").await.unwrap();

    let config = |target| DiscoveryConfig {
        bind_addr: loopback,
        port: 0,
        broadcast_target: target,
        broadcast_interval: Duration::from_millis(50),
        peer_timeout: Duration::from_secs(30),
        reap_interval: Duration::from_millis(50),
        event_buffer: 16,
    };

    // The hosting side announces its tunnel port; the observer picks the
    // record up and connects with it, no side channel involved.
    let (observer, mut observer_events) = DiscoveryService::start(
        config("127.0.0.1:9".parse().unwrap()),
        PresenceMessage::new("wanderer", loopback, 1),
    )
    .await
    .unwrap();

    let (announcer, _announcer_events) = DiscoveryService::start(
        config(observer.local_addr()),
        PresenceMessage::new("game-host", loopback, addr.port()),
    )
    .await
    .unwrap();

    let record = match tokio::time::timeout(Duration::from_secs(2), observer_events.recv())
        .await
        .expect("host never discovered")
        .unwrap()
    {
        DiscoveryEvent::Discovered(record) => record,
        other => panic!("expected Discovered, got {other:?}"),
    };
    assert_eq!(record.endpoint().port(), addr.port());

    let (client, _) = manager_with_interface();
    let ip = client.connect_to_peer(&record, "mesh-pass").await.unwrap();
    assert_eq!(ip.octets()[..3], [10, 0, 0]);
    // The discovered name becomes the connection's peer id.
    assert_eq!(client.connected_peers(), vec!["game-host".to_string()]);

    announcer.stop().await;
    observer.stop().await;
    client.shutdown().await;
    host.shutdown().await;
}

#[tokio::test]
async fn connect_scenario_allocates_pool_addresses() {
    let (host, _host_iface) = manager_with_interface();
    let addr = host.start_hosting(0, "correct-pass").await.unwrap();

    let (client_a, _) = manager_with_interface();
    let ip_a = client_a
        .connect_to_host(addr.ip(), addr.port(), "correct-pass")
        .await
        .unwrap();

    // Allocated inside 10.0.0.0/24 and never the host's reserved .1.
    assert_eq!(ip_a.octets()[..3], [10, 0, 0]);
    assert_ne!(ip_a, Ipv4Addr::new(10, 0, 0, 1));

    // A second peer gets a distinct address from the same pool.
    let (client_b, _) = manager_with_interface();
    let ip_b = client_b
        .connect_to_host(addr.ip(), addr.port(), "correct-pass")
        .await
        .unwrap();
    assert_ne!(ip_a, ip_b);
    assert_eq!(ip_b.octets()[..3], [10, 0, 0]);

    client_a.shutdown().await;
    client_b.shutdown().await;
    host.shutdown().await;
}

#[tokio::test]
async fn wrong_passphrase_fails_terminally_with_one_event() {
    let (host, _) = manager_with_interface();
    let addr = host.start_hosting(0, "correct-pass").await.unwrap();

    let (client, _) = manager_with_interface();
    let mut events = client.events();

    let err = client
        .connect_to_host(addr.ip(), addr.port(), "wrong-pass")
        .await
        .unwrap_err();
    assert!(err.is_terminal(), "authentication failure must be terminal");

    match next_event(&mut events).await {
        ConnectionEvent::Failed { .. } => {}
        other => panic!("expected Failed, got {other:?}"),
    }
    let quiet = tokio::time::timeout(Duration::from_millis(300), events.recv()).await;
    assert!(quiet.is_err(), "exactly one terminal failure event expected");

    client.shutdown().await;
    host.shutdown().await;
}

#[tokio::test]
async fn sampler_feeds_quality_metrics_end_to_end() {
    let (host, _) = manager_with_interface();
    let addr = host.start_hosting(0, "pass").await.unwrap();

    let (client, _) = manager_with_interface();
    client
        .connect_to_host(addr.ip(), addr.port(), "pass")
        .await
        .unwrap();
    let peer = client.connected_peers().pop().unwrap();

    // Echo probes run every 50ms; metrics should appear and show a live
    // link (loss well under the recovery threshold).
    tokio::time::sleep(Duration::from_millis(400)).await;
    let metrics = client
        .monitor()
        .metrics(&peer)
        .expect("sampler produced no metrics");
    assert!(metrics.packet_loss < 0.5);
    assert!(metrics.stability_score > 0.0);

    client.shutdown().await;
    host.shutdown().await;
}

#[tokio::test]
async fn recovery_exhausts_after_max_retries_and_closes() {
    let mut config = fast_manager_config();
    config.recovery = RecoveryConfig {
        check_interval: Duration::from_millis(100),
        retry_delay: Duration::from_millis(50),
        max_retries: 3,
        ..RecoveryConfig::default()
    };
    config.traversal.connect_timeout = Duration::from_millis(200);

    let (host, _) = manager_with_interface();
    let addr = host.start_hosting(0, "pass").await.unwrap();

    let client = ConnectionManager::new(config, Arc::new(haven_core::ChannelInterface::new()));
    let mut events = client.events();
    client
        .connect_to_host(addr.ip(), addr.port(), "pass")
        .await
        .unwrap();
    let peer = client.connected_peers().pop().unwrap();
    let _ = next_event(&mut events).await; // Established

    // Kill the host, then squat its port with a listener that accepts and
    // immediately drops, so every reconnect attempt is observable and
    // fails its handshake.
    host.shutdown().await;
    let squatter = tokio::net::TcpListener::bind(addr).await.unwrap();
    let attempts = Arc::new(AtomicU32::new(0));
    let counted = Arc::clone(&attempts);
    tokio::spawn(async move {
        while let Ok((socket, _)) = squatter.accept().await {
            counted.fetch_add(1, Ordering::SeqCst);
            drop(socket);
        }
    });

    // The dead link degrades, recovery runs its bounded ladder, then gives
    // up for good.
    let mut saw_degraded = false;
    let mut saw_recovery_failed = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while tokio::time::Instant::now() < deadline {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::time::sleep_until(deadline) => break,
        };
        match event {
            Ok(ConnectionEvent::Degraded { .. }) => saw_degraded = true,
            Ok(ConnectionEvent::RecoveryFailed { peer: failed }) => {
                assert_eq!(failed, peer);
                saw_recovery_failed = true;
                break;
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }
    assert!(saw_degraded, "link failure never flagged Degraded");
    assert!(saw_recovery_failed, "recovery never reported terminal failure");
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    // Terminal means terminal: no further reconnects, connection gone.
    let counted_after = attempts.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), counted_after);
    assert!(client.status(&peer).is_none());
    assert!(client.connected_peers().is_empty());

    client.shutdown().await;
}

#[tokio::test]
async fn repeated_disconnect_emits_no_duplicate_closed() {
    let (host, _) = manager_with_interface();
    let addr = host.start_hosting(0, "pass").await.unwrap();

    let (client, _) = manager_with_interface();
    client
        .connect_to_host(addr.ip(), addr.port(), "pass")
        .await
        .unwrap();
    let peer = client.connected_peers().pop().unwrap();

    let mut events = client.events();
    client.disconnect(&peer).await.unwrap();
    assert!(matches!(
        next_event(&mut events).await,
        ConnectionEvent::Closed { .. }
    ));

    // Disconnecting the already-closed peer again: no event, no error.
    client.disconnect(&peer).await.unwrap();
    let quiet = tokio::time::timeout(Duration::from_millis(200), events.recv()).await;
    assert!(quiet.is_err());

    client.shutdown().await;
    host.shutdown().await;
}

#[tokio::test]
async fn bandwidth_limit_holds_over_a_one_second_window() {
    use haven_core::{PacketDirection, QoSPolicy, ShaperConfig, TrafficShaper};

    let shaper = TrafficShaper::new(ShaperConfig::default());
    // 10 kB/s limit, 500 B packets.
    shaper.register("p", QoSPolicy::new(0, 10_000, 0));
    for _ in 0..200 {
        shaper.enqueue("p", PacketDirection::Outbound, vec![0u8; 500]);
    }

    let mut delivered: u64 = 0;
    let started = tokio::time::Instant::now();
    while started.elapsed() < Duration::from_millis(1000) {
        delivered += shaper
            .drain_ready("p")
            .iter()
            .map(|p| p.data.len() as u64)
            .sum::<u64>();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Never more than the limit plus one packet over the window.
    assert!(
        delivered <= 10_000 + 500,
        "delivered {delivered} bytes in 1s against a 10000 B/s limit"
    );
    assert!(delivered > 0, "shaper starved a within-budget queue");
}

#[tokio::test]
async fn control_wire_format_is_length_prefixed_json() {
    let (host, _) = manager_with_interface();
    let addr = host.start_hosting(0, "pass").await.unwrap();

    // A raw TCP client sees the responder open with a framed JSON
    // auth_request carrying a hex challenge.
    let mut raw = tokio::net::TcpStream::connect(addr).await.unwrap();
    let frame = haven_tunnel::read_frame(&mut raw).await.unwrap();
    let message: serde_json::Value = serde_json::from_slice(&frame).unwrap();

    assert_eq!(message["type"], "auth_request");
    let challenge = message["challenge"].as_str().unwrap();
    assert_eq!(challenge.len(), 64);
    assert!(challenge.bytes().all(|b| b.is_ascii_hexdigit()));

    drop(raw);
    host.shutdown().await;
}

#[tokio::test]
async fn saved_host_credentials_reconnect_after_reload() {
    use haven_core::HostDirectory;

    let (host, _) = manager_with_interface();
    let addr = host.start_hosting(0, "directory-pass").await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hosts.json");
    HostDirectory::load(&path).add(addr.ip(), addr.port(), "directory-pass");

    // A fresh process loads the directory and connects with the saved
    // credentials.
    let reloaded = HostDirectory::load(&path);
    let saved = reloaded.get(addr.ip(), addr.port()).unwrap();

    let (client, _) = manager_with_interface();
    let ip = client
        .connect_to_host(saved.ip, saved.port, &saved.passphrase)
        .await
        .unwrap();
    assert_eq!(ip.octets()[..3], [10, 0, 0]);

    client.shutdown().await;
    host.shutdown().await;
}

#[tokio::test]
async fn connection_status_walks_the_state_machine() {
    let (host, _) = manager_with_interface();
    let addr = host.start_hosting(0, "pass").await.unwrap();

    let (client, _) = manager_with_interface();
    client
        .connect_to_host(addr.ip(), addr.port(), "pass")
        .await
        .unwrap();
    let peer = client.connected_peers().pop().unwrap();
    assert_eq!(client.status(&peer), Some(ConnectionStatus::Active));

    client.disconnect(&peer).await.unwrap();
    assert!(client.status(&peer).is_none(), "closed entries are removed");

    client.shutdown().await;
    host.shutdown().await;
}

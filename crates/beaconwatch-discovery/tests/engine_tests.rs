//! End-to-end tests of the discovery engine over an in-memory transport

mod common;

use beaconwatch_core::IoErrorKind;
use beaconwatch_discovery::{
    encode_beacon, DeviceIdentity, DiscoveryConfig, DiscoveryEvent, DiscoveryService,
    EngineState,
};
use common::{assert_quiet, next_event, send_beacon, wait_until, ChannelTransport};
use std::io;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

const DEV1: &str = "DEV1 192.168.1.10 AA:BB:CC:DD:EE:FF";

fn dev1() -> DeviceIdentity {
    DeviceIdentity::new("DEV1", "192.168.1.10", "AA:BB:CC:DD:EE:FF")
}

/// Beacon for a distinct device per index
fn device_beacon(i: u32) -> String {
    format!(
        "D{i} 10.0.{}.{} AA:00:00:00:{:02X}:{:02X}",
        i / 256,
        i % 256,
        i / 256,
        i % 256
    )
}

fn service() -> DiscoveryService {
    DiscoveryService::new(DiscoveryConfig::default()).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_device_lifecycle() {
    let service = service();
    let events = service.subscribe();
    let (transport, beacons) = ChannelTransport::new();

    let handle = service
        .start_with_transport(Arc::new(transport))
        .await
        .unwrap();
    assert!(handle.is_active());
    assert_eq!(service.state(), EngineState::Running);

    send_beacon(&beacons, DEV1);
    assert_eq!(next_event(&events).await, DiscoveryEvent::Discovered(dev1()));

    // Identical advertisement only refreshes; the next event is the change
    send_beacon(&beacons, DEV1);
    send_beacon(&beacons, "DEV1-NEW 192.168.1.10 AA:BB:CC:DD:EE:FF");
    let renamed = DeviceIdentity::new("DEV1-NEW", "192.168.1.10", "AA:BB:CC:DD:EE:FF");
    assert_eq!(
        next_event(&events).await,
        DiscoveryEvent::Changed(renamed.clone())
    );

    let snapshot = service.device("aa:bb:cc:dd:ee:ff").unwrap();
    assert_eq!(snapshot.identity, renamed);
    assert_eq!(snapshot.beacon_count, 3);

    // Silence past the timeout evicts the device exactly once
    assert_eq!(next_event(&events).await, DiscoveryEvent::Removed(renamed));
    assert!(service.devices().is_empty());
    assert_quiet(&events, Duration::from_secs(60)).await;

    service.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_eviction_waits_for_timeout() {
    let service = service();
    let events = service.subscribe();
    let (transport, beacons) = ChannelTransport::new();
    service
        .start_with_transport(Arc::new(transport))
        .await
        .unwrap();

    send_beacon(&beacons, DEV1);
    assert_eq!(next_event(&events).await, DiscoveryEvent::Discovered(dev1()));

    // Keep the device alive for a while with periodic beacons
    for _ in 0..4 {
        tokio::time::sleep(Duration::from_secs(20)).await;
        send_beacon(&beacons, DEV1);
    }
    assert_quiet(&events, Duration::from_secs(25)).await;
    assert_eq!(service.devices().len(), 1);

    assert_eq!(next_event(&events).await, DiscoveryEvent::Removed(dev1()));

    service.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_unparseable_datagrams_are_ignored() {
    let service = service();
    let events = service.subscribe();
    let (transport, beacons) = ChannelTransport::new();
    service
        .start_with_transport(Arc::new(transport))
        .await
        .unwrap();

    beacons.send(Ok(b"not a beacon".to_vec())).unwrap();
    send_beacon(&beacons, "hello world");
    send_beacon(&beacons, DEV1);

    assert_eq!(next_event(&events).await, DiscoveryEvent::Discovered(dev1()));
    assert_eq!(service.devices().len(), 1);

    service.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_quiesces_and_restart_starts_empty() {
    let service = service();
    let events = service.subscribe();
    let (transport, beacons) = ChannelTransport::new();
    let first = service
        .start_with_transport(Arc::new(transport))
        .await
        .unwrap();

    send_beacon(&beacons, DEV1);
    assert_eq!(next_event(&events).await, DiscoveryEvent::Discovered(dev1()));

    service.stop().await;
    assert_eq!(service.state(), EngineState::Idle);
    assert!(service.devices().is_empty());
    assert!(!first.is_active());
    first.finished().await;

    // The transport went away with the run
    assert!(beacons.send(Ok(Vec::new())).is_err());
    assert_quiet(&events, Duration::from_secs(60)).await;

    let (transport, beacons) = ChannelTransport::new();
    let second = service
        .start_with_transport(Arc::new(transport))
        .await
        .unwrap();
    assert_ne!(second.run_id(), first.run_id());

    // Same device is new again in the fresh run
    send_beacon(&beacons, DEV1);
    assert_eq!(next_event(&events).await, DiscoveryEvent::Discovered(dev1()));

    service.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_events_queued_before_stop_are_delivered() {
    let service = service();
    let events = service.subscribe();
    let (transport, beacons) = ChannelTransport::new();
    service
        .start_with_transport(Arc::new(transport))
        .await
        .unwrap();

    send_beacon(&beacons, "A 10.0.0.1 AA:00:00:00:00:01");
    send_beacon(&beacons, "B 10.0.0.2 AA:00:00:00:00:02");
    send_beacon(&beacons, "C 10.0.0.3 AA:00:00:00:00:03");
    wait_until(|| service.devices().len() == 3).await;

    service.stop().await;

    let mut names = Vec::new();
    while let Ok(event) = events.try_recv() {
        match event {
            DiscoveryEvent::Discovered(identity) => names.push(identity.name),
            other => panic!("unexpected event: {:?}", other),
        }
    }
    assert_eq!(names, vec!["A", "B", "C"]);
    assert_quiet(&events, Duration::from_secs(60)).await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_discards_datagrams_still_in_flight() {
    let service = service();
    let events = service.subscribe();
    let (transport, beacons) = ChannelTransport::new();
    service
        .start_with_transport(Arc::new(transport))
        .await
        .unwrap();

    for i in 0..500u32 {
        send_beacon(&beacons, &device_beacon(i));
    }
    // Let the engine get partway through the backlog, then stop without waiting
    tokio::task::yield_now().await;
    service.stop().await;

    let mut delivered = 0;
    while let Ok(event) = events.try_recv() {
        assert!(matches!(event, DiscoveryEvent::Discovered(_)));
        delivered += 1;
    }
    assert!(delivered <= 500);

    assert_quiet(&events, Duration::from_secs(60)).await;
    assert!(service.devices().is_empty());
    assert_eq!(service.state(), EngineState::Idle);
    assert!(beacons.send(Ok(encode_beacon(DEV1))).is_err());
}

#[tokio::test(start_paused = true)]
async fn test_stalled_subscriber_does_not_hold_back_others() {
    let service = service();
    let stalled = service.subscribe();
    let active = service.subscribe();
    let (transport, beacons) = ChannelTransport::new();
    service
        .start_with_transport(Arc::new(transport))
        .await
        .unwrap();

    let mut received = 0;
    for batch in 0..11u32 {
        for i in batch * 100..(batch + 1) * 100 {
            send_beacon(&beacons, &device_beacon(i));
        }
        for _ in 0..100 {
            assert!(matches!(
                next_event(&active).await,
                DiscoveryEvent::Discovered(_)
            ));
            received += 1;
        }
    }

    assert_eq!(received, 1100);
    assert_eq!(service.devices().len(), 1100);
    // The stalled subscriber kept what fit and lost the rest
    assert_eq!(stalled.len(), 1000);

    service.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_receive_failure_faults_once() {
    let service = service();
    let events = service.subscribe();
    let (transport, beacons) = ChannelTransport::new();
    let handle = service
        .start_with_transport(Arc::new(transport))
        .await
        .unwrap();

    send_beacon(&beacons, DEV1);
    assert_eq!(next_event(&events).await, DiscoveryEvent::Discovered(dev1()));

    beacons
        .send(Err(io::Error::new(io::ErrorKind::ConnectionReset, "socket reset")))
        .unwrap();

    match next_event(&events).await {
        DiscoveryEvent::Fault(cause) => {
            assert_eq!(cause.kind, IoErrorKind::ConnectionReset);
            assert!(cause.message.contains("socket reset"));
        }
        other => panic!("expected fault, got {:?}", other),
    }

    assert_eq!(service.state(), EngineState::Idle);
    assert!(!service.is_running());
    assert!(service.devices().is_empty());
    assert!(!handle.is_active());
    handle.finished().await;

    // No removals for the cleared registry, no second fault
    assert_quiet(&events, Duration::from_secs(60)).await;

    let (transport, beacons) = ChannelTransport::new();
    let restarted = service
        .start_with_transport(Arc::new(transport))
        .await
        .unwrap();
    assert_ne!(restarted.run_id(), handle.run_id());
    assert_eq!(service.state(), EngineState::Running);

    send_beacon(&beacons, DEV1);
    assert_eq!(next_event(&events).await, DiscoveryEvent::Discovered(dev1()));

    service.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_start_is_idempotent() {
    let service = service();
    let (transport, _beacons) = ChannelTransport::new();
    let first = service
        .start_with_transport(Arc::new(transport))
        .await
        .unwrap();

    let (unused, unused_beacons) = ChannelTransport::new();
    let second = service
        .start_with_transport(Arc::new(unused))
        .await
        .unwrap();

    assert_eq!(first.run_id(), second.run_id());
    // The second transport was never used
    assert!(unused_beacons.send(Ok(Vec::new())).is_err());

    service.stop().await;
    assert!(!second.is_active());
}

#[tokio::test(start_paused = true)]
async fn test_stop_twice_is_noop() {
    let service = service();
    let (transport, _beacons) = ChannelTransport::new();
    service
        .start_with_transport(Arc::new(transport))
        .await
        .unwrap();

    service.stop().await;
    service.stop().await;
    assert_eq!(service.state(), EngineState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_every_subscriber_sees_every_event() {
    let service = service();
    let first = service.subscribe();
    let second = service.subscribe();
    let dropped = service.subscribe();
    drop(dropped);

    let (transport, beacons) = ChannelTransport::new();
    service
        .start_with_transport(Arc::new(transport))
        .await
        .unwrap();

    send_beacon(&beacons, DEV1);
    assert_eq!(next_event(&first).await, DiscoveryEvent::Discovered(dev1()));
    assert_eq!(next_event(&second).await, DiscoveryEvent::Discovered(dev1()));

    // A subscriber joining mid-run sees later events only
    let late = service.subscribe();
    send_beacon(&beacons, "DEV1 192.168.1.11 AA:BB:CC:DD:EE:FF");
    let moved = DeviceIdentity::new("DEV1", "192.168.1.11", "AA:BB:CC:DD:EE:FF");
    for events in [&first, &second, &late] {
        assert_eq!(next_event(events).await, DiscoveryEvent::Changed(moved.clone()));
    }

    service.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_per_device_order_with_interleaved_devices() {
    let service = service();
    let events = service.subscribe();
    let (transport, beacons) = ChannelTransport::new();
    service
        .start_with_transport(Arc::new(transport))
        .await
        .unwrap();

    send_beacon(&beacons, "A 10.0.0.1 AA:00:00:00:00:01");
    send_beacon(&beacons, "B 10.0.0.2 AA:00:00:00:00:02");
    send_beacon(&beacons, "A2 10.0.0.1 AA:00:00:00:00:01");
    send_beacon(&beacons, "B2 10.0.0.2 AA:00:00:00:00:02");

    let mut received = Vec::new();
    for _ in 0..4 {
        received.push(next_event(&events).await);
    }

    assert_eq!(
        received,
        vec![
            DiscoveryEvent::Discovered(DeviceIdentity::new("A", "10.0.0.1", "AA:00:00:00:00:01")),
            DiscoveryEvent::Discovered(DeviceIdentity::new("B", "10.0.0.2", "AA:00:00:00:00:02")),
            DiscoveryEvent::Changed(DeviceIdentity::new("A2", "10.0.0.1", "AA:00:00:00:00:01")),
            DiscoveryEvent::Changed(DeviceIdentity::new("B2", "10.0.0.2", "AA:00:00:00:00:02")),
        ]
    );

    service.stop().await;
}

#[tokio::test]
async fn test_socket_failure_is_returned_from_start() {
    let config = DiscoveryConfig {
        port: 47_808,
        interface: Ipv4Addr::new(192, 0, 2, 1),
        ..Default::default()
    };
    let service = DiscoveryService::new(config).unwrap();
    let events = service.subscribe();

    let err = service.start().await.unwrap_err();
    assert!(err.io_error().is_some());
    assert_eq!(service.state(), EngineState::Idle);
    assert!(events.try_recv().is_err());
}

use std::time::Duration;

use simpub_bus::ProxyState;

use crate::*;

#[test]
fn test_registry_converges_after_announcement() {
    let b = consumer("B");
    assert!(b.registry().get("A").is_none(), "nothing announced yet");

    let a = producer("A", &[&b], with_echo);
    let addrs = a.local_addrs().unwrap();

    assert!(
        wait_until(Duration::from_secs(2), || b.registry().contains("A")),
        "A never showed up in B's registry"
    );
    let info = b.registry().get("A").unwrap();
    assert_eq!(info.instance_id, a.instance_id());
    assert_eq!(info.topic_port, addrs.topic.port());
    assert_eq!(info.service_port, addrs.service.port());
    assert!(info.has_service("Echo"));
    assert!(info.has_service(simpub_bus::CHANGE_HOST_NAME));

    a.shutdown();
    b.shutdown();
}

#[test]
fn test_stopped_peer_expires() {
    let b = consumer("B");
    let a = producer("A", &[&b], with_echo);
    assert!(wait_until(Duration::from_secs(2), || b.registry().contains("A")));

    a.shutdown();
    // peer_ttl is 2 s for local configs.
    assert!(
        wait_until(Duration::from_secs(5), || !b.registry().contains("A")),
        "A should expire once it stops announcing"
    );
    b.shutdown();
}

#[test]
fn test_proxy_waits_for_discovery() {
    let b = consumer("B");
    let proxy = b.connect_to("A").unwrap();
    assert!(wait_until(Duration::from_secs(1), || {
        proxy.state() == ProxyState::AwaitingDiscovery
    }));
    assert!(matches!(
        proxy.request("Echo", "early"),
        Err(simpub_bus::BusError::NotConnected(_))
    ));

    let a = producer("A", &[&b], with_echo);
    proxy.wait_connected(CONNECT_WAIT).unwrap();
    assert_eq!(proxy.request("Echo", "late").unwrap().as_ref(), b"late");

    a.shutdown();
    b.shutdown();
}

#[test]
fn test_rename_moves_registry_entry() {
    let b = consumer("B");
    let a = producer("A", &[&b], with_echo);
    let proxy = b.connect_to("A").unwrap();
    proxy.wait_connected(CONNECT_WAIT).unwrap();

    proxy.rename("A-renamed").unwrap();
    assert_eq!(a.name(), "A-renamed");
    assert_eq!(proxy.name(), "A-renamed");
    assert!(b.registry().contains("A-renamed"));
    assert!(!b.registry().contains("A"));

    // Several announcement rounds later the old name has not come back.
    std::thread::sleep(Duration::from_millis(400));
    assert!(!b.registry().contains("A"));
    let info = b.registry().get("A-renamed").unwrap();
    assert_eq!(info.instance_id, a.instance_id());

    assert_eq!(proxy.request("Echo", "still here").unwrap().as_ref(), b"still here");

    a.shutdown();
    b.shutdown();
}

#[test]
fn test_rename_to_invalid_name_changes_nothing() {
    let b = consumer("B");
    let a = producer("A", &[&b], with_echo);
    let proxy = b.connect_to("A").unwrap();
    proxy.wait_connected(CONNECT_WAIT).unwrap();

    assert!(proxy.rename("bad:name").is_err());
    assert_eq!(a.name(), "A");
    assert_eq!(proxy.name(), "A");
    assert!(b.registry().contains("A"));

    a.shutdown();
    b.shutdown();
}

#[test]
fn test_two_consumers_see_the_same_producer() {
    let b = consumer("B");
    let c = consumer("C");
    let a = producer("A", &[&b, &c], with_echo);

    for bus in [&b, &c] {
        let proxy = bus.connect_to("A").unwrap();
        proxy.wait_connected(CONNECT_WAIT).unwrap();
        assert_eq!(proxy.request("Echo", bus.name()).unwrap().as_ref(), bus.name().as_bytes());
    }

    a.shutdown();
    b.shutdown();
    c.shutdown();
}

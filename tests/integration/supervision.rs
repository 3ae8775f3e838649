use std::time::Duration;

use simpub_bus::ProxyState;

use crate::topics::{collect, publish_until_seen};
use crate::*;

#[test]
fn test_proxy_reconnects_to_restarted_peer() {
    let b = consumer("B");
    let a = producer("A", &[&b], with_echo);
    let proxy = b.connect_to("A").unwrap();
    proxy.wait_connected(CONNECT_WAIT).unwrap();
    let first_instance = a.instance_id();
    assert_eq!(proxy.request("Echo", "one").unwrap().as_ref(), b"one");

    a.shutdown();
    assert!(wait_until(Duration::from_secs(2), || {
        proxy.state() != ProxyState::Connected
    }));

    // Same name, new instance, new ports.
    let a2 = producer("A", &[&b], with_echo);
    assert_ne!(a2.instance_id(), first_instance);

    assert!(
        wait_until(Duration::from_secs(10), || proxy.is_connected()),
        "proxy never came back, state {:?}",
        proxy.state()
    );
    let peer = proxy.peer_info().unwrap();
    assert_eq!(peer.instance_id, a2.instance_id());
    assert_eq!(proxy.request("Echo", "two").unwrap().as_ref(), b"two");

    a2.shutdown();
    b.shutdown();
}

#[test]
fn test_log_topic_is_wired_by_default() {
    let b = consumer("B");
    let a = producer("A", &[&b], |_| Ok(()));
    let proxy = b.connect_to("A").unwrap();
    proxy.wait_connected(CONNECT_WAIT).unwrap();

    // The built-in log callback is present; swap in one we can observe.
    assert!(proxy.remove_topic("A/Log"));
    let rx = collect(&proxy, "A/Log");
    let seen = publish_until_seen(&a, "A/Log", b"hello from A", &rx);
    assert_eq!(seen, b"hello from A");

    a.shutdown();
    b.shutdown();
}

#[test]
fn test_dropping_bus_stops_everything() {
    let b = consumer("B");
    let a = producer("A", &[&b], with_echo);
    let service = service_addr(&a);
    let proxy = b.connect_to("A").unwrap();
    proxy.wait_connected(CONNECT_WAIT).unwrap();

    drop(a);
    assert!(
        wait_until(Duration::from_secs(2), || raw_request(service, b"Echo:x").is_err()),
        "service socket still answering after drop"
    );
    assert!(wait_until(Duration::from_secs(2), || !proxy.is_connected()));

    drop(proxy);
    b.shutdown();
}

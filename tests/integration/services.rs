use std::net::TcpStream;
use std::time::{Duration, Instant};

use simpub_bus::{BusError, ProxyState};
use simpub_core::wire::{join_frame, parse_error_reply, ERROR_REPLY_PREFIX};

use crate::*;

#[test]
fn test_echo_round_trip() {
    let b = consumer("B");
    let a = producer("A", &[&b], with_echo);
    let proxy = b.connect_to("A").unwrap();
    proxy.wait_connected(CONNECT_WAIT).unwrap();

    let reply = proxy.request("Echo", "hello").unwrap();
    assert_eq!(reply.as_ref(), b"hello");

    a.shutdown();
    b.shutdown();
}

#[test]
fn test_unadvertised_service_is_refused_locally() {
    let b = consumer("B");
    let a = producer("A", &[&b], with_echo);
    let proxy = b.connect_to("A").unwrap();
    proxy.wait_connected(CONNECT_WAIT).unwrap();

    match proxy.request("DoesNotExist", "x") {
        Err(BusError::UnsupportedService { peer, service }) => {
            assert_eq!(peer, "A");
            assert_eq!(service, "DoesNotExist");
        }
        other => panic!("expected UnsupportedService, got {other:?}"),
    }
    assert_eq!(proxy.request("Echo", "after").unwrap().as_ref(), b"after");

    a.shutdown();
    b.shutdown();
}

#[test]
fn test_unknown_service_gets_failure_reply() {
    let a = producer("A", &[], with_echo);
    let addr = service_addr(&a);

    let mut stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

    let reply = raw_exchange(&mut stream, b"DoesNotExist:x").unwrap();
    assert!(reply.starts_with(ERROR_REPLY_PREFIX));
    let reason = parse_error_reply(&reply).unwrap();
    assert!(reason.contains("DoesNotExist"), "reason was {reason:?}");

    // Same connection keeps working.
    let reply = raw_exchange(&mut stream, b"Echo:ok").unwrap();
    assert_eq!(reply, b"ok");

    a.shutdown();
}

#[test]
fn test_malformed_request_gets_failure_reply() {
    let a = producer("A", &[], with_echo);
    let reply = raw_request(service_addr(&a), b"no delimiter here").unwrap();
    assert!(parse_error_reply(&reply).is_some());
    a.shutdown();
}

#[test]
fn test_handler_error_becomes_remote_error() {
    let b = consumer("B");
    let a = producer("A", &[&b], |bus| {
        bus.register_service("Fails", |_, _| anyhow::bail!("disk on fire"))?;
        with_echo(bus)
    });
    let proxy = b.connect_to("A").unwrap();
    proxy.wait_connected(CONNECT_WAIT).unwrap();

    match proxy.request("Fails", "") {
        Err(BusError::Remote(reason)) => assert!(reason.contains("disk on fire")),
        other => panic!("expected Remote, got {other:?}"),
    }
    assert_eq!(proxy.request("Echo", "fine").unwrap().as_ref(), b"fine");

    a.shutdown();
    b.shutdown();
}

#[test]
fn test_payload_keeps_delimiters() {
    let b = consumer("B");
    let a = producer("A", &[&b], with_echo);
    let proxy = b.connect_to("A").unwrap();
    proxy.wait_connected(CONNECT_WAIT).unwrap();

    let payload = b"a:b::c:".to_vec();
    assert_eq!(proxy.request("Echo", &payload).unwrap().as_ref(), payload.as_slice());

    a.shutdown();
    b.shutdown();
}

#[test]
fn test_concurrent_requests_match_in_order() {
    let b = consumer("B");
    let a = producer("A", &[&b], with_echo);
    let proxy = b.connect_to("A").unwrap();
    proxy.wait_connected(CONNECT_WAIT).unwrap();

    let handles: Vec<_> = (0..16)
        .map(|i| proxy.request_async("Echo", format!("req-{i}")).unwrap())
        .collect();

    for (i, handle) in handles.into_iter().enumerate() {
        let reply = handle.result(Some(Duration::from_secs(10))).unwrap().unwrap();
        assert_eq!(reply.as_ref(), format!("req-{i}").as_bytes());
    }

    a.shutdown();
    b.shutdown();
}

#[test]
fn test_requests_from_threads_are_never_crossed() {
    let b = consumer("B");
    let a = producer("A", &[&b], with_echo);
    let proxy = b.connect_to("A").unwrap();
    proxy.wait_connected(CONNECT_WAIT).unwrap();

    std::thread::scope(|s| {
        for t in 0..4 {
            let proxy = &proxy;
            s.spawn(move || {
                for i in 0..25 {
                    let payload = format!("t{t}-{i}");
                    let reply = proxy.request("Echo", &payload).unwrap();
                    assert_eq!(reply.as_ref(), payload.as_bytes());
                }
            });
        }
    });

    a.shutdown();
    b.shutdown();
}

#[test]
fn test_slow_handler_holds_up_fast_one() {
    let a = producer("A", &[], |bus| {
        bus.register_service("Slow", |_, reply| {
            std::thread::sleep(Duration::from_secs(2));
            reply.send_text("slow");
            Ok(())
        })?;
        bus.register_service("Fast", |_, reply| {
            reply.send_text("fast");
            Ok(())
        })?;
        Ok(())
    });
    let addr = service_addr(&a);

    let start = Instant::now();
    let slow = std::thread::spawn(move || raw_request(addr, &join_frame("Slow", b"")));
    std::thread::sleep(Duration::from_millis(100));
    let fast = std::thread::spawn(move || {
        let reply = raw_request(addr, &join_frame("Fast", b""));
        (reply, start.elapsed())
    });

    let (fast_reply, fast_done) = fast.join().unwrap();
    assert_eq!(fast_reply.unwrap(), b"fast");
    assert_eq!(slow.join().unwrap().unwrap(), b"slow");
    assert!(
        fast_done >= Duration::from_millis(1_500),
        "Fast finished after {fast_done:?}, before Slow released the endpoint"
    );

    a.shutdown();
}

#[test]
fn test_request_times_out_then_proxy_recovers() {
    let b = consumer_with("B", |config| config.proxy.request_timeout_ms = 300);
    let a = producer("A", &[&b], |bus| {
        bus.register_service("Sleepy", |_, reply| {
            std::thread::sleep(Duration::from_secs(1));
            reply.send_text("late");
            Ok(())
        })?;
        with_echo(bus)
    });
    let proxy = b.connect_to("A").unwrap();
    proxy.wait_connected(CONNECT_WAIT).unwrap();

    let start = Instant::now();
    assert!(matches!(proxy.request("Sleepy", ""), Err(BusError::Timeout(_))));
    assert!(start.elapsed() < Duration::from_secs(1));

    // Let the endpoint finish Sleepy before it can serve anything else.
    std::thread::sleep(Duration::from_millis(1_200));
    assert_eq!(proxy.request("Echo", "after").unwrap().as_ref(), b"after");
    assert_eq!(proxy.state(), ProxyState::Connected);

    a.shutdown();
    b.shutdown();
}

#[test]
fn test_requests_fail_after_producer_stops() {
    let b = consumer("B");
    let a = producer("A", &[&b], with_echo);
    let proxy = b.connect_to("A").unwrap();
    proxy.wait_connected(CONNECT_WAIT).unwrap();

    a.shutdown();
    assert!(wait_until(Duration::from_secs(2), || {
        proxy.state() != ProxyState::Connected
    }));
    assert!(proxy.request("Echo", "gone").is_err());

    b.shutdown();
}

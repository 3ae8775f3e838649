use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use serde_json::{json, Value};
use simpub_bus::RemotePeer;

use crate::*;

/// Collect every payload a proxy receives on `topic`.
pub fn collect(proxy: &RemotePeer, topic: &str) -> mpsc::Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    proxy.on_topic(topic, move |payload| {
        let _ = tx.lock().unwrap().send(payload.to_vec());
    });
    rx
}

/// Publish `payload` under `topic` until the subscriber has seen it.
pub fn publish_until_seen(bus: &Bus, topic: &str, payload: &[u8], rx: &mpsc::Receiver<Vec<u8>>) -> Vec<u8> {
    for _ in 0..200 {
        bus.publish(topic, payload).unwrap();
        if let Ok(seen) = rx.recv_timeout(Duration::from_millis(25)) {
            return seen;
        }
    }
    panic!("subscriber never saw {topic}");
}

#[test]
fn test_scene_update_json_reaches_subscriber() {
    let b = consumer("B");
    let a = producer("A", &[&b], |bus| {
        bus.register_json_topic("scene update", || json!({"qpos": [0.1, 0.2]}))?;
        Ok(())
    });
    let proxy = b.connect_to("A").unwrap();
    let rx = collect(&proxy, "scene update");
    proxy.wait_connected(CONNECT_WAIT).unwrap();

    let payload = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let decoded: Value = serde_json::from_slice(&payload).unwrap();
    assert_eq!(decoded, json!({"qpos": [0.1, 0.2]}));

    a.shutdown();
    b.shutdown();
}

#[test]
fn test_payload_with_delimiters_arrives_intact() {
    let b = consumer("B");
    let a = producer("A", &[&b], |_| Ok(()));
    let proxy = b.connect_to("A").unwrap();
    let rx = collect(&proxy, "X");
    proxy.wait_connected(CONNECT_WAIT).unwrap();

    let payload = b"key:value:with::colons\0and bytes \xff";
    let seen = publish_until_seen(&a, "X", payload, &rx);
    assert_eq!(seen, payload.to_vec());

    a.shutdown();
    b.shutdown();
}

#[test]
fn test_topics_are_isolated() {
    let b = consumer("B");
    let a = producer("A", &[&b], |_| Ok(()));
    let proxy = b.connect_to("A").unwrap();

    let t1_hits = Arc::new(AtomicUsize::new(0));
    {
        let hits = t1_hits.clone();
        proxy.on_topic("T1", move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
        });
    }
    let rx = collect(&proxy, "T2");
    proxy.wait_connected(CONNECT_WAIT).unwrap();

    publish_until_seen(&a, "T2", b"only T2", &rx);
    for _ in 0..20 {
        a.publish("T2", b"only T2").unwrap();
    }
    std::thread::sleep(Duration::from_millis(200));

    assert_eq!(t1_hits.load(Ordering::SeqCst), 0);
    assert!(rx.try_iter().count() > 0);

    a.shutdown();
    b.shutdown();
}

#[test]
fn test_single_topic_order_is_preserved() {
    let b = consumer("B");
    let a = producer("A", &[&b], |_| Ok(()));
    let proxy = b.connect_to("A").unwrap();
    let rx = collect(&proxy, "Seq");
    proxy.wait_connected(CONNECT_WAIT).unwrap();

    publish_until_seen(&a, "Seq", b"warmup", &rx);
    while rx.try_recv().is_ok() {}

    for i in 0..50u32 {
        a.publish("Seq", i.to_be_bytes()).unwrap();
    }

    let mut received = Vec::new();
    while received.len() < 50 {
        let payload = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        if payload.len() == 4 {
            received.push(u32::from_be_bytes(payload.try_into().unwrap()));
        }
    }
    assert_eq!(received, (0..50).collect::<Vec<_>>());

    a.shutdown();
    b.shutdown();
}

#[test]
fn test_callback_replacement_takes_effect() {
    let b = consumer("B");
    let a = producer("A", &[&b], |_| Ok(()));
    let proxy = b.connect_to("A").unwrap();

    let first = collect(&proxy, "X");
    let second = collect(&proxy, "X");
    proxy.wait_connected(CONNECT_WAIT).unwrap();

    publish_until_seen(&a, "X", b"v", &second);
    assert!(first.try_recv().is_err(), "replaced callback must not fire");

    assert!(proxy.remove_topic("X"));
    while second.try_recv().is_ok() {}
    a.publish("X", b"after removal").unwrap();
    std::thread::sleep(Duration::from_millis(100));
    assert!(second.try_recv().is_err());

    a.shutdown();
    b.shutdown();
}

#[test]
fn test_producer_topic_streams_on_its_own_tick() {
    let b = consumer("B");
    let ticks = Arc::new(AtomicUsize::new(0));
    let a = {
        let ticks = ticks.clone();
        producer("A", &[&b], move |bus| {
            bus.register_topic_every("Counter", Duration::from_millis(10), move || {
                let n = ticks.fetch_add(1, Ordering::SeqCst);
                Ok(Bytes::from(n.to_string()))
            })?;
            Ok(())
        })
    };
    let proxy = b.connect_to("A").unwrap();
    let rx = collect(&proxy, "Counter");
    proxy.wait_connected(CONNECT_WAIT).unwrap();

    let mut last = None;
    for _ in 0..5 {
        let payload = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let n: usize = String::from_utf8(payload).unwrap().parse().unwrap();
        if let Some(prev) = last {
            assert!(n > prev);
        }
        last = Some(n);
    }

    a.shutdown();
    b.shutdown();
}

//! simpub integration test harness.
//!
//! Every test runs two or more buses inside this process over loopback.
//! Discovery uses unicast targets: the consumer bus starts first, and the
//! producer announces straight to the consumer's discovery socket, so
//! tests never depend on broadcast routing and never collide on ports.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use simpub_bus::Bus;
use simpub_core::SimpubConfig;

mod discovery;
mod services;
mod supervision;
mod topics;

// ── Harness ───────────────────────────────────────────────────────────────────

pub const CONNECT_WAIT: Duration = Duration::from_secs(5);

/// Start a bus that listens for announcements but never announces.
pub fn consumer(name: &str) -> Bus {
    consumer_with(name, |_| {})
}

/// Like [`consumer`], with `tweak` applied to the config before start.
pub fn consumer_with<F: FnOnce(&mut SimpubConfig)>(name: &str, tweak: F) -> Bus {
    let mut config = SimpubConfig::local(name);
    config.discovery.announce = false;
    tweak(&mut config);
    let bus = Bus::new(config);
    bus.start().expect("consumer bus should start");
    bus
}

/// Build a bus that announces to each of `listeners`. Registration happens
/// in `setup` before the bus is started.
pub fn producer<F>(name: &str, listeners: &[&Bus], setup: F) -> Bus
where
    F: FnOnce(&Bus) -> Result<()>,
{
    let mut config = SimpubConfig::local(name);
    config.discovery.listen = false;
    config.discovery.targets = listeners
        .iter()
        .map(|bus| discovery_addr(bus))
        .collect();
    let bus = Bus::new(config);
    setup(&bus).expect("producer setup should succeed");
    bus.start().expect("producer bus should start");
    bus
}

pub fn discovery_addr(bus: &Bus) -> SocketAddr {
    bus.local_addrs()
        .and_then(|a| a.discovery)
        .expect("listening bus has a discovery socket")
}

pub fn service_addr(bus: &Bus) -> SocketAddr {
    bus.local_addrs().expect("bus is running").service
}

/// Register an `Echo` service replying with its input.
pub fn with_echo(bus: &Bus) -> Result<()> {
    bus.register_service("Echo", |payload, reply| {
        reply.send(payload.to_vec());
        Ok(())
    })?;
    Ok(())
}

/// Poll `cond` every 10 ms until it holds or `timeout` passes.
pub fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut cond: F) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

/// One lock-step exchange on a plain TCP connection, framed the way the
/// bus frames it: 4-byte big-endian length, then the bytes.
pub fn raw_exchange(stream: &mut TcpStream, frame: &[u8]) -> Result<Vec<u8>> {
    stream.write_all(&(frame.len() as u32).to_be_bytes())?;
    stream.write_all(frame)?;
    stream.flush()?;

    let mut len = [0u8; 4];
    stream.read_exact(&mut len).context("reading reply length")?;
    let mut reply = vec![0u8; u32::from_be_bytes(len) as usize];
    stream.read_exact(&mut reply).context("reading reply body")?;
    Ok(reply)
}

pub fn raw_request(addr: SocketAddr, frame: &[u8]) -> Result<Vec<u8>> {
    let mut stream = TcpStream::connect(addr)?;
    stream.set_read_timeout(Some(Duration::from_secs(10)))?;
    raw_exchange(&mut stream, frame)
}

// ── Harness self-checks ───────────────────────────────────────────────────────

#[test]
fn test_wait_until_times_out() {
    let start = Instant::now();
    assert!(!wait_until(Duration::from_millis(50), || false));
    assert!(start.elapsed() >= Duration::from_millis(50));
    assert!(wait_until(Duration::from_millis(50), || true));
}

#[test]
fn test_consumer_binds_discovery_on_loopback() {
    let bus = consumer("harness");
    let addr = discovery_addr(&bus);
    assert!(addr.ip().is_loopback());
    assert_ne!(addr.port(), 0);
    bus.shutdown();
}

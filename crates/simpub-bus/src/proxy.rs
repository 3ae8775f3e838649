//! Remote peer proxy: the client side of one discovered peer.
//!
//! A proxy waits for its peer to show up in the registry, then connects a
//! subscribe socket to the peer's topic port and dispatches incoming frames
//! to per-topic callbacks. Requests go over a second, lazily connected
//! socket to the peer's service port.
//!
//! The subscribe side runs under the supervisor: a dropped connection sends
//! the proxy back through discovery with backoff, and a long enough run of
//! failures parks it in `Disconnected` until [`RemotePeer::reconnect`].
//!
//! The background session only holds a weak reference, so dropping the
//! last `RemotePeer` handle stops it.

use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};

use anyhow::Context;
use bytes::Bytes;
use dashmap::DashMap;
use simpub_core::config::ProxyConfig;
use simpub_core::wire::{join_frame, parse_error_reply, split_frame, validate_name};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch, Mutex};

use crate::bridge::{TaskBridge, TaskHandle};
use crate::error::{BusError, BusResult};
use crate::framing::{read_frame, write_frame};
use crate::registry::{PeerInfo, PeerRegistry};
use crate::supervisor::{supervise, Attempt, RestartPolicy, SupervisorExit};
use crate::CHANGE_HOST_NAME;

/// Handles a topic payload. Runs on the event loop; keep it short.
pub type TopicCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Extra time the caller waits beyond the request timeout, so the loop
/// side times out first and discards the connection.
const CALL_GRACE: Duration = Duration::from_secs(1);

/// A silent subscribe session that lasted this long still counts as a
/// successful connection.
const STABLE_SESSION: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    /// Not trying to reach the peer. Initial state, and where a proxy ends
    /// up after the supervisor gives up.
    Disconnected,
    /// Waiting for the peer's registry entry, or between reconnects.
    AwaitingDiscovery,
    /// Subscribe socket is up.
    Connected,
}

/// Cloneable handle to one remote peer.
#[derive(Clone)]
pub struct RemotePeer {
    inner: Arc<ProxyInner>,
}

struct ProxyInner {
    name: RwLock<String>,
    registry: PeerRegistry,
    bridge: TaskBridge,
    config: ProxyConfig,
    state: watch::Sender<ProxyState>,
    peer: RwLock<Option<PeerInfo>>,
    callbacks: DashMap<String, TopicCallback>,
    request_conn: Mutex<Option<(SocketAddr, TcpStream)>>,
    running: AtomicBool,
    /// Bus-wide shutdown.
    shutdown: broadcast::Sender<()>,
    /// Dropped with the proxy, which stops the session.
    stop: broadcast::Sender<()>,
}

impl RemotePeer {
    pub(crate) fn new(
        name: &str,
        registry: PeerRegistry,
        bridge: TaskBridge,
        config: ProxyConfig,
        shutdown: broadcast::Sender<()>,
    ) -> BusResult<Self> {
        let (state, _) = watch::channel(ProxyState::Disconnected);
        let (stop, _) = broadcast::channel(1);
        let peer = Self {
            inner: Arc::new(ProxyInner {
                name: RwLock::new(name.to_string()),
                registry,
                bridge,
                config,
                state,
                peer: RwLock::new(None),
                callbacks: DashMap::new(),
                request_conn: Mutex::new(None),
                running: AtomicBool::new(false),
                shutdown,
                stop,
            }),
        };
        peer.register_log_callback(name);
        peer.start_session()?;
        Ok(peer)
    }

    /// Current display name of the peer.
    pub fn name(&self) -> String {
        self.inner.name()
    }

    pub fn state(&self) -> ProxyState {
        *self.inner.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ProxyState::Connected
    }

    /// What the peer advertised when we last connected.
    pub fn peer_info(&self) -> Option<PeerInfo> {
        self.inner
            .peer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Block until the subscribe socket is up or `timeout` passes.
    pub fn wait_connected(&self, timeout: Duration) -> BusResult<()> {
        let mut rx = self.inner.state.subscribe();
        self.inner.bridge.call(
            async move {
                match tokio::time::timeout(timeout, rx.wait_for(|s| *s == ProxyState::Connected))
                    .await
                {
                    Ok(Ok(_)) => Ok(()),
                    Ok(Err(_)) => Err(BusError::Closed),
                    Err(_) => Err(BusError::Timeout(timeout)),
                }
            },
            None,
        )?
    }

    /// Register the callback for `topic`. Replaces any earlier callback for
    /// the same topic.
    pub fn on_topic<F>(&self, topic: &str, callback: F)
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        if self
            .inner
            .callbacks
            .insert(topic.to_string(), Arc::new(callback))
            .is_some()
        {
            tracing::debug!(peer = %self.name(), topic, "topic callback replaced");
        }
    }

    /// Remove the callback for `topic`. Later frames for it are ignored.
    pub fn remove_topic(&self, topic: &str) -> bool {
        self.inner.callbacks.remove(topic).is_some()
    }

    /// Send `"<service>:<payload>"` to the peer and block for the reply.
    ///
    /// Fails fast with [`BusError::NotConnected`] before the peer has been
    /// reached and with [`BusError::UnsupportedService`] when the peer never
    /// advertised `service`. A failure reply from the peer becomes
    /// [`BusError::Remote`].
    pub fn request(&self, service: &str, payload: impl AsRef<[u8]>) -> BusResult<Bytes> {
        let timeout = self.inner.config.request_timeout();
        self.request_async(service, payload)?
            .result(Some(timeout + CALL_GRACE))?
    }

    /// Like [`request`](Self::request) without blocking.
    pub fn request_async(
        &self,
        service: &str,
        payload: impl AsRef<[u8]>,
    ) -> BusResult<TaskHandle<BusResult<Bytes>>> {
        validate_name(service)?;
        let name = self.name();

        if self.state() != ProxyState::Connected {
            tracing::warn!(peer = %name, service, "request before peer is connected");
            return Err(BusError::NotConnected(name));
        }

        let peer = self
            .inner
            .registry
            .get(&name)
            .or_else(|| self.peer_info())
            .ok_or_else(|| BusError::NotConnected(name.clone()))?;

        if !peer.has_service(service) {
            tracing::warn!(peer = %name, service, "peer does not offer this service");
            return Err(BusError::UnsupportedService {
                peer: name,
                service: service.to_string(),
            });
        }

        let frame = join_frame(service, payload.as_ref());
        let inner = self.inner.clone();
        let service = service.to_string();
        self.inner
            .bridge
            .submit(async move { inner.exchange(peer.service_addr(), &service, frame).await })
    }

    /// Ask the peer to adopt `new_name`, then move our registry entry.
    ///
    /// The remote side goes first. If it refuses, nothing changes locally.
    /// If it accepts but the local move fails (say the entry already
    /// expired), the proxy still follows the new name and picks the peer up
    /// again from its next announcement.
    pub fn rename(&self, new_name: &str) -> BusResult<()> {
        validate_name(new_name)?;
        let old = self.name();
        if old == new_name {
            return Ok(());
        }

        self.request(CHANGE_HOST_NAME, new_name)?;

        // Registry moves happen on the loop, like every discovery update.
        let registry = self.inner.registry.clone();
        let (from, to) = (old.clone(), new_name.to_string());
        let moved = self
            .inner
            .bridge
            .call(async move { registry.rename(&from, &to) }, None)
            .and_then(|r| r);
        if let Err(e) = moved {
            tracing::warn!(
                from = %old,
                to = new_name,
                error = %e,
                "peer accepted rename but local registry move failed"
            );
        }

        *self.inner.name.write().unwrap_or_else(PoisonError::into_inner) = new_name.to_string();
        self.inner.callbacks.remove(&log_topic(&old));
        self.register_log_callback(new_name);
        tracing::info!(from = %old, to = new_name, "peer renamed");
        Ok(())
    }

    /// Re-arm a proxy the supervisor gave up on. No-op while it is running.
    pub fn reconnect(&self) -> BusResult<()> {
        self.start_session()
    }

    fn register_log_callback(&self, name: &str) {
        let peer = name.to_string();
        self.on_topic(&log_topic(name), move |payload| {
            tracing::info!(peer = %peer, "{}", String::from_utf8_lossy(payload));
        });
    }

    fn start_session(&self) -> BusResult<()> {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.set_state(ProxyState::AwaitingDiscovery);

        let weak = Arc::downgrade(&self.inner);
        let policy = RestartPolicy::from_config(&self.inner.config);
        let label = format!("proxy:{}", self.name());
        let mut bus_shutdown = self.inner.shutdown.subscribe();
        let stop = self.inner.stop.subscribe();

        let spawned = self.inner.bridge.spawn_detached(async move {
            let exit = tokio::select! {
                _ = bus_shutdown.recv() => SupervisorExit::Stopped,
                exit = supervise(&label, policy, stop, || run_session(weak.clone())) => exit,
            };

            let Some(inner) = weak.upgrade() else { return };
            inner.running.store(false, Ordering::Release);
            match exit {
                SupervisorExit::GaveUp { failures, last_error } => {
                    tracing::error!(
                        peer = %inner.name(),
                        failures,
                        error = %last_error,
                        "peer unreachable, proxy disconnected"
                    );
                    inner.set_state(ProxyState::Disconnected);
                }
                SupervisorExit::Stopped | SupervisorExit::Finished => {
                    inner.set_state(ProxyState::Disconnected);
                }
            }
        });

        if spawned.is_err() {
            self.inner.running.store(false, Ordering::Release);
            self.inner.set_state(ProxyState::Disconnected);
        }
        spawned
    }
}

impl ProxyInner {
    fn name(&self) -> String {
        self.name.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn set_state(&self, next: ProxyState) {
        let changed = self.state.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            *state = next;
            true
        });
        if changed {
            tracing::debug!(peer = %self.name(), state = ?next, "proxy state changed");
        }
    }

    fn dispatch_topic(&self, frame: &[u8]) {
        let (topic, payload) = match split_frame(frame) {
            Ok(parts) => parts,
            Err(e) => {
                tracing::warn!(peer = %self.name(), error = %e, "malformed topic frame");
                return;
            }
        };

        let Some(callback) = self.callbacks.get(topic).map(|c| c.value().clone()) else {
            return;
        };

        if catch_unwind(AssertUnwindSafe(|| callback(payload))).is_err() {
            tracing::error!(peer = %self.name(), topic, "topic callback panicked");
        }
    }

    /// One lock-step exchange on the request socket. Runs on the loop.
    async fn exchange(&self, addr: SocketAddr, service: &str, frame: Vec<u8>) -> BusResult<Bytes> {
        let timeout = self.config.request_timeout();
        let mut conn = self.request_conn.lock().await;

        let outcome = tokio::time::timeout(timeout, exchange_on(&mut conn, addr, &frame)).await;
        let reply = match outcome {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                *conn = None;
                tracing::warn!(peer = %self.name(), service, error = %e, "request failed");
                return Err(BusError::Transport(e));
            }
            Err(_) => {
                // The reply may still arrive; the socket can't be reused.
                *conn = None;
                tracing::warn!(peer = %self.name(), service, "request timed out");
                return Err(BusError::Timeout(timeout));
            }
        };

        match parse_error_reply(&reply) {
            Some(reason) => {
                tracing::warn!(peer = %self.name(), service, reason = %reason, "peer returned failure");
                Err(BusError::Remote(reason))
            }
            None => Ok(reply),
        }
    }
}

async fn exchange_on(
    conn: &mut Option<(SocketAddr, TcpStream)>,
    addr: SocketAddr,
    frame: &[u8],
) -> std::io::Result<Bytes> {
    if conn.as_ref().map(|(a, _)| *a) != Some(addr) {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        *conn = Some((addr, stream));
    }
    let Some((_, stream)) = conn.as_mut() else {
        return Err(std::io::Error::new(std::io::ErrorKind::NotConnected, "no request socket"));
    };

    write_frame(stream, frame).await?;
    read_frame(stream).await?.ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "peer closed the request connection",
        )
    })
}

/// One supervised run: discover, connect, receive until the stream breaks.
async fn run_session(weak: Weak<ProxyInner>) -> Attempt {
    let peer = loop {
        let Some(inner) = weak.upgrade() else { return Attempt::Finished };
        if let Some(peer) = inner.registry.get(&inner.name()) {
            break peer;
        }
        inner.set_state(ProxyState::AwaitingDiscovery);
        let poll = inner.config.discovery_poll();
        drop(inner);
        tokio::time::sleep(poll).await;
    };

    let addr = peer.topic_addr();
    let mut stream = match TcpStream::connect(addr)
        .await
        .with_context(|| format!("connect subscribe socket to {} at {addr}", peer.name))
    {
        Ok(s) => s,
        Err(error) => {
            return Attempt::Failed {
                progressed: false,
                error,
            }
        }
    };
    let _ = stream.set_nodelay(true);

    {
        let Some(inner) = weak.upgrade() else { return Attempt::Finished };
        tracing::info!(peer = %peer.name, %addr, "connected to peer");
        *inner.peer.write().unwrap_or_else(PoisonError::into_inner) = Some(peer);
        inner.set_state(ProxyState::Connected);
    }

    // A connection that closes at once without delivering a frame does
    // not reset the restart count.
    let connected_at = Instant::now();
    let mut received_any = false;
    let error = loop {
        let frame = match read_frame(&mut stream).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break anyhow::anyhow!("peer closed the topic stream"),
            Err(e) => break anyhow::Error::new(e).context("topic stream failed"),
        };
        received_any = true;
        let Some(inner) = weak.upgrade() else { return Attempt::Finished };
        inner.dispatch_topic(&frame);
    };

    if let Some(inner) = weak.upgrade() {
        inner.set_state(ProxyState::AwaitingDiscovery);
    }
    Attempt::Failed {
        progressed: received_any || connected_at.elapsed() >= STABLE_SESSION,
        error,
    }
}

fn log_topic(peer: &str) -> String {
    format!("{peer}/Log")
}

#[cfg(test)]
mod tests {
    use super::*;
    use simpub_core::Announcement;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use tokio::net::TcpListener;

    struct FakePeer {
        topic_port: u16,
        service_port: u16,
        frames: tokio::sync::broadcast::Sender<Bytes>,
    }

    /// A peer with a topic socket that forwards `frames`, and a service
    /// socket that echoes whatever follows the delimiter.
    fn fake_peer(bridge: &TaskBridge) -> FakePeer {
        bridge
            .call(
                async {
                    let topics = TcpListener::bind("127.0.0.1:0").await.unwrap();
                    let services = TcpListener::bind("127.0.0.1:0").await.unwrap();
                    let (frames, _) = tokio::sync::broadcast::channel::<Bytes>(16);
                    let peer = FakePeer {
                        topic_port: topics.local_addr().unwrap().port(),
                        service_port: services.local_addr().unwrap().port(),
                        frames: frames.clone(),
                    };

                    tokio::spawn(async move {
                        while let Ok((mut stream, _)) = topics.accept().await {
                            let mut rx = frames.subscribe();
                            tokio::spawn(async move {
                                while let Ok(frame) = rx.recv().await {
                                    if write_frame(&mut stream, &frame).await.is_err() {
                                        return;
                                    }
                                }
                            });
                        }
                    });
                    tokio::spawn(async move {
                        while let Ok((mut stream, _)) = services.accept().await {
                            tokio::spawn(async move {
                                while let Ok(Some(frame)) = read_frame(&mut stream).await {
                                    let (_, payload) = split_frame(&frame).unwrap();
                                    let payload = payload.to_vec();
                                    if write_frame(&mut stream, &payload).await.is_err() {
                                        return;
                                    }
                                }
                            });
                        }
                    });
                    peer
                },
                None,
            )
            .unwrap()
    }

    fn announce(registry: &PeerRegistry, name: &str, peer: &FakePeer) {
        registry.upsert(
            &Announcement {
                instance_id: 77,
                name: name.into(),
                addr: "127.0.0.1".parse().unwrap(),
                topic_port: peer.topic_port,
                service_port: peer.service_port,
                services: vec!["Echo".into(), CHANGE_HOST_NAME.into()],
                topics: vec!["X".into()],
            },
            "127.0.0.1".parse().unwrap(),
        );
    }

    fn proxy(name: &str, registry: &PeerRegistry, bridge: &TaskBridge) -> RemotePeer {
        proxy_with(name, registry, bridge, ProxyConfig::default())
    }

    fn proxy_with(
        name: &str,
        registry: &PeerRegistry,
        bridge: &TaskBridge,
        config: ProxyConfig,
    ) -> RemotePeer {
        let (shutdown, _) = broadcast::channel(1);
        RemotePeer::new(name, registry.clone(), bridge.clone(), config, shutdown).unwrap()
    }

    /// A peer whose topic socket accepts and immediately hangs up.
    fn slamming_peer(bridge: &TaskBridge, accepted: Arc<AtomicUsize>) -> FakePeer {
        bridge
            .call(
                async move {
                    let topics = TcpListener::bind("127.0.0.1:0").await.unwrap();
                    let (frames, _) = tokio::sync::broadcast::channel::<Bytes>(1);
                    let peer = FakePeer {
                        topic_port: topics.local_addr().unwrap().port(),
                        service_port: 1,
                        frames,
                    };
                    tokio::spawn(async move {
                        while let Ok((stream, _)) = topics.accept().await {
                            accepted.fetch_add(1, Ordering::SeqCst);
                            drop(stream);
                        }
                    });
                    peer
                },
                None,
            )
            .unwrap()
    }

    #[test]
    fn waits_for_discovery_then_connects() {
        let bridge = TaskBridge::spawn("proxy-test").unwrap();
        let registry = PeerRegistry::default();
        let peer = fake_peer(&bridge);
        let remote = proxy("sim", &registry, &bridge);

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(remote.state(), ProxyState::AwaitingDiscovery);
        assert!(matches!(
            remote.request("Echo", "hello"),
            Err(BusError::NotConnected(_))
        ));

        announce(&registry, "sim", &peer);
        remote.wait_connected(Duration::from_secs(2)).unwrap();
        assert_eq!(remote.peer_info().unwrap().topic_port, peer.topic_port);
        bridge.shutdown();
    }

    #[test]
    fn request_round_trip_and_unsupported_service() {
        let bridge = TaskBridge::spawn("proxy-test").unwrap();
        let registry = PeerRegistry::default();
        let peer = fake_peer(&bridge);
        announce(&registry, "sim", &peer);
        let remote = proxy("sim", &registry, &bridge);
        remote.wait_connected(Duration::from_secs(2)).unwrap();

        assert_eq!(remote.request("Echo", "hello").unwrap(), Bytes::from("hello"));
        assert_eq!(remote.request("Echo", b"a:b").unwrap(), Bytes::from("a:b"));
        assert!(matches!(
            remote.request("Asset", "mesh-1"),
            Err(BusError::UnsupportedService { service, .. }) if service == "Asset"
        ));
        bridge.shutdown();
    }

    #[test]
    fn topic_callbacks_dispatch_by_name() {
        let bridge = TaskBridge::spawn("proxy-test").unwrap();
        let registry = PeerRegistry::default();
        let peer = fake_peer(&bridge);
        announce(&registry, "sim", &peer);
        let remote = proxy("sim", &registry, &bridge);

        let (tx, rx) = mpsc::channel::<Vec<u8>>();
        let first = tx.clone();
        remote.on_topic("X", move |_| first.send(b"first".to_vec()).unwrap());
        // Last registration wins.
        remote.on_topic("X", move |payload| tx.send(payload.to_vec()).unwrap());
        remote.wait_connected(Duration::from_secs(2)).unwrap();

        let frames = peer.frames.clone();
        // Wait for the fake peer to attach our subscriber.
        while frames.receiver_count() == 0 {
            std::thread::sleep(Duration::from_millis(5));
        }
        frames.send(Bytes::from(join_frame("Y", b"ignored"))).unwrap();
        frames.send(Bytes::from_static(b"no delimiter")).unwrap();
        frames.send(Bytes::from(join_frame("X", b"p:1"))).unwrap();

        let got = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(got, b"p:1");
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        bridge.shutdown();
    }

    #[test]
    fn connect_then_hangup_exhausts_restarts() {
        let bridge = TaskBridge::spawn("proxy-test").unwrap();
        let registry = PeerRegistry::default();
        let accepted = Arc::new(AtomicUsize::new(0));
        let peer = slamming_peer(&bridge, accepted.clone());
        announce(&registry, "sim", &peer);

        let config = ProxyConfig {
            restart_base_ms: 1,
            restart_max_ms: 4,
            max_restarts: 3,
            ..ProxyConfig::default()
        };
        let remote = proxy_with("sim", &registry, &bridge, config);

        let deadline = Instant::now() + Duration::from_secs(3);
        while remote.inner.running.load(Ordering::Acquire) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(!remote.inner.running.load(Ordering::Acquire), "supervisor never gave up");
        assert_eq!(remote.state(), ProxyState::Disconnected);
        assert!(accepted.load(Ordering::SeqCst) >= 3);
        bridge.shutdown();
    }

    #[test]
    fn rename_moves_the_registry_entry() {
        let bridge = TaskBridge::spawn("proxy-test").unwrap();
        let registry = PeerRegistry::default();
        let peer = fake_peer(&bridge);
        announce(&registry, "sim", &peer);
        let remote = proxy("sim", &registry, &bridge);
        remote.wait_connected(Duration::from_secs(2)).unwrap();

        // The echo peer answers the rename request with its payload.
        remote.rename("sim-2").unwrap();
        assert_eq!(remote.name(), "sim-2");
        assert!(registry.get("sim").is_none());
        assert_eq!(registry.get("sim-2").unwrap().instance_id, 77);
        bridge.shutdown();
    }

    #[test]
    fn request_from_loop_thread_is_refused() {
        let bridge = TaskBridge::spawn("proxy-test").unwrap();
        let registry = PeerRegistry::default();
        let peer = fake_peer(&bridge);
        announce(&registry, "sim", &peer);
        let remote = proxy("sim", &registry, &bridge);
        remote.wait_connected(Duration::from_secs(2)).unwrap();

        let on_loop = remote.clone();
        let outcome = bridge
            .call(async move { on_loop.request("Echo", "x") }, Some(Duration::from_secs(2)))
            .unwrap();
        assert!(matches!(outcome, Err(BusError::WouldDeadlock)));
        bridge.shutdown();
    }
}

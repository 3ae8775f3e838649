//! The bus context: one per simulation process (or several, in tests).
//!
//! `Bus` owns the registration tables, the peer registry and, once started,
//! the event loop with every socket on it. It is a cheap handle: clone it
//! into the producer thread, service handlers or UI code as needed. The
//! loop stops on [`Bus::shutdown`] or when the last handle is dropped.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use simpub_core::wire::{join_frame, validate_name};
use simpub_core::{Announcement, SimpubConfig};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};

use crate::bridge::TaskBridge;
use crate::discovery;
use crate::error::{BusError, BusResult};
use crate::proxy::RemotePeer;
use crate::registry::PeerRegistry;
use crate::service::{self, handler_fn, Reply, ServiceHandler, ServiceTable};
use crate::snapshot::SignalSet;
use crate::streamer::{self, Topic, TopicTable};
use crate::CHANGE_HOST_NAME;

/// Requests buffered ahead of the service worker.
const SERVICE_QUEUE: usize = 64;

/// Where a started bus can be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalAddrs {
    /// Address put in announcements.
    pub advertise: IpAddr,
    pub topic: SocketAddr,
    pub service: SocketAddr,
    /// `None` when both announcing and listening are disabled.
    pub discovery: Option<SocketAddr>,
}

/// Cloneable handle to a message bus.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

struct BusInner {
    config: SimpubConfig,
    instance_id: u64,
    name: Arc<RwLock<String>>,
    registry: PeerRegistry,
    services: ServiceTable,
    topics: TopicTable,
    runtime: Mutex<Option<Running>>,
    closed: AtomicBool,
}

struct Running {
    bridge: TaskBridge,
    shutdown: broadcast::Sender<()>,
    frames: broadcast::Sender<Bytes>,
    addrs: LocalAddrs,
}

impl Bus {
    /// Create a bus. Nothing is bound until [`start`](Self::start).
    pub fn new(config: SimpubConfig) -> Self {
        let name = Arc::new(RwLock::new(config.identity.name.clone()));
        let services = ServiceTable::new();

        let rename_target = name.clone();
        if let Err(e) = services.register(
            CHANGE_HOST_NAME,
            handler_fn(move |payload, reply| change_host_name(&rename_target, payload, reply)),
        ) {
            tracing::error!(error = %e, "failed to register built-in service");
        }

        Self {
            inner: Arc::new(BusInner {
                registry: PeerRegistry::new(config.discovery.peer_ttl()),
                instance_id: rand::random(),
                name,
                services,
                topics: TopicTable::new(),
                runtime: Mutex::new(None),
                closed: AtomicBool::new(false),
                config,
            }),
        }
    }

    /// Bind every socket and start the event loop.
    pub fn start(&self) -> BusResult<LocalAddrs> {
        let mut runtime = self.inner.lock_runtime();
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }
        if runtime.is_some() {
            return Err(BusError::AlreadyStarted);
        }

        let bridge = TaskBridge::spawn("simpub-loop")?;
        let (shutdown, _) = broadcast::channel(1);
        let (frames, _) = broadcast::channel(self.inner.config.streaming.subscriber_buffer.max(1));

        let plan = Launch {
            config: self.inner.config.clone(),
            instance_id: self.inner.instance_id,
            name: self.inner.name.clone(),
            registry: self.inner.registry.clone(),
            services: self.inner.services.clone(),
            topics: self.inner.topics.clone(),
            shutdown: shutdown.clone(),
            frames: frames.clone(),
        };

        let addrs = match bridge.call(plan.run(), None).and_then(|launched| launched) {
            Ok(addrs) => addrs,
            Err(e) => {
                tracing::error!(error = %e, "bus failed to start");
                bridge.shutdown();
                return Err(e);
            }
        };

        tracing::info!(
            name = %self.name(),
            instance = self.inner.instance_id,
            advertise = %addrs.advertise,
            topic = %addrs.topic,
            service = %addrs.service,
            "bus started"
        );

        *runtime = Some(Running {
            bridge,
            shutdown,
            frames,
            addrs,
        });
        Ok(addrs)
    }

    /// Stop the loop and release every socket. Idempotent.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock_runtime().is_some()
    }

    // ── Registration ──────────────────────────────────────────────────────────

    /// Register a topic polled at the default publish interval.
    pub fn register_topic<F>(&self, name: &str, producer: F) -> BusResult<()>
    where
        F: Fn() -> anyhow::Result<Bytes> + Send + Sync + 'static,
    {
        self.register(Topic::from_fn(name, producer))
    }

    /// Register a topic with its own publish interval.
    pub fn register_topic_every<F>(&self, name: &str, interval: Duration, producer: F) -> BusResult<()>
    where
        F: Fn() -> anyhow::Result<Bytes> + Send + Sync + 'static,
    {
        self.register(Topic::from_fn(name, producer).every(interval))
    }

    /// Register a topic whose value is serialized as JSON each tick.
    pub fn register_json_topic<F, T>(&self, name: &str, producer: F) -> BusResult<()>
    where
        F: Fn() -> T + Send + Sync + 'static,
        T: Serialize,
    {
        self.register_topic(name, move || Ok(Bytes::from(serde_json::to_vec(&producer())?)))
    }

    /// Register a topic that publishes the snapshot of `signals`.
    pub fn register_signals(&self, name: &str, signals: SignalSet) -> BusResult<()> {
        self.register(Topic::new(name, Arc::new(signals)))
    }

    /// Register any [`Topic`]. Safe before or after start; once running, the
    /// insert and the streamer spawn both happen on the event loop.
    pub fn register(&self, topic: Topic) -> BusResult<()> {
        // Held across insert and spawn so `start` sees the topic either in
        // the table or not at all.
        let runtime = self.inner.lock_runtime();
        let name = topic.name.clone();

        match runtime.as_ref() {
            None => self.inner.topics.register(topic)?,
            Some(running) => {
                let topics = self.inner.topics.clone();
                let interval = topic
                    .interval
                    .unwrap_or_else(|| self.inner.config.streaming.publish_interval());
                let frames = running.frames.clone();
                let shutdown = running.shutdown.subscribe();
                running.bridge.call(
                    async move {
                        topics.register(topic.clone())?;
                        tokio::spawn(streamer::streamer_loop(topic, interval, frames, shutdown));
                        Ok::<_, BusError>(())
                    },
                    None,
                )??;
            }
        }
        tracing::debug!(topic = %name, "topic registered");
        Ok(())
    }

    /// Register a service handler closure.
    pub fn register_service<F>(&self, name: &str, handler: F) -> BusResult<()>
    where
        F: Fn(&[u8], &mut Reply) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register_service_handler(name, handler_fn(handler))
    }

    /// Register a service handler. Once running, the table is updated on
    /// the event loop, so this must not be called from the loop thread.
    pub fn register_service_handler(
        &self,
        name: &str,
        handler: Arc<dyn ServiceHandler>,
    ) -> BusResult<()> {
        let runtime = self.inner.lock_runtime();
        match runtime.as_ref() {
            None => self.inner.services.register(name, handler)?,
            Some(running) => {
                let services = self.inner.services.clone();
                let owned = name.to_string();
                running
                    .bridge
                    .call(async move { services.register(&owned, handler) }, None)??;
            }
        }
        tracing::debug!(service = name, "service registered");
        Ok(())
    }

    /// Push one frame to every current subscriber, outside any publish tick.
    pub fn publish(&self, topic: &str, payload: impl AsRef<[u8]>) -> BusResult<()> {
        validate_name(topic)?;
        let runtime = self.inner.lock_runtime();
        let running = runtime.as_ref().ok_or(BusError::NotStarted)?;
        let _ = running
            .frames
            .send(Bytes::from(join_frame(topic, payload.as_ref())));
        Ok(())
    }

    // ── Peers ─────────────────────────────────────────────────────────────────

    /// Create a proxy for the peer announcing as `peer_name`. The peer does
    /// not have to be discovered yet.
    pub fn connect_to(&self, peer_name: &str) -> BusResult<RemotePeer> {
        let runtime = self.inner.lock_runtime();
        let running = runtime.as_ref().ok_or(BusError::NotStarted)?;
        RemotePeer::new(
            peer_name,
            self.inner.registry.clone(),
            running.bridge.clone(),
            self.inner.config.proxy.clone(),
            running.shutdown.clone(),
        )
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.inner.registry
    }

    // ── Introspection ─────────────────────────────────────────────────────────

    /// Current display name.
    pub fn name(&self) -> String {
        self.inner
            .name
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Change our display name. Peers see it from the next announcement.
    pub fn set_name(&self, name: &str) {
        set_display_name(&self.inner.name, name);
    }

    pub fn instance_id(&self) -> u64 {
        self.inner.instance_id
    }

    pub fn config(&self) -> &SimpubConfig {
        &self.inner.config
    }

    pub fn local_addrs(&self) -> Option<LocalAddrs> {
        self.inner.lock_runtime().as_ref().map(|r| r.addrs)
    }

    /// The event loop, once started.
    pub fn bridge(&self) -> Option<TaskBridge> {
        self.inner.lock_runtime().as_ref().map(|r| r.bridge.clone())
    }

    pub fn topic_names(&self) -> Vec<String> {
        self.inner.topics.names()
    }

    pub fn service_names(&self) -> Vec<String> {
        self.inner.services.names()
    }
}

impl BusInner {
    fn lock_runtime(&self) -> MutexGuard<'_, Option<Running>> {
        self.runtime.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let running = self.lock_runtime().take();
        if let Some(running) = running {
            let _ = running.shutdown.send(());
            running.bridge.shutdown();
            tracing::info!(instance = self.instance_id, "bus shut down");
        }
    }
}

impl Drop for BusInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn set_display_name(slot: &RwLock<String>, name: &str) {
    let mut current = slot.write().unwrap_or_else(PoisonError::into_inner);
    if *current != name {
        tracing::info!(from = %current.as_str(), to = name, "display name changed");
        *current = name.to_string();
    }
}

fn change_host_name(slot: &RwLock<String>, payload: &[u8], reply: &mut Reply) -> anyhow::Result<()> {
    let name = std::str::from_utf8(payload)?.trim();
    validate_name(name)?;
    set_display_name(slot, name);
    reply.send_text("OK");
    Ok(())
}

/// Everything the loop needs to bring a bus up.
struct Launch {
    config: SimpubConfig,
    instance_id: u64,
    name: Arc<RwLock<String>>,
    registry: PeerRegistry,
    services: ServiceTable,
    topics: TopicTable,
    shutdown: broadcast::Sender<()>,
    frames: broadcast::Sender<Bytes>,
}

impl Launch {
    async fn run(self) -> BusResult<LocalAddrs> {
        let net = &self.config.network;
        let host = net.host;

        let topic_listener = TcpListener::bind(SocketAddr::new(host, net.topic_port)).await?;
        let service_listener = TcpListener::bind(SocketAddr::new(host, net.service_port)).await?;

        let discovery_socket = if self.config.discovery.announce || self.config.discovery.listen {
            let socket = discovery::bind_discovery_socket(SocketAddr::new(host, net.discovery_port))
                .map_err(|e| BusError::Transport(std::io::Error::other(format!("{e:#}"))))?;
            Some(Arc::new(socket))
        } else {
            None
        };

        let addrs = LocalAddrs {
            advertise: discovery::advertise_addr(host, net.advertise_addr),
            topic: topic_listener.local_addr()?,
            service: service_listener.local_addr()?,
            discovery: discovery_socket
                .as_ref()
                .map(|s| s.local_addr())
                .transpose()?,
        };

        // Topics
        tokio::spawn(streamer::topic_server(
            topic_listener,
            self.frames.clone(),
            self.shutdown.subscribe(),
            self.shutdown.clone(),
        ));
        for topic in self.topics.all() {
            let interval = topic
                .interval
                .unwrap_or_else(|| self.config.streaming.publish_interval());
            tokio::spawn(streamer::streamer_loop(
                topic,
                interval,
                self.frames.clone(),
                self.shutdown.subscribe(),
            ));
        }

        // Services
        let (queue_tx, queue_rx) = mpsc::channel(SERVICE_QUEUE);
        tokio::spawn(service::service_worker(
            self.services.clone(),
            queue_rx,
            self.shutdown.subscribe(),
        ));
        tokio::spawn(service::service_server(
            service_listener,
            queue_tx,
            self.shutdown.subscribe(),
            self.shutdown.clone(),
        ));

        // Discovery
        if let Some(socket) = discovery_socket {
            let settings = &self.config.discovery;
            if settings.listen {
                tokio::spawn(discovery::listener_loop(
                    socket.clone(),
                    self.registry.clone(),
                    self.instance_id,
                    self.shutdown.subscribe(),
                ));
                tokio::spawn(discovery::expiry_loop(
                    self.registry.clone(),
                    settings.peer_ttl(),
                    self.shutdown.subscribe(),
                ));
            }
            if settings.announce && !settings.targets.is_empty() {
                let build = announcement_builder(&self, addrs);
                tokio::spawn(discovery::announce_loop(
                    socket,
                    settings.targets.clone(),
                    settings.announce_interval(),
                    build,
                    self.shutdown.subscribe(),
                ));
            }
        }

        Ok(addrs)
    }
}

/// Rebuilds the announcement each tick so renames and late registrations
/// are picked up.
fn announcement_builder(launch: &Launch, addrs: LocalAddrs) -> impl Fn() -> Announcement + Send + 'static {
    let instance_id = launch.instance_id;
    let name = launch.name.clone();
    let services = launch.services.clone();
    let topics = launch.topics.clone();
    move || Announcement {
        instance_id,
        name: name.read().unwrap_or_else(PoisonError::into_inner).clone(),
        addr: addrs.advertise,
        topic_port: addrs.topic.port(),
        service_port: addrs.service.port(),
        services: services.names(),
        topics: topics.names(),
    }
}

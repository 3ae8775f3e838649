//! Topic streamer: periodic one-to-many broadcast.
//!
//! Every registered topic gets a ticker on the event loop. Each tick polls
//! the topic's producer and pushes `"<topic>:<payload>"` into a broadcast
//! channel. The topic server accepts subscriber connections and gives each
//! one its own receiver and writer task, so a slow subscriber only loses
//! its own frames.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use simpub_core::wire::{join_frame, validate_name};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time;

use crate::error::{BusError, BusResult};
use crate::framing::write_frame;

/// Supplies the latest value of a topic. Polled, never pushed.
pub trait TopicProducer: Send + Sync + 'static {
    fn produce(&self) -> anyhow::Result<Bytes>;
}

/// Adapts a closure to [`TopicProducer`].
pub struct FnProducer<F>(pub F);

impl<F> TopicProducer for FnProducer<F>
where
    F: Fn() -> anyhow::Result<Bytes> + Send + Sync + 'static,
{
    fn produce(&self) -> anyhow::Result<Bytes> {
        (self.0)()
    }
}

/// A registered topic.
#[derive(Clone)]
pub struct Topic {
    pub name: String,
    pub producer: Arc<dyn TopicProducer>,
    /// Publish tick. `None` = the bus default.
    pub interval: Option<Duration>,
}

impl Topic {
    pub fn new(name: impl Into<String>, producer: Arc<dyn TopicProducer>) -> Self {
        Self {
            name: name.into(),
            producer,
            interval: None,
        }
    }

    pub fn from_fn<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn() -> anyhow::Result<Bytes> + Send + Sync + 'static,
    {
        Self::new(name, Arc::new(FnProducer(f)))
    }

    /// Publish on its own tick instead of the bus default.
    pub fn every(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }
}

/// Name-keyed topic table.
#[derive(Clone, Default)]
pub struct TopicTable {
    topics: Arc<DashMap<String, Topic>>,
}

impl TopicTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a topic. Names are unique per process.
    pub fn register(&self, topic: Topic) -> BusResult<()> {
        validate_name(&topic.name)?;
        match self.topics.entry(topic.name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(BusError::DuplicateTopic(topic.name)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(topic);
                Ok(())
            }
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.topics.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    /// Sorted topic names.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.topics.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Clone of every topic, for spawning streamers.
    pub fn all(&self) -> Vec<Topic> {
        self.topics.iter().map(|e| e.value().clone()).collect()
    }
}

/// Poll `topic` every tick and broadcast the framed result until shutdown.
pub async fn streamer_loop(
    topic: Topic,
    interval: Duration,
    frames: broadcast::Sender<Bytes>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

    tracing::debug!(
        topic = %topic.name,
        interval_ms = interval.as_millis() as u64,
        "streamer starting"
    );

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::debug!(topic = %topic.name, "streamer stopping");
                return;
            }
            _ = ticker.tick() => {}
        }

        let payload = match topic.producer.produce() {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(topic = %topic.name, error = %e, "topic producer failed");
                continue;
            }
        };

        // No subscribers is not an error; the frame just goes nowhere.
        let _ = frames.send(Bytes::from(join_frame(&topic.name, &payload)));
    }
}

/// Accept subscribers on `listener` until shutdown.
pub async fn topic_server(
    listener: TcpListener,
    frames: broadcast::Sender<Bytes>,
    mut shutdown: broadcast::Receiver<()>,
    shutdown_tx: broadcast::Sender<()>,
) {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "topic server listening");
    }

    loop {
        let accepted = tokio::select! {
            _ = shutdown.recv() => {
                tracing::debug!("topic server stopping");
                return;
            }
            r = listener.accept() => r,
        };

        match accepted {
            Ok((stream, addr)) => {
                tracing::debug!(%addr, "subscriber connected");
                tokio::spawn(serve_subscriber(
                    stream,
                    frames.subscribe(),
                    shutdown_tx.subscribe(),
                ));
            }
            Err(e) => {
                tracing::warn!(error = %e, "topic accept failed");
                time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}

async fn serve_subscriber(
    mut stream: TcpStream,
    mut frames: broadcast::Receiver<Bytes>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let peer = stream.peer_addr().ok();
    let _ = stream.set_nodelay(true);

    loop {
        let frame = tokio::select! {
            _ = shutdown.recv() => return,
            f = frames.recv() => f,
        };

        match frame {
            Ok(frame) => {
                if let Err(e) = write_frame(&mut stream, &frame).await {
                    tracing::debug!(?peer, error = %e, "subscriber dropped");
                    return;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(?peer, skipped, "slow subscriber, frames dropped");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

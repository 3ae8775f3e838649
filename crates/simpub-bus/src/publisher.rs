//! Simulation publisher: a [`Bus`] preloaded with the scene services and
//! the scene-update topic.
//!
//! The scene itself comes from a [`SceneSource`]; the publisher only moves
//! its bytes. `Scene` answers with the serialized description, `Asset`
//! with the raw bytes of one asset by tag, and `SceneUpdate` carries the
//! JSON snapshot of every tracked signal.

use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use simpub_core::SimpubConfig;

use crate::bus::{Bus, LocalAddrs};
use crate::error::BusResult;
use crate::snapshot::SignalSet;

pub const SCENE_SERVICE: &str = "Scene";
pub const ASSET_SERVICE: &str = "Asset";
pub const SCENE_UPDATE_TOPIC: &str = "SceneUpdate";

/// Provides the serialized scene and its assets.
pub trait SceneSource: Send + Sync + 'static {
    /// The full scene description, as sent to clients on request.
    fn scene_description(&self) -> String;
    /// Raw bytes of the asset tagged `tag`, if the scene has one.
    fn asset(&self, tag: &str) -> Option<Bytes>;
}

pub struct SimPublisher {
    bus: Bus,
    signals: SignalSet,
}

impl SimPublisher {
    /// Build a bus from `config` and register the scene services and topic.
    /// Signals listed in `config.daemon.no_tracked_objects` are never published.
    pub fn new(config: SimpubConfig, scene: Arc<dyn SceneSource>) -> BusResult<Self> {
        let signals = SignalSet::with_excluded(config.daemon.no_tracked_objects.iter().cloned());
        let bus = Bus::new(config);

        let source = scene.clone();
        bus.register_service(SCENE_SERVICE, move |_, reply| {
            reply.send_text(source.scene_description());
            Ok(())
        })?;

        bus.register_service(ASSET_SERVICE, move |payload, reply| {
            let tag = String::from_utf8_lossy(payload);
            match scene.asset(&tag) {
                Some(bytes) => {
                    reply.send(bytes);
                    Ok(())
                }
                None => {
                    tracing::warn!(tag = %tag, "request for unknown asset");
                    anyhow::bail!("unknown asset {tag:?}")
                }
            }
        })?;

        bus.register_signals(SCENE_UPDATE_TOPIC, signals.clone())?;

        Ok(Self { bus, signals })
    }

    /// Track a signal published under `SceneUpdate`.
    pub fn track<F, T>(&self, name: &str, value: F) -> BusResult<()>
    where
        F: Fn() -> T + Send + Sync + 'static,
        T: Serialize,
    {
        self.signals.track(name, value)
    }

    pub fn start(&self) -> BusResult<LocalAddrs> {
        self.bus.start()
    }

    pub fn shutdown(&self) {
        self.bus.shutdown();
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn signals(&self) -> &SignalSet {
        &self.signals
    }
}

//! simpub-bus: the simulation message bus.
//!
//! A [`Bus`] streams topics to every subscriber, answers service requests
//! lock-step, announces itself and discovers peers over UDP, and hands out
//! [`RemotePeer`] proxies for talking to discovered peers. All sockets live
//! on one event-loop thread behind the [`TaskBridge`].

pub mod bridge;
pub mod bus;
pub mod discovery;
pub mod error;
pub mod framing;
pub mod proxy;
pub mod publisher;
pub mod registry;
pub mod service;
pub mod snapshot;
pub mod streamer;
pub mod supervisor;

pub use bridge::{TaskBridge, TaskHandle};
pub use bus::{Bus, LocalAddrs};
pub use error::{BusError, BusResult};
pub use proxy::{ProxyState, RemotePeer, TopicCallback};
pub use publisher::{SceneSource, SimPublisher, ASSET_SERVICE, SCENE_SERVICE, SCENE_UPDATE_TOPIC};
pub use registry::{PeerInfo, PeerRegistry, Upsert};
pub use service::{Reply, ServiceHandler, ServiceTable};
pub use snapshot::{SignalSet, StateSnapshot};
pub use streamer::{Topic, TopicProducer};
pub use supervisor::RestartPolicy;

/// Built-in service every bus answers: payload is the new display name.
pub const CHANGE_HOST_NAME: &str = "ChangeHostName";

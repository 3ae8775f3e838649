//! Bus error taxonomy.

use std::time::Duration;

use simpub_core::WireError;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The event loop is gone; nothing can be scheduled any more.
    #[error("bus closed")]
    Closed,
    #[error("bus already started")]
    AlreadyStarted,
    #[error("bus not started")]
    NotStarted,
    #[error("topic {0:?} is already registered")]
    DuplicateTopic(String),
    #[error("service {0:?} is already registered")]
    DuplicateService(String),
    #[error("signal {0:?} is already tracked")]
    DuplicateSignal(String),
    /// A name or frame failed wire validation.
    #[error("wire: {0}")]
    Wire(#[from] WireError),
    /// Proxy used before its peer was discovered and connected.
    #[error("peer {0:?} is not connected yet")]
    NotConnected(String),
    #[error("peer {peer:?} does not offer service {service:?}")]
    UnsupportedService { peer: String, service: String },
    /// The remote bus answered with a failure reply.
    #[error("remote failure: {0}")]
    Remote(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    /// `TaskHandle::result` on the event-loop thread would wait on itself.
    #[error("blocking wait on the event-loop thread would deadlock")]
    WouldDeadlock,
    #[error("task failed: {0}")]
    Task(String),
    #[error("peer {0:?} is not in the registry")]
    UnknownPeer(String),
    #[error("peer name {0:?} is already taken")]
    NameTaken(String),
    #[error("transport: {0}")]
    Transport(#[from] std::io::Error),
}

pub type BusResult<T> = Result<T, BusError>;

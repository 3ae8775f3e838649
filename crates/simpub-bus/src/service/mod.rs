//! Service table: routes `"<service>:<payload>"` requests to handlers.
//!
//! Handlers are synchronous and write their reply through a [`Reply`]. The
//! bus never wraps what a handler writes, so text control replies and raw
//! binary asset blobs share the same path. Anything the bus has to answer
//! on a handler's behalf (unknown service, malformed frame, handler error)
//! goes out as a failure reply, see [`simpub_core::wire::error_reply`].

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use simpub_core::wire::{error_reply, split_frame, validate_name};

use crate::error::{BusError, BusResult};

pub mod endpoint;

pub use endpoint::{service_server, service_worker, PendingRequest};

/// Writable reply channel handed to a handler. Exactly one reply is sent
/// per request; the first `send` wins.
#[derive(Debug, Default)]
pub struct Reply {
    body: Option<Bytes>,
}

impl Reply {
    pub fn new() -> Self {
        Self::default()
    }

    /// Send raw bytes.
    pub fn send(&mut self, body: impl Into<Bytes>) {
        if self.body.is_some() {
            tracing::warn!("reply already sent, ignoring second reply");
            return;
        }
        self.body = Some(body.into());
    }

    pub fn send_text(&mut self, text: impl Into<String>) {
        self.send(Bytes::from(text.into()));
    }

    pub fn is_sent(&self) -> bool {
        self.body.is_some()
    }

    pub fn into_body(self) -> Option<Bytes> {
        self.body
    }
}

/// A request handler.
pub trait ServiceHandler: Send + Sync + 'static {
    fn handle(&self, payload: &[u8], reply: &mut Reply) -> anyhow::Result<()>;
}

/// Adapts a closure to [`ServiceHandler`].
pub struct FnHandler<F>(pub F);

impl<F> ServiceHandler for FnHandler<F>
where
    F: Fn(&[u8], &mut Reply) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn handle(&self, payload: &[u8], reply: &mut Reply) -> anyhow::Result<()> {
        (self.0)(payload, reply)
    }
}

/// Box a closure as a shareable handler.
pub fn handler_fn<F>(f: F) -> Arc<dyn ServiceHandler>
where
    F: Fn(&[u8], &mut Reply) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

/// Name-keyed handler table shared by the endpoint worker and the bus.
#[derive(Clone, Default)]
pub struct ServiceTable {
    handlers: Arc<DashMap<String, Arc<dyn ServiceHandler>>>,
}

impl ServiceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Names are unique per process.
    pub fn register(&self, name: &str, handler: Arc<dyn ServiceHandler>) -> BusResult<()> {
        validate_name(name)?;
        match self.handlers.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(BusError::DuplicateService(name.to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(handler);
                Ok(())
            }
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Sorted service names.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Route one request frame and produce the reply to send back.
    /// Never fails: every problem becomes a failure reply plus a warning.
    pub fn dispatch(&self, frame: &[u8]) -> Bytes {
        let (name, payload) = match split_frame(frame) {
            Ok(parts) => parts,
            Err(e) => {
                tracing::warn!(error = %e, len = frame.len(), "malformed service request");
                return Bytes::from(error_reply(&format!("malformed request: {e}")));
            }
        };

        // Clone out so the shard lock is not held while the handler runs.
        let handler = match self.handlers.get(name) {
            Some(h) => h.value().clone(),
            None => {
                tracing::warn!(service = name, "request for unknown service");
                return Bytes::from(error_reply(&format!("unknown service {name:?}")));
            }
        };

        let mut reply = Reply::new();
        if let Err(e) = handler.handle(payload, &mut reply) {
            tracing::warn!(service = name, error = %e, "service handler failed");
            return Bytes::from(error_reply(&format!("service {name:?} failed: {e}")));
        }

        match reply.into_body() {
            Some(body) => body,
            None => {
                tracing::warn!(service = name, "service handler sent no reply");
                Bytes::from(error_reply(&format!("service {name:?} sent no reply")))
            }
        }
    }
}

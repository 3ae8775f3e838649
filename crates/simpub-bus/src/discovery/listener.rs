//! Announcement listener and registry expiry.

use std::sync::Arc;
use std::time::Duration;

use simpub_core::wire::MAX_DATAGRAM_LEN;
use simpub_core::Announcement;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;

use crate::registry::{PeerRegistry, Upsert};

/// Receive announcements and upsert them into the registry until shutdown.
///
/// Our own announcements (same `instance_id`) are ignored, which matters
/// when broadcasting: the sender hears itself.
pub async fn listener_loop(
    socket: Arc<UdpSocket>,
    registry: PeerRegistry,
    local_instance: u64,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_LEN];

    if let Ok(addr) = socket.local_addr() {
        tracing::info!(%addr, "announcement listener starting");
    }

    loop {
        let received = tokio::select! {
            _ = shutdown.recv() => {
                tracing::debug!("announcement listener stopping");
                return;
            }
            r = socket.recv_from(&mut buf) => r,
        };

        let (len, source) = match received {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "recv_from failed");
                continue;
            }
        };

        let announcement = match Announcement::decode(&buf[..len]) {
            Ok(a) => a,
            Err(e) => {
                tracing::trace!(error = %e, %source, "ignoring datagram");
                continue;
            }
        };

        if announcement.instance_id == local_instance {
            tracing::trace!("ignoring own announcement");
            continue;
        }

        match registry.upsert(&announcement, source.ip()) {
            Upsert::Inserted => tracing::info!(
                peer = %announcement.name,
                addr = %source,
                services = announcement.services.len(),
                topics = announcement.topics.len(),
                "peer discovered"
            ),
            Upsert::Refreshed => tracing::trace!(peer = %announcement.name, "peer refreshed"),
            Upsert::Replaced { previous_instance } => tracing::info!(
                peer = %announcement.name,
                previous_instance,
                instance = announcement.instance_id,
                "peer restarted"
            ),
            Upsert::Renamed { from } => {
                tracing::info!(from = %from, to = %announcement.name, "peer renamed")
            }
            Upsert::IgnoredRetired => {
                tracing::debug!(peer = %announcement.name, "ignoring announcement under retired name")
            }
        }
    }
}

/// Evict peers that have not announced within `ttl`, checking once a second
/// (or every `ttl` when that is shorter).
pub async fn expiry_loop(registry: PeerRegistry, ttl: Duration, mut shutdown: broadcast::Receiver<()>) {
    let check = ttl.min(Duration::from_secs(1)).max(Duration::from_millis(10));
    let mut interval = tokio::time::interval(check);

    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = interval.tick() => {}
        }

        let removed = registry.expire(ttl);
        if removed > 0 {
            tracing::info!(removed, remaining = registry.len(), "expired stale peers");
        }
    }
}

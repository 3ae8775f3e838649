//! Announcement broadcast.
//!
//! Periodically sends our [`Announcement`] to every discovery target so
//! peers can find us. The announcement is rebuilt each tick so renames and
//! late topic or service registrations show up without a restart.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use simpub_core::Announcement;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::time;

/// Announce on `interval` until shutdown.
pub async fn announce_loop<F>(
    socket: Arc<UdpSocket>,
    targets: Vec<SocketAddr>,
    interval: Duration,
    build: F,
    mut shutdown: broadcast::Receiver<()>,
) where
    F: Fn() -> Announcement + Send + 'static,
{
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

    tracing::info!(
        targets = targets.len(),
        interval_ms = interval.as_millis() as u64,
        "announcement broadcast starting"
    );

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::debug!("announcement broadcast stopping");
                return;
            }
            _ = ticker.tick() => {}
        }

        let datagram = match build().encode() {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(error = %e, "announcement not encodable, skipping tick");
                continue;
            }
        };

        for target in &targets {
            match socket.send_to(&datagram, target).await {
                Ok(n) => tracing::trace!(bytes = n, %target, "announcement sent"),
                Err(e) => tracing::warn!(error = %e, %target, "announcement send failed"),
            }
        }
    }
}

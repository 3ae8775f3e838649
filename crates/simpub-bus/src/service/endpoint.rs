//! Service endpoint: lock-step request/reply over TCP.
//!
//! Each requester connection reads one request frame, waits for its reply,
//! writes it, and only then reads the next request. All connections feed a
//! single worker, so the whole process has one ordering domain: a slow
//! handler holds up every other request until it returns.
//!
//! Handlers run on tokio's blocking pool. The worker awaits each one, so
//! the event loop keeps publishing and discovering while a handler is busy.

use bytes::Bytes;
use simpub_core::wire::error_reply;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::framing::{read_frame, write_frame};
use crate::service::ServiceTable;

/// One request waiting for the worker.
pub struct PendingRequest {
    pub frame: Bytes,
    pub reply_tx: oneshot::Sender<Bytes>,
}

/// Accept requester connections until shutdown.
pub async fn service_server(
    listener: TcpListener,
    queue: mpsc::Sender<PendingRequest>,
    mut shutdown: broadcast::Receiver<()>,
    shutdown_tx: broadcast::Sender<()>,
) {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "service endpoint listening");
    }

    loop {
        let accepted = tokio::select! {
            _ = shutdown.recv() => {
                tracing::debug!("service endpoint stopping");
                return;
            }
            r = listener.accept() => r,
        };

        match accepted {
            Ok((stream, addr)) => {
                tracing::debug!(%addr, "requester connected");
                tokio::spawn(serve_requester(stream, queue.clone(), shutdown_tx.subscribe()));
            }
            Err(e) => {
                tracing::warn!(error = %e, "service accept failed");
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
        }
    }
}

async fn serve_requester(
    mut stream: TcpStream,
    queue: mpsc::Sender<PendingRequest>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let peer = stream.peer_addr().ok();
    let _ = stream.set_nodelay(true);

    loop {
        let frame = tokio::select! {
            _ = shutdown.recv() => return,
            f = read_frame(&mut stream) => f,
        };

        let frame = match frame {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                tracing::debug!(?peer, "requester disconnected");
                return;
            }
            Err(e) => {
                tracing::warn!(?peer, error = %e, "dropping requester after transport error");
                return;
            }
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        if queue.send(PendingRequest { frame, reply_tx }).await.is_err() {
            return;
        }
        let reply = match reply_rx.await {
            Ok(reply) => reply,
            Err(_) => return,
        };

        if let Err(e) = write_frame(&mut stream, &reply).await {
            tracing::debug!(?peer, error = %e, "reply write failed");
            return;
        }
    }
}

/// Run handlers one at a time, in arrival order, until shutdown.
pub async fn service_worker(
    table: ServiceTable,
    mut queue: mpsc::Receiver<PendingRequest>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        let request = tokio::select! {
            _ = shutdown.recv() => return,
            r = queue.recv() => match r {
                Some(r) => r,
                None => return,
            },
        };

        let table = table.clone();
        let frame = request.frame;
        let reply = match tokio::task::spawn_blocking(move || table.dispatch(&frame)).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::error!(error = %e, "service handler panicked");
                Bytes::from(error_reply("service handler panicked"))
            }
        };

        let _ = request.reply_tx.send(reply);
    }
}

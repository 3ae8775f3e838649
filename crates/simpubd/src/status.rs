//! HTTP status endpoint: exposes bus state as JSON.

use std::time::Instant;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use simpub_bus::Bus;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

#[derive(Clone)]
pub struct StatusState {
    pub bus: Bus,
    pub started_at: Instant,
}

// ── /status ──────────────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
pub struct StatusResponse {
    pub name: String,
    pub instance_id: String,
    pub advertise: Option<String>,
    pub topic_port: Option<u16>,
    pub service_port: Option<u16>,
    pub discovery_port: Option<u16>,
    pub peers_discovered: usize,
    pub topics: usize,
    pub services: usize,
    pub uptime_secs: u64,
}

async fn handle_status(State(state): State<StatusState>) -> Json<StatusResponse> {
    let bus = &state.bus;
    let addrs = bus.local_addrs();

    Json(StatusResponse {
        name: bus.name(),
        instance_id: hex::encode(bus.instance_id().to_be_bytes()),
        advertise: addrs.map(|a| a.advertise.to_string()),
        topic_port: addrs.map(|a| a.topic.port()),
        service_port: addrs.map(|a| a.service.port()),
        discovery_port: addrs.and_then(|a| a.discovery).map(|d| d.port()),
        peers_discovered: bus.registry().len(),
        topics: bus.topic_names().len(),
        services: bus.service_names().len(),
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}

// ── /peers ────────────────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
pub struct PeersResponse {
    pub peers: Vec<PeerInfo>,
}

#[derive(Serialize, Deserialize)]
pub struct PeerInfo {
    pub name: String,
    pub instance_id: String,
    pub addr: String,
    pub topic_port: u16,
    pub service_port: u16,
    pub services: Vec<String>,
    pub topics: Vec<String>,
    pub discovered_secs: u64,
    pub last_seen_secs: u64,
}

async fn handle_peers(State(state): State<StatusState>) -> Json<PeersResponse> {
    let peers = state
        .bus
        .registry()
        .snapshot()
        .into_iter()
        .map(|p| PeerInfo {
            instance_id: hex::encode(p.instance_id.to_be_bytes()),
            addr: p.addr.to_string(),
            topic_port: p.topic_port,
            service_port: p.service_port,
            services: p.services.into_iter().collect(),
            topics: p.topics.into_iter().collect(),
            discovered_secs: p.discovered_at.elapsed().as_secs(),
            last_seen_secs: p.last_seen.elapsed().as_secs(),
            name: p.name,
        })
        .collect();

    Json(PeersResponse { peers })
}

// ── /topics, /services ────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
pub struct NamesResponse {
    pub names: Vec<String>,
}

async fn handle_topics(State(state): State<StatusState>) -> Json<NamesResponse> {
    Json(NamesResponse {
        names: state.bus.topic_names(),
    })
}

async fn handle_services(State(state): State<StatusState>) -> Json<NamesResponse> {
    Json(NamesResponse {
        names: state.bus.service_names(),
    })
}

// ── Router ────────────────────────────────────────────────────────────────────

pub fn router(state: StatusState) -> Router {
    Router::new()
        .route("/status", get(handle_status))
        .route("/peers", get(handle_peers))
        .route("/topics", get(handle_topics))
        .route("/services", get(handle_services))
        .with_state(state)
}

pub async fn serve(
    state: StatusState,
    port: u16,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    tracing::info!(port, "status endpoint listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;
    Ok(())
}

//! Daemon status, peers, topics and services commands.

use anyhow::Result;
use serde::Deserialize;

use super::http::{base_url, get_json};

// ── Response types ────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct StatusResponse {
    name: String,
    instance_id: String,
    advertise: Option<String>,
    topic_port: Option<u16>,
    service_port: Option<u16>,
    discovery_port: Option<u16>,
    peers_discovered: usize,
    topics: usize,
    services: usize,
    uptime_secs: u64,
}

#[derive(Deserialize)]
struct PeersResponse {
    peers: Vec<PeerInfo>,
}

#[derive(Deserialize)]
#[allow(dead_code)]
struct PeerInfo {
    name: String,
    instance_id: String,
    addr: String,
    topic_port: u16,
    service_port: u16,
    services: Vec<String>,
    topics: Vec<String>,
    discovered_secs: u64,
    last_seen_secs: u64,
}

#[derive(Deserialize)]
struct NamesResponse {
    names: Vec<String>,
}

fn port_or_dash(port: Option<u16>) -> String {
    port.map(|p| p.to_string()).unwrap_or_else(|| "-".into())
}

// ── Commands ──────────────────────────────────────────────────────────────────

pub async fn cmd_status(port: u16) -> Result<()> {
    let resp: StatusResponse = get_json(&format!("{}/status", base_url(port))).await?;

    println!("═══════════════════════════════════════");
    println!("  SimPub Daemon Status");
    println!("═══════════════════════════════════════");
    println!("  Name             : {}", resp.name);
    println!("  Instance         : {}", resp.instance_id);
    println!(
        "  Advertise        : {}",
        resp.advertise.as_deref().unwrap_or("(not started)")
    );
    println!("  Topic port       : {}", port_or_dash(resp.topic_port));
    println!("  Service port     : {}", port_or_dash(resp.service_port));
    println!("  Discovery port   : {}", port_or_dash(resp.discovery_port));
    println!("  Peers discovered : {}", resp.peers_discovered);
    println!("  Topics           : {}", resp.topics);
    println!("  Services         : {}", resp.services);
    println!("  Uptime           : {}s", resp.uptime_secs);

    Ok(())
}

pub async fn cmd_peers(port: u16) -> Result<()> {
    let resp: PeersResponse = get_json(&format!("{}/peers", base_url(port))).await?;

    if resp.peers.is_empty() {
        println!("No peers discovered yet.");
        return Ok(());
    }

    println!("═══════════════════════════════════════");
    println!("  Discovered Peers ({})", resp.peers.len());
    println!("═══════════════════════════════════════");

    for p in &resp.peers {
        println!("  ┌─ {}", p.name);
        println!("  │  instance     : {}", p.instance_id);
        println!("  │  addr         : {}", p.addr);
        println!("  │  topic port   : {}", p.topic_port);
        println!("  │  service port : {}", p.service_port);
        println!("  │  services     : {}", p.services.join(", "));
        println!("  │  topics       : {}", p.topics.join(", "));
        println!("  └─ last seen    : {}s ago", p.last_seen_secs);
    }

    Ok(())
}

pub async fn cmd_topics(port: u16) -> Result<()> {
    let resp: NamesResponse = get_json(&format!("{}/topics", base_url(port))).await?;
    print_names("Topics", &resp.names);
    Ok(())
}

pub async fn cmd_services(port: u16) -> Result<()> {
    let resp: NamesResponse = get_json(&format!("{}/services", base_url(port))).await?;
    print_names("Services", &resp.names);
    Ok(())
}

fn print_names(title: &str, names: &[String]) {
    println!("═══════════════════════════════════════");
    println!("  {} ({})", title, names.len());
    println!("═══════════════════════════════════════");
    for name in names {
        println!("  {}", name);
    }
}

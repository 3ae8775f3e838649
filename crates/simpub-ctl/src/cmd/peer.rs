//! Commands that join the bus and talk to a peer directly: request, watch,
//! rename.
//!
//! The CLI runs a short-lived bus of its own that listens for announcements
//! but never announces, so it does not show up in anyone's peer table.

use std::time::Duration;

use anyhow::{Context, Result};
use simpub_bus::{Bus, RemotePeer};
use simpub_core::SimpubConfig;

fn client_config() -> SimpubConfig {
    let mut config = SimpubConfig::load().unwrap_or_default();
    config.identity.name = format!("simpub-ctl-{}", std::process::id());
    config.network.topic_port = 0;
    config.network.service_port = 0;
    config.discovery.announce = false;
    config.discovery.listen = true;
    config
}

/// Start a client bus and wait until `peer` is connected.
fn connect(peer: &str, wait: Duration) -> Result<(Bus, RemotePeer)> {
    let bus = Bus::new(client_config());
    bus.start().context("failed to start client bus")?;
    let remote = bus.connect_to(peer)?;
    remote
        .wait_connected(wait)
        .with_context(|| format!("peer {:?} not reachable within {:?}", peer, wait))?;
    Ok((bus, remote))
}

/// Printable form of a reply: text when it is UTF-8, hex otherwise.
pub fn render_reply(reply: &[u8]) -> String {
    match std::str::from_utf8(reply) {
        Ok(text) => text.to_string(),
        Err(_) => format!("<{} bytes> {}", reply.len(), hex::encode(reply)),
    }
}

pub async fn cmd_request(peer: &str, service: &str, payload: &str, wait: Duration) -> Result<()> {
    let (peer, service, payload) = (peer.to_string(), service.to_string(), payload.to_string());
    let reply = tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
        let (bus, remote) = connect(&peer, wait)?;
        let reply = remote
            .request(&service, payload)
            .with_context(|| format!("{} request to {} failed", service, peer));
        bus.shutdown();
        Ok(reply?.to_vec())
    })
    .await??;

    println!("{}", render_reply(&reply));
    Ok(())
}

pub async fn cmd_watch(peer: &str, topics: &[&str], wait: Duration) -> Result<()> {
    let peer = peer.to_string();
    let topics: Vec<String> = topics.iter().map(|t| t.to_string()).collect();
    let (bus, _remote) = tokio::task::spawn_blocking(move || -> Result<(Bus, RemotePeer)> {
        let (bus, remote) = connect(&peer, wait)?;
        for topic in topics {
            let label = topic.clone();
            remote.on_topic(&topic, move |payload| {
                println!("{}: {}", label, render_reply(payload));
            });
        }
        Ok((bus, remote))
    })
    .await??;

    tokio::signal::ctrl_c().await.ok();
    tokio::task::spawn_blocking(move || bus.shutdown()).await?;
    Ok(())
}

pub async fn cmd_rename(peer: &str, new_name: &str, wait: Duration) -> Result<()> {
    let (peer, new_name) = (peer.to_string(), new_name.to_string());
    tokio::task::spawn_blocking(move || -> Result<()> {
        let (bus, remote) = connect(&peer, wait)?;
        let renamed = remote
            .rename(&new_name)
            .with_context(|| format!("failed to rename {} to {}", peer, new_name));
        bus.shutdown();
        renamed?;
        println!("Renamed {} -> {}", peer, new_name);
        Ok(())
    })
    .await?
}

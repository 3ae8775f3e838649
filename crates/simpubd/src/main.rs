//! simpubd: simulation publisher daemon.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use simpub_bus::SimPublisher;
use simpub_core::SimpubConfig;

mod scene;
mod status;

use scene::FileScene;

/// Simulation clock advanced by the producer thread.
struct SimClock {
    frame: AtomicU64,
    /// Simulated seconds, stored as f64 bits.
    time_bits: AtomicU64,
    running: AtomicBool,
}

impl SimClock {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            frame: AtomicU64::new(0),
            time_bits: AtomicU64::new(0f64.to_bits()),
            running: AtomicBool::new(true),
        })
    }

    fn frame(&self) -> u64 {
        self.frame.load(Ordering::Relaxed)
    }

    fn time(&self) -> f64 {
        f64::from_bits(self.time_bits.load(Ordering::Relaxed))
    }

    fn step(&self, dt: f64) {
        let frame = self.frame.fetch_add(1, Ordering::Relaxed) + 1;
        self.time_bits
            .store((frame as f64 * dt).to_bits(), Ordering::Relaxed);
    }
}

fn spawn_producer(clock: Arc<SimClock>, step_hz: u32) -> Result<std::thread::JoinHandle<()>> {
    let step = Duration::from_secs_f64(1.0 / f64::from(step_hz.max(1)));
    std::thread::Builder::new()
        .name("simpub-producer".into())
        .spawn(move || {
            let dt = step.as_secs_f64();
            let mut next = Instant::now();
            while clock.running.load(Ordering::Relaxed) {
                clock.step(dt);
                next += step;
                let now = Instant::now();
                if next > now {
                    std::thread::sleep(next - now);
                } else {
                    next = now;
                }
            }
        })
        .context("failed to spawn producer thread")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = SimpubConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let mut config = SimpubConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        SimpubConfig::default()
    });

    if let Some(name) = std::env::args().nth(1) {
        config.identity.name = name;
    }
    tracing::info!(name = %config.identity.name, "simpubd starting");

    // Scene
    let scene = match FileScene::load(&config.daemon.scene_path, &config.daemon.asset_dir) {
        Ok(scene) => scene,
        Err(e) => {
            tracing::warn!(error = %e, "no scene loaded, serving an empty description");
            FileScene::new(String::new(), &config.daemon.asset_dir)
        }
    };

    let status_port = config.daemon.status_port;
    let step_hz = config.daemon.step_hz;

    let publisher = Arc::new(SimPublisher::new(config, Arc::new(scene))?);

    // Producer
    let clock = SimClock::new();
    {
        let c = clock.clone();
        publisher.track("frame", move || c.frame())?;
        let c = clock.clone();
        publisher.track("sim_time", move || c.time())?;
    }
    let producer = spawn_producer(clock.clone(), step_hz)?;

    // Bus start blocks on the loop thread; keep it off the runtime workers.
    let addrs = {
        let publisher = publisher.clone();
        tokio::task::spawn_blocking(move || publisher.start()).await??
    };
    tracing::info!(
        advertise = %addrs.advertise,
        topic = %addrs.topic,
        service = %addrs.service,
        instance = hex::encode(publisher.bus().instance_id().to_be_bytes()),
        "bus running"
    );

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let status_task = {
        let state = status::StatusState {
            bus: publisher.bus().clone(),
            started_at: Instant::now(),
        };
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            if let Err(e) = status::serve(state, status_port, shutdown).await {
                tracing::error!(error = %e, "status server failed");
            }
        })
    };

    let peer_printer = {
        let registry = publisher.bus().registry().clone();
        let clock = clock.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(5));
            loop {
                interval.tick().await;
                tracing::info!(
                    count = registry.len(),
                    frame = clock.frame(),
                    "peer table snapshot"
                );
                for p in registry.snapshot() {
                    tracing::info!(
                        name = %p.name,
                        addr = %p.addr,
                        services = p.services.len(),
                        last_seen_ms = p.last_seen.elapsed().as_millis() as u64,
                        "  peer"
                    );
                }
            }
        })
    };

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv() => tracing::info!("shutting down"),
        r = status_task        => tracing::error!("status server exited: {:?}", r),
        r = peer_printer       => tracing::error!("peer printer exited: {:?}", r),
    }

    clock.running.store(false, Ordering::Relaxed);
    if producer.join().is_err() {
        tracing::error!("producer thread panicked");
    }
    tokio::task::spawn_blocking(move || publisher.shutdown()).await?;

    Ok(())
}

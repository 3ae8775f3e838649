//! Restart supervision for per-peer loops.
//!
//! A supervised loop reports how each run ended. Failures are retried with
//! exponential backoff; a run that made progress (connected and received
//! something) resets the failure count, so only consecutive failures count
//! toward the restart limit.

use std::future::Future;
use std::time::Duration;

use simpub_core::config::ProxyConfig;
use tokio::sync::broadcast;

/// Backoff schedule and restart limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub base: Duration,
    pub max: Duration,
    /// Consecutive failures tolerated before giving up.
    pub max_restarts: u32,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::from_config(&ProxyConfig::default())
    }
}

impl RestartPolicy {
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self {
            base: config.restart_base(),
            max: config.restart_max(),
            max_restarts: config.max_restarts,
        }
    }

    /// Delay before restart number `failures` (1-based).
    pub fn backoff(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(31);
        self.base.saturating_mul(1u32 << exp).min(self.max)
    }
}

/// How one run of a supervised loop ended.
#[derive(Debug)]
pub enum Attempt {
    /// Clean exit; do not restart.
    Finished,
    Failed {
        /// The run delivered something, so earlier failures are forgiven.
        progressed: bool,
        error: anyhow::Error,
    },
}

/// Why [`supervise`] returned.
#[derive(Debug)]
pub enum SupervisorExit {
    /// Shutdown was signalled.
    Stopped,
    /// The loop finished on its own.
    Finished,
    /// Too many consecutive failures.
    GaveUp { failures: u32, last_error: String },
}

/// Run `run` until it finishes, shutdown fires, or the restart limit is hit.
pub async fn supervise<F, Fut>(
    label: &str,
    policy: RestartPolicy,
    mut shutdown: broadcast::Receiver<()>,
    mut run: F,
) -> SupervisorExit
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Attempt>,
{
    let mut failures = 0u32;

    loop {
        let attempt = tokio::select! {
            _ = shutdown.recv() => return SupervisorExit::Stopped,
            a = run() => a,
        };

        let (progressed, error) = match attempt {
            Attempt::Finished => return SupervisorExit::Finished,
            Attempt::Failed { progressed, error } => (progressed, error),
        };

        if progressed {
            failures = 0;
        }
        failures += 1;

        if failures > policy.max_restarts {
            tracing::error!(
                task = label,
                failures,
                error = %error,
                "giving up after repeated failures"
            );
            return SupervisorExit::GaveUp {
                failures,
                last_error: error.to_string(),
            };
        }

        let delay = policy.backoff(failures);
        tracing::warn!(
            task = label,
            failures,
            retry_in_ms = delay.as_millis() as u64,
            error = %error,
            "supervised loop failed, restarting"
        );

        tokio::select! {
            _ = shutdown.recv() => return SupervisorExit::Stopped,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

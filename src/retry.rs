//! Bounded retry with exponential backoff.
//!
//! Used for reconnects on stream drop, re-sends of auth, and
//! re-establishment of the monitor subscription. Attempts are logged; the
//! last error is returned on exhaustion. A shutdown handle aborts between
//! attempts so a reconnect loop exits within one iteration of shutdown.

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct Retry {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    shutdown: Option<watch::Receiver<bool>>,
}

impl Default for Retry {
    fn default() -> Self {
        Self::new(10, Duration::from_millis(500), Duration::from_secs(30))
    }
}

impl Retry {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            shutdown: None,
        }
    }

    /// Attach a shutdown signal; a pending backoff sleep is abandoned when
    /// it fires.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Backoff before attempt `n` (1-indexed): exponential with a small
    /// deterministic jitter, capped at `max_delay`.
    fn delay_for(&self, attempt: u32) -> Duration {
        let multiplier = 2u64.saturating_pow(attempt.saturating_sub(1));
        let delay = self.base_delay.saturating_mul(multiplier.min(u32::MAX as u64) as u32);
        let jitter_range = (delay.as_millis() as u64) / 4;
        let jitter = if jitter_range > 0 {
            Duration::from_millis((attempt as u64 * 17) % jitter_range.max(1))
        } else {
            Duration::ZERO
        };
        (delay + jitter).min(self.max_delay)
    }

    /// Invoke `op`; on error sleep the backoff and retry, up to
    /// `max_attempts` total tries. Returns the last error on exhaustion,
    /// or a shutdown error when the signal fires mid-loop.
    pub async fn do_retry<F, Fut>(&self, mut op: F, label: &str) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut last_err = None;
        for attempt in 1..=self.max_attempts.max(1) {
            if self.shutdown_requested() {
                anyhow::bail!("{}: aborted by shutdown", label);
            }
            match op().await {
                Ok(()) => {
                    if attempt > 1 {
                        tracing::info!(label, attempt, "retry succeeded");
                    }
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(label, attempt, error = %e, "attempt failed");
                    last_err = Some(e);
                }
            }
            if attempt < self.max_attempts {
                let delay = self.delay_for(attempt);
                match &self.shutdown {
                    Some(rx) => {
                        let mut rx = rx.clone();
                        tokio::select! {
                            _ = rx.wait_for(|s| *s) => anyhow::bail!("{}: aborted by shutdown", label),
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    None => tokio::time::sleep(delay).await,
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| anyhow::anyhow!("{}: retry budget exhausted", label)))
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }
}

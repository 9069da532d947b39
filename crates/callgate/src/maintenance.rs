//! Background upkeep: limiter flushes and cache sweeps.

use crate::gate::Gate;
use callgate_core::GateResult;
use callgate_resilience::{RateLimiter, ResponseCache};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const MIN_TICK: Duration = Duration::from_millis(10);

/// Running maintenance task
pub(crate) struct MaintenanceHandle {
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl MaintenanceHandle {
    /// Signal the task and wait for it to exit
    pub(crate) async fn stop(self) {
        let _ = self.shutdown_tx.send(()).await;
        if let Err(e) = self.task.await {
            error!(error = %e, "Maintenance task ended abnormally");
        }
    }
}

async fn flush_tick(limiter: &RateLimiter) {
    match limiter.flush_if_due().await {
        Ok(true) => debug!(limiter = %limiter.name(), "Periodic limiter flush"),
        Ok(false) => {}
        Err(e) => warn!(limiter = %limiter.name(), error = %e, "Periodic limiter flush failed"),
    }
}

async fn sweep_tick(cache: &ResponseCache) {
    match cache.sweep_expired().await {
        Ok(0) => {}
        Ok(removed) => debug!(removed, "Expired cache entries swept"),
        Err(e) => warn!(error = %e, "Cache sweep failed"),
    }
    match cache.enforce_size_cap().await {
        Ok(0) => {}
        Ok(evicted) => info!(evicted, "Persistent cache trimmed to size cap"),
        Err(e) => warn!(error = %e, "Cache size enforcement failed"),
    }
}

impl Gate {
    /// Start the background task that flushes limiter state when due and
    /// sweeps the cache. Returns `false` if it is already running.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn_maintenance(&self) -> bool {
        let mut slot = self.inner.maintenance.lock();
        if slot.is_some() {
            return false;
        }

        let limiter = Arc::clone(&self.inner.limiter);
        let cache = Arc::clone(&self.inner.cache);
        let flush_every = self.inner.config.rate_limit.persist_interval.max(MIN_TICK);
        let sweep_every = self.inner.config.cache.sweep_interval.max(MIN_TICK);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let task = tokio::spawn(async move {
            let mut flush = tokio::time::interval(flush_every);
            let mut sweep = tokio::time::interval(sweep_every);
            flush.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        debug!("Maintenance task shutting down");
                        break;
                    }
                    _ = flush.tick() => flush_tick(&limiter).await,
                    _ = sweep.tick() => sweep_tick(&cache).await,
                }
            }
        });

        info!(
            flush_ms = flush_every.as_millis(),
            sweep_ms = sweep_every.as_millis(),
            "Maintenance task started"
        );
        *slot = Some(MaintenanceHandle { shutdown_tx, task });
        true
    }

    /// Whether the maintenance task is running
    #[must_use]
    pub fn maintenance_running(&self) -> bool {
        self.inner.maintenance.lock().is_some()
    }

    /// Stop maintenance and write all durable state
    ///
    /// # Errors
    /// Returns `Storage` when limiter state or alert dates cannot be
    /// written; both writes are still attempted
    pub async fn shutdown(&self) -> GateResult<()> {
        let handle = self.inner.maintenance.lock().take();
        if let Some(handle) = handle {
            handle.stop().await;
        }

        let limiter = self.inner.limiter.flush().await;
        let alerts = self.inner.alerts.persist().await;
        info!(
            limiter_ok = limiter.is_ok(),
            alerts_ok = alerts.is_ok(),
            "Gate shut down"
        );
        limiter.and(alerts)
    }
}

//! Background maintenance loop.

use std::{sync::Arc, time::Duration};

use {
    anyhow::anyhow,
    mnemo_common::{Error, Result},
    tokio::{task::JoinHandle, time::MissedTickBehavior},
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::engine::MemoryEngine;

/// Runs [`MemoryEngine::run_maintenance`] every `interval` until stopped.
///
/// A pass in progress when [`MaintenanceTask::stop`] is called sees the
/// cancellation and returns early; migration moves already made are kept.
#[derive(Debug)]
pub struct MaintenanceTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl MaintenanceTask {
    /// [`MaintenanceTask::start`] with the engine's `maintenance.interval_secs`.
    pub fn start_from_config(engine: Arc<MemoryEngine>) -> Self {
        let interval = engine.config().maintenance.interval();
        Self::start(engine, interval)
    }

    /// Spawn the loop on the current runtime. The first pass runs one full
    /// interval after start.
    pub fn start(engine: Arc<MemoryEngine>, interval: Duration) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            timer.tick().await;
            info!(interval_secs = interval.as_secs(), "maintenance task started");

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = timer.tick() => {
                        match engine.run_maintenance(&token).await {
                            Ok(report) => debug!(
                                promoted = report.migration.promoted(),
                                demoted = report.migration.demoted(),
                                expired = report.expired_cache_entries,
                                pruned_locks = report.pruned_locks,
                                "maintenance pass complete"
                            ),
                            Err(Error::Cancelled) => debug!("maintenance pass cancelled"),
                            Err(e) => warn!(error = %e, "maintenance pass failed"),
                        }
                    }
                }
            }
            info!("maintenance task stopped");
        });
        Self { cancel, handle }
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Cancel the loop and wait for the current pass to wind down.
    pub async fn stop(self) -> Result<()> {
        self.cancel.cancel();
        self.handle
            .await
            .map_err(|e| anyhow!("maintenance task panicked: {e}").into())
    }
}

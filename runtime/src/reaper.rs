//! Expiry Reaper.
//!
//! Periodically returns expired holds to Available. Each unit goes through the same
//! serialized [`UnitCommand::Expire`] transition as every other writer, so the reaper
//! can run next to the engine and next to other reaper instances: a unit already
//! reclaimed (or re-reserved) by someone else is simply skipped.
//!
//! One failing record never stops a sweep; it is logged and counted.

use crate::metrics::{ReaperMetrics, ReservationMetrics};
use seatkeeper_core::environment::Clock;
use seatkeeper_core::store::{InventoryStore, UnitTransition};
use seatkeeper_core::transition::{TransitionOutcome, UnitCommand};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Reaper settings.
#[derive(Clone, Debug)]
pub struct ReaperSettings {
    /// Time between sweeps
    pub interval: Duration,
    /// Max expired units (and max expired slot holds) handled per sweep
    pub batch_size: u32,
}

impl Default for ReaperSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            batch_size: 500,
        }
    }
}

/// What one sweep did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Seats returned to Available
    pub released: usize,
    /// Slots returned to their pools from expired slot holds
    pub slots_released: u32,
    /// Expired seats another writer got to first
    pub skipped: usize,
    /// Records that failed and were skipped
    pub failures: usize,
}

/// Background sweep over expired holds.
#[derive(Clone)]
pub struct ExpiryReaper {
    store: Arc<dyn InventoryStore>,
    clock: Arc<dyn Clock>,
    settings: ReaperSettings,
}

impl ExpiryReaper {
    /// Create a reaper over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn InventoryStore>, clock: Arc<dyn Clock>, settings: ReaperSettings) -> Self {
        Self {
            store,
            clock,
            settings,
        }
    }

    /// Run one sweep now.
    pub async fn sweep_once(&self) -> SweepReport {
        let started = Instant::now();
        let now = self.clock.now();
        let mut report = SweepReport::default();

        match self.store.expired_units(now, self.settings.batch_size).await {
            Ok(expired) => {
                for unit_id in expired {
                    match self.store.transition_unit(unit_id, UnitCommand::Expire, now).await {
                        Ok(UnitTransition {
                            result: Ok(TransitionOutcome::Applied { .. }),
                            ..
                        }) => {
                            debug!(unit_id = %unit_id, "Expired hold released");
                            report.released += 1;
                        }
                        Ok(_) => {
                            debug!(unit_id = %unit_id, "Hold no longer expired, skipping");
                            report.skipped += 1;
                        }
                        Err(err) => {
                            warn!(unit_id = %unit_id, error = %err, "Failed to release expired hold");
                            ReaperMetrics::record_failure();
                            report.failures += 1;
                        }
                    }
                }
            }
            Err(err) => {
                error!(error = %err, "Failed to scan for expired holds");
                ReaperMetrics::record_failure();
                report.failures += 1;
            }
        }

        match self
            .store
            .sweep_expired_slot_holds(now, self.settings.batch_size)
            .await
        {
            Ok(slots) => report.slots_released = slots,
            Err(err) => {
                error!(error = %err, "Failed to sweep expired slot holds");
                ReaperMetrics::record_failure();
                report.failures += 1;
            }
        }

        ReservationMetrics::record_released("expiry", report.released);
        ReaperMetrics::record_sweep(started.elapsed());

        if report.released > 0 || report.slots_released > 0 || report.failures > 0 {
            info!(
                released = report.released,
                slots_released = report.slots_released,
                skipped = report.skipped,
                failures = report.failures,
                "Reaper sweep finished"
            );
        } else {
            debug!("Reaper sweep found nothing to release");
        }

        report
    }

    /// Spawn the periodic sweep as a background task.
    ///
    /// The task runs until `shutdown` fires (or its sender is dropped).
    #[must_use]
    pub fn spawn(self, shutdown: broadcast::Receiver<()>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run(shutdown).await;
        })
    }

    async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.settings.interval.as_secs(),
            batch_size = self.settings.batch_size,
            "Expiry reaper started"
        );

        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Expiry reaper received shutdown signal");
                    break;
                }
                _ = ticker.tick() => {
                    self.sweep_once().await;
                }
            }
        }

        info!("Expiry reaper stopped");
    }
}

//! Periodic maintenance: block expiry and fraud tracking GC
//!
//! Each job is single-flight. A tick that fires while the previous run of the
//! same job is still executing is skipped, and manual triggers share the same
//! guards as the schedule.

use super::scorer::FraudScorer;
use super::store::BlockStore;
use crate::config::SweeperConfig;
use crate::error::GuardError;
use bastion_common::CleanupReport;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// In-flight marker for one job type
#[derive(Clone, Default)]
struct Flight(Arc<AtomicBool>);

impl Flight {
    fn try_begin(&self) -> Option<FlightGuard> {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlightGuard(self.0.clone()))
    }
}

/// Clears the in-flight marker when the run ends, however it ends
struct FlightGuard(Arc<AtomicBool>);

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Clone)]
pub struct ExpirySweeper {
    store: BlockStore,
    scorer: FraudScorer,
    config: SweeperConfig,
    expiry: Flight,
    gc: Flight,
}

impl ExpirySweeper {
    pub fn new(store: BlockStore, scorer: FraudScorer, config: SweeperConfig) -> Self {
        Self {
            store,
            scorer,
            config,
            expiry: Flight::default(),
            gc: Flight::default(),
        }
    }

    /// Expire due blocks. `Ok(None)` when a run is already in flight.
    pub async fn run_expiry(&self) -> Result<Option<u64>, GuardError> {
        self.run_expiry_at(Utc::now()).await
    }

    pub(crate) async fn run_expiry_at(&self, now: DateTime<Utc>) -> Result<Option<u64>, GuardError> {
        let Some(_flight) = self.expiry.try_begin() else {
            tracing::debug!("Expiry sweep already running, skipping");
            return Ok(None);
        };
        self.store.expire_sweep_at(now).await.map(Some)
    }

    /// Drop idle tracking entries. `None` when a run is already in flight.
    pub fn run_gc(&self) -> Option<usize> {
        self.run_gc_at(Utc::now())
    }

    pub(crate) fn run_gc_at(&self, now: DateTime<Utc>) -> Option<usize> {
        let Some(_flight) = self.gc.try_begin() else {
            tracing::debug!("Tracking GC already running, skipping");
            return None;
        };
        Some(self.scorer.collect_garbage_at(now))
    }

    /// Run both jobs now, outside the schedule
    pub async fn trigger_cleanup(&self) -> Result<CleanupReport, GuardError> {
        let expired_blocks = self.run_expiry().await?;
        let dropped_entries = self.run_gc();
        tracing::info!(
            "Manual cleanup: expired {:?} blocks, dropped {:?} tracking entries",
            expired_blocks,
            dropped_entries
        );
        Ok(CleanupReport {
            expired_blocks,
            dropped_entries,
        })
    }

    /// Start both schedules. Runs until `shutdown_rx` flips to true or its
    /// sender is dropped.
    pub fn spawn(self, mut shutdown_rx: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut expiry_tick = tokio::time::interval(self.config.expiry_interval);
            let mut gc_tick = tokio::time::interval(self.config.tracking_gc_interval);
            expiry_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            gc_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

            tracing::info!(
                "Sweeper started (expiry every {}s, tracking GC every {}s)",
                self.config.expiry_interval.as_secs(),
                self.config.tracking_gc_interval.as_secs()
            );

            loop {
                tokio::select! {
                    _ = expiry_tick.tick() => {
                        let sweeper = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = sweeper.run_expiry().await {
                                tracing::error!("Expiry sweep failed: {}", e);
                            }
                        });
                    }
                    _ = gc_tick.tick() => {
                        let sweeper = self.clone();
                        tokio::spawn(async move {
                            sweeper.run_gc();
                        });
                    }
                    changed = shutdown_rx.changed() => {
                        // A dropped sender counts as shutdown
                        if changed.is_err() || *shutdown_rx.borrow() {
                            tracing::info!("Sweeper shutting down");
                            break;
                        }
                    }
                }
            }
        })
    }
}

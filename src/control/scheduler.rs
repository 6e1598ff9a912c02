//! Periodic tick driver.
//!
//! One background task invokes the controller at a fixed interval. A
//! tick that would overlap a running one is skipped, never queued, and
//! shutdown waits for the in-flight tick to finish.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::controller::{Controller, TickOutcome};

/// Drives `Controller::tick` on a schedule.
pub struct TickScheduler {
    controller: Arc<Controller>,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl TickScheduler {
    pub fn new(
        controller: Arc<Controller>,
        interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            controller,
            interval,
            shutdown,
        }
    }

    /// Start the background worker.
    pub fn spawn(mut self) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    async fn run(&mut self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval = ?self.interval, "tick scheduler started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.shutdown.changed() => {}
            }
            if *self.shutdown.borrow() {
                break;
            }

            // Not inside the select: a shutdown signal arriving now
            // waits for the tick to complete instead of cancelling it.
            match self.controller.try_tick().await {
                TickOutcome::Completed(report) => {
                    debug!(
                        positions = report.position_count,
                        topups = report.emergency_topups.len(),
                        "tick completed"
                    );
                }
                TickOutcome::Skipped => {
                    debug!("previous tick still running, skipping");
                }
                TickOutcome::Aborted(reason) => {
                    warn!(%reason, "tick aborted");
                }
            }
        }

        info!("tick scheduler stopped");
    }

    /// Drive exactly one tick, waiting for the lock. Test hook.
    pub async fn run_once(&self) -> TickOutcome {
        self.controller.tick().await
    }
}

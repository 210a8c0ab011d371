//! The per-unit polling loop.
//!
//! One task per unit ticks the orchestrator's step functions on a
//! fixed interval. Steps are fault-isolated: a failing step is logged
//! and the remaining steps still run on the same tick. A step that
//! keeps failing across consecutive ticks is surfaced to operators
//! once, rather than on every tick.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::orchestrator::{OpError, Orchestrator};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Checkin,
    Distribution,
    Cleanup,
    Rollover,
}

impl Step {
    const ALL: [Self; 4] = [
        Self::Checkin,
        Self::Distribution,
        Self::Cleanup,
        Self::Rollover,
    ];

    const fn name(self) -> &'static str {
        match self {
            Self::Checkin => "checkin",
            Self::Distribution => "distribution",
            Self::Cleanup => "cleanup",
            Self::Rollover => "rollover",
        }
    }
}

/// The polling driver for one unit.
pub struct AutomationLoop {
    orchestrator: Arc<Orchestrator>,
    tick: Duration,
    alert_after: u32,
    failures: [u32; Step::ALL.len()],
}

impl AutomationLoop {
    /// Creates a loop for one unit.
    #[must_use]
    pub fn new(orchestrator: Arc<Orchestrator>, tick: Duration, alert_after: u32) -> Self {
        Self {
            orchestrator,
            tick,
            alert_after: alert_after.max(1),
            failures: [0; Step::ALL.len()],
        }
    }

    /// Runs until the shutdown signal flips.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick_once().await;
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!(unit = %self.orchestrator.unit(), "automation loop stopping");
                        return;
                    }
                },
            }
        }
    }

    /// One pass over all steps, in order. Public so tests can drive
    /// the loop with a deterministic clock instead of real time.
    pub async fn tick_once(&mut self) {
        for (index, step) in Step::ALL.into_iter().enumerate() {
            let result = match step {
                Step::Checkin => self.orchestrator.tick_checkin().await,
                Step::Distribution => self.orchestrator.tick_distribution().await,
                Step::Cleanup => self.orchestrator.tick_cleanup().await,
                Step::Rollover => self.orchestrator.tick_rollover().await,
            };
            self.settle(index, step, result).await;
        }
    }

    async fn settle(&mut self, index: usize, step: Step, result: Result<(), OpError>) {
        match result {
            Ok(()) => {
                self.failures[index] = 0;
            },
            Err(e) => {
                self.failures[index] += 1;
                let unit = self.orchestrator.unit();
                warn!(
                    unit = %unit,
                    step = step.name(),
                    consecutive = self.failures[index],
                    error = %e,
                    "automation step failed; retrying next tick"
                );
                // Surface persistent failures to operators exactly
                // once per streak.
                if self.failures[index] == self.alert_after {
                    self.orchestrator
                        .alert_step_failure(step.name(), self.failures[index], &e)
                        .await;
                }
            },
        }
    }
}

//! Health Monitor
//!
//! Polls queue error counters once per period. Polling bounds detection
//! latency to one period and keeps a burst of errors from turning into a
//! burst of failovers.

use crate::config::HealthConfig;
use crate::failover::{FailoverController, FailoverOutcome};
use crate::queue::QueueStatus;
use crate::registry::QueueRegistry;
use arc_swap::ArcSwap;
use mqnic_common::QueueId;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

/// Result of one health pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthReport {
    /// Queues evaluated
    pub checked: usize,
    /// Queues newly marked Degraded
    pub degraded: Vec<QueueId>,
    /// Degraded queues back to Active
    pub restored: Vec<QueueId>,
    /// Failures reported and what the controller did
    pub failures: Vec<FailoverOutcome>,
    /// Queues reclaimed by the recovery sweep
    pub recovered: Vec<QueueId>,
    /// Failures the controller could not act on
    pub errors: usize,
    /// Pass skipped because failover is disabled
    pub skipped: bool,
}

/// Health verdict for one queue's counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Verdict {
    /// Below both thresholds
    Healthy,
    /// Above the degraded threshold
    Degraded,
    /// Above the failure threshold
    Breached,
}

/// Periodic error-counter evaluator
pub struct HealthMonitor {
    registry: Arc<QueueRegistry>,
    failover: Arc<FailoverController>,
    config: ArcSwap<HealthConfig>,
}

impl HealthMonitor {
    /// Create monitor
    pub fn new(registry: Arc<QueueRegistry>, failover: Arc<FailoverController>, config: HealthConfig) -> Self {
        Self {
            registry,
            failover,
            config: ArcSwap::from_pointee(config),
        }
    }

    /// Swap in new settings
    pub fn set_config(&self, config: HealthConfig) {
        self.config.store(Arc::new(config));
    }

    /// Classify error counts against the thresholds
    pub fn evaluate(&self, rx_errors: u64, tx_errors: u64) -> Verdict {
        let config = self.config.load();
        if rx_errors > config.failure_threshold || tx_errors > config.failure_threshold {
            Verdict::Breached
        } else if rx_errors > config.degraded_threshold || tx_errors > config.degraded_threshold {
            Verdict::Degraded
        } else {
            Verdict::Healthy
        }
    }

    /// Run one pass at `now_ms`: evaluate every queue, report breaches,
    /// then run the recovery sweep. Errors are logged and the pass goes on.
    pub fn check(&self, now_ms: u64) -> HealthReport {
        let mut report = HealthReport::default();
        if !self.failover.is_enabled() {
            report.skipped = true;
            return report;
        }

        // Failed queues are evaluated too: a breach refreshes their record
        // and retries the remap.
        for stats in self.registry.snapshots() {
            let queue_id = stats.queue_id;
            report.checked += 1;

            match self.evaluate(stats.counters.rx_errors, stats.counters.tx_errors) {
                Verdict::Breached => {
                    warn!(
                        queue = queue_id,
                        rx_errors = stats.counters.rx_errors,
                        tx_errors = stats.counters.tx_errors,
                        "Error threshold breached"
                    );
                    match self.failover.report_failure(queue_id) {
                        Ok(outcome) => report.failures.push(outcome),
                        Err(e) => {
                            warn!(queue = queue_id, error = %e, "Failure not handled");
                            report.errors += 1;
                        }
                    }
                }
                Verdict::Degraded => {
                    let changed = self.registry.update_status(queue_id, |status, _| {
                        (status == QueueStatus::Active).then_some(QueueStatus::Degraded)
                    });
                    match changed {
                        Ok(Some(_)) => report.degraded.push(queue_id),
                        Ok(None) => {}
                        Err(e) => debug!(queue = queue_id, error = %e, "Degrade skipped"),
                    }
                }
                Verdict::Healthy => {
                    let changed = self.registry.update_status(queue_id, |status, _| {
                        (status == QueueStatus::Degraded).then_some(QueueStatus::Active)
                    });
                    match changed {
                        Ok(Some(_)) => report.restored.push(queue_id),
                        Ok(None) => {}
                        Err(e) => debug!(queue = queue_id, error = %e, "Restore skipped"),
                    }
                }
            }
        }

        report.recovered = self.failover.recovery_sweep(now_ms);
        report
    }
}

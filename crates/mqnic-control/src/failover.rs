//! Failover Controller
//!
//! Per-queue state machine driven by the health monitor:
//!
//! ```text
//!   Active ──breach──▶ Failed ──remap──▶ Recovering ──window──▶ Active
//!                       │  ▲                   │
//!                       └──┘ breach            └── breach: refresh record
//!              (refresh record, retry remap)
//! ```
//!
//! Failure Records are keyed by queue id. A device-wide failover counter
//! caps automatic remaps; once it is reached further failures are still
//! recorded but no flows move. Every recorded breach zeroes the queue's
//! error counters, so the next one needs fresh errors and a quiet queue
//! ages out through the recovery sweep.

use crate::config::FailoverConfig;
use crate::queue::QueueStatus;
use crate::registry::QueueRegistry;
use arc_swap::ArcSwap;
use mqnic_common::{FlowId, NicError, NicResult, QueueId};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Tracks a queue after a threshold breach
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FailureRecord {
    pub queue_id: QueueId,
    /// Breaches since the record was opened
    pub failure_count: u32,
    /// Latest breach; the recovery window counts from here
    pub last_failure_ms: u64,
    /// First breach
    pub detected_at_ms: u64,
}

/// What `report_failure` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverOutcome {
    /// Flows moved to `to`; source now Recovering
    Remapped {
        from: QueueId,
        to: QueueId,
        flows_moved: usize,
    },
    /// Breaker open; failure recorded, nothing moved
    Suppressed {
        queue_id: QueueId,
        failure_count: u32,
    },
    /// Queue was already Recovering; record refreshed, recovery postponed
    Refreshed {
        queue_id: QueueId,
        failure_count: u32,
    },
}

/// How a remap was initiated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailoverTrigger {
    /// Health monitor breach
    Automatic,
    /// `remap_queue` call
    Manual,
}

/// Completed remap
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailoverEvent {
    pub from: QueueId,
    pub to: QueueId,
    pub flows_moved: usize,
    pub trigger: FailoverTrigger,
    pub at_ms: u64,
}

/// Failover statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FailoverStats {
    pub failover_count: u32,
    pub active_queues: usize,
    pub degraded_queues: usize,
    pub failed_queues: usize,
    pub recovering_queues: usize,
    pub total_failures: u64,
    pub max_failure_count: u32,
    pub enabled: bool,
}

/// Failure state machine and remap policy
pub struct FailoverController {
    registry: Arc<QueueRegistry>,
    config: ArcSwap<FailoverConfig>,
    records: Mutex<BTreeMap<QueueId, FailureRecord>>,
    failovers: AtomicU32,
    history: RwLock<VecDeque<FailoverEvent>>,
}

impl FailoverController {
    /// Create controller over `registry`
    pub fn new(registry: Arc<QueueRegistry>, config: FailoverConfig) -> Self {
        Self {
            registry,
            config: ArcSwap::from_pointee(config),
            records: Mutex::new(BTreeMap::new()),
            failovers: AtomicU32::new(0),
            history: RwLock::new(VecDeque::new()),
        }
    }

    /// Swap in new settings
    pub fn set_config(&self, config: FailoverConfig) {
        self.config.store(Arc::new(config));
    }

    /// Current settings
    pub fn config(&self) -> Arc<FailoverConfig> {
        self.config.load_full()
    }

    /// Is automatic failover enabled
    pub fn is_enabled(&self) -> bool {
        self.config.load().enabled
    }

    /// Insert or bump the record of `queue_id`; returns the new count.
    fn upsert_record(&self, queue_id: QueueId, now: u64) -> u32 {
        let mut records = self.records.lock();
        let record = records.entry(queue_id).or_insert(FailureRecord {
            queue_id,
            failure_count: 0,
            last_failure_ms: now,
            detected_at_ms: now,
        });
        record.failure_count += 1;
        record.last_failure_ms = now;
        record.failure_count
    }

    /// Handle a threshold breach on `queue_id`.
    ///
    /// Marks the queue Failed and, while under the failover cap, moves all
    /// of its flows to [`find_replacement`](Self::find_replacement). A queue
    /// that is already Failed gets its record refreshed and the remap is
    /// attempted again. A failed migration releases the failover slot and
    /// is returned to the caller; it is not retried here.
    pub fn report_failure(&self, queue_id: QueueId) -> NicResult<FailoverOutcome> {
        let queue = self.registry.queue(queue_id)?;
        let now = self.registry.clock().now_ms();
        let failure_count = self.upsert_record(queue_id, now);

        if queue.status() == QueueStatus::Recovering {
            self.registry.reset_errors(queue_id, QueueStatus::Recovering)?;
            warn!(queue = queue_id, failures = failure_count, "Breach while recovering");
            return Ok(FailoverOutcome::Refreshed {
                queue_id,
                failure_count,
            });
        }

        let prev = self.registry.reset_errors(queue_id, QueueStatus::Failed)?;
        if prev == QueueStatus::Failed {
            warn!(queue = queue_id, failures = failure_count, "Breach while failed");
        } else {
            warn!(queue = queue_id, failures = failure_count, "Queue failed");
        }

        let cap = self.config.load().max_failover_count;
        let reserved = self
            .failovers
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < cap).then_some(n + 1))
            .is_ok();
        if !reserved {
            warn!(
                queue = queue_id,
                failures = failure_count,
                cap,
                "Failover limit reached, remap suppressed"
            );
            return Ok(FailoverOutcome::Suppressed {
                queue_id,
                failure_count,
            });
        }

        match self.remap(queue_id, None, FailoverTrigger::Automatic, now) {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.failovers.fetch_sub(1, Ordering::AcqRel);
                error!(queue = queue_id, error = %e, "Failover remap failed");
                Err(e)
            }
        }
    }

    /// Remap `from` to `to`, or to the best replacement when `to` is None.
    ///
    /// Manual remaps do not count against the failover cap. The source goes
    /// through Failed to Recovering and gets a Failure Record if it had none.
    pub fn remap_queue(&self, from: QueueId, to: Option<QueueId>) -> NicResult<FailoverOutcome> {
        if to == Some(from) {
            return Err(NicError::SameQueue(from));
        }
        self.registry.queue(from)?;
        if let Some(to) = to {
            self.registry.queue(to)?;
        }
        let now = self.registry.clock().now_ms();
        {
            let mut records = self.records.lock();
            let record = records.entry(from).or_insert(FailureRecord {
                queue_id: from,
                failure_count: 1,
                last_failure_ms: now,
                detected_at_ms: now,
            });
            record.last_failure_ms = now;
        }
        self.registry.set_status(from, QueueStatus::Failed)?;
        self.remap(from, to, FailoverTrigger::Manual, now)
    }

    fn remap(
        &self,
        from: QueueId,
        to: Option<QueueId>,
        trigger: FailoverTrigger,
        now: u64,
    ) -> NicResult<FailoverOutcome> {
        let to = match to {
            Some(to) => to,
            None => self.find_replacement(from)?,
        };
        let flows_moved = self.registry.migrate_all(from, to)?;
        self.registry.reset_errors(from, QueueStatus::Recovering)?;

        info!(from, to, flows = flows_moved, ?trigger, "Queue remapped");
        self.push_history(FailoverEvent {
            from,
            to,
            flows_moved,
            trigger,
            at_ms: now,
        });
        Ok(FailoverOutcome::Remapped {
            from,
            to,
            flows_moved,
        })
    }

    fn push_history(&self, event: FailoverEvent) {
        let limit = self.config.load().history_len;
        let mut history = self.history.write();
        history.push_back(event);
        while history.len() > limit {
            history.pop_front();
        }
    }

    /// Non-failed queue (other than `exclude`) with the fewest rx+tx
    /// errors; ties go to the lowest id.
    pub fn find_replacement(&self, exclude: QueueId) -> NicResult<QueueId> {
        self.registry
            .snapshots()
            .into_iter()
            .filter(|s| s.queue_id != exclude && s.status != QueueStatus::Failed)
            .min_by_key(|s| (s.counters.error_sum(), s.queue_id))
            .map(|s| s.queue_id)
            .ok_or(NicError::NoReplacement(exclude))
    }

    /// Clear records idle past the recovery window and reactivate their
    /// queues. Returns the reclaimed queue ids; a second call with no new
    /// failures returns nothing.
    pub fn recovery_sweep(&self, now_ms: u64) -> Vec<QueueId> {
        let window = self.config.load().recovery_window_ms;
        let expired: Vec<QueueId> = {
            let mut records = self.records.lock();
            let ids: Vec<QueueId> = records
                .values()
                .filter(|r| now_ms.saturating_sub(r.last_failure_ms) > window)
                .map(|r| r.queue_id)
                .collect();
            for id in &ids {
                records.remove(id);
            }
            ids
        };

        for &queue_id in &expired {
            match self.registry.reset_errors(queue_id, QueueStatus::Active) {
                Ok(_) => info!(queue = queue_id, "Queue recovered"),
                Err(e) => warn!(queue = queue_id, error = %e, "Recovery sweep skipped queue"),
            }
        }
        expired
    }

    /// Move one flow to `new_queue`, wherever it is now.
    ///
    /// Scans every queue's table. Returns the previous owner, or `None`
    /// if the flow already lives on `new_queue`.
    pub fn reassign_single_flow(&self, flow_id: FlowId, new_queue: QueueId) -> NicResult<Option<QueueId>> {
        self.registry.queue(new_queue)?;
        let current = self
            .registry
            .locate_flow(flow_id)
            .ok_or(NicError::FlowNotFound {
                flow_id,
                queue_id: new_queue,
            })?;

        if current == new_queue {
            debug!(flow = flow_id, queue = new_queue, "Flow already placed");
            return Ok(None);
        }
        self.registry.migrate_flow(flow_id, current, new_queue)?;
        info!(flow = flow_id, from = current, to = new_queue, "Flow reassigned");
        Ok(Some(current))
    }

    /// Record of one queue
    pub fn record(&self, queue_id: QueueId) -> Option<FailureRecord> {
        self.records.lock().get(&queue_id).copied()
    }

    /// All open records, ascending by queue id
    pub fn records(&self) -> Vec<FailureRecord> {
        self.records.lock().values().copied().collect()
    }

    /// Automatic remaps performed so far
    pub fn failover_count(&self) -> u32 {
        self.failovers.load(Ordering::Acquire)
    }

    /// Recent remaps, oldest first
    pub fn history(&self) -> Vec<FailoverEvent> {
        self.history.read().iter().cloned().collect()
    }

    /// Get statistics
    pub fn stats(&self) -> FailoverStats {
        let mut stats = FailoverStats {
            failover_count: self.failover_count(),
            enabled: self.is_enabled(),
            ..Default::default()
        };
        for queue in self.registry.queues() {
            match queue.status() {
                QueueStatus::Active => stats.active_queues += 1,
                QueueStatus::Degraded => stats.degraded_queues += 1,
                QueueStatus::Failed => stats.failed_queues += 1,
                QueueStatus::Recovering => stats.recovering_queues += 1,
            }
        }
        for record in self.records.lock().values() {
            stats.total_failures += record.failure_count as u64;
            stats.max_failure_count = stats.max_failure_count.max(record.failure_count);
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mqnic_common::{Direction, ManualClock};

    fn setup(n: u32) -> (Arc<ManualClock>, Arc<QueueRegistry>, FailoverController) {
        let clock = Arc::new(ManualClock::new(1_000));
        let registry = Arc::new(QueueRegistry::new(n as usize, 64, clock.clone()));
        for id in 0..n {
            registry.register_queue(id, 0).unwrap();
        }
        let controller = FailoverController::new(registry.clone(), FailoverConfig::default());
        (clock, registry, controller)
    }

    fn errors(registry: &QueueRegistry, queue: QueueId, n: u64) {
        for _ in 0..n {
            registry.record_error(queue, Direction::Rx).unwrap();
        }
    }

    #[test]
    fn test_find_replacement() {
        let (_, registry, controller) = setup(4);
        errors(&registry, 0, 5);
        errors(&registry, 1, 2);
        errors(&registry, 3, 2);

        // Queue 2 excluded; 1 and 3 tie, lowest id wins
        assert_eq!(controller.find_replacement(2).unwrap(), 1);

        registry.set_status(1, QueueStatus::Failed).unwrap();
        assert_eq!(controller.find_replacement(2).unwrap(), 3);
    }

    #[test]
    fn test_no_replacement() {
        let (_, registry, controller) = setup(2);
        registry.set_status(1, QueueStatus::Failed).unwrap();
        assert!(matches!(controller.find_replacement(0), Err(NicError::NoReplacement(0))));
    }

    #[test]
    fn test_report_failure_remaps() {
        let (_, registry, controller) = setup(3);
        registry.record_tx(1, 100, 10).unwrap();
        registry.record_tx(1, 101, 10).unwrap();
        errors(&registry, 0, 3);
        errors(&registry, 1, 50);

        let outcome = controller.report_failure(1).unwrap();
        assert_eq!(
            outcome,
            FailoverOutcome::Remapped { from: 1, to: 2, flows_moved: 2 }
        );
        assert_eq!(registry.status(1).unwrap(), QueueStatus::Recovering);
        assert_eq!(registry.snapshot(1).unwrap().counters.error_sum(), 0);
        assert_eq!(registry.flow_owner(100), Some(2));
        assert_eq!(controller.record(1).unwrap().failure_count, 1);
        assert_eq!(controller.failover_count(), 1);
        assert_eq!(controller.history().len(), 1);
    }

    #[test]
    fn test_failed_remap_releases_slot() {
        let (_, registry, controller) = setup(2);
        registry.set_status(1, QueueStatus::Failed).unwrap();

        assert!(matches!(controller.report_failure(0), Err(NicError::NoReplacement(0))));
        assert_eq!(controller.failover_count(), 0);
        assert_eq!(registry.status(0).unwrap(), QueueStatus::Failed);
        assert!(controller.record(0).is_some());
    }

    #[test]
    fn test_breach_while_failed_refreshes() {
        let (clock, registry, controller) = setup(2);
        controller.set_config(FailoverConfig {
            max_failover_count: 0,
            ..Default::default()
        });
        errors(&registry, 0, 1001);
        let outcome = controller.report_failure(0).unwrap();
        assert_eq!(outcome, FailoverOutcome::Suppressed { queue_id: 0, failure_count: 1 });
        assert_eq!(registry.snapshot(0).unwrap().counters.error_sum(), 0);

        clock.advance(std::time::Duration::from_millis(4_000));
        errors(&registry, 0, 1001);
        let outcome = controller.report_failure(0).unwrap();
        assert_eq!(outcome, FailoverOutcome::Suppressed { queue_id: 0, failure_count: 2 });

        let record = controller.record(0).unwrap();
        assert_eq!(record.detected_at_ms, 1_000);
        assert_eq!(record.last_failure_ms, 5_000);
        assert_eq!(registry.status(0).unwrap(), QueueStatus::Failed);

        // Window counts from the latest breach
        assert!(controller.recovery_sweep(6_001).is_empty());
        assert_eq!(controller.recovery_sweep(10_001), vec![0]);
    }

    #[test]
    fn test_breach_while_recovering_refreshes() {
        let (clock, registry, controller) = setup(2);
        controller.report_failure(0).unwrap();
        let first = controller.record(0).unwrap();

        clock.advance(std::time::Duration::from_millis(3_000));
        errors(&registry, 0, 10);
        let outcome = controller.report_failure(0).unwrap();
        assert_eq!(outcome, FailoverOutcome::Refreshed { queue_id: 0, failure_count: 2 });

        let record = controller.record(0).unwrap();
        assert_eq!(record.detected_at_ms, first.detected_at_ms);
        assert_eq!(record.last_failure_ms, 4_000);
        assert_eq!(registry.snapshot(0).unwrap().counters.error_sum(), 0);
        assert_eq!(controller.failover_count(), 1);
    }

    #[test]
    fn test_recovery_sweep() {
        let (_, registry, controller) = setup(2);
        controller.report_failure(0).unwrap();

        assert!(controller.recovery_sweep(6_000).is_empty());
        assert_eq!(controller.recovery_sweep(6_001), vec![0]);
        assert_eq!(registry.status(0).unwrap(), QueueStatus::Active);
        assert!(controller.records().is_empty());
        assert!(controller.recovery_sweep(6_001).is_empty());
    }

    #[test]
    fn test_manual_remap() {
        let (_, registry, controller) = setup(3);
        registry.record_rx(0, 9, 1).unwrap();

        let outcome = controller.remap_queue(0, Some(2)).unwrap();
        assert_eq!(outcome, FailoverOutcome::Remapped { from: 0, to: 2, flows_moved: 1 });
        assert_eq!(controller.failover_count(), 0);
        assert_eq!(controller.history()[0].trigger, FailoverTrigger::Manual);
        assert!(matches!(controller.remap_queue(1, Some(1)), Err(NicError::SameQueue(1))));
    }

    #[test]
    fn test_reassign_single_flow() {
        let (_, registry, controller) = setup(3);
        registry.record_tx(0, 42, 100).unwrap();

        assert_eq!(controller.reassign_single_flow(42, 2).unwrap(), Some(0));
        assert_eq!(registry.locate_flow(42), Some(2));
        assert_eq!(controller.reassign_single_flow(42, 2).unwrap(), None);
        assert!(matches!(
            controller.reassign_single_flow(7, 1),
            Err(NicError::FlowNotFound { flow_id: 7, .. })
        ));
    }

    #[test]
    fn test_history_bounded() {
        let (_, _, controller) = setup(2);
        controller.set_config(FailoverConfig {
            history_len: 2,
            ..Default::default()
        });
        for _ in 0..3 {
            controller.remap_queue(0, Some(1)).unwrap();
            controller.remap_queue(1, Some(0)).unwrap();
        }
        assert_eq!(controller.history().len(), 2);
    }

    #[test]
    fn test_stats() {
        let (_, registry, controller) = setup(4);
        controller.report_failure(3).unwrap();
        registry.set_status(1, QueueStatus::Failed).unwrap();

        let stats = controller.stats();
        assert_eq!(stats.failover_count, 1);
        assert_eq!(stats.active_queues, 2);
        assert_eq!(stats.failed_queues, 1);
        assert_eq!(stats.recovering_queues, 1);
        assert_eq!(stats.total_failures, 1);
        assert!(stats.enabled);
    }
}

//! Queue Registry
//!
//! Fixed-size collection of [`Queue`] records, allocated once. Each queue
//! owns its [`FlowTable`](crate::flow::FlowTable); a device-wide flow
//! directory (`DashMap<FlowId, QueueId>`) indexes the current owner of every
//! flow so a flow id can only ever be admitted by one queue.
//!
//! # Locking
//!
//! - Per-queue `Mutex`: all counter and flow-table mutation.
//! - Directory shards: only ever taken while already holding the owning
//!   queue lock(s), never the other way around.
//! - Cross-queue operations lock queues in ascending id order.

use crate::flow::{FlowEntry, FlowSnapshot, FlowTableError};
use crate::queue::{Queue, QueueInner, QueueStats, QueueStatus};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use mqnic_common::{Clock, Direction, FlowId, NicError, NicResult, NumaNode, QueueId};
use parking_lot::MutexGuard;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

/// Shared handle to a registered queue
pub type QueueHandle = Arc<Queue>;

/// Owner of all queues and, through them, all flows
pub struct QueueRegistry {
    slots: Box<[OnceLock<QueueHandle>]>,
    registered: AtomicUsize,
    directory: DashMap<FlowId, QueueId>,
    max_flows_per_queue: usize,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for QueueRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueRegistry")
            .field("capacity", &self.slots.len())
            .field("registered", &self.len())
            .field("flows", &self.directory.len())
            .finish()
    }
}

impl QueueRegistry {
    /// Create a registry with room for `max_queues` queues
    pub fn new(max_queues: usize, max_flows_per_queue: usize, clock: Arc<dyn Clock>) -> Self {
        let slots = (0..max_queues).map(|_| OnceLock::new()).collect();
        Self {
            slots,
            registered: AtomicUsize::new(0),
            directory: DashMap::new(),
            max_flows_per_queue,
            clock,
        }
    }

    /// Register queue `id` on `numa_node`
    pub fn register_queue(&self, id: QueueId, numa_node: NumaNode) -> NicResult<QueueHandle> {
        let slot = self.slots.get(id as usize).ok_or(NicError::CapacityExceeded {
            id,
            max: self.slots.len(),
        })?;

        let queue = Arc::new(Queue::new(id, numa_node, self.max_flows_per_queue));
        slot.set(Arc::clone(&queue))
            .map_err(|_| NicError::QueueExists(id))?;
        self.registered.fetch_add(1, Ordering::AcqRel);

        debug!(queue = id, numa = numa_node, "Queue registered");
        Ok(queue)
    }

    /// Lookup queue
    #[inline]
    pub fn queue(&self, id: QueueId) -> NicResult<&QueueHandle> {
        self.slots
            .get(id as usize)
            .and_then(OnceLock::get)
            .ok_or(NicError::QueueNotFound(id))
    }

    /// Registered queues in ascending id order
    pub fn queues(&self) -> impl Iterator<Item = &QueueHandle> {
        self.slots.iter().filter_map(OnceLock::get)
    }

    /// Registered queue ids in ascending order
    pub fn queue_ids(&self) -> Vec<QueueId> {
        self.queues().map(|q| q.id()).collect()
    }

    /// Number of registered queues
    pub fn len(&self) -> usize {
        self.registered.load(Ordering::Acquire)
    }

    /// No queue registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fixed capacity
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Clock used for flow timestamps
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    // =========================================================================
    // Packet path
    // =========================================================================

    /// Account a transmitted packet
    #[inline]
    pub fn record_tx(&self, queue_id: QueueId, flow_id: FlowId, bytes: u64) -> NicResult<()> {
        self.record(queue_id, flow_id, bytes, Direction::Tx)
    }

    /// Account a received packet
    #[inline]
    pub fn record_rx(&self, queue_id: QueueId, flow_id: FlowId, bytes: u64) -> NicResult<()> {
        self.record(queue_id, flow_id, bytes, Direction::Rx)
    }

    /// Update queue and flow counters, creating the flow on first sight.
    ///
    /// Fails without mutating anything if the flow is owned by another
    /// queue, the queue is Failed (new flows only) or its table is full.
    pub fn record(&self, queue_id: QueueId, flow_id: FlowId, bytes: u64, dir: Direction) -> NicResult<()> {
        let queue = self.queue(queue_id)?;
        let now = self.clock.now_ms();
        let mut guard = queue.lock();
        let inner = &mut *guard;

        if let Some(entry) = inner.flows.get_mut(flow_id) {
            entry.update(bytes, now);
            inner.counters.record(dir, bytes);
            return Ok(());
        }

        if queue.status() == QueueStatus::Failed {
            return Err(NicError::QueueFailed(queue_id));
        }

        match self.directory.entry(flow_id) {
            Entry::Occupied(owner) if *owner.get() != queue_id => {
                return Err(NicError::FlowMigrated {
                    flow_id,
                    owner: *owner.get(),
                });
            }
            Entry::Occupied(_) => {
                // Directory entry without a table entry; re-admit.
                inner
                    .flows
                    .insert_new(flow_id, now)
                    .map_err(|_| NicError::FlowTableFull(queue_id))?
                    .update(bytes, now);
            }
            Entry::Vacant(slot) => {
                inner
                    .flows
                    .insert_new(flow_id, now)
                    .map_err(|_| NicError::FlowTableFull(queue_id))?
                    .update(bytes, now);
                slot.insert(queue_id);
            }
        }
        inner.counters.record(dir, bytes);
        Ok(())
    }

    /// Add a latency sample to a flow, wherever it currently lives
    pub fn record_flow_latency(&self, flow_id: FlowId, latency_ns: u64) -> NicResult<()> {
        let owner = self.flow_owner(flow_id).ok_or(NicError::FlowNotFound {
            flow_id,
            queue_id: QueueId::MAX,
        })?;
        let queue = self.queue(owner)?;
        let mut inner = queue.lock();
        match inner.flows.get_mut(flow_id) {
            Some(entry) => {
                entry.add_latency(latency_ns);
                Ok(())
            }
            None => Err(NicError::FlowNotFound { flow_id, queue_id: owner }),
        }
    }

    /// Count an error against a queue
    pub fn record_error(&self, queue_id: QueueId, dir: Direction) -> NicResult<()> {
        self.queue(queue_id)?.lock().counters.record_error(dir);
        Ok(())
    }

    /// Count a dropped packet against a queue
    pub fn record_drop(&self, queue_id: QueueId, dir: Direction) -> NicResult<()> {
        self.queue(queue_id)?.lock().counters.record_drop(dir);
        Ok(())
    }

    /// Account `n` submitted buffers
    #[inline]
    pub fn begin_work(&self, queue_id: QueueId, n: u64) -> NicResult<()> {
        self.queue(queue_id)?.add_pending(n);
        Ok(())
    }

    /// Account `n` completions; fails if more than outstanding
    #[inline]
    pub fn complete_work(&self, queue_id: QueueId, n: u64) -> NicResult<u64> {
        self.queue(queue_id)?.sub_pending(n)
    }

    /// Pending work summed over all queues
    pub fn aggregate_pending(&self) -> u64 {
        self.queues().map(|q| q.pending()).sum()
    }

    /// Pick the queue for a flow: its owner if known, else `flow_id % N`
    /// probing forward past Failed queues.
    pub fn steer(&self, flow_id: FlowId) -> NicResult<QueueId> {
        if let Some(owner) = self.flow_owner(flow_id) {
            return Ok(owner);
        }

        let n = self.slots.len();
        let count = self.len();
        if count == 0 {
            return Err(NicError::QueueNotFound(0));
        }
        let start = flow_id as usize % count;
        for k in 0..n {
            let id = ((start + k) % n) as QueueId;
            if let Ok(queue) = self.queue(id) {
                if queue.status() != QueueStatus::Failed {
                    return Ok(id);
                }
            }
        }
        Err(NicError::QueueFailed(start as QueueId))
    }

    // =========================================================================
    // Status
    // =========================================================================

    /// Current status of a queue
    pub fn status(&self, queue_id: QueueId) -> NicResult<QueueStatus> {
        Ok(self.queue(queue_id)?.status())
    }

    /// Set status; returns the previous one
    pub fn set_status(&self, queue_id: QueueId, status: QueueStatus) -> NicResult<QueueStatus> {
        let queue = self.queue(queue_id)?;
        let guard = queue.lock();
        let prev = queue.set_status(&guard, status);
        drop(guard);

        if prev != status {
            info!(queue = queue_id, from = %prev, to = %status, "Queue status changed");
        }
        Ok(prev)
    }

    /// Zero the error counters and set status in one critical section
    pub fn reset_errors(&self, queue_id: QueueId, status: QueueStatus) -> NicResult<QueueStatus> {
        let queue = self.queue(queue_id)?;
        let mut guard = queue.lock();
        guard.counters.reset_errors();
        let prev = queue.set_status(&guard, status);
        drop(guard);

        if prev != status {
            info!(queue = queue_id, from = %prev, to = %status, "Queue status changed");
        }
        Ok(prev)
    }

    /// Change status only if `f` returns a new one for the current state.
    pub fn update_status<F>(&self, queue_id: QueueId, f: F) -> NicResult<Option<QueueStatus>>
    where
        F: FnOnce(QueueStatus, &QueueStats) -> Option<QueueStatus>,
    {
        let queue = self.queue(queue_id)?;
        let guard = queue.lock();
        let stats = QueueStats {
            queue_id,
            numa_node: queue.numa_node(),
            cpu_id: queue.cpu(),
            status: queue.status(),
            pending: queue.pending(),
            flow_count: guard.flows.len(),
            counters: guard.counters,
        };
        let next = f(stats.status, &stats);
        if let Some(status) = next {
            queue.set_status(&guard, status);
            drop(guard);
            info!(queue = queue_id, from = %stats.status, to = %status, "Queue status changed");
        }
        Ok(next)
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    /// Point-in-time copy of one queue
    pub fn snapshot(&self, queue_id: QueueId) -> NicResult<QueueStats> {
        Ok(self.queue(queue_id)?.snapshot())
    }

    /// Snapshot of every queue, taken one queue at a time
    pub fn snapshots(&self) -> Vec<QueueStats> {
        self.queues().map(|q| q.snapshot()).collect()
    }

    /// Flows of one queue, ascending by id
    pub fn queue_flows(&self, queue_id: QueueId) -> NicResult<Vec<FlowEntry>> {
        let queue = self.queue(queue_id)?;
        let inner = queue.lock();
        let mut flows: Vec<FlowEntry> = inner.flows.iter().cloned().collect();
        flows.sort_unstable_by_key(|f| f.flow_id);
        Ok(flows)
    }

    /// Every flow with its owner, observed with all queue locks held
    pub fn flows(&self) -> Vec<FlowSnapshot> {
        let guards: Vec<(QueueId, MutexGuard<'_, QueueInner>)> =
            self.queues().map(|q| (q.id(), q.lock())).collect();

        let mut flows: Vec<FlowSnapshot> = guards
            .iter()
            .flat_map(|(queue_id, inner)| {
                inner.flows.iter().map(move |entry| FlowSnapshot {
                    queue_id: *queue_id,
                    entry: entry.clone(),
                })
            })
            .collect();
        flows.sort_unstable_by_key(|f| f.entry.flow_id);
        flows
    }

    /// Owner recorded in the flow directory
    #[inline]
    pub fn flow_owner(&self, flow_id: FlowId) -> Option<QueueId> {
        self.directory.get(&flow_id).map(|owner| *owner)
    }

    /// Scan every queue's table for a flow
    pub fn locate_flow(&self, flow_id: FlowId) -> Option<QueueId> {
        self.queues()
            .find(|q| q.lock().flows.contains(flow_id))
            .map(|q| q.id())
    }

    /// Flows tracked device-wide
    pub fn flow_count(&self) -> usize {
        self.directory.len()
    }

    // =========================================================================
    // Migration
    // =========================================================================

    /// Lock two distinct queues in ascending id order
    fn lock_pair<'a>(
        &'a self,
        from: &'a Queue,
        to: &'a Queue,
    ) -> (MutexGuard<'a, QueueInner>, MutexGuard<'a, QueueInner>) {
        if from.id() < to.id() {
            let a = from.lock();
            let b = to.lock();
            (a, b)
        } else {
            let b = to.lock();
            let a = from.lock();
            (a, b)
        }
    }

    /// Move one flow between queues atomically
    pub fn migrate_flow(&self, flow_id: FlowId, from: QueueId, to: QueueId) -> NicResult<()> {
        if from == to {
            return Err(NicError::SameQueue(from));
        }
        let src = self.queue(from)?;
        let dst = self.queue(to)?;
        let (mut src_inner, mut dst_inner) = self.lock_pair(src, dst);

        if dst.status() == QueueStatus::Failed {
            return Err(NicError::QueueFailed(to));
        }
        if !src_inner.flows.contains(flow_id) {
            return Err(NicError::FlowNotFound { flow_id, queue_id: from });
        }
        if !dst_inner.flows.can_adopt(flow_id) {
            warn!(flow = flow_id, from, to, "Flow present on both queues");
            return Err(NicError::FlowMigrated { flow_id, owner: to });
        }

        if let Some(entry) = src_inner.flows.remove(flow_id) {
            let _ = dst_inner.flows.adopt(entry);
            self.directory.insert(flow_id, to);
        }
        drop(dst_inner);
        drop(src_inner);

        debug!(flow = flow_id, from, to, "Flow migrated");
        Ok(())
    }

    /// Move every flow of `from` to `to`; returns the number moved.
    ///
    /// Ignores the destination's soft flow limit. Packets arriving on `from`
    /// while this runs wait on its lock and then see the new owner.
    pub fn migrate_all(&self, from: QueueId, to: QueueId) -> NicResult<usize> {
        if from == to {
            return Err(NicError::SameQueue(from));
        }
        let src = self.queue(from)?;
        let dst = self.queue(to)?;
        let (mut src_inner, mut dst_inner) = self.lock_pair(src, dst);

        if dst.status() == QueueStatus::Failed {
            return Err(NicError::QueueFailed(to));
        }

        let moved = src_inner.flows.drain();
        let count = moved.len();
        for entry in moved {
            let flow_id = entry.flow_id;
            if let Err(FlowTableError::Duplicate) = dst_inner.flows.adopt(entry.clone()) {
                if let Some(existing) = dst_inner.flows.get_mut(flow_id) {
                    warn!(flow = flow_id, from, to, "Merging duplicate flow");
                    existing.packets += entry.packets;
                    existing.bytes += entry.bytes;
                    existing.latency_sum_ns += entry.latency_sum_ns;
                    existing.latency_samples += entry.latency_samples;
                    existing.last_seen_ms = existing.last_seen_ms.max(entry.last_seen_ms);
                }
            }
            self.directory.insert(flow_id, to);
        }
        drop(dst_inner);
        drop(src_inner);

        info!(from, to, flows = count, "Queue flows migrated");
        Ok(count)
    }

    // =========================================================================
    // Housekeeping
    // =========================================================================

    /// Remove flows idle longer than `timeout_ms`; returns how many.
    pub fn expire_idle(&self, now_ms: u64, timeout_ms: u64) -> usize {
        let mut total = 0;
        for queue in self.queues() {
            let qid = queue.id();
            let mut inner = queue.lock();
            let expired = inner.flows.expire_idle(now_ms, timeout_ms);
            for flow_id in &expired {
                self.directory.remove_if(flow_id, |_, owner| *owner == qid);
            }
            total += expired.len();
        }
        if total > 0 {
            debug!(flows = total, "Idle flows expired");
        }
        total
    }

    /// Drop every flow of every queue; returns how many.
    pub fn drop_all_flows(&self) -> usize {
        let mut total = 0;
        for queue in self.queues() {
            let qid = queue.id();
            let mut inner = queue.lock();
            for entry in inner.flows.drain() {
                self.directory.remove_if(&entry.flow_id, |_, owner| *owner == qid);
                total += 1;
            }
        }
        total
    }
}

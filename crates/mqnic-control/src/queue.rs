//! Queue records
//!
//! One [`Queue`] per hardware-facing channel. Counters and the owned
//! [`FlowTable`] sit behind a single per-queue `parking_lot::Mutex`, the
//! only contention point on the packet path. Status, processor binding and
//! pending work are atomics readable without the lock; status is only
//! written while the lock is held.

use crate::flow::FlowTable;
use mqnic_common::{CpuId, Direction, NicError, NicResult, NumaNode, QueueId};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

/// Processor binding value meaning "not bound"
const UNBOUND: u32 = u32::MAX;

/// Queue health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum QueueStatus {
    /// Serving traffic
    Active = 0,
    /// Error counters elevated but below the failure threshold
    Degraded = 1,
    /// Breached; accepts no new flows
    Failed = 2,
    /// Flows moved away, waiting out the recovery window
    Recovering = 3,
}

impl QueueStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Active,
            1 => Self::Degraded,
            2 => Self::Failed,
            _ => Self::Recovering,
        }
    }

    /// Lowercase label
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Degraded => "degraded",
            Self::Failed => "failed",
            Self::Recovering => "recovering",
        }
    }
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Traffic counters of one queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounters {
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_errors: u64,
    pub tx_errors: u64,
    pub rx_dropped: u64,
    pub tx_dropped: u64,
}

impl QueueCounters {
    #[inline(always)]
    pub(crate) fn record(&mut self, dir: Direction, bytes: u64) {
        match dir {
            Direction::Rx => {
                self.rx_packets += 1;
                self.rx_bytes += bytes;
            }
            Direction::Tx => {
                self.tx_packets += 1;
                self.tx_bytes += bytes;
            }
        }
    }

    #[inline]
    pub(crate) fn record_error(&mut self, dir: Direction) {
        match dir {
            Direction::Rx => self.rx_errors += 1,
            Direction::Tx => self.tx_errors += 1,
        }
    }

    #[inline]
    pub(crate) fn record_drop(&mut self, dir: Direction) {
        match dir {
            Direction::Rx => self.rx_dropped += 1,
            Direction::Tx => self.tx_dropped += 1,
        }
    }

    /// rx + tx errors
    pub fn error_sum(&self) -> u64 {
        self.rx_errors + self.tx_errors
    }

    /// Larger of rx and tx errors
    pub fn max_errors(&self) -> u64 {
        self.rx_errors.max(self.tx_errors)
    }

    pub(crate) fn reset_errors(&mut self) {
        self.rx_errors = 0;
        self.tx_errors = 0;
    }
}

/// State guarded by the queue lock
#[derive(Debug)]
pub(crate) struct QueueInner {
    pub(crate) counters: QueueCounters,
    pub(crate) flows: FlowTable,
}

/// One hardware-facing channel
#[derive(Debug)]
pub struct Queue {
    id: QueueId,
    numa_node: NumaNode,
    cpu: AtomicU32,
    status: AtomicU8,
    pending: AtomicU64,
    inner: Mutex<QueueInner>,
}

impl Queue {
    pub(crate) fn new(id: QueueId, numa_node: NumaNode, max_flows: usize) -> Self {
        Self {
            id,
            numa_node,
            cpu: AtomicU32::new(UNBOUND),
            status: AtomicU8::new(QueueStatus::Active as u8),
            pending: AtomicU64::new(0),
            inner: Mutex::new(QueueInner {
                counters: QueueCounters::default(),
                flows: FlowTable::new(max_flows),
            }),
        }
    }

    /// Queue id
    #[inline]
    pub fn id(&self) -> QueueId {
        self.id
    }

    /// NUMA domain
    #[inline]
    pub fn numa_node(&self) -> NumaNode {
        self.numa_node
    }

    /// Bound processor, if any
    #[inline]
    pub fn cpu(&self) -> Option<CpuId> {
        match self.cpu.load(Ordering::Acquire) {
            UNBOUND => None,
            cpu => Some(cpu),
        }
    }

    pub(crate) fn bind_cpu(&self, cpu: CpuId) {
        self.cpu.store(cpu, Ordering::Release);
    }

    /// Current status
    #[inline]
    pub fn status(&self) -> QueueStatus {
        QueueStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Status writes go through the held guard so they serialize with
    /// flow admission.
    pub(crate) fn set_status(&self, _guard: &MutexGuard<'_, QueueInner>, status: QueueStatus) -> QueueStatus {
        QueueStatus::from_u8(self.status.swap(status as u8, Ordering::AcqRel))
    }

    /// Outstanding submitted work
    #[inline]
    pub fn pending(&self) -> u64 {
        self.pending.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn add_pending(&self, n: u64) {
        self.pending.fetch_add(n, Ordering::AcqRel);
    }

    /// Decrement pending; never drops below zero.
    pub(crate) fn sub_pending(&self, n: u64) -> NicResult<u64> {
        self.pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |p| p.checked_sub(n))
            .map(|prev| prev - n)
            .map_err(|pending| NicError::PendingUnderflow {
                queue_id: self.id,
                pending,
                completed: n,
            })
    }

    #[inline]
    pub(crate) fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock()
    }

    /// Consistent point-in-time copy
    pub fn snapshot(&self) -> QueueStats {
        let inner = self.inner.lock();
        QueueStats {
            queue_id: self.id,
            numa_node: self.numa_node,
            cpu_id: self.cpu(),
            status: self.status(),
            pending: self.pending(),
            flow_count: inner.flows.len(),
            counters: inner.counters,
        }
    }
}

/// Snapshot of one queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queue_id: QueueId,
    pub numa_node: NumaNode,
    pub cpu_id: Option<CpuId>,
    pub status: QueueStatus,
    pub pending: u64,
    pub flow_count: usize,
    #[serde(flatten)]
    pub counters: QueueCounters,
}

//! Datapath hooks
//!
//! Thin glue between the packet path and the control plane bookkeeping:
//!
//! ```text
//!   transmit:  steer ─▶ alloc (queue's NUMA pool) ─▶ map ─▶ submit ─▶ account
//!   complete:  event ─▶ poll ─▶ unmap ─▶ free ─▶ complete_work ─▶ account
//! ```
//!
//! Nothing here blocks or loops on the device. A busy ring or a failed
//! mapping drops the packet, counts it and returns the error.

use crate::buffer::{BufferHandle, BufferPools};
use crate::device::{
    BufferDescriptor, CompletedBuffer, CompletionEvent, CompletionStatus, DeviceQueue, DmaMapper,
};
use crate::flow::FlowKey;
use crate::registry::QueueRegistry;
use crossbeam::channel::{Receiver, RecvTimeoutError};
use mqnic_common::{Direction, FlowId, HistogramSnapshot, LatencyHistogram, NicError, NicResult, QueueId};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Outgoing packet as seen by the control plane
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet {
    /// Flow id
    pub flow_id: FlowId,
    /// Payload length
    pub len: u32,
}

impl Packet {
    /// Packet of the stream identified by `key`
    pub fn from_key(key: &FlowKey, len: u32) -> Self {
        Self {
            flow_id: key.flow_id(),
            len,
        }
    }
}

/// Datapath counters
#[derive(Debug, Default)]
pub struct DatapathStats {
    pub tx_packets: AtomicU64,
    pub tx_bytes: AtomicU64,
    pub tx_completions: AtomicU64,
    pub rx_packets: AtomicU64,
    pub rx_bytes: AtomicU64,
    pub rx_posted: AtomicU64,
    pub dropped: AtomicU64,
    pub errors: AtomicU64,
    /// Packets counted on the queue but not attributed to any flow
    pub untracked: AtomicU64,
    pub events: AtomicU64,
    pub underflows: AtomicU64,
}

impl DatapathStats {
    /// Non-atomic copy
    pub fn snapshot(&self) -> DatapathStatsSnapshot {
        DatapathStatsSnapshot {
            tx_packets: self.tx_packets.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            tx_completions: self.tx_completions.load(Ordering::Relaxed),
            rx_packets: self.rx_packets.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            rx_posted: self.rx_posted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            untracked: self.untracked.load(Ordering::Relaxed),
            events: self.events.load(Ordering::Relaxed),
            underflows: self.underflows.load(Ordering::Relaxed),
        }
    }
}

/// Stats snapshot (non-atomic)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DatapathStatsSnapshot {
    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub tx_completions: u64,
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub rx_posted: u64,
    pub dropped: u64,
    pub errors: u64,
    pub untracked: u64,
    pub events: u64,
    pub underflows: u64,
}

/// Where a transmitted packet went
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxReceipt {
    pub queue_id: QueueId,
    pub buffer: BufferHandle,
}

/// Result of draining one queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub events: usize,
    pub completed: usize,
    pub rx_packets: usize,
    pub tx_completions: usize,
    pub errors: usize,
    pub dropped: usize,
}

/// Packet-path entry points
pub struct Datapath {
    registry: Arc<QueueRegistry>,
    pools: Arc<BufferPools>,
    device: Arc<dyn DeviceQueue>,
    mapper: Arc<dyn DmaMapper>,
    events: Vec<Option<Receiver<CompletionEvent>>>,
    buffer_size: u32,
    stats: DatapathStats,
    latency: LatencyHistogram,
}

impl Datapath {
    /// Create datapath; `events[q]` is the completion channel of queue `q`.
    pub fn new(
        registry: Arc<QueueRegistry>,
        pools: Arc<BufferPools>,
        device: Arc<dyn DeviceQueue>,
        mapper: Arc<dyn DmaMapper>,
        events: Vec<Option<Receiver<CompletionEvent>>>,
        buffer_size: u32,
    ) -> Self {
        Self {
            registry,
            pools,
            device,
            mapper,
            events,
            buffer_size,
            stats: DatapathStats::default(),
            latency: LatencyHistogram::new(),
        }
    }

    /// Registry this datapath accounts into
    pub fn registry(&self) -> &Arc<QueueRegistry> {
        &self.registry
    }

    /// Send one packet
    pub fn transmit(&self, packet: Packet) -> NicResult<TxReceipt> {
        let start = Instant::now();
        let queue_id = self.registry.steer(packet.flow_id)?;
        let node = self.registry.queue(queue_id)?.numa_node();

        let buffer = match self.pools.alloc(node) {
            Ok(buffer) => buffer,
            Err(e) => {
                self.drop_packet(queue_id, Direction::Tx);
                return Err(e);
            }
        };

        let mapping = match self.mapper.pin_and_map(buffer, Direction::Tx) {
            Ok(mapping) => mapping,
            Err(e) => {
                self.pools.free(buffer);
                self.drop_packet(queue_id, Direction::Tx);
                debug!(queue = queue_id, error = %e, "Map failed, packet dropped");
                return Err(e.into());
            }
        };

        let descriptor = BufferDescriptor {
            mapping,
            len: packet.len,
            flow_id: Some(packet.flow_id),
        };

        // Count the work before the device can complete it
        self.registry.begin_work(queue_id, 1)?;
        if let Err(busy) = self.device.submit(queue_id, &[descriptor]) {
            if let Err(e) = self.registry.complete_work(queue_id, 1) {
                warn!(queue = queue_id, error = %e, "Pending not rolled back");
            }
            self.mapper.unmap(mapping);
            self.pools.free(buffer);
            self.drop_packet(queue_id, Direction::Tx);
            return Err(busy.into());
        }

        self.stats.tx_packets.fetch_add(1, Ordering::Relaxed);
        self.stats.tx_bytes.fetch_add(packet.len as u64, Ordering::Relaxed);
        self.account(queue_id, packet.flow_id, packet.len as u64, Direction::Tx);

        let latency_ns = start.elapsed().as_nanos() as u64;
        self.latency.record(latency_ns);
        if let Err(e) = self.registry.record_flow_latency(packet.flow_id, latency_ns) {
            debug!(flow = packet.flow_id, error = %e, "Latency sample dropped");
        }

        Ok(TxReceipt { queue_id, buffer })
    }

    /// Post up to `n` receive buffers on `queue_id`; returns how many.
    pub fn post_rx_buffers(&self, queue_id: QueueId, n: usize) -> NicResult<usize> {
        let node = self.registry.queue(queue_id)?.numa_node();
        let mut descriptors = Vec::with_capacity(n);
        let mut last_err = None;

        for _ in 0..n {
            let buffer = match self.pools.alloc(node) {
                Ok(buffer) => buffer,
                Err(e) => {
                    last_err = Some(e);
                    break;
                }
            };
            match self.mapper.pin_and_map(buffer, Direction::Rx) {
                Ok(mapping) => descriptors.push(BufferDescriptor {
                    mapping,
                    len: self.buffer_size,
                    flow_id: None,
                }),
                Err(e) => {
                    self.pools.free(buffer);
                    last_err = Some(e.into());
                    break;
                }
            }
        }

        if descriptors.is_empty() {
            return Err(last_err.unwrap_or(NicError::PoolExhausted(node)));
        }

        let count = descriptors.len();
        self.registry.begin_work(queue_id, count as u64)?;
        if let Err(busy) = self.device.submit(queue_id, &descriptors) {
            if let Err(e) = self.registry.complete_work(queue_id, count as u64) {
                warn!(queue = queue_id, error = %e, "Pending not rolled back");
            }
            for d in descriptors {
                self.mapper.unmap(d.mapping);
                self.pools.free(d.mapping.buffer);
            }
            return Err(busy.into());
        }

        self.stats.rx_posted.fetch_add(count as u64, Ordering::Relaxed);
        Ok(count)
    }

    /// Wait up to `timeout` for a completion event on `queue_id`
    pub fn wait_for_event(&self, queue_id: QueueId, timeout: Duration) -> bool {
        let Some(Some(rx)) = self.events.get(queue_id as usize) else {
            return false;
        };
        match rx.recv_timeout(timeout) {
            Ok(_) => {
                self.stats.events.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => false,
        }
    }

    /// Drain pending events and up to `budget` device completions
    pub fn drain_completions(&self, queue_id: QueueId, budget: usize) -> NicResult<DrainReport> {
        self.registry.queue(queue_id)?;
        let mut report = DrainReport::default();

        if let Some(Some(rx)) = self.events.get(queue_id as usize) {
            while rx.try_recv().is_ok() {
                report.events += 1;
            }
            self.stats.events.fetch_add(report.events as u64, Ordering::Relaxed);
        }

        let completions = self.device.poll_completions(queue_id, budget);
        if completions.is_empty() {
            return Ok(report);
        }
        report.completed = completions.len();

        for completion in &completions {
            let descriptor = completion.descriptor;
            self.mapper.unmap(descriptor.mapping);
            self.pools.free(descriptor.mapping.buffer);
        }

        if let Err(e) = self.registry.complete_work(queue_id, completions.len() as u64) {
            self.stats.underflows.fetch_add(1, Ordering::Relaxed);
            warn!(queue = queue_id, error = %e, "Completion accounting mismatch");
        }

        for completion in &completions {
            self.complete_one(queue_id, completion, &mut report);
        }
        Ok(report)
    }

    fn complete_one(&self, queue_id: QueueId, completion: &CompletedBuffer, report: &mut DrainReport) {
        let dir = completion.direction();
        match completion.status {
            CompletionStatus::Ok => match dir {
                Direction::Rx => {
                    report.rx_packets += 1;
                    self.stats.rx_packets.fetch_add(1, Ordering::Relaxed);
                    self.stats.rx_bytes.fetch_add(completion.len as u64, Ordering::Relaxed);
                    match completion.flow_id.or(completion.descriptor.flow_id) {
                        Some(flow_id) => self.account(queue_id, flow_id, completion.len as u64, Direction::Rx),
                        None => {
                            self.stats.untracked.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
                Direction::Tx => {
                    report.tx_completions += 1;
                    self.stats.tx_completions.fetch_add(1, Ordering::Relaxed);
                }
            },
            CompletionStatus::Error => {
                report.errors += 1;
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = self.registry.record_error(queue_id, dir) {
                    warn!(queue = queue_id, error = %e, "Completion error not counted");
                }
            }
            CompletionStatus::Dropped => {
                report.dropped += 1;
                self.drop_packet(queue_id, dir);
            }
        }
    }

    /// Record against the flow's owner, retrying once if it moved.
    fn account(&self, queue_id: QueueId, flow_id: FlowId, bytes: u64, dir: Direction) {
        let result = match self.registry.record(queue_id, flow_id, bytes, dir) {
            Err(NicError::FlowMigrated { owner, .. }) => self.registry.record(owner, flow_id, bytes, dir),
            other => other,
        };
        if let Err(e) = result {
            self.stats.untracked.fetch_add(1, Ordering::Relaxed);
            debug!(queue = queue_id, flow = flow_id, error = %e, "Packet not attributed to flow");
        }
    }

    fn drop_packet(&self, queue_id: QueueId, dir: Direction) {
        self.stats.dropped.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.registry.record_drop(queue_id, dir) {
            warn!(queue = queue_id, error = %e, "Drop not counted");
        }
    }

    /// Counter snapshot
    pub fn stats(&self) -> DatapathStatsSnapshot {
        self.stats.snapshot()
    }

    /// Transmit-path latency
    pub fn latency(&self) -> HistogramSnapshot {
        self.latency.snapshot()
    }
}

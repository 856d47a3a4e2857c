//! Device-facing collaborator interfaces
//!
//! The control plane never touches hardware. It drives three narrow
//! interfaces supplied by the embedding driver:
//!
//! - [`DeviceQueue`]: submit buffer descriptors, poll completions
//! - [`InterruptController`]: per-queue completion vectors, affinity and
//!   coalescing hints
//! - [`DmaMapper`]: pin and map buffers for device access
//!
//! Interrupt handlers do not mutate shared state. They get a
//! [`CompletionNotifier`] that pushes a [`CompletionEvent`] into a bounded
//! per-queue channel; the registry is updated only when that event is
//! drained by the completion path.

use crate::buffer::BufferHandle;
use crossbeam::channel::{Sender, TrySendError};
use mqnic_common::{CpuId, Direction, FlowId, NicError, NicResult, QueueId};
use serde::Serialize;

/// Device refused a submission (ring full)
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("device busy on queue {0}")]
pub struct DeviceBusy(pub QueueId);

impl From<DeviceBusy> for NicError {
    fn from(e: DeviceBusy) -> Self {
        NicError::DeviceBusy(e.0)
    }
}

/// Pin/map failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct MapError(pub String);

impl From<MapError> for NicError {
    fn from(e: MapError) -> Self {
        NicError::Map(e.0)
    }
}

/// Device-visible mapping of a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct MappedHandle {
    /// Device address
    pub iova: u64,
    /// Backing buffer
    pub buffer: BufferHandle,
    /// Transfer direction
    pub direction: Direction,
}

/// One buffer handed to the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDescriptor {
    /// Mapping the device reads or writes
    pub mapping: MappedHandle,
    /// Payload length (tx) or buffer capacity (rx)
    pub len: u32,
    /// Flow the payload belongs to; unknown for posted rx buffers
    pub flow_id: Option<FlowId>,
}

/// Outcome of a completed buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionStatus {
    /// Transferred
    Ok,
    /// Device reported an error
    Error,
    /// Device discarded the buffer
    Dropped,
}

/// Buffer returned by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletedBuffer {
    /// Queue it completed on
    pub queue: QueueId,
    /// Descriptor as submitted
    pub descriptor: BufferDescriptor,
    /// Bytes actually transferred
    pub len: u32,
    /// Flow of a received payload, filled in by the device
    pub flow_id: Option<FlowId>,
    /// Outcome
    pub status: CompletionStatus,
}

impl CompletedBuffer {
    /// Direction of the transfer
    pub fn direction(&self) -> Direction {
        self.descriptor.mapping.direction
    }
}

/// Submit/poll primitive of a hardware-facing queue
pub trait DeviceQueue: Send + Sync {
    /// Hand descriptors to the device; all or nothing.
    fn submit(&self, queue: QueueId, descriptors: &[BufferDescriptor]) -> Result<(), DeviceBusy>;

    /// Collect up to `budget` completions without blocking.
    fn poll_completions(&self, queue: QueueId, budget: usize) -> Vec<CompletedBuffer>;
}

/// Interrupt vector management
pub trait InterruptController: Send + Sync {
    /// Attach a completion vector for `queue`; `notifier` is invoked from
    /// interrupt context.
    fn request_vector(&self, queue: QueueId, notifier: CompletionNotifier) -> NicResult<()>;

    /// Detach the vector of `queue`
    fn release_vector(&self, queue: QueueId);

    /// Steer the vector of `queue` to `cpu`
    fn set_affinity(&self, _queue: QueueId, _cpu: CpuId) {}

    /// Program the batching window of `queue`
    fn set_coalescing(&self, _queue: QueueId, _usecs: u32) {}
}

/// Memory pinning and device mapping
pub trait DmaMapper: Send + Sync {
    /// Pin `buffer` and map it for device access
    fn pin_and_map(&self, buffer: BufferHandle, direction: Direction) -> Result<MappedHandle, MapError>;

    /// Release a mapping
    fn unmap(&self, handle: MappedHandle);
}

/// Completion kick sent from interrupt context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionEvent {
    /// Queue with completions ready
    pub queue: QueueId,
}

/// Non-blocking completion signal handed to an interrupt vector
#[derive(Debug, Clone)]
pub struct CompletionNotifier {
    queue: QueueId,
    tx: Sender<CompletionEvent>,
}

impl CompletionNotifier {
    /// Wrap the sending half of a queue's completion channel
    pub fn new(queue: QueueId, tx: Sender<CompletionEvent>) -> Self {
        Self { queue, tx }
    }

    /// Queue this notifier signals for
    pub fn queue(&self) -> QueueId {
        self.queue
    }

    /// Signal completions. Never blocks; returns `false` only when the
    /// receiving side is gone. A full channel already has a kick pending.
    #[inline]
    pub fn notify(&self) -> bool {
        match self.tx.try_send(CompletionEvent { queue: self.queue }) {
            Ok(()) | Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

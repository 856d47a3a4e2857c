//! In-memory loopback device
//!
//! Implements all three device collaborators without hardware so the
//! control plane can be exercised end to end: a bounded ring per queue,
//! a counting mapper and an interrupt table that records affinity and
//! coalescing hints. Completions are produced on demand by the caller.

use crate::buffer::BufferHandle;
use crate::device::{
    BufferDescriptor, CompletedBuffer, CompletionNotifier, CompletionStatus, DeviceBusy, DeviceQueue,
    DmaMapper, InterruptController, MapError, MappedHandle,
};
use mqnic_common::{CpuId, Direction, FlowId, NicError, NicResult, QueueId};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

#[derive(Default)]
struct Ring {
    in_flight: VecDeque<BufferDescriptor>,
    completed: VecDeque<CompletedBuffer>,
}

/// Loopback implementation of the device collaborators
pub struct LoopbackDevice {
    ring_capacity: usize,
    rings: Mutex<HashMap<QueueId, Ring>>,
    vectors: Mutex<HashMap<QueueId, CompletionNotifier>>,
    affinity: Mutex<HashMap<QueueId, CpuId>>,
    coalescing: Mutex<HashMap<QueueId, u32>>,
    next_iova: AtomicU64,
    mapped: AtomicUsize,
    map_failures: AtomicUsize,
}

impl LoopbackDevice {
    /// Device whose rings hold `ring_capacity` descriptors per queue
    pub fn new(ring_capacity: usize) -> Self {
        Self {
            ring_capacity,
            rings: Mutex::new(HashMap::new()),
            vectors: Mutex::new(HashMap::new()),
            affinity: Mutex::new(HashMap::new()),
            coalescing: Mutex::new(HashMap::new()),
            next_iova: AtomicU64::new(0x1000),
            mapped: AtomicUsize::new(0),
            map_failures: AtomicUsize::new(0),
        }
    }

    fn finish(&self, queue: QueueId, pick: impl Fn(&BufferDescriptor) -> bool, f: impl FnOnce(BufferDescriptor) -> CompletedBuffer) -> bool {
        let done = {
            let mut rings = self.rings.lock();
            let ring = rings.entry(queue).or_default();
            match ring.in_flight.iter().position(pick) {
                Some(pos) => {
                    let completed = ring.in_flight.remove(pos).map(f);
                    ring.completed.extend(completed);
                    true
                }
                None => false,
            }
        };
        if done {
            self.raise(queue);
        }
        done
    }

    fn raise(&self, queue: QueueId) {
        let notifier = self.vectors.lock().get(&queue).cloned();
        if let Some(notifier) = notifier {
            notifier.notify();
        }
    }

    /// Complete the oldest in-flight descriptor of `queue` with `status`
    pub fn complete(&self, queue: QueueId, status: CompletionStatus) -> bool {
        self.finish(queue, |_| true, |descriptor| CompletedBuffer {
            queue,
            descriptor,
            len: descriptor.len,
            flow_id: descriptor.flow_id,
            status,
        })
    }

    /// Fill the oldest posted receive buffer of `queue` with `len` bytes
    /// of `flow_id`
    pub fn complete_rx(&self, queue: QueueId, flow_id: FlowId, len: u32) -> bool {
        self.finish(
            queue,
            |d| d.mapping.direction == Direction::Rx,
            |descriptor| CompletedBuffer {
                queue,
                descriptor,
                len: len.min(descriptor.len),
                flow_id: Some(flow_id),
                status: CompletionStatus::Ok,
            },
        )
    }

    /// Complete every in-flight transmit descriptor of `queue`
    pub fn complete_tx(&self, queue: QueueId) -> usize {
        let mut n = 0;
        while self.finish(
            queue,
            |d| d.mapping.direction == Direction::Tx,
            |descriptor| CompletedBuffer {
                queue,
                descriptor,
                len: descriptor.len,
                flow_id: descriptor.flow_id,
                status: CompletionStatus::Ok,
            },
        ) {
            n += 1;
        }
        n
    }

    /// Fail the next `n` map requests
    pub fn fail_maps(&self, n: usize) {
        self.map_failures.store(n, Ordering::Release);
    }

    /// Live mappings
    pub fn mapped(&self) -> usize {
        self.mapped.load(Ordering::Acquire)
    }

    /// Descriptors held by the device for `queue`
    pub fn in_flight(&self, queue: QueueId) -> usize {
        self.rings.lock().get(&queue).map_or(0, |r| r.in_flight.len())
    }

    /// Last affinity programmed for `queue`
    pub fn affinity(&self, queue: QueueId) -> Option<CpuId> {
        self.affinity.lock().get(&queue).copied()
    }

    /// Last coalescing interval programmed for `queue`
    pub fn coalescing(&self, queue: QueueId) -> Option<u32> {
        self.coalescing.lock().get(&queue).copied()
    }

    /// Attached vectors
    pub fn vector_count(&self) -> usize {
        self.vectors.lock().len()
    }
}

impl DeviceQueue for LoopbackDevice {
    fn submit(&self, queue: QueueId, descriptors: &[BufferDescriptor]) -> Result<(), DeviceBusy> {
        let mut rings = self.rings.lock();
        let ring = rings.entry(queue).or_default();
        if ring.in_flight.len() + descriptors.len() > self.ring_capacity {
            return Err(DeviceBusy(queue));
        }
        ring.in_flight.extend(descriptors.iter().copied());
        Ok(())
    }

    fn poll_completions(&self, queue: QueueId, budget: usize) -> Vec<CompletedBuffer> {
        let mut rings = self.rings.lock();
        match rings.get_mut(&queue) {
            Some(ring) => {
                let n = budget.min(ring.completed.len());
                ring.completed.drain(..n).collect()
            }
            None => Vec::new(),
        }
    }
}

impl DmaMapper for LoopbackDevice {
    fn pin_and_map(&self, buffer: BufferHandle, direction: Direction) -> Result<MappedHandle, MapError> {
        let failing = self
            .map_failures
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(MapError(format!("injected fault mapping {:?}", buffer)));
        }
        self.mapped.fetch_add(1, Ordering::AcqRel);
        Ok(MappedHandle {
            iova: self.next_iova.fetch_add(0x1000, Ordering::Relaxed),
            buffer,
            direction,
        })
    }

    fn unmap(&self, _handle: MappedHandle) {
        let _ = self
            .mapped
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}

impl InterruptController for LoopbackDevice {
    fn request_vector(&self, queue: QueueId, notifier: CompletionNotifier) -> NicResult<()> {
        let mut vectors = self.vectors.lock();
        if vectors.contains_key(&queue) {
            return Err(NicError::Vector {
                queue_id: queue,
                reason: "vector already attached".into(),
            });
        }
        vectors.insert(queue, notifier);
        Ok(())
    }

    fn release_vector(&self, queue: QueueId) {
        self.vectors.lock().remove(&queue);
    }

    fn set_affinity(&self, queue: QueueId, cpu: CpuId) {
        self.affinity.lock().insert(queue, cpu);
    }

    fn set_coalescing(&self, queue: QueueId, usecs: u32) {
        self.coalescing.lock().insert(queue, usecs);
    }
}

//! Per-queue Flow Table
//!
//! Maps flow id to traffic counters for the flows a queue currently owns.
//! A table is never shared: it lives inside its queue's lock, so all
//! operations here are plain `&mut self` bookkeeping.
//!
//! # Identity
//!
//! Flows are identified by the 5-tuple [`FlowKey`]; its FNV-1a hash is
//! folded into the 16-bit flow id space by [`flow_id_from_hash`].

use mqnic_common::{FlowId, QueueId};
use serde::Serialize;
use std::collections::HashMap;

/// Flow ids are `hash % FLOW_ID_SPACE`.
pub const FLOW_ID_SPACE: u64 = 0xFFFF;

/// Fold a stream hash into the flow id space
#[inline(always)]
pub const fn flow_id_from_hash(hash: u64) -> FlowId {
    (hash % FLOW_ID_SPACE) as FlowId
}

/// 5-tuple flow key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    /// Source IPv4 address
    pub src_ip: u32,
    /// Destination IPv4 address
    pub dst_ip: u32,
    /// Source port
    pub src_port: u16,
    /// Destination port
    pub dst_port: u16,
    /// IP protocol (TCP=6, UDP=17)
    pub protocol: u8,
}

impl FlowKey {
    /// Create new flow key
    #[inline(always)]
    pub const fn new(src_ip: u32, dst_ip: u32, src_port: u16, dst_port: u16, protocol: u8) -> Self {
        Self {
            src_ip,
            dst_ip,
            src_port,
            dst_port,
            protocol,
        }
    }

    /// FNV-1a over the tuple fields
    #[inline(always)]
    pub fn hash(&self) -> u64 {
        const FNV_OFFSET: u64 = 0xcbf29ce484222325;
        const FNV_PRIME: u64 = 0x100000001b3;

        let mut h = FNV_OFFSET;
        let bytes = self
            .src_ip
            .to_be_bytes()
            .into_iter()
            .chain(self.dst_ip.to_be_bytes())
            .chain(self.src_port.to_be_bytes())
            .chain(self.dst_port.to_be_bytes())
            .chain([self.protocol]);
        for byte in bytes {
            h ^= byte as u64;
            h = h.wrapping_mul(FNV_PRIME);
        }
        h
    }

    /// Flow id of this stream
    #[inline(always)]
    pub fn flow_id(&self) -> FlowId {
        flow_id_from_hash(self.hash())
    }
}

/// Counters for one flow
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowEntry {
    /// Flow id
    pub flow_id: FlowId,
    /// Packets seen, both directions
    pub packets: u64,
    /// Bytes seen, both directions
    pub bytes: u64,
    /// Sum of recorded per-packet latencies
    pub latency_sum_ns: u64,
    /// Number of latency samples
    pub latency_samples: u64,
    /// Creation time (ms)
    pub first_seen_ms: u64,
    /// Last activity (ms)
    pub last_seen_ms: u64,
}

impl FlowEntry {
    /// Fresh entry with no traffic
    pub fn new(flow_id: FlowId, now_ms: u64) -> Self {
        Self {
            flow_id,
            packets: 0,
            bytes: 0,
            latency_sum_ns: 0,
            latency_samples: 0,
            first_seen_ms: now_ms,
            last_seen_ms: now_ms,
        }
    }

    /// Account one packet
    #[inline(always)]
    pub fn update(&mut self, bytes: u64, now_ms: u64) {
        self.packets += 1;
        self.bytes += bytes;
        self.last_seen_ms = self.last_seen_ms.max(now_ms);
    }

    /// Add a latency sample
    #[inline]
    pub fn add_latency(&mut self, latency_ns: u64) {
        self.latency_sum_ns = self.latency_sum_ns.saturating_add(latency_ns);
        self.latency_samples += 1;
    }

    /// Average latency (ns), 0 without samples
    pub fn avg_latency_ns(&self) -> u64 {
        if self.latency_samples == 0 {
            0
        } else {
            self.latency_sum_ns / self.latency_samples
        }
    }

    /// Idle strictly longer than `timeout_ms` at `now_ms`
    pub fn is_idle(&self, now_ms: u64, timeout_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_seen_ms) > timeout_ms
    }
}

/// Flow table errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FlowTableError {
    /// Table at capacity
    #[error("flow table full")]
    TableFull,
    /// Id already present
    #[error("flow already present")]
    Duplicate,
}

/// Flows owned by one queue
#[derive(Debug)]
pub struct FlowTable {
    entries: HashMap<FlowId, FlowEntry>,
    /// Soft limit on new flows; migrations may exceed it
    capacity: usize,
}

impl FlowTable {
    /// Create table admitting up to `capacity` new flows
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity,
        }
    }

    /// Lookup flow
    #[inline]
    pub fn get(&self, flow_id: FlowId) -> Option<&FlowEntry> {
        self.entries.get(&flow_id)
    }

    /// Lookup flow for update
    #[inline]
    pub fn get_mut(&mut self, flow_id: FlowId) -> Option<&mut FlowEntry> {
        self.entries.get_mut(&flow_id)
    }

    /// Does this table hold the flow
    #[inline]
    pub fn contains(&self, flow_id: FlowId) -> bool {
        self.entries.contains_key(&flow_id)
    }

    /// Insert a new flow, honouring the capacity limit
    pub fn insert_new(&mut self, flow_id: FlowId, now_ms: u64) -> Result<&mut FlowEntry, FlowTableError> {
        if self.entries.contains_key(&flow_id) {
            return Err(FlowTableError::Duplicate);
        }
        if self.entries.len() >= self.capacity {
            return Err(FlowTableError::TableFull);
        }
        Ok(self
            .entries
            .entry(flow_id)
            .or_insert_with(|| FlowEntry::new(flow_id, now_ms)))
    }

    /// Adopt an entry moved from another table. Ignores the capacity limit.
    pub fn adopt(&mut self, entry: FlowEntry) -> Result<(), FlowTableError> {
        if self.entries.contains_key(&entry.flow_id) {
            return Err(FlowTableError::Duplicate);
        }
        self.entries.insert(entry.flow_id, entry);
        Ok(())
    }

    /// Would adopting `flow_id` succeed
    pub fn can_adopt(&self, flow_id: FlowId) -> bool {
        !self.entries.contains_key(&flow_id)
    }

    /// Remove flow
    pub fn remove(&mut self, flow_id: FlowId) -> Option<FlowEntry> {
        self.entries.remove(&flow_id)
    }

    /// Remove every flow
    pub fn drain(&mut self) -> Vec<FlowEntry> {
        self.entries.drain().map(|(_, entry)| entry).collect()
    }

    /// Remove flows idle longer than `timeout_ms`; returns their ids.
    pub fn expire_idle(&mut self, now_ms: u64, timeout_ms: u64) -> Vec<FlowId> {
        let expired: Vec<FlowId> = self
            .entries
            .values()
            .filter(|e| e.is_idle(now_ms, timeout_ms))
            .map(|e| e.flow_id)
            .collect();
        for id in &expired {
            self.entries.remove(id);
        }
        expired
    }

    /// Iterate entries
    pub fn iter(&self) -> impl Iterator<Item = &FlowEntry> {
        self.entries.values()
    }

    /// Flow ids in ascending order
    pub fn flow_ids(&self) -> Vec<FlowId> {
        let mut ids: Vec<FlowId> = self.entries.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Flow count
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Soft capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Point-in-time copy of a flow and its owner
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowSnapshot {
    /// Owning queue
    pub queue_id: QueueId,
    /// Counters
    #[serde(flatten)]
    pub entry: FlowEntry,
}

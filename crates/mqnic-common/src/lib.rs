//! mqnic Common - shared building blocks for the multi-queue NIC control plane
//!
//! This crate provides the pieces every part of the control plane leans on:
//! - Error taxonomy (capacity / not-found / device-busy / map / config)
//! - Clock abstraction with a manually advanced clock for virtual time
//! - Lock-free latency histogram for datapath telemetry
//!
//! Identifiers are plain integers: a queue is addressed by its stable index
//! `0..N-1` and a flow by the 16-bit space derived from its hash.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod clock;
pub mod error;
pub mod metrics;

pub use clock::{Clock, ManualClock, MonotonicClock};
pub use error::*;
pub use metrics::{HistogramSnapshot, LatencyHistogram};

/// Stable queue index, `0..queue_count`.
pub type QueueId = u32;

/// Flow identifier, unique within a device at any instant.
pub type FlowId = u32;

/// NUMA domain index.
pub type NumaNode = u32;

/// Logical processor index.
pub type CpuId = u32;

/// Traffic direction of a counter or buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Host to device
    Tx,
    /// Device to host
    Rx,
}

impl Direction {
    /// Short label used in logs and metric labels.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Direction::Tx => "tx",
            Direction::Rx => "rx",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

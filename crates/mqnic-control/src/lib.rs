//! mqnic Control Plane
//!
//! Decides which flow is served by which device queue, detects failing
//! queues and moves their flows away, and tunes interrupt coalescing
//! against load.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        NicControlPlane                           │
//! │                                                                  │
//! │   transmit ──▶ Datapath ──▶ DeviceQueue / DmaMapper (external)   │
//! │                   │                                              │
//! │   IRQ ──▶ CompletionNotifier ──▶ channel ──▶ CompletionWorkers   │
//! │                   │                                              │
//! │                   ▼                                              │
//! │   ┌──────────────────────────────────────────┐                   │
//! │   │ QueueRegistry                            │                   │
//! │   │  Queue 0 [Mutex: counters + FlowTable]   │◀── QosControl     │
//! │   │  Queue 1 [Mutex: counters + FlowTable]   │                   │
//! │   │  ...      flow directory (DashMap)       │                   │
//! │   └──────────────────────────────────────────┘                   │
//! │        ▲              ▲               ▲                          │
//! │        │              │               │                          │
//! │   HealthMonitor ─▶ FailoverController │                          │
//! │        │                              │                          │
//! │   Scheduler (tick) ─▶ AffinityPlanner, CoalescingController      │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Queue lifecycle
//!
//! | From       | Event                         | To         |
//! |------------|-------------------------------|------------|
//! | Active     | errors > degraded threshold   | Degraded   |
//! | Degraded   | errors back below threshold   | Active     |
//! | Active     | errors > failure threshold    | Failed     |
//! | Failed     | flows remapped                | Recovering |
//! | Recovering | recovery window, no new breach| Active     |
//!
//! Nothing on the packet path blocks: capacity and device errors are
//! returned to the caller, periodic passes log and keep going.

#![warn(clippy::all)]

pub mod affinity;
pub mod buffer;
pub mod coalesce;
pub mod config;
pub mod datapath;
pub mod device;
pub mod failover;
pub mod flow;
pub mod health;
pub mod plane;
pub mod qos;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod sim;
pub mod telemetry;
pub mod worker;

pub use affinity::{AffinityPlanner, CpuTopology, Rebind};
pub use buffer::{BufferHandle, BufferPool, BufferPools};
pub use coalesce::{CoalesceAction, CoalesceDecision, CoalescingController};
pub use config::ControlConfig;
pub use datapath::{Datapath, Packet};
pub use device::{
    BufferDescriptor, CompletedBuffer, CompletionEvent, CompletionNotifier, CompletionStatus,
    DeviceBusy, DeviceQueue, DmaMapper, InterruptController, MapError, MappedHandle,
};
pub use failover::{FailoverController, FailoverOutcome, FailoverStats, FailureRecord};
pub use flow::{flow_id_from_hash, FlowEntry, FlowKey, FlowTable};
pub use health::{HealthMonitor, HealthReport};
pub use plane::{Collaborators, NicControlPlane, TeardownReport, TickReport};
pub use qos::{QosControl, QosRequest};
pub use queue::{Queue, QueueStats, QueueStatus};
pub use registry::{QueueHandle, QueueRegistry};
pub use scheduler::{Scheduler, TaskKind};
pub use sim::LoopbackDevice;
pub use telemetry::DeviceMetrics;
pub use worker::CompletionWorkers;

pub use mqnic_common::{
    Clock, Direction, FlowId, ManualClock, MonotonicClock, NicError, NicResult, NumaNode, QueueId,
};

//! Control plane configuration
//!
//! Read once at bring-up and swappable at runtime through
//! [`NicControlPlane::update_config`](crate::NicControlPlane::update_config).

use mqnic_common::{NicError, NicResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default number of queues brought up
pub const DEFAULT_QUEUE_COUNT: usize = 32;

/// Default coalescing interval (microseconds)
pub const DEFAULT_COALESCE_USECS: u32 = 64;

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Queues created at bring-up
    pub queue_count: usize,
    /// Registry capacity; queue ids must be below this
    pub max_queues: usize,
    /// Place queues and processors per NUMA domain
    pub numa_aware: bool,
    /// Number of NUMA domains
    pub numa_nodes: usize,
    /// Number of logical processors
    pub processor_count: usize,
    /// Bounded completion-event channel per queue
    pub completion_channel_capacity: usize,
    /// Max completions drained per queue per pass
    pub completion_budget: usize,
    /// Interrupt coalescing
    pub coalesce: CoalesceConfig,
    /// Health monitor
    pub health: HealthConfig,
    /// Failover controller
    pub failover: FailoverConfig,
    /// Adaptive queue-to-processor scheduling
    pub scheduling: SchedulingConfig,
    /// Flow tables
    pub flows: FlowConfig,
    /// Per-NUMA buffer pools
    pub pool: PoolConfig,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            queue_count: DEFAULT_QUEUE_COUNT,
            max_queues: DEFAULT_QUEUE_COUNT,
            numa_aware: true,
            numa_nodes: 1,
            processor_count: num_cpus(),
            completion_channel_capacity: 1024,
            completion_budget: 64,
            coalesce: CoalesceConfig::default(),
            health: HealthConfig::default(),
            failover: FailoverConfig::default(),
            scheduling: SchedulingConfig::default(),
            flows: FlowConfig::default(),
            pool: PoolConfig::default(),
        }
    }
}

/// Get number of CPUs (simplified)
fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Interrupt coalescing bounds and hysteresis marks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoalesceConfig {
    /// Interval at bring-up (microseconds)
    pub initial_usecs: u32,
    /// Floor
    pub min_usecs: u32,
    /// Ceiling
    pub max_usecs: u32,
    /// Aggregate pending above this halves the interval
    pub high_water: u64,
    /// Aggregate pending below this doubles the interval
    pub low_water: u64,
    /// Adapt at all
    pub adaptive: bool,
    /// Adaptation tick period (milliseconds)
    pub tick_interval_ms: u64,
}

impl Default for CoalesceConfig {
    fn default() -> Self {
        Self {
            initial_usecs: DEFAULT_COALESCE_USECS,
            min_usecs: 8,
            max_usecs: 128,
            high_water: 1000,
            low_water: 100,
            adaptive: true,
            tick_interval_ms: 100,
        }
    }
}

impl CoalesceConfig {
    /// Reject empty bounds and overlapping water marks
    pub fn validate(&self) -> NicResult<()> {
        if self.min_usecs == 0 || self.min_usecs > self.max_usecs {
            return Err(NicError::InvalidConfig(format!(
                "coalesce bounds [{}, {}] are empty",
                self.min_usecs, self.max_usecs
            )));
        }
        if self.low_water >= self.high_water {
            return Err(NicError::InvalidConfig(
                "coalesce low_water must be below high_water".into(),
            ));
        }
        if self.tick_interval_ms == 0 {
            return Err(NicError::InvalidConfig(
                "coalesce tick_interval_ms must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Health monitor settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Check period (milliseconds)
    pub interval_ms: u64,
    /// rx or tx errors above this report a failure
    pub failure_threshold: u64,
    /// rx or tx errors above this mark the queue Degraded
    pub degraded_threshold: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            failure_threshold: 1000,
            degraded_threshold: 500,
        }
    }
}

/// Failover settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    /// Health monitor reports failures at all
    pub enabled: bool,
    /// Automatic remaps allowed per device before the breaker opens
    pub max_failover_count: u32,
    /// Error-free time before a failed queue is reclaimed (milliseconds)
    pub recovery_window_ms: u64,
    /// Failover events retained
    pub history_len: usize,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_failover_count: 3,
            recovery_window_ms: 5000,
            history_len: 64,
        }
    }
}

/// Adaptive queue-to-processor scheduling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulingConfig {
    /// Run the rebalance pass
    pub adaptive: bool,
    /// Aggregate pending above this triggers a rebalance
    pub threshold: u64,
    /// Pass period (milliseconds)
    pub interval_ms: u64,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            adaptive: true,
            threshold: 1000,
            interval_ms: 1000,
        }
    }
}

/// Flow table settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// New flows beyond this per queue are rejected
    pub max_flows_per_queue: usize,
    /// Flows idle longer than this are collected (milliseconds)
    pub idle_timeout_ms: u64,
    /// Aging pass period (milliseconds)
    pub aging_interval_ms: u64,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            max_flows_per_queue: 4096,
            idle_timeout_ms: 60_000,
            aging_interval_ms: 1000,
        }
    }
}

/// Buffer pool sizing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Buffers per NUMA domain
    pub buffers_per_node: usize,
    /// Bytes per buffer
    pub buffer_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            buffers_per_node: 4096,
            buffer_size: 2048,
        }
    }
}

impl ControlConfig {
    /// Load from a JSON file
    pub fn load(path: impl AsRef<Path>) -> NicResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save to a JSON file
    pub fn save(&self, path: impl AsRef<Path>) -> NicResult<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject values the control plane cannot run with
    pub fn validate(&self) -> NicResult<()> {
        fn invalid(msg: impl Into<String>) -> NicResult<()> {
            Err(NicError::InvalidConfig(msg.into()))
        }

        if self.queue_count == 0 {
            return invalid("queue_count must be at least 1");
        }
        if self.queue_count > self.max_queues {
            return invalid(format!(
                "queue_count {} exceeds max_queues {}",
                self.queue_count, self.max_queues
            ));
        }
        if self.numa_nodes == 0 || self.processor_count == 0 {
            return invalid("numa_nodes and processor_count must be at least 1");
        }
        if self.numa_aware && self.processor_count < self.numa_nodes {
            return invalid("every NUMA node needs at least one processor");
        }
        if self.completion_channel_capacity == 0 || self.completion_budget == 0 {
            return invalid("completion channel capacity and budget must be non-zero");
        }

        self.coalesce.validate()?;

        if self.health.interval_ms == 0 {
            return invalid("health interval_ms must be non-zero");
        }
        if self.health.degraded_threshold > self.health.failure_threshold {
            return invalid("degraded_threshold must not exceed failure_threshold");
        }
        if self.scheduling.interval_ms == 0 || self.flows.aging_interval_ms == 0 {
            return invalid("scheduling and aging intervals must be non-zero");
        }
        if self.flows.max_flows_per_queue == 0 {
            return invalid("max_flows_per_queue must be non-zero");
        }
        if self.pool.buffers_per_node == 0 || self.pool.buffers_per_node > u32::MAX as usize {
            return invalid("buffers_per_node must be in 1..=u32::MAX");
        }
        if self.pool.buffer_size == 0 || self.pool.buffer_size > u32::MAX as usize {
            return invalid("buffer_size must be in 1..=u32::MAX");
        }
        Ok(())
    }

    /// Fields fixed at bring-up; changing them needs a new device instance.
    pub(crate) fn structural_eq(&self, other: &Self) -> bool {
        self.queue_count == other.queue_count
            && self.max_queues == other.max_queues
            && self.numa_nodes == other.numa_nodes
            && self.numa_aware == other.numa_aware
            && self.processor_count == other.processor_count
            && self.completion_channel_capacity == other.completion_channel_capacity
            && self.flows.max_flows_per_queue == other.flows.max_flows_per_queue
            && self.pool == other.pool
    }
}

//! Affinity Planner
//!
//! Binds queues to processors. At bring-up each queue gets a processor of
//! its own NUMA domain, round-robin within that domain. Under load the
//! adaptive pass nudges each overloaded queue to the next processor
//! instead of computing a global assignment.

use crate::config::SchedulingConfig;
use crate::registry::QueueRegistry;
use arc_swap::ArcSwap;
use mqnic_common::{CpuId, NumaNode, QueueId};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

/// NUMA domain of queue `index` out of `queue_count`, spreading queues
/// evenly over `numa_nodes` in contiguous blocks.
pub fn queue_numa_node(index: usize, queue_count: usize, numa_nodes: usize) -> NumaNode {
    let nodes = numa_nodes.max(1);
    let per_node = (queue_count / nodes).max(1);
    (index / per_node).min(nodes - 1) as NumaNode
}

/// Processors grouped by NUMA domain
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CpuTopology {
    nodes: Vec<Vec<CpuId>>,
    processor_count: usize,
}

impl CpuTopology {
    /// `processor_count` processors split into contiguous blocks over
    /// `numa_nodes` domains; the last domain takes the remainder.
    pub fn uniform(numa_nodes: usize, processor_count: usize) -> Self {
        let nodes = numa_nodes.max(1);
        let per_node = (processor_count / nodes).max(1);
        let mut groups = vec![Vec::new(); nodes];
        for cpu in 0..processor_count {
            let node = (cpu / per_node).min(nodes - 1);
            groups[node].push(cpu as CpuId);
        }
        Self {
            nodes: groups,
            processor_count,
        }
    }

    /// Processors of `node`
    pub fn cpus_of(&self, node: NumaNode) -> &[CpuId] {
        self.nodes.get(node as usize).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of NUMA domains
    pub fn numa_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Total processors
    pub fn processor_count(&self) -> usize {
        self.processor_count
    }
}

/// One processor (re)binding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Rebind {
    /// Queue moved
    pub queue_id: QueueId,
    /// Previous processor, None if the queue was unbound
    pub from: Option<CpuId>,
    /// New processor
    pub to: CpuId,
}

/// Queue-to-processor placement
pub struct AffinityPlanner {
    topology: CpuTopology,
    numa_aware: bool,
    config: ArcSwap<SchedulingConfig>,
}

impl AffinityPlanner {
    /// Create planner
    pub fn new(topology: CpuTopology, numa_aware: bool, config: SchedulingConfig) -> Self {
        Self {
            topology,
            numa_aware,
            config: ArcSwap::from_pointee(config),
        }
    }

    /// Swap in new settings
    pub fn set_config(&self, config: SchedulingConfig) {
        self.config.store(Arc::new(config));
    }

    /// Processor topology
    pub fn topology(&self) -> &CpuTopology {
        &self.topology
    }

    /// Bind every registered queue. NUMA-aware: round-robin within the
    /// queue's domain. Otherwise `index % processor_count`.
    pub fn assign_initial(&self, registry: &QueueRegistry) -> Vec<Rebind> {
        let mut cursors = vec![0usize; self.topology.numa_nodes()];
        let processors = self.topology.processor_count().max(1);

        registry
            .queues()
            .enumerate()
            .map(|(index, queue)| {
                let cpus = self.topology.cpus_of(queue.numa_node());
                let cpu = match (self.numa_aware, cpus.is_empty()) {
                    (true, false) => {
                        let cursor = &mut cursors[queue.numa_node() as usize];
                        let cpu = cpus[*cursor % cpus.len()];
                        *cursor += 1;
                        cpu
                    }
                    _ => (index % processors) as CpuId,
                };
                let from = queue.cpu();
                queue.bind_cpu(cpu);
                debug!(queue = queue.id(), numa = queue.numa_node(), cpu, "Queue bound");
                Rebind {
                    queue_id: queue.id(),
                    from,
                    to: cpu,
                }
            })
            .collect()
    }

    /// Adaptive pass: when aggregate pending work exceeds the threshold,
    /// move each queue above its fair share to the next processor.
    pub fn rebalance(&self, registry: &QueueRegistry) -> Vec<Rebind> {
        let config = self.config.load();
        if !config.adaptive || registry.is_empty() {
            return Vec::new();
        }

        let aggregate = registry.aggregate_pending();
        if aggregate <= config.threshold {
            return Vec::new();
        }

        let share = config.threshold / registry.len() as u64;
        let processors = self.topology.processor_count().max(1) as CpuId;
        let moves: Vec<Rebind> = registry
            .queues()
            .filter(|q| q.pending() > share)
            .map(|queue| {
                let from = queue.cpu();
                let to = (from.unwrap_or(queue.id()) + 1) % processors;
                queue.bind_cpu(to);
                Rebind {
                    queue_id: queue.id(),
                    from,
                    to,
                }
            })
            .collect();

        if !moves.is_empty() {
            info!(pending = aggregate, moved = moves.len(), "Queues rebalanced");
        }
        moves
    }
}

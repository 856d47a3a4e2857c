//! Control plane facade
//!
//! [`NicControlPlane`] owns one device instance. Bring-up order:
//!
//! 1. validate config, register queues with their NUMA nodes
//! 2. attach one interrupt vector per queue, each with a bounded
//!    completion channel
//! 3. bind queues to processors, push affinity and coalescing
//! 4. arm the periodic tasks
//!
//! Periodic work runs from [`NicControlPlane::tick`], driven either by a
//! virtual clock in tests or by [`NicControlPlane::run_timers`] on tokio.

use crate::affinity::{queue_numa_node, AffinityPlanner, CpuTopology, Rebind};
use crate::buffer::BufferPools;
use crate::coalesce::{CoalesceDecision, CoalescingController};
use crate::config::ControlConfig;
use crate::datapath::Datapath;
use crate::device::{CompletionNotifier, DeviceQueue, DmaMapper, InterruptController};
use crate::failover::FailoverController;
use crate::health::{HealthMonitor, HealthReport};
use crate::qos::QosControl;
use crate::registry::QueueRegistry;
use crate::scheduler::{Scheduler, TaskKind};
use crate::sim::LoopbackDevice;
use crate::telemetry::{self, DeviceMetrics};
use crate::worker::CompletionWorkers;
use arc_swap::ArcSwap;
use crossbeam::channel::bounded;
use mqnic_common::{Clock, NicError, NicResult, QueueId};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

/// Longest single timer sleep; period changes are picked up within it.
const MAX_TIMER_SLEEP: Duration = Duration::from_millis(100);

/// Device collaborators the control plane drives
#[derive(Clone)]
pub struct Collaborators {
    pub device: Arc<dyn DeviceQueue>,
    pub mapper: Arc<dyn DmaMapper>,
    pub interrupts: Arc<dyn InterruptController>,
}

impl Collaborators {
    /// All three backed by one loopback device
    pub fn loopback(device: Arc<LoopbackDevice>) -> Self {
        Self {
            device: device.clone(),
            mapper: device.clone(),
            interrupts: device,
        }
    }
}

/// What one [`NicControlPlane::tick`] did
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    /// Tasks that fired, in run order
    pub fired: Vec<TaskKind>,
    pub health: Option<HealthReport>,
    pub rebinds: Vec<Rebind>,
    pub coalesce: Option<CoalesceDecision>,
    pub expired_flows: usize,
}

/// Result of [`NicControlPlane::shutdown`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TeardownReport {
    pub vectors_released: usize,
    pub completions_drained: usize,
    pub flows_dropped: usize,
    /// Buffers still held by the device (posted receive buffers included)
    pub buffers_outstanding: usize,
}

/// One multi-queue device's control plane
pub struct NicControlPlane {
    config: ArcSwap<ControlConfig>,
    clock: Arc<dyn Clock>,
    registry: Arc<QueueRegistry>,
    failover: Arc<FailoverController>,
    health: HealthMonitor,
    coalesce: CoalescingController,
    affinity: AffinityPlanner,
    qos: QosControl,
    scheduler: Mutex<Scheduler>,
    interrupts: Arc<dyn InterruptController>,
    pools: Arc<BufferPools>,
    datapath: Arc<Datapath>,
    workers: Mutex<CompletionWorkers>,
    shut_down: AtomicBool,
}

impl NicControlPlane {
    /// Bring up a device instance
    pub fn new(config: ControlConfig, collaborators: Collaborators, clock: Arc<dyn Clock>) -> NicResult<Self> {
        config.validate()?;
        let buffer_size = u32::try_from(config.pool.buffer_size)
            .map_err(|_| NicError::InvalidConfig("buffer_size exceeds u32".into()))?;
        let coalesce = CoalescingController::new(config.coalesce.clone())?;

        let registry = Arc::new(QueueRegistry::new(
            config.max_queues,
            config.flows.max_flows_per_queue,
            clock.clone(),
        ));
        for index in 0..config.queue_count {
            let node = if config.numa_aware {
                queue_numa_node(index, config.queue_count, config.numa_nodes)
            } else {
                0
            };
            registry.register_queue(index as QueueId, node)?;
        }

        let Collaborators {
            device,
            mapper,
            interrupts,
        } = collaborators;

        let mut events = Vec::with_capacity(config.queue_count);
        let mut attached: Vec<QueueId> = Vec::with_capacity(config.queue_count);
        for queue_id in registry.queue_ids() {
            let (tx, rx) = bounded(config.completion_channel_capacity);
            if let Err(e) = interrupts.request_vector(queue_id, CompletionNotifier::new(queue_id, tx)) {
                for &q in &attached {
                    interrupts.release_vector(q);
                }
                return Err(e);
            }
            attached.push(queue_id);
            events.push(Some(rx));
        }

        let pool_nodes = if config.numa_aware { config.numa_nodes } else { 1 };
        let pools = Arc::new(BufferPools::new(
            pool_nodes,
            config.pool.buffers_per_node,
            config.pool.buffer_size,
        ));
        let datapath = Arc::new(Datapath::new(
            registry.clone(),
            pools.clone(),
            device,
            mapper,
            events,
            buffer_size,
        ));

        let failover = Arc::new(FailoverController::new(registry.clone(), config.failover.clone()));
        let health = HealthMonitor::new(registry.clone(), failover.clone(), config.health.clone());
        let affinity = AffinityPlanner::new(
            CpuTopology::uniform(config.numa_nodes, config.processor_count),
            config.numa_aware,
            config.scheduling.clone(),
        );
        let qos = QosControl::new(failover.clone());

        for rebind in affinity.assign_initial(&registry) {
            interrupts.set_affinity(rebind.queue_id, rebind.to);
        }
        let usecs = coalesce.interval();
        for &queue_id in &attached {
            interrupts.set_coalescing(queue_id, usecs);
        }

        let now = clock.now_ms();
        let mut scheduler = Scheduler::new();
        scheduler.schedule(TaskKind::HealthCheck, config.health.interval_ms, now);
        scheduler.schedule(TaskKind::AdaptiveScheduling, config.scheduling.interval_ms, now);
        scheduler.schedule(TaskKind::Coalesce, config.coalesce.tick_interval_ms, now);
        scheduler.schedule(TaskKind::FlowAging, config.flows.aging_interval_ms, now);

        let workers = CompletionWorkers::new(datapath.clone(), config.completion_budget);

        info!(
            queues = registry.len(),
            numa_nodes = pool_nodes,
            processors = config.processor_count,
            coalesce_usecs = usecs,
            "Control plane up"
        );

        Ok(Self {
            config: ArcSwap::from_pointee(config),
            clock,
            registry,
            failover,
            health,
            coalesce,
            affinity,
            qos,
            scheduler: Mutex::new(scheduler),
            interrupts,
            pools,
            datapath,
            workers: Mutex::new(workers),
            shut_down: AtomicBool::new(false),
        })
    }

    // =========================================================================
    // Periodic work
    // =========================================================================

    /// Run every task due at `now_ms`, in [`TaskKind::ORDER`].
    pub fn tick(&self, now_ms: u64) -> TickReport {
        if self.shut_down.load(Ordering::Acquire) {
            return TickReport::default();
        }
        let fired = self.scheduler.lock().due(now_ms);
        let mut report = TickReport {
            fired: fired.clone(),
            ..Default::default()
        };

        for kind in fired {
            match kind {
                TaskKind::HealthCheck => {
                    report.health = Some(self.health.check(now_ms));
                }
                TaskKind::AdaptiveScheduling => {
                    let rebinds = self.affinity.rebalance(&self.registry);
                    for rebind in &rebinds {
                        self.interrupts.set_affinity(rebind.queue_id, rebind.to);
                    }
                    report.rebinds = rebinds;
                }
                TaskKind::Coalesce => {
                    let decision = self.coalesce.tick(self.registry.aggregate_pending());
                    if decision.changed() {
                        self.push_coalescing(decision.current);
                    }
                    report.coalesce = Some(decision);
                }
                TaskKind::FlowAging => {
                    let timeout = self.config.load().flows.idle_timeout_ms;
                    report.expired_flows = self.registry.expire_idle(now_ms, timeout);
                }
            }
        }
        report
    }

    /// Drive [`tick`](Self::tick) from the configured clock until
    /// `shutdown` turns true or its sender goes away.
    pub async fn run_timers(&self, mut shutdown: watch::Receiver<bool>) {
        info!("Control plane timers running");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let now = self.clock.now_ms();
            let wait = self
                .scheduler
                .lock()
                .next_deadline()
                .map_or(MAX_TIMER_SLEEP, |d| Duration::from_millis(d.saturating_sub(now)))
                .min(MAX_TIMER_SLEEP);

            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    let report = self.tick(self.clock.now_ms());
                    if !report.fired.is_empty() {
                        debug!(fired = ?report.fired, "Timers fired");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("Control plane timers stopped");
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    /// Validate and swap in `config`. Queue layout, pools and flow table
    /// capacity are fixed at bring-up.
    pub fn update_config(&self, config: ControlConfig) -> NicResult<()> {
        config.validate()?;
        if !self.config.load().structural_eq(&config) {
            return Err(NicError::InvalidConfig(
                "queue layout, pools and flow table capacity cannot change at runtime".into(),
            ));
        }

        self.failover.set_config(config.failover.clone());
        self.health.set_config(config.health.clone());
        self.affinity.set_config(config.scheduling.clone());

        let before = self.coalesce.interval();
        let usecs = self.coalesce.set_config(config.coalesce.clone())?;
        if usecs != before {
            self.push_coalescing(usecs);
        }

        {
            let now = self.clock.now_ms();
            let mut scheduler = self.scheduler.lock();
            scheduler.set_period(TaskKind::HealthCheck, config.health.interval_ms, now);
            scheduler.set_period(TaskKind::AdaptiveScheduling, config.scheduling.interval_ms, now);
            scheduler.set_period(TaskKind::Coalesce, config.coalesce.tick_interval_ms, now);
            scheduler.set_period(TaskKind::FlowAging, config.flows.aging_interval_ms, now);
        }

        self.config.store(Arc::new(config));
        info!("Configuration updated");
        Ok(())
    }

    /// Set the coalescing interval by hand; returns the clamped value.
    pub fn set_coalescing(&self, usecs: u32) -> u32 {
        let applied = self.coalesce.set_interval(usecs);
        self.push_coalescing(applied);
        applied
    }

    fn push_coalescing(&self, usecs: u32) {
        for queue_id in self.registry.queue_ids() {
            self.interrupts.set_coalescing(queue_id, usecs);
        }
    }

    // =========================================================================
    // Workers and teardown
    // =========================================================================

    /// Start one completion worker per queue
    pub fn start_workers(&self) -> NicResult<()> {
        self.workers.lock().start(&self.registry.queue_ids())
    }

    /// Stop completion workers
    pub fn stop_workers(&self) {
        self.workers.lock().stop();
    }

    /// Stop workers, release vectors and drop remaining flows so every
    /// flow table is empty. Later calls do nothing.
    pub fn shutdown(&self) -> TeardownReport {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return TeardownReport::default();
        }
        self.workers.lock().stop();

        let mut report = TeardownReport::default();
        for queue_id in self.registry.queue_ids() {
            match self.datapath.drain_completions(queue_id, usize::MAX) {
                Ok(drained) => report.completions_drained += drained.completed,
                Err(e) => debug!(queue = queue_id, error = %e, "Final drain skipped"),
            }
            self.interrupts.release_vector(queue_id);
            report.vectors_released += 1;
        }
        report.flows_dropped = self.registry.drop_all_flows();
        report.buffers_outstanding = self.pools.allocated();

        info!(
            vectors = report.vectors_released,
            flows = report.flows_dropped,
            outstanding = report.buffers_outstanding,
            "Control plane down"
        );
        report
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Telemetry snapshot
    pub fn metrics(&self) -> DeviceMetrics {
        let queues = telemetry::queue_metrics(&self.registry);
        DeviceMetrics {
            numa: telemetry::numa_metrics(&queues),
            flows: telemetry::flow_metrics(&self.registry),
            queues,
            coalesce_usecs: self.coalesce.interval(),
            aggregate_pending: self.registry.aggregate_pending(),
            failover: self.failover.stats(),
            datapath: self.datapath.stats(),
            tx_latency: self.datapath.latency(),
        }
    }

    pub fn config(&self) -> Arc<ControlConfig> {
        self.config.load_full()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn registry(&self) -> &Arc<QueueRegistry> {
        &self.registry
    }

    pub fn failover(&self) -> &Arc<FailoverController> {
        &self.failover
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    pub fn coalescing(&self) -> &CoalescingController {
        &self.coalesce
    }

    pub fn affinity(&self) -> &AffinityPlanner {
        &self.affinity
    }

    pub fn qos(&self) -> &QosControl {
        &self.qos
    }

    pub fn datapath(&self) -> &Arc<Datapath> {
        &self.datapath
    }

    pub fn pools(&self) -> &Arc<BufferPools> {
        &self.pools
    }

    /// Earliest timer deadline
    pub fn next_deadline(&self) -> Option<u64> {
        self.scheduler.lock().next_deadline()
    }
}

impl Drop for NicControlPlane {
    fn drop(&mut self) {
        self.shutdown();
    }
}

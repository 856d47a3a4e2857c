//! Telemetry snapshots
//!
//! Read-only, stable-schema views of queues, flows and NUMA domains for an
//! external exporter. Field names are part of the interface.
//!
//! Three renderings of the same [`DeviceMetrics`]:
//! - `render_text()`: tab-separated tables, one per view
//! - `to_json()`: JSON document
//! - `publish()`: gauges on the `metrics` facade, labelled by queue/node

use crate::datapath::DatapathStatsSnapshot;
use crate::failover::FailoverStats;
use crate::queue::{QueueStats, QueueStatus};
use crate::registry::QueueRegistry;
use mqnic_common::{CpuId, FlowId, HistogramSnapshot, NicResult, NumaNode, QueueId};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// Per-queue view
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueMetrics {
    pub queue_id: QueueId,
    pub numa_node: NumaNode,
    pub cpu_id: Option<CpuId>,
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_errors: u64,
    pub tx_errors: u64,
    pub rx_dropped: u64,
    pub tx_dropped: u64,
    pub pending: u64,
    pub status: QueueStatus,
    pub flow_count: usize,
}

impl From<QueueStats> for QueueMetrics {
    fn from(s: QueueStats) -> Self {
        Self {
            queue_id: s.queue_id,
            numa_node: s.numa_node,
            cpu_id: s.cpu_id,
            rx_packets: s.counters.rx_packets,
            tx_packets: s.counters.tx_packets,
            rx_bytes: s.counters.rx_bytes,
            tx_bytes: s.counters.tx_bytes,
            rx_errors: s.counters.rx_errors,
            tx_errors: s.counters.tx_errors,
            rx_dropped: s.counters.rx_dropped,
            tx_dropped: s.counters.tx_dropped,
            pending: s.pending,
            status: s.status,
            flow_count: s.flow_count,
        }
    }
}

/// Per-flow view
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowMetrics {
    pub flow_id: FlowId,
    pub queue_id: QueueId,
    pub packets: u64,
    pub bytes: u64,
    pub avg_latency_ns: u64,
    pub last_seen_ms: u64,
}

/// Per-NUMA-domain aggregate
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NumaMetrics {
    pub numa_node: NumaNode,
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub errors: u64,
}

/// Queue view of every registered queue
pub fn queue_metrics(registry: &QueueRegistry) -> Vec<QueueMetrics> {
    registry.snapshots().into_iter().map(QueueMetrics::from).collect()
}

/// Flow view, ascending by flow id
pub fn flow_metrics(registry: &QueueRegistry) -> Vec<FlowMetrics> {
    registry
        .flows()
        .into_iter()
        .map(|f| FlowMetrics {
            flow_id: f.entry.flow_id,
            queue_id: f.queue_id,
            packets: f.entry.packets,
            bytes: f.entry.bytes,
            avg_latency_ns: f.entry.avg_latency_ns(),
            last_seen_ms: f.entry.last_seen_ms,
        })
        .collect()
}

/// Fold queue views into per-node totals
pub fn numa_metrics(queues: &[QueueMetrics]) -> Vec<NumaMetrics> {
    let mut nodes: BTreeMap<NumaNode, NumaMetrics> = BTreeMap::new();
    for q in queues {
        let node = nodes.entry(q.numa_node).or_insert_with(|| NumaMetrics {
            numa_node: q.numa_node,
            ..Default::default()
        });
        node.rx_packets += q.rx_packets;
        node.tx_packets += q.tx_packets;
        node.rx_bytes += q.rx_bytes;
        node.tx_bytes += q.tx_bytes;
        node.errors += q.rx_errors + q.tx_errors;
    }
    nodes.into_values().collect()
}

/// Everything an exporter pulls in one go
#[derive(Debug, Clone, Serialize)]
pub struct DeviceMetrics {
    pub queues: Vec<QueueMetrics>,
    pub flows: Vec<FlowMetrics>,
    pub numa: Vec<NumaMetrics>,
    pub coalesce_usecs: u32,
    pub aggregate_pending: u64,
    pub failover: FailoverStats,
    pub datapath: DatapathStatsSnapshot,
    pub tx_latency: HistogramSnapshot,
}

impl DeviceMetrics {
    /// Tab-separated tables
    pub fn render_text(&self) -> String {
        let mut out = String::new();

        let _ = writeln!(out, "# queues");
        let _ = writeln!(
            out,
            "queue_id\tnuma_node\tcpu_id\trx_packets\ttx_packets\trx_bytes\ttx_bytes\tpending\tstatus"
        );
        for q in &self.queues {
            let cpu = q.cpu_id.map_or_else(|| "-".to_string(), |c| c.to_string());
            let _ = writeln!(
                out,
                "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
                q.queue_id, q.numa_node, cpu, q.rx_packets, q.tx_packets, q.rx_bytes, q.tx_bytes, q.pending, q.status
            );
        }

        let _ = writeln!(out, "# flows");
        let _ = writeln!(out, "flow_id\tqueue_id\tpackets\tbytes\tavg_latency_ns\tlast_seen_ms");
        for f in &self.flows {
            let _ = writeln!(
                out,
                "{}\t{}\t{}\t{}\t{}\t{}",
                f.flow_id, f.queue_id, f.packets, f.bytes, f.avg_latency_ns, f.last_seen_ms
            );
        }

        let _ = writeln!(out, "# numa");
        let _ = writeln!(out, "numa_node\trx_packets\ttx_packets\trx_bytes\ttx_bytes\terrors");
        for n in &self.numa {
            let _ = writeln!(
                out,
                "{}\t{}\t{}\t{}\t{}\t{}",
                n.numa_node, n.rx_packets, n.tx_packets, n.rx_bytes, n.tx_bytes, n.errors
            );
        }

        let _ = writeln!(out, "# device");
        let _ = writeln!(out, "coalesce_usecs\t{}", self.coalesce_usecs);
        let _ = writeln!(out, "aggregate_pending\t{}", self.aggregate_pending);
        let _ = writeln!(out, "failover_count\t{}", self.failover.failover_count);
        let _ = writeln!(out, "failed_queues\t{}", self.failover.failed_queues);
        out
    }

    /// JSON document
    pub fn to_json(&self) -> NicResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Mirror into the `metrics` facade
    pub fn publish(&self) {
        for q in &self.queues {
            let queue = q.queue_id.to_string();
            metrics::gauge!("mqnic_queue_rx_packets", "queue" => queue.clone()).set(q.rx_packets as f64);
            metrics::gauge!("mqnic_queue_tx_packets", "queue" => queue.clone()).set(q.tx_packets as f64);
            metrics::gauge!("mqnic_queue_rx_bytes", "queue" => queue.clone()).set(q.rx_bytes as f64);
            metrics::gauge!("mqnic_queue_tx_bytes", "queue" => queue.clone()).set(q.tx_bytes as f64);
            metrics::gauge!("mqnic_queue_errors", "queue" => queue.clone())
                .set((q.rx_errors + q.tx_errors) as f64);
            metrics::gauge!("mqnic_queue_pending", "queue" => queue.clone()).set(q.pending as f64);
            metrics::gauge!("mqnic_queue_status", "queue" => queue).set(q.status as u8 as f64);
        }
        for n in &self.numa {
            let node = n.numa_node.to_string();
            metrics::gauge!("mqnic_numa_rx_packets", "node" => node.clone()).set(n.rx_packets as f64);
            metrics::gauge!("mqnic_numa_tx_packets", "node" => node.clone()).set(n.tx_packets as f64);
            metrics::gauge!("mqnic_numa_errors", "node" => node).set(n.errors as f64);
        }
        metrics::gauge!("mqnic_flows").set(self.flows.len() as f64);
        metrics::gauge!("mqnic_coalesce_usecs").set(self.coalesce_usecs as f64);
        metrics::gauge!("mqnic_failover_count").set(self.failover.failover_count as f64);
        metrics::gauge!("mqnic_tx_latency_p99_ns").set(self.tx_latency.p99_ns as f64);
    }
}

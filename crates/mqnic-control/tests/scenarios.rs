//! End-to-end control plane scenarios on virtual time

use mqnic_control::config::{ControlConfig, FailoverConfig, HealthConfig};
use mqnic_control::failover::FailoverOutcome;
use mqnic_control::{
    Collaborators, Direction, FailoverController, HealthMonitor, LoopbackDevice, ManualClock,
    NicControlPlane, QueueId, QueueRegistry, QueueStatus,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

fn registry(clock: &Arc<ManualClock>, queues: u32) -> Arc<QueueRegistry> {
    let registry = Arc::new(QueueRegistry::new(queues as usize, 1024, clock.clone()));
    for id in 0..queues {
        registry.register_queue(id, 0).unwrap();
    }
    registry
}

fn errors(registry: &QueueRegistry, queue: QueueId, dir: Direction, n: u64) {
    for _ in 0..n {
        registry.record_error(queue, dir).unwrap();
    }
}

fn plane(config: ControlConfig) -> (Arc<ManualClock>, Arc<LoopbackDevice>, NicControlPlane) {
    let clock = Arc::new(ManualClock::new(0));
    let device = Arc::new(LoopbackDevice::new(1024));
    let plane = NicControlPlane::new(config, Collaborators::loopback(device.clone()), clock.clone()).unwrap();
    (clock, device, plane)
}

#[test]
fn test_round_robin_processor_assignment() {
    let config = ControlConfig {
        queue_count: 4,
        max_queues: 4,
        numa_nodes: 1,
        processor_count: 4,
        ..Default::default()
    };
    let (_, device, plane) = plane(config);

    for (i, queue) in plane.registry().queues().enumerate() {
        assert_eq!(queue.cpu(), Some((i % 4) as u32));
        assert_eq!(device.affinity(queue.id()), Some((i % 4) as u32));
    }
}

#[test]
fn test_error_breach_fails_over_to_least_errored_queue() {
    let clock = Arc::new(ManualClock::new(0));
    let registry = registry(&clock, 4);
    let failover = Arc::new(FailoverController::new(registry.clone(), FailoverConfig::default()));
    let health = HealthMonitor::new(registry.clone(), failover.clone(), HealthConfig::default());

    // Queue 2's flows, with history that must survive the move
    let mut before = BTreeMap::new();
    for flow in [2u32, 6, 10, 14] {
        registry.record_rx(2, flow, 100 * flow as u64).unwrap();
        registry.record_tx(2, flow, 50).unwrap();
        before.insert(flow, (2u64, 100 * flow as u64 + 50));
    }
    registry.record_tx(0, 100, 64).unwrap();

    // Queue 0 and 1 carry a few errors; queue 3 is clean and wins
    errors(&registry, 0, Direction::Tx, 3);
    errors(&registry, 1, Direction::Rx, 3);
    errors(&registry, 2, Direction::Rx, 1001);

    let report = health.check(clock.advance(Duration::from_millis(1000)));
    assert_eq!(
        report.failures,
        vec![FailoverOutcome::Remapped {
            from: 2,
            to: 3,
            flows_moved: 4
        }]
    );

    assert_eq!(registry.status(2).unwrap(), QueueStatus::Recovering);
    assert!(registry.queue_flows(2).unwrap().is_empty());
    let snap = registry.snapshot(2).unwrap();
    assert_eq!(snap.counters.rx_errors, 0);

    let moved: BTreeMap<u32, (u64, u64)> = registry
        .queue_flows(3)
        .unwrap()
        .into_iter()
        .map(|f| (f.flow_id, (f.packets, f.bytes)))
        .collect();
    assert_eq!(moved, before);
    for flow in before.keys() {
        assert_eq!(registry.flow_owner(*flow), Some(3));
    }
    // Unrelated flow untouched
    assert_eq!(registry.flow_owner(100), Some(0));

    let record = failover.record(2).unwrap();
    assert_eq!(record.failure_count, 1);
    assert_eq!(record.last_failure_ms, 1000);
    assert_eq!(failover.history()[0].to, 3);
}

#[test]
fn test_high_load_halves_coalescing() {
    let config = ControlConfig {
        queue_count: 4,
        max_queues: 4,
        ..Default::default()
    };
    let (clock, device, plane) = plane(config);
    let registry = plane.registry();
    for queue in 0..3 {
        registry.begin_work(queue, 500).unwrap();
    }
    assert_eq!(registry.aggregate_pending(), 1500);

    let report = plane.tick(clock.advance(Duration::from_millis(100)));
    let decision = report.coalesce.unwrap();
    assert_eq!((decision.previous, decision.current), (64, 32));
    assert_eq!(device.coalescing(3), Some(32));

    // Sustained load walks down to the floor and stays there
    for _ in 0..10 {
        plane.tick(clock.advance(Duration::from_millis(100)));
    }
    assert_eq!(plane.coalescing().interval(), 8);
}

#[test]
fn test_recovery_sweep_clears_old_record() {
    let clock = Arc::new(ManualClock::new(1000));
    let registry = registry(&clock, 6);
    let failover = FailoverController::new(registry.clone(), FailoverConfig::default());

    registry.record_tx(5, 5, 64).unwrap();
    errors(&registry, 5, Direction::Tx, 1001);
    assert!(matches!(
        failover.report_failure(5).unwrap(),
        FailoverOutcome::Remapped { from: 5, to: 0, .. }
    ));
    assert_eq!(registry.status(5).unwrap(), QueueStatus::Recovering);

    // 4000 in: still inside the window
    assert!(failover.recovery_sweep(5000).is_empty());

    // 6000 after the last failure, window 5000
    assert_eq!(failover.recovery_sweep(7000), vec![5]);
    assert!(failover.record(5).is_none());
    assert_eq!(registry.status(5).unwrap(), QueueStatus::Active);

    // Reclaimed queue takes new flows again
    registry.record_tx(5, 77, 64).unwrap();
    assert_eq!(registry.flow_owner(77), Some(5));
}

#[test]
fn test_recovery_sweep_is_idempotent() {
    let clock = Arc::new(ManualClock::new(0));
    let registry = registry(&clock, 4);
    let failover = FailoverController::new(registry.clone(), FailoverConfig::default());

    failover.report_failure(1).unwrap();
    clock.set(3000);
    failover.report_failure(2).unwrap();

    assert_eq!(failover.recovery_sweep(6000), vec![1]);
    let after_first = failover.records();
    assert!(failover.recovery_sweep(6000).is_empty());
    assert_eq!(failover.records(), after_first);
    assert_eq!(after_first.len(), 1);
    assert_eq!(after_first[0].queue_id, 2);
}

#[test]
fn test_circuit_breaker_caps_remaps() {
    let clock = Arc::new(ManualClock::new(0));
    let registry = registry(&clock, 8);
    let failover = FailoverController::new(
        registry.clone(),
        FailoverConfig {
            max_failover_count: 3,
            ..Default::default()
        },
    );

    let outcomes: Vec<_> = (0..5).map(|q| failover.report_failure(q).unwrap()).collect();
    let remaps = outcomes
        .iter()
        .filter(|o| matches!(o, FailoverOutcome::Remapped { .. }))
        .count();
    assert_eq!(remaps, 3);
    assert_eq!(failover.failover_count(), 3);
    assert!(matches!(outcomes[3], FailoverOutcome::Suppressed { queue_id: 3, .. }));
    assert!(matches!(outcomes[4], FailoverOutcome::Suppressed { queue_id: 4, .. }));

    // Suppressed queues are recorded and stay Failed
    assert_eq!(registry.status(4).unwrap(), QueueStatus::Failed);
    assert_eq!(failover.stats().total_failures, 5);

    // Repeated breaches on one queue keep counting
    for _ in 0..5 {
        failover.report_failure(4).unwrap();
    }
    assert_eq!(failover.record(4).unwrap().failure_count, 6);
    assert_eq!(failover.failover_count(), 3);
}

#[test]
fn test_open_breaker_keeps_failed_queue_out_until_quiet() {
    let clock = Arc::new(ManualClock::new(0));
    let registry = registry(&clock, 4);
    let failover = Arc::new(FailoverController::new(
        registry.clone(),
        FailoverConfig {
            max_failover_count: 0,
            ..Default::default()
        },
    ));
    let health = HealthMonitor::new(registry.clone(), failover.clone(), HealthConfig::default());

    // Queue 2 breaches every period for ten seconds
    for t in 1..=10u64 {
        errors(&registry, 2, Direction::Rx, 1001);
        let now = t * 1000;
        clock.set(now);
        let report = health.check(now);
        assert_eq!(
            report.failures,
            vec![FailoverOutcome::Suppressed {
                queue_id: 2,
                failure_count: t as u32
            }]
        );
        assert!(report.recovered.is_empty(), "reactivated at {} while breaching", now);
        assert_eq!(registry.status(2).unwrap(), QueueStatus::Failed);
    }
    assert_eq!(failover.record(2).unwrap().failure_count, 10);
    assert_eq!(failover.failover_count(), 0);

    // Goes quiet: reclaimed one window after the last breach
    clock.set(15_000);
    let report = health.check(15_000);
    assert!(report.failures.is_empty());
    assert!(report.recovered.is_empty());
    assert_eq!(registry.status(2).unwrap(), QueueStatus::Failed);

    clock.set(15_001);
    assert_eq!(health.check(15_001).recovered, vec![2]);
    assert_eq!(registry.status(2).unwrap(), QueueStatus::Active);
    assert!(failover.record(2).is_none());
}

#[test]
fn test_repeated_breach_while_recovering_postpones_recovery() {
    let clock = Arc::new(ManualClock::new(0));
    let registry = registry(&clock, 4);
    let failover = Arc::new(FailoverController::new(registry.clone(), FailoverConfig::default()));
    let health = HealthMonitor::new(registry.clone(), failover.clone(), HealthConfig::default());

    errors(&registry, 1, Direction::Rx, 1001);
    health.check(clock.advance(Duration::from_millis(1000)));
    assert_eq!(registry.status(1).unwrap(), QueueStatus::Recovering);

    // Breach again at 4000
    errors(&registry, 1, Direction::Tx, 1001);
    clock.set(4000);
    let report = health.check(4000);
    assert!(matches!(
        report.failures[0],
        FailoverOutcome::Refreshed {
            queue_id: 1,
            failure_count: 2
        }
    ));
    assert_eq!(failover.failover_count(), 1);

    // 6500 is past the first failure's window but not the refreshed one
    assert!(health.check(6500).recovered.is_empty());
    assert_eq!(health.check(9500).recovered, vec![1]);
    assert_eq!(registry.status(1).unwrap(), QueueStatus::Active);
}

#[test]
fn test_degraded_queue_round_trip() {
    let clock = Arc::new(ManualClock::new(0));
    let registry = registry(&clock, 2);
    let failover = Arc::new(FailoverController::new(registry.clone(), FailoverConfig::default()));
    let health = HealthMonitor::new(registry.clone(), failover.clone(), HealthConfig::default());

    errors(&registry, 0, Direction::Rx, 600);
    let report = health.check(1000);
    assert_eq!(report.degraded, vec![0]);
    assert_eq!(registry.status(0).unwrap(), QueueStatus::Degraded);
    assert!(report.failures.is_empty());

    // Degraded queues are still watched and can fail
    errors(&registry, 0, Direction::Rx, 401);
    let report = health.check(2000);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(registry.status(0).unwrap(), QueueStatus::Recovering);
}

#[test]
fn test_disabled_failover_skips_health_pass() {
    let clock = Arc::new(ManualClock::new(0));
    let registry = registry(&clock, 2);
    let failover = Arc::new(FailoverController::new(
        registry.clone(),
        FailoverConfig {
            enabled: false,
            ..Default::default()
        },
    ));
    let health = HealthMonitor::new(registry.clone(), failover.clone(), HealthConfig::default());

    errors(&registry, 0, Direction::Rx, 5000);
    let report = health.check(1000);
    assert!(report.skipped);
    assert_eq!(registry.status(0).unwrap(), QueueStatus::Active);
}

#[test]
fn test_manual_remap_and_qos_placement() {
    let config = ControlConfig {
        queue_count: 4,
        max_queues: 4,
        ..Default::default()
    };
    let (_, _, plane) = plane(config);
    let registry = plane.registry();
    for flow in 0..8 {
        registry.record_tx(flow % 4, flow, 64).unwrap();
    }

    let outcome = plane.failover().remap_queue(1, Some(3)).unwrap();
    assert_eq!(
        outcome,
        FailoverOutcome::Remapped {
            from: 1,
            to: 3,
            flows_moved: 2
        }
    );
    assert_eq!(registry.flow_owner(5), Some(3));
    // Manual remaps do not consume the automatic budget
    assert_eq!(plane.failover().failover_count(), 0);

    let placed = plane.qos().apply_line(r#"{"flow_id":5,"rate":2000,"queue":0}"#).unwrap();
    assert_eq!(placed.moved_from, Some(3));
    assert_eq!(registry.flow_owner(5), Some(0));
    assert_eq!(plane.qos().limit(5).unwrap().rate_kbit, 2000);
}

#[test]
fn test_metrics_export() {
    let config = ControlConfig {
        queue_count: 4,
        max_queues: 4,
        numa_nodes: 2,
        processor_count: 4,
        ..Default::default()
    };
    let (_, _, plane) = plane(config);
    plane.registry().record_rx(0, 1, 1000).unwrap();
    plane.registry().record_tx(3, 2, 500).unwrap();
    plane.registry().record_flow_latency(2, 4000).unwrap();

    let metrics = plane.metrics();
    assert_eq!(metrics.queues.len(), 4);
    assert_eq!(metrics.numa.len(), 2);
    assert_eq!(metrics.numa[0].rx_bytes, 1000);
    assert_eq!(metrics.numa[1].tx_bytes, 500);
    assert_eq!(metrics.flows[1].avg_latency_ns, 4000);
    assert_eq!(metrics.coalesce_usecs, 64);

    let json: serde_json::Value = serde_json::from_str(&metrics.to_json().unwrap()).unwrap();
    assert_eq!(json["queues"][3]["cpu_id"], 3);
    assert_eq!(json["failover"]["failover_count"], 0);
    assert!(metrics.render_text().contains("# numa"));
}

//! Invariants under concurrent packet path, completion and migration

use mqnic_control::{
    Collaborators, ControlConfig, LoopbackDevice, ManualClock, NicControlPlane, NicError, Packet,
    QueueRegistry,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn registry(queues: u32) -> Arc<QueueRegistry> {
    let registry = Arc::new(QueueRegistry::new(queues as usize, 100_000, Arc::new(ManualClock::new(0))));
    for id in 0..queues {
        registry.register_queue(id, 0).unwrap();
    }
    registry
}

#[test]
fn test_pending_never_underflows() {
    let registry = registry(1);
    let begun = Arc::new(AtomicU64::new(0));
    let completed = Arc::new(AtomicU64::new(0));
    let rejected = Arc::new(AtomicU64::new(0));

    let mut handles = Vec::new();
    for _ in 0..4 {
        let registry = registry.clone();
        let begun = begun.clone();
        handles.push(thread::spawn(move || {
            for _ in 0..10_000 {
                registry.begin_work(0, 1).unwrap();
                begun.fetch_add(1, Ordering::Relaxed);
            }
        }));
    }
    for _ in 0..4 {
        let registry = registry.clone();
        let completed = completed.clone();
        let rejected = rejected.clone();
        handles.push(thread::spawn(move || {
            for _ in 0..12_000 {
                match registry.complete_work(0, 1) {
                    Ok(_) => {
                        completed.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(NicError::PendingUnderflow { .. }) => {
                        rejected.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => panic!("unexpected error: {}", e),
                }
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    let pending = registry.aggregate_pending();
    assert_eq!(
        pending + completed.load(Ordering::Relaxed),
        begun.load(Ordering::Relaxed)
    );
    assert_eq!(
        completed.load(Ordering::Relaxed) + rejected.load(Ordering::Relaxed),
        48_000
    );

    // Over-completion leaves the count untouched
    assert!(registry.complete_work(0, pending + 1).is_err());
    assert_eq!(registry.aggregate_pending(), pending);
}

#[test]
fn test_flow_unique_under_migration() {
    const FLOWS: u32 = 500;
    const ROUNDS: u32 = 20;

    let registry = registry(4);
    let stop = Arc::new(AtomicBool::new(false));
    let recorded = Arc::new(AtomicU64::new(0));

    // Writers always start on queue 0 and follow the owner when told
    let mut writers = Vec::new();
    for w in 0..3u32 {
        let registry = registry.clone();
        let recorded = recorded.clone();
        writers.push(thread::spawn(move || {
            for round in 0..ROUNDS {
                for flow in 0..FLOWS {
                    if (flow + round) % 3 != w {
                        continue;
                    }
                    let mut queue = 0;
                    loop {
                        match registry.record_tx(queue, flow, 100) {
                            Ok(()) => {
                                recorded.fetch_add(1, Ordering::Relaxed);
                                break;
                            }
                            Err(NicError::FlowMigrated { owner, .. }) => queue = owner,
                            Err(e) => panic!("unexpected error: {}", e),
                        }
                    }
                }
            }
        }));
    }

    // Migrator bounces everything around the ring
    let migrator = {
        let registry = registry.clone();
        let stop = stop.clone();
        thread::spawn(move || {
            let mut from = 0;
            while !stop.load(Ordering::Acquire) {
                let to = (from + 1) % 4;
                registry.migrate_all(from, to).unwrap();
                from = to;
                thread::yield_now();
            }
        })
    };

    // Observer checks uniqueness on consistent snapshots
    let observer = {
        let registry = registry.clone();
        let stop = stop.clone();
        thread::spawn(move || {
            let mut checks = 0;
            while !stop.load(Ordering::Acquire) {
                let flows = registry.flows();
                let ids: HashSet<u32> = flows.iter().map(|f| f.entry.flow_id).collect();
                assert_eq!(ids.len(), flows.len(), "flow visible on two queues");
                checks += 1;
            }
            checks
        })
    };

    for w in writers {
        w.join().unwrap();
    }
    stop.store(true, Ordering::Release);
    migrator.join().unwrap();
    assert!(observer.join().unwrap() > 0);

    let flows = registry.flows();
    assert_eq!(flows.len(), FLOWS as usize);
    let packets: u64 = flows.iter().map(|f| f.entry.packets).sum();
    assert_eq!(packets, recorded.load(Ordering::Relaxed));
    assert_eq!(packets, (FLOWS * ROUNDS) as u64);
    for f in &flows {
        assert_eq!(registry.flow_owner(f.entry.flow_id), Some(f.queue_id));
    }
}

#[test]
fn test_opposite_migrations_do_not_deadlock() {
    let registry = registry(2);
    for flow in 0..64 {
        registry.record_tx(flow % 2, flow, 64).unwrap();
    }

    let mut handles = Vec::new();
    for (from, to) in [(0u32, 1u32), (1, 0)] {
        let registry = registry.clone();
        handles.push(thread::spawn(move || {
            for _ in 0..200 {
                for flow in 0..64 {
                    match registry.migrate_flow(flow, from, to) {
                        Ok(()) | Err(NicError::FlowNotFound { .. }) => {}
                        Err(e) => panic!("unexpected error: {}", e),
                    }
                }
            }
        }));
    }

    let deadline = Instant::now() + Duration::from_secs(30);
    for h in handles {
        while !h.is_finished() {
            assert!(Instant::now() < deadline, "migrations stalled");
            thread::sleep(Duration::from_millis(5));
        }
        h.join().unwrap();
    }
    assert_eq!(registry.flow_count(), 64);
    assert_eq!(registry.flows().len(), 64);
}

#[test]
fn test_datapath_with_workers() {
    let config = ControlConfig {
        queue_count: 4,
        max_queues: 4,
        completion_budget: 8,
        ..Default::default()
    };
    let device = Arc::new(LoopbackDevice::new(4096));
    let plane = Arc::new(
        NicControlPlane::new(config, Collaborators::loopback(device.clone()), Arc::new(ManualClock::new(0)))
            .unwrap(),
    );
    plane.start_workers().unwrap();

    let mut senders = Vec::new();
    for s in 0..4u32 {
        let plane = plane.clone();
        senders.push(thread::spawn(move || {
            let mut sent = 0u64;
            for i in 0..500u32 {
                let packet = Packet {
                    flow_id: s * 1000 + (i % 50),
                    len: 256,
                };
                match plane.datapath().transmit(packet) {
                    Ok(_) => sent += 1,
                    Err(NicError::PoolExhausted(_)) | Err(NicError::DeviceBusy(_)) => {}
                    Err(e) => panic!("unexpected error: {}", e),
                }
            }
            sent
        }));
    }
    let completer = {
        let device = device.clone();
        let plane = plane.clone();
        thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(10);
            while Instant::now() < deadline {
                for q in 0..4 {
                    device.complete_tx(q);
                }
                if plane.datapath().stats().tx_completions >= 2000 {
                    break;
                }
                thread::sleep(Duration::from_millis(1));
            }
        })
    };

    let sent: u64 = senders.into_iter().map(|h| h.join().unwrap()).sum();
    completer.join().unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    while plane.registry().aggregate_pending() > 0 && Instant::now() < deadline {
        for q in 0..4 {
            device.complete_tx(q);
        }
        thread::sleep(Duration::from_millis(5));
    }

    plane.stop_workers();
    let stats = plane.datapath().stats();
    assert_eq!(stats.tx_packets, sent);
    assert_eq!(stats.tx_completions, sent);
    assert_eq!(stats.underflows, 0);
    assert_eq!(plane.registry().aggregate_pending(), 0);
    assert_eq!(plane.pools().allocated(), 0);
    assert_eq!(plane.registry().flow_count(), 200);

    let report = plane.shutdown();
    assert_eq!(report.flows_dropped, 200);
}

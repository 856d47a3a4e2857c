//! Periodic task scheduling
//!
//! Timers are plain data: each [`PeriodicTask`] carries its next fire time
//! and is re-armed by the scheduler when it fires. Nothing re-schedules
//! itself, so advancing a virtual clock is enough to drive every timer
//! in tests.

use serde::Serialize;

/// Periodic work of the control plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Health check plus recovery sweep
    HealthCheck,
    /// Adaptive queue-to-processor pass
    AdaptiveScheduling,
    /// Coalescing adaptation
    Coalesce,
    /// Idle flow collection
    FlowAging,
}

impl TaskKind {
    /// Fixed run order within one tick
    pub const ORDER: [TaskKind; 4] = [
        TaskKind::HealthCheck,
        TaskKind::AdaptiveScheduling,
        TaskKind::Coalesce,
        TaskKind::FlowAging,
    ];
}

/// Timer with explicit next-fire state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PeriodicTask {
    pub kind: TaskKind,
    pub period_ms: u64,
    pub next_fire_ms: u64,
}

/// Owner of all periodic tasks
#[derive(Debug, Clone, Default)]
pub struct Scheduler {
    tasks: Vec<PeriodicTask>,
}

impl Scheduler {
    /// Empty scheduler
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a task; first fire at `now_ms + period_ms`.
    pub fn schedule(&mut self, kind: TaskKind, period_ms: u64, now_ms: u64) {
        let period_ms = period_ms.max(1);
        let task = PeriodicTask {
            kind,
            period_ms,
            next_fire_ms: now_ms.saturating_add(period_ms),
        };
        match self.tasks.iter_mut().find(|t| t.kind == kind) {
            Some(existing) => *existing = task,
            None => self.tasks.push(task),
        }
    }

    /// Change a task's period without moving its next deadline later
    /// than `now_ms + period_ms`.
    pub fn set_period(&mut self, kind: TaskKind, period_ms: u64, now_ms: u64) {
        let period_ms = period_ms.max(1);
        if let Some(task) = self.tasks.iter_mut().find(|t| t.kind == kind) {
            task.period_ms = period_ms;
            task.next_fire_ms = task.next_fire_ms.min(now_ms.saturating_add(period_ms));
        }
    }

    /// Tasks due at `now_ms`, in [`TaskKind::ORDER`]. Each due task fires
    /// once, however late, and is re-armed at `now_ms + period`.
    pub fn due(&mut self, now_ms: u64) -> Vec<TaskKind> {
        let mut fired = Vec::new();
        for kind in TaskKind::ORDER {
            if let Some(task) = self.tasks.iter_mut().find(|t| t.kind == kind) {
                if task.next_fire_ms <= now_ms {
                    task.next_fire_ms = now_ms.saturating_add(task.period_ms);
                    fired.push(kind);
                }
            }
        }
        fired
    }

    /// Earliest deadline
    pub fn next_deadline(&self) -> Option<u64> {
        self.tasks.iter().map(|t| t.next_fire_ms).min()
    }

    /// Task of `kind`
    pub fn task(&self, kind: TaskKind) -> Option<&PeriodicTask> {
        self.tasks.iter().find(|t| t.kind == kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_due_and_rearm() {
        let mut s = Scheduler::new();
        s.schedule(TaskKind::HealthCheck, 1000, 0);
        s.schedule(TaskKind::Coalesce, 100, 0);

        assert!(s.due(99).is_empty());
        assert_eq!(s.due(100), vec![TaskKind::Coalesce]);
        assert_eq!(s.task(TaskKind::Coalesce).unwrap().next_fire_ms, 200);

        assert_eq!(s.due(1000), vec![TaskKind::HealthCheck, TaskKind::Coalesce]);
        assert_eq!(s.next_deadline(), Some(1100));
    }

    #[test]
    fn test_late_fire_once() {
        let mut s = Scheduler::new();
        s.schedule(TaskKind::FlowAging, 10, 0);
        // Ten periods late still fires once
        assert_eq!(s.due(100), vec![TaskKind::FlowAging]);
        assert!(s.due(100).is_empty());
        assert_eq!(s.task(TaskKind::FlowAging).unwrap().next_fire_ms, 110);
    }

    #[test]
    fn test_order_is_fixed() {
        let mut s = Scheduler::new();
        s.schedule(TaskKind::FlowAging, 10, 0);
        s.schedule(TaskKind::Coalesce, 10, 0);
        s.schedule(TaskKind::AdaptiveScheduling, 10, 0);
        s.schedule(TaskKind::HealthCheck, 10, 0);
        assert_eq!(s.due(10), TaskKind::ORDER.to_vec());
    }

    #[test]
    fn test_set_period() {
        let mut s = Scheduler::new();
        s.schedule(TaskKind::HealthCheck, 1000, 0);
        s.set_period(TaskKind::HealthCheck, 100, 50);
        assert_eq!(s.task(TaskKind::HealthCheck).unwrap().next_fire_ms, 150);
    }
}

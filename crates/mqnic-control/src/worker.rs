//! Completion workers
//!
//! One named thread per queue. Each waits on its queue's completion
//! channel and drains device completions into the registry, so registry
//! mutation from the completion side only ever happens here.

use crate::datapath::Datapath;
use mqnic_common::{NicError, NicResult, QueueId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long a worker blocks before re-checking the running flag
const POLL_INTERVAL: Duration = Duration::from_millis(10);

struct WorkerHandle {
    thread: Option<thread::JoinHandle<()>>,
    queue_id: QueueId,
}

/// Per-queue completion threads
pub struct CompletionWorkers {
    datapath: Arc<Datapath>,
    budget: usize,
    running: Arc<AtomicBool>,
    workers: Vec<WorkerHandle>,
}

impl CompletionWorkers {
    /// Workers draining at most `budget` completions per wakeup
    pub fn new(datapath: Arc<Datapath>, budget: usize) -> Self {
        Self {
            datapath,
            budget,
            running: Arc::new(AtomicBool::new(false)),
            workers: Vec::new(),
        }
    }

    /// Spawn one worker per queue in `queues`
    pub fn start(&mut self, queues: &[QueueId]) -> NicResult<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        for &queue_id in queues {
            let datapath = self.datapath.clone();
            let running = self.running.clone();
            let budget = self.budget;

            let handle = thread::Builder::new()
                .name(format!("mqnic-cq-{}", queue_id))
                .spawn(move || run(datapath, running, queue_id, budget))
                .map_err(|e| {
                    NicError::Io(std::io::Error::new(e.kind(), format!("spawn worker {}: {}", queue_id, e)))
                });
            match handle {
                Ok(thread) => self.workers.push(WorkerHandle {
                    thread: Some(thread),
                    queue_id,
                }),
                Err(e) => {
                    self.stop();
                    return Err(e);
                }
            }
        }

        info!(workers = self.workers.len(), "Completion workers started");
        Ok(())
    }

    /// Stop and join all workers
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        for worker in &mut self.workers {
            if let Some(handle) = worker.thread.take() {
                if handle.join().is_err() {
                    warn!(queue = worker.queue_id, "Completion worker panicked");
                }
            }
        }
        if !self.workers.is_empty() {
            info!("Completion workers stopped");
        }
        self.workers.clear();
    }

    /// Check if running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl Drop for CompletionWorkers {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(datapath: Arc<Datapath>, running: Arc<AtomicBool>, queue_id: QueueId, budget: usize) {
    debug!(queue = queue_id, "Completion worker starting");

    while running.load(Ordering::Acquire) {
        if !datapath.wait_for_event(queue_id, POLL_INTERVAL) {
            continue;
        }
        // Keep draining while the device has more than one budget's worth
        loop {
            match datapath.drain_completions(queue_id, budget) {
                Ok(report) if report.completed == budget => continue,
                Ok(_) => break,
                Err(e) => {
                    warn!(queue = queue_id, error = %e, "Completion drain failed");
                    break;
                }
            }
        }
    }

    // Final sweep so nothing stays mapped after stop
    if let Err(e) = datapath.drain_completions(queue_id, usize::MAX) {
        warn!(queue = queue_id, error = %e, "Final completion drain failed");
    }
    debug!(queue = queue_id, "Completion worker stopped");
}

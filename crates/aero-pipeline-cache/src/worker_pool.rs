//! Fixed-size thread pool for deferred pipeline builds.
//!
//! Workers share one multi-producer queue. A woken worker takes every job currently queued, runs
//! them in order, then sleeps until the queue is non-empty again. There is no priority and no
//! cancellation: once a job is queued it runs to completion, including during shutdown, which
//! drains the queue before the workers exit.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::config::WorkerPoolConfig;
use crate::stats::{WorkerPoolCounters, WorkerPoolStats};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Where a build runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuildMode {
    /// On the calling thread, before `resolve` returns.
    Inline,
    /// On a pool worker; `resolve` returns while the build is pending.
    Deferred,
}

#[derive(Default)]
struct QueueState {
    jobs: Vec<Job>,
    running: usize,
    shutdown: bool,
}

#[derive(Default)]
struct Shared {
    queue: Mutex<QueueState>,
    job_ready: Condvar,
    idle: Condvar,
    counters: WorkerPoolCounters,
}

pub struct WorkerPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(config: &WorkerPoolConfig) -> Self {
        let shared = Arc::new(Shared::default());
        let count = config.resolved_worker_count();

        let mut workers = Vec::with_capacity(count);
        for index in 0..count {
            let worker_shared = Arc::clone(&shared);
            let spawned = std::thread::Builder::new()
                .name(format!("{}-{index}", config.thread_name))
                .spawn(move || worker_loop(&worker_shared));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(err) => {
                    warn!(index, %err, "failed to spawn pipeline worker");
                    break;
                }
            }
        }

        if workers.is_empty() {
            warn!("no pipeline workers available; deferred builds will run inline");
        } else {
            info!(workers = workers.len(), "pipeline worker pool started");
        }

        Self { shared, workers }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn execute(&self, mode: BuildMode, job: Job) {
        match mode {
            BuildMode::Inline => self.run_inline(job),
            BuildMode::Deferred => self.submit(job),
        }
    }

    /// Runs `job` on the calling thread. Panics propagate to the caller.
    pub fn run_inline(&self, job: Job) {
        self.shared.counters.inc_inline();
        job();
    }

    /// Queues `job` for a worker.
    pub fn submit(&self, job: Job) {
        if self.workers.is_empty() {
            self.run_inline(job);
            return;
        }

        self.shared.counters.inc_submitted();
        self.shared.queue.lock().jobs.push(job);
        self.shared.job_ready.notify_one();
    }

    /// Blocks until the queue is empty and no worker is running a job.
    pub fn wait_idle(&self) {
        let mut queue = self.shared.queue.lock();
        while !queue.jobs.is_empty() || queue.running > 0 {
            self.shared.idle.wait(&mut queue);
        }
    }

    pub fn stats(&self) -> WorkerPoolStats {
        self.shared.counters.snapshot(self.workers.len())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shared.queue.lock().shutdown = true;
        self.shared.job_ready.notify_all();

        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("pipeline worker exited with a panic");
            }
        }
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let batch = {
            let mut queue = shared.queue.lock();
            while queue.jobs.is_empty() && !queue.shutdown {
                shared.job_ready.wait(&mut queue);
            }
            if queue.jobs.is_empty() {
                break;
            }
            let batch = std::mem::take(&mut queue.jobs);
            queue.running += batch.len();
            batch
        };

        let count = batch.len();
        debug!(count, "pipeline worker draining jobs");
        for job in batch {
            run_job(shared, job);
        }

        let mut queue = shared.queue.lock();
        queue.running -= count;
        if queue.jobs.is_empty() && queue.running == 0 {
            shared.idle.notify_all();
        }
    }
}

fn run_job(shared: &Shared, job: Job) {
    if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
        shared.counters.inc_panicked();
        warn!("pipeline job panicked");
    }
    shared.counters.inc_completed();
}

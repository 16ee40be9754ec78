//! Blocking Thread Pool for Site Work
//!
//! Runs site work that would stall the engine if done on its thread
//! (sleeping, blocking file or socket calls). Jobs answer their calling
//! token themselves through the `ReturnHandle` they capture, so the pool
//! has no result channel of its own.
//!
//! Uses a fixed pool of worker threads sharing one job queue.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, JoinHandle};

/// A unit of work for the pool
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Message sent to worker threads
enum WorkerMessage {
    Run(Job),
    Shutdown,
}

/// A pool of worker threads for blocking site work
pub struct BlockingPool {
    /// Sender for submitting jobs to workers
    job_sender: Sender<WorkerMessage>,
    /// Worker thread handles
    workers: Vec<JoinHandle<()>>,
    /// Number of workers
    worker_count: usize,
}

impl BlockingPool {
    /// Create a pool with one worker per CPU core
    pub fn new() -> Self {
        Self::with_workers(num_cpus::get())
    }

    /// Create a pool with a specific number of workers
    pub fn with_workers(count: usize) -> Self {
        let count = count.max(1);

        let (job_sender, job_receiver) = mpsc::channel::<WorkerMessage>();
        let job_receiver = Arc::new(Mutex::new(job_receiver));

        let mut workers = Vec::with_capacity(count);
        for id in 0..count {
            let receiver = Arc::clone(&job_receiver);
            let spawned = thread::Builder::new()
                .name(format!("braid-blocking-{}", id))
                .spawn(move || worker_loop(receiver));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(err) => {
                    tracing::error!(worker = id, error = %err, "failed to spawn blocking worker");
                }
            }
        }
        tracing::debug!(workers = workers.len(), "blocking pool started");

        let worker_count = workers.len();
        Self {
            job_sender,
            workers,
            worker_count,
        }
    }

    /// Queue a job. If no worker could be started the job runs inline, so
    /// a caller waiting on its answer is never stranded.
    pub fn execute(&self, job: Job) {
        if self.worker_count == 0 {
            job();
            return;
        }
        if let Err(mpsc::SendError(msg)) = self.job_sender.send(WorkerMessage::Run(job)) {
            if let WorkerMessage::Run(job) = msg {
                job();
            }
        }
    }

    /// Get the number of workers in the pool
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Shut the pool down, waiting for queued jobs to finish
    pub fn shutdown(self) {
        for _ in 0..self.worker_count {
            let _ = self.job_sender.send(WorkerMessage::Shutdown);
        }
        for worker in self.workers {
            let _ = worker.join();
        }
    }
}

impl Default for BlockingPool {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BlockingPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingPool")
            .field("worker_count", &self.worker_count)
            .finish()
    }
}

/// Worker thread main loop
fn worker_loop(receiver: Arc<Mutex<Receiver<WorkerMessage>>>) {
    loop {
        let message = {
            let Ok(lock) = receiver.lock() else {
                break;
            };
            lock.recv()
        };
        match message {
            Ok(WorkerMessage::Run(job)) => job(),
            Ok(WorkerMessage::Shutdown) | Err(_) => break,
        }
    }
}

/// A pool shared by an engine and every handle it gives out, started on
/// first use so runs that never call a blocking site spawn no threads
#[derive(Clone)]
pub struct SharedPool {
    pool: Arc<OnceLock<BlockingPool>>,
    workers: usize,
}

impl SharedPool {
    pub fn new(workers: usize) -> Self {
        Self {
            pool: Arc::new(OnceLock::new()),
            workers,
        }
    }

    pub fn get(&self) -> &BlockingPool {
        self.pool
            .get_or_init(|| BlockingPool::with_workers(self.workers))
    }

    pub fn is_started(&self) -> bool {
        self.pool.get().is_some()
    }
}

impl std::fmt::Debug for SharedPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedPool")
            .field("workers", &self.workers)
            .field("started", &self.is_started())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_pool_creation() {
        let pool = BlockingPool::with_workers(2);
        assert_eq!(pool.worker_count(), 2);
        pool.shutdown();
    }

    #[test]
    fn test_pool_default() {
        let pool = BlockingPool::new();
        assert!(pool.worker_count() >= 1);
        pool.shutdown();
    }

    #[test]
    fn test_jobs_run_before_shutdown_returns() {
        let pool = BlockingPool::with_workers(2);
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let done = Arc::clone(&done);
            pool.execute(Box::new(move || {
                std::thread::sleep(Duration::from_millis(5));
                done.fetch_add(1, Ordering::SeqCst);
            }));
        }
        pool.shutdown();
        assert_eq!(done.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_shared_pool_starts_lazily() {
        let shared = SharedPool::new(1);
        assert!(!shared.is_started());
        let (tx, rx) = mpsc::channel();
        shared.get().execute(Box::new(move || {
            let _ = tx.send(7);
        }));
        assert!(shared.is_started());
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 7);
    }
}

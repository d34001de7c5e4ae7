//! Worker pools.
//!
//! The executor drives any [`WorkerPool`]; the built-in [`ThreadPool`]
//! covers the common case of a small fixed set of background threads.
//! Jobs queue unboundedly, so submission never blocks the foreground.

use crate::errors::PoolError;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread::JoinHandle;

/// A unit of background work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Something that can run jobs off the foreground thread.
pub trait WorkerPool {
    /// Queues a job for execution.
    fn submit(&self, job: Job) -> Result<(), PoolError>;

    /// Stops accepting jobs, finishes those queued, and joins workers.
    /// Idempotent.
    fn shutdown(&mut self);
}

/// Fixed-size pool of worker threads sharing one job queue.
pub struct ThreadPool {
    sender: Option<mpsc::Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    /// Default worker count when the caller does not supply a pool.
    pub const DEFAULT_WORKERS: usize = 4;

    /// Spawns `workers` threads; at least one.
    #[must_use]
    pub fn new(workers: usize) -> Self {
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let workers = (0..workers.max(1))
            .map(|index| {
                let receiver = Arc::clone(&receiver);
                std::thread::Builder::new()
                    .name(format!("foreman-worker-{index}"))
                    .spawn(move || {
                        loop {
                            // Hold the lock only while receiving so one
                            // slow job never starves the other workers.
                            let job = receiver.lock().recv();
                            match job {
                                Ok(job) => job(),
                                Err(_) => break,
                            }
                        }
                    })
                    .unwrap_or_else(|error| {
                        panic!("failed to spawn worker thread: {error}")
                    })
            })
            .collect();
        Self {
            sender: Some(sender),
            workers,
        }
    }

    /// Number of worker threads.
    #[must_use]
    pub fn workers(&self) -> usize {
        self.workers.len()
    }
}

impl Default for ThreadPool {
    fn default() -> Self {
        Self::new(Self::DEFAULT_WORKERS)
    }
}

impl WorkerPool for ThreadPool {
    fn submit(&self, job: Job) -> Result<(), PoolError> {
        let Some(sender) = self.sender.as_ref() else {
            return Err(PoolError::ShutDown);
        };
        sender.send(job).map_err(|_| PoolError::ShutDown)
    }

    fn shutdown(&mut self) {
        // Dropping the sender disconnects the queue; workers drain what
        // is left and exit.
        self.sender = None;
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                tracing::error!("worker thread panicked");
            }
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn jobs_run_on_background_threads() {
        let ran = Arc::new(AtomicUsize::new(0));
        let mut pool = ThreadPool::new(2);
        for _ in 0..8 {
            let ran = Arc::clone(&ran);
            pool.submit(Box::new(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        }
        pool.shutdown();
        assert_eq!(ran.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn shutdown_drains_queued_jobs() {
        let ran = Arc::new(AtomicUsize::new(0));
        let mut pool = ThreadPool::new(1);
        for _ in 0..4 {
            let ran = Arc::clone(&ran);
            pool.submit(Box::new(move || {
                std::thread::sleep(Duration::from_millis(5));
                ran.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        }
        pool.shutdown();
        assert_eq!(ran.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn submit_after_shutdown_is_rejected() {
        let mut pool = ThreadPool::new(1);
        pool.shutdown();
        assert!(matches!(
            pool.submit(Box::new(|| {})),
            Err(PoolError::ShutDown)
        ));
    }

    #[test]
    fn zero_workers_is_clamped_to_one() {
        let pool = ThreadPool::new(0);
        assert_eq!(pool.workers(), 1);
    }
}

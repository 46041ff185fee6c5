//! Fixed-size worker pool for one-shot tasks.
//!
//! Workers share one bounded submission queue (`mpsc::sync_channel`) behind a
//! mutex and block on it when idle. A task is an owned `FnOnce` closure: it
//! carries copies of everything it needs and reports its outcome through its
//! own result channel, never by touching caller memory.
//!
//! `shutdown` closes the queue, lets workers finish everything already
//! queued, and joins them. Nothing is cancelled or retried.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use log::{debug, error, info, warn};

use crate::error::SubmitError;

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct WorkerPool {
    tx: Option<SyncSender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `workers` threads (at least 1) sharing a queue of `queue_cap`
    /// pending tasks (at least 1).
    pub fn new(workers: usize, queue_cap: usize) -> std::io::Result<Self> {
        let workers = workers.max(1);
        let (tx, rx) = mpsc::sync_channel::<Job>(queue_cap.max(1));
        let rx = Arc::new(Mutex::new(rx));

        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers {
            let rx = Arc::clone(&rx);
            let handle = thread::Builder::new()
                .name(format!("ytview-worker-{i}"))
                .spawn(move || worker_loop(i, &rx))?;
            handles.push(handle);
        }
        info!("pool: {workers} workers started");
        Ok(Self {
            tx: Some(tx),
            workers: handles,
        })
    }

    /// Queue `task` for execution on some worker.
    ///
    /// On `Err` the task was dropped without running.
    pub fn submit<F>(&self, task: F) -> Result<(), SubmitError>
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(tx) = &self.tx else {
            return Err(SubmitError::ShuttingDown);
        };
        match tx.try_send(Box::new(task)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!("pool: submission queue full, task rejected");
                Err(SubmitError::Saturated)
            }
            Err(TrySendError::Disconnected(_)) => Err(SubmitError::ShuttingDown),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.tx.is_none()
    }

    /// Reject new submissions, run what is already queued, join all workers.
    /// Idempotent.
    pub fn shutdown(&mut self) {
        let Some(tx) = self.tx.take() else {
            return;
        };
        drop(tx);
        let n = self.workers.len();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("pool: worker thread panicked outside a task");
            }
        }
        info!("pool: {n} workers joined");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(index: usize, rx: &Mutex<Receiver<Job>>) {
    debug!("pool: worker {index} started");
    loop {
        // Hold the lock only while waiting for the next job.
        let job = rx.lock().unwrap_or_else(PoisonError::into_inner).recv();
        let Ok(job) = job else {
            break;
        };
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
            let msg = panic_message(payload.as_ref());
            error!("pool: worker {index}: task panicked: {msg}");
        }
    }
    debug!("pool: worker {index} exiting, queue closed");
}

/// Text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "<non-string panic>".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn every_task_runs_once_before_shutdown_returns() {
        let mut pool = WorkerPool::new(4, 256).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..200 {
            let c = Arc::clone(&counter);
            pool.submit(move || {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 200);
    }

    #[test]
    fn submit_after_shutdown_is_rejected() {
        let mut pool = WorkerPool::new(2, 4).unwrap();
        pool.shutdown();
        assert!(pool.is_shut_down());
        assert_eq!(pool.submit(|| {}), Err(SubmitError::ShuttingDown));
        // Second shutdown is a no-op.
        pool.shutdown();
    }

    #[test]
    fn full_queue_reports_saturated() {
        let mut pool = WorkerPool::new(1, 1).unwrap();
        let gate = Arc::new(Barrier::new(2));

        // Occupy the only worker until the barrier is released.
        let (started_tx, started_rx) = mpsc::channel();
        let g = Arc::clone(&gate);
        pool.submit(move || {
            let _ = started_tx.send(());
            g.wait();
        })
        .unwrap();
        started_rx.recv().unwrap();

        pool.submit(|| {}).unwrap();
        assert_eq!(pool.submit(|| {}), Err(SubmitError::Saturated));

        gate.wait();
        pool.shutdown();
    }

    #[test]
    fn panicking_task_does_not_kill_worker() {
        let mut pool = WorkerPool::new(1, 8).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        pool.submit(|| panic!("boom")).unwrap();
        let c = Arc::clone(&counter);
        pool.submit(move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn zero_workers_is_clamped() {
        let pool = WorkerPool::new(0, 0).unwrap();
        assert_eq!(pool.worker_count(), 1);
    }
}

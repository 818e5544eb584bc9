use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::StreamExt;
use futures_util::future::BoxFuture;
use futures_util::stream::FuturesUnordered;
use tracing::{debug, error};

use crate::error::TransferError;

pub type Job = BoxFuture<'static, Result<(), TransferError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolRun {
    /// This call started the driver and waited until the queue was empty.
    Drained,
    /// Another call was already driving; the jobs were handed to it.
    Joined,
}

#[derive(Default)]
struct PoolState {
    queue: VecDeque<Job>,
    driving: bool,
}

/// Runs queued jobs with at most `limit` in flight.
///
/// The driver runs on its own task, so jobs handed to it keep running even
/// when the call that started it is dropped.
pub struct WorkerPool {
    limit: usize,
    state: Mutex<PoolState>,
    in_flight: AtomicUsize,
}

impl WorkerPool {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            state: Mutex::new(PoolState::default()),
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn queued(&self) -> usize {
        self.lock().queue.len()
    }

    /// Queues `jobs` and, unless a driver is already active, spawns one and
    /// waits until both the queue and the in-flight set are empty. Jobs
    /// start in FIFO order; completion order is unconstrained. A failing job
    /// is logged and does not stop the others.
    pub async fn run_with_limit(self: &Arc<Self>, jobs: Vec<Job>) -> PoolRun {
        {
            let mut state = self.lock();
            state.queue.extend(jobs);
            if state.driving {
                debug!(queued = state.queue.len(), "pool already draining, jobs handed over");
                return PoolRun::Joined;
            }
            state.driving = true;
        }

        let pool = Arc::clone(self);
        let driver = tokio::spawn(async move { pool.drive().await });
        if let Err(err) = driver.await {
            error!(error = %err, "pool driver stopped");
        }
        PoolRun::Drained
    }

    async fn drive(&self) {
        let mut guard = DriverGuard {
            pool: self,
            armed: true,
        };
        let mut running = FuturesUnordered::new();
        loop {
            {
                let mut state = self.lock();
                while running.len() < self.limit {
                    match state.queue.pop_front() {
                        Some(job) => running.push(job),
                        None => break,
                    }
                }
                if running.is_empty() {
                    state.driving = false;
                    guard.armed = false;
                    break;
                }
            }
            self.in_flight.store(running.len(), Ordering::SeqCst);

            if let Some(Err(err)) = running.next().await {
                error!(error = %err, "transfer job failed");
            }
            self.in_flight.store(running.len(), Ordering::SeqCst);
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases the driver flag if the driver task panics.
struct DriverGuard<'a> {
    pool: &'a WorkerPool,
    armed: bool,
}

impl Drop for DriverGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.lock().driving = false;
            self.pool.in_flight.store(0, Ordering::SeqCst);
        }
    }
}

//! Worker threads.
//!
//! A worker drains one group's queue for its whole life. User-processing
//! failures are isolated to the packet that caused them; the only way out
//! of the loop is cooperative termination observed on a `None` extract.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::packet::Packet;
use crate::pool::PoolShared;
use crate::pool::stall::{StallChecker, StallGuard};
use crate::queue::RequestQueue;

/// User callback invoked for each dequeued packet. May run arbitrarily
/// long; long-running processors should poll [`Worker::terminated`]
/// between checkpoints if cancellation responsiveness matters.
pub type ProcessFn = Arc<dyn Fn(&Worker, Packet) + Send + Sync + 'static>;

/// Handle describing one worker thread, shared between the thread itself
/// and its owning pool.
pub struct Worker {
    id: usize,
    group_index: usize,
    terminated: Arc<AtomicBool>,
    abandoned: Arc<AtomicBool>,
    stall: StallChecker,
}

impl Worker {
    pub(crate) fn new(id: usize, group_index: usize, stall_timeout: Duration) -> Self {
        let terminated = Arc::new(AtomicBool::new(false));
        Self {
            id,
            group_index,
            terminated: terminated.clone(),
            abandoned: Arc::new(AtomicBool::new(false)),
            stall: StallChecker::new(stall_timeout, terminated),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn group_index(&self) -> usize {
        self.group_index
    }

    /// Cooperative-stop flag. Workers honor it the next time they come
    /// back to the queue; user callbacks may poll it mid-processing.
    pub fn terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Idle means waiting on the queue, i.e. not inside user processing.
    pub fn is_idle(&self) -> bool {
        !self.stall.started()
    }

    pub(crate) fn terminate(&self) {
        self.terminated.store(true, Ordering::Release);
    }

    pub(crate) fn abandon(&self) {
        self.abandoned.store(true, Ordering::Release);
        self.terminated.store(true, Ordering::Release);
    }

    pub(crate) fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::Acquire)
    }

    pub(crate) fn stall_checker(&self) -> &StallChecker {
        &self.stall
    }
}

/// The worker thread body.
pub(crate) fn worker_loop(
    worker: Arc<Worker>,
    queue: Arc<RequestQueue>,
    pool: Arc<PoolShared>,
    process: ProcessFn,
) {
    log::debug!(
        "worker {} (group {}) started",
        worker.id,
        worker.group_index
    );
    loop {
        // An abandoned worker has already been unregistered and replaced;
        // it must not consume queue wakeups meant for live workers.
        if worker.is_abandoned() {
            break;
        }
        match queue.extract() {
            None => {
                // Break token or an all-expired sweep. Either way, this is
                // the only place termination is honored.
                if worker.terminated() {
                    break;
                }
            }
            Some(packet) => {
                let _guard = StallGuard::new(&worker.stall);
                let result = catch_unwind(AssertUnwindSafe(|| process(&worker, packet)));
                match result {
                    Ok(()) => {
                        pool.metrics
                            .packets_processed
                            .fetch_add(1, Ordering::Release);
                    }
                    Err(panic) => {
                        pool.metrics.process_errors.fetch_add(1, Ordering::Release);
                        log::error!(
                            "worker {} (group {}): processing panicked: {}",
                            worker.id,
                            worker.group_index,
                            panic_message(&*panic)
                        );
                    }
                }
            }
        }
    }
    pool.unregister(worker.id);
    if worker.is_abandoned() {
        log::info!(
            "abandoned worker {} (group {}) finally exited",
            worker.id,
            worker.group_index
        );
    } else {
        log::debug!(
            "worker {} (group {}) exited",
            worker.id,
            worker.group_index
        );
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "unknown panic payload"
    }
}

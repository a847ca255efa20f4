//! Adaptive worker pool.
//!
//! One pool drains one group's queue. The supervisor calls [`WorkerPool::tick`]
//! periodically; each tick sweeps stalled workers, abandons workers that
//! missed their cooperative-exit deadline, and then resizes the pool
//! against the live load: grow while packets are queued and nobody is
//! idle, shrink when idle capacity piles up above the floor.
//!
//! Termination is a two-stage protocol. Stage one flips the worker's
//! cooperative-stop flag and injects one queue break token; the worker
//! exits the next time it returns to the queue. Stage two applies to a
//! worker still wedged in user code when the deadline lapses. It cannot be
//! killed on this runtime, so the pool abandons it instead: unregister, detach,
//! count it as a zombie, and let the floor rule replace it.

pub mod stall;
pub mod worker;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::GroupConfig;
use crate::metrics::GroupMetrics;
use crate::queue::RequestQueue;

use self::worker::{ProcessFn, Worker, worker_loop};

/// Cap on how long `wait_for_all` polls for a clean drain at shutdown.
pub(crate) const MAX_WAIT_FOR: Duration = Duration::from_secs(2);

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Pool tuning derived from [`GroupConfig`]; kept as raw durations so the
/// thresholds are not pinned to whole seconds internally.
#[derive(Debug, Clone)]
pub(crate) struct PoolSettings {
    pub min_threads: usize,
    pub max_threads: usize,
    pub stall_timeout: Duration,
    pub term_deadline: Duration,
}

impl From<&GroupConfig> for PoolSettings {
    fn from(cfg: &GroupConfig) -> Self {
        Self {
            min_threads: cfg.min_threads,
            max_threads: cfg.max_threads,
            stall_timeout: Duration::from_secs(cfg.stall_timeout_secs),
            term_deadline: Duration::from_secs(cfg.term_deadline_secs),
        }
    }
}

struct WorkerHandle {
    worker: Arc<Worker>,
    join: thread::JoinHandle<()>,
    /// When cooperative termination was first signaled; the abandonment
    /// deadline counts from here.
    term_signaled_at: Mutex<Option<Instant>>,
}

pub(crate) struct PoolShared {
    group_index: usize,
    queue: Arc<RequestQueue>,
    workers: Mutex<Vec<WorkerHandle>>,
    min_threads: AtomicUsize,
    max_threads: AtomicUsize,
    stall_timeout: Duration,
    term_deadline: Duration,
    pub(crate) metrics: Arc<GroupMetrics>,
    process: ProcessFn,
    next_worker_id: AtomicUsize,
}

impl PoolShared {
    /// Spawn `n` workers and register them.
    fn grow(self: &Arc<Self>, n: usize) {
        for _ in 0..n {
            let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
            let worker = Arc::new(Worker::new(id, self.group_index, self.stall_timeout));
            let name = format!("udp-worker-{}-{}", self.group_index, id);
            let spawn = thread::Builder::new().name(name.clone()).spawn({
                let worker = worker.clone();
                let queue = self.queue.clone();
                let pool = self.clone();
                let process = self.process.clone();
                move || worker_loop(worker, queue, pool, process)
            });
            match spawn {
                Ok(join) => {
                    self.metrics.workers_spawned.fetch_add(1, Ordering::Release);
                    self.workers.lock().push(WorkerHandle {
                        worker,
                        join,
                        term_signaled_at: Mutex::new(None),
                    });
                }
                Err(e) => {
                    log::error!("group {}: failed to spawn {name}: {e}", self.group_index);
                }
            }
        }
    }

    /// Signal cooperative termination to `n` workers not already signaled,
    /// then wake that many queue waiters. Workers unregister themselves.
    fn shrink(&self, n: usize) {
        let signaled = {
            let workers = self.workers.lock();
            let now = Instant::now();
            let mut signaled = 0;
            for h in workers.iter() {
                if signaled == n {
                    break;
                }
                if !h.worker.terminated() {
                    h.worker.terminate();
                    *h.term_signaled_at.lock() = Some(now);
                    signaled += 1;
                }
            }
            signaled
        };
        self.queue.break_waiting(signaled);
    }

    pub(crate) fn unregister(&self, worker_id: usize) {
        let mut workers = self.workers.lock();
        if let Some(pos) = workers.iter().position(|h| h.worker.id() == worker_id) {
            workers.remove(pos);
            self.metrics.workers_retired.fetch_add(1, Ordering::Release);
        }
    }

    /// Stage one of the liveness protocol: stamp newly stalled workers and
    /// wake one waiter per signal so each stalled worker's eventual return
    /// to the queue cannot block.
    fn check_stalls(&self) {
        let newly_signaled = {
            let workers = self.workers.lock();
            let mut newly_signaled = 0;
            for h in workers.iter() {
                if h.worker.stall_checker().check() {
                    let mut at = h.term_signaled_at.lock();
                    if at.is_none() {
                        *at = Some(Instant::now());
                        self.metrics.stalls_detected.fetch_add(1, Ordering::Release);
                        newly_signaled += 1;
                        log::warn!(
                            "group {}: worker {} stalled past {:?}, signaling cooperative exit",
                            self.group_index,
                            h.worker.id(),
                            self.stall_timeout
                        );
                    }
                }
            }
            newly_signaled
        };
        self.queue.break_waiting(newly_signaled);
    }

    /// Stage two: abandon workers that were signaled longer than the term
    /// deadline ago and still have not exited, and sweep out any thread
    /// that finished without unregistering.
    fn kill_zombies(&self) {
        let mut zombies = Vec::new();
        {
            let mut workers = self.workers.lock();
            let mut i = 0;
            while i < workers.len() {
                if workers[i].join.is_finished() {
                    workers.remove(i);
                    self.metrics.workers_retired.fetch_add(1, Ordering::Release);
                    continue;
                }
                let expired = {
                    let at = workers[i].term_signaled_at.lock();
                    matches!(*at, Some(t) if t.elapsed() > self.term_deadline)
                };
                if expired {
                    zombies.push(workers.remove(i));
                    continue;
                }
                i += 1;
            }
        }
        for h in zombies {
            h.worker.abandon();
            self.metrics.zombie_workers.fetch_add(1, Ordering::Release);
            log::error!(
                "group {}: worker {} missed cooperative-exit deadline ({:?}), abandoning thread",
                self.group_index,
                h.worker.id(),
                self.term_deadline
            );
            // Dropping the join handle detaches the thread; it is leaked
            // until (if ever) user code returns.
        }
    }

    fn tick(self: &Arc<Self>) {
        self.check_stalls();
        self.kill_zombies();

        let (total, idle) = {
            let workers = self.workers.lock();
            let idle = workers.iter().filter(|h| h.worker.is_idle()).count();
            (workers.len(), idle)
        };
        let queued = self.queue.len();
        let min = self.min_threads.load(Ordering::Acquire);
        let max = self.max_threads.load(Ordering::Acquire);

        if queued > 0 && idle == 0 && total < max {
            let step = (total / 4).max(1).min(max - total);
            log::debug!(
                "group {}: {queued} queued, 0 idle of {total}, growing by {step}",
                self.group_index
            );
            self.grow(step);
        } else if total > min {
            let idle_target = (total / 8).max(1);
            if idle > idle_target {
                let surplus = (idle - idle_target).min(total - min);
                log::debug!(
                    "group {}: {idle} idle of {total}, shrinking by {surplus}",
                    self.group_index
                );
                self.shrink(surplus);
            }
        }

        // A pool thinned below its floor by zombie abandonment or retuned
        // bounds recovers here rather than waiting for queued traffic.
        let total = self.workers.lock().len();
        if total < min {
            self.grow(min - total);
        }
    }

    fn terminate_all(&self) {
        let count = {
            let workers = self.workers.lock();
            let now = Instant::now();
            for h in workers.iter() {
                h.worker.terminate();
                let mut at = h.term_signaled_at.lock();
                if at.is_none() {
                    *at = Some(now);
                }
            }
            workers.len()
        };
        self.queue.break_waiting(count);
    }

    fn wait_for_all(&self) {
        let deadline = Instant::now() + MAX_WAIT_FOR;
        loop {
            if self.workers.lock().is_empty() {
                return;
            }
            if Instant::now() >= deadline {
                break;
            }
            thread::sleep(WAIT_POLL_INTERVAL);
        }
        let survivors: Vec<WorkerHandle> = {
            let mut workers = self.workers.lock();
            workers.drain(..).collect()
        };
        for h in survivors {
            h.worker.abandon();
            self.metrics.zombie_workers.fetch_add(1, Ordering::Release);
            log::error!(
                "group {}: worker {} still running after {:?} shutdown drain, abandoning",
                self.group_index,
                h.worker.id(),
                MAX_WAIT_FOR
            );
        }
    }
}

/// Self-sizing pool of worker threads for one request group.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
}

impl WorkerPool {
    pub(crate) fn new(
        group_index: usize,
        queue: Arc<RequestQueue>,
        settings: PoolSettings,
        metrics: Arc<GroupMetrics>,
        process: ProcessFn,
    ) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                group_index,
                queue,
                workers: Mutex::new(Vec::new()),
                min_threads: AtomicUsize::new(settings.min_threads),
                max_threads: AtomicUsize::new(settings.max_threads),
                stall_timeout: settings.stall_timeout,
                term_deadline: settings.term_deadline,
                metrics,
                process,
                next_worker_id: AtomicUsize::new(0),
            }),
        }
    }

    pub fn thread_count(&self) -> usize {
        self.shared.workers.lock().len()
    }

    pub fn idle_count(&self) -> usize {
        self.shared
            .workers
            .lock()
            .iter()
            .filter(|h| h.worker.is_idle())
            .count()
    }

    /// One adjustment pass: stall sweep, zombie sweep, then load-based
    /// resize.
    pub fn tick(&self) {
        self.shared.tick();
    }

    /// Retune the pool bounds; the next tick applies them.
    pub fn set_thread_bounds(&self, min_threads: usize, max_threads: usize) {
        self.shared.min_threads.store(min_threads, Ordering::Release);
        self.shared.max_threads.store(max_threads, Ordering::Release);
    }

    pub(crate) fn grow(&self, n: usize) {
        self.shared.grow(n);
    }

    pub(crate) fn terminate_all(&self) {
        self.shared.terminate_all();
    }

    pub(crate) fn wait_for_all(&self) {
        self.shared.wait_for_all();
    }
}

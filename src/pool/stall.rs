//! Per-worker stall detection.
//!
//! A worker stamps its checker when it enters user processing and clears
//! it when it leaves; the pool's supervisor calls [`StallChecker::check`]
//! once per tick. Stalls are almost never the worker loop itself; they
//! come from user code blocking on something external, so the response is
//! to flip the worker's cooperative-stop flag and let the pool escalate
//! from there.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

pub struct StallChecker {
    inner: Mutex<StallInner>,
    /// Zero disables stall detection entirely.
    timeout: Duration,
    /// The owning worker's cooperative-stop flag; set when a stall is
    /// detected.
    terminated: Arc<AtomicBool>,
}

struct StallInner {
    started: bool,
    start_time: Instant,
}

impl StallChecker {
    pub fn new(timeout: Duration, terminated: Arc<AtomicBool>) -> Self {
        Self {
            inner: Mutex::new(StallInner {
                started: false,
                start_time: Instant::now(),
            }),
            timeout,
            terminated,
        }
    }

    fn start(&self) {
        let mut inner = self.inner.lock();
        inner.started = true;
        inner.start_time = Instant::now();
    }

    fn stop(&self) {
        self.inner.lock().started = false;
    }

    /// True exactly while the worker is inside user processing.
    pub fn started(&self) -> bool {
        self.inner.lock().started
    }

    /// Report whether the worker has exceeded its budget; on overrun,
    /// signal the worker to terminate cooperatively.
    pub fn check(&self) -> bool {
        if self.timeout.is_zero() {
            return false;
        }
        let stalled = {
            let inner = self.inner.lock();
            inner.started && inner.start_time.elapsed() > self.timeout
        };
        if stalled {
            self.terminated.store(true, Ordering::Release);
        }
        stalled
    }
}

/// Scope guard around the user-processing region. `stop()` runs on every
/// exit path, including a panic in user code.
pub(crate) struct StallGuard<'a> {
    checker: &'a StallChecker,
}

impl<'a> StallGuard<'a> {
    pub(crate) fn new(checker: &'a StallChecker) -> Self {
        checker.start();
        Self { checker }
    }
}

impl Drop for StallGuard<'_> {
    fn drop(&mut self) {
        self.checker.stop();
    }
}

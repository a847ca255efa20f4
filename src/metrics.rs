//! Pipeline counters.
//!
//! Non-fatal incidents never propagate as errors; they land here. Counters
//! are plain atomics mutated at the point of the incident and read through
//! a snapshot, so embedders can poll them without touching any pipeline
//! lock.

use std::sync::atomic::{AtomicU64, Ordering};

/// Server-wide counters, maintained by the listener threads.
#[derive(Debug, Default)]
pub struct ServerMetrics {
    /// Datagrams read off the socket.
    pub packets_received: AtomicU64,
    /// Datagrams dropped because the classifier returned an out-of-range
    /// group index.
    pub packets_invalid_group: AtomicU64,
}

impl ServerMetrics {
    pub fn snapshot(&self) -> ServerMetricsSnapshot {
        ServerMetricsSnapshot {
            packets_received: self.packets_received.load(Ordering::Acquire),
            packets_invalid_group: self.packets_invalid_group.load(Ordering::Acquire),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerMetricsSnapshot {
    pub packets_received: u64,
    pub packets_invalid_group: u64,
}

/// Per-group counters, shared by the group's queue, pool, and workers.
#[derive(Debug, Default)]
pub struct GroupMetrics {
    /// Packets accepted into the queue.
    pub packets_enqueued: AtomicU64,
    /// Packets lost to the overflow policy (head-drop eviction or
    /// rejected admission, depending on configuration).
    pub packets_evicted: AtomicU64,
    /// Packets discarded at dequeue for exceeding the effective wait.
    pub packets_expired: AtomicU64,
    /// Packets a worker finished processing without error.
    pub packets_processed: AtomicU64,
    /// User-processing failures (caught panics).
    pub process_errors: AtomicU64,
    /// Worker threads started.
    pub workers_spawned: AtomicU64,
    /// Worker threads that exited cleanly and unregistered.
    pub workers_retired: AtomicU64,
    /// Workers whose processing exceeded the stall budget.
    pub stalls_detected: AtomicU64,
    /// Workers abandoned after missing the cooperative-exit deadline.
    /// These are accounting leaks: the thread is detached, not killed.
    pub zombie_workers: AtomicU64,
}

impl GroupMetrics {
    pub fn snapshot(&self) -> GroupMetricsSnapshot {
        GroupMetricsSnapshot {
            packets_enqueued: self.packets_enqueued.load(Ordering::Acquire),
            packets_evicted: self.packets_evicted.load(Ordering::Acquire),
            packets_expired: self.packets_expired.load(Ordering::Acquire),
            packets_processed: self.packets_processed.load(Ordering::Acquire),
            process_errors: self.process_errors.load(Ordering::Acquire),
            workers_spawned: self.workers_spawned.load(Ordering::Acquire),
            workers_retired: self.workers_retired.load(Ordering::Acquire),
            stalls_detected: self.stalls_detected.load(Ordering::Acquire),
            zombie_workers: self.zombie_workers.load(Ordering::Acquire),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupMetricsSnapshot {
    pub packets_enqueued: u64,
    pub packets_evicted: u64,
    pub packets_expired: u64,
    pub packets_processed: u64,
    pub process_errors: u64,
    pub workers_spawned: u64,
    pub workers_retired: u64,
    pub stalls_detected: u64,
    pub zombie_workers: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reads_counters() {
        let m = GroupMetrics::default();
        m.packets_enqueued.fetch_add(3, Ordering::Release);
        m.packets_expired.fetch_add(1, Ordering::Release);
        let s = m.snapshot();
        assert_eq!(s.packets_enqueued, 3);
        assert_eq!(s.packets_expired, 1);
        assert_eq!(s.packets_processed, 0);
    }
}

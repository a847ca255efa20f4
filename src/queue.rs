//! Bounded per-group request queue.
//!
//! The queue is a FIFO of owned packets guarded by one mutex, paired with a
//! counted wakeup that plays the role of a semaphore: its value is the
//! number of outstanding wakeups (queued packets plus break tokens injected
//! by [`RequestQueue::break_waiting`]). A worker blocked in
//! [`RequestQueue::extract`] consumes exactly one wakeup per return, so
//! `break_waiting(n)` releases exactly `n` waiters; that is the only
//! mechanism that unblocks workers at shutdown.
//!
//! Two loss points, both counted:
//! - admission at capacity, resolved by the configured overflow policy;
//! - dequeue of a packet older than the effective wait, discarded instead
//!   of handed to a worker.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::config::OverflowPolicy;
use crate::metrics::GroupMetrics;
use crate::packet::Packet;

pub struct RequestQueue {
    inner: Mutex<QueueInner>,
    available: Condvar,
    capacity: usize,
    effective_wait: Duration,
    policy: OverflowPolicy,
    metrics: Arc<GroupMetrics>,
}

struct QueueInner {
    packets: VecDeque<Packet>,
    /// Outstanding wakeups: packets plus injected break tokens. Eviction
    /// and age-expiry do not reclaim tokens; the surplus surfaces as
    /// spurious `None` returns from `extract`, which callers tolerate.
    wakeups: usize,
}

impl RequestQueue {
    pub fn new(
        capacity: usize,
        effective_wait: Duration,
        policy: OverflowPolicy,
        metrics: Arc<GroupMetrics>,
    ) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                packets: VecDeque::with_capacity(capacity.min(1024)),
                wakeups: 0,
            }),
            available: Condvar::new(),
            capacity,
            effective_wait,
            policy,
            metrics,
        }
    }

    /// Take ownership of a packet and wake one waiter.
    ///
    /// At capacity the overflow policy decides which packet is lost; the
    /// loss is counted in `packets_evicted` either way.
    pub fn add(&self, packet: Packet) {
        let mut inner = self.inner.lock();
        if inner.packets.len() >= self.capacity {
            match self.policy {
                OverflowPolicy::DropOldest => {
                    inner.packets.pop_front();
                    self.metrics.packets_evicted.fetch_add(1, Ordering::Release);
                    log::debug!("queue at capacity {}, evicted oldest packet", self.capacity);
                }
                OverflowPolicy::RejectNew => {
                    self.metrics.packets_evicted.fetch_add(1, Ordering::Release);
                    log::debug!("queue at capacity {}, rejected new packet", self.capacity);
                    return;
                }
            }
        }
        inner.packets.push_back(packet);
        inner.wakeups += 1;
        self.metrics.packets_enqueued.fetch_add(1, Ordering::Release);
        drop(inner);
        self.available.notify_one();
    }

    /// Block until a wakeup is available, then return the front packet.
    ///
    /// Packets older than the effective wait are discarded on the way out.
    /// Returns `None` when the wakeup was a break token, or when every
    /// queued packet had already expired. Callers treat `None` as a
    /// prompt to re-check their termination flag.
    pub fn extract(&self) -> Option<Packet> {
        let mut inner = self.inner.lock();
        while inner.wakeups == 0 {
            self.available.wait(&mut inner);
        }
        inner.wakeups -= 1;
        while let Some(front) = inner.packets.front() {
            if front.age() > self.effective_wait {
                inner.packets.pop_front();
                self.metrics.packets_expired.fetch_add(1, Ordering::Release);
                continue;
            }
            break;
        }
        inner.packets.pop_front()
    }

    /// Drop every queued packet. Outstanding wakeups are left alone so
    /// blocked workers still wake, observe `None`, and can exit.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        let dropped = inner.packets.len();
        inner.packets.clear();
        if dropped > 0 {
            log::debug!("cleared {dropped} packets from queue");
        }
    }

    /// Inject `n` break tokens, waking exactly `n` waiters without
    /// enqueueing anything.
    pub fn break_waiting(&self, n: usize) {
        if n == 0 {
            return;
        }
        let mut inner = self.inner.lock();
        inner.wakeups += n;
        drop(inner);
        for _ in 0..n {
            self.available.notify_one();
        }
    }

    /// Packets currently held. Approximate: the count is stale the moment
    /// the lock is released.
    pub fn len(&self) -> usize {
        self.inner.lock().packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn peer() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    fn packet(tag: u8) -> Packet {
        Packet::new(vec![tag], peer())
    }

    fn queue(capacity: usize, wait_secs: u64, policy: OverflowPolicy) -> RequestQueue {
        RequestQueue::new(
            capacity,
            Duration::from_secs(wait_secs),
            policy,
            Arc::new(GroupMetrics::default()),
        )
    }

    #[test]
    fn test_fifo_order() {
        let q = queue(10, 30, OverflowPolicy::DropOldest);
        q.add(packet(1));
        q.add(packet(2));
        q.add(packet(3));
        assert_eq!(q.extract().unwrap().payload(), &[1]);
        assert_eq!(q.extract().unwrap().payload(), &[2]);
        assert_eq!(q.extract().unwrap().payload(), &[3]);
    }

    #[test]
    fn test_drop_oldest_at_capacity() {
        let metrics = Arc::new(GroupMetrics::default());
        let q = RequestQueue::new(
            1,
            Duration::from_secs(30),
            OverflowPolicy::DropOldest,
            metrics.clone(),
        );
        q.add(packet(1));
        q.add(packet(2));
        assert_eq!(q.len(), 1);
        assert_eq!(metrics.snapshot().packets_evicted, 1);
        // The survivor is the fresh packet.
        assert_eq!(q.extract().unwrap().payload(), &[2]);
    }

    #[test]
    fn test_reject_new_at_capacity() {
        let metrics = Arc::new(GroupMetrics::default());
        let q = RequestQueue::new(
            1,
            Duration::from_secs(30),
            OverflowPolicy::RejectNew,
            metrics.clone(),
        );
        q.add(packet(1));
        q.add(packet(2));
        assert_eq!(q.len(), 1);
        assert_eq!(metrics.snapshot().packets_evicted, 1);
        assert_eq!(q.extract().unwrap().payload(), &[1]);
    }

    #[test]
    fn test_zero_effective_wait_expires_everything() {
        let metrics = Arc::new(GroupMetrics::default());
        let q = RequestQueue::new(
            10,
            Duration::ZERO,
            OverflowPolicy::DropOldest,
            metrics.clone(),
        );
        q.add(packet(1));
        q.add(packet(2));
        thread::sleep(Duration::from_millis(5));
        // First extract sweeps both expired packets and comes back empty.
        assert!(q.extract().is_none());
        assert!(q.extract().is_none());
        assert_eq!(metrics.snapshot().packets_expired, 2);
    }

    #[test]
    fn test_expired_front_is_skipped_for_fresh_packet() {
        let metrics = Arc::new(GroupMetrics::default());
        let q = RequestQueue::new(
            10,
            Duration::from_millis(50),
            OverflowPolicy::DropOldest,
            metrics.clone(),
        );
        q.add(packet(1));
        thread::sleep(Duration::from_millis(80));
        q.add(packet(2));
        let got = q.extract().unwrap();
        assert_eq!(got.payload(), &[2]);
        assert_eq!(metrics.snapshot().packets_expired, 1);
    }

    #[test]
    fn test_break_waiting_wakes_exactly_n() {
        let q = Arc::new(queue(10, 30, OverflowPolicy::DropOldest));
        let woken = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..3 {
            let q = q.clone();
            let woken = woken.clone();
            handles.push(thread::spawn(move || {
                let got = q.extract();
                assert!(got.is_none());
                woken.fetch_add(1, Ordering::SeqCst);
            }));
        }
        thread::sleep(Duration::from_millis(100));
        assert_eq!(woken.load(Ordering::SeqCst), 0);
        q.break_waiting(3);
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(woken.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_clear_keeps_wakeups() {
        let q = queue(10, 30, OverflowPolicy::DropOldest);
        q.add(packet(1));
        q.add(packet(2));
        q.clear();
        assert!(q.is_empty());
        // Tokens from the cleared packets still wake us, as spurious Nones.
        assert!(q.extract().is_none());
        assert!(q.extract().is_none());
    }

    #[test]
    fn test_extract_blocks_until_add() {
        let q = Arc::new(queue(10, 30, OverflowPolicy::DropOldest));
        let handle = {
            let q = q.clone();
            thread::spawn(move || q.extract())
        };
        thread::sleep(Duration::from_millis(50));
        q.add(packet(7));
        let got = handle.join().unwrap();
        assert_eq!(got.unwrap().payload(), &[7]);
    }
}

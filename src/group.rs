use std::sync::Arc;
use std::time::Duration;

use crate::config::GroupConfig;
use crate::metrics::{GroupMetrics, GroupMetricsSnapshot};
use crate::packet::Packet;
use crate::pool::worker::ProcessFn;
use crate::pool::{PoolSettings, WorkerPool};
use crate::queue::RequestQueue;

/// One partition of inbound traffic: a bounded queue paired with the
/// worker pool that drains it. Groups are independent; a failure in one
/// group's queue or workers never touches another.
pub struct RequestGroup {
    index: usize,
    queue: Arc<RequestQueue>,
    pool: WorkerPool,
    metrics: Arc<GroupMetrics>,
}

impl RequestGroup {
    pub(crate) fn new(
        index: usize,
        cfg: &GroupConfig,
        metrics: Arc<GroupMetrics>,
        process: ProcessFn,
    ) -> Self {
        let queue = Arc::new(RequestQueue::new(
            cfg.queue_capacity,
            Duration::from_secs(cfg.effective_wait_secs),
            cfg.overflow_policy,
            metrics.clone(),
        ));
        let pool = WorkerPool::new(
            index,
            queue.clone(),
            PoolSettings::from(cfg),
            metrics.clone(),
            process,
        );
        Self {
            index,
            queue,
            pool,
            metrics,
        }
    }

    /// Zero-based group index, stable for the server's lifetime.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn metrics(&self) -> GroupMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub(crate) fn queue(&self) -> &Arc<RequestQueue> {
        &self.queue
    }

    /// Hand an inbound packet to this group's queue.
    pub(crate) fn dispatch(&self, packet: Packet) {
        self.queue.add(packet);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    #[test]
    fn test_dispatch_lands_in_own_queue() {
        let metrics = Arc::new(GroupMetrics::default());
        let group = RequestGroup::new(
            2,
            &GroupConfig::default(),
            metrics.clone(),
            Arc::new(|_, _| {}),
        );
        assert_eq!(group.index(), 2);
        let peer: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        group.dispatch(Packet::new(vec![1, 2, 3], peer));
        assert_eq!(group.queue_len(), 1);
        assert_eq!(group.metrics().packets_enqueued, 1);
        assert_eq!(group.pool().thread_count(), 0);
    }
}

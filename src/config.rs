use serde::{Deserialize, Serialize};

use crate::error::ServerError;

/// What `RequestQueue::add` does when the queue is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest queued packet to make room for the new one.
    /// Fresh traffic beats stale traffic in a lossy datagram workload.
    #[default]
    DropOldest,
    /// Keep the queue as-is and drop the incoming packet.
    RejectNew,
}

/// Configuration for one request group (queue + worker pool).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    /// Maximum packets held in the queue. Default: 1000
    pub queue_capacity: usize,
    /// Maximum age in seconds a packet may reach in the queue before it is
    /// discarded at dequeue. Default: 10
    pub effective_wait_secs: u64,
    /// At-capacity admission behavior. Default: drop_oldest
    #[serde(default)]
    pub overflow_policy: OverflowPolicy,
    /// Pool floor; `tick` re-grows the pool to this size. Default: 1
    pub min_threads: usize,
    /// Pool ceiling for adaptive scale-up. Default: 8
    pub max_threads: usize,
    /// Seconds a worker may spend inside user processing before it is
    /// considered stalled; 0 disables stall detection. Default: 30
    pub stall_timeout_secs: u64,
    /// Seconds between cooperative-stop and abandonment of a worker that
    /// refuses to exit. Default: 180
    #[serde(default = "GroupConfig::default_term_deadline_secs")]
    pub term_deadline_secs: u64,
}

impl GroupConfig {
    fn default_term_deadline_secs() -> u64 {
        180
    }
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
            effective_wait_secs: 10,
            overflow_policy: OverflowPolicy::DropOldest,
            min_threads: 1,
            max_threads: 8,
            stall_timeout_secs: 30,
            term_deadline_secs: 180,
        }
    }
}

/// Top-level server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// UDP port to bind; 0 asks the OS for an ephemeral port.
    pub local_port: u16,
    /// Listener threads sharing the socket. Default: 1
    pub listener_threads: usize,
    /// One entry per request group; group index is the position here.
    pub groups: Vec<GroupConfig>,
    /// Supervisor cadence for pool adjustment. Default: 1000
    #[serde(default = "ServerConfig::default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// OS-level socket read timeout; bounds how long listener shutdown
    /// can lag behind `close()`. Default: 250
    #[serde(default = "ServerConfig::default_recv_timeout_ms")]
    pub recv_timeout_ms: u64,
}

impl ServerConfig {
    fn default_tick_interval_ms() -> u64 {
        1000
    }

    fn default_recv_timeout_ms() -> u64 {
        250
    }

    /// Single group, one listener, on the given port.
    pub fn for_port(local_port: u16) -> Self {
        Self {
            local_port,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ServerError> {
        if self.listener_threads == 0 {
            return Err(ServerError::InvalidConfig(
                "listener_threads must be at least 1".into(),
            ));
        }
        if self.groups.is_empty() {
            return Err(ServerError::InvalidConfig(
                "at least one request group is required".into(),
            ));
        }
        if self.tick_interval_ms == 0 {
            return Err(ServerError::InvalidConfig(
                "tick_interval_ms must be nonzero".into(),
            ));
        }
        if self.recv_timeout_ms == 0 {
            return Err(ServerError::InvalidConfig(
                "recv_timeout_ms must be nonzero".into(),
            ));
        }
        for (i, g) in self.groups.iter().enumerate() {
            if g.queue_capacity == 0 {
                return Err(ServerError::InvalidConfig(format!(
                    "group {i}: queue_capacity must be at least 1"
                )));
            }
            if g.max_threads < g.min_threads {
                return Err(ServerError::InvalidConfig(format!(
                    "group {i}: max_threads ({}) below min_threads ({})",
                    g.max_threads, g.min_threads
                )));
            }
        }
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            local_port: 0,
            listener_threads: 1,
            groups: vec![GroupConfig::default()],
            tick_interval_ms: 1000,
            recv_timeout_ms: 250,
        }
    }
}

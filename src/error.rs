use std::io;

use thiserror::Error;

/// Errors surfaced to the embedder.
///
/// Only startup and lifecycle failures reach the caller. Everything that
/// happens inside the pipeline once the server is open (overflow eviction,
/// age expiry, classifier misroutes, worker panics, stalls) is absorbed,
/// logged, and exposed through counters instead.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind UDP socket on port {port}: {source}")]
    Bind { port: u16, source: io::Error },

    #[error("socket configuration failed: {0}")]
    Socket(io::Error),

    #[error("failed to spawn {name} thread: {source}")]
    Spawn { name: String, source: io::Error },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("server is already open")]
    AlreadyOpen,

    #[error("group index {index} out of range ({count} groups configured)")]
    GroupOutOfRange { index: usize, count: usize },
}

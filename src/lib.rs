//! Squall: adaptive UDP server engine.
//!
//! A concurrent datagram pipeline: listener threads receive UDP packets,
//! a user classifier routes each packet into one of several request
//! groups, and each group's bounded queue is drained by a worker-thread
//! pool that resizes itself against live load.
//!
//! Features:
//! - Bounded per-group queues with configurable overflow policy and
//!   age-based expiry at dequeue
//! - Worker pools that grow under pressure and shrink when idle, between
//!   per-group floors and ceilings
//! - Two-stage liveness protocol: stalled workers are asked to exit
//!   cooperatively, then abandoned and replaced if they refuse
//! - Panic isolation: a failure processing one packet never takes down
//!   its worker
//! - Atomic incident counters for every loss point in the pipeline
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use squall::{ServerConfig, UdpServer};
//!
//! let mut server = UdpServer::new(ServerConfig::for_port(9530))
//!     .with_processor(|_worker, packet| {
//!         println!("{} bytes from {}", packet.len(), packet.peer());
//!     });
//!
//! server.open()?;
//! // ... serve until shutdown ...
//! server.close();
//! # Ok::<(), squall::ServerError>(())
//! ```

pub mod config;
pub mod error;
pub mod group;
pub mod metrics;
pub mod packet;
pub mod pool;
pub mod queue;
pub mod server;

pub use config::{GroupConfig, OverflowPolicy, ServerConfig};
pub use error::ServerError;
pub use group::RequestGroup;
pub use metrics::{GroupMetricsSnapshot, ServerMetricsSnapshot};
pub use packet::Packet;
pub use pool::WorkerPool;
pub use pool::worker::Worker;
pub use queue::RequestQueue;
pub use server::{ClassifyFn, UdpServer};

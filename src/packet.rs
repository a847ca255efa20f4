use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// An owned inbound datagram.
///
/// Created by a listener thread the moment a datagram leaves the socket,
/// then handed through the request queue to exactly one worker. Fields are
/// fixed at construction; the queue and the worker only ever read them.
#[derive(Debug)]
pub struct Packet {
    payload: Vec<u8>,
    peer: SocketAddr,
    recv_time: Instant,
}

impl Packet {
    /// Build a packet stamped with the current monotonic time.
    pub fn new(payload: Vec<u8>, peer: SocketAddr) -> Self {
        Self {
            payload,
            peer,
            recv_time: Instant::now(),
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Source address the datagram arrived from.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Monotonic timestamp taken when the datagram was read off the socket.
    pub fn recv_time(&self) -> Instant {
        self.recv_time
    }

    /// Time elapsed since the datagram was received.
    pub fn age(&self) -> Duration {
        self.recv_time.elapsed()
    }

    /// Consume the packet, yielding its payload.
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }
}

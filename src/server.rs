//! The UDP server: socket, listener threads, and pool supervisor.
//!
//! Listener threads read datagrams, stamp them, and route each one through
//! the classifier into exactly one request group. A supervisor thread
//! ticks every group's pool at a fixed cadence so the pools track load
//! without any listener involvement. Lifecycle is open/close; after
//! `close()` returns, the server is back in its pre-open state and can be
//! opened again.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{RecvTimeoutError, Sender};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::group::RequestGroup;
use crate::metrics::{GroupMetrics, GroupMetricsSnapshot, ServerMetrics, ServerMetricsSnapshot};
use crate::packet::Packet;
use crate::pool::worker::ProcessFn;

/// Largest payload a single UDP datagram can carry, rounded up.
const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// User callback mapping each packet to a group index. Out-of-range
/// results drop the packet and bump `packets_invalid_group`.
pub type ClassifyFn = Arc<dyn Fn(&Packet) -> usize + Send + Sync + 'static>;

struct Running {
    socket: Arc<UdpSocket>,
    groups: Arc<Vec<RequestGroup>>,
    listeners: Vec<thread::JoinHandle<()>>,
    supervisor: Option<thread::JoinHandle<()>>,
    supervisor_stop: Sender<()>,
    shutdown: Arc<AtomicBool>,
}

/// Adaptive UDP server.
///
/// Library-shaped: construct with a [`ServerConfig`], attach a classifier
/// and a processor, then `open()`. The default classifier routes
/// everything to group 0; the default processor drops packets.
pub struct UdpServer {
    config: ServerConfig,
    classify: ClassifyFn,
    process: ProcessFn,
    metrics: Arc<ServerMetrics>,
    group_metrics: Vec<Arc<GroupMetrics>>,
    running: Option<Running>,
}

impl UdpServer {
    pub fn new(config: ServerConfig) -> Self {
        let group_metrics = config
            .groups
            .iter()
            .map(|_| Arc::new(GroupMetrics::default()))
            .collect();
        Self {
            config,
            classify: Arc::new(|_| 0),
            process: Arc::new(|worker, packet| {
                log::debug!(
                    "no processor registered; dropping {} bytes from {} (group {})",
                    packet.len(),
                    packet.peer(),
                    worker.group_index()
                );
            }),
            metrics: Arc::new(ServerMetrics::default()),
            group_metrics,
            running: None,
        }
    }

    /// Replace the classifier. Must be called before `open()` to take
    /// effect for that run.
    pub fn with_classifier<F>(mut self, classify: F) -> Self
    where
        F: Fn(&Packet) -> usize + Send + Sync + 'static,
    {
        self.classify = Arc::new(classify);
        self
    }

    /// Replace the per-packet processor. Must be called before `open()`.
    pub fn with_processor<F>(mut self, process: F) -> Self
    where
        F: Fn(&crate::pool::worker::Worker, Packet) + Send + Sync + 'static,
    {
        self.process = Arc::new(process);
        self
    }

    pub fn is_open(&self) -> bool {
        self.running.is_some()
    }

    /// Bound address while open; useful with `local_port = 0`.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running
            .as_ref()
            .and_then(|r| r.socket.local_addr().ok())
    }

    /// Bind the socket, pre-grow every pool to its floor, and start the
    /// listener and supervisor threads.
    ///
    /// Bind and spawn failures are the only errors surfaced to the caller;
    /// everything after a successful `open()` is absorbed and counted.
    pub fn open(&mut self) -> Result<(), ServerError> {
        if self.running.is_some() {
            return Err(ServerError::AlreadyOpen);
        }
        self.config.validate()?;

        let port = self.config.local_port;
        let socket = UdpSocket::bind(("0.0.0.0", port))
            .map_err(|source| ServerError::Bind { port, source })?;
        socket
            .set_read_timeout(Some(Duration::from_millis(self.config.recv_timeout_ms)))
            .map_err(ServerError::Socket)?;
        let local_addr = socket.local_addr().map_err(ServerError::Socket)?;
        let socket = Arc::new(socket);
        let shutdown = Arc::new(AtomicBool::new(false));

        let groups: Vec<RequestGroup> = self
            .config
            .groups
            .iter()
            .enumerate()
            .map(|(i, cfg)| {
                RequestGroup::new(i, cfg, self.group_metrics[i].clone(), self.process.clone())
            })
            .collect();
        for (group, cfg) in groups.iter().zip(&self.config.groups) {
            group.pool().grow(cfg.min_threads);
        }
        let groups = Arc::new(groups);

        let mut listeners = Vec::with_capacity(self.config.listener_threads);
        for n in 0..self.config.listener_threads {
            let name = format!("udp-listener-{n}");
            let spawn = thread::Builder::new().name(name.clone()).spawn({
                let socket = socket.clone();
                let groups = groups.clone();
                let classify = self.classify.clone();
                let metrics = self.metrics.clone();
                let shutdown = shutdown.clone();
                move || listener_loop(&socket, &groups, classify, &metrics, &shutdown)
            });
            match spawn {
                Ok(handle) => listeners.push(handle),
                Err(source) => {
                    abort_open(&shutdown, listeners, &groups);
                    return Err(ServerError::Spawn { name, source });
                }
            }
        }

        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let tick = Duration::from_millis(self.config.tick_interval_ms);
        let supervisor = thread::Builder::new().name("pool-supervisor".into()).spawn({
            let groups = groups.clone();
            move || {
                log::debug!("pool supervisor started (interval {tick:?})");
                loop {
                    match stop_rx.recv_timeout(tick) {
                        Err(RecvTimeoutError::Timeout) => {
                            for group in groups.iter() {
                                group.pool().tick();
                            }
                        }
                        _ => break,
                    }
                }
                log::debug!("pool supervisor exited");
            }
        });
        let supervisor = match supervisor {
            Ok(handle) => handle,
            Err(source) => {
                abort_open(&shutdown, listeners, &groups);
                return Err(ServerError::Spawn {
                    name: "pool-supervisor".into(),
                    source,
                });
            }
        };

        log::info!(
            "UDP server listening on {local_addr} ({} listener(s), {} group(s))",
            self.config.listener_threads,
            groups.len()
        );
        self.running = Some(Running {
            socket,
            groups,
            listeners,
            supervisor: Some(supervisor),
            supervisor_stop: stop_tx,
            shutdown,
        });
        Ok(())
    }

    /// Stop listeners and the supervisor, drain every pool, and drop all
    /// queued packets. Safe to call when closed; idempotent.
    pub fn close(&mut self) {
        let Some(run) = self.running.take() else {
            return;
        };
        if let Ok(addr) = run.socket.local_addr() {
            log::info!("closing UDP server on {addr}");
        }
        run.shutdown.store(true, Ordering::Release);
        let _ = run.supervisor_stop.send(());
        for handle in run.listeners {
            let _ = handle.join();
        }
        if let Some(handle) = run.supervisor {
            let _ = handle.join();
        }
        // Signal every pool before waiting on any of them so the drains
        // overlap.
        for group in run.groups.iter() {
            group.pool().terminate_all();
        }
        for group in run.groups.iter() {
            group.pool().wait_for_all();
            group.queue().clear();
        }
        log::info!("UDP server closed");
    }

    /// Synchronous pool-adjustment fan-out, for embedders that schedule
    /// adjustment themselves on top of (or instead of) the supervisor.
    pub fn adjust_worker_count(&self) {
        if let Some(run) = &self.running {
            for group in run.groups.iter() {
                group.pool().tick();
            }
        }
    }

    /// Retune one group's pool bounds. Applies to the running pool on its
    /// next tick and to every subsequent `open()`.
    pub fn set_thread_bounds(
        &mut self,
        group_index: usize,
        min_threads: usize,
        max_threads: usize,
    ) -> Result<(), ServerError> {
        let count = self.config.groups.len();
        if group_index >= count {
            return Err(ServerError::GroupOutOfRange {
                index: group_index,
                count,
            });
        }
        if max_threads < min_threads {
            return Err(ServerError::InvalidConfig(format!(
                "max_threads ({max_threads}) below min_threads ({min_threads})"
            )));
        }
        self.config.groups[group_index].min_threads = min_threads;
        self.config.groups[group_index].max_threads = max_threads;
        if let Some(run) = &self.running {
            run.groups[group_index]
                .pool()
                .set_thread_bounds(min_threads, max_threads);
        }
        Ok(())
    }

    pub fn metrics(&self) -> ServerMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Counters for one group. Available whether or not the server is
    /// open; counters accumulate across open/close cycles.
    pub fn group_metrics(&self, group_index: usize) -> Option<GroupMetricsSnapshot> {
        self.group_metrics.get(group_index).map(|m| m.snapshot())
    }

    pub fn group_queue_len(&self, group_index: usize) -> Option<usize> {
        self.running
            .as_ref()
            .and_then(|r| r.groups.get(group_index))
            .map(|g| g.queue_len())
    }

    pub fn group_thread_count(&self, group_index: usize) -> Option<usize> {
        self.running
            .as_ref()
            .and_then(|r| r.groups.get(group_index))
            .map(|g| g.pool().thread_count())
    }
}

impl Drop for UdpServer {
    fn drop(&mut self) {
        self.close();
    }
}

fn abort_open(
    shutdown: &AtomicBool,
    listeners: Vec<thread::JoinHandle<()>>,
    groups: &[RequestGroup],
) {
    shutdown.store(true, Ordering::Release);
    for handle in listeners {
        let _ = handle.join();
    }
    for group in groups {
        group.pool().terminate_all();
    }
    for group in groups {
        group.pool().wait_for_all();
    }
}

fn listener_loop(
    socket: &UdpSocket,
    groups: &[RequestGroup],
    classify: ClassifyFn,
    metrics: &ServerMetrics,
    shutdown: &AtomicBool,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    while !shutdown.load(Ordering::Acquire) {
        match socket.recv_from(&mut buf) {
            Ok((len, peer)) => {
                metrics.packets_received.fetch_add(1, Ordering::Release);
                let packet = Packet::new(buf[..len].to_vec(), peer);
                let index = classify(&packet);
                match groups.get(index) {
                    Some(group) => group.dispatch(packet),
                    None => {
                        metrics
                            .packets_invalid_group
                            .fetch_add(1, Ordering::Release);
                        log::warn!(
                            "classifier returned group {index} with {} configured, \
                             dropping packet from {peer}",
                            groups.len()
                        );
                    }
                }
            }
            // Read timeout: come back around and re-check shutdown.
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
            Err(e) => {
                if shutdown.load(Ordering::Acquire) {
                    break;
                }
                log::error!("listener recv error: {e}; continuing");
                thread::sleep(Duration::from_millis(10));
            }
        }
    }
    log::debug!("listener exited");
}

//! End-to-end pipeline scenarios over loopback sockets.
//!
//! Timing-derived assertions use ranges: loopback delivery is reliable in
//! practice, but scheduling jitter is real, so the scenarios are sized
//! with generous margins.

use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use squall::{GroupConfig, OverflowPolicy, ServerConfig, UdpServer};

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn client() -> UdpSocket {
    let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
    sock.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    sock
}

fn target(server: &UdpServer) -> SocketAddr {
    let port = server.local_addr().unwrap().port();
    format!("127.0.0.1:{port}").parse().unwrap()
}

fn group(min: usize, max: usize) -> GroupConfig {
    GroupConfig {
        queue_capacity: 500,
        effective_wait_secs: 30,
        overflow_policy: OverflowPolicy::DropOldest,
        min_threads: min,
        max_threads: max,
        stall_timeout_secs: 10,
        term_deadline_secs: 180,
    }
}

fn config(groups: Vec<GroupConfig>) -> ServerConfig {
    ServerConfig {
        local_port: 0,
        listener_threads: 1,
        groups,
        tick_interval_ms: 200,
        recv_timeout_ms: 50,
    }
}

#[test]
fn test_echo_single_group() {
    init_logs();
    let echo = Arc::new(UdpSocket::bind("127.0.0.1:0").unwrap());
    let mut server = UdpServer::new(config(vec![group(2, 4)])).with_processor({
        let echo = echo.clone();
        move |_, packet| {
            let _ = echo.send_to(packet.payload(), packet.peer());
        }
    });
    server.open().unwrap();
    let addr = target(&server);

    let sock = client();
    const COUNT: usize = 200;
    for i in 0..COUNT {
        let mut payload = [0u8; 16];
        payload[0] = (i % 256) as u8;
        payload[1] = (i / 256) as u8;
        sock.send_to(&payload, addr).unwrap();
        if i % 20 == 19 {
            thread::sleep(Duration::from_millis(1));
        }
    }

    let mut received = 0;
    let mut buf = [0u8; 64];
    while received < COUNT {
        match sock.recv_from(&mut buf) {
            Ok((len, _)) => {
                assert_eq!(len, 16);
                received += 1;
            }
            Err(_) => break,
        }
    }
    assert_eq!(received, COUNT);

    let threads = server.group_thread_count(0).unwrap();
    assert!((2..=4).contains(&threads), "thread count {threads}");
    let m = server.group_metrics(0).unwrap();
    assert_eq!(m.packets_evicted, 0);
    assert!(m.packets_processed >= COUNT as u64);
    assert_eq!(server.metrics().packets_received, COUNT as u64);
    server.close();
    assert_eq!(server.group_thread_count(0), None);
}

#[test]
fn test_overload_evicts_oldest() {
    init_logs();
    let mut server = UdpServer::new(config(vec![GroupConfig {
        queue_capacity: 8,
        min_threads: 1,
        max_threads: 1,
        ..group(1, 1)
    }]))
    .with_processor(|_, _| {
        thread::sleep(Duration::from_millis(150));
    });
    server.open().unwrap();
    let addr = target(&server);

    let sock = client();
    for i in 0..40u8 {
        sock.send_to(&[i], addr).unwrap();
    }
    thread::sleep(Duration::from_millis(600));

    let queued = server.group_queue_len(0).unwrap();
    assert!(queued <= 8, "queue holds {queued}, capacity 8");
    let m = server.group_metrics(0).unwrap();
    assert!(m.packets_evicted >= 20, "only {} evictions", m.packets_evicted);
    server.close();
}

#[test]
fn test_stall_detection_and_replacement() {
    init_logs();
    let processed = Arc::new(AtomicU64::new(0));
    let mut server = UdpServer::new(config(vec![GroupConfig {
        min_threads: 2,
        max_threads: 4,
        stall_timeout_secs: 1,
        term_deadline_secs: 2,
        ..group(2, 4)
    }]))
    .with_processor({
        let processed = processed.clone();
        move |_, packet| {
            if packet.payload() == b"hang" {
                thread::sleep(Duration::from_secs(8));
            } else {
                processed.fetch_add(1, Ordering::SeqCst);
            }
        }
    });
    server.open().unwrap();
    let addr = target(&server);

    let sock = client();
    sock.send_to(b"hang", addr).unwrap();
    sock.send_to(b"hang", addr).unwrap();
    thread::sleep(Duration::from_millis(300));
    for i in 0..6u8 {
        sock.send_to(&[i], addr).unwrap();
    }
    thread::sleep(Duration::from_secs(5));

    let m = server.group_metrics(0).unwrap();
    assert_eq!(m.stalls_detected, 2);
    assert_eq!(m.zombie_workers, 2);
    assert_eq!(processed.load(Ordering::SeqCst), 6);
    let threads = server.group_thread_count(0).unwrap();
    assert!((2..=4).contains(&threads), "thread count {threads}");
    server.close();
}

#[test]
fn test_graceful_close_mid_flight() {
    init_logs();
    let echo = Arc::new(UdpSocket::bind("127.0.0.1:0").unwrap());
    let mut server = UdpServer::new(config(vec![group(2, 4)])).with_processor({
        let echo = echo.clone();
        move |_, packet| {
            let _ = echo.send_to(packet.payload(), packet.peer());
        }
    });
    server.open().unwrap();
    let addr = target(&server);

    let sender = thread::spawn(move || {
        let sock = client();
        for i in 0..2000u16 {
            let _ = sock.send_to(&i.to_be_bytes(), addr);
            if i % 100 == 99 {
                thread::sleep(Duration::from_millis(1));
            }
        }
    });
    thread::sleep(Duration::from_millis(100));

    let start = Instant::now();
    server.close();
    let elapsed = start.elapsed();
    assert!(elapsed < Duration::from_secs(4), "close took {elapsed:?}");
    assert!(!server.is_open());
    sender.join().unwrap();
}

#[test]
fn test_multi_group_routing_preserves_group_fifo() {
    init_logs();
    let records: Arc<Mutex<Vec<(usize, u16, u8)>>> = Arc::new(Mutex::new(Vec::new()));
    let groups: Vec<GroupConfig> = (0..4).map(|_| group(1, 1)).collect();
    let mut server = UdpServer::new(config(groups))
        .with_classifier(|packet| packet.peer().port() as usize % 4)
        .with_processor({
            let records = records.clone();
            move |worker, packet| {
                records
                    .lock()
                    .push((worker.group_index(), packet.peer().port(), packet.payload()[0]));
            }
        });
    server.open().unwrap();
    let addr = target(&server);

    let sockets: Vec<UdpSocket> = (0..4).map(|_| client()).collect();
    for sock in &sockets {
        for seq in 0..10u8 {
            sock.send_to(&[seq], addr).unwrap();
        }
    }
    thread::sleep(Duration::from_secs(1));

    let records = records.lock();
    assert_eq!(records.len(), 40);
    for &(group_index, port, _) in records.iter() {
        assert_eq!(group_index, port as usize % 4);
    }
    // One worker per group: intra-group delivery order is send order.
    for sock in &sockets {
        let port = sock.local_addr().unwrap().port();
        let seqs: Vec<u8> = records
            .iter()
            .filter(|&&(_, p, _)| p == port)
            .map(|&(_, _, s)| s)
            .collect();
        assert_eq!(seqs, (0..10).collect::<Vec<u8>>());
    }
    drop(records);
    server.close();
}

#[test]
fn test_age_expiry_with_paused_pool() {
    init_logs();
    let mut server = UdpServer::new(config(vec![GroupConfig {
        effective_wait_secs: 1,
        min_threads: 0,
        max_threads: 0,
        ..group(0, 0)
    }]));
    server.open().unwrap();
    let addr = target(&server);

    let sock = client();
    for i in 0..10u8 {
        sock.send_to(&[i], addr).unwrap();
    }
    thread::sleep(Duration::from_secs(2));
    assert_eq!(server.group_queue_len(0), Some(10));
    assert_eq!(server.group_thread_count(0), Some(0));

    server.set_thread_bounds(0, 4, 4).unwrap();
    thread::sleep(Duration::from_secs(1));

    let m = server.group_metrics(0).unwrap();
    assert_eq!(m.packets_processed, 0);
    assert_eq!(m.packets_expired, 10);
    assert_eq!(server.group_thread_count(0), Some(4));
    server.close();
}

#[test]
fn test_invalid_classifier_index_drops_and_counts() {
    init_logs();
    let mut server = UdpServer::new(config(vec![group(1, 1)])).with_classifier(|_| 99);
    server.open().unwrap();
    let addr = target(&server);

    let sock = client();
    for i in 0..3u8 {
        sock.send_to(&[i], addr).unwrap();
    }
    thread::sleep(Duration::from_millis(500));

    let sm = server.metrics();
    assert_eq!(sm.packets_received, 3);
    assert_eq!(sm.packets_invalid_group, 3);
    assert_eq!(server.group_metrics(0).unwrap().packets_enqueued, 0);
    server.close();
}

#[test]
fn test_processing_panic_is_contained() {
    init_logs();
    let echo = Arc::new(UdpSocket::bind("127.0.0.1:0").unwrap());
    let mut server = UdpServer::new(config(vec![group(1, 1)])).with_processor({
        let echo = echo.clone();
        move |_, packet| {
            if packet.payload() == b"boom" {
                panic!("bad payload");
            }
            let _ = echo.send_to(packet.payload(), packet.peer());
        }
    });
    server.open().unwrap();
    let addr = target(&server);

    let sock = client();
    sock.send_to(b"boom", addr).unwrap();
    sock.send_to(b"fine", addr).unwrap();

    let mut buf = [0u8; 16];
    let (len, _) = sock.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..len], b"fine");

    let m = server.group_metrics(0).unwrap();
    assert_eq!(m.process_errors, 1);
    assert_eq!(m.packets_processed, 1);
    assert_eq!(server.group_thread_count(0), Some(1));
    server.close();
}

//! End-to-end echo scenarios over the reactor backend, which works on
//! every platform the suite runs on.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::time::Duration;

use tcpx_core::{BackendKind, EngineConfig, EventHandler};
use tcpx_transport::Transport;

#[derive(Debug, PartialEq)]
enum Event {
    Connected(u64),
    ConnectionFailed(u64),
    Data(Vec<u8>),
    SendComplete(u64),
    SendFailed(u64),
    Closed,
}

struct Recorder(Sender<Event>);

impl EventHandler for Recorder {
    fn on_connected(&mut self, token: u64) {
        let _ = self.0.send(Event::Connected(token));
    }
    fn on_connection_failed(&mut self, token: u64, _cause: &str) {
        let _ = self.0.send(Event::ConnectionFailed(token));
    }
    fn on_data_received(&mut self, data: &[u8]) {
        let _ = self.0.send(Event::Data(data.to_vec()));
    }
    fn on_send_complete(&mut self, token: u64) {
        let _ = self.0.send(Event::SendComplete(token));
    }
    fn on_send_failed(&mut self, token: u64, _cause: &str) {
        let _ = self.0.send(Event::SendFailed(token));
    }
    fn on_closed(&mut self) {
        let _ = self.0.send(Event::Closed);
    }
}

fn recorder() -> (Recorder, Receiver<Event>) {
    let (tx, rx) = channel();
    (Recorder(tx), rx)
}

fn next_event(rx: &Receiver<Event>) -> Event {
    rx.recv_timeout(Duration::from_secs(5)).expect("event timed out")
}

fn test_config() -> EngineConfig {
    EngineConfig {
        backend: BackendKind::Reactor,
        buffer_count: 16,
        buffer_size: 1024,
        ..EngineConfig::default()
    }
}

/// One-connection echo server on an ephemeral port.
fn spawn_echo_server() -> (SocketAddrV4, std::thread::JoinHandle<()>) {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let addr = match listener.local_addr().unwrap() {
        SocketAddr::V4(a) => a,
        _ => unreachable!(),
    };
    let handle = std::thread::spawn(move || {
        let (mut conn, _) = listener.accept().unwrap();
        let mut buf = [0u8; 4096];
        loop {
            match conn.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if conn.write_all(&buf[..n]).is_err() {
                        break;
                    }
                }
            }
        }
    });
    (addr, handle)
}

#[test]
fn echo_ping_pong() {
    let (addr, server) = spawn_echo_server();
    let (handler, rx) = recorder();

    let transport = Transport::new(test_config()).unwrap();
    transport.start(handler).unwrap();

    let connect_token = transport.connect(addr).unwrap();
    assert_eq!(next_event(&rx), Event::Connected(connect_token));
    assert!(transport.is_connected());
    assert!(transport.remote_address().is_some());
    assert_eq!(transport.health().active_connections, 1);

    let payload = 42u32.to_le_bytes();
    let send_token = transport.send(&payload).unwrap();
    assert_eq!(next_event(&rx), Event::SendComplete(send_token));

    // The echo comes back, possibly split; accumulate four bytes.
    let mut echoed = Vec::new();
    while echoed.len() < 4 {
        match next_event(&rx) {
            Event::Data(chunk) => echoed.extend_from_slice(&chunk),
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert_eq!(u32::from_le_bytes(echoed[..4].try_into().unwrap()), 42);

    transport.close().unwrap();
    assert_eq!(next_event(&rx), Event::Closed);
    // Second close is a no-op, and on_closed fired exactly once.
    transport.close().unwrap();
    assert!(rx.try_recv().is_err());

    let stats = transport.stats();
    assert_eq!(stats.sends, 1);
    assert!(stats.receives >= 1);
    assert_eq!(stats.bytes_sent, 4);
    assert_eq!(stats.bytes_received, 4);

    server.join().unwrap();
}

#[test]
fn tokens_match_their_completions_in_order() {
    let (addr, server) = spawn_echo_server();
    let (handler, rx) = recorder();

    let transport = Transport::new(test_config()).unwrap();
    transport.start(handler).unwrap();
    let connect_token = transport.connect(addr).unwrap();
    assert_eq!(next_event(&rx), Event::Connected(connect_token));

    let tokens: Vec<u64> = (0..8)
        .map(|i| transport.send(&[i as u8; 64]).unwrap())
        .collect();

    let mut completions = Vec::new();
    let mut bytes_back = 0usize;
    while completions.len() < tokens.len() || bytes_back < 8 * 64 {
        match next_event(&rx) {
            Event::SendComplete(t) => completions.push(t),
            Event::Data(chunk) => bytes_back += chunk.len(),
            other => panic!("unexpected event {other:?}"),
        }
    }
    // Send completions preserve submission order.
    assert_eq!(completions, tokens);

    transport.close().unwrap();
    server.join().unwrap();
}

#[test]
fn refused_connect_reports_failure_and_allows_retry() {
    // Find a dead port.
    let probe = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let dead = match probe.local_addr().unwrap() {
        SocketAddr::V4(a) => a,
        _ => unreachable!(),
    };
    drop(probe);

    let (handler, rx) = recorder();
    let transport = Transport::new(test_config()).unwrap();
    transport.start(handler).unwrap();

    let token = transport.connect(dead).unwrap();
    assert_eq!(next_event(&rx), Event::ConnectionFailed(token));
    assert!(!transport.is_connected());

    // The transport stays usable: a second connect to a live server works.
    let (addr, server) = spawn_echo_server();
    let token = transport.connect(addr).unwrap();
    assert_eq!(next_event(&rx), Event::Connected(token));

    transport.close().unwrap();
    assert_eq!(next_event(&rx), Event::Closed);
    server.join().unwrap();
}

#[test]
fn peer_close_drives_on_closed_exactly_once() {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let addr = match listener.local_addr().unwrap() {
        SocketAddr::V4(a) => a,
        _ => unreachable!(),
    };
    let server = std::thread::spawn(move || {
        let (conn, _) = listener.accept().unwrap();
        std::thread::sleep(Duration::from_millis(50));
        drop(conn);
    });

    let (handler, rx) = recorder();
    let transport = Transport::new(test_config()).unwrap();
    transport.start(handler).unwrap();
    let token = transport.connect(addr).unwrap();
    assert_eq!(next_event(&rx), Event::Connected(token));

    // EOF from the peer transitions to Closed and fires on_closed once.
    assert_eq!(next_event(&rx), Event::Closed);
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    assert!(!transport.health().healthy);

    transport.close().unwrap();
    server.join().unwrap();
}

#[test]
fn double_start_is_rejected() {
    let (handler, _rx) = recorder();
    let transport = Transport::new(test_config()).unwrap();
    transport.start(handler).unwrap();
    let (handler2, _rx2) = recorder();
    assert!(transport.start(handler2).is_err());
    transport.close().unwrap();
}

#[test]
fn close_from_handler_callback_does_not_deadlock() {
    struct CloseOnData {
        tx: Sender<Event>,
        transport: std::sync::Arc<Transport>,
    }
    impl EventHandler for CloseOnData {
        fn on_connected(&mut self, token: u64) {
            let _ = self.tx.send(Event::Connected(token));
        }
        fn on_data_received(&mut self, data: &[u8]) {
            let _ = self.tx.send(Event::Data(data.to_vec()));
            // close() on the poller thread must return immediately.
            self.transport.close().unwrap();
        }
        fn on_send_complete(&mut self, token: u64) {
            let _ = self.tx.send(Event::SendComplete(token));
        }
        fn on_closed(&mut self) {
            let _ = self.tx.send(Event::Closed);
        }
    }

    let (addr, server) = spawn_echo_server();
    let (tx, rx) = channel();
    let transport = std::sync::Arc::new(Transport::new(test_config()).unwrap());
    transport
        .start(CloseOnData { tx, transport: std::sync::Arc::clone(&transport) })
        .unwrap();

    let token = transport.connect(addr).unwrap();
    assert_eq!(next_event(&rx), Event::Connected(token));
    let send_token = transport.send(b"ping").unwrap();
    assert_eq!(next_event(&rx), Event::SendComplete(send_token));

    let mut saw_closed = false;
    for _ in 0..3 {
        match rx.recv_timeout(Duration::from_secs(5)) {
            Ok(Event::Closed) => {
                saw_closed = true;
                break;
            }
            Ok(_) => continue,
            Err(e) => panic!("missing close event: {e}"),
        }
    }
    assert!(saw_closed);

    // From outside the poller, close now waits for the exited thread.
    transport.close().unwrap();
    server.join().unwrap();
}

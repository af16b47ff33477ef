//! tcpx echo demo.
//!
//! Server: a single-threaded echo server driven directly by a backend.
//! Every accepted connection becomes a sibling backend sharing the same
//! engine, and all completions drain through one loop. On the ring
//! backend a single multishot accept serves the whole connection stream;
//! the reactor re-arms its one-shot accept per connection. With a frame
//! length argument the ring server switches to the linked recv→send SQE
//! composition: each echo turn is one submission of two linked entries,
//! sound because the frame size is fixed.
//!
//! Client: a `Transport` round trip that prints the echoed reply and the
//! stats snapshot.
//!
//! Usage:
//!     tcpx-echo server <port> [ring|reactor]
//!     tcpx-echo server <port> ring <frame-bytes>
//!     tcpx-echo client <host:port> <message> [ring|reactor]
//!
//! Test with:
//!     tcpx-echo server 9999 &
//!     echo "hello" | nc -q1 localhost 9999
//!     tcpx-echo client 127.0.0.1:9999 "hello"
//!
//! Set RUST_LOG=debug for the engine's view of the traffic.

use std::net::SocketAddrV4;
use std::process::ExitCode;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};

use tcpx_core::token::RECV_FLAG;
use tcpx_core::{
    BackendKind, EngineConfig, EngineError, EngineStats, EventHandler, IoBackend, StatsSnapshot,
};

const MAX_CONNS: usize = 256;
const BUF_SIZE: usize = 4096;

/// Demo token layout: accept ops carry bit 61, receive ops the engine's
/// receive flag, sends neither; the connection slot lives in the low bits.
const OP_ACCEPT: u64 = 1 << 61;
const IDX_MASK: u64 = (1 << 32) - 1;

fn accept_token() -> u64 {
    OP_ACCEPT
}

fn recv_token(idx: usize) -> u64 {
    RECV_FLAG | idx as u64
}

fn send_token(idx: usize) -> u64 {
    idx as u64
}

struct Conn<B> {
    backend: B,
    buf: Box<[u8; BUF_SIZE]>,
}

struct ConnSlab<B> {
    slots: Vec<Option<Conn<B>>>,
    free: Vec<usize>,
}

impl<B> ConnSlab<B> {
    fn new(max: usize) -> Self {
        Self {
            slots: (0..max).map(|_| None).collect(),
            free: (0..max).rev().collect(),
        }
    }

    fn insert(&mut self, conn: Conn<B>) -> Option<usize> {
        let idx = self.free.pop()?;
        self.slots[idx] = Some(conn);
        Some(idx)
    }

    fn remove(&mut self, idx: usize) {
        if self.slots[idx].take().is_some() {
            self.free.push(idx);
        }
    }
}

fn backend_kind(arg: Option<&str>) -> Result<BackendKind, String> {
    match arg {
        None => Ok(default_kind()),
        Some("ring") => Ok(BackendKind::Uring),
        Some("reactor") => Ok(BackendKind::Reactor),
        Some(other) => Err(format!("unknown backend '{other}' (use ring or reactor)")),
    }
}

fn default_kind() -> BackendKind {
    if cfg!(target_os = "linux") {
        BackendKind::Uring
    } else {
        BackendKind::Reactor
    }
}

/// Byte-stream echo server: one recv and one send in flight per
/// connection, each completion re-arming the next operation.
fn run_server(port: u16, kind: BackendKind) -> Result<(), String> {
    let cfg = EngineConfig { backend: kind, ..EngineConfig::default() };
    let stats = Arc::new(EngineStats::new());
    let mut listener = tcpx_backend::create_backend(&cfg, Arc::clone(&stats))
        .map_err(|e| format!("backend setup failed: {e}"))?;

    let addr = SocketAddrV4::new("0.0.0.0".parse().unwrap(), port);
    listener.bind(addr).map_err(|e| format!("bind {addr} failed: {e}"))?;

    // One multishot arm where the backend supports it; otherwise one-shot
    // accepts re-armed per connection.
    let multishot = match listener.accept_multishot(accept_token()) {
        Ok(()) => true,
        Err(EngineError::Unsupported(_)) => {
            listener
                .accept(accept_token())
                .map_err(|e| format!("accept arm failed: {e}"))?;
            false
        }
        Err(e) => return Err(format!("accept arm failed: {e}")),
    };
    info!("echo server on {addr} ({kind:?} backend, multishot accept: {multishot})");

    let mut conns: ConnSlab<Box<dyn IoBackend>> = ConnSlab::new(MAX_CONNS);
    let mut completions = Vec::with_capacity(256);

    loop {
        if let Err(e) = listener.submit() {
            warn!("submit: {e}");
        }
        completions.clear();
        if let Err(e) = listener.wait(Duration::from_millis(10), &mut |c| completions.push(c)) {
            warn!("wait: {e}");
        }
        // Ring siblings share the listener's completion queue; reactor
        // siblings each own a selector and are drained here.
        for slot in conns.slots.iter_mut() {
            if let Some(conn) = slot.as_mut() {
                if let Err(e) = conn.backend.poll(&mut |c| completions.push(c)) {
                    warn!("sibling poll: {e}");
                }
            }
        }

        for i in 0..completions.len() {
            let c = completions[i];
            if c.token & OP_ACCEPT != 0 {
                if c.result >= 0 {
                    match listener.create_from_accepted(c.result) {
                        Ok(backend) => {
                            let conn = Conn { backend, buf: Box::new([0u8; BUF_SIZE]) };
                            match conns.insert(conn) {
                                Some(idx) => {
                                    info!("connection {idx} open");
                                    post_recv(&mut conns, idx);
                                }
                                None => warn!("connection table full, dropping socket"),
                            }
                        }
                        Err(e) => warn!("adopting accepted socket failed: {e}"),
                    }
                } else {
                    warn!("accept failed: {}", tcpx_core::errno::describe(c.result));
                }
                // A multishot stream stays armed while MORE is set.
                if !multishot || !c.more() {
                    let rearm = if multishot {
                        listener.accept_multishot(accept_token())
                    } else {
                        listener.accept(accept_token())
                    };
                    if let Err(e) = rearm {
                        warn!("re-arming accept failed: {e}");
                    }
                }
            } else if c.token & RECV_FLAG != 0 {
                let idx = (c.token & IDX_MASK) as usize;
                if tcpx_core::errno::is_connection_closed(c.result) || c.result < 0 {
                    if c.result < 0 && !tcpx_core::errno::is_connection_closed(c.result) {
                        warn!("recv on {idx}: {}", tcpx_core::errno::describe(c.result));
                    }
                    close_conn(&mut conns, idx);
                } else {
                    echo_back(&mut conns, idx, c.result as usize);
                }
            } else {
                let idx = (c.token & IDX_MASK) as usize;
                if c.result < 0 {
                    warn!("send on {idx}: {}", tcpx_core::errno::describe(c.result));
                    close_conn(&mut conns, idx);
                } else {
                    post_recv(&mut conns, idx);
                }
            }
        }
    }
}

fn post_recv(conns: &mut ConnSlab<Box<dyn IoBackend>>, idx: usize) {
    let Some(conn) = conns.slots[idx].as_mut() else {
        return;
    };
    let ptr = conn.buf.as_mut_ptr();
    // Safety: the buffer lives in the conn slot until the connection is
    // torn down, which only happens on a completion for this token.
    let res = unsafe { conn.backend.recv_raw(ptr, BUF_SIZE, recv_token(idx)) };
    if let Err(e) = res {
        warn!("recv post on {idx}: {e}");
        close_conn(conns, idx);
    }
}

fn echo_back(conns: &mut ConnSlab<Box<dyn IoBackend>>, idx: usize, len: usize) {
    let Some(conn) = conns.slots[idx].as_mut() else {
        return;
    };
    let ptr = conn.buf.as_ptr();
    // Safety: same lifetime argument as post_recv.
    let res = unsafe { conn.backend.send_raw(ptr, len, send_token(idx)) };
    if let Err(e) = res {
        warn!("send post on {idx}: {e}");
        close_conn(conns, idx);
    }
}

fn close_conn(conns: &mut ConnSlab<Box<dyn IoBackend>>, idx: usize) {
    if let Some(conn) = conns.slots[idx].as_mut() {
        let _ = conn.backend.close();
        conns.remove(idx);
        info!("connection {idx} closed");
    }
}

/// Fixed-frame echo server on the ring backend: one multishot accept for
/// the listener, and one linked recv→send submission per echo turn.
#[cfg(target_os = "linux")]
fn run_linked_server(port: u16, frame: u32) -> Result<(), String> {
    use tcpx_backend::RingBackend;
    use tcpx_core::buffer::UNREGISTERED;
    use tcpx_core::Buffer;

    if frame == 0 || frame as usize > BUF_SIZE {
        return Err(format!("frame must be between 1 and {BUF_SIZE} bytes"));
    }
    let cfg = EngineConfig::default();
    let stats = Arc::new(EngineStats::new());
    let mut listener =
        RingBackend::new(&cfg, stats).map_err(|e| format!("ring setup failed: {e}"))?;

    let addr = SocketAddrV4::new("0.0.0.0".parse().unwrap(), port);
    listener.bind(addr).map_err(|e| format!("bind {addr} failed: {e}"))?;
    listener
        .accept_multishot(accept_token())
        .map_err(|e| format!("accept arm failed: {e}"))?;
    info!("fixed-frame echo server on {addr} ({frame}-byte frames, linked SQEs)");

    fn arm_echo(conns: &mut ConnSlab<RingBackend>, idx: usize, frame: u32) {
        let Some(conn) = conns.slots[idx].as_mut() else {
            return;
        };
        let mut buf = Buffer::new(conn.buf.as_mut_ptr(), BUF_SIZE as u32, idx as u32, UNREGISTERED);
        let res = conn
            .backend
            .push_linked_echo(&mut buf, frame, recv_token(idx), send_token(idx), false);
        if let Err(e) = res {
            warn!("echo arm on {idx}: {e}");
            close_linked(conns, idx);
        }
    }

    fn close_linked(conns: &mut ConnSlab<RingBackend>, idx: usize) {
        if let Some(conn) = conns.slots[idx].as_mut() {
            let _ = conn.backend.close();
            conns.remove(idx);
            info!("connection {idx} closed");
        }
    }

    let mut conns: ConnSlab<RingBackend> = ConnSlab::new(MAX_CONNS);
    let mut completions = Vec::with_capacity(256);

    loop {
        if let Err(e) = listener.submit() {
            warn!("submit: {e}");
        }
        completions.clear();
        // Siblings share the listener's ring, so one drain covers them.
        if let Err(e) = listener.wait(Duration::from_millis(10), &mut |c| completions.push(c)) {
            warn!("wait: {e}");
        }

        for i in 0..completions.len() {
            let c = completions[i];
            if c.token & OP_ACCEPT != 0 {
                if c.result >= 0 {
                    match listener.sibling_from_accepted(c.result) {
                        Ok(backend) => {
                            let conn = Conn { backend, buf: Box::new([0u8; BUF_SIZE]) };
                            match conns.insert(conn) {
                                Some(idx) => {
                                    info!("connection {idx} open");
                                    arm_echo(&mut conns, idx, frame);
                                }
                                None => warn!("connection table full, dropping socket"),
                            }
                        }
                        Err(e) => warn!("adopting accepted socket failed: {e}"),
                    }
                } else {
                    warn!("accept failed: {}", tcpx_core::errno::describe(c.result));
                }
                if !c.more() {
                    if let Err(e) = listener.accept_multishot(accept_token()) {
                        warn!("re-arming accept failed: {e}");
                    }
                }
            } else if c.token & RECV_FLAG != 0 {
                // The linked send is already in flight; only failures need
                // handling here.
                let idx = (c.token & IDX_MASK) as usize;
                if tcpx_core::errno::is_connection_closed(c.result) || c.result < 0 {
                    close_linked(&mut conns, idx);
                }
            } else {
                let idx = (c.token & IDX_MASK) as usize;
                if c.result < 0 {
                    warn!("send on {idx}: {}", tcpx_core::errno::describe(c.result));
                    close_linked(&mut conns, idx);
                } else {
                    // Frame echoed; arm the next linked pair.
                    arm_echo(&mut conns, idx, frame);
                }
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn run_linked_server(_port: u16, _frame: u32) -> Result<(), String> {
    Err("fixed-frame mode requires the ring backend on Linux".into())
}

struct ClientHandler {
    tx: mpsc::Sender<ClientEvent>,
}

enum ClientEvent {
    Connected,
    Failed(String),
    Reply(Vec<u8>),
    Sent,
    Closed,
}

impl EventHandler for ClientHandler {
    fn on_connected(&mut self, _token: u64) {
        let _ = self.tx.send(ClientEvent::Connected);
    }
    fn on_connection_failed(&mut self, _token: u64, cause: &str) {
        let _ = self.tx.send(ClientEvent::Failed(cause.to_string()));
    }
    fn on_data_received(&mut self, data: &[u8]) {
        let _ = self.tx.send(ClientEvent::Reply(data.to_vec()));
    }
    fn on_send_complete(&mut self, _token: u64) {
        let _ = self.tx.send(ClientEvent::Sent);
    }
    fn on_send_failed(&mut self, _token: u64, cause: &str) {
        let _ = self.tx.send(ClientEvent::Failed(cause.to_string()));
    }
    fn on_closed(&mut self) {
        let _ = self.tx.send(ClientEvent::Closed);
    }
}

fn run_client(addr: SocketAddrV4, message: &str, kind: BackendKind) -> Result<(), String> {
    let cfg = EngineConfig { backend: kind, ..EngineConfig::default() };
    let transport = tcpx_transport::Transport::new(cfg).map_err(|e| e.to_string())?;
    let (tx, rx) = mpsc::channel();
    transport.start(ClientHandler { tx }).map_err(|e| e.to_string())?;

    transport.connect(addr).map_err(|e| e.to_string())?;
    match rx.recv_timeout(Duration::from_secs(5)) {
        Ok(ClientEvent::Connected) => {}
        Ok(ClientEvent::Failed(cause)) => return Err(format!("connect failed: {cause}")),
        other => return Err(format!("unexpected startup event ({})", kind_of(&other))),
    }

    transport.send(message.as_bytes()).map_err(|e| e.to_string())?;

    let mut reply = Vec::new();
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while reply.len() < message.len() && std::time::Instant::now() < deadline {
        match rx.recv_timeout(Duration::from_millis(500)) {
            Ok(ClientEvent::Reply(chunk)) => reply.extend_from_slice(&chunk),
            Ok(ClientEvent::Sent) => {}
            Ok(ClientEvent::Failed(cause)) => return Err(format!("send failed: {cause}")),
            Ok(ClientEvent::Closed) => break,
            Ok(ClientEvent::Connected) | Err(_) => {}
        }
    }
    println!("reply: {}", String::from_utf8_lossy(&reply));

    transport.close().map_err(|e| e.to_string())?;
    print_stats(&transport.stats());
    Ok(())
}

fn kind_of(e: &Result<ClientEvent, mpsc::RecvTimeoutError>) -> &'static str {
    match e {
        Ok(ClientEvent::Connected) => "connected",
        Ok(ClientEvent::Failed(_)) => "failed",
        Ok(ClientEvent::Reply(_)) => "reply",
        Ok(ClientEvent::Sent) => "sent",
        Ok(ClientEvent::Closed) => "closed",
        Err(_) => "timeout",
    }
}

fn print_stats(s: &StatsSnapshot) {
    println!(
        "stats: sends={} receives={} bytes_out={} bytes_in={} batches={} syscalls={} \
         avg_batch={:.2} syscall_reduction={:.2}",
        s.sends,
        s.receives,
        s.bytes_sent,
        s.bytes_received,
        s.batch_submissions,
        s.total_syscalls,
        s.avg_batch_size,
        s.syscall_reduction,
    );
}

fn run_server_cmd(args: &[String]) -> Result<(), String> {
    let Some(port) = args.get(2).and_then(|p| p.parse::<u16>().ok()) else {
        return Err("server needs a port".into());
    };
    let kind = backend_kind(args.get(3).map(String::as_str))?;
    match args.get(4).map(|f| f.parse::<u32>()) {
        None => run_server(port, kind),
        Some(Ok(frame)) if kind == BackendKind::Uring => run_linked_server(port, frame),
        Some(Ok(_)) => Err("fixed-frame mode requires the ring backend".into()),
        Some(Err(_)) => Err("frame length must be a number".into()),
    }
}

fn main() -> ExitCode {
    env_logger::init();
    let args: Vec<String> = std::env::args().collect();
    let result = match args.get(1).map(String::as_str) {
        Some("server") => run_server_cmd(&args),
        Some("client") => match (
            args.get(2).and_then(|a| a.parse::<SocketAddrV4>().ok()),
            args.get(3),
        ) {
            (Some(addr), Some(msg)) => backend_kind(args.get(4).map(String::as_str))
                .and_then(|kind| run_client(addr, msg, kind)),
            _ => Err("client needs <host:port> <message>".into()),
        },
        _ => Err("usage: tcpx-echo server <port> [ring|reactor] [frame-bytes] | \
                  tcpx-echo client <host:port> <message> [ring|reactor]"
            .into()),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(msg) => {
            eprintln!("tcpx-echo: {msg}");
            ExitCode::FAILURE
        }
    }
}

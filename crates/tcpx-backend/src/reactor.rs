//! Portable readiness-based backend.
//!
//! One selector per backend instance, one socket per backend. Operations
//! that finish synchronously (a write the kernel takes whole, a same-host
//! connect) complete through a pre-allocated single-producer ring; the rest
//! register interest and finish on readiness events. Partial writes stay
//! registered and accumulate bytes across wakeups, so the completion always
//! carries the cumulative count.
//!
//! No batching, no buffer registration; completions carry zero flags.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::{SocketAddr, SocketAddrV4};
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_queue::ArrayQueue;
use log::{debug, trace, warn};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};

use tcpx_core::backend::{
    BackendKind, CompletionSink, ConnState, Features, IoBackend, RecvMode, SendMode,
};
use tcpx_core::errno::CONNECTION_CLOSED;
use tcpx_core::{Buffer, Completion, EngineError, EngineStats, Result, StatsSnapshot};

const STREAM_TOKEN: Token = Token(0);
const LISTENER_TOKEN: Token = Token(1);

/// Capacity of the immediate-completion ring (power of two).
const IMMEDIATE_RING: usize = 1024;

/// Bounded table of accepted-but-unclaimed sockets.
const ACCEPT_SLOTS: usize = 64;

const EVENTS_CAPACITY: usize = 256;

struct PendingWrite {
    token: u64,
    ptr: *const u8,
    len: usize,
    /// Bytes transferred so far, accumulated across readiness events.
    done: usize,
}

struct PendingRead {
    token: u64,
    ptr: *mut u8,
    len: usize,
}

pub struct ReactorBackend {
    poll: Poll,
    events: Events,
    /// Scratch copy of the last poll's events so handling them can borrow
    /// the rest of the backend mutably.
    scratch: Vec<(Token, bool, bool)>,
    stream: Option<TcpStream>,
    listener: Option<TcpListener>,
    state: ConnState,
    /// Operations that completed synchronously, in FIFO order.
    immediate: ArrayQueue<Completion>,
    pending_connect: Option<u64>,
    connect_deadline: Option<Instant>,
    pending_writes: VecDeque<PendingWrite>,
    pending_read: Option<PendingRead>,
    pending_accept: Option<u64>,
    accepted: Vec<Option<TcpStream>>,
    current_interest: Option<Interest>,
    connection_timeout: Duration,
    stats: Arc<EngineStats>,
    closed: bool,
}

impl ReactorBackend {
    pub fn new(connection_timeout: Duration, stats: Arc<EngineStats>) -> Result<Self> {
        let poll = Poll::new().map_err(selector_err)?;
        Ok(Self {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            scratch: Vec::with_capacity(EVENTS_CAPACITY),
            stream: None,
            listener: None,
            state: ConnState::Disconnected,
            immediate: ArrayQueue::new(IMMEDIATE_RING),
            pending_connect: None,
            connect_deadline: None,
            pending_writes: VecDeque::with_capacity(32),
            pending_read: None,
            pending_accept: None,
            accepted: (0..ACCEPT_SLOTS).map(|_| None).collect(),
            current_interest: None,
            connection_timeout,
            stats,
            closed: false,
        })
    }

    fn from_accepted_stream(
        stream: TcpStream,
        connection_timeout: Duration,
        stats: Arc<EngineStats>,
    ) -> Result<Self> {
        let mut backend = Self::new(connection_timeout, stats)?;
        // Accepted connections get the same latency options as outbound
        // ones.
        if let Err(e) = crate::sock::configure_client(stream.as_raw_fd()) {
            debug!("accepted socket options: {e}");
        }
        backend.stream = Some(stream);
        backend.state = ConnState::Connected;
        Ok(backend)
    }

    fn push_immediate(&self, token: u64, result: i64) {
        if self.immediate.push(Completion::new(token, result, 0)).is_err() {
            // The ring is sized to the command pipeline; overflowing it
            // means completions are not being drained.
            warn!("reactor immediate ring overflow, dropping completion for token {token:#x}");
            EngineStats::incr(&self.stats.queue_overflows);
        }
    }

    /// Interest the selector should currently watch on the stream.
    fn desired_interest(&self) -> Option<Interest> {
        let mut interest: Option<Interest> = None;
        let mut add = |i: Interest| {
            interest = Some(match interest {
                Some(cur) => cur | i,
                None => i,
            });
        };
        if self.pending_connect.is_some() || !self.pending_writes.is_empty() {
            add(Interest::WRITABLE);
        }
        if self.pending_read.is_some() {
            add(Interest::READABLE);
        }
        interest
    }

    fn update_interest(&mut self) -> Result<()> {
        let desired = self.desired_interest();
        let Some(stream) = self.stream.as_mut() else {
            return Ok(());
        };
        match (self.current_interest, desired) {
            (None, Some(want)) => {
                self.poll
                    .registry()
                    .register(stream, STREAM_TOKEN, want)
                    .map_err(selector_err)?;
            }
            (Some(cur), Some(want)) if cur != want => {
                self.poll
                    .registry()
                    .reregister(stream, STREAM_TOKEN, want)
                    .map_err(selector_err)?;
            }
            (Some(_), None) => {
                self.poll.registry().deregister(stream).map_err(selector_err)?;
            }
            _ => {}
        }
        self.current_interest = desired;
        Ok(())
    }

    /// Run the selector once and translate readiness into completions.
    fn turn(&mut self, timeout: Option<Duration>) -> Result<()> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(selector_err(e)),
        }
        EngineStats::incr(&self.stats.total_syscalls);

        self.scratch.clear();
        for event in self.events.iter() {
            self.scratch
                .push((event.token(), event.is_readable(), event.is_writable()));
        }
        let scratch = std::mem::take(&mut self.scratch);
        for (token, readable, writable) in &scratch {
            match *token {
                STREAM_TOKEN => {
                    if *writable {
                        self.stream_writable();
                    }
                    if *readable {
                        self.stream_readable();
                    }
                }
                LISTENER_TOKEN => {
                    if *readable {
                        self.listener_readable();
                    }
                }
                _ => {}
            }
        }
        self.scratch = scratch;

        if let (Some(token), Some(deadline)) = (self.pending_connect, self.connect_deadline) {
            if Instant::now() >= deadline {
                self.pending_connect = None;
                self.connect_deadline = None;
                self.stream = None;
                self.current_interest = None;
                self.push_immediate(token, -(libc::ETIMEDOUT as i64));
            }
        }

        self.update_interest()
    }

    fn stream_writable(&mut self) {
        if let Some(token) = self.pending_connect {
            match self.connect_outcome() {
                Some(Ok(())) => {
                    self.pending_connect = None;
                    self.connect_deadline = None;
                    self.push_immediate(token, 0);
                }
                Some(Err(e)) => {
                    self.pending_connect = None;
                    self.connect_deadline = None;
                    // Dropping the socket clears its registration; the
                    // transport may attempt another connect.
                    self.stream = None;
                    self.current_interest = None;
                    self.push_immediate(token, -(raw_errno(&e) as i64));
                }
                None => return, // still connecting
            }
        }
        self.drive_writes();
    }

    /// Did the in-flight connect finish? `None` while still in progress.
    fn connect_outcome(&mut self) -> Option<std::io::Result<()>> {
        let stream = self.stream.as_ref()?;
        match stream.take_error() {
            Ok(Some(e)) => return Some(Err(e)),
            Ok(None) => {}
            Err(e) => return Some(Err(e)),
        }
        match stream.peer_addr() {
            Ok(_) => Some(Ok(())),
            Err(ref e) if e.kind() == std::io::ErrorKind::NotConnected => None,
            Err(ref e) if e.raw_os_error() == Some(libc::EINPROGRESS) => None,
            Err(e) => Some(Err(e)),
        }
    }

    /// Push pending writes forward, head first, preserving submission
    /// order. Stops at the first write the kernel refuses.
    fn drive_writes(&mut self) {
        let mut finished: Vec<(u64, i64)> = Vec::new();
        if let Some(stream) = self.stream.as_mut() {
            while let Some(head) = self.pending_writes.front_mut() {
                // Safety: the submitter keeps the memory alive until the
                // completion for this token is delivered.
                let remaining = unsafe {
                    std::slice::from_raw_parts(head.ptr.add(head.done), head.len - head.done)
                };
                EngineStats::incr(&self.stats.total_syscalls);
                match stream.write(remaining) {
                    Ok(n) => {
                        head.done += n;
                        if head.done == head.len {
                            let done = self.pending_writes.pop_front().unwrap();
                            finished.push((done.token, done.done as i64));
                        }
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        let failed = self.pending_writes.pop_front().unwrap();
                        finished.push((failed.token, -(raw_errno(&e) as i64)));
                    }
                }
            }
        }
        for (token, result) in finished {
            self.push_immediate(token, result);
        }
    }

    fn stream_readable(&mut self) {
        let Some(pending) = self.pending_read.as_ref() else {
            return;
        };
        let (token, ptr, len) = (pending.token, pending.ptr, pending.len);
        let mut outcome: Option<i64> = None;
        if let Some(stream) = self.stream.as_mut() {
            // Safety: the submitter keeps the buffer alive until completion.
            let slice = unsafe { std::slice::from_raw_parts_mut(ptr, len) };
            loop {
                EngineStats::incr(&self.stats.total_syscalls);
                match stream.read(slice) {
                    Ok(0) => outcome = Some(CONNECTION_CLOSED),
                    Ok(n) => outcome = Some(n as i64),
                    // Spurious wakeup; stay armed.
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                    Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => outcome = Some(-(raw_errno(&e) as i64)),
                }
                break;
            }
        }
        if let Some(result) = outcome {
            self.pending_read = None;
            self.push_immediate(token, result);
        }
    }

    fn listener_readable(&mut self) {
        let Some(token) = self.pending_accept else {
            return;
        };
        let accepted = match self.listener.as_ref() {
            Some(listener) => {
                EngineStats::incr(&self.stats.total_syscalls);
                listener.accept()
            }
            None => return,
        };
        match accepted {
            Ok((stream, peer)) => {
                trace!("accepted connection from {peer}");
                match self.store_accepted(stream) {
                    Some(slot) => {
                        self.pending_accept = None;
                        self.push_immediate(token, slot as i64);
                    }
                    None => {
                        // Table full; leave the accept armed and let the
                        // backlog hold the connection.
                        warn!("accepted-socket table full, deferring accept");
                    }
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => {
                self.pending_accept = None;
                self.push_immediate(token, -(raw_errno(&e) as i64));
            }
        }
    }

    fn store_accepted(&mut self, stream: TcpStream) -> Option<usize> {
        let slot = self.accepted.iter().position(Option::is_none)?;
        self.accepted[slot] = Some(stream);
        Some(slot)
    }

    fn drain_immediate(&mut self, sink: &mut CompletionSink<'_>) -> usize {
        let mut n = 0;
        while let Some(c) = self.immediate.pop() {
            sink(c);
            n += 1;
        }
        n
    }
}

fn selector_err(e: std::io::Error) -> EngineError {
    EngineError::Selector(e.raw_os_error().unwrap_or(-1))
}

fn raw_errno(e: &std::io::Error) -> i32 {
    e.raw_os_error().unwrap_or(libc::EIO)
}

impl IoBackend for ReactorBackend {
    fn register_buffers(&mut self, _regions: &[(u64, usize)]) -> Result<()> {
        Err(EngineError::Unsupported(
            "reactor backend has no buffer registration",
        ))
    }

    fn connect(&mut self, addr: SocketAddrV4, token: u64) -> Result<()> {
        if self.stream.is_some() || self.pending_connect.is_some() {
            return Err(EngineError::InvalidState("connect already in flight"));
        }
        match TcpStream::connect(SocketAddr::V4(addr)) {
            Ok(stream) => {
                EngineStats::incr(&self.stats.total_syscalls);
                if let Err(e) = crate::sock::configure_client(stream.as_raw_fd()) {
                    debug!("client socket options: {e}");
                }
                self.stream = Some(stream);
                self.pending_connect = Some(token);
                self.connect_deadline = Some(Instant::now() + self.connection_timeout);
                self.update_interest()
            }
            Err(e) => {
                // Synchronous refusal still completes through the ring so
                // the caller sees one uniform completion path.
                self.push_immediate(token, -(raw_errno(&e) as i64));
                Ok(())
            }
        }
    }

    fn bind(&mut self, addr: SocketAddrV4) -> Result<()> {
        if self.listener.is_some() {
            return Err(EngineError::InvalidState("already bound"));
        }
        // Raw setup so the listener gets the server socket options
        // (SO_REUSEADDR, SO_REUSEPORT, backlog) the engine promises.
        let fd = crate::sock::listener_socket(addr)?;
        // Safety: listener_socket hands over sole ownership of a
        // non-blocking listening socket.
        let mut listener = unsafe { TcpListener::from_raw_fd(fd) };
        self.poll
            .registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)
            .map_err(selector_err)?;
        debug!("reactor listening on {addr}");
        self.listener = Some(listener);
        Ok(())
    }

    fn accept(&mut self, token: u64) -> Result<()> {
        if self.listener.is_none() {
            return Err(EngineError::InvalidState("accept without bind"));
        }
        if self.pending_accept.is_some() {
            return Err(EngineError::InvalidState("accept already in flight"));
        }
        self.pending_accept = Some(token);
        // Drain anything already queued in the backlog.
        self.listener_readable();
        Ok(())
    }

    fn accept_multishot(&mut self, _token: u64) -> Result<()> {
        // Readiness accepts are one-shot; callers re-arm per connection.
        Err(EngineError::Unsupported(
            "reactor backend has no multishot accept",
        ))
    }

    fn send_buffer(&mut self, buf: &Buffer, token: u64, mode: SendMode) -> Result<()> {
        if mode != SendMode::Standard {
            return Err(EngineError::Unsupported(
                "reactor backend only sends in standard mode",
            ));
        }
        // Safety: the pool keeps the region alive while the submitter's
        // reference is held, which outlasts the completion.
        unsafe { self.send_raw(buf.as_ptr(), buf.len() as usize, token) }
    }

    unsafe fn send_raw(&mut self, ptr: *const u8, len: usize, token: u64) -> Result<()> {
        if self.stream.is_none() {
            return Err(EngineError::InvalidState("send on unconnected backend"));
        }
        self.pending_writes.push_back(PendingWrite { token, ptr, len, done: 0 });
        // If this is the only write, try to finish it right now; anything
        // behind an armed write must wait its turn to keep ordering.
        if self.pending_writes.len() == 1 {
            self.drive_writes();
        }
        self.update_interest()
    }

    fn recv_buffer(&mut self, buf: &Buffer, token: u64, mode: RecvMode) -> Result<()> {
        if mode != RecvMode::Standard {
            return Err(EngineError::Unsupported(
                "reactor backend only receives in standard mode",
            ));
        }
        let mut b = *buf;
        // Safety: same pool-backed lifetime argument as send_buffer.
        unsafe { self.recv_raw(b.as_mut_ptr(), b.capacity() as usize, token) }
    }

    unsafe fn recv_raw(&mut self, ptr: *mut u8, len: usize, token: u64) -> Result<()> {
        if self.stream.is_none() {
            return Err(EngineError::InvalidState("recv on unconnected backend"));
        }
        if self.pending_read.is_some() {
            return Err(EngineError::InvalidState("recv already in flight"));
        }
        self.pending_read = Some(PendingRead { token, ptr, len });
        // Data may already be queued; try synchronously first.
        self.stream_readable();
        self.update_interest()
    }

    fn recv_multishot(&mut self, _token: u64) -> Result<()> {
        Err(EngineError::Unsupported("reactor backend has no buffer ring"))
    }

    fn recycle_buffer(&mut self, _bid: u16) -> Result<()> {
        Err(EngineError::Unsupported("reactor backend has no buffer ring"))
    }

    fn selected_buffer(&self, _bid: u16, _len: usize) -> Option<&[u8]> {
        None
    }

    fn submit(&mut self) -> Result<usize> {
        // Readiness backends have nothing to batch.
        Ok(0)
    }

    fn poll(&mut self, sink: &mut CompletionSink<'_>) -> Result<usize> {
        let mut n = self.drain_immediate(sink);
        self.turn(Some(Duration::ZERO))?;
        n += self.drain_immediate(sink);
        Ok(n)
    }

    fn wait(&mut self, timeout: Duration, sink: &mut CompletionSink<'_>) -> Result<usize> {
        let n = self.drain_immediate(sink);
        if n > 0 {
            return Ok(n);
        }
        self.turn(Some(timeout))?;
        Ok(self.drain_immediate(sink))
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Reactor
    }

    fn features(&self) -> Features {
        Features {
            registered_buffers: false,
            batch_submission: false,
            // An engine may layer TLS above the raw byte stream.
            tls: true,
        }
    }

    fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    fn connection_state(&self) -> ConnState {
        self.state
    }

    fn set_connection_state(&mut self, state: ConnState) {
        self.state = state;
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        if let Some(stream) = &self.stream {
            return stream.local_addr().ok();
        }
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.stream.as_ref().and_then(|s| s.peer_addr().ok())
    }

    fn create_from_accepted(&mut self, handle: i64) -> Result<Box<dyn IoBackend>> {
        let slot = usize::try_from(handle)
            .ok()
            .filter(|&s| s < self.accepted.len())
            .ok_or_else(|| EngineError::InvalidArgument(format!("bad accept handle {handle}")))?;
        let stream = self.accepted[slot]
            .take()
            .ok_or(EngineError::InvalidState("accept handle already claimed"))?;
        let backend =
            Self::from_accepted_stream(stream, self.connection_timeout, Arc::clone(&self.stats))?;
        Ok(Box::new(backend))
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if let Some(mut stream) = self.stream.take() {
            if self.current_interest.is_some() {
                let _ = self.poll.registry().deregister(&mut stream);
            }
        }
        if let Some(mut listener) = self.listener.take() {
            let _ = self.poll.registry().deregister(&mut listener);
        }
        self.pending_connect = None;
        self.pending_writes.clear();
        self.pending_read = None;
        self.pending_accept = None;
        self.state = ConnState::Closed;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read as _, Write as _};
    use std::net::Ipv4Addr;
    use std::time::Instant;

    fn collect(backend: &mut ReactorBackend, want: usize, budget: Duration) -> Vec<Completion> {
        let mut got = Vec::new();
        let deadline = Instant::now() + budget;
        while got.len() < want && Instant::now() < deadline {
            backend
                .wait(Duration::from_millis(10), &mut |c| got.push(c))
                .unwrap();
        }
        got
    }

    fn stats() -> Arc<EngineStats> {
        Arc::new(EngineStats::new())
    }

    #[test]
    fn connect_send_recv_round_trip() {
        let listener =
            std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let addr = match listener.local_addr().unwrap() {
            SocketAddr::V4(a) => a,
            _ => unreachable!(),
        };
        let server = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut buf = [0u8; 4];
            conn.read_exact(&mut buf).unwrap();
            conn.write_all(&buf).unwrap();
        });

        let mut backend = ReactorBackend::new(Duration::from_secs(5), stats()).unwrap();
        backend.connect(addr, 101).unwrap();
        let done = collect(&mut backend, 1, Duration::from_secs(2));
        assert_eq!(done[0].token, 101);
        assert_eq!(done[0].result, 0);

        let payload = 7u32.to_le_bytes();
        unsafe { backend.send_raw(payload.as_ptr(), payload.len(), 102).unwrap() };
        let done = collect(&mut backend, 1, Duration::from_secs(2));
        assert_eq!(done[0].token, 102);
        assert_eq!(done[0].result, 4);

        let mut reply = [0u8; 16];
        unsafe { backend.recv_raw(reply.as_mut_ptr(), reply.len(), 103).unwrap() };
        let done = collect(&mut backend, 1, Duration::from_secs(2));
        assert_eq!(done[0].token, 103);
        assert_eq!(done[0].result, 4);
        assert_eq!(&reply[..4], &payload);

        server.join().unwrap();
        backend.close().unwrap();
    }

    #[test]
    fn peer_close_maps_to_the_distinct_marker() {
        let listener =
            std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let addr = match listener.local_addr().unwrap() {
            SocketAddr::V4(a) => a,
            _ => unreachable!(),
        };
        let server = std::thread::spawn(move || {
            let (conn, _) = listener.accept().unwrap();
            drop(conn);
        });

        let mut backend = ReactorBackend::new(Duration::from_secs(5), stats()).unwrap();
        backend.connect(addr, 1).unwrap();
        let done = collect(&mut backend, 1, Duration::from_secs(2));
        assert_eq!(done[0].result, 0);

        let mut buf = [0u8; 8];
        unsafe { backend.recv_raw(buf.as_mut_ptr(), buf.len(), 2).unwrap() };
        let done = collect(&mut backend, 1, Duration::from_secs(2));
        assert_eq!(done[0].token, 2);
        assert_eq!(done[0].result, CONNECTION_CLOSED);

        server.join().unwrap();
        backend.close().unwrap();
    }

    #[test]
    fn refused_connect_fails_through_the_completion_path() {
        // Bind then drop to find a port with no listener.
        let probe = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let addr = match probe.local_addr().unwrap() {
            SocketAddr::V4(a) => a,
            _ => unreachable!(),
        };
        drop(probe);

        let mut backend = ReactorBackend::new(Duration::from_secs(5), stats()).unwrap();
        backend.connect(addr, 9).unwrap();
        let done = collect(&mut backend, 1, Duration::from_secs(2));
        assert_eq!(done[0].token, 9);
        assert!(done[0].result < 0);
        assert_ne!(done[0].result, CONNECTION_CLOSED);
    }

    #[test]
    fn accept_handles_are_one_shot() {
        let mut server = ReactorBackend::new(Duration::from_secs(5), stats()).unwrap();
        server.bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).unwrap();
        let addr = server.local_addr().unwrap();
        server.accept(77).unwrap();

        let client = std::thread::spawn(move || {
            let _s = std::net::TcpStream::connect(addr).unwrap();
            std::thread::sleep(Duration::from_millis(100));
        });

        let done = collect(&mut server, 1, Duration::from_secs(2));
        assert_eq!(done[0].token, 77);
        let handle = done[0].result;
        assert!(handle >= 0);

        let child = server.create_from_accepted(handle).unwrap();
        assert_eq!(child.connection_state(), ConnState::Connected);
        assert!(matches!(
            server.create_from_accepted(handle),
            Err(EngineError::InvalidState(_))
        ));
        client.join().unwrap();
    }

    #[test]
    fn pipelined_writes_complete_in_order() {
        let listener =
            std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let addr = match listener.local_addr().unwrap() {
            SocketAddr::V4(a) => a,
            _ => unreachable!(),
        };
        let server = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut sink = Vec::new();
            conn.read_to_end(&mut sink).unwrap();
            sink
        });

        let mut backend = ReactorBackend::new(Duration::from_secs(5), stats()).unwrap();
        backend.connect(addr, 1).unwrap();
        collect(&mut backend, 1, Duration::from_secs(2));

        let bufs: Vec<Vec<u8>> = (0..8u8).map(|i| vec![i; 2048]).collect();
        for (i, b) in bufs.iter().enumerate() {
            unsafe { backend.send_raw(b.as_ptr(), b.len(), 100 + i as u64).unwrap() };
        }
        let done = collect(&mut backend, 8, Duration::from_secs(2));
        let tokens: Vec<u64> = done.iter().map(|c| c.token).collect();
        assert_eq!(tokens, (100..108).collect::<Vec<u64>>());
        for c in &done {
            assert_eq!(c.result, 2048);
        }

        backend.close().unwrap();
        drop(backend);
        let echoed = server.join().unwrap();
        assert_eq!(echoed.len(), 8 * 2048);
    }
}

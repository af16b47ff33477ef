//! The `Transport` — one logical TCP connection.
//!
//! Application threads interact with a transport through token-returning
//! submit calls; a dedicated poller thread owns the backend and delivers
//! completions to the registered [`EventHandler`]. The only shared mutable
//! state is the lock-free command queue, the pending-send slot table, the
//! buffer pool, and a handful of atomics.

use std::net::{SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_queue::ArrayQueue;
use log::warn;

use tcpx_backend::{create_backend, BufferPool};
use tcpx_core::token::{self, TokenCounter};
use tcpx_core::{
    Buffer, BufferMode, ConnState, EngineConfig, EngineError, EngineStats, EventHandler, Result,
    StatsSnapshot,
};

use crate::command::Command;
use crate::pending::PendingTable;
use crate::poller::Poller;

/// How long `close()` waits for the poller to exit.
const CLOSE_WAIT: Duration = Duration::from_secs(5);

/// Coarse liveness view.
#[derive(Debug, Clone, Copy)]
pub struct Health {
    pub healthy: bool,
    pub active_connections: u32,
}

pub(crate) struct Shared {
    /// Mirror of the connection state, readable from any thread.
    state: AtomicU8,
    pub(crate) close_requested: AtomicBool,
    pub(crate) poller_done: AtomicBool,
    started: AtomicBool,
    /// Cache-line padded; application threads hammer it while the poller
    /// writes its own fields.
    pub(crate) tokens: TokenCounter,
    pub(crate) queue: ArrayQueue<Command>,
    pub(crate) pending: PendingTable,
    pub(crate) stats: Arc<EngineStats>,
    pub(crate) pool: Arc<BufferPool>,
    pub(crate) local_addr: Mutex<Option<SocketAddr>>,
    pub(crate) remote_addr: Mutex<Option<SocketAddr>>,
    poller_thread: Mutex<Option<thread::ThreadId>>,
}

impl Shared {
    pub(crate) fn conn_state(&self) -> ConnState {
        match self.state.load(Ordering::Acquire) {
            0 => ConnState::Disconnected,
            1 => ConnState::Connecting,
            2 => ConnState::Connected,
            3 => ConnState::Closing,
            _ => ConnState::Closed,
        }
    }

    pub(crate) fn set_conn_state(&self, state: ConnState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn transition(&self, from: ConnState, to: ConnState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

pub struct Transport {
    cfg: EngineConfig,
    shared: Arc<Shared>,
    join: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Transport {
    /// Configuration errors (reserved backends, missing pool, bad queue
    /// sizes) surface here, before any thread or socket exists.
    pub fn new(cfg: EngineConfig) -> Result<Self> {
        cfg.validate()?;
        if !cfg.buffers_enabled {
            return Err(EngineError::InvalidArgument(
                "the transport requires the buffer pool; enable buffers".into(),
            ));
        }
        let pool = Arc::new(BufferPool::new(cfg.buffer_count, cfg.buffer_size)?);
        let shared = Arc::new(Shared {
            state: AtomicU8::new(ConnState::Disconnected as u8),
            close_requested: AtomicBool::new(false),
            poller_done: AtomicBool::new(false),
            started: AtomicBool::new(false),
            tokens: TokenCounter::new(),
            queue: ArrayQueue::new(cfg.command_queue_depth as usize),
            pending: PendingTable::new(cfg.pending_sends),
            stats: Arc::new(EngineStats::new()),
            pool,
            local_addr: Mutex::new(None),
            remote_addr: Mutex::new(None),
            poller_thread: Mutex::new(None),
        });
        Ok(Self { cfg, shared, join: Mutex::new(None) })
    }

    /// Bind a handler and start the poller thread. Backend construction
    /// and buffer registration happen on the poller; their failures are
    /// reported synchronously from this call.
    pub fn start<H: EventHandler + 'static>(&self, handler: H) -> Result<()> {
        if self.shared.started.swap(true, Ordering::AcqRel) {
            return Err(EngineError::InvalidState("transport already started"));
        }

        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<()>>(1);
        let shared = Arc::clone(&self.shared);
        let cfg = self.cfg.clone();
        let handler: Box<dyn EventHandler> = Box::new(handler);

        let join = thread::Builder::new()
            .name("tcpx-poller".into())
            .spawn(move || {
                pin_to_cpu(cfg.cpu_affinity);
                *shared.poller_thread.lock().unwrap() = Some(thread::current().id());

                let backend = match create_backend(&cfg, Arc::clone(&shared.stats)) {
                    Ok(b) => b,
                    Err(e) => {
                        shared.poller_done.store(true, Ordering::Release);
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let mut backend = backend;

                // Fixed-buffer mode cannot run without pinned regions, so
                // a registration failure is fatal at start.
                if cfg.buffer_mode == BufferMode::Fixed {
                    if !backend.features().registered_buffers {
                        shared.poller_done.store(true, Ordering::Release);
                        let _ = ready_tx.send(Err(EngineError::Unsupported(
                            "fixed-buffer mode needs a backend with registered buffers",
                        )));
                        return;
                    }
                    match backend.register_buffers(&shared.pool.regions()) {
                        Ok(()) => shared.pool.mark_registered(),
                        Err(e) => {
                            shared.poller_done.store(true, Ordering::Release);
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    }
                }

                let _ = ready_tx.send(Ok(()));
                Poller::new(shared.clone(), backend, handler, cfg).run();
                shared.poller_done.store(true, Ordering::Release);
            })
            .map_err(|_| EngineError::ResourceExhausted("could not spawn poller thread"))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                *self.join.lock().unwrap() = Some(join);
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = join.join();
                self.shared.started.store(false, Ordering::Release);
                Err(e)
            }
            Err(_) => {
                let _ = join.join();
                self.shared.started.store(false, Ordering::Release);
                Err(EngineError::InvalidState("poller exited during startup"))
            }
        }
    }

    /// Submit an asynchronous connect. The returned token is echoed by
    /// `on_connected` / `on_connection_failed`.
    pub fn connect(&self, addr: SocketAddrV4) -> Result<u64> {
        if !self.shared.started.load(Ordering::Acquire) {
            return Err(EngineError::InvalidState("transport not started"));
        }
        if !self.shared.transition(ConnState::Disconnected, ConnState::Connecting) {
            return Err(EngineError::InvalidState(
                "transport is already connected or connecting",
            ));
        }
        let token = self.shared.tokens.next_connect();
        if self.shared.queue.push(Command::Connect(addr, token)).is_err() {
            self.shared.set_conn_state(ConnState::Disconnected);
            EngineStats::incr(&self.shared.stats.queue_overflows);
            return Err(EngineError::Backpressure("command queue full"));
        }
        Ok(token)
    }

    /// Copy `data` into a pool buffer and submit it. The returned token is
    /// echoed by `on_send_complete` / `on_send_failed`.
    pub fn send(&self, data: &[u8]) -> Result<u64> {
        if self.shared.conn_state() != ConnState::Connected {
            return Err(EngineError::InvalidState("transport not connected"));
        }
        // Checked before any slot or buffer is consumed.
        if data.len() > self.shared.pool.buffer_size() as usize {
            return Err(EngineError::InvalidArgument(format!(
                "payload of {} bytes exceeds buffer capacity {}",
                data.len(),
                self.shared.pool.buffer_size()
            )));
        }

        let token = self.shared.tokens.next_send();
        let idx = token::slot_index(token, self.shared.pending.mask());
        if !self.shared.pending.claim(idx) {
            return Err(EngineError::Backpressure("too many in-flight sends"));
        }

        let mut buf = match self.shared.pool.acquire() {
            Ok(b) => b,
            Err(e) => {
                self.shared.pending.clear(idx);
                return Err(e);
            }
        };
        if let Err(e) = buf.write(data) {
            self.shared.pending.clear(idx);
            let _ = self.shared.pool.release(&buf);
            return Err(e);
        }
        buf.set_token(token);

        let flags = crate::poller::submission_flags(&self.cfg, data.len());
        self.shared.pending.fill(idx, buf, token, flags);

        if self.shared.queue.push(Command::Send(buf)).is_err() {
            self.shared.pending.clear(idx);
            let _ = self.shared.pool.release(&buf);
            EngineStats::incr(&self.shared.stats.queue_overflows);
            return Err(EngineError::Backpressure("command queue full"));
        }
        Ok(token)
    }

    /// Borrow a pool buffer for application-managed I/O staging.
    pub fn acquire_buffer(&self) -> Result<Buffer> {
        self.shared.pool.acquire()
    }

    /// Return a buffer taken with [`Transport::acquire_buffer`].
    pub fn release_buffer(&self, buf: &Buffer) -> Result<()> {
        self.shared.pool.release(buf)
    }

    /// Payload bytes the pool can take without blocking.
    pub fn available_buffer_space(&self) -> u64 {
        self.shared.pool.available() as u64 * self.shared.pool.buffer_size() as u64
    }

    pub fn is_connected(&self) -> bool {
        self.shared.conn_state() == ConnState::Connected
    }

    pub fn health(&self) -> Health {
        let state = self.shared.conn_state();
        let started = self.shared.started.load(Ordering::Acquire);
        Health {
            healthy: started
                && !self.shared.poller_done.load(Ordering::Acquire)
                && state != ConnState::Closed,
            active_connections: u32::from(state == ConnState::Connected),
        }
    }

    pub fn local_address(&self) -> Option<SocketAddr> {
        *self.shared.local_addr.lock().unwrap()
    }

    pub fn remote_address(&self) -> Option<SocketAddr> {
        *self.shared.remote_addr.lock().unwrap()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Shut the transport down. Idempotent; safe from any thread,
    /// including handler callbacks on the poller itself.
    pub fn close(&self) -> Result<()> {
        self.shared.close_requested.store(true, Ordering::Release);

        if !self.shared.started.load(Ordering::Acquire) {
            // Never started: there is no poller to run the close body.
            self.shared.set_conn_state(ConnState::Closed);
            self.shared.pool.close();
            return Ok(());
        }

        let on_poller = {
            let id = self.shared.poller_thread.lock().unwrap();
            *id == Some(thread::current().id())
        };
        if on_poller {
            // The poller runs the close body inline at the top of its next
            // turn; joining ourselves would deadlock.
            return Ok(());
        }

        if !self.shared.poller_done.load(Ordering::Acquire) {
            // The sentinel must not be lost to a momentarily full queue.
            while self.shared.queue.push(Command::Close).is_err() {
                if self.shared.poller_done.load(Ordering::Acquire) {
                    break;
                }
                std::hint::spin_loop();
            }
        }

        let deadline = Instant::now() + CLOSE_WAIT;
        while !self.shared.poller_done.load(Ordering::Acquire) {
            if Instant::now() >= deadline {
                warn!("poller did not exit within {CLOSE_WAIT:?}");
                return Ok(());
            }
            thread::park_timeout(Duration::from_millis(1));
        }
        if let Some(join) = self.join.lock().unwrap().take() {
            let _ = join.join();
        }
        Ok(())
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if self.shared.started.load(Ordering::Acquire)
            && !self.shared.poller_done.load(Ordering::Acquire)
        {
            let _ = self.close();
        }
    }
}

#[cfg(target_os = "linux")]
fn pin_to_cpu(cpu: i32) {
    if cpu < 0 {
        return;
    }
    let mut set = nix::sched::CpuSet::new();
    if set.set(cpu as usize).is_err() {
        warn!("cpu {cpu} out of range for affinity mask");
        return;
    }
    if let Err(e) = nix::sched::sched_setaffinity(nix::unistd::Pid::from_raw(0), &set) {
        warn!("failed to pin poller to cpu {cpu}: {e}");
    }
}

#[cfg(not(target_os = "linux"))]
fn pin_to_cpu(_cpu: i32) {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn small_config(pending: u32, queue: u32) -> EngineConfig {
        EngineConfig {
            backend: tcpx_core::BackendKind::Reactor,
            buffer_count: 32,
            buffer_size: 1024,
            pending_sends: pending,
            command_queue_depth: queue,
            ..EngineConfig::default()
        }
    }

    /// Put an unstarted transport into the connected state so the submit
    /// paths can be exercised without a poller draining the queue.
    fn force_connected(t: &Transport) {
        t.shared.set_conn_state(ConnState::Connected);
    }

    #[test]
    fn send_before_connect_is_invalid_state() {
        let t = Transport::new(small_config(16, 16)).unwrap();
        assert!(matches!(
            t.send(b"hello"),
            Err(EngineError::InvalidState(_))
        ));
    }

    #[test]
    fn oversized_payload_consumes_nothing() {
        let t = Transport::new(small_config(16, 16)).unwrap();
        force_connected(&t);
        let available = t.shared.pool.available();
        assert!(matches!(
            t.send(&[0u8; 2048]),
            Err(EngineError::InvalidArgument(_))
        ));
        assert_eq!(t.shared.pool.available(), available);
        assert_eq!(t.shared.pending.occupied_count(), 0);
    }

    #[test]
    fn slot_collision_reports_backpressure() {
        let t = Transport::new(small_config(4, 64)).unwrap();
        force_connected(&t);
        for _ in 0..4 {
            t.send(b"x").unwrap();
        }
        let before = t.shared.pool.available();
        let err = t.send(b"x");
        assert!(matches!(err, Err(EngineError::Backpressure(_))));
        // The failed send consumed neither a slot nor a buffer.
        assert_eq!(t.shared.pool.available(), before);
        assert_eq!(t.shared.pending.occupied_count(), 4);
    }

    #[test]
    fn full_command_queue_reports_backpressure_and_leaks_nothing() {
        let t = Transport::new(small_config(64, 8)).unwrap();
        force_connected(&t);
        for _ in 0..8 {
            t.send(b"x").unwrap();
        }
        let before = t.shared.pool.available();
        let err = t.send(b"x");
        assert!(matches!(err, Err(EngineError::Backpressure(_))));
        assert_eq!(t.shared.pool.available(), before);
        assert_eq!(t.shared.pending.occupied_count(), 8);
        assert_eq!(t.stats().queue_overflows, 1);
    }

    #[test]
    fn tokens_are_returned_before_completions_can_exist() {
        let t = Transport::new(small_config(16, 16)).unwrap();
        force_connected(&t);
        let a = t.send(b"one").unwrap();
        let b = t.send(b"two").unwrap();
        assert!(token::sequence(b) > token::sequence(a));
        assert!(!token::is_recv(a) && !token::is_connect(a));
    }

    #[test]
    fn connect_requires_start() {
        let t = Transport::new(small_config(16, 16)).unwrap();
        assert!(matches!(
            t.connect(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1)),
            Err(EngineError::InvalidState(_))
        ));
    }

    #[test]
    fn close_before_start_is_fine_and_idempotent() {
        let t = Transport::new(small_config(16, 16)).unwrap();
        t.close().unwrap();
        t.close().unwrap();
        assert!(!t.health().healthy);
        assert!(t.acquire_buffer().is_err());
    }

    #[test]
    fn buffers_disabled_is_a_construction_error() {
        let cfg = EngineConfig {
            buffers_enabled: false,
            buffer_mode: BufferMode::Standard,
            ..small_config(16, 16)
        };
        assert!(Transport::new(cfg).is_err());
    }
}

/// Fast-path fallback tests: a scripted backend stands in for the kernel
/// so the poller's retry and zero-copy logic can be exercised without
/// io_uring support in the environment.
#[cfg(test)]
mod fallback_tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::Ordering as AtomicOrdering;
    use std::sync::mpsc::{channel, Receiver, Sender};
    use std::time::Instant;

    use tcpx_core::backend::{
        BackendKind, CompletionSink, Features, IoBackend, RecvMode, SendMode,
    };
    use tcpx_core::completion::comp_flags;
    use tcpx_core::{BufferMode, Completion};

    use crate::poller::Poller;

    type SendLog = Mutex<Vec<(u64, SendMode)>>;

    /// Scripted in-memory backend. Sends complete according to the
    /// script; receives are accepted and never complete, keeping the
    /// poller's receive slot occupied like a quiet peer would.
    struct MockBackend {
        /// Reject the first fast-path (fixed or zero-copy) send with
        /// EINVAL, as a kernel without the opcode does.
        reject_fast_once: bool,
        rejected: bool,
        /// When set, park the zero-copy notification until the flag goes
        /// true.
        notif_gate: Option<Arc<AtomicBool>>,
        parked_notif: Option<Completion>,
        pending: VecDeque<Completion>,
        log: Arc<SendLog>,
        state: ConnState,
    }

    impl MockBackend {
        fn new(log: Arc<SendLog>) -> Self {
            Self {
                reject_fast_once: false,
                rejected: false,
                notif_gate: None,
                parked_notif: None,
                pending: VecDeque::new(),
                log,
                state: ConnState::Connected,
            }
        }
    }

    impl IoBackend for MockBackend {
        fn register_buffers(&mut self, _regions: &[(u64, usize)]) -> Result<()> {
            Ok(())
        }

        fn connect(&mut self, _addr: SocketAddrV4, token: u64) -> Result<()> {
            self.pending.push_back(Completion::new(token, 0, 0));
            Ok(())
        }

        fn bind(&mut self, _addr: SocketAddrV4) -> Result<()> {
            Ok(())
        }

        fn accept(&mut self, _token: u64) -> Result<()> {
            Ok(())
        }

        fn accept_multishot(&mut self, _token: u64) -> Result<()> {
            Err(EngineError::Unsupported("mock does not accept"))
        }

        fn send_buffer(&mut self, buf: &Buffer, token: u64, mode: SendMode) -> Result<()> {
            self.log.lock().unwrap().push((token, mode));
            let len = buf.len() as i64;
            match mode {
                SendMode::Fixed | SendMode::ZeroCopy if self.reject_fast_once && !self.rejected => {
                    self.rejected = true;
                    self.pending
                        .push_back(Completion::new(token, -(libc::EINVAL as i64), 0));
                }
                SendMode::ZeroCopy => {
                    self.pending
                        .push_back(Completion::new(token, len, comp_flags::MORE));
                    let notif = Completion::new(token, 0, comp_flags::NOTIF);
                    if self.notif_gate.is_some() {
                        self.parked_notif = Some(notif);
                    } else {
                        self.pending.push_back(notif);
                    }
                }
                _ => self.pending.push_back(Completion::new(token, len, 0)),
            }
            Ok(())
        }

        unsafe fn send_raw(&mut self, _ptr: *const u8, len: usize, token: u64) -> Result<()> {
            self.pending.push_back(Completion::new(token, len as i64, 0));
            Ok(())
        }

        fn recv_buffer(&mut self, _buf: &Buffer, _token: u64, _mode: RecvMode) -> Result<()> {
            Ok(())
        }

        unsafe fn recv_raw(&mut self, _ptr: *mut u8, _len: usize, _token: u64) -> Result<()> {
            Ok(())
        }

        fn recv_multishot(&mut self, _token: u64) -> Result<()> {
            Err(EngineError::Unsupported("no buffer ring in the mock"))
        }

        fn recycle_buffer(&mut self, _bid: u16) -> Result<()> {
            Err(EngineError::Unsupported("no buffer ring in the mock"))
        }

        fn selected_buffer(&self, _bid: u16, _len: usize) -> Option<&[u8]> {
            None
        }

        fn submit(&mut self) -> Result<usize> {
            Ok(0)
        }

        fn poll(&mut self, sink: &mut CompletionSink<'_>) -> Result<usize> {
            let mut n = 0;
            while let Some(c) = self.pending.pop_front() {
                sink(c);
                n += 1;
            }
            if let Some(gate) = &self.notif_gate {
                if gate.load(AtomicOrdering::Acquire) {
                    if let Some(notif) = self.parked_notif.take() {
                        sink(notif);
                        n += 1;
                    }
                }
            }
            Ok(n)
        }

        fn wait(&mut self, _timeout: Duration, sink: &mut CompletionSink<'_>) -> Result<usize> {
            self.poll(sink)
        }

        fn kind(&self) -> BackendKind {
            BackendKind::Uring
        }

        fn features(&self) -> Features {
            Features { registered_buffers: true, batch_submission: true, tls: false }
        }

        fn stats(&self) -> StatsSnapshot {
            StatsSnapshot::default()
        }

        fn connection_state(&self) -> ConnState {
            self.state
        }

        fn set_connection_state(&mut self, state: ConnState) {
            self.state = state;
        }

        fn local_addr(&self) -> Option<SocketAddr> {
            None
        }

        fn remote_addr(&self) -> Option<SocketAddr> {
            None
        }

        fn create_from_accepted(&mut self, _handle: i64) -> Result<Box<dyn IoBackend>> {
            Err(EngineError::Unsupported("mock does not accept"))
        }

        fn close(&mut self) -> Result<()> {
            self.state = ConnState::Closed;
            Ok(())
        }
    }

    #[derive(Debug, PartialEq)]
    enum Ev {
        SendComplete(u64),
        SendFailed(u64),
        Closed,
    }

    struct Rec(Sender<Ev>);

    impl EventHandler for Rec {
        fn on_data_received(&mut self, _data: &[u8]) {}
        fn on_send_complete(&mut self, token: u64) {
            let _ = self.0.send(Ev::SendComplete(token));
        }
        fn on_send_failed(&mut self, token: u64, _cause: &str) {
            let _ = self.0.send(Ev::SendFailed(token));
        }
        fn on_closed(&mut self) {
            let _ = self.0.send(Ev::Closed);
        }
    }

    fn harness_config(mode: BufferMode) -> EngineConfig {
        EngineConfig {
            buffer_count: 4,
            buffer_size: 512,
            buffer_mode: mode,
            zero_copy_min_bytes: 1,
            pending_sends: 16,
            command_queue_depth: 16,
            ..EngineConfig::default()
        }
    }

    /// Run a poller over a mock backend for an already-connected
    /// transport. Returns the handler's event stream and the join handle.
    fn spawn_harness(
        t: &Transport,
        build: impl FnOnce(Arc<SendLog>) -> MockBackend + Send + 'static,
        log: Arc<SendLog>,
    ) -> (Receiver<Ev>, thread::JoinHandle<()>) {
        t.shared.set_conn_state(ConnState::Connected);
        let shared = Arc::clone(&t.shared);
        let cfg = t.cfg.clone();
        let (tx, rx) = channel();
        let join = thread::spawn(move || {
            let mock = build(log);
            Poller::new(shared, Box::new(mock), Box::new(Rec(tx)), cfg).run();
        });
        (rx, join)
    }

    fn wait_for_available(t: &Transport, want: u32) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while t.shared.pool.available() != want {
            assert!(Instant::now() < deadline, "pool never settled at {want} free buffers");
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn shut_down(t: &Transport, rx: &Receiver<Ev>, join: thread::JoinHandle<()>) {
        t.shared.close_requested.store(true, Ordering::Release);
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), Ev::Closed);
        join.join().unwrap();
    }

    #[test]
    fn rejected_fixed_send_retries_as_standard_invisibly() {
        let t = Transport::new(harness_config(BufferMode::Fixed)).unwrap();
        let log = Arc::new(SendLog::default());
        let (rx, join) = spawn_harness(
            &t,
            |log| MockBackend { reject_fast_once: true, ..MockBackend::new(log) },
            Arc::clone(&log),
        );

        let token = t.send(b"ping").unwrap();
        // Exactly one completion, with the original token; no failure
        // callback for the rejected fast path.
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), Ev::SendComplete(token));

        // One buffer stays parked in the quiet receive; the send buffer
        // comes back.
        wait_for_available(&t, 3);
        let submissions = log.lock().unwrap().clone();
        assert_eq!(submissions, vec![(token, SendMode::Fixed), (token, SendMode::Standard)]);

        shut_down(&t, &rx, join);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn zero_copy_buffer_survives_until_the_notification() {
        let t = Transport::new(harness_config(BufferMode::ZeroCopy)).unwrap();
        let log = Arc::new(SendLog::default());
        let gate = Arc::new(AtomicBool::new(false));
        let gate_for_mock = Arc::clone(&gate);
        let (rx, join) = spawn_harness(
            &t,
            move |log| MockBackend { notif_gate: Some(gate_for_mock), ..MockBackend::new(log) },
            Arc::clone(&log),
        );

        let token = t.send(b"zero copy payload").unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), Ev::SendComplete(token));

        // The regular completion fired, but the buffer must stay alive
        // until the notification: one receive buffer + one send buffer out.
        thread::sleep(Duration::from_millis(30));
        assert_eq!(t.shared.pool.available(), 2);

        gate.store(true, Ordering::Release);
        wait_for_available(&t, 3);
        assert_eq!(log.lock().unwrap().as_slice(), &[(token, SendMode::ZeroCopy)]);

        shut_down(&t, &rx, join);
    }

    #[test]
    fn rejected_zero_copy_send_retries_as_standard() {
        let t = Transport::new(harness_config(BufferMode::ZeroCopy)).unwrap();
        let log = Arc::new(SendLog::default());
        let (rx, join) = spawn_harness(
            &t,
            |log| MockBackend { reject_fast_once: true, ..MockBackend::new(log) },
            Arc::clone(&log),
        );

        let token = t.send(b"fallback").unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), Ev::SendComplete(token));
        wait_for_available(&t, 3);
        assert_eq!(
            log.lock().unwrap().clone(),
            vec![(token, SendMode::ZeroCopy), (token, SendMode::Standard)]
        );

        shut_down(&t, &rx, join);
    }

    #[test]
    fn small_payloads_skip_the_zero_copy_path() {
        let cfg = EngineConfig {
            zero_copy_min_bytes: 4096,
            ..harness_config(BufferMode::ZeroCopy)
        };
        let t = Transport::new(cfg).unwrap();
        let log = Arc::new(SendLog::default());
        let (rx, join) = spawn_harness(&t, MockBackend::new, Arc::clone(&log));

        let token = t.send(b"tiny").unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), Ev::SendComplete(token));
        assert_eq!(log.lock().unwrap().clone(), vec![(token, SendMode::Standard)]);

        shut_down(&t, &rx, join);
    }
}

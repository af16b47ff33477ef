//! The poller loop.
//!
//! A dedicated thread drives one backend: drain commands, repost the
//! receive, kick the submission batch, reap completions, dispatch to the
//! handler. The poller is the sole mutator of connection state and pending
//! tables; nothing here takes a lock on the hot path.
//!
//! Failures never propagate out of the loop: per-operation errors are
//! routed to the handler's failure callbacks and handler panics are caught
//! and logged.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, trace, warn};

use tcpx_core::backend::{IoBackend, RecvMode, SendMode};
use tcpx_core::errno::{describe, is_connection_closed, is_feature_unsupported};
use tcpx_core::token;
use tcpx_core::{
    Buffer, BufferMode, Completion, ConnState, EngineConfig, EngineError, EngineStats,
    EventHandler,
};

use crate::command::Command;
use crate::pending::slot_flags;
use crate::transport::Shared;

/// Commands translated per turn before the batch is submitted.
const CMD_BATCH: usize = 256;

/// Consecutive empty turns before the poller parks in `wait`.
const IDLE_SPIN_TURNS: u32 = 1024;

/// Park budget for an idle poller.
const IDLE_WAIT: Duration = Duration::from_millis(1);

/// Decide the slot tags for a send at enqueue time. Pure configuration;
/// the poller downgrades on completion when the kernel disagrees.
pub(crate) fn submission_flags(cfg: &EngineConfig, payload_len: usize) -> u8 {
    match cfg.buffer_mode {
        BufferMode::ZeroCopy if payload_len >= cfg.zero_copy_min_bytes as usize => {
            slot_flags::ZERO_COPY
        }
        BufferMode::Fixed => slot_flags::FIXED,
        _ => 0,
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ActiveRecv {
    None,
    Standard,
    Fixed,
    BufferRing,
}

pub(crate) struct Poller {
    shared: Arc<Shared>,
    backend: Box<dyn IoBackend>,
    handler: Box<dyn EventHandler>,
    cfg: EngineConfig,
    comp_buf: Vec<Completion>,
    recv_buf: Option<Buffer>,
    recv_token: u64,
    recv_mode: ActiveRecv,
    recv_retried: bool,
    /// Buffer-ring receive stays off for the rest of this transport's life
    /// once the kernel rejects it or a CQE comes back malformed.
    buffer_ring_ok: bool,
    /// Fixed-mode receive is likewise disabled after its first rejection.
    fixed_recv_ok: bool,
    ring_warned: bool,
    idle_turns: u32,
    closed: bool,
}

impl Poller {
    pub fn new(
        shared: Arc<Shared>,
        backend: Box<dyn IoBackend>,
        handler: Box<dyn EventHandler>,
        cfg: EngineConfig,
    ) -> Self {
        let buffer_ring_ok = cfg.buffer_mode == BufferMode::BufferRing;
        let fixed_recv_ok = cfg.buffer_mode == BufferMode::Fixed;
        Self {
            shared,
            backend,
            handler,
            cfg,
            comp_buf: Vec::with_capacity(256),
            recv_buf: None,
            recv_token: 0,
            recv_mode: ActiveRecv::None,
            recv_retried: false,
            buffer_ring_ok,
            fixed_recv_ok,
            ring_warned: false,
            idle_turns: 0,
            closed: false,
        }
    }

    pub fn run(mut self) {
        debug!("poller started ({:?} backend)", self.backend.kind());
        loop {
            let mut did_work = false;

            for _ in 0..CMD_BATCH {
                match self.shared.queue.pop() {
                    Some(cmd) => {
                        did_work = true;
                        self.handle_command(cmd);
                    }
                    None => break,
                }
            }

            if self.shared.close_requested.load(std::sync::atomic::Ordering::Acquire)
                && !self.closed
            {
                self.run_close();
            }
            if self.closed {
                break;
            }

            self.maybe_post_receive();

            if let Err(e) = self.backend.submit() {
                warn!("batch submission failed: {e}");
            }

            let reaped = self.poll_once(false);
            if reaped > 0 {
                did_work = true;
            }
            if self.closed {
                break;
            }

            if did_work {
                self.idle_turns = 0;
            } else {
                self.idle_turns += 1;
                if self.idle_turns < IDLE_SPIN_TURNS {
                    std::hint::spin_loop();
                } else {
                    // Steady-state idle: let the backend block briefly
                    // instead of burning the core.
                    self.poll_once(true);
                }
            }
        }
        debug!("poller exited");
    }

    /// Reap completions. `park` trades one short block for the idle spin.
    fn poll_once(&mut self, park: bool) -> usize {
        let mut buf = std::mem::take(&mut self.comp_buf);
        buf.clear();
        let res = if park {
            self.backend.wait(IDLE_WAIT, &mut |c| buf.push(c))
        } else {
            self.backend.poll(&mut |c| buf.push(c))
        };
        if let Err(e) = res {
            warn!("completion reap failed: {e}");
        }
        let n = buf.len();
        for c in &buf {
            if self.closed {
                break;
            }
            self.handle_completion(*c);
        }
        self.comp_buf = buf;
        n
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect(addr, tok) => match self.backend.connect(addr, tok) {
                Ok(()) => {
                    self.backend.set_connection_state(ConnState::Connecting);
                }
                Err(e) => {
                    self.shared.set_conn_state(ConnState::Disconnected);
                    self.dispatch(|h| h.on_connection_failed(tok, &e.to_string()));
                }
            },
            Command::Send(buf) => self.submit_send(buf),
            Command::Close => {
                self.shared
                    .close_requested
                    .store(true, std::sync::atomic::Ordering::Release);
            }
        }
    }

    fn submit_send(&mut self, buf: Buffer) {
        let tok = buf.token();
        let idx = token::slot_index(tok, self.shared.pending.mask());
        if self.shared.pending.token(idx) != tok {
            // The sender rolled the slot back after a failed enqueue and a
            // later send claimed it; nothing to do.
            trace!("send command for vacated slot {idx}, dropping");
            return;
        }
        let slot = self.shared.pending.read(idx);
        let mode = if slot.flags & slot_flags::ZERO_COPY != 0 {
            SendMode::ZeroCopy
        } else if slot.flags & slot_flags::FIXED != 0 {
            SendMode::Fixed
        } else {
            SendMode::Standard
        };
        if let Err(e) = self.backend.send_buffer(&buf, tok, mode) {
            self.fail_send(idx, tok, &buf, &e.to_string());
        }
    }

    fn fail_send(&mut self, idx: usize, tok: u64, buf: &Buffer, cause: &str) {
        self.shared.pending.clear(idx);
        if let Err(e) = self.shared.pool.release(buf) {
            warn!("send buffer release failed: {e}");
        }
        EngineStats::incr(&self.shared.stats.failed_sends);
        self.dispatch(|h| h.on_send_failed(tok, cause));
    }

    /// Post the next receive when connected with none outstanding. Buffer
    /// exhaustion is not an error; the post is retried next turn.
    fn maybe_post_receive(&mut self) {
        if self.recv_mode != ActiveRecv::None
            || self.closed
            || self.shared.conn_state() != ConnState::Connected
        {
            return;
        }

        if self.buffer_ring_ok {
            let tok = self.shared.tokens.next_recv();
            match self.backend.recv_multishot(tok) {
                Ok(()) => {
                    self.recv_token = tok;
                    self.recv_mode = ActiveRecv::BufferRing;
                    return;
                }
                Err(EngineError::Unsupported(why)) => {
                    warn!("buffer-ring receive unavailable ({why}), using standard receive");
                    self.buffer_ring_ok = false;
                }
                Err(EngineError::QueueFull) => return,
                Err(e) => {
                    warn!("multishot receive failed: {e}");
                    self.buffer_ring_ok = false;
                }
            }
        }

        let buf = match self.shared.pool.try_acquire() {
            Ok(Some(b)) => b,
            Ok(None) => return,
            Err(_) => return,
        };
        let tok = self.shared.tokens.next_recv();
        let mode = if self.fixed_recv_ok && self.shared.pool.is_registered() {
            RecvMode::Fixed
        } else {
            RecvMode::Standard
        };
        match self.backend.recv_buffer(&buf, tok, mode) {
            Ok(()) => {
                self.recv_buf = Some(buf);
                self.recv_token = tok;
                self.recv_mode = if mode == RecvMode::Fixed {
                    ActiveRecv::Fixed
                } else {
                    ActiveRecv::Standard
                };
                self.recv_retried = false;
            }
            Err(e) => {
                if let Err(re) = self.shared.pool.release(&buf) {
                    warn!("receive buffer release failed: {re}");
                }
                if !matches!(e, EngineError::QueueFull) {
                    warn!("receive post failed: {e}");
                }
            }
        }
    }

    fn handle_completion(&mut self, c: Completion) {
        if self.closed {
            return;
        }
        if token::is_connect(c.token) {
            self.on_connect_completion(c);
        } else if token::is_recv(c.token) {
            self.on_recv_completion(c);
        } else {
            self.on_send_completion(c);
        }
    }

    fn on_connect_completion(&mut self, c: Completion) {
        if c.result >= 0 {
            self.shared.set_conn_state(ConnState::Connected);
            self.backend.set_connection_state(ConnState::Connected);
            *self.shared.local_addr.lock().unwrap() = self.backend.local_addr();
            *self.shared.remote_addr.lock().unwrap() = self.backend.remote_addr();
            debug!("connected to {:?}", self.backend.remote_addr());
            let tok = c.token;
            self.dispatch(|h| h.on_connected(tok));
            // The first receive goes out on the next turn.
        } else {
            self.shared.set_conn_state(ConnState::Disconnected);
            self.backend.set_connection_state(ConnState::Disconnected);
            let tok = c.token;
            let cause = describe(c.result);
            self.dispatch(|h| h.on_connection_failed(tok, &cause));
        }
    }

    fn on_recv_completion(&mut self, c: Completion) {
        if c.token != self.recv_token {
            trace!("stale receive completion for token {:#x}", c.token);
            return;
        }
        match self.recv_mode {
            ActiveRecv::BufferRing => self.on_ring_recv(c),
            ActiveRecv::Fixed | ActiveRecv::Standard => self.on_buffer_recv(c),
            ActiveRecv::None => trace!("receive completion with none outstanding"),
        }
    }

    fn on_ring_recv(&mut self, c: Completion) {
        if is_connection_closed(c.result) {
            self.recv_mode = ActiveRecv::None;
            self.run_close();
            return;
        }
        if c.result < 0 {
            if !self.ring_warned {
                warn!(
                    "buffer-ring receive failed ({}), falling back to standard",
                    describe(c.result)
                );
                self.ring_warned = true;
            }
            EngineStats::incr(&self.shared.stats.failed_receives);
            self.buffer_ring_ok = false;
            self.recv_mode = ActiveRecv::None;
            return;
        }

        let consumed = match c.buffer_id() {
            Some(bid) => {
                let len = c.result as usize;
                match self.backend.selected_buffer(bid, len) {
                    Some(view) => {
                        let view: &[u8] = view;
                        // The view borrows ring-owned storage; hand it to
                        // the handler, then recycle.
                        let handler = self.handler.as_mut();
                        if let Err(p) = catch_unwind(AssertUnwindSafe(|| {
                            handler.on_data_received(view)
                        })) {
                            log_handler_panic(p);
                        }
                        EngineStats::incr(&self.shared.stats.receives);
                        EngineStats::add(&self.shared.stats.bytes_received, len as u64);
                        if let Err(e) = self.backend.recycle_buffer(bid) {
                            warn!("buffer-ring recycle failed: {e}");
                        }
                        true
                    }
                    None => false,
                }
            }
            None => false,
        };

        if !consumed {
            // Unrecognizable CQE: disable the ring path for good.
            if !self.ring_warned {
                warn!("malformed buffer-ring completion, disabling buffer-ring mode");
                self.ring_warned = true;
            }
            self.buffer_ring_ok = false;
            self.recv_mode = ActiveRecv::None;
            return;
        }

        if !c.more() {
            // Multishot stream ended; rearm on the next turn.
            self.recv_mode = ActiveRecv::None;
        }
    }

    fn on_buffer_recv(&mut self, c: Completion) {
        let Some(buf) = self.recv_buf else {
            trace!("receive completion without a posted buffer");
            return;
        };

        if is_connection_closed(c.result) {
            self.release_recv_buffer();
            self.recv_mode = ActiveRecv::None;
            self.run_close();
            return;
        }

        if c.result < 0 {
            if self.recv_mode == ActiveRecv::Fixed
                && is_feature_unsupported(c.result)
                && !self.recv_retried
            {
                // Fast-path rejection: same token, standard opcode.
                match self.backend.recv_buffer(&buf, self.recv_token, RecvMode::Standard) {
                    Ok(()) => {
                        debug!("fixed receive rejected, retried as standard");
                        self.recv_retried = true;
                        self.fixed_recv_ok = false;
                        self.recv_mode = ActiveRecv::Standard;
                        return;
                    }
                    Err(e) => warn!("standard receive retry failed: {e}"),
                }
            }
            // Transient: drop the buffer, repost next turn.
            EngineStats::incr(&self.shared.stats.failed_receives);
            trace!("receive failed: {}", describe(c.result));
            self.release_recv_buffer();
            self.recv_mode = ActiveRecv::None;
            return;
        }

        let len = c.result as usize;
        {
            let view = buf.prefix(len);
            let handler = self.handler.as_mut();
            if let Err(p) = catch_unwind(AssertUnwindSafe(|| handler.on_data_received(view))) {
                log_handler_panic(p);
            }
        }
        EngineStats::incr(&self.shared.stats.receives);
        EngineStats::add(&self.shared.stats.bytes_received, len as u64);
        self.release_recv_buffer();
        self.recv_mode = ActiveRecv::None;
    }

    fn release_recv_buffer(&mut self) {
        if let Some(buf) = self.recv_buf.take() {
            if let Err(e) = self.shared.pool.release(&buf) {
                warn!("receive buffer release failed: {e}");
            }
        }
    }

    fn on_send_completion(&mut self, c: Completion) {
        let idx = token::slot_index(c.token, self.shared.pending.mask());
        if !self.shared.pending.is_occupied(idx) || self.shared.pending.token(idx) != c.token {
            // Slot reuse race: a completion for a send that already
            // finished (or was dropped at close). Leave the buffer alone.
            trace!("stale send completion for token {:#x}", c.token);
            return;
        }
        let slot = self.shared.pending.read(idx);
        let Some(buf) = slot.buffer else {
            trace!("send completion for empty slot, dropping");
            return;
        };

        if slot.flags & slot_flags::ZERO_COPY != 0 {
            if c.notif() {
                // Second phase: the kernel is done with the buffer.
                self.shared.pending.clear(idx);
                if let Err(e) = self.shared.pool.release(&buf) {
                    warn!("zero-copy buffer release failed: {e}");
                }
                return;
            }
            if c.result >= 0 {
                // First phase: the data is out, but the buffer stays
                // pinned until the notification.
                EngineStats::incr(&self.shared.stats.sends);
                EngineStats::add(&self.shared.stats.bytes_sent, c.result as u64);
                self.shared
                    .pending
                    .update_flags(idx, slot.flags | slot_flags::AWAITING_NOTIF);
                let tok = c.token;
                self.dispatch(|h| h.on_send_complete(tok));
                return;
            }
            if is_feature_unsupported(c.result) && slot.flags & slot_flags::RETRIED == 0 {
                if self
                    .backend
                    .send_buffer(&buf, c.token, SendMode::Standard)
                    .is_ok()
                {
                    debug!("zero-copy send rejected, retried as standard");
                    self.shared.pending.update_flags(idx, slot_flags::RETRIED);
                    return;
                }
            }
            self.fail_send(idx, c.token, &buf, &describe(c.result));
            return;
        }

        if slot.flags & slot_flags::FIXED != 0
            && c.result < 0
            && is_feature_unsupported(c.result)
            && slot.flags & slot_flags::RETRIED == 0
        {
            if self
                .backend
                .send_buffer(&buf, c.token, SendMode::Standard)
                .is_ok()
            {
                debug!("fixed send rejected, retried as standard");
                self.shared.pending.update_flags(idx, slot_flags::RETRIED);
                return;
            }
        }

        if c.result >= 0 {
            EngineStats::incr(&self.shared.stats.sends);
            EngineStats::add(&self.shared.stats.bytes_sent, c.result as u64);
            self.shared.pending.clear(idx);
            if let Err(e) = self.shared.pool.release(&buf) {
                warn!("send buffer release failed: {e}");
            }
            let tok = c.token;
            self.dispatch(|h| h.on_send_complete(tok));
        } else {
            self.fail_send(idx, c.token, &buf, &describe(c.result));
        }
    }

    /// The close body: mark closed, tell the handler, tear down the
    /// backend and the pool. After this no completion is dispatched.
    fn run_close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.shared.set_conn_state(ConnState::Closed);
        self.backend.set_connection_state(ConnState::Closed);
        self.dispatch(|h| h.on_closed());
        if let Err(e) = self.backend.close() {
            error!("backend close failed: {e}");
        }
        self.release_recv_buffer();
        let in_flight = self.shared.pending.occupied_count();
        if in_flight > 0 {
            debug!("closing with {in_flight} sends still in flight");
        }
        self.shared.pool.close();
    }

    fn dispatch<F: FnOnce(&mut dyn EventHandler)>(&mut self, f: F) {
        let handler = self.handler.as_mut();
        if let Err(p) = catch_unwind(AssertUnwindSafe(|| f(handler))) {
            log_handler_panic(p);
        }
    }
}

fn log_handler_panic(p: Box<dyn std::any::Any + Send>) {
    let msg = p
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| p.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".into());
    error!("event handler panicked: {msg}");
}

//! io_uring ring backend.
//!
//! Owns the submission/completion rings for one socket and its accepted
//! siblings. Requests are prepared into SQEs carrying the operation token
//! as user data; completions come back through a single drain loop that
//! translates CQE flags into the canonical completion flags.
//!
//! Optional features, all selected by configuration and all downgraded
//! with a logged warning when the kernel refuses them: submission-queue
//! polling (with CPU pin), a sparse registered-file table, registered
//! buffers from the pool, and a buffer ring feeding multishot receive.
//!
//! Backends created from accepted connections share the ring core without
//! owning it; closing a sibling releases only its socket and file slot.

use std::cell::RefCell;
use std::net::{SocketAddr, SocketAddrV4};
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use io_uring::{cqueue, opcode, squeue, types, IoUring, Probe};
use log::{debug, trace, warn};

use tcpx_core::backend::{
    BackendKind, CompletionSink, ConnState, Features, IoBackend, RecvMode, SendMode,
};
use tcpx_core::completion::comp_flags;
use tcpx_core::errno::CONNECTION_CLOSED;
use tcpx_core::{
    token, Buffer, Completion, EngineConfig, EngineError, EngineStats, Result, StatsSnapshot,
};

use crate::buf_ring::BufRing;
use crate::sock;

/// Slots in the sparse registered-file table.
const FILE_TABLE_SIZE: u32 = 1024;

/// Buffer group id for the buffer ring.
const BUF_GROUP_ID: u16 = 7;

/// Doubling spin budgets for submission-queue acquisition.
const SQ_RETRY_BUDGETS: [u32; 5] = [1_000, 2_000, 4_000, 8_000, 16_000];
/// Re-check the queue every this many spin iterations.
const SPIN_RECHECK: u32 = 100;

/// User data for link-timeout bookkeeping CQEs; never collides with real
/// tokens (sequences stay below bit 62).
const TIMEOUT_TOKEN: u64 = u64::MAX - 1;

fn timespec(d: Duration) -> types::Timespec {
    types::Timespec::new().sec(d.as_secs()).nsec(d.subsec_nanos())
}

/// State shared between a connection backend and its accepted siblings.
/// Everything here is driven by the poller thread only.
pub(crate) struct RingCore {
    // Field order matters: the ring (and with it every kernel
    // registration) must drop before the buffer ring's mappings.
    ring: IoUring,
    buf_ring: Option<BufRing>,
    sqpoll: bool,
    fixed_files: bool,
    free_file_slots: Vec<u32>,
    buffers_registered: bool,
    pending_sqes: u32,
    stats: Arc<EngineStats>,
}

impl RingCore {
    /// Spin until the submission queue has room for `need` entries.
    ///
    /// Submits the pending batch once per round, then spins with a
    /// doubling budget, re-syncing the queue every few iterations. Never
    /// sleeps; after the final budget the caller gets `QueueFull` as a
    /// recoverable backpressure signal.
    fn wait_for_room(&mut self, need: usize) -> Result<()> {
        if self.room() >= need {
            return Ok(());
        }
        for budget in SQ_RETRY_BUDGETS {
            match self.ring.submit() {
                Ok(_) => {
                    EngineStats::incr(&self.stats.total_syscalls);
                    self.pending_sqes = 0;
                }
                Err(ref e)
                    if e.raw_os_error() == Some(libc::EBUSY)
                        || e.raw_os_error() == Some(libc::EAGAIN) => {}
                Err(e) => return Err(EngineError::Os(e.raw_os_error().unwrap_or(-1))),
            }
            let mut spun = 0u32;
            while spun < budget {
                std::hint::spin_loop();
                spun += 1;
                if spun % SPIN_RECHECK == 0 && self.room() >= need {
                    return Ok(());
                }
            }
            if self.room() >= need {
                return Ok(());
            }
        }
        EngineStats::incr(&self.stats.queue_overflows);
        Err(EngineError::QueueFull)
    }

    fn room(&mut self) -> usize {
        let mut sq = self.ring.submission();
        sq.sync();
        sq.capacity() - sq.len()
    }

    /// Queue one SQE.
    ///
    /// # Safety contract
    ///
    /// Callers guarantee every pointer the entry references stays valid
    /// until its completion is reaped.
    fn push_sqe(&mut self, entry: &squeue::Entry) -> Result<()> {
        self.wait_for_room(1)?;
        // Safety: see above; room was just verified.
        unsafe {
            self.ring
                .submission()
                .push(entry)
                .map_err(|_| EngineError::QueueFull)?;
        }
        self.pending_sqes += 1;
        Ok(())
    }

    /// Queue a linked pair atomically; both entries or neither.
    fn push_pair(&mut self, first: &squeue::Entry, second: &squeue::Entry) -> Result<()> {
        self.wait_for_room(2)?;
        // Safety: same contract as push_sqe; two slots were verified.
        unsafe {
            let mut sq = self.ring.submission();
            sq.push(first).map_err(|_| EngineError::QueueFull)?;
            sq.push(second).map_err(|_| EngineError::QueueFull)?;
        }
        self.pending_sqes += 2;
        Ok(())
    }

    fn alloc_file_slot(&mut self, fd: RawFd) -> Option<u32> {
        if !self.fixed_files {
            return None;
        }
        let slot = self.free_file_slots.pop()?;
        match self.ring.submitter().register_files_update(slot, &[fd]) {
            Ok(_) => Some(slot),
            Err(e) => {
                warn!("fixed-file publish failed for fd {fd}: {e}");
                self.free_file_slots.push(slot);
                None
            }
        }
    }

    fn free_file_slot(&mut self, slot: u32) {
        let _ = self.ring.submitter().register_files_update(slot, &[-1]);
        self.free_file_slots.push(slot);
    }

    /// Drain ready CQEs into the sink, translating flags and normalizing
    /// results.
    fn drain(&mut self, sink: &mut CompletionSink<'_>) -> usize {
        let mut count = 0;
        let cq = self.ring.completion();
        for cqe in cq {
            let native = cqe.flags();
            let mut flags = 0u32;
            if cqueue::more(native) {
                flags |= comp_flags::MORE;
            }
            if cqueue::notif(native) {
                flags |= comp_flags::NOTIF;
            }
            if let Some(bid) = cqueue::buffer_select(native) {
                flags = Completion::flags_with_buffer(flags, bid);
            }
            let tok = cqe.user_data();
            if tok == TIMEOUT_TOKEN {
                // Link-timeout bookkeeping; the linked op reports the
                // outcome itself.
                continue;
            }
            let mut result = cqe.result() as i64;
            // A zero-byte receive is the peer's FIN.
            if token::is_recv(tok) && result == 0 && !cqueue::notif(native) {
                result = CONNECTION_CLOSED;
            }
            // A connect cancelled by its linked timeout timed out.
            if token::is_connect(tok) && result == -(libc::ECANCELED as i64) {
                result = -(libc::ETIMEDOUT as i64);
            }
            trace!("cqe token={tok:#x} result={result} flags={flags:#x}");
            sink(Completion::new(tok, result, flags));
            count += 1;
        }
        count
    }
}

/// Build the ring, walking the SQPOLL fallback ladder when requested.
fn build_ring(cfg: &EngineConfig) -> Result<(IoUring, bool)> {
    let depth = cfg.ring_depth.max(2).next_power_of_two();
    if cfg.submission_poll.enabled {
        let idle_ms = (cfg.submission_poll.idle_us / 1000).max(1);
        if cfg.submission_poll.cpu >= 0 {
            let attempt = IoUring::builder()
                .setup_sqpoll(idle_ms)
                .setup_sqpoll_cpu(cfg.submission_poll.cpu as u32)
                .build(depth);
            match attempt {
                Ok(ring) => return Ok((ring, true)),
                Err(e) => warn!("SQPOLL with CPU affinity rejected ({e}), retrying unpinned"),
            }
        }
        match IoUring::builder().setup_sqpoll(idle_ms).build(depth) {
            Ok(ring) => return Ok((ring, true)),
            Err(e) => warn!("SQPOLL rejected ({e}), falling back to plain submission"),
        }
    }
    let ring = IoUring::builder()
        .build(depth)
        .map_err(|e| EngineError::RingSetup(e.raw_os_error().unwrap_or(-1)))?;
    Ok((ring, false))
}

enum Target {
    Fd(RawFd),
    Fixed(u32),
}

pub struct RingBackend {
    core: Rc<RefCell<RingCore>>,
    owns_ring: bool,
    /// The one socket this backend drives: client stream or listener.
    fd: RawFd,
    fixed_slot: Option<u32>,
    state: ConnState,
    /// Keeps the sockaddr alive while a connect SQE references it.
    connect_addr: Option<Box<libc::sockaddr_in>>,
    /// Pre-allocated timespec the connect link-timeout points at.
    connect_timeout_ts: Box<types::Timespec>,
    /// Pre-allocated timespec for completion waits.
    wait_ts: types::Timespec,
    wait_timeout: Duration,
    closed: bool,
}

impl RingBackend {
    pub fn new(cfg: &EngineConfig, stats: Arc<EngineStats>) -> Result<Self> {
        let (ring, sqpoll) = build_ring(cfg)?;

        let mut probe = Probe::new();
        if let Err(e) = ring.submitter().register_probe(&mut probe) {
            debug!("opcode probe unavailable: {e}");
        }

        let fixed_files = match ring.submitter().register_files_sparse(FILE_TABLE_SIZE) {
            Ok(()) => true,
            Err(e) => {
                warn!("fixed-file table rejected ({e}), using raw fds");
                false
            }
        };

        let buf_ring = if cfg.buffer_mode == tcpx_core::BufferMode::BufferRing {
            if !probe.is_supported(opcode::RecvMulti::CODE) {
                warn!("multishot receive unsupported by this kernel, buffer ring disabled");
                None
            } else {
                let entries = cfg
                    .buffer_count
                    .next_power_of_two()
                    .clamp(1, u16::MAX as u32 / 2) as u16;
                match BufRing::new(&ring.submitter(), entries, cfg.buffer_size, BUF_GROUP_ID) {
                    Ok(br) => Some(br),
                    Err(e) => {
                        warn!("buffer ring registration failed ({e}), disabled");
                        None
                    }
                }
            }
        } else {
            None
        };

        let core = RingCore {
            ring,
            buf_ring,
            sqpoll,
            fixed_files,
            free_file_slots: (0..FILE_TABLE_SIZE).rev().collect(),
            buffers_registered: false,
            pending_sqes: 0,
            stats,
        };

        Ok(Self {
            core: Rc::new(RefCell::new(core)),
            owns_ring: true,
            fd: -1,
            fixed_slot: None,
            state: ConnState::Disconnected,
            connect_addr: None,
            connect_timeout_ts: Box::new(timespec(cfg.connection_timeout)),
            wait_ts: timespec(Duration::from_millis(1)),
            wait_timeout: Duration::from_millis(1),
            closed: false,
        })
    }

    fn target(&self) -> Target {
        match self.fixed_slot {
            Some(slot) => Target::Fixed(slot),
            None => Target::Fd(self.fd),
        }
    }

    fn ensure_socket(&self) -> Result<()> {
        if self.fd < 0 {
            return Err(EngineError::InvalidState("backend has no socket"));
        }
        Ok(())
    }

    /// Queue a linked recv→send over the same buffer: an echo turn in two
    /// SQEs. Only sound for fixed-size frames, since the send length is
    /// fixed at preparation time. `skip_send_cqe` suppresses the send's
    /// completion on success to halve completion traffic.
    pub fn push_linked_echo(
        &mut self,
        buf: &mut Buffer,
        frame_len: u32,
        recv_token: u64,
        send_token: u64,
        skip_send_cqe: bool,
    ) -> Result<()> {
        self.ensure_socket()?;
        let ptr = buf.as_mut_ptr();
        let recv = self
            .build_recv(ptr, frame_len)
            .flags(squeue::Flags::IO_LINK)
            .user_data(recv_token);
        let mut send = self.build_send(ptr, frame_len).user_data(send_token);
        if skip_send_cqe {
            send = send.flags(squeue::Flags::SKIP_SUCCESS);
        }
        self.core.borrow_mut().push_pair(&recv, &send)
    }

    /// Queue a linked send→recv: a request and the receive for its reply
    /// in one submission.
    pub fn push_request_response(
        &mut self,
        request: &Buffer,
        reply: &mut Buffer,
        send_token: u64,
        recv_token: u64,
    ) -> Result<()> {
        self.ensure_socket()?;
        let send = self
            .build_send(request.as_ptr(), request.len())
            .flags(squeue::Flags::IO_LINK)
            .user_data(send_token);
        let cap = reply.capacity();
        let recv = self.build_recv(reply.as_mut_ptr(), cap).user_data(recv_token);
        self.core.borrow_mut().push_pair(&send, &recv)
    }

    /// Concrete-typed sibling for an accepted socket. The trait's
    /// [`IoBackend::create_from_accepted`] boxes this; direct callers that
    /// need the linked compositions keep the concrete type.
    pub fn sibling_from_accepted(&mut self, handle: i64) -> Result<RingBackend> {
        let fd = RawFd::try_from(handle)
            .ok()
            .filter(|&fd| fd >= 0)
            .ok_or_else(|| EngineError::InvalidArgument(format!("bad accept handle {handle}")))?;
        if let Err(e) = sock::configure_client(fd) {
            debug!("accepted socket options: {e}");
        }
        let fixed_slot = self.core.borrow_mut().alloc_file_slot(fd);
        Ok(RingBackend {
            core: Rc::clone(&self.core),
            owns_ring: false,
            fd,
            fixed_slot,
            state: ConnState::Connected,
            connect_addr: None,
            connect_timeout_ts: self.connect_timeout_ts.clone(),
            wait_ts: self.wait_ts,
            wait_timeout: self.wait_timeout,
            closed: false,
        })
    }

    fn build_send(&self, ptr: *const u8, len: u32) -> squeue::Entry {
        match self.target() {
            Target::Fd(fd) => opcode::Send::new(types::Fd(fd), ptr, len).build(),
            Target::Fixed(i) => opcode::Send::new(types::Fixed(i), ptr, len).build(),
        }
    }

    fn build_recv(&self, ptr: *mut u8, len: u32) -> squeue::Entry {
        match self.target() {
            Target::Fd(fd) => opcode::Recv::new(types::Fd(fd), ptr, len).build(),
            Target::Fixed(i) => opcode::Recv::new(types::Fixed(i), ptr, len).build(),
        }
    }
}

impl IoBackend for RingBackend {
    fn register_buffers(&mut self, regions: &[(u64, usize)]) -> Result<()> {
        let mut core = self.core.borrow_mut();
        if core.buffers_registered {
            return Err(EngineError::InvalidState("buffers already registered"));
        }
        let iovecs: Vec<libc::iovec> = regions
            .iter()
            .map(|&(addr, len)| libc::iovec {
                iov_base: addr as *mut libc::c_void,
                iov_len: len,
            })
            .collect();
        // Safety: the regions belong to the pool's arena, which outlives
        // the ring (the transport holds both until close).
        unsafe {
            core.ring
                .submitter()
                .register_buffers(&iovecs)
                .map_err(|e| EngineError::Registration(e.raw_os_error().unwrap_or(-1)))?;
        }
        core.buffers_registered = true;
        debug!("registered {} pool buffers with the kernel", iovecs.len());
        Ok(())
    }

    fn connect(&mut self, addr: SocketAddrV4, token: u64) -> Result<()> {
        if matches!(self.state, ConnState::Connecting | ConnState::Connected) {
            return Err(EngineError::InvalidState("connect already in flight"));
        }
        if self.fd >= 0 {
            // A previous attempt failed; start from a fresh socket.
            if let Some(slot) = self.fixed_slot.take() {
                self.core.borrow_mut().free_file_slot(slot);
            }
            sock::close_fd(self.fd);
            self.fd = -1;
        }
        let fd = sock::client_socket()?;
        self.fd = fd;
        self.fixed_slot = self.core.borrow_mut().alloc_file_slot(fd);

        self.connect_addr = Some(Box::new(sock::sockaddr_in(addr)));
        let sa = self.connect_addr.as_deref().unwrap();
        let sa_ptr = sa as *const libc::sockaddr_in as *const libc::sockaddr;
        let sa_len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;

        let connect = match self.target() {
            Target::Fd(fd) => opcode::Connect::new(types::Fd(fd), sa_ptr, sa_len).build(),
            Target::Fixed(i) => opcode::Connect::new(types::Fixed(i), sa_ptr, sa_len).build(),
        }
        .flags(squeue::Flags::IO_LINK)
        .user_data(token);

        let timeout = opcode::LinkTimeout::new(&*self.connect_timeout_ts)
            .build()
            .user_data(TIMEOUT_TOKEN);

        self.core.borrow_mut().push_pair(&connect, &timeout)
    }

    fn bind(&mut self, addr: SocketAddrV4) -> Result<()> {
        if self.fd >= 0 {
            return Err(EngineError::InvalidState("backend already has a socket"));
        }
        let fd = sock::listener_socket(addr)?;
        self.fd = fd;
        self.fixed_slot = self.core.borrow_mut().alloc_file_slot(fd);
        debug!("ring backend listening on {addr}");
        Ok(())
    }

    fn accept(&mut self, token: u64) -> Result<()> {
        self.ensure_socket()?;
        let sqe = match self.target() {
            Target::Fd(fd) => {
                opcode::Accept::new(types::Fd(fd), std::ptr::null_mut(), std::ptr::null_mut())
                    .build()
            }
            Target::Fixed(i) => {
                opcode::Accept::new(types::Fixed(i), std::ptr::null_mut(), std::ptr::null_mut())
                    .build()
            }
        }
        .user_data(token);
        self.core.borrow_mut().push_sqe(&sqe)
    }

    fn accept_multishot(&mut self, token: u64) -> Result<()> {
        self.ensure_socket()?;
        let sqe = match self.target() {
            Target::Fd(fd) => opcode::AcceptMulti::new(types::Fd(fd)).build(),
            Target::Fixed(i) => opcode::AcceptMulti::new(types::Fixed(i)).build(),
        }
        .user_data(token);
        self.core.borrow_mut().push_sqe(&sqe)
    }

    fn send_buffer(&mut self, buf: &Buffer, token: u64, mode: SendMode) -> Result<()> {
        self.ensure_socket()?;
        let ptr = buf.as_ptr();
        let len = buf.len();
        let sqe = match mode {
            SendMode::Standard => self.build_send(ptr, len),
            SendMode::ZeroCopy => match self.target() {
                Target::Fd(fd) => opcode::SendZc::new(types::Fd(fd), ptr, len).build(),
                Target::Fixed(i) => opcode::SendZc::new(types::Fixed(i), ptr, len).build(),
            },
            SendMode::Fixed => {
                if buf.reg_index() < 0 {
                    return Err(EngineError::InvalidState(
                        "fixed send from an unregistered buffer",
                    ));
                }
                let idx = buf.reg_index() as u16;
                match self.target() {
                    Target::Fd(fd) => opcode::WriteFixed::new(types::Fd(fd), ptr, len, idx)
                        .offset(0)
                        .build(),
                    Target::Fixed(i) => opcode::WriteFixed::new(types::Fixed(i), ptr, len, idx)
                        .offset(0)
                        .build(),
                }
            }
        }
        .user_data(token);
        self.core.borrow_mut().push_sqe(&sqe)
    }

    unsafe fn send_raw(&mut self, ptr: *const u8, len: usize, token: u64) -> Result<()> {
        self.ensure_socket()?;
        let sqe = self.build_send(ptr, len as u32).user_data(token);
        self.core.borrow_mut().push_sqe(&sqe)
    }

    fn recv_buffer(&mut self, buf: &Buffer, token: u64, mode: RecvMode) -> Result<()> {
        self.ensure_socket()?;
        let mut b = *buf;
        let ptr = b.as_mut_ptr();
        let cap = b.capacity();
        let sqe = match mode {
            RecvMode::Standard => self.build_recv(ptr, cap),
            RecvMode::Fixed => {
                if b.reg_index() < 0 {
                    return Err(EngineError::InvalidState(
                        "fixed recv into an unregistered buffer",
                    ));
                }
                let idx = b.reg_index() as u16;
                match self.target() {
                    Target::Fd(fd) => opcode::ReadFixed::new(types::Fd(fd), ptr, cap, idx)
                        .offset(0)
                        .build(),
                    Target::Fixed(i) => opcode::ReadFixed::new(types::Fixed(i), ptr, cap, idx)
                        .offset(0)
                        .build(),
                }
            }
        }
        .user_data(token);
        self.core.borrow_mut().push_sqe(&sqe)
    }

    unsafe fn recv_raw(&mut self, ptr: *mut u8, len: usize, token: u64) -> Result<()> {
        self.ensure_socket()?;
        let sqe = self.build_recv(ptr, len as u32).user_data(token);
        self.core.borrow_mut().push_sqe(&sqe)
    }

    fn recv_multishot(&mut self, token: u64) -> Result<()> {
        self.ensure_socket()?;
        let mut core = self.core.borrow_mut();
        let group = match core.buf_ring.as_ref() {
            Some(br) => br.group_id(),
            None => {
                return Err(EngineError::Unsupported(
                    "buffer ring not initialized on this ring",
                ))
            }
        };
        let sqe = match self.target() {
            Target::Fd(fd) => opcode::RecvMulti::new(types::Fd(fd), group).build(),
            Target::Fixed(i) => opcode::RecvMulti::new(types::Fixed(i), group).build(),
        }
        .user_data(token);
        core.push_sqe(&sqe)
    }

    fn recycle_buffer(&mut self, bid: u16) -> Result<()> {
        let mut core = self.core.borrow_mut();
        match core.buf_ring.as_mut() {
            Some(br) => br.recycle(bid),
            None => Err(EngineError::Unsupported("no buffer ring to recycle into")),
        }
    }

    fn selected_buffer(&self, bid: u16, len: usize) -> Option<&[u8]> {
        let core = self.core.borrow();
        let chunk = core.buf_ring.as_ref()?.chunk(bid, len)?;
        let (ptr, n) = (chunk.as_ptr(), chunk.len());
        drop(core);
        // Safety: the chunk storage is a stable mapping owned by the
        // shared core, which this backend keeps alive; the kernel will not
        // touch the chunk again until it is recycled.
        Some(unsafe { std::slice::from_raw_parts(ptr, n) })
    }

    fn submit(&mut self) -> Result<usize> {
        let mut core = self.core.borrow_mut();
        if core.pending_sqes == 0 {
            return Ok(0);
        }
        let queued = core.pending_sqes;
        let submitted = core
            .ring
            .submit()
            .map_err(|e| EngineError::Os(e.raw_os_error().unwrap_or(-1)))?;
        core.pending_sqes = 0;
        EngineStats::incr(&core.stats.batch_submissions);
        if !core.sqpoll {
            EngineStats::incr(&core.stats.total_syscalls);
        }
        trace!("submitted batch of {queued} ({submitted} accepted)");
        Ok(submitted)
    }

    fn poll(&mut self, sink: &mut CompletionSink<'_>) -> Result<usize> {
        Ok(self.core.borrow_mut().drain(sink))
    }

    fn wait(&mut self, timeout: Duration, sink: &mut CompletionSink<'_>) -> Result<usize> {
        if timeout != self.wait_timeout {
            self.wait_ts = timespec(timeout);
            self.wait_timeout = timeout;
        }
        let mut core = self.core.borrow_mut();
        let args = types::SubmitArgs::new().timespec(&self.wait_ts);
        match core.ring.submitter().submit_with_args(1, &args) {
            Ok(_) => {
                core.pending_sqes = 0;
                EngineStats::incr(&core.stats.total_syscalls);
            }
            Err(ref e)
                if matches!(
                    e.raw_os_error(),
                    Some(libc::ETIME) | Some(libc::EBUSY) | Some(libc::EINTR)
                ) => {}
            Err(e) => return Err(EngineError::Os(e.raw_os_error().unwrap_or(-1))),
        }
        Ok(core.drain(sink))
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Uring
    }

    fn features(&self) -> Features {
        Features {
            registered_buffers: true,
            batch_submission: true,
            tls: false,
        }
    }

    fn stats(&self) -> StatsSnapshot {
        self.core.borrow().stats.snapshot()
    }

    fn connection_state(&self) -> ConnState {
        self.state
    }

    fn set_connection_state(&mut self, state: ConnState) {
        self.state = state;
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        sock::local_addr(self.fd)
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        sock::peer_addr(self.fd)
    }

    fn create_from_accepted(&mut self, handle: i64) -> Result<Box<dyn IoBackend>> {
        Ok(Box::new(self.sibling_from_accepted(handle)?))
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        {
            let mut core = self.core.borrow_mut();
            if let Some(slot) = self.fixed_slot.take() {
                core.free_file_slot(slot);
            }
            if self.owns_ring {
                // Orderly drain so in-flight completions are not leaked
                // into the next user of the CQ memory.
                let cq = core.ring.completion();
                let dropped = cq.count();
                if dropped > 0 {
                    debug!("dropped {dropped} completions at ring close");
                }
            }
        }
        sock::close_fd(self.fd);
        self.fd = -1;
        self.state = ConnState::Closed;
        Ok(())
    }
}

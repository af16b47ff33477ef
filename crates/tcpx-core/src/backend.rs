//! I/O backend abstraction.
//!
//! An `IoBackend` owns one socket's asynchronous I/O: it prepares native
//! requests, submits them (batched where the backend supports it), and maps
//! native completions back to the 64-bit tokens they were submitted under.
//!
//! # Implementors
//!
//! - `RingBackend` (tcpx-backend, Linux): batched io_uring submission with
//!   optional SQPOLL, registered files/buffers, buffer-ring multishot
//!   receive, and zero-copy send.
//! - `ReactorBackend` (tcpx-backend, portable): readiness selector loop.
//!   No batching, no registration; completions carry zero flags.
//!
//! Reserved kinds (XDP, DPDK) exist only as enum values; constructing them
//! fails with `Unsupported`.
//!
//! **Contract:** no method on this trait blocks except [`IoBackend::wait`],
//! which blocks at most for the given timeout. Backends are created and
//! driven by the poller thread only; they are not `Send` and need no
//! internal locking.

use std::net::{SocketAddr, SocketAddrV4};
use std::time::Duration;

use crate::buffer::Buffer;
use crate::completion::Completion;
use crate::error::Result;
use crate::stats::StatsSnapshot;

/// Which engine drives the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// io_uring submission/completion rings.
    Uring,
    /// Portable readiness selector.
    Reactor,
    /// Reserved; rejected at construction.
    Xdp,
    /// Reserved; rejected at construction.
    Dpdk,
}

/// Connection lifecycle. Only the poller thread moves a backend through
/// these states after initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Closing = 3,
    Closed = 4,
}

/// Capability flags the runtime keys its path selection on.
#[derive(Debug, Clone, Copy)]
pub struct Features {
    pub registered_buffers: bool,
    pub batch_submission: bool,
    pub tls: bool,
}

/// How a send is submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    Standard,
    /// Registered-buffer opcode; requires `register_buffers`.
    Fixed,
    /// Two-phase zero-copy send: a regular completion, then a notification
    /// (flagged `NOTIF`) once the kernel is done with the source buffer.
    ZeroCopy,
}

/// How a receive is submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvMode {
    Standard,
    /// Registered-buffer opcode; requires `register_buffers`.
    Fixed,
}

/// Per-completion sink. The ring backend produces meaningful flags
/// (multishot, zero-copy notification, buffer-ring selection); consumers
/// that only need `(token, result)` ignore the rest.
pub type CompletionSink<'a> = dyn FnMut(Completion) + 'a;

pub trait IoBackend {
    /// Publish the pool's regions to the kernel as pinned buffers, making
    /// [`SendMode::Fixed`] / [`RecvMode::Fixed`] legal. `regions[i]` must
    /// be the region of the buffer whose pool index is `i`.
    fn register_buffers(&mut self, regions: &[(u64, usize)]) -> Result<()>;

    /// Prepare an async connect to `addr` under `token`. The completion
    /// result is 0 on success or a negative errno.
    fn connect(&mut self, addr: SocketAddrV4, token: u64) -> Result<()>;

    /// Bind and listen (server side).
    fn bind(&mut self, addr: SocketAddrV4) -> Result<()>;

    /// Prepare an async accept under `token`. The completion result is an
    /// opaque non-negative handle for [`IoBackend::create_from_accepted`].
    fn accept(&mut self, token: u64) -> Result<()>;

    /// Arm a multishot accept: one submission yields a stream of accept
    /// completions under `token`, each carrying the `MORE` flag while the
    /// kernel keeps the operation armed; its absence means the stream
    /// ended and the caller must re-arm. Backends without multishot
    /// support return `Unsupported`, and callers fall back to
    /// [`IoBackend::accept`].
    fn accept_multishot(&mut self, token: u64) -> Result<()>;

    /// Prepare a send of `buf`'s payload under `token`.
    fn send_buffer(&mut self, buf: &Buffer, token: u64, mode: SendMode) -> Result<()>;

    /// Prepare a send from raw memory the caller keeps alive until the
    /// completion for `token` is delivered.
    ///
    /// # Safety
    ///
    /// `ptr..ptr+len` must stay valid and unmodified until then.
    unsafe fn send_raw(&mut self, ptr: *const u8, len: usize, token: u64) -> Result<()>;

    /// Prepare a receive into `buf` under `token`.
    fn recv_buffer(&mut self, buf: &Buffer, token: u64, mode: RecvMode) -> Result<()>;

    /// Prepare a receive into raw memory; same validity contract as
    /// [`IoBackend::send_raw`].
    ///
    /// # Safety
    ///
    /// `ptr..ptr+len` must stay valid until the completion for `token`.
    unsafe fn recv_raw(&mut self, ptr: *mut u8, len: usize, token: u64) -> Result<()>;

    /// Arm a multishot receive that draws buffers from the backend's
    /// kernel-visible buffer ring. Completions carry the selected buffer
    /// id in their flags; [`IoBackend::recycle_buffer`] returns it.
    fn recv_multishot(&mut self, token: u64) -> Result<()>;

    /// Hand a kernel-selected buffer back to the buffer ring.
    fn recycle_buffer(&mut self, bid: u16) -> Result<()>;

    /// Borrow a kernel-selected buffer's bytes. Valid until the buffer is
    /// recycled.
    fn selected_buffer(&self, bid: u16, len: usize) -> Option<&[u8]>;

    /// Kick all prepared submissions to the kernel. Returns how many were
    /// submitted. A no-op (Ok(0)) when nothing is pending or when the
    /// kernel polls the queue itself.
    fn submit(&mut self) -> Result<usize>;

    /// Drain ready completions into `sink` without blocking. Returns the
    /// number drained.
    fn poll(&mut self, sink: &mut CompletionSink<'_>) -> Result<usize>;

    /// Like [`IoBackend::poll`], but waits up to `timeout` for the first
    /// completion.
    fn wait(&mut self, timeout: Duration, sink: &mut CompletionSink<'_>) -> Result<usize>;

    fn kind(&self) -> BackendKind;

    fn features(&self) -> Features;

    fn stats(&self) -> StatsSnapshot;

    fn connection_state(&self) -> ConnState;

    /// The poller records lifecycle transitions here; the backend itself
    /// only moves to `Closed` on [`IoBackend::close`].
    fn set_connection_state(&mut self, state: ConnState);

    fn local_addr(&self) -> Option<SocketAddr>;

    fn remote_addr(&self) -> Option<SocketAddr>;

    /// Build a sibling backend for an accepted connection. The sibling
    /// shares the submission machinery (ring, registered tables) without
    /// owning it; closing the sibling never tears the shared state down.
    /// Handles are one-shot.
    fn create_from_accepted(&mut self, handle: i64) -> Result<Box<dyn IoBackend>>;

    /// Release the socket and, for owning backends, the native engine.
    /// Idempotent.
    fn close(&mut self) -> Result<()>;
}

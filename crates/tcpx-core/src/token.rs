//! Operation token layout.
//!
//! Every submitted operation is tracked by an opaque 64-bit token, stored
//! verbatim in the backend's per-operation user data and echoed back in the
//! matching completion:
//!
//! ```text
//! bit 63: receive flag
//! bit 62: connect flag
//! bits 0..61: monotonic sequence, starting at 1
//! ```
//!
//! For plain sends, the low bits of the sequence double as the index into
//! the pending-send slot array (`sequence mod P`, P a power of two). Tokens
//! never repeat within a process; a zero token means "not set".

use std::sync::atomic::{AtomicU64, Ordering};

/// Marks a receive operation.
pub const RECV_FLAG: u64 = 1 << 63;
/// Marks a connect operation.
pub const CONNECT_FLAG: u64 = 1 << 62;
/// Mask selecting the sequence region.
pub const SEQ_MASK: u64 = (1 << 62) - 1;

/// The sequence region of a token.
#[inline]
pub fn sequence(token: u64) -> u64 {
    token & SEQ_MASK
}

#[inline]
pub fn is_recv(token: u64) -> bool {
    token & RECV_FLAG != 0
}

#[inline]
pub fn is_connect(token: u64) -> bool {
    token & CONNECT_FLAG != 0
}

/// Pending-send slot index for a send token. `slot_mask` is P - 1.
#[inline]
pub fn slot_index(token: u64, slot_mask: u64) -> usize {
    (sequence(token) & slot_mask) as usize
}

/// Monotonic token source, one per transport.
///
/// Padded to a cache line: application threads hammer this counter while
/// the poller writes its own state, and the two must not share a line.
#[repr(align(64))]
pub struct TokenCounter {
    seq: AtomicU64,
}

impl TokenCounter {
    /// Starts at 1 so that 0 can mean "not set".
    pub fn new() -> Self {
        Self { seq: AtomicU64::new(1) }
    }

    #[inline]
    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) & SEQ_MASK
    }

    /// Mint a send token (no type bits).
    #[inline]
    pub fn next_send(&self) -> u64 {
        self.next_seq()
    }

    /// Mint a receive token.
    #[inline]
    pub fn next_recv(&self) -> u64 {
        self.next_seq() | RECV_FLAG
    }

    /// Mint a connect token.
    #[inline]
    pub fn next_connect(&self) -> u64 {
        self.next_seq() | CONNECT_FLAG
    }
}

impl Default for TokenCounter {
    fn default() -> Self {
        Self::new()
    }
}

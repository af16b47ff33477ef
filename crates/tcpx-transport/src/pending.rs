//! Pending-send slot table.
//!
//! One entry per in-flight send, addressed by `token_seq mod P`. The thread
//! that enqueues a send claims the slot (CAS on the occupancy flag), fills
//! the record, and publishes the token last; from then on the poller is the
//! only reader and the only thread that clears it. A claim that finds the
//! slot occupied means the pending-send ring is full and is reported to the
//! caller as backpressure.
//!
//! The token doubles as the publication fence: producers store it with
//! release ordering after the record is written, and the poller loads it
//! with acquire ordering before touching the record. A completion whose
//! token does not match the slot's is stale (the slot was cleared and may
//! be mid-refill by a new producer) and is dropped without reading the
//! record at all. Tokens never repeat, so a match can only mean the record
//! is fully published and current.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tcpx_core::Buffer;

/// Slot mode tags.
pub(crate) mod slot_flags {
    /// Submitted (or to be submitted) as a zero-copy send.
    pub const ZERO_COPY: u8 = 1 << 0;
    /// Submitted as a fixed-buffer send.
    pub const FIXED: u8 = 1 << 1;
    /// Regular completion seen; the buffer waits for the notification.
    pub const AWAITING_NOTIF: u8 = 1 << 2;
    /// Fast path rejected once; resubmitted as a standard send.
    pub const RETRIED: u8 = 1 << 3;
}

#[derive(Clone, Copy)]
pub(crate) struct SlotRecord {
    pub buffer: Option<Buffer>,
    pub flags: u8,
}

impl SlotRecord {
    const EMPTY: Self = Self { buffer: None, flags: 0 };
}

struct PendingSlot {
    occupied: AtomicBool,
    /// The full token of the occupying send; 0 means "not published".
    token: AtomicU64,
    record: UnsafeCell<SlotRecord>,
}

// Safety: the record is written by the claiming producer before the token
// is published, and read or cleared only by the single poller thread after
// a successful token match.
unsafe impl Sync for PendingSlot {}

pub(crate) struct PendingTable {
    slots: Box<[PendingSlot]>,
    mask: u64,
}

impl PendingTable {
    pub fn new(size: u32) -> Self {
        assert!(size.is_power_of_two());
        let slots = (0..size)
            .map(|_| PendingSlot {
                occupied: AtomicBool::new(false),
                token: AtomicU64::new(0),
                record: UnsafeCell::new(SlotRecord::EMPTY),
            })
            .collect();
        Self { slots, mask: (size - 1) as u64 }
    }

    pub fn mask(&self) -> u64 {
        self.mask
    }

    /// Producer side: claim a slot. `false` means an earlier send with the
    /// same residue has not completed yet.
    pub fn claim(&self, idx: usize) -> bool {
        self.slots[idx]
            .occupied
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Producer side, between claim and enqueue: record the send and
    /// publish its token.
    pub fn fill(&self, idx: usize, buffer: Buffer, token: u64, flags: u8) {
        let slot = &self.slots[idx];
        // Safety: the caller holds the claim, so no other writer exists,
        // and no reader sees the record until the token store below.
        unsafe { *slot.record.get() = SlotRecord { buffer: Some(buffer), flags } };
        slot.token.store(token, Ordering::Release);
    }

    /// The published token of a slot, 0 if none.
    pub fn token(&self, idx: usize) -> u64 {
        self.slots[idx].token.load(Ordering::Acquire)
    }

    /// Poller side, after a token match: copy out the record.
    pub fn read(&self, idx: usize) -> SlotRecord {
        // Safety: single reader (the poller) and the publication fence has
        // been crossed via a matching token load.
        unsafe { *self.slots[idx].record.get() }
    }

    /// Poller side: rewrite a slot's flags (retry / notification phase).
    pub fn update_flags(&self, idx: usize, flags: u8) {
        // Safety: single writer (the poller) while occupied.
        unsafe { (*self.slots[idx].record.get()).flags = flags };
    }

    pub fn is_occupied(&self, idx: usize) -> bool {
        self.slots[idx].occupied.load(Ordering::Acquire)
    }

    /// Empty a slot and release its claim. Used by the poller on
    /// completion and by a producer undoing a failed enqueue. The token is
    /// unpublished first so a late completion can never match a
    /// half-cleared slot.
    pub fn clear(&self, idx: usize) {
        let slot = &self.slots[idx];
        slot.token.store(0, Ordering::Release);
        // Safety: the clearing thread owns the slot.
        unsafe { *slot.record.get() = SlotRecord::EMPTY };
        slot.occupied.store(false, Ordering::Release);
    }

    /// Occupied slots, for close-time accounting.
    pub fn occupied_count(&self) -> usize {
        self.slots.iter().filter(|s| s.occupied.load(Ordering::Acquire)).count()
    }
}

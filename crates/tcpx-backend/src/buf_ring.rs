//! Kernel-visible buffer ring for multishot receive.
//!
//! A power-of-two table of `io_uring_buf` descriptors shared with the
//! kernel, each pointing at one chunk of a separately mapped region. The
//! kernel picks a chunk for every multishot-receive completion and reports
//! its id in the CQE flags; after the payload has been consumed the chunk
//! is written back into the table and the shared tail advanced to hand it
//! to the kernel again.

use std::sync::atomic::{AtomicU16, Ordering};

use io_uring::types::BufRingEntry;
use io_uring::Submitter;
use tcpx_core::{EngineError, Result};

pub struct BufRing {
    /// The descriptor table shared with the kernel.
    ring: *mut BufRingEntry,
    ring_len: usize,
    /// Chunk storage, `entries * chunk_size` bytes.
    chunks: *mut u8,
    chunks_len: usize,
    entries: u16,
    chunk_size: u32,
    group_id: u16,
    /// Next unpublished descriptor slot.
    local_tail: u16,
}

fn anon_map(len: usize) -> Result<*mut u8> {
    // Safety: anonymous shared mapping, length > 0.
    let addr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_ANONYMOUS | libc::MAP_SHARED | libc::MAP_POPULATE,
            -1,
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        return Err(EngineError::ResourceExhausted("buffer ring mmap failed"));
    }
    Ok(addr as *mut u8)
}

impl BufRing {
    /// Map, fill, and register a buffer ring of `entries` chunks of
    /// `chunk_size` bytes under `group_id`.
    pub fn new(
        submitter: &Submitter<'_>,
        entries: u16,
        chunk_size: u32,
        group_id: u16,
    ) -> Result<Self> {
        assert!(entries.is_power_of_two());
        let ring_len = entries as usize * std::mem::size_of::<BufRingEntry>();
        let chunks_len = entries as usize * chunk_size as usize;

        let ring = anon_map(ring_len)? as *mut BufRingEntry;
        let chunks = match anon_map(chunks_len) {
            Ok(p) => p,
            Err(e) => {
                // Safety: we just mapped ring with ring_len.
                unsafe { libc::munmap(ring as *mut libc::c_void, ring_len) };
                return Err(e);
            }
        };

        let mut this = Self {
            ring,
            ring_len,
            chunks,
            chunks_len,
            entries,
            chunk_size,
            group_id,
            local_tail: 0,
        };

        for bid in 0..entries {
            this.write_descriptor(bid);
        }

        // Safety: the descriptor table is mapped, initialized, and stays
        // alive for as long as the registration (unregistered on drop).
        if let Err(e) =
            unsafe { submitter.register_buf_ring(ring as u64, entries, group_id) }
        {
            this.unmap();
            return Err(EngineError::Registration(e.raw_os_error().unwrap_or(-1)));
        }
        this.publish();
        Ok(this)
    }

    pub fn group_id(&self) -> u16 {
        self.group_id
    }

    /// Write chunk `bid`'s descriptor at the next tail slot.
    fn write_descriptor(&mut self, bid: u16) {
        let index = (self.local_tail & (self.entries - 1)) as usize;
        // Safety: index < entries; we own the mapping.
        let entry = unsafe { &mut *self.ring.add(index) };
        let addr = unsafe { self.chunks.add(bid as usize * self.chunk_size as usize) };
        entry.set_addr(addr as u64);
        entry.set_len(self.chunk_size);
        entry.set_bid(bid);
        self.local_tail = self.local_tail.wrapping_add(1);
    }

    /// Make descriptors written so far visible to the kernel.
    fn publish(&self) {
        // Safety: the tail word lives inside the first descriptor slot,
        // which is mapped shared with the kernel.
        unsafe {
            let tail = BufRingEntry::tail(self.ring as *const BufRingEntry) as *const AtomicU16;
            (*tail).store(self.local_tail, Ordering::Release);
        }
    }

    /// Borrow `len` bytes of the kernel-selected chunk `bid`.
    pub fn chunk(&self, bid: u16, len: usize) -> Option<&[u8]> {
        if bid >= self.entries || len > self.chunk_size as usize {
            return None;
        }
        // Safety: the chunk is ours until it is recycled.
        Some(unsafe {
            std::slice::from_raw_parts(
                self.chunks.add(bid as usize * self.chunk_size as usize),
                len,
            )
        })
    }

    /// Hand chunk `bid` back to the kernel.
    pub fn recycle(&mut self, bid: u16) -> Result<()> {
        if bid >= self.entries {
            return Err(EngineError::InvalidArgument(format!(
                "buffer ring id {bid} out of range"
            )));
        }
        self.write_descriptor(bid);
        self.publish();
        Ok(())
    }

    fn unmap(&mut self) {
        // Safety: unmapping exactly what new() mapped.
        unsafe {
            if !self.ring.is_null() {
                libc::munmap(self.ring as *mut libc::c_void, self.ring_len);
                self.ring = std::ptr::null_mut();
            }
            if !self.chunks.is_null() {
                libc::munmap(self.chunks as *mut libc::c_void, self.chunks_len);
                self.chunks = std::ptr::null_mut();
            }
        }
    }
}

impl Drop for BufRing {
    fn drop(&mut self) {
        // The ring registration dies with the io_uring fd; the owning
        // backend drops the ring before this mapping goes away.
        self.unmap();
    }
}

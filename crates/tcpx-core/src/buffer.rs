//! Pool buffer handle.
//!
//! A [`Buffer`] is a small copyable handle onto one fixed-capacity,
//! page-aligned region of a pool's arena. The pool owns the memory and the
//! reference counts; the handle carries the cursor state (position, limit,
//! payload length) and the user token, which travel with it through the
//! command queue.
//!
//! While the buffer's reference count is above zero the pointed-to region
//! is valid and stable; that is what lets the kernel hold the address
//! across a zero-copy send until its notification arrives.

/// Registration index meaning "not registered with the kernel".
pub const UNREGISTERED: i16 = -1;

#[derive(Debug, Clone, Copy)]
pub struct Buffer {
    ptr: *mut u8,
    capacity: u32,
    index: u32,
    reg_index: i16,
    position: u32,
    limit: u32,
    len: u32,
    token: u64,
}

// Safety: the handle is a pointer plus metadata; the pool's reference
// counts govern the lifetime of the pointed-to arena region.
unsafe impl Send for Buffer {}

impl Buffer {
    /// Build a fresh handle over an arena region. Called by the pool on
    /// acquire; position 0, limit = capacity, empty payload, unset token.
    pub fn new(ptr: *mut u8, capacity: u32, index: u32, reg_index: i16) -> Self {
        debug_assert!(capacity > 0);
        Self {
            ptr,
            capacity,
            index,
            reg_index,
            position: 0,
            limit: capacity,
            len: 0,
            token: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Ordinal position within the pool; identity for the free list and
    /// the structure-of-arrays metadata.
    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Kernel registration index, [`UNREGISTERED`] when the pool has not
    /// been published to the kernel.
    #[inline]
    pub fn reg_index(&self) -> i16 {
        self.reg_index
    }

    #[inline]
    pub fn position(&self) -> u32 {
        self.position
    }

    pub fn set_position(&mut self, position: u32) {
        assert!(position <= self.limit, "position past limit");
        self.position = position;
    }

    #[inline]
    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn set_limit(&mut self, limit: u32) {
        assert!(limit <= self.capacity, "limit past capacity");
        self.limit = limit;
        if self.position > limit {
            self.position = limit;
        }
    }

    /// Payload size.
    #[inline]
    pub fn len(&self) -> u32 {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn set_len(&mut self, len: u32) {
        assert!(len <= self.capacity, "payload larger than capacity");
        self.len = len;
    }

    /// User-settable correlation token (0 = unset).
    #[inline]
    pub fn token(&self) -> u64 {
        self.token
    }

    pub fn set_token(&mut self, token: u64) {
        self.token = token;
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr
    }

    /// Copy `data` into the buffer starting at the current position and
    /// advance it. The payload length grows to cover the written region.
    pub fn write(&mut self, data: &[u8]) -> crate::Result<()> {
        let end = self.position as usize + data.len();
        if end > self.limit as usize {
            return Err(crate::EngineError::InvalidArgument(format!(
                "write of {} bytes exceeds buffer limit {}",
                data.len(),
                self.limit
            )));
        }
        // Safety: the range is within the arena region this handle covers
        // and the caller holds a reference (count >= 1).
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.ptr.add(self.position as usize),
                data.len(),
            );
        }
        self.position = end as u32;
        if self.len < end as u32 {
            self.len = end as u32;
        }
        Ok(())
    }

    /// View of the payload, `0..len`.
    ///
    /// # Safety contract
    ///
    /// The view is valid only while the caller's reference is held.
    pub fn payload(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len as usize) }
    }

    /// View of an arbitrary prefix, `0..n`. Used when a completion reports
    /// how many bytes the kernel actually transferred.
    pub fn prefix(&self, n: usize) -> &[u8] {
        assert!(n <= self.capacity as usize);
        unsafe { std::slice::from_raw_parts(self.ptr, n) }
    }

    /// Reset cursors for reuse: position 0, limit = capacity, empty
    /// payload, unset token.
    pub fn reset(&mut self) {
        self.position = 0;
        self.limit = self.capacity;
        self.len = 0;
        self.token = 0;
    }
}

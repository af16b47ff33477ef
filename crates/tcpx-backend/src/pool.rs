//! Registered buffer pool.
//!
//! A fixed number of fixed-size buffers carved out of one contiguous,
//! page-aligned arena. Reference counts live in a dense structure-of-arrays
//! so the hot acquire/release path touches one cache line per buffer, and
//! the free list is a lock-free queue of pool indices. The pool is the only
//! mutable resource shared between application threads and the poller, and
//! every mutation goes through an atomic.
//!
//! Zero-copy sends rely on the count staying above zero until the kernel's
//! notification arrives; the arena itself is only unmapped once the last
//! `Arc<BufferPool>` is dropped, so a straggling notification can never
//! touch unmapped memory.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_queue::ArrayQueue;
use tcpx_core::buffer::UNREGISTERED;
use tcpx_core::{Buffer, EngineError, Result};

/// How long a blocked `acquire` parks between free-list checks.
const ACQUIRE_PARK: Duration = Duration::from_micros(50);

pub struct BufferPool {
    arena: *mut u8,
    arena_len: usize,
    /// Distance between buffer starts; `buffer_size` rounded up to a page
    /// so every buffer begins page-aligned.
    stride: usize,
    buffer_size: u32,
    count: u32,
    /// Per-index reference counts (structure-of-arrays).
    refcounts: Box<[AtomicU32]>,
    /// Free indices. Cardinality always equals the number of buffers with
    /// a zero reference count.
    free: ArrayQueue<u32>,
    closed: AtomicBool,
    registered: AtomicBool,
}

// Safety: the arena pointer is only dereferenced through Buffer handles
// whose validity the reference counts govern; all pool metadata is atomic.
unsafe impl Send for BufferPool {}
unsafe impl Sync for BufferPool {}

fn page_size() -> usize {
    // Safety: sysconf with a valid name has no preconditions.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

impl BufferPool {
    /// Allocate `count` buffers of `size` bytes as one anonymous mapping.
    pub fn new(count: u32, size: u32) -> Result<Self> {
        if count == 0 || size == 0 {
            return Err(EngineError::InvalidArgument(
                "buffer pool needs a non-zero count and size".into(),
            ));
        }
        let page = page_size();
        let stride = (size as usize).div_ceil(page) * page;
        let arena_len = stride * count as usize;

        // Safety: anonymous private mapping, length > 0.
        let arena = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                arena_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if arena == libc::MAP_FAILED {
            return Err(EngineError::ResourceExhausted("buffer arena mmap failed"));
        }

        let refcounts: Box<[AtomicU32]> =
            (0..count).map(|_| AtomicU32::new(0)).collect();
        let free = ArrayQueue::new(count as usize);
        for i in 0..count {
            let _ = free.push(i);
        }

        Ok(Self {
            arena: arena as *mut u8,
            arena_len,
            stride,
            buffer_size: size,
            count,
            refcounts,
            free,
            closed: AtomicBool::new(false),
            registered: AtomicBool::new(false),
        })
    }

    /// Number of buffers in the pool.
    pub fn capacity(&self) -> u32 {
        self.count
    }

    /// Capacity of each buffer in bytes.
    pub fn buffer_size(&self) -> u32 {
        self.buffer_size
    }

    /// Buffers currently free.
    pub fn available(&self) -> u32 {
        self.free.len() as u32
    }

    /// Buffers currently held by callers (or the kernel).
    pub fn in_use(&self) -> u32 {
        self.count - self.available()
    }

    fn buffer_at(&self, idx: u32) -> Buffer {
        let reg = if self.registered.load(Ordering::Relaxed) {
            idx as i16
        } else {
            UNREGISTERED
        };
        // Safety: idx < count, so the offset stays inside the arena.
        let ptr = unsafe { self.arena.add(idx as usize * self.stride) };
        Buffer::new(ptr, self.buffer_size, idx, reg)
    }

    /// Claim a free buffer without blocking. `Ok(None)` when none are free.
    pub fn try_acquire(&self) -> Result<Option<Buffer>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::InvalidState("buffer pool closed"));
        }
        let Some(idx) = self.free.pop() else {
            return Ok(None);
        };
        // The free list only holds indices with a zero count, so this claim
        // must succeed; anything else means the accounting is corrupt.
        let prev = self.refcounts[idx as usize]
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire);
        debug_assert!(prev.is_ok(), "free-list index {} had a live refcount", idx);
        Ok(Some(self.buffer_at(idx)))
    }

    /// Claim a free buffer, parking until one frees up. Fails once the pool
    /// is closed.
    pub fn acquire(&self) -> Result<Buffer> {
        loop {
            if let Some(buf) = self.try_acquire()? {
                return Ok(buf);
            }
            thread::park_timeout(ACQUIRE_PARK);
        }
    }

    /// Drop one reference. The final drop resets the buffer and returns its
    /// index to the free list. Releasing a dead buffer is a programming
    /// error and is reported rather than corrupting the count.
    pub fn release(&self, buf: &Buffer) -> Result<()> {
        self.release_index(buf.index())
    }

    pub fn release_index(&self, idx: u32) -> Result<()> {
        let counter = &self.refcounts[idx as usize];
        let mut cur = counter.load(Ordering::Acquire);
        loop {
            if cur == 0 {
                return Err(EngineError::InvalidState("double release of pool buffer"));
            }
            match counter.compare_exchange_weak(
                cur,
                cur - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }
        if cur == 1 {
            let _ = self.free.push(idx);
        }
        Ok(())
    }

    /// Add a reference. Fails on a dead buffer (count already zero).
    pub fn retain(&self, buf: &Buffer) -> Result<()> {
        let counter = &self.refcounts[buf.index() as usize];
        let mut cur = counter.load(Ordering::Acquire);
        loop {
            if cur == 0 {
                return Err(EngineError::InvalidState("retain of released pool buffer"));
            }
            match counter.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => cur = actual,
            }
        }
    }

    /// Current reference count of a buffer.
    pub fn refcount(&self, idx: u32) -> u32 {
        self.refcounts[idx as usize].load(Ordering::Acquire)
    }

    /// The (address, length) regions in index order, for kernel
    /// registration.
    pub fn regions(&self) -> Vec<(u64, usize)> {
        (0..self.count)
            .map(|i| {
                let ptr = unsafe { self.arena.add(i as usize * self.stride) };
                (ptr as u64, self.buffer_size as usize)
            })
            .collect()
    }

    /// Record that the regions are pinned with the kernel; buffers handed
    /// out from now on carry their registration index.
    pub fn mark_registered(&self) {
        self.registered.store(true, Ordering::Release);
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop handing out buffers and drain the free list. The arena is
    /// unmapped when the pool itself drops.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        while self.free.pop().is_some() {}
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        if !self.arena.is_null() {
            // Safety: arena/arena_len are the exact mapping from new().
            unsafe {
                libc::munmap(self.arena as *mut libc::c_void, self.arena_len);
            }
            self.arena = std::ptr::null_mut();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn accounting_invariant_holds() {
        let pool = BufferPool::new(4, 1024).unwrap();
        assert_eq!(pool.available(), 4);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_eq!(pool.in_use() + pool.available(), 4);
        pool.release(&a).unwrap();
        pool.release(&b).unwrap();
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn acquired_buffers_start_clean() {
        let pool = BufferPool::new(2, 1024).unwrap();
        let mut a = pool.acquire().unwrap();
        a.write(&[1, 2, 3]).unwrap();
        a.set_token(9);
        let idx = a.index();
        pool.release(&a).unwrap();
        let b = pool.acquire().unwrap();
        // Same index comes back with reset cursors and token.
        if b.index() == idx {
            assert_eq!(b.position(), 0);
            assert_eq!(b.len(), 0);
            assert_eq!(b.token(), 0);
        }
        pool.release(&b).unwrap();
    }

    #[test]
    fn double_release_is_detected() {
        let pool = BufferPool::new(2, 512).unwrap();
        let a = pool.acquire().unwrap();
        pool.release(&a).unwrap();
        assert!(matches!(
            pool.release(&a),
            Err(EngineError::InvalidState(_))
        ));
        // Accounting untouched by the failed release.
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn retain_release_preserves_count() {
        let pool = BufferPool::new(2, 512).unwrap();
        let a = pool.acquire().unwrap();
        pool.retain(&a).unwrap();
        assert_eq!(pool.refcount(a.index()), 2);
        pool.release(&a).unwrap();
        assert_eq!(pool.refcount(a.index()), 1);
        pool.release(&a).unwrap();
        assert_eq!(pool.refcount(a.index()), 0);
        assert!(pool.retain(&a).is_err());
    }

    #[test]
    fn exhaustion_and_recovery() {
        let pool = Arc::new(BufferPool::new(4, 512).unwrap());
        let held: Vec<_> = (0..4).map(|_| pool.acquire().unwrap()).collect();
        assert_eq!(pool.available(), 0);
        assert!(pool.try_acquire().unwrap().is_none());

        // Block one thread on acquire, free a buffer elsewhere, and check
        // the blocked thread gets it within bounded time.
        let p = Arc::clone(&pool);
        let waiter = std::thread::spawn(move || {
            let start = Instant::now();
            let buf = p.acquire().unwrap();
            (start.elapsed(), buf.index())
        });
        std::thread::sleep(Duration::from_millis(20));
        pool.release(&held[2]).unwrap();
        let (elapsed, idx) = waiter.join().unwrap();
        assert_eq!(idx, held[2].index());
        assert!(elapsed < Duration::from_secs(1));

        pool.release_index(idx).unwrap();
        for (i, b) in held.iter().enumerate() {
            if i != 2 {
                pool.release(b).unwrap();
            }
        }
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn closed_pool_rejects_acquire() {
        let pool = BufferPool::new(2, 512).unwrap();
        pool.close();
        assert!(matches!(
            pool.acquire(),
            Err(EngineError::InvalidState(_))
        ));
        assert!(pool.try_acquire().is_err());
    }

    #[test]
    fn close_unblocks_a_parked_acquire() {
        let pool = Arc::new(BufferPool::new(1, 512).unwrap());
        let a = pool.acquire().unwrap();
        let p = Arc::clone(&pool);
        let waiter = std::thread::spawn(move || p.acquire());
        std::thread::sleep(Duration::from_millis(20));
        pool.close();
        assert!(waiter.join().unwrap().is_err());
        drop(a);
    }

    #[test]
    fn regions_are_page_aligned_and_disjoint() {
        let pool = BufferPool::new(4, 1000).unwrap();
        let page = page_size() as u64;
        let regions = pool.regions();
        for w in regions.windows(2) {
            assert_eq!(w[0].0 % page, 0);
            assert!(w[0].0 + w[0].1 as u64 <= w[1].0);
        }
    }

    #[test]
    fn registration_index_follows_pool_state() {
        let pool = BufferPool::new(2, 512).unwrap();
        let a = pool.acquire().unwrap();
        assert_eq!(a.reg_index(), UNREGISTERED);
        pool.release(&a).unwrap();
        pool.mark_registered();
        let b = pool.acquire().unwrap();
        assert_eq!(b.reg_index(), b.index() as i16);
        pool.release(&b).unwrap();
    }
}

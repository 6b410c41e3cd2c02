//! Receive Control Block (§3).
//!
//! An RCB owns one DMA buffer and cycles between three states: **Free**
//! (sitting in the free list), **Working** (installed in a descriptor
//! slot), and **Loaned** (handed to the upper stack via bind). The state
//! itself is not stored explicitly — it is implied by which list currently
//! holds the RCB's slab index, each guarded by its own lock (§5) — except
//! for the reference count, which is atomic so the recycle callback can
//! observe and decrement it without taking either list's lock.

use std::sync::atomic::{AtomicUsize, Ordering};

use xl710_hal::{DmaBuffer, SpinLock};
use xl710_hal::sync::SpinLockGuard;

/// One receive control block: a DMA buffer plus an atomic loan count.
///
/// Reference count is 1 while Free or Working, >= 2 while Loaned, and 0
/// only during destruction (§3 RCB invariants).
pub struct RxControlBlock {
    refcount: AtomicUsize,
    buf: SpinLock<DmaBuffer>,
}

impl RxControlBlock {
    /// Wraps a freshly allocated buffer as a Free/Working RCB (refcount 1).
    #[must_use]
    pub fn new(buf: DmaBuffer) -> Self {
        Self {
            refcount: AtomicUsize::new(1),
            buf: SpinLock::new(buf),
        }
    }

    /// Current reference count.
    #[must_use]
    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::Acquire)
    }

    /// Increments the reference count, e.g. when a bind loans this RCB upward.
    pub fn incref(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrements the reference count, returning the value after the
    /// decrement. A result of zero means this RCB's buffer may now be
    /// destroyed.
    pub fn decref(&self) -> usize {
        self.refcount.fetch_sub(1, Ordering::AcqRel) - 1
    }

    /// Locks the underlying buffer for read/write access.
    pub fn buf(&self) -> SpinLockGuard<'_, DmaBuffer> {
        self.buf.lock()
    }

    /// Takes this RCB's buffer, leaving an empty one in its place. Callers
    /// must have already observed `refcount() == 0`; other `Arc` clones of
    /// this RCB (e.g. a stale free-list entry) may still exist, so this
    /// does not require unique ownership the way consuming `self` would.
    #[must_use]
    pub fn take_buf(&self) -> DmaBuffer {
        let mut guard = self.buf.lock();
        core::mem::replace(&mut *guard, DmaBuffer::empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xl710_hal::dma::{DmaMapper, DmaProfile, HeapDmaMapper};

    #[test]
    fn new_rcb_starts_at_refcount_one() {
        let mapper = HeapDmaMapper::new();
        let buf = mapper.alloc_buffer(64, DmaProfile::Static).unwrap();
        let rcb = RxControlBlock::new(buf);
        assert_eq!(rcb.refcount(), 1);
    }

    #[test]
    fn incref_decref_tracks_loans() {
        let mapper = HeapDmaMapper::new();
        let buf = mapper.alloc_buffer(64, DmaProfile::Static).unwrap();
        let rcb = RxControlBlock::new(buf);
        rcb.incref();
        assert_eq!(rcb.refcount(), 2);
        assert_eq!(rcb.decref(), 1);
        assert_eq!(rcb.decref(), 0);
    }
}

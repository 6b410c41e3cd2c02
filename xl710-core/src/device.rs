//! Device-wide state shared across every TRQP (§5, §7 category 2).
//!
//! Two pieces of state live above the per-queue locks: the degraded flag set
//! when a DMA handle reports a fault, and the teardown rendezvous that lets
//! the last outstanding loan finish destroying a queue's `RxData`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};

/// Device-wide state: the error/degraded flag and the teardown rendezvous.
///
/// The rendezvous uses `std::sync::{Mutex, Condvar}` rather than the
/// hand-rolled [`xl710_hal::sync::SpinLock`] used everywhere else, since
/// condition-variable waits are confined to teardown and never occur on the
/// hot path.
#[derive(Default)]
pub struct DeviceState {
    degraded: AtomicBool,
    pending: Mutex<usize>,
    pending_cv: Condvar,
}

impl DeviceState {
    /// Builds a fresh, non-degraded device state with no pending loans.
    #[must_use]
    pub fn new() -> Self {
        Self {
            degraded: AtomicBool::new(false),
            pending: Mutex::new(0),
            pending_cv: Condvar::new(),
        }
    }

    /// `true` once a DMA fault has put the device into degraded state.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    /// Marks the device degraded. Idempotent.
    pub fn mark_degraded(&self) {
        if !self.degraded.swap(true, Ordering::AcqRel) {
            log::error!("xl710: DMA fault observed, entering degraded state");
        }
    }

    /// Registers `n` newly outstanding loans ahead of a teardown.
    pub fn add_pending(&self, n: usize) {
        if n == 0 {
            return;
        }
        let mut guard = self.pending.lock().unwrap();
        *guard += n;
    }

    /// Decrements the device-wide pending count by one (one recycle
    /// completed during or after shutdown), waking any teardown waiter.
    /// Returns the post-decrement count.
    pub fn decrement_pending(&self) -> usize {
        let mut guard = self.pending.lock().unwrap();
        assert!(*guard > 0, "pending loan count underflow");
        *guard -= 1;
        let remaining = *guard;
        if remaining == 0 {
            self.pending_cv.notify_all();
        }
        remaining
    }

    /// Blocks until the device-wide pending count reaches zero.
    pub fn wait_for_drain(&self) {
        let guard = self.pending.lock().unwrap();
        let _unused = self.pending_cv.wait_while(guard, |p| *p > 0).unwrap();
    }

    /// Current pending count, for tests and diagnostics.
    #[must_use]
    pub fn pending(&self) -> usize {
        *self.pending.lock().unwrap()
    }
}

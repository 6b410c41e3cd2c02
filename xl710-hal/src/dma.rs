//! DMA buffer primitive (§4.1).
//!
//! Two allocation profiles exist: [`DmaProfile::Static`], a single-cookie
//! region used for descriptor rings and per-control-block buffers, and
//! [`DmaProfile::Bind`], a transient multi-cookie mapping used only while
//! binding an upper-stack fragment for zero-copy transmit.
//!
//! The platform-specific map/unmap/sync machinery is abstracted behind
//! [`DmaMapper`] so the data-plane core stays hardware-independent and
//! host-testable; [`HeapDmaMapper`] is a reference implementation backed by
//! the process heap with synthesized bus addresses, sufficient to exercise
//! every invariant in the test suite without real hardware.

use core::slice;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::CoreError;

/// Allocation profile requested from a [`DmaMapper`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaProfile {
    /// One contiguous, page-aligned segment capped at 4 GiB. Used for
    /// descriptor rings and per-control-block copy buffers.
    Static,
    /// A transient scatter/gather mapping over existing memory, bounded to
    /// `max_cookies` segments. Used only while binding a tx fragment.
    Bind {
        /// Maximum number of `(bus address, length)` cookies this profile
        /// may produce before binding is rejected.
        max_cookies: usize,
    },
}

/// One `(bus address, length)` pair describing a DMA-visible segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaCookie {
    /// Device-visible address of the segment.
    pub bus_addr: u64,
    /// Length of the segment in bytes.
    pub len: usize,
}

/// Opaque DMA handle minted by a [`DmaMapper`].
///
/// Carries a fault flag so the core can detect the "DMA handle has an
/// error" condition named in §4.3 and §7 category 2 without the mapper
/// needing to reach back into driver state.
#[derive(Clone)]
pub struct DmaHandle {
    id: u64,
    faulted: Arc<AtomicBool>,
}

impl DmaHandle {
    fn new(id: u64) -> Self {
        Self {
            id,
            faulted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Opaque identifier, unique per handle for the mapper's lifetime.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Marks this handle as faulted. Exposed for fault-injection tests.
    pub fn mark_faulted(&self) {
        self.faulted.store(true, Ordering::Release);
    }

    /// Returns `true` if this handle has recorded a fault.
    #[must_use]
    pub fn is_faulted(&self) -> bool {
        self.faulted.load(Ordering::Acquire)
    }
}

/// A DMA-capable buffer: handle, bus address, kernel address, capacity, and
/// in-use length.
///
/// `capacity` and the addresses are non-zero iff the buffer is bound; a
/// buffer produced by [`DmaBuffer::empty`] represents the unbound state a
/// freshly reset [`crate::...`]-owning control block starts in.
pub struct DmaBuffer {
    handle: DmaHandle,
    bus_addr: u64,
    kernel_ptr: *mut u8,
    capacity: usize,
    len: usize,
}

// SAFETY: `kernel_ptr` addresses a heap allocation owned exclusively by
// this `DmaBuffer`; callers in this workspace only ever touch it through a
// `SpinLock`-guarded control block.
unsafe impl Send for DmaBuffer {}

impl DmaBuffer {
    /// Returns an unbound, zero-capacity buffer.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            handle: DmaHandle::new(0),
            bus_addr: 0,
            kernel_ptr: core::ptr::null_mut(),
            capacity: 0,
            len: 0,
        }
    }

    /// Returns `true` if this buffer is bound to real memory.
    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.capacity != 0
    }

    /// The handle backing this buffer.
    #[must_use]
    pub fn handle(&self) -> &DmaHandle {
        &self.handle
    }

    /// Device-visible bus address of the buffer's start.
    #[must_use]
    pub fn bus_addr(&self) -> u64 {
        self.bus_addr
    }

    /// Total allocated capacity in bytes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current in-use length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// `true` if the in-use length is zero.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Sets the in-use length. Panics if `len` exceeds `capacity`.
    pub fn set_len(&mut self, len: usize) {
        assert!(len <= self.capacity, "DmaBuffer::set_len exceeds capacity");
        self.len = len;
    }

    /// The in-use region, as seen by the CPU.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: `kernel_ptr` is valid for `capacity` bytes and `len <= capacity`.
        unsafe { slice::from_raw_parts(self.kernel_ptr, self.len) }
    }

    /// The in-use region, mutable.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: `kernel_ptr` is valid for `capacity` bytes and `len <= capacity`.
        unsafe { slice::from_raw_parts_mut(self.kernel_ptr, self.len) }
    }

    /// The full backing region regardless of `len`, for header-alignment
    /// shifts and payload copies that know the real capacity.
    pub fn full_mut(&mut self) -> &mut [u8] {
        // SAFETY: `kernel_ptr` is valid for `capacity` bytes.
        unsafe { slice::from_raw_parts_mut(self.kernel_ptr, self.capacity) }
    }

    /// The full backing region regardless of `len`, read-only.
    #[must_use]
    pub fn full(&self) -> &[u8] {
        // SAFETY: `kernel_ptr` is valid for `capacity` bytes.
        unsafe { slice::from_raw_parts(self.kernel_ptr, self.capacity) }
    }

    /// Raw kernel pointer to the start of the backing region, for handing a
    /// loaned region's address to a message wrapper.
    #[must_use]
    pub fn kernel_ptr(&self) -> *mut u8 {
        self.kernel_ptr
    }
}

/// Platform-specific DMA map/unmap/sync operations.
///
/// This is the seam standing in for the kernel physical-memory manager
/// (`DmaCapability` in a kernel driver); a production integration supplies
/// its own implementation, out of scope for this crate (§1).
pub trait DmaMapper: Send + Sync {
    /// Allocates a buffer under the given profile.
    ///
    /// Allocation is expected to be non-blocking; implementations that
    /// cannot satisfy the request must return [`CoreError::AllocFailed`]
    /// without partial side effects.
    fn alloc_buffer(&self, size: usize, profile: DmaProfile) -> Result<DmaBuffer, CoreError>;

    /// Releases a previously allocated buffer.
    fn free_buffer(&self, buf: DmaBuffer);

    /// Mints a fresh handle usable with [`DmaMapper::bind`], for the two
    /// pre-allocated binding handles each TCB carries.
    fn alloc_bind_handle(&self) -> DmaHandle;

    /// Binds `handle` over `bytes`, returning the cookies describing the
    /// resulting device-visible mapping.
    ///
    /// Returns [`CoreError::TooManyCookies`] if `bytes` would require more
    /// segments than the handle's profile allows.
    fn bind(&self, handle: &DmaHandle, bytes: &[u8]) -> Result<Vec<DmaCookie>, CoreError>;

    /// Releases a mapping previously established with [`DmaMapper::bind`].
    fn unbind(&self, handle: &DmaHandle);

    /// Synchronizes a buffer for CPU reads, returning an error if the
    /// handle has recorded a fault.
    fn sync_for_cpu(&self, buf: &DmaBuffer) -> Result<(), CoreError>;

    /// Synchronizes a buffer for device reads.
    fn sync_for_device(&self, buf: &DmaBuffer);
}

/// Page granularity used by [`HeapDmaMapper`] to synthesize cookie splits
/// for the `Bind` profile, so bound fragments exercise multi-cookie paths
/// the same way a real scatter/gather mapping over non-contiguous physical
/// pages would.
const SYNTH_PAGE_SIZE: usize = 4096;

/// Heap-backed [`DmaMapper`] used by the test suite and suitable as a
/// starting point for host-side development without real hardware.
pub struct HeapDmaMapper {
    next_id: AtomicU64,
}

impl Default for HeapDmaMapper {
    fn default() -> Self {
        Self::new()
    }
}

impl HeapDmaMapper {
    /// Creates a new mapper with an empty handle namespace.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
        }
    }

    fn fresh_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl DmaMapper for HeapDmaMapper {
    fn alloc_buffer(&self, size: usize, profile: DmaProfile) -> Result<DmaBuffer, CoreError> {
        if matches!(profile, DmaProfile::Bind { .. }) {
            // Static allocations back real buffers; Bind handles are minted
            // via `alloc_bind_handle` and never own their own storage.
            return Err(CoreError::InvalidState);
        }
        if size == 0 {
            return Err(CoreError::AllocFailed);
        }
        let mut storage = vec![0u8; size].into_boxed_slice();
        let kernel_ptr = storage.as_mut_ptr();
        let bus_addr = kernel_ptr as u64;
        core::mem::forget(storage);
        Ok(DmaBuffer {
            handle: DmaHandle::new(self.fresh_id()),
            bus_addr,
            kernel_ptr,
            capacity: size,
            len: 0,
        })
    }

    fn free_buffer(&self, buf: DmaBuffer) {
        if buf.capacity == 0 {
            return;
        }
        // SAFETY: `kernel_ptr`/`capacity` were produced by a matching
        // `Vec::into_boxed_slice`/`Box::into_raw` pair in `alloc_buffer`.
        unsafe {
            let slice_ptr = core::ptr::slice_from_raw_parts_mut(buf.kernel_ptr, buf.capacity);
            drop(Box::from_raw(slice_ptr));
        }
    }

    fn alloc_bind_handle(&self) -> DmaHandle {
        DmaHandle::new(self.fresh_id())
    }

    fn bind(&self, handle: &DmaHandle, bytes: &[u8]) -> Result<Vec<DmaCookie>, CoreError> {
        if handle.is_faulted() {
            return Err(CoreError::DmaFault);
        }
        if bytes.is_empty() {
            return Ok(Vec::new());
        }
        let base = bytes.as_ptr() as u64;
        let mut cookies = Vec::new();
        let mut offset = 0usize;
        while offset < bytes.len() {
            let chunk = core::cmp::min(SYNTH_PAGE_SIZE, bytes.len() - offset);
            cookies.push(DmaCookie {
                bus_addr: base + offset as u64,
                len: chunk,
            });
            offset += chunk;
        }
        Ok(cookies)
    }

    fn unbind(&self, _handle: &DmaHandle) {}

    fn sync_for_cpu(&self, buf: &DmaBuffer) -> Result<(), CoreError> {
        if buf.handle.is_faulted() {
            return Err(CoreError::DmaFault);
        }
        Ok(())
    }

    fn sync_for_device(&self, _buf: &DmaBuffer) {}
}

//! Upper-stack message contract (§6).
//!
//! The framework's message type (an `mblk_t`-equivalent scatter/gather
//! chain) is an external collaborator (§1); this module names only the
//! shape the core needs from it, so the pipelines stay generic over
//! whatever concrete message type a production integration supplies.

use xl710_proto::ChecksumResult;

/// Tunnel encapsulation declared on an outgoing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TunnelRequest {
    /// No tunnel.
    #[default]
    None,
    /// VXLAN encapsulation, the only tunnel type this core recognizes.
    Vxlan,
}

/// Offload metadata the upper stack attaches to an outgoing message,
/// queried via `offload_query` (§6).
#[derive(Debug, Clone, Copy, Default)]
pub struct OffloadRequest {
    /// Request an outer IPv4 header checksum.
    pub ipv4_checksum: bool,
    /// Request a partial (pseudo-header) L4 checksum.
    pub partial_l4_checksum: bool,
    /// Request an inner (tunneled) IPv4 header checksum.
    pub inner_ipv4_checksum: bool,
    /// Request an inner (tunneled) partial L4 checksum.
    pub inner_partial_l4_checksum: bool,
    /// Large Send Offload segment size, if LSO is requested.
    pub lso_mss: Option<u16>,
    /// Tunnel encapsulation in effect for this message, if any.
    pub tunnel: TunnelRequest,
}

impl OffloadRequest {
    /// `true` if no offload at all was requested.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.ipv4_checksum
            && !self.partial_l4_checksum
            && !self.inner_ipv4_checksum
            && !self.inner_partial_l4_checksum
            && self.lso_mss.is_none()
    }
}

/// One scatter/gather segment of an upper-stack message.
pub trait UpstreamMessage: Send + 'static {
    /// Total number of bytes across all fragments.
    fn total_len(&self) -> usize {
        (0..self.fragment_count()).map(|i| self.fragment(i).len()).sum()
    }

    /// Number of fragments in the chain.
    fn fragment_count(&self) -> usize;

    /// Borrows fragment `i`'s bytes. Panics if `i >= fragment_count()`.
    fn fragment(&self, i: usize) -> &[u8];

    /// Mutably borrows fragment `i`'s bytes, for the rx copy path to write
    /// the payload into a freshly allocated message. Panics if
    /// `i >= fragment_count()`.
    fn fragment_mut(&mut self, i: usize) -> &mut [u8];

    /// Offload metadata the upper stack attached to this message.
    fn offload_request(&self) -> OffloadRequest;

    /// Attaches a decoded receive-checksum result. Only meaningful on
    /// messages flowing up from the rx pipeline.
    fn set_checksum_result(&mut self, result: ChecksumResult);
}

/// Constructs upper-stack message wrappers on behalf of the rx pipeline.
///
/// # Safety
/// Implementations of [`MessageFactory::wrap`] receive a raw pointer into
/// driver-owned DMA memory rather than a borrow, because the returned
/// message must outlive this call while the driver — not the type system —
/// tracks the memory's validity via the owning control block's reference
/// count. Callers uphold the invariant that `ptr` stays valid for `len`
/// bytes until the loan's reference count reaches zero.
pub trait MessageFactory: Send + Sync {
    /// Concrete upper-stack message type this factory produces.
    type Message: UpstreamMessage;

    /// Wraps an existing DMA buffer region without copying (the bind path).
    ///
    /// # Safety
    /// `ptr` must be valid for reads and writes of `len` bytes for as long
    /// as the caller's loan protocol guarantees.
    unsafe fn wrap(&self, ptr: *mut u8, len: usize) -> Self::Message;

    /// Allocates a fresh, owned message of `len` bytes (the copy path).
    /// Returns `None` on allocation failure (§7 category 6).
    fn alloc(&self, len: usize) -> Option<Self::Message>;
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::{OffloadRequest, UpstreamMessage};
    use std::ptr::NonNull;
    use xl710_proto::ChecksumResult;

    /// A single owned fragment used by the copy-path test message.
    pub struct OwnedFrag(pub Vec<u8>);

    /// A borrowed fragment wrapping raw DMA memory (the bind-path test message).
    pub struct BorrowedFrag {
        ptr: NonNull<u8>,
        len: usize,
    }

    // SAFETY: test harness only; the borrowed memory outlives the message
    // for the duration of each test.
    unsafe impl Send for BorrowedFrag {}

    /// Test-only [`UpstreamMessage`] with either owned or borrowed storage,
    /// plus the offload metadata and checksum-result slot the core reads
    /// and writes.
    pub struct TestMessage {
        pub owned: Vec<OwnedFrag>,
        pub borrowed: Vec<BorrowedFrag>,
        pub offload: OffloadRequest,
        pub checksum_result: Option<ChecksumResult>,
    }

    impl TestMessage {
        pub fn from_fragments(fragments: Vec<Vec<u8>>) -> Self {
            Self {
                owned: fragments.into_iter().map(OwnedFrag).collect(),
                borrowed: Vec::new(),
                offload: OffloadRequest::default(),
                checksum_result: None,
            }
        }

        /// # Safety
        /// See [`super::MessageFactory::wrap`].
        pub unsafe fn from_raw(ptr: *mut u8, len: usize) -> Self {
            Self {
                owned: Vec::new(),
                borrowed: vec![BorrowedFrag {
                    ptr: NonNull::new(ptr).expect("non-null DMA pointer"),
                    len,
                }],
                offload: OffloadRequest::default(),
                checksum_result: None,
            }
        }
    }

    impl UpstreamMessage for TestMessage {
        fn fragment_count(&self) -> usize {
            self.owned.len() + self.borrowed.len()
        }

        fn fragment(&self, i: usize) -> &[u8] {
            if i < self.owned.len() {
                &self.owned[i].0
            } else {
                let b = &self.borrowed[i - self.owned.len()];
                // SAFETY: valid for the test's duration, see `from_raw`.
                unsafe { std::slice::from_raw_parts(b.ptr.as_ptr(), b.len) }
            }
        }

        fn fragment_mut(&mut self, i: usize) -> &mut [u8] {
            if i < self.owned.len() {
                &mut self.owned[i].0
            } else {
                let b = &self.borrowed[i - self.owned.len()];
                // SAFETY: valid for the test's duration, see `from_raw`.
                unsafe { std::slice::from_raw_parts_mut(b.ptr.as_ptr(), b.len) }
            }
        }

        fn offload_request(&self) -> OffloadRequest {
            self.offload
        }

        fn set_checksum_result(&mut self, result: ChecksumResult) {
            self.checksum_result = Some(result);
        }
    }

    pub struct TestFactory;

    impl super::MessageFactory for TestFactory {
        type Message = TestMessage;

        unsafe fn wrap(&self, ptr: *mut u8, len: usize) -> Self::Message {
            // SAFETY: forwarded from the caller's obligation.
            unsafe { TestMessage::from_raw(ptr, len) }
        }

        fn alloc(&self, len: usize) -> Option<Self::Message> {
            Some(TestMessage::from_fragments(vec![vec![0u8; len]]))
        }
    }
}

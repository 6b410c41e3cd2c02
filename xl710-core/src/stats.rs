//! Per-queue statistics counters (§7).
//!
//! kstat wiring is out of scope (§1); these are plain counters a production
//! integration publishes however it likes.

/// Rx-side counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct RxStats {
    /// Frames delivered upward.
    pub frames: u64,
    /// Bytes delivered upward.
    pub bytes: u64,
    /// Frames discarded due to descriptor error bits (§7 category 3).
    pub errors: u64,
    /// Frames dropped due to upper-stack allocation failure (§7 category 6).
    pub alloc_failures: u64,
    /// Frames delivered via the bind (zero-copy) path.
    pub binds: u64,
    /// Frames delivered via the copy path.
    pub copies: u64,
}

/// Tx-side counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct TxStats {
    /// Frames submitted successfully.
    pub frames: u64,
    /// Bytes submitted successfully.
    pub bytes: u64,
    /// Messages dropped due to missing/invalid offload metadata (§7 category 4).
    pub offload_errors: u64,
    /// Times the ring entered the blocked state (§7 category 5).
    pub blocks: u64,
    /// Times the ring was unblocked after reclamation.
    pub unblocks: u64,
    /// Descriptors reclaimed via write-back.
    pub reclaimed: u64,
}

//! Core error type.

use core::fmt;

/// Errors surfaced by the data-plane core.
///
/// Only allocation failure at ring-setup time (category 1 of the error
/// handling design) propagates out of the core as a `Result`; every other
/// category is recovered locally and only observable through statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreError {
    /// A DMA buffer or descriptor ring could not be allocated.
    AllocFailed,
    /// The requested DMA binding exceeds the profile's scatter/gather limit.
    TooManyCookies,
    /// The DMA mapper reported a fault on a previously bound region.
    DmaFault,
    /// The operation is not valid in the device's current state.
    InvalidState,
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AllocFailed => f.write_str("DMA allocation failed"),
            Self::TooManyCookies => f.write_str("fragment exceeds scatter/gather limit"),
            Self::DmaFault => f.write_str("DMA handle fault"),
            Self::InvalidState => f.write_str("invalid state for this operation"),
        }
    }
}

impl std::error::Error for CoreError {}

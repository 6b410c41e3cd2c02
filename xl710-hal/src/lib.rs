//! Hardware-abstraction primitives shared by the XL710 data-plane core.
//!
//! Provides the DMA buffer primitive (§4.1), a non-yielding spin lock for
//! the hot-path locks named in §5, and the core error type (§7).

pub mod dma;
pub mod error;
pub mod sync;

pub use dma::{DmaBuffer, DmaCookie, DmaHandle, DmaMapper, DmaProfile, HeapDmaMapper};
pub use error::CoreError;
pub use sync::SpinLock;

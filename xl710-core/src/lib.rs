//! Transmit/receive data-plane core for an XL710-family multi-queue NIC.
//!
//! This crate owns the hot-path state a GLDv3-style driver keeps per
//! transmit/receive queue pair (TRQP): control block lifecycles (§3),
//! the rx and tx pipelines that move frames across the ring/write-back
//! boundary (§4), and the device-wide degraded/teardown state shared
//! across queues (§5). PCI enumeration, MMIO mapping, interrupt
//! registration, and the upstream networking stack are external
//! collaborators named only through the trait seams in [`xl710_hal`] and
//! [`message`] (§1).

pub mod config;
pub mod device;
pub mod message;
pub mod rcb;
pub mod rx;
pub mod stats;
pub mod tcb;
pub mod tx;
mod util;

pub use config::TrqpConfig;
pub use device::DeviceState;
pub use message::{MessageFactory, OffloadRequest, TunnelRequest, UpstreamMessage};
pub use rcb::RxControlBlock;
pub use rx::{RxData, RxFrame};
pub use stats::{RxStats, TxStats};
pub use tcb::{BindHandleKind, TcbTag, TxControlBlock};
pub use tx::{TxRing, TxUnblockSink};

//! Wire-format descriptor layouts, packet-type checksum decode, and
//! descriptor index arithmetic shared by the rx and tx pipelines.

pub mod desc;
pub mod ptype;
pub mod ring;

pub use desc::{QueueDoorbell, RxDesc, RxErrorBits, TxContextDesc, TxDataDesc};
pub use ptype::{ChecksumResult, IpVersion, L4Proto, PacketType, PtypeTable, TunnelKind};
pub use ring::{next, prev};

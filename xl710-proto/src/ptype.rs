//! Rx checksum-result decode (§4.3.1).
//!
//! The packet-type index carried in the rx write-back descriptor selects a
//! row of a fixed classification table describing the parsed protocol
//! stack; [`decode_checksum`] walks the rule list in the order given.

use crate::desc::RxErrorBits;

/// IP version classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpVersion {
    /// IPv4.
    V4,
    /// IPv6.
    V6,
}

/// Tunnel encapsulation classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TunnelKind {
    /// No tunnel.
    #[default]
    None,
    /// GRE encapsulation.
    Gre,
    /// MAC-in-UDP NAT tunnel (e.g. VXLAN) without an inner VLAN tag.
    NatMac,
    /// MAC-in-UDP NAT tunnel with an inner VLAN tag.
    NatMacVlan,
}

/// L4 protocol classification at the layer checksum decode applies to
/// (the outer L4 when untunneled, the inner L4 when tunneled).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum L4Proto {
    /// No recognized L4 protocol.
    #[default]
    None,
    /// TCP.
    Tcp,
    /// UDP.
    Udp,
    /// SCTP.
    Sctp,
}

/// One row of the packet-type classification table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketType {
    /// Outer IP version, if the packet has a recognized outer IP header.
    pub outer_ip: Option<IpVersion>,
    /// `true` if the outer IPv6 header carries an extension header.
    pub ipv6_ext: bool,
    /// Tunnel encapsulation, if any.
    pub tunnel: TunnelKind,
    /// Inner IP version, valid only when `tunnel != TunnelKind::None`.
    pub inner_ip: Option<IpVersion>,
    /// L4 protocol at the checksum-bearing layer.
    pub l4_proto: L4Proto,
    /// `true` if the packet is an IP fragment at the layer checksum would apply to.
    pub fragmented: bool,
}

impl PacketType {
    /// A plain (untunneled) IPv4 + TCP packet.
    #[must_use]
    pub fn ipv4_tcp() -> Self {
        Self {
            outer_ip: Some(IpVersion::V4),
            l4_proto: L4Proto::Tcp,
            ..Self::default()
        }
    }

    /// A plain (untunneled) IPv4 + UDP packet.
    #[must_use]
    pub fn ipv4_udp() -> Self {
        Self {
            outer_ip: Some(IpVersion::V4),
            l4_proto: L4Proto::Udp,
            ..Self::default()
        }
    }

    /// A fragmented IPv4 packet (no L4 checksum is decodable).
    #[must_use]
    pub fn ipv4_fragment() -> Self {
        Self {
            outer_ip: Some(IpVersion::V4),
            fragmented: true,
            ..Self::default()
        }
    }

    /// An IPv6 packet carrying an extension header.
    #[must_use]
    pub fn ipv6_ext_tcp() -> Self {
        Self {
            outer_ip: Some(IpVersion::V6),
            ipv6_ext: true,
            l4_proto: L4Proto::Tcp,
            ..Self::default()
        }
    }

    /// A VXLAN-style (NAT-MAC) tunnel carrying inner IPv4 + TCP.
    #[must_use]
    pub fn vxlan_ipv4_tcp() -> Self {
        Self {
            outer_ip: Some(IpVersion::V4),
            tunnel: TunnelKind::NatMac,
            inner_ip: Some(IpVersion::V4),
            l4_proto: L4Proto::Tcp,
            ..Self::default()
        }
    }
}

/// A 256-entry packet-type classification table, indexed by the rx
/// descriptor's ptype field.
pub struct PtypeTable {
    entries: Box<[Option<PacketType>; 256]>,
}

impl Default for PtypeTable {
    fn default() -> Self {
        Self {
            entries: Box::new([None; 256]),
        }
    }
}

impl PtypeTable {
    /// An empty table; every index decodes as unknown.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `pt` at `idx`.
    pub fn set(&mut self, idx: u8, pt: PacketType) {
        self.entries[idx as usize] = Some(pt);
    }

    /// Looks up the classification for `idx`, if registered.
    #[must_use]
    pub fn get(&self, idx: u8) -> Option<PacketType> {
        self.entries[idx as usize]
    }
}

/// Decoded receive-checksum result, attached to a delivered frame via
/// `set_checksum_result` (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChecksumResult {
    /// `true` if the outer IP header checksum was validated.
    pub outer_ip_checked: bool,
    /// Outer IP header checksum result, valid iff `outer_ip_checked`.
    pub outer_ip_ok: bool,
    /// `true` if an inner (tunneled) IP header checksum was validated.
    pub inner_ip_checked: bool,
    /// Inner IP header checksum result, valid iff `inner_ip_checked`.
    pub inner_ip_ok: bool,
    /// `true` if the L4 checksum was validated.
    pub l4_checked: bool,
    /// L4 checksum result, valid iff `l4_checked`.
    pub l4_ok: bool,
}

/// Decodes the receive-checksum result for one descriptor.
///
/// Returns `None` when no checksum information is available: unknown
/// ptype, `l3l4p` clear, or an IPv6 packet carrying an extension header.
#[must_use]
pub fn decode_checksum(
    ptype_idx: u8,
    table: &PtypeTable,
    l3l4p: bool,
    errors: RxErrorBits,
) -> Option<ChecksumResult> {
    let pt = table.get(ptype_idx)?;
    if !l3l4p || (pt.outer_ip == Some(IpVersion::V6) && pt.ipv6_ext) {
        return None;
    }

    let mut result = ChecksumResult::default();

    if pt.outer_ip == Some(IpVersion::V4) {
        let errored = if pt.tunnel != TunnelKind::None {
            errors.contains(RxErrorBits::EXT_IP_ERROR)
        } else {
            errors.contains(RxErrorBits::IP_ERROR)
        };
        result.outer_ip_checked = true;
        result.outer_ip_ok = !errored;
    }

    if pt.fragmented {
        return Some(result);
    }

    if pt.tunnel == TunnelKind::None {
        if matches!(pt.l4_proto, L4Proto::Tcp | L4Proto::Udp | L4Proto::Sctp) {
            result.l4_checked = true;
            result.l4_ok = !errors.contains(RxErrorBits::L4_ERROR);
        }
        return Some(result);
    }

    if pt.inner_ip == Some(IpVersion::V4) {
        result.inner_ip_checked = true;
        result.inner_ip_ok = !errors.contains(RxErrorBits::INNER_IP_ERROR);
    }

    if matches!(pt.tunnel, TunnelKind::Gre | TunnelKind::NatMac | TunnelKind::NatMacVlan)
        && matches!(pt.l4_proto, L4Proto::Tcp | L4Proto::Udp | L4Proto::Sctp)
    {
        result.l4_checked = true;
        result.l4_ok = !errors.contains(RxErrorBits::L4_ERROR);
    }

    Some(result)
}

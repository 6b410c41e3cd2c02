//! Per-TRQP tunables (§6 persisted configuration).
//!
//! Reading these from an external configuration source (`driver.conf`-style
//! property parsing) is out of scope (§1); this struct is the point a
//! production integration populates once, before ring allocation.

/// Tunable parameters governing one transmit/receive queue pair.
#[derive(Debug, Clone, Copy)]
pub struct TrqpConfig {
    /// Number of rx descriptors.
    pub rx_ring_size: usize,
    /// Number of tx descriptors.
    pub tx_ring_size: usize,
    /// Minimum frame length eligible for the rx bind (zero-copy) path;
    /// shorter frames are copied.
    pub rx_dma_min: usize,
    /// Minimum total message length that forces the tx bind path even
    /// without LSO.
    pub tx_dma_min: usize,
    /// Free-descriptor threshold below which the tx ring reports
    /// backpressure.
    pub tx_block_thresh: usize,
    /// Maximum frames returned from one rx pipeline invocation.
    pub rx_limit_per_intr: usize,
    /// Enable receive checksum decode.
    pub rx_hcksum_enable: bool,
    /// Enable transmit checksum/LSO offload.
    pub tx_hcksum_enable: bool,
    /// Device MTU, used to size rx buffers (§4.2 step 3).
    pub mtu: usize,
}

impl Default for TrqpConfig {
    fn default() -> Self {
        Self {
            rx_ring_size: 512,
            tx_ring_size: 512,
            rx_dma_min: 256,
            tx_dma_min: 256,
            tx_block_thresh: 64,
            rx_limit_per_intr: 256,
            rx_hcksum_enable: true,
            tx_hcksum_enable: true,
            mtu: 1500,
        }
    }
}

impl TrqpConfig {
    /// Rx per-buffer allocation size: the MTU plus L2/VLAN/FCS overhead,
    /// rounded up to 1 KiB, plus the 2-byte header-alignment pad (§4.2 step 3).
    #[must_use]
    pub fn rx_buf_len(&self) -> usize {
        const L2_VLAN_FCS_OVERHEAD: usize = 22;
        const ONE_KIB: usize = 1024;
        let raw = self.mtu + L2_VLAN_FCS_OVERHEAD;
        raw.div_ceil(ONE_KIB) * ONE_KIB + 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rx_buf_len_rounds_up_to_1kib_plus_pad() {
        let cfg = TrqpConfig {
            mtu: 1500,
            ..Default::default()
        };
        // 1500 + 22 = 1522, rounds up to 2048, plus 2-byte pad.
        assert_eq!(cfg.rx_buf_len(), 2050);
    }

    #[test]
    fn rx_buf_len_jumbo_frame() {
        let cfg = TrqpConfig {
            mtu: 9000,
            ..Default::default()
        };
        // 9000 + 22 = 9022, rounds up to 9216, plus 2-byte pad.
        assert_eq!(cfg.rx_buf_len(), 9218);
    }
}

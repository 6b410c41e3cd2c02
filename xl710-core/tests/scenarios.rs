//! Black-box transmit scenarios exercised purely through `xl710-core`'s
//! public API: a fake `DmaMapper`, `QueueDoorbell`, and `TxUnblockSink`
//! stand in for hardware and the upstream driver glue (§1, §8).

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use xl710_core::{DeviceState, OffloadRequest, TrqpConfig, TxRing, TxUnblockSink};
use xl710_hal::dma::HeapDmaMapper;
use xl710_proto::desc::QueueDoorbell;

struct Frame {
    fragments: Vec<Vec<u8>>,
    offload: OffloadRequest,
}

impl Frame {
    fn plain(bytes: Vec<u8>) -> Self {
        Self {
            fragments: vec![bytes],
            offload: OffloadRequest::default(),
        }
    }

    fn multi(fragments: Vec<Vec<u8>>) -> Self {
        Self {
            fragments,
            offload: OffloadRequest::default(),
        }
    }

    fn len(&self) -> usize {
        self.fragments.iter().map(Vec::len).sum()
    }
}

impl xl710_core::UpstreamMessage for Frame {
    fn fragment_count(&self) -> usize {
        self.fragments.len()
    }

    fn fragment(&self, i: usize) -> &[u8] {
        &self.fragments[i]
    }

    fn fragment_mut(&mut self, i: usize) -> &mut [u8] {
        &mut self.fragments[i]
    }

    fn offload_request(&self) -> OffloadRequest {
        self.offload
    }

    fn set_checksum_result(&mut self, _result: xl710_proto::ptype::ChecksumResult) {}
}

struct RecordingDoorbell {
    tx_tail: AtomicU32,
}

impl RecordingDoorbell {
    fn new() -> Self {
        Self {
            tx_tail: AtomicU32::new(0),
        }
    }
}

impl QueueDoorbell for RecordingDoorbell {
    fn set_rx_tail(&self, _tail: u32) {}
    fn set_tx_tail(&self, tail: u32) {
        self.tx_tail.store(tail, Ordering::Relaxed);
    }
}

struct RecordingUnblock {
    calls: AtomicUsize,
}

impl RecordingUnblock {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }

    fn count(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

impl TxUnblockSink for RecordingUnblock {
    fn tx_unblock(&self) {
        self.calls.fetch_add(1, Ordering::Relaxed);
    }
}

/// A 54-byte Ethernet/IPv4/TCP header followed by `payload_len` zero bytes.
fn eth_ipv4_tcp(payload_len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; 54 + payload_len];
    buf[12] = 0x08;
    buf[13] = 0x00;
    buf[14] = 0x45;
    buf[14 + 9] = 6;
    buf[34 + 12] = 0x50;
    buf
}

type Ring = TxRing<Frame, HeapDmaMapper, RecordingDoorbell, RecordingUnblock>;

fn build(ring_size: usize, tx_dma_min: usize, tx_block_thresh: usize) -> (Ring, Arc<AtomicU32>, Arc<RecordingUnblock>) {
    let write_back = Arc::new(AtomicU32::new(0));
    let unblock = Arc::new(RecordingUnblock::new());
    let config = TrqpConfig {
        tx_ring_size: ring_size,
        tx_dma_min,
        tx_block_thresh,
        ..Default::default()
    };
    let ring = TxRing::new(
        config,
        Arc::new(HeapDmaMapper::new()),
        Arc::new(RecordingDoorbell::new()),
        Arc::new(DeviceState::new()),
        unblock.clone(),
        write_back.clone(),
    )
    .unwrap();
    (ring, write_back, unblock)
}

/// Scenario 1: single-fragment 128-byte frame takes the copy path, emits
/// one descriptor, and its TCB returns to the free pool once write-back
/// reports it reclaimed.
#[test]
fn scenario_1_copy_path_round_trip() {
    let (tx, wb, _unblock) = build(8, 256, 2);
    let msg = Frame::plain(eth_ipv4_tcp(74));
    assert_eq!(msg.len(), 128);
    assert!(tx.tx_submit(msg).is_none());

    let stats = tx.stats();
    assert_eq!(stats.frames, 1);
    assert_eq!(stats.bytes, 128);

    wb.store(1, Ordering::Relaxed);
    tx.tx_reclaim();
    assert_eq!(tx.stats().reclaimed, 1);
}

/// Scenario 2: a 9-fragment, 900-byte frame exceeds `tx_dma_min` and takes
/// the bind path, one data descriptor per fragment, EOP/RS only on the last.
#[test]
fn scenario_2_multi_fragment_bind_uses_one_descriptor_per_fragment() {
    let (tx, wb, _unblock) = build(16, 512, 2);
    let mut fragments = vec![eth_ipv4_tcp(46)];
    fragments.extend((0..8).map(|_| vec![0xCDu8; 100]));
    let msg = Frame::multi(fragments);
    assert_eq!(msg.len(), 900);
    assert!(tx.tx_submit(msg).is_none());

    let stats = tx.stats();
    assert_eq!(stats.frames, 1);
    assert_eq!(stats.bytes, 900);

    wb.store(9, Ordering::Relaxed);
    tx.tx_reclaim();
    assert_eq!(tx.stats().reclaimed, 9);
}

/// Scenario 3: a 4500-byte frame with LSO MSS 1448 and both checksums
/// requested gets a context descriptor carrying `tso_len = 4500 - 54`.
#[test]
fn scenario_3_lso_frame_emits_context_then_bind_data() {
    let (tx, _wb, _unblock) = build(16, 512, 2);
    let mut msg = Frame::plain(eth_ipv4_tcp(4446));
    msg.offload.ipv4_checksum = true;
    msg.offload.partial_l4_checksum = true;
    msg.offload.lso_mss = Some(1448);
    assert_eq!(msg.len(), 4500);

    assert!(tx.tx_submit(msg).is_none());
    assert_eq!(tx.stats().frames, 1);
    assert_eq!(tx.stats().offload_errors, 0);
}

/// Scenario 5: backpressure. Filling the ring to one descriptor below the
/// blocking threshold and submitting one more returns the message and sets
/// `blocked`; a subsequent reclaim that frees descriptors above the
/// threshold fires `tx_unblock` exactly once.
#[test]
fn scenario_5_backpressure_then_unblock_on_reclaim() {
    let (tx, wb, unblock) = build(4, 1024, 2);

    for _ in 0..3 {
        let msg = Frame::plain(eth_ipv4_tcp(10));
        assert!(tx.tx_submit(msg).is_none());
    }

    let blocked_msg = Frame::plain(eth_ipv4_tcp(10));
    let returned = tx.tx_submit(blocked_msg);
    assert!(returned.is_some());
    assert_eq!(tx.stats().blocks, 1);
    assert_eq!(unblock.count(), 0);

    wb.store(3, Ordering::Relaxed);
    tx.tx_reclaim();

    assert_eq!(tx.stats().unblocks, 1);
    assert_eq!(unblock.count(), 1);

    // Draining does not double-fire once already unblocked.
    wb.store(3, Ordering::Relaxed);
    tx.tx_reclaim();
    assert_eq!(unblock.count(), 1);
}

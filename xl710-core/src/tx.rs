//! Transmit pipeline and per-queue tx state (§4.2 steps 4-5, §4.4).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use xl710_hal::dma::{DmaMapper, DmaProfile};
use xl710_hal::sync::SpinLock;
use xl710_proto::desc::{QueueDoorbell, TxContextCmd, TxContextDesc, TxDataCmd, TxDataDesc};
use xl710_proto::ptype::{IpVersion, L4Proto};
use xl710_proto::ring::next;

use crate::config::TrqpConfig;
use crate::device::DeviceState;
use crate::message::{OffloadRequest, TunnelRequest, UpstreamMessage};
use crate::stats::TxStats;
use crate::tcb::{BindHandleKind, TcbTag, TxControlBlock};
use crate::util::{fetch_u16, fetch_u8};

/// Sink the tx pipeline notifies when backpressure clears (§6 `tx_unblock`).
pub trait TxUnblockSink: Send + Sync {
    /// Invoked once, exactly when `blocked` transitions from `true` to `false`.
    fn tx_unblock(&self);
}

/// Decoded per-frame offload context (§3 `TxContext`, §4.4.1).
#[derive(Debug, Clone, Copy)]
struct TxContext {
    data_cmd: TxDataCmd,
    mac_len: u8,
    ip_len: u8,
    l4_len: u8,
    context_cmd: TxContextCmd,
    tunneling_params: u32,
    l2tag2: u32,
    tso_len: u16,
    mss: u16,
    needs_context: bool,
}

struct ParsedHeaders {
    l2_len: usize,
    ip_version: Option<IpVersion>,
    l3_len: usize,
    l4_proto: L4Proto,
    l4_len: usize,
}

fn parse_headers(msg: &dyn UpstreamMessage, base: usize) -> Option<ParsedHeaders> {
    let et_hi = fetch_u8(msg, base + 12)?;
    let et_lo = fetch_u8(msg, base + 13)?;
    let mut l2_len = 14usize;
    let mut ethertype = u16::from_be_bytes([et_hi, et_lo]);
    if ethertype == 0x8100 {
        l2_len = 16;
        ethertype = fetch_u16(msg, base + 16)?;
    }

    let l3_off = base + l2_len;
    let (ip_version, l3_len) = match ethertype {
        0x0800 => {
            let vihl = fetch_u8(msg, l3_off)?;
            (Some(IpVersion::V4), ((vihl & 0x0F) as usize) * 4)
        }
        0x86DD => (Some(IpVersion::V6), 40),
        _ => return None,
    };

    let proto_off = match ip_version {
        Some(IpVersion::V4) => l3_off + 9,
        _ => l3_off + 6,
    };
    let proto = fetch_u8(msg, proto_off)?;
    let l4_off = l3_off + l3_len;
    let (l4_proto, l4_len) = match proto {
        6 => {
            let data_offset = fetch_u8(msg, l4_off + 12)?;
            (L4Proto::Tcp, ((data_offset >> 4) as usize) * 4)
        }
        17 => (L4Proto::Udp, 8),
        132 => (L4Proto::Sctp, 12),
        _ => (L4Proto::None, 0),
    };

    Some(ParsedHeaders {
        l2_len,
        ip_version,
        l3_len,
        l4_proto,
        l4_len,
    })
}

fn l4_flag(proto: L4Proto) -> TxDataCmd {
    match proto {
        L4Proto::Tcp => TxDataCmd::L4T_TCP,
        L4Proto::Udp => TxDataCmd::L4T_UDP,
        L4Proto::Sctp => TxDataCmd::L4T_SCTP,
        L4Proto::None => TxDataCmd::empty(),
    }
}

fn ip_flag(version: Option<IpVersion>) -> TxDataCmd {
    match version {
        Some(IpVersion::V4) => TxDataCmd::IIPT_V4,
        Some(IpVersion::V6) => TxDataCmd::IIPT_V6,
        None => TxDataCmd::empty(),
    }
}

fn derive_offload_context(msg: &dyn UpstreamMessage, req: &OffloadRequest, total_len: usize) -> Option<TxContext> {
    let outer = parse_headers(msg, 0)?;

    if req.ipv4_checksum && outer.ip_version != Some(IpVersion::V4) {
        return None;
    }
    if req.partial_l4_checksum && outer.l4_proto == L4Proto::None {
        return None;
    }
    if (req.inner_ipv4_checksum || req.inner_partial_l4_checksum) && req.tunnel == TunnelRequest::None {
        return None;
    }
    if let Some(mss) = req.lso_mss {
        if !(req.ipv4_checksum && req.partial_l4_checksum) {
            return None;
        }
        if mss == 0 {
            return None;
        }
    }

    let mut data_cmd = TxDataCmd::ICRC;
    let mut tunneling_params = 0u32;
    let mut needs_context = req.lso_mss.is_some();

    if req.tunnel == TunnelRequest::Vxlan {
        needs_context = true;
        let inner_base = base_of(&outer) + 8; // past outer UDP + the 8-byte VXLAN header
        let inner = parse_headers(msg, inner_base)?;
        if req.inner_ipv4_checksum && inner.ip_version != Some(IpVersion::V4) {
            return None;
        }
        data_cmd |= ip_flag(inner.ip_version) | l4_flag(inner.l4_proto);
        tunneling_params = 1; // nonzero marks "tunnel present" for the host-testable model
        return Some(TxContext {
            data_cmd,
            mac_len: outer.l2_len as u8,
            ip_len: outer.l3_len as u8,
            l4_len: outer.l4_len as u8,
            context_cmd: if req.lso_mss.is_some() { TxContextCmd::TSO } else { TxContextCmd::empty() },
            tunneling_params,
            l2tag2: 0,
            tso_len: req.lso_mss.map_or(0, |_| tso_len(total_len, &outer)),
            mss: req.lso_mss.unwrap_or(0),
            needs_context,
        });
    }

    data_cmd |= ip_flag(outer.ip_version) | l4_flag(outer.l4_proto);

    Some(TxContext {
        data_cmd,
        mac_len: outer.l2_len as u8,
        ip_len: outer.l3_len as u8,
        l4_len: outer.l4_len as u8,
        context_cmd: if req.lso_mss.is_some() { TxContextCmd::TSO } else { TxContextCmd::empty() },
        tunneling_params,
        l2tag2: 0,
        tso_len: req.lso_mss.map_or(0, |_| tso_len(total_len, &outer)),
        mss: req.lso_mss.unwrap_or(0),
        needs_context,
    })
}

fn base_of(h: &ParsedHeaders) -> usize {
    h.l2_len + h.l3_len + h.l4_len
}

fn tso_len(total_len: usize, h: &ParsedHeaders) -> u16 {
    (total_len.saturating_sub(base_of(h))) as u16
}

enum TxSlot {
    Empty,
    Data(TxDataDesc),
    Context(TxContextDesc),
}

struct TcbPool<M> {
    slab: Vec<TxControlBlock<M>>,
    free: Vec<usize>,
}

struct TxInner {
    desc: Vec<TxSlot>,
    working: Vec<Option<usize>>,
    head: usize,
    tail: usize,
    free_descriptors: usize,
    blocked: bool,
}

/// One queue's transmit side: descriptor ring, TCB pool, write-back head,
/// and the pipeline operating on them.
pub struct TxRing<M, Mapper, Doorbell, Unblock> {
    config: TrqpConfig,
    mapper: Arc<Mapper>,
    doorbell: Arc<Doorbell>,
    device: Arc<DeviceState>,
    unblock_sink: Arc<Unblock>,
    tx_lock: SpinLock<TxInner>,
    tcb_lock: SpinLock<TcbPool<M>>,
    write_back: Arc<AtomicU32>,
    stats: SpinLock<TxStats>,
}

impl<M, Mapper, Doorbell, Unblock> TxRing<M, Mapper, Doorbell, Unblock>
where
    M: UpstreamMessage,
    Mapper: DmaMapper,
    Doorbell: QueueDoorbell,
    Unblock: TxUnblockSink,
{
    /// Allocates a fresh `TxRing` with `ring_size` descriptors and a TCB
    /// pool sized `1.5 * ring_size` (§3, not overridden by the rx-side
    /// free-list sizing discrepancy noted in §9).
    pub fn new(
        config: TrqpConfig,
        mapper: Arc<Mapper>,
        doorbell: Arc<Doorbell>,
        device: Arc<DeviceState>,
        unblock_sink: Arc<Unblock>,
        write_back: Arc<AtomicU32>,
    ) -> Result<Self, xl710_hal::CoreError> {
        let ring_size = config.tx_ring_size;
        let pool_size = ring_size + ring_size / 2;

        let mut slab = Vec::with_capacity(pool_size);
        let mut free = Vec::with_capacity(pool_size);
        for i in 0..pool_size {
            let copy = mapper.alloc_buffer(config.tx_dma_min.max(64), DmaProfile::Static)?;
            let tcb = TxControlBlock::new(copy, mapper.alloc_bind_handle(), mapper.alloc_bind_handle());
            slab.push(tcb);
            free.push(i);
        }

        log::info!("xl710: tx ring allocated, ring_size={ring_size} pool_size={pool_size}");

        Ok(Self {
            config,
            mapper,
            doorbell,
            device,
            unblock_sink,
            tx_lock: SpinLock::new(TxInner {
                desc: (0..ring_size).map(|_| TxSlot::Empty).collect(),
                working: vec![None; ring_size],
                head: 0,
                tail: 0,
                free_descriptors: ring_size,
                blocked: false,
            }),
            tcb_lock: SpinLock::new(TcbPool { slab, free }),
            write_back,
            stats: SpinLock::new(TxStats::default()),
        })
    }

    /// A snapshot of this queue's tx counters.
    #[must_use]
    pub fn stats(&self) -> TxStats {
        *self.stats.lock()
    }

    /// Submits one message for transmission. Returns `None` on success or
    /// on a dropped message (degraded device, or rejected offload
    /// metadata); returns the message back on backpressure (§6 `tx_submit`).
    pub fn tx_submit(&self, message: M) -> Option<M> {
        if self.device.is_degraded() {
            log::warn!("xl710: tx_submit dropped, device degraded");
            return None;
        }

        let total_len = message.total_len();
        let req = message.offload_request();
        let ctx = match derive_offload_context(&message, &req, total_len) {
            Some(ctx) => ctx,
            None => {
                self.stats.lock().offload_errors += 1;
                return None;
            }
        };

        let use_bind = req.lso_mss.is_some() || total_len > self.config.tx_dma_min;

        if use_bind {
            self.submit_bind(message, ctx)
        } else {
            self.submit_copy(message, ctx)
        }
    }

    fn submit_copy(&self, message: M, ctx: TxContext) -> Option<M> {
        let needs_context = usize::from(ctx.needs_context);
        let mut context_idx = None;
        let tcb_idx = {
            let mut pool = self.tcb_lock.lock();
            if pool.free.len() < 1 + needs_context {
                return self.mark_blocked(message);
            }
            let idx = pool.free.pop().unwrap();
            if ctx.needs_context {
                let cidx = pool.free.pop().unwrap();
                pool.slab[cidx].set_context();
                context_idx = Some(cidx);
            }
            idx
        };

        let total_len = message.total_len();
        {
            let mut pool = self.tcb_lock.lock();
            let tcb = &mut pool.slab[tcb_idx];
            let mut offset = 0usize;
            for i in 0..message.fragment_count() {
                let frag = message.fragment(i);
                tcb.copy_dmab.full_mut()[offset..offset + frag.len()].copy_from_slice(frag);
                offset += frag.len();
            }
            tcb.copy_dmab.set_len(total_len);
        }

        let descriptor_count = 1 + needs_context;
        let Some(reservation) = self.reserve(descriptor_count) else {
            let mut pool = self.tcb_lock.lock();
            pool.free.push(tcb_idx);
            if let Some(cidx) = context_idx {
                pool.slab[cidx].reset();
                pool.free.push(cidx);
            }
            return self.mark_blocked(message);
        };

        let bus_addr = {
            let mut pool = self.tcb_lock.lock();
            pool.slab[tcb_idx].copy_dmab.bus_addr()
        };

        let cmd = ctx.data_cmd | TxDataCmd::EOP | TxDataCmd::RS;
        let mut desc_idx = reservation;
        {
            let mut inner = self.tx_lock.lock();
            let ring_size = inner.desc.len();
            if let Some(cidx) = context_idx {
                let cd = TxContextDesc::new(ctx.tunneling_params, ctx.l2tag2, ctx.context_cmd, ctx.tso_len, ctx.mss);
                inner.desc[desc_idx] = TxSlot::Context(cd);
                inner.working[desc_idx] = Some(cidx);
                desc_idx = next(desc_idx, 1, ring_size);
            }
            let dd = TxDataDesc::new(bus_addr, total_len as u16, ctx.mac_len, ctx.ip_len, ctx.l4_len, cmd);
            inner.desc[desc_idx] = TxSlot::Data(dd);
            inner.working[desc_idx] = Some(tcb_idx);
            desc_idx = next(desc_idx, 1, ring_size);
        }
        self.doorbell.set_tx_tail(desc_idx as u32);

        {
            let mut pool = self.tcb_lock.lock();
            pool.slab[tcb_idx].set_copy(total_len, message);
        }

        let mut stats = self.stats.lock();
        stats.frames += 1;
        stats.bytes += total_len as u64;
        None
    }

    fn submit_bind(&self, message: M, ctx: TxContext) -> Option<M> {
        let fragment_count = message.fragment_count().max(1);
        let needs_context = usize::from(ctx.needs_context);
        let mut tcb_indices = Vec::with_capacity(fragment_count);
        let mut context_idx = None;
        {
            let mut pool = self.tcb_lock.lock();
            if pool.free.len() < fragment_count + needs_context {
                return self.mark_blocked(message);
            }
            for _ in 0..fragment_count {
                tcb_indices.push(pool.free.pop().unwrap());
            }
            if ctx.needs_context {
                let idx = pool.free.pop().unwrap();
                pool.slab[idx].set_context();
                context_idx = Some(idx);
            }
        }

        let handle_kind = if ctx.mss != 0 { BindHandleKind::Lso } else { BindHandleKind::NonLso };
        // (bus address, length, owning TCB index) so each cookie's working
        // slot points at the TCB that actually holds its bind, not just the
        // first fragment's.
        let mut all_cookies: Vec<(u64, u16, usize)> = Vec::new();

        for (frag_idx, &tcb_idx) in tcb_indices.iter().enumerate() {
            let frag = message.fragment(frag_idx);
            let handle = {
                let pool = self.tcb_lock.lock();
                match handle_kind {
                    BindHandleKind::NonLso => pool.slab[tcb_idx].bind_handle.clone(),
                    BindHandleKind::Lso => pool.slab[tcb_idx].lso_bind_handle.clone(),
                }
            };
            match self.mapper.bind(&handle, frag) {
                Ok(cookies) => {
                    for c in &cookies {
                        all_cookies.push((c.bus_addr, c.len as u16, tcb_idx));
                    }
                    let mut pool = self.tcb_lock.lock();
                    pool.slab[tcb_idx].set_bind(handle_kind, cookies, None);
                }
                Err(_) => {
                    self.device.mark_degraded();
                    let mut rollback_set = tcb_indices.clone();
                    rollback_set.extend(context_idx);
                    self.rollback_bind(&rollback_set);
                    return None;
                }
            }
        }

        let descriptor_count = all_cookies.len() + needs_context;
        let Some(reservation) = self.reserve(descriptor_count) else {
            let mut rollback_set = tcb_indices.clone();
            rollback_set.extend(context_idx);
            self.rollback_bind(&rollback_set);
            return self.mark_blocked(message);
        };

        let owner_idx = tcb_indices[0];
        let mut desc_idx = reservation;
        if let Some(cidx) = context_idx {
            let mut inner = self.tx_lock.lock();
            let cd = TxContextDesc::new(ctx.tunneling_params, ctx.l2tag2, ctx.context_cmd, ctx.tso_len, ctx.mss);
            inner.desc[desc_idx] = TxSlot::Context(cd);
            inner.working[desc_idx] = Some(cidx);
            desc_idx = next(desc_idx, 1, inner.desc.len());
        }

        let total_cookies = all_cookies.len();
        for (i, &(bus, len, owner)) in all_cookies.iter().enumerate() {
            let last = i + 1 == total_cookies;
            let mut cmd = ctx.data_cmd;
            if last {
                cmd |= TxDataCmd::EOP | TxDataCmd::RS;
            }
            let dd = TxDataDesc::new(bus, len, ctx.mac_len, ctx.ip_len, ctx.l4_len, cmd);
            let mut inner = self.tx_lock.lock();
            let ring_size = inner.desc.len();
            inner.desc[desc_idx] = TxSlot::Data(dd);
            inner.working[desc_idx] = Some(owner);
            desc_idx = next(desc_idx, 1, ring_size);
        }

        {
            let mut pool = self.tcb_lock.lock();
            let cookies = pool.slab[owner_idx].tag_cookies_or_empty();
            pool.slab[owner_idx].set_bind(handle_kind, cookies, Some(message));
        }

        let total_len = message_dropped_len(total_cookies, &all_cookies);
        self.doorbell.set_tx_tail(desc_idx as u32);

        let mut stats = self.stats.lock();
        stats.frames += 1;
        stats.bytes += total_len;
        None
    }

    fn rollback_bind(&self, indices: &[usize]) {
        let mut pool = self.tcb_lock.lock();
        for &idx in indices {
            if let TcbTag::Bind { handle_kind, .. } = pool.slab[idx].tag() {
                let handle = match handle_kind {
                    BindHandleKind::NonLso => pool.slab[idx].bind_handle.clone(),
                    BindHandleKind::Lso => pool.slab[idx].lso_bind_handle.clone(),
                };
                self.mapper.unbind(&handle);
            }
            pool.slab[idx].reset();
            pool.free.push(idx);
        }
    }

    fn mark_blocked(&self, message: M) -> Option<M> {
        let mut inner = self.tx_lock.lock();
        if !inner.blocked {
            inner.blocked = true;
            self.stats.lock().blocks += 1;
        }
        Some(message)
    }

    /// Reserves `count` descriptors starting at the current tail and
    /// advances the tail past them in the same lock acquisition, so two
    /// concurrent `tx_submit` calls can never be handed the same start index
    /// (§4.4.3, §5). Returns the start index, or `None` if the ring is
    /// already at or below the blocking threshold, or too short of room for
    /// this frame. The descriptor ring itself must still be written, and the
    /// doorbell rung, under a separate acquisition once the caller knows the
    /// descriptor contents.
    fn reserve(&self, count: usize) -> Option<usize> {
        let mut inner = self.tx_lock.lock();
        if inner.free_descriptors < self.config.tx_block_thresh || inner.free_descriptors < count {
            if !inner.blocked {
                inner.blocked = true;
                drop(inner);
                self.stats.lock().blocks += 1;
            }
            return None;
        }
        let start = inner.tail;
        let ring_size = inner.desc.len();
        inner.tail = next(start, count, ring_size);
        inner.free_descriptors -= count;
        Some(start)
    }

    /// Reclaims descriptors up to the device-reported write-back head
    /// (§4.4.4). Unblocks the ring and notifies the upper stack when free
    /// descriptors rise back above the blocking threshold.
    pub fn tx_reclaim(&self) {
        let wb = self.write_back.load(Ordering::Acquire) as usize;
        let mut reclaimed = Vec::new();
        let mut unblock = false;
        let mut total = 0usize;

        {
            let mut inner = self.tx_lock.lock();
            let ring_size = inner.desc.len();
            let mut pos = inner.head;
            while pos != wb % ring_size.max(1) {
                let Some(owner) = inner.working[pos].take() else { break };
                let span = {
                    let pool = self.tcb_lock.lock();
                    pool.slab[owner].descriptor_count()
                };
                reclaimed.push(owner);
                pos = next(pos, span, ring_size);
                total += span;
            }
            inner.head = pos;
            inner.free_descriptors += total;
            if inner.blocked && inner.free_descriptors > self.config.tx_block_thresh {
                inner.blocked = false;
                unblock = true;
            }
        }

        if total == 0 {
            return;
        }

        {
            let mut pool = self.tcb_lock.lock();
            for idx in reclaimed {
                match pool.slab[idx].tag() {
                    TcbTag::Bind { handle_kind, .. } => {
                        let handle = match handle_kind {
                            BindHandleKind::NonLso => pool.slab[idx].bind_handle.clone(),
                            BindHandleKind::Lso => pool.slab[idx].lso_bind_handle.clone(),
                        };
                        self.mapper.unbind(&handle);
                    }
                    TcbTag::Copy { .. } | TcbTag::Context | TcbTag::None => {}
                }
                pool.slab[idx].reset();
                pool.free.push(idx);
            }
        }

        let mut stats = self.stats.lock();
        stats.reclaimed += total as u64;
        if unblock {
            stats.unblocks += 1;
            drop(stats);
            self.unblock_sink.tx_unblock();
        }
    }

    /// Drains every outstanding descriptor unconditionally, ignoring
    /// write-back (§4.4.4 shutdown reclamation).
    pub fn teardown(&self) {
        let mut inner = self.tx_lock.lock();
        let ring_size = inner.desc.len();
        let mut pos = inner.head;
        let mut reclaimed = Vec::new();
        while pos != inner.tail {
            let Some(owner) = inner.working[pos].take() else {
                inner.desc[pos] = TxSlot::Empty;
                pos = next(pos, 1, ring_size);
                continue;
            };
            let span = {
                let pool = self.tcb_lock.lock();
                pool.slab[owner].descriptor_count()
            };
            reclaimed.push(owner);
            let mut p = pos;
            for _ in 0..span {
                inner.desc[p] = TxSlot::Empty;
                p = next(p, 1, ring_size);
            }
            pos = p;
        }
        inner.head = inner.tail;
        drop(inner);

        let mut pool = self.tcb_lock.lock();
        for idx in reclaimed {
            pool.slab[idx].reset();
            pool.free.push(idx);
        }
        log::info!("xl710: tx teardown complete");
    }
}

fn message_dropped_len(count: usize, cookies: &[(u64, u16, usize)]) -> u64 {
    cookies.iter().take(count).map(|&(_, l, _)| u64::from(l)).sum()
}

impl<M> TxControlBlock<M> {
    fn tag_cookies_or_empty(&self) -> Vec<xl710_hal::dma::DmaCookie> {
        match self.tag() {
            TcbTag::Bind { cookies, .. } => cookies.clone(),
            _ => Vec::new(),
        }
    }
}

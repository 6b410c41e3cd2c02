//! Transmit Control Block (§3, §9 "Variant-typed TCB").
//!
//! A TCB is a tagged sum over the four states a tx free-pool slot can be
//! in: freshly reset (`None`), holding a copy-path payload (`Copy`),
//! holding a transient bind over upper-stack memory (`Bind`), or standing
//! in for a context descriptor so the reclaim path can treat every
//! descriptor slot uniformly (`Context`).

use xl710_hal::dma::{DmaBuffer, DmaCookie, DmaHandle};

/// Which of a TCB's two DMA binding handles (LSO vs. non-LSO) is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindHandleKind {
    /// Bound via the non-LSO handle.
    NonLso,
    /// Bound via the LSO handle.
    Lso,
}

/// The state a TCB currently holds.
pub enum TcbTag<M> {
    /// Freshly reset; not carrying any message.
    None,
    /// Copy-path: payload lives in `dmab`, sized by `len`.
    Copy {
        /// Owned copy-destination buffer.
        dmab: DmaBuffer,
        /// Upper-stack message this TCB is holding ownership of.
        message: M,
    },
    /// Bind-path: a transient DMA mapping over the message's own memory.
    Bind {
        /// Which handle is bound.
        handle_kind: BindHandleKind,
        /// Cookies describing the bound region.
        cookies: Vec<DmaCookie>,
        /// Upper-stack message this TCB is holding ownership of, if this
        /// TCB is the chain's first (owning) TCB.
        message: Option<M>,
    },
    /// A sentinel occupying the working slot of a context descriptor, so
    /// reclamation can walk every occupied slot uniformly.
    Context,
}

/// One transmit control block: a copy buffer, two reusable bind handles,
/// and the currently active variant.
pub struct TxControlBlock<M> {
    /// Pre-allocated copy-path buffer.
    pub copy_dmab: DmaBuffer,
    /// Bind handle used for non-LSO binds.
    pub bind_handle: DmaHandle,
    /// Bind handle used for LSO binds.
    pub lso_bind_handle: DmaHandle,
    tag: TcbTag<M>,
}

impl<M> TxControlBlock<M> {
    /// Builds a freshly reset TCB from its pre-allocated resources.
    #[must_use]
    pub fn new(copy_dmab: DmaBuffer, bind_handle: DmaHandle, lso_bind_handle: DmaHandle) -> Self {
        Self {
            copy_dmab,
            bind_handle,
            lso_bind_handle,
            tag: TcbTag::None,
        }
    }

    /// The currently active variant.
    #[must_use]
    pub fn tag(&self) -> &TcbTag<M> {
        &self.tag
    }

    /// Installs the Copy variant, taking ownership of `message`.
    pub fn set_copy(&mut self, len: usize, message: M) {
        self.copy_dmab.set_len(len);
        self.tag = TcbTag::Copy {
            dmab: core::mem::replace(&mut self.copy_dmab, DmaBuffer::empty()),
            message,
        };
    }

    /// Installs the Bind variant.
    pub fn set_bind(&mut self, handle_kind: BindHandleKind, cookies: Vec<DmaCookie>, message: Option<M>) {
        self.tag = TcbTag::Bind {
            handle_kind,
            cookies,
            message,
        };
    }

    /// Installs the Context sentinel.
    pub fn set_context(&mut self) {
        self.tag = TcbTag::Context;
    }

    /// Number of descriptors this TCB occupies: one for Copy/Context/None,
    /// one per cookie for Bind.
    #[must_use]
    pub fn descriptor_count(&self) -> usize {
        match &self.tag {
            TcbTag::Bind { cookies, .. } => cookies.len().max(1),
            _ => 1,
        }
    }

    /// Resets this TCB to `None`, returning the message it was holding (if
    /// any) and restoring `copy_dmab` if the Copy variant had taken it.
    pub fn reset(&mut self) -> Option<M> {
        match core::mem::replace(&mut self.tag, TcbTag::None) {
            TcbTag::None | TcbTag::Context => None,
            TcbTag::Copy { dmab, message } => {
                self.copy_dmab = dmab;
                self.copy_dmab.set_len(0);
                Some(message)
            }
            TcbTag::Bind { message, .. } => message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::test_support::TestMessage;
    use xl710_hal::dma::{DmaMapper, DmaProfile, HeapDmaMapper};

    fn fresh_tcb(mapper: &HeapDmaMapper) -> TxControlBlock<TestMessage> {
        let copy = mapper.alloc_buffer(256, DmaProfile::Static).unwrap();
        TxControlBlock::new(copy, mapper.alloc_bind_handle(), mapper.alloc_bind_handle())
    }

    #[test]
    fn fresh_tcb_has_none_tag_and_one_descriptor() {
        let mapper = HeapDmaMapper::new();
        let tcb = fresh_tcb(&mapper);
        assert!(matches!(tcb.tag(), TcbTag::None));
        assert_eq!(tcb.descriptor_count(), 1);
    }

    #[test]
    fn copy_then_reset_returns_message_and_restores_buffer() {
        let mapper = HeapDmaMapper::new();
        let mut tcb = fresh_tcb(&mapper);
        let msg = TestMessage::from_fragments(vec![vec![1, 2, 3]]);
        tcb.set_copy(3, msg);
        assert!(matches!(tcb.tag(), TcbTag::Copy { .. }));
        let returned = tcb.reset();
        assert!(returned.is_some());
        assert!(matches!(tcb.tag(), TcbTag::None));
        assert_eq!(tcb.copy_dmab.capacity(), 256);
    }

    #[test]
    fn bind_descriptor_count_matches_cookie_count() {
        let mapper = HeapDmaMapper::new();
        let mut tcb = fresh_tcb(&mapper);
        let cookies = vec![
            DmaCookie { bus_addr: 0, len: 100 },
            DmaCookie { bus_addr: 100, len: 50 },
        ];
        tcb.set_bind(BindHandleKind::NonLso, cookies, None::<TestMessage>);
        assert_eq!(tcb.descriptor_count(), 2);
    }
}

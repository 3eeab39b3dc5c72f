//! The three single-slot asynchronous operation handles: fetch, evict, and
//! prefetch. Each holds an opaque transport handle `H` plus a page-sized
//! scratch buffer; only one operation of each kind may be outstanding at a
//! time, which the fault handler relies on to serialize per-page evict →
//! fetch ordering (§5 of the spec).

use crate::protection::Protection;

#[derive(Debug, Clone, Copy)]
pub enum OpMeta {
    Fetch { final_prot: Protection },
    Evict { dirty: bool },
    Prefetch,
}

pub struct PendingOp<H> {
    pub page_index: u32,
    pub handle: H,
    pub buffer: Vec<u8>,
    pub meta: OpMeta,
}

/// Holds at most one outstanding operation of each kind.
pub struct AsyncSlots<H> {
    fetch: Option<PendingOp<H>>,
    evict: Option<PendingOp<H>>,
    prefetch: Option<PendingOp<H>>,
    page_size: usize,
}

impl<H> AsyncSlots<H> {
    pub fn new(page_size: usize) -> Self {
        AsyncSlots {
            fetch: None,
            evict: None,
            prefetch: None,
            page_size,
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn fetch_outstanding(&self) -> bool {
        self.fetch.is_some()
    }

    pub fn evict_outstanding(&self) -> bool {
        self.evict.is_some()
    }

    pub fn prefetch_outstanding(&self) -> bool {
        self.prefetch.is_some()
    }

    pub fn begin_fetch(&mut self, page_index: u32, handle: H, final_prot: Protection) {
        debug_assert!(self.fetch.is_none(), "fetch slot already occupied");
        self.fetch = Some(PendingOp {
            page_index,
            handle,
            buffer: vec![0u8; self.page_size],
            meta: OpMeta::Fetch { final_prot },
        });
    }

    pub fn take_fetch(&mut self) -> Option<PendingOp<H>> {
        self.fetch.take()
    }

    pub fn fetch_buffer_mut(&mut self) -> Option<&mut Vec<u8>> {
        self.fetch.as_mut().map(|p| &mut p.buffer)
    }

    pub fn begin_evict(&mut self, page_index: u32, handle: H, dirty: bool, buffer: Vec<u8>) {
        debug_assert!(self.evict.is_none(), "evict slot already occupied");
        self.evict = Some(PendingOp {
            page_index,
            handle,
            buffer,
            meta: OpMeta::Evict { dirty },
        });
    }

    pub fn take_evict(&mut self) -> Option<PendingOp<H>> {
        self.evict.take()
    }

    pub fn peek_evict(&self) -> Option<&PendingOp<H>> {
        self.evict.as_ref()
    }

    pub fn begin_prefetch(&mut self, page_index: u32, handle: H) {
        debug_assert!(self.prefetch.is_none(), "prefetch slot already occupied");
        self.prefetch = Some(PendingOp {
            page_index,
            handle,
            buffer: vec![0u8; self.page_size],
            meta: OpMeta::Prefetch,
        });
    }

    pub fn take_prefetch(&mut self) -> Option<PendingOp<H>> {
        self.prefetch.take()
    }

    pub fn peek_prefetch(&self) -> Option<&PendingOp<H>> {
        self.prefetch.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_one_outstanding_per_kind() {
        let mut slots: AsyncSlots<u32> = AsyncSlots::new(64);
        assert!(!slots.fetch_outstanding());
        slots.begin_fetch(7, 1, Protection::ReadWrite);
        assert!(slots.fetch_outstanding());
        let op = slots.take_fetch().unwrap();
        assert_eq!(op.page_index, 7);
        assert!(!slots.fetch_outstanding());
    }

    #[test]
    fn evict_buffer_travels_with_the_op() {
        let mut slots: AsyncSlots<u32> = AsyncSlots::new(8);
        slots.begin_evict(3, 5, true, vec![9; 8]);
        let op = slots.take_evict().unwrap();
        assert_eq!(op.buffer, vec![9; 8]);
        match op.meta {
            OpMeta::Evict { dirty } => assert!(dirty),
            _ => panic!("wrong meta"),
        }
    }
}

//! Buffer rings of block-backed caches
//!
//! A frame cached by a block-backed address space may carry a ring of
//! buffer heads, one per block. The ring is the frame's private data and
//! holds one frame reference while attached.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crate::mm::frame::{FrameRef, Pfn, Private, PAGE_SIZE};

/// One block of a cached frame
#[derive(Debug)]
pub struct BufferHead {
    page: AtomicU64,
    offset: usize,
    count: AtomicU32,
    locked: AtomicBool,
    dirty: AtomicBool,
    /// A reference is parked in the per-CPU lookup cache
    cached: AtomicBool,
}

impl BufferHead {
    fn new(pfn: Pfn, offset: usize) -> Self {
        Self {
            page: AtomicU64::new(pfn),
            offset,
            count: AtomicU32::new(0),
            locked: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            cached: AtomicBool::new(false),
        }
    }

    /// Frame this buffer's data lives in
    pub fn page(&self) -> Pfn {
        self.page.load(Ordering::SeqCst)
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn count(&self) -> u32 {
        self.count.load(Ordering::SeqCst)
    }

    pub fn get(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn put(&self) {
        self.count.fetch_sub(1, Ordering::SeqCst);
    }

    /// Park a reference in the lookup cache
    pub fn cache(&self) {
        if !self.cached.swap(true, Ordering::SeqCst) {
            self.get();
        }
    }

    pub fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub fn lock(&self) {
        while !self.try_lock() {
            crate::cond_resched();
        }
    }

    pub fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    fn busy(&self) -> bool {
        self.count() > 0 || self.is_locked() || self.is_dirty()
    }
}

/// Buffer heads covering one frame
#[derive(Debug)]
pub struct BufferRing {
    heads: Vec<BufferHead>,
}

impl BufferRing {
    /// Ring of `nr` equal blocks over frame `pfn`
    pub fn new(pfn: Pfn, nr: usize) -> Arc<Self> {
        let nr = nr.clamp(1, PAGE_SIZE);
        let size = PAGE_SIZE / nr;
        Arc::new(Self {
            heads: (0..nr).map(|i| BufferHead::new(pfn, i * size)).collect(),
        })
    }

    pub fn heads(&self) -> &[BufferHead] {
        &self.heads
    }

    /// Any buffer still referenced
    pub fn has_refs(&self) -> bool {
        self.heads.iter().any(|bh| bh.count() > 0)
    }

    /// Drop references parked in the lookup cache
    pub fn invalidate_cached(&self) {
        for bh in &self.heads {
            if bh.cached.swap(false, Ordering::SeqCst) {
                bh.put();
            }
        }
    }

    /// Re-point every buffer at frame `pfn`
    pub fn set_page(&self, pfn: Pfn) {
        for bh in &self.heads {
            bh.page.store(pfn, Ordering::SeqCst);
        }
    }

    pub fn unlock_all(&self) {
        for bh in &self.heads {
            bh.unlock();
        }
    }
}

/// Attach a fresh ring of `nr` buffers to `frame`
pub fn attach_buffers(frame: &FrameRef, nr: usize) -> Arc<BufferRing> {
    let ring = BufferRing::new(frame.pfn(), nr);
    frame.attach_private(Private::Buffers(ring.clone()));
    ring
}

/// Detach `frame`'s ring if no buffer is busy
pub fn try_to_free_buffers(frame: &FrameRef) -> bool {
    let ring = match frame.buffers() {
        Some(ring) => ring,
        None => return true,
    };
    if ring.heads().iter().any(BufferHead::busy) {
        return false;
    }
    frame.detach_private();
    true
}

/// Release whatever private data `frame` carries, if nothing uses it
pub fn try_to_release_page(frame: &FrameRef) -> bool {
    if frame.is_writeback() {
        return false;
    }
    if frame.buffers().is_some() {
        return try_to_free_buffers(frame);
    }
    frame.detach_private();
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::node::{Node, NodeKind};

    #[test]
    fn test_attach_and_free() {
        let node = Node::new(0, NodeKind::Cpu, 0, 2);
        let f = node.alloc_frame().unwrap();
        let ring = attach_buffers(&f, 4);
        assert_eq!(ring.heads().len(), 4);
        assert_eq!(ring.heads()[1].offset(), 1024);
        assert!(f.has_private());
        assert_eq!(f.ref_count(), 2);

        ring.heads()[2].get();
        assert!(!try_to_free_buffers(&f));
        ring.heads()[2].put();
        assert!(try_to_free_buffers(&f));
        assert!(!f.has_private());
        assert_eq!(f.ref_count(), 1);
    }

    #[test]
    fn test_cached_refs_invalidate() {
        let ring = BufferRing::new(3, 2);
        ring.heads()[0].cache();
        ring.heads()[0].cache();
        assert_eq!(ring.heads()[0].count(), 1);
        assert!(ring.has_refs());
        ring.invalidate_cached();
        assert!(!ring.has_refs());
    }
}

//! Physical Frame Abstraction
//!
//! A `Frame` is one page-sized unit of physical memory. It carries the
//! reference count, map count, lock bit and status flags that the
//! migration protocol reasons about, plus the owner record (anonymous
//! lifetime token or cache slot) and the reverse map of page-table sites
//! that currently point at it.
//!
//! ## Reference count rules
//!
//! - A free frame sits at its idle count (0, or 1 for device-private memory)
//! - Each page-table mapping, each cache slot, attached private data and
//!   each isolation hold one reference
//! - `freeze` swaps an exact expected count for a sentinel; while frozen,
//!   `try_get` fails, which makes check-then-swap atomic against new pins
//! - Members of a compound group have no count of their own; every count
//!   operation on a member lands on the head

use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use spin::{Mutex, MutexGuard};

use crate::mm::buffer::BufferRing;
use crate::mm::mapping::{AddressSpace, AnonVma, MovableOps};
use crate::mm::node::{NodeData, NodeId, NodeKind};
use crate::mm::pmap::Mm;

// ============================================================================
// Constants
// ============================================================================

/// Page size
pub const PAGE_SIZE: usize = 4096;

/// Page shift (log2 of PAGE_SIZE)
pub const PAGE_SHIFT: usize = 12;

/// Groups with more members than this are gigantic
pub const MAX_ORDER_NR_PAGES: usize = 1024;

/// Refcount value while a frame is frozen for an identity swap
const REF_FROZEN: u32 = 0x8000_0000;

/// Physical frame number
pub type Pfn = u64;

/// Shared handle to a frame
pub type FrameRef = Arc<Frame>;

// ============================================================================
// Frame Flags
// ============================================================================

/// Frame status flags
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct FrameFlags(u32);

impl FrameFlags {
    /// Content differs from backing store
    pub const DIRTY: Self = Self(1 << 0);
    /// Writeback I/O in flight
    pub const WRITEBACK: Self = Self(1 << 1);
    /// Locked in memory
    pub const MLOCKED: Self = Self(1 << 2);
    /// On the active LRU list
    pub const ACTIVE: Self = Self(1 << 3);
    /// Cannot be evicted
    pub const UNEVICTABLE: Self = Self(1 << 4);
    /// Linked on an LRU list
    pub const LRU: Self = Self(1 << 5);
    /// Backed by swap rather than a file
    pub const SWAPBACKED: Self = Self(1 << 6);
    /// Member of the swap cache
    pub const SWAPCACHE: Self = Self(1 << 7);
    /// Private data attached
    pub const PRIVATE: Self = Self(1 << 8);
    /// Driver-managed frame taken off its driver's lists for migration
    pub const ISOLATED: Self = Self(1 << 9);
    /// Driver-managed (non-LRU movable) frame
    pub const MOVABLE: Self = Self(1 << 10);
    /// Referenced since last scan
    pub const REFERENCED: Self = Self(1 << 11);
    /// Part of the working set
    pub const WORKINGSET: Self = Self(1 << 12);
    /// Blocks are allocated on backing store
    pub const MAPPEDTODISK: Self = Self(1 << 13);
    /// Content is valid
    pub const UPTODATE: Self = Self(1 << 14);
    /// I/O error seen
    pub const ERROR: Self = Self(1 << 15);
    /// Filesystem-private check bit
    pub const CHECKED: Self = Self(1 << 16);
    /// Accessed since last idle scan
    pub const YOUNG: Self = Self(1 << 17);
    /// Not accessed since last idle scan
    pub const IDLE: Self = Self(1 << 18);
    /// Hardware poisoned, never reused
    pub const HWPOISON: Self = Self(1 << 19);
    /// Hugetlb head on its hstate's active list
    pub const HUGE_ACTIVE: Self = Self(1 << 20);

    /// Flags copied to the new frame and cleared on the old one
    pub const TRANSFERABLE: Self = Self(
        Self::ERROR.0
            | Self::REFERENCED.0
            | Self::UPTODATE.0
            | Self::ACTIVE.0
            | Self::UNEVICTABLE.0
            | Self::CHECKED.0
            | Self::MAPPEDTODISK.0
            | Self::DIRTY.0
            | Self::WORKINGSET.0
            | Self::MLOCKED.0
            | Self::YOUNG.0
            | Self::IDLE.0,
    );

    /// Empty flags
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Get bits
    pub const fn bits(&self) -> u32 {
        self.0
    }

    /// Create from bits
    pub const fn from_bits_truncate(bits: u32) -> Self {
        Self(bits)
    }

    /// Check if contains flags
    pub const fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Check if any of the flags are set
    pub const fn intersects(&self, other: Self) -> bool {
        (self.0 & other.0) != 0
    }

    /// Union with another flags
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Intersection with another flags
    pub const fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    /// Difference from another flags
    pub const fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl Default for FrameFlags {
    fn default() -> Self {
        Self::empty()
    }
}

impl core::ops::BitOr for FrameFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl fmt::Debug for FrameFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FrameFlags({:#x})", self.0)
    }
}

// ============================================================================
// Owner Record
// ============================================================================

/// Private data attached to a frame
#[derive(Clone, Default)]
pub enum Private {
    #[default]
    None,
    /// Opaque word (swap entry, hugetlb subpool)
    Word(u64),
    /// Buffer ring of a block-backed mapping
    Buffers(Arc<BufferRing>),
}

impl Private {
    pub fn is_none(&self) -> bool {
        matches!(self, Private::None)
    }
}

/// Who owns the frame's content
#[derive(Clone, Default)]
pub struct FrameOwner {
    /// Anonymous lifetime token
    pub anon: Option<Arc<AnonVma>>,
    /// File or swap cache holding the frame
    pub mapping: Option<Arc<AddressSpace>>,
    /// Offset key inside `mapping`, or linear index for anonymous content
    pub index: u64,
    /// Private data
    pub private: Private,
    /// Driver capability for driver-managed frames
    pub movable: Option<Arc<dyn MovableOps>>,
}

impl FrameOwner {
    /// Neither anonymous nor cached nor driver-owned
    pub fn is_unowned(&self) -> bool {
        self.anon.is_none() && self.mapping.is_none() && self.movable.is_none()
    }
}

// ============================================================================
// Compound Groups
// ============================================================================

/// Hugetlb pool description
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hstate {
    /// Allocation order of pages in this pool
    pub order: u32,
    /// Whether pages of this size can be migrated
    pub migratable: bool,
}

/// Kind of huge allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompoundKind {
    /// Transparent huge page, splittable
    Transparent,
    /// Hugetlb page from a pool
    HugeTlb(Hstate),
}

/// Role of a frame in a compound group
#[derive(Clone, Default)]
pub enum Compound {
    #[default]
    Standalone,
    Head {
        order: u32,
        kind: CompoundKind,
        /// Members after the head, in order
        tails: Vec<FrameRef>,
    },
    Member {
        head: Weak<Frame>,
        index: usize,
    },
}

// ============================================================================
// Reverse Map
// ============================================================================

/// One page-table site mapping a frame
#[derive(Clone)]
pub struct RmapSite {
    pub mm: Weak<Mm>,
    pub addr: u64,
}

// ============================================================================
// Frame Structure
// ============================================================================

/// Physical frame
pub struct Frame {
    pfn: Pfn,
    node: Arc<NodeData>,
    refcount: AtomicU32,
    mapcount: AtomicU32,
    locked: AtomicBool,
    flags: AtomicU32,
    /// Placement hint of the last accessor
    cpupid: AtomicU32,
    /// Cgroup the frame is charged to
    memcg: AtomicU32,
    owner: Mutex<FrameOwner>,
    compound: Mutex<Compound>,
    data: Mutex<Box<[u8]>>,
    rmap: Mutex<Vec<RmapSite>>,
}

impl Frame {
    /// Create a free frame on `node`
    pub fn new(pfn: Pfn, node: Arc<NodeData>) -> Self {
        let idle = idle_count(node.kind());
        Self {
            pfn,
            node,
            refcount: AtomicU32::new(idle),
            mapcount: AtomicU32::new(0),
            locked: AtomicBool::new(false),
            flags: AtomicU32::new(0),
            cpupid: AtomicU32::new(0),
            memcg: AtomicU32::new(0),
            owner: Mutex::new(FrameOwner::default()),
            compound: Mutex::new(Compound::Standalone),
            data: Mutex::new(vec![0u8; PAGE_SIZE].into_boxed_slice()),
            rmap: Mutex::new(Vec::new()),
        }
    }

    pub fn pfn(&self) -> Pfn {
        self.pfn
    }

    pub fn node_id(&self) -> NodeId {
        self.node.id()
    }

    pub fn node_data(&self) -> &Arc<NodeData> {
        &self.node
    }

    /// Device memory the CPU cannot address directly
    pub fn is_device_private(&self) -> bool {
        self.node.kind() == NodeKind::Device
    }

    // ========================================================================
    // Flags
    // ========================================================================

    pub fn flags(&self) -> FrameFlags {
        FrameFlags::from_bits_truncate(self.flags.load(Ordering::SeqCst))
    }

    pub fn set_flags(&self, flags: FrameFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::SeqCst);
    }

    pub fn clear_flags(&self, flags: FrameFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::SeqCst);
    }

    pub fn has_flags(&self, flags: FrameFlags) -> bool {
        self.flags().contains(flags)
    }

    /// Clear `flags` and report whether all of them were set
    pub fn test_and_clear(&self, flags: FrameFlags) -> bool {
        let prev = self.flags.fetch_and(!flags.bits(), Ordering::SeqCst);
        FrameFlags::from_bits_truncate(prev).contains(flags)
    }

    pub fn is_dirty(&self) -> bool {
        self.has_flags(FrameFlags::DIRTY)
    }

    pub fn set_dirty(&self) {
        self.set_flags(FrameFlags::DIRTY);
    }

    pub fn is_writeback(&self) -> bool {
        self.has_flags(FrameFlags::WRITEBACK)
    }

    pub fn is_lru(&self) -> bool {
        self.has_flags(FrameFlags::LRU)
    }

    pub fn has_private(&self) -> bool {
        self.has_flags(FrameFlags::PRIVATE)
    }

    /// Driver-managed frame whose driver still claims it
    pub fn is_movable(&self) -> bool {
        self.has_flags(FrameFlags::MOVABLE) && self.owner.lock().movable.is_some()
    }

    /// Marked driver-managed, whether or not the driver still claims it
    pub fn is_driver_managed(&self) -> bool {
        self.has_flags(FrameFlags::MOVABLE)
    }

    pub fn is_isolated(&self) -> bool {
        self.has_flags(FrameFlags::ISOLATED)
    }

    pub fn cpupid(&self) -> u32 {
        self.cpupid.load(Ordering::Relaxed)
    }

    pub fn set_cpupid(&self, v: u32) {
        self.cpupid.store(v, Ordering::Relaxed);
    }

    /// Store a new hint and return the previous one
    pub fn xchg_cpupid(&self, v: u32) -> u32 {
        self.cpupid.swap(v, Ordering::Relaxed)
    }

    pub fn memcg(&self) -> u32 {
        self.memcg.load(Ordering::Relaxed)
    }

    pub fn set_memcg(&self, id: u32) {
        self.memcg.store(id, Ordering::Relaxed);
    }

    // ========================================================================
    // Reference counting
    // ========================================================================

    /// Run `f` on the frame that carries the counts for this one
    fn with_head<R>(&self, f: impl FnOnce(&Frame) -> R) -> R {
        let head = match &*self.compound.lock() {
            Compound::Member { head, .. } => head.upgrade(),
            _ => None,
        };
        match head {
            Some(head) => f(&head),
            None => f(self),
        }
    }

    pub fn ref_count(&self) -> u32 {
        self.with_head(|f| f.refcount.load(Ordering::SeqCst))
    }

    /// Take a reference
    pub fn get(&self) {
        self.with_head(|f| {
            let prev = f.refcount.fetch_add(1, Ordering::SeqCst);
            debug_assert!(prev != REF_FROZEN, "get on frozen frame {}", f.pfn);
        });
    }

    /// Take a reference unless the frame is free or frozen
    pub fn try_get(&self) -> bool {
        self.with_head(|f| {
            let idle = idle_count(f.node.kind());
            let mut cur = f.refcount.load(Ordering::SeqCst);
            loop {
                if cur <= idle || cur == REF_FROZEN {
                    return false;
                }
                match f.refcount.compare_exchange_weak(
                    cur,
                    cur + 1,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                ) {
                    Ok(_) => return true,
                    Err(now) => cur = now,
                }
            }
        })
    }

    /// Drop a reference; returns true if the frame became free
    pub fn put(&self) -> bool {
        self.with_head(|f| {
            let prev = f.refcount.fetch_sub(1, Ordering::SeqCst);
            debug_assert!(prev != 0 && prev != REF_FROZEN, "put on free frame {}", f.pfn);
            let idle = idle_count(f.node.kind());
            if prev == idle + 1 {
                f.release();
                true
            } else {
                false
            }
        })
    }

    /// Add `n` references at once
    pub fn add_refs(&self, n: u32) {
        self.with_head(|f| {
            f.refcount.fetch_add(n, Ordering::SeqCst);
        });
    }

    /// Freeze the count if it equals `expected` exactly
    pub fn freeze(&self, expected: u32) -> bool {
        self.with_head(|f| {
            f.refcount
                .compare_exchange(expected, REF_FROZEN, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        })
    }

    /// Leave the frozen state with `count` references
    pub fn unfreeze(&self, count: u32) {
        self.with_head(|f| {
            debug_assert_eq!(f.refcount.load(Ordering::SeqCst), REF_FROZEN);
            f.refcount.store(count, Ordering::SeqCst);
        });
    }

    pub fn is_frozen(&self) -> bool {
        self.with_head(|f| f.refcount.load(Ordering::SeqCst) == REF_FROZEN)
    }

    /// Allocate: move from the idle count to one reference
    pub(crate) fn try_claim(&self) -> bool {
        let idle = idle_count(self.node.kind());
        if self.has_flags(FrameFlags::HWPOISON) {
            return false;
        }
        if matches!(*self.compound.lock(), Compound::Member { .. }) {
            return false;
        }
        self.refcount
            .compare_exchange(idle, idle + 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Set the count outright while the frame is private to its allocator
    /// or to a split in progress
    pub(crate) fn set_ref_count(&self, count: u32) {
        self.refcount.store(count, Ordering::SeqCst);
    }

    /// Return the frame to its idle state
    fn release(&self) {
        log::trace!("frame {}: released", self.pfn);
        if self.is_lru() {
            self.node.lru_del(self.pfn);
        }
        let keep = self.flags().intersection(FrameFlags::HWPOISON);
        self.flags.store(keep.bits(), Ordering::SeqCst);
        *self.owner.lock() = FrameOwner::default();
        self.cpupid.store(0, Ordering::Relaxed);
        self.memcg.store(0, Ordering::Relaxed);
        self.rmap.lock().clear();
        self.mapcount.store(0, Ordering::SeqCst);
        let mut nr = 1;
        let old = core::mem::take(&mut *self.compound.lock());
        if let Compound::Head { tails, .. } = old {
            nr += tails.len();
            for tail in tails {
                *tail.compound.lock() = Compound::Standalone;
                tail.flags.store(0, Ordering::SeqCst);
                *tail.owner.lock() = FrameOwner::default();
            }
        }
        if keep.is_empty() {
            self.node.account_free(nr);
        }
    }

    // ========================================================================
    // Map count
    // ========================================================================

    /// Number of page-table entries mapping this frame (or its group)
    pub fn mapcount(&self) -> u32 {
        self.with_head(|f| f.mapcount.load(Ordering::SeqCst))
    }

    pub fn is_mapped(&self) -> bool {
        self.mapcount() > 0
    }

    pub(crate) fn inc_mapcount(&self) {
        self.with_head(|f| {
            f.mapcount.fetch_add(1, Ordering::SeqCst);
        });
    }

    pub(crate) fn dec_mapcount(&self) {
        self.with_head(|f| {
            f.mapcount.fetch_sub(1, Ordering::SeqCst);
        });
    }

    pub(crate) fn set_mapcount(&self, n: u32) {
        self.mapcount.store(n, Ordering::SeqCst);
    }

    // ========================================================================
    // Lock bit
    // ========================================================================

    /// Try to take the frame lock
    pub fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Take the frame lock, waiting for the holder
    pub fn lock(&self) {
        while !self.try_lock() {
            while self.locked.load(Ordering::Relaxed) {
                crate::cond_resched();
            }
        }
    }

    pub fn unlock(&self) {
        let was = self.locked.swap(false, Ordering::Release);
        debug_assert!(was, "unlock of unlocked frame {}", self.pfn);
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    // ========================================================================
    // Writeback
    // ========================================================================

    pub fn set_writeback(&self) {
        self.set_flags(FrameFlags::WRITEBACK);
    }

    /// Finish writeback, releasing anyone in `wait_on_writeback`
    pub fn end_writeback(&self) {
        self.clear_flags(FrameFlags::WRITEBACK);
    }

    pub fn wait_on_writeback(&self) {
        while self.is_writeback() {
            crate::cond_resched();
        }
    }

    // ========================================================================
    // Owner
    // ========================================================================

    pub fn owner(&self) -> MutexGuard<'_, FrameOwner> {
        self.owner.lock()
    }

    pub fn mapping(&self) -> Option<Arc<AddressSpace>> {
        self.owner.lock().mapping.clone()
    }

    pub fn anon_vma(&self) -> Option<Arc<AnonVma>> {
        self.owner.lock().anon.clone()
    }

    pub fn is_anon(&self) -> bool {
        self.owner.lock().anon.is_some()
    }

    pub fn index(&self) -> u64 {
        self.owner.lock().index
    }

    pub fn movable_ops(&self) -> Option<Arc<dyn MovableOps>> {
        self.owner.lock().movable.clone()
    }

    /// Mark as driver-managed with `ops`
    pub fn set_movable(&self, ops: Arc<dyn MovableOps>) {
        self.owner.lock().movable = Some(ops);
        self.set_flags(FrameFlags::MOVABLE);
    }

    /// Driver drops its claim; the frame stays marked driver-managed
    pub fn clear_movable(&self) {
        self.owner.lock().movable = None;
    }

    /// Clear `flags` and return which of them were set
    pub fn take_flags(&self, flags: FrameFlags) -> FrameFlags {
        let prev = self.flags.fetch_and(!flags.bits(), Ordering::SeqCst);
        FrameFlags::from_bits_truncate(prev).intersection(flags)
    }

    /// Attach counted private data, taking the reference it holds
    pub fn attach_private(&self, private: Private) {
        self.owner.lock().private = private;
        self.set_flags(FrameFlags::PRIVATE);
        self.get();
    }

    /// Detach private data, returning it and the reference it held
    pub fn detach_private(&self) -> Private {
        let private = core::mem::take(&mut self.owner.lock().private);
        if self.test_and_clear(FrameFlags::PRIVATE) {
            self.put();
        }
        private
    }

    /// Store an uncounted private word (swap entry, pool tag)
    pub fn set_private_word(&self, word: u64) {
        self.owner.lock().private = Private::Word(word);
    }

    pub fn private_word(&self) -> Option<u64> {
        match self.owner.lock().private {
            Private::Word(w) => Some(w),
            _ => None,
        }
    }

    pub fn buffers(&self) -> Option<Arc<BufferRing>> {
        match &self.owner.lock().private {
            Private::Buffers(ring) => Some(ring.clone()),
            _ => None,
        }
    }

    // ========================================================================
    // Compound
    // ========================================================================

    pub fn compound(&self) -> MutexGuard<'_, Compound> {
        self.compound.lock()
    }

    pub fn is_head(&self) -> bool {
        matches!(*self.compound.lock(), Compound::Head { .. })
    }

    pub fn is_tail(&self) -> bool {
        matches!(*self.compound.lock(), Compound::Member { .. })
    }

    pub fn is_compound(&self) -> bool {
        !matches!(*self.compound.lock(), Compound::Standalone)
    }

    /// Head of the group, if this is a member
    pub fn head(&self) -> Option<FrameRef> {
        match &*self.compound.lock() {
            Compound::Member { head, .. } => head.upgrade(),
            _ => None,
        }
    }

    pub fn compound_kind(&self) -> Option<CompoundKind> {
        match &*self.compound.lock() {
            Compound::Head { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub fn order(&self) -> u32 {
        match &*self.compound.lock() {
            Compound::Head { order, .. } => *order,
            _ => 0,
        }
    }

    /// Frames covered by this frame's group (1 unless a head)
    pub fn nr_pages(&self) -> usize {
        1usize << self.order()
    }

    pub fn is_transhuge(&self) -> bool {
        self.compound_kind() == Some(CompoundKind::Transparent)
    }

    pub fn is_hugetlb(&self) -> bool {
        matches!(self.compound_kind(), Some(CompoundKind::HugeTlb(_)))
    }

    /// Members after the head
    pub fn tails(&self) -> Vec<FrameRef> {
        match &*self.compound.lock() {
            Compound::Head { tails, .. } => tails.clone(),
            _ => Vec::new(),
        }
    }

    pub(crate) fn set_compound(&self, role: Compound) {
        *self.compound.lock() = role;
    }

    // ========================================================================
    // Content
    // ========================================================================

    pub fn data(&self) -> MutexGuard<'_, Box<[u8]>> {
        self.data.lock()
    }

    /// Fill the frame's content with `byte`
    pub fn fill(&self, byte: u8) {
        self.data.lock().fill(byte);
    }

    pub fn read_byte(&self, offset: usize) -> u8 {
        self.data.lock()[offset % PAGE_SIZE]
    }

    pub fn write_byte(&self, offset: usize, byte: u8) {
        self.data.lock()[offset % PAGE_SIZE] = byte;
    }

    // ========================================================================
    // Reverse map
    // ========================================================================

    pub(crate) fn rmap_add(&self, mm: &Arc<Mm>, addr: u64) {
        self.rmap.lock().push(RmapSite {
            mm: Arc::downgrade(mm),
            addr,
        });
    }

    pub(crate) fn rmap_remove(&self, mm: &Arc<Mm>, addr: u64) {
        let mut rmap = self.rmap.lock();
        if let Some(pos) = rmap
            .iter()
            .position(|s| s.addr == addr && Weak::ptr_eq(&s.mm, &Arc::downgrade(mm)))
        {
            rmap.swap_remove(pos);
        }
    }

    /// Sites mapping this frame
    pub fn rmap_sites(&self) -> Vec<RmapSite> {
        self.rmap.lock().clone()
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("pfn", &self.pfn)
            .field("node", &self.node.id())
            .field("refcount", &self.refcount.load(Ordering::Relaxed))
            .field("mapcount", &self.mapcount.load(Ordering::Relaxed))
            .field("locked", &self.is_locked())
            .field("flags", &self.flags())
            .finish()
    }
}

/// Count a free frame sits at
const fn idle_count(kind: NodeKind) -> u32 {
    match kind {
        NodeKind::Device => 1,
        _ => 0,
    }
}

/// Whether two handles name the same frame
pub fn same_frame(a: &Frame, b: &Frame) -> bool {
    core::ptr::eq(a, b)
}

// ============================================================================
// Helpers
// ============================================================================

/// Convert address to page number
pub const fn addr_to_pfn(addr: u64) -> Pfn {
    addr >> PAGE_SHIFT
}

/// Round address down to page boundary
pub const fn trunc_page(addr: u64) -> u64 {
    addr & !(PAGE_SIZE as u64 - 1)
}

/// Round address up to page boundary
pub const fn round_page(addr: u64) -> u64 {
    (addr + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1)
}

pub const fn page_aligned(addr: u64) -> bool {
    addr & (PAGE_SIZE as u64 - 1) == 0
}

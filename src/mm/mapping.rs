//! Address Spaces, Anonymous Lifetime Tokens and Migration Capabilities
//!
//! An `AddressSpace` is a file, shmem or swap cache: an index-keyed slot
//! table behind a single lock. Each slot holds exactly one frame, and the
//! frame holds one reference per slot it fills.
//!
//! The capabilities a container format or a driver plugs into the engine
//! are the traits at the bottom of this file. Which one runs is decided by
//! the closed `MigrateHandler` set recorded on the address space, or by
//! the driver ops recorded on a driver-managed frame.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use spin::{Mutex, MutexGuard};

use crate::error::{MigrateError, Result};
use crate::migrate::MigrateMode;
use crate::mm::frame::{Frame, FrameFlags, FrameRef};
use crate::mm::node::NodeStat;

static NEXT_SPACE_ID: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// Capabilities
// ============================================================================

/// Format-specific migration hook of an address space
pub trait MappingMigrate: Send + Sync {
    /// Move `old`'s slot and content to `new`, honouring the expected
    /// reference contract of the identity swap. Both frames are locked.
    fn migrate(
        &self,
        mapping: &Arc<AddressSpace>,
        new: &FrameRef,
        old: &FrameRef,
        mode: MigrateMode,
    ) -> Result<()>;

    /// Prepare `frame` for migration; false refuses it
    fn isolate(&self, _frame: &FrameRef, _mode: MigrateMode) -> bool {
        true
    }

    /// Undo `isolate` after a failed migration
    fn putback(&self, _frame: &FrameRef) {}
}

/// Driver capability for driver-managed frames, which never sit on LRU lists
pub trait MovableOps: Send + Sync {
    /// Take `frame` off the driver's own lists; false refuses it
    fn isolate(&self, frame: &FrameRef, mode: MigrateMode) -> bool;

    /// Move the driver's state from `old` to `new`. Both frames are locked.
    fn migrate(&self, new: &FrameRef, old: &FrameRef, mode: MigrateMode) -> Result<()>;

    /// Return `frame` to the driver's lists after a failed migration
    fn putback(&self, frame: &FrameRef);
}

/// Writes a dirty cached frame back to its store
pub trait PageWriter: Send + Sync {
    /// Start writeback of `frame`. The frame is locked and its dirty bit
    /// has been cleared for I/O.
    fn writepage(&self, frame: &FrameRef) -> Result<()>;
}

/// How a cached frame of an address space migrates
#[derive(Clone, Default)]
pub enum MigrateHandler {
    /// No hook: clean frames take the generic path, dirty ones are
    /// written out first
    #[default]
    None,
    /// Identity swap plus content copy
    Simple,
    /// Block-backed cache with buffer rings
    Buffers { check_refs: bool },
    /// Hugetlb pool file
    HugeTlb,
    /// Format-specific hook
    Custom(Arc<dyn MappingMigrate>),
}

impl fmt::Debug for MigrateHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Simple => write!(f, "Simple"),
            Self::Buffers { check_refs } => write!(f, "Buffers(check_refs={})", check_refs),
            Self::HugeTlb => write!(f, "HugeTlb"),
            Self::Custom(_) => write!(f, "Custom"),
        }
    }
}

// ============================================================================
// Address Space
// ============================================================================

/// What an address space caches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceKind {
    File,
    /// Swap-backed file (tmpfs)
    Shmem,
    Swap,
}

/// A file, shmem or swap cache
pub struct AddressSpace {
    id: u64,
    kind: SpaceKind,
    slots: Mutex<BTreeMap<u64, FrameRef>>,
    /// Serializes buffer ring attach/detach against reference checks
    pub private_lock: Mutex<()>,
    handler: MigrateHandler,
    writer: Option<Arc<dyn PageWriter>>,
    account_dirty: bool,
}

impl AddressSpace {
    pub fn new(kind: SpaceKind, handler: MigrateHandler) -> Self {
        Self {
            id: NEXT_SPACE_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            slots: Mutex::new(BTreeMap::new()),
            private_lock: Mutex::new(()),
            handler,
            writer: None,
            account_dirty: kind != SpaceKind::Swap,
        }
    }

    /// Swap cache
    pub fn swap() -> Self {
        Self::new(SpaceKind::Swap, MigrateHandler::Simple)
    }

    pub fn with_writer(mut self, writer: Arc<dyn PageWriter>) -> Self {
        self.writer = Some(writer);
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> SpaceKind {
        self.kind
    }

    pub fn handler(&self) -> &MigrateHandler {
        &self.handler
    }

    pub fn writer(&self) -> Option<&Arc<dyn PageWriter>> {
        self.writer.as_ref()
    }

    /// Dirty frames count toward the node's dirty accounting
    pub fn account_dirty(&self) -> bool {
        self.account_dirty
    }

    /// The slot table, locked
    pub fn slots(&self) -> MutexGuard<'_, BTreeMap<u64, FrameRef>> {
        self.slots.lock()
    }

    /// Occupant of slot `index`
    pub fn lookup(&self, index: u64) -> Option<FrameRef> {
        self.slots.lock().get(&index).cloned()
    }

    pub fn nr_slots(&self) -> usize {
        self.slots.lock().len()
    }

    /// Insert `frame` (and every member of its group) at `index`.
    /// Each slot filled takes one reference.
    pub fn add_frame(self: &Arc<Self>, frame: &FrameRef, index: u64) -> Result<()> {
        let nr = slot_span(frame) as u64;
        let mut slots = self.slots.lock();
        if (index..index + nr).any(|i| slots.contains_key(&i)) {
            return Err(MigrateError::Busy);
        }
        for i in index..index + nr {
            slots.insert(i, frame.clone());
        }
        drop(slots);

        {
            let mut owner = frame.owner();
            owner.mapping = Some(self.clone());
            owner.index = index;
        }
        frame.add_refs(nr as u32);
        let stats = &frame.node_data().stats;
        match self.kind {
            SpaceKind::Swap => frame.set_flags(FrameFlags::SWAPCACHE | FrameFlags::SWAPBACKED),
            SpaceKind::Shmem => {
                frame.set_flags(FrameFlags::SWAPBACKED);
                stats.add(NodeStat::Shmem, nr as i64);
            }
            SpaceKind::File => {}
        }
        stats.add(NodeStat::FilePages, nr as i64);
        if frame.is_dirty() && self.account_dirty {
            stats.add(NodeStat::FileDirty, nr as i64);
            stats.add(NodeStat::WritePending, nr as i64);
        }
        Ok(())
    }

    /// Remove `frame` from the cache, dropping the slot references
    pub fn remove_frame(&self, frame: &FrameRef) -> Result<()> {
        let index = frame.index();
        let nr = slot_span(frame) as u64;
        let mut slots = self.slots.lock();
        match slots.get(&index) {
            Some(cur) if Arc::ptr_eq(cur, frame) => {}
            _ => return Err(MigrateError::NoEnt),
        }
        for i in index..index + nr {
            slots.remove(&i);
        }
        drop(slots);

        frame.owner().mapping = None;
        frame.clear_flags(FrameFlags::SWAPCACHE);
        let stats = &frame.node_data().stats;
        stats.add(NodeStat::FilePages, -(nr as i64));
        if self.kind == SpaceKind::Shmem {
            stats.add(NodeStat::Shmem, -(nr as i64));
        }
        if frame.is_dirty() && self.account_dirty {
            stats.add(NodeStat::FileDirty, -(nr as i64));
            stats.add(NodeStat::WritePending, -(nr as i64));
        }
        for _ in 0..nr {
            frame.put();
        }
        Ok(())
    }

    /// Frames currently cached, in index order, without duplicates for groups
    pub fn frames(&self) -> Vec<FrameRef> {
        let slots = self.slots.lock();
        let mut out: Vec<FrameRef> = Vec::new();
        for frame in slots.values() {
            if !out.last().map(|l| Arc::ptr_eq(l, frame)).unwrap_or(false) {
                out.push(frame.clone());
            }
        }
        out
    }
}

/// Slots a frame fills: one per member, except hugetlb pages which are
/// cached whole under a single index
pub fn slot_span(frame: &Frame) -> usize {
    if frame.is_hugetlb() {
        1
    } else {
        frame.nr_pages()
    }
}

impl fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressSpace")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("handler", &self.handler)
            .finish()
    }
}

// ============================================================================
// Anonymous lifetime token
// ============================================================================

/// Lifetime token shared by anonymous frames of one mapping family.
///
/// Pins are advisory: they keep the token alive across a migration even
/// if the last mapping goes away, and a failed pin only means the
/// migration runs without it.
#[derive(Debug)]
pub struct AnonVma {
    id: u64,
    refcount: AtomicU32,
}

impl AnonVma {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_SPACE_ID.fetch_add(1, Ordering::Relaxed),
            refcount: AtomicU32::new(1),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn ref_count(&self) -> u32 {
        self.refcount.load(Ordering::SeqCst)
    }

    /// Pin the token unless it is already dead
    pub fn pin(self: &Arc<Self>) -> Option<AnonPin> {
        let mut cur = self.refcount.load(Ordering::SeqCst);
        loop {
            if cur == 0 {
                return None;
            }
            match self.refcount.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Some(AnonPin(self.clone())),
                Err(now) => cur = now,
            }
        }
    }

    /// Drop the owning mappings' reference
    pub fn retire(&self) {
        self.refcount.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A pin on an `AnonVma`, released on drop
#[derive(Debug)]
pub struct AnonPin(Arc<AnonVma>);

impl AnonPin {
    pub fn anon_vma(&self) -> &Arc<AnonVma> {
        &self.0
    }
}

impl Drop for AnonPin {
    fn drop(&mut self) {
        self.0.refcount.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::node::{Node, NodeKind};

    #[test]
    fn test_add_remove_frame() {
        let node = Node::new(0, NodeKind::Cpu, 0, 4);
        let space = Arc::new(AddressSpace::new(SpaceKind::File, MigrateHandler::Simple));
        let f = node.alloc_frame().unwrap();
        space.add_frame(&f, 3).unwrap();
        assert_eq!(f.ref_count(), 2);
        assert_eq!(f.index(), 3);
        assert!(Arc::ptr_eq(&space.lookup(3).unwrap(), &f));
        assert_eq!(node.data().stats.get(NodeStat::FilePages), 1);
        assert_eq!(space.add_frame(&f, 3), Err(MigrateError::Busy));

        space.remove_frame(&f).unwrap();
        assert_eq!(f.ref_count(), 1);
        assert!(space.lookup(3).is_none());
        assert_eq!(node.data().stats.get(NodeStat::FilePages), 0);
    }

    #[test]
    fn test_anon_pin() {
        let anon = AnonVma::new();
        let pin = anon.pin().unwrap();
        assert_eq!(anon.ref_count(), 2);
        drop(pin);
        anon.retire();
        assert!(anon.pin().is_none());
    }
}

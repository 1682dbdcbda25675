//! Process Address Spaces and Page Tables
//!
//! An `Mm` is one process's address-space descriptor: the VMA list under
//! the mmap reader/writer lock, the page table under its own lock, and the
//! secondary-MMU notifiers that must see every edit bracketed.
//!
//! ## Key Operations
//!
//! - `map` / `unmap`: install or drop a normal mapping
//! - `try_to_unmap`: replace every mapping of a frame with a migration entry
//! - `remove_migration_ptes`: point migration entries at the final frame
//! - `fault`: resolve an address, waiting out in-flight migrations
//!
//! ## Migration entries
//!
//! A migration entry names the frame being moved. Anyone resolving it
//! waits until that frame's lock drops and then looks again; by then the
//! entry has been rewritten to the new frame (commit) or back to the old
//! one (rollback). Migration entries hold no frame reference.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use spin::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{MigrateError, Result};
use crate::mm::frame::{page_aligned, FrameFlags, FrameRef, PAGE_SHIFT, PAGE_SIZE};
use crate::mm::mapping::{AddressSpace, AnonVma};

static NEXT_MM_ID: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// VMA
// ============================================================================

/// VMA protection and behaviour flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VmFlags(u32);

impl VmFlags {
    pub const READ: Self = Self(0x0001);
    pub const WRITE: Self = Self(0x0002);
    pub const EXEC: Self = Self(0x0004);
    pub const SHARED: Self = Self(0x0008);
    /// mlock()ed
    pub const LOCKED: Self = Self(0x0010);
    /// Memory-mapped I/O, never migrated
    pub const IO: Self = Self(0x0020);
    /// Raw pfn mapping without frames
    pub const PFNMAP: Self = Self(0x0040);
    /// Backed by a hugetlb pool
    pub const HUGETLB: Self = Self(0x0080);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    pub const fn intersects(&self, other: Self) -> bool {
        (self.0 & other.0) != 0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl core::ops::BitOr for VmFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

/// What backs a VMA
#[derive(Debug, Clone)]
pub enum VmaBacking {
    Anon(Arc<AnonVma>),
    File { space: Arc<AddressSpace>, pgoff: u64 },
}

/// Virtual memory area
#[derive(Debug, Clone)]
pub struct Vma {
    pub start: u64,
    pub end: u64,
    pub flags: VmFlags,
    pub backing: VmaBacking,
}

impl Vma {
    pub fn anon(start: u64, end: u64, flags: VmFlags) -> Self {
        Self {
            start,
            end,
            flags,
            backing: VmaBacking::Anon(AnonVma::new()),
        }
    }

    pub fn file(start: u64, end: u64, flags: VmFlags, space: Arc<AddressSpace>, pgoff: u64) -> Self {
        Self {
            start,
            end,
            flags,
            backing: VmaBacking::File { space, pgoff },
        }
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self.backing, VmaBacking::Anon(_))
    }

    pub fn anon_vma(&self) -> Option<&Arc<AnonVma>> {
        match &self.backing {
            VmaBacking::Anon(anon) => Some(anon),
            VmaBacking::File { .. } => None,
        }
    }

    /// Offset key of `addr` in the backing object
    pub fn linear_index(&self, addr: u64) -> u64 {
        let pgoff = match &self.backing {
            VmaBacking::Anon(_) => self.start >> PAGE_SHIFT,
            VmaBacking::File { pgoff, .. } => *pgoff,
        };
        ((addr - self.start) >> PAGE_SHIFT) + pgoff
    }

    /// Frames in this VMA may be migrated at all
    pub fn migratable(&self) -> bool {
        !self.flags.intersects(VmFlags::IO | VmFlags::PFNMAP)
    }

    pub fn writable(&self) -> bool {
        self.flags.contains(VmFlags::WRITE)
    }
}

// ============================================================================
// Page table entries
// ============================================================================

/// Page table entry
#[derive(Debug, Clone)]
pub enum Pte {
    /// Normal mapping; `huge` maps a whole compound group
    Present {
        frame: FrameRef,
        writable: bool,
        dirty: bool,
        huge: bool,
    },
    /// Placeholder while `frame` migrates
    Migration {
        frame: FrameRef,
        writable: bool,
        dirty: bool,
        huge: bool,
    },
    /// Mapping of device memory the CPU cannot reach
    DevicePrivate { frame: FrameRef, writable: bool },
}

impl Pte {
    pub fn frame(&self) -> &FrameRef {
        match self {
            Pte::Present { frame, .. } | Pte::Migration { frame, .. } => frame,
            Pte::DevicePrivate { frame, .. } => frame,
        }
    }

    pub fn is_huge(&self) -> bool {
        match self {
            Pte::Present { huge, .. } | Pte::Migration { huge, .. } => *huge,
            Pte::DevicePrivate { .. } => false,
        }
    }

    pub fn is_migration(&self) -> bool {
        matches!(self, Pte::Migration { .. })
    }

    /// Bytes covered by this entry
    pub fn span(&self) -> u64 {
        if self.is_huge() {
            (self.frame().nr_pages() * PAGE_SIZE) as u64
        } else {
            PAGE_SIZE as u64
        }
    }
}

// ============================================================================
// Secondary MMU notifiers
// ============================================================================

/// Observer of page table edits (secondary MMUs, device TLBs)
pub trait MmuNotifier: Send + Sync {
    fn invalidate_range_start(&self, start: u64, end: u64);
    fn invalidate_range_end(&self, start: u64, end: u64);
}

/// Open invalidation bracket; closes on drop
pub struct InvalidateGuard<'a> {
    mm: &'a Mm,
    start: u64,
    end: u64,
}

impl Drop for InvalidateGuard<'_> {
    fn drop(&mut self) {
        let notifiers = self.mm.notifiers.lock().clone();
        for n in &notifiers {
            n.invalidate_range_end(self.start, self.end);
        }
        self.mm.invalidating.fetch_sub(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Migration records
// ============================================================================

/// One migration entry installed by `try_to_unmap`
#[derive(Debug, Clone)]
pub struct MigrationSite {
    pub mm: Arc<Mm>,
    pub addr: u64,
}

/// Migration entries installed while unmapping one frame
#[derive(Debug, Clone, Default)]
pub struct UnmapRecord {
    sites: Vec<MigrationSite>,
}

impl UnmapRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, mm: Arc<Mm>, addr: u64) {
        self.sites.push(MigrationSite { mm, addr });
    }

    pub fn sites(&self) -> &[MigrationSite] {
        &self.sites
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }
}

// ============================================================================
// Mm
// ============================================================================

/// Process address-space descriptor
pub struct Mm {
    id: u64,
    mmap_lock: RwLock<()>,
    vmas: RwLock<Vec<Vma>>,
    ptes: Mutex<BTreeMap<u64, Pte>>,
    notifiers: Mutex<Vec<Arc<dyn MmuNotifier>>>,
    invalidating: AtomicU32,
}

impl core::fmt::Debug for Mm {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Mm").field("id", &self.id).finish()
    }
}

impl Mm {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_MM_ID.fetch_add(1, Ordering::Relaxed),
            mmap_lock: RwLock::new(()),
            vmas: RwLock::new(Vec::new()),
            ptes: Mutex::new(BTreeMap::new()),
            notifiers: Mutex::new(Vec::new()),
            invalidating: AtomicU32::new(0),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Shared hold on the address-space structure
    pub fn mmap_read(&self) -> RwLockReadGuard<'_, ()> {
        self.mmap_lock.read()
    }

    /// Exclusive hold on the address-space structure
    pub fn mmap_write(&self) -> RwLockWriteGuard<'_, ()> {
        self.mmap_lock.write()
    }

    pub fn add_vma(&self, vma: Vma) -> Result<()> {
        if vma.start >= vma.end || !page_aligned(vma.start) || !page_aligned(vma.end) {
            return Err(MigrateError::Inval);
        }
        let mut vmas = self.vmas.write();
        if vmas.iter().any(|v| v.start < vma.end && vma.start < v.end) {
            return Err(MigrateError::Inval);
        }
        vmas.push(vma);
        Ok(())
    }

    /// VMA covering `addr`
    pub fn find_vma(&self, addr: u64) -> Option<Vma> {
        self.vmas.read().iter().find(|v| v.contains(addr)).cloned()
    }

    pub fn register_notifier(&self, notifier: Arc<dyn MmuNotifier>) {
        self.notifiers.lock().push(notifier);
    }

    /// Open an invalidation bracket over `[start, end)`
    pub fn invalidate_range(&self, start: u64, end: u64) -> InvalidateGuard<'_> {
        self.invalidating.fetch_add(1, Ordering::SeqCst);
        let notifiers = self.notifiers.lock().clone();
        for n in &notifiers {
            n.invalidate_range_start(start, end);
        }
        InvalidateGuard {
            mm: self,
            start,
            end,
        }
    }

    /// Invalidation brackets currently open
    pub fn invalidations_in_progress(&self) -> u32 {
        self.invalidating.load(Ordering::SeqCst)
    }

    pub(crate) fn page_table(&self) -> MutexGuard<'_, BTreeMap<u64, Pte>> {
        self.ptes.lock()
    }

    /// Entry covering `addr`, with the address it starts at
    pub fn lookup(&self, addr: u64) -> Option<(u64, Pte)> {
        let ptes = self.ptes.lock();
        lookup_locked(&ptes, addr)
    }

    /// Map `frame` at `addr`. A compound head maps its whole group with
    /// one huge entry.
    pub fn map(self: &Arc<Self>, addr: u64, frame: &FrameRef, writable: bool) -> Result<()> {
        let vma = self.find_vma(addr).ok_or(MigrateError::Fault)?;
        let huge = frame.is_head();
        let span = (frame.nr_pages() * PAGE_SIZE) as u64;
        if addr % span != 0 || addr + span > vma.end {
            return Err(MigrateError::Inval);
        }
        if let Some(anon) = vma.anon_vma() {
            let mut owner = frame.owner();
            if owner.anon.is_none() && owner.mapping.is_none() {
                owner.anon = Some(anon.clone());
                owner.index = vma.linear_index(addr);
                drop(owner);
                frame.set_flags(FrameFlags::SWAPBACKED);
            }
        }

        let _inv = self.invalidate_range(addr, addr + span);
        let mut ptes = self.ptes.lock();
        if ptes.range(addr..addr + span).next().is_some() || lookup_locked(&ptes, addr).is_some() {
            return Err(MigrateError::Busy);
        }
        let pte = if frame.is_device_private() {
            Pte::DevicePrivate {
                frame: frame.clone(),
                writable: writable && vma.writable(),
            }
        } else {
            Pte::Present {
                frame: frame.clone(),
                writable: writable && vma.writable(),
                dirty: false,
                huge,
            }
        };
        // Counts follow the entry under the same guard
        frame.get();
        frame.inc_mapcount();
        frame.rmap_add(self, addr);
        ptes.insert(addr, pte);
        Ok(())
    }

    /// Drop the mapping at `addr`. A migration entry belongs to the
    /// migration in flight and is left alone.
    pub fn unmap(self: &Arc<Self>, addr: u64) -> Result<()> {
        loop {
            let (base, span) = match self.lookup(addr) {
                Some((base, pte)) => (base, pte.span()),
                None => return Err(MigrateError::NoEnt),
            };
            let _inv = self.invalidate_range(base, base + span);
            let mut ptes = self.ptes.lock();
            match lookup_locked(&ptes, addr) {
                None => return Err(MigrateError::NoEnt),
                Some((_, Pte::Migration { .. })) => return Err(MigrateError::Busy),
                // Split or remapped since the lookup; bracket the new range
                Some((b, pte)) if b != base || pte.span() != span => continue,
                Some(_) => {}
            }
            let frame = match ptes.remove(&base) {
                Some(Pte::Present { frame, .. }) | Some(Pte::DevicePrivate { frame, .. }) => frame,
                _ => return Err(MigrateError::NoEnt),
            };
            frame.dec_mapcount();
            frame.rmap_remove(self, base);
            drop(ptes);
            frame.put();
            return Ok(());
        }
    }

    /// Mark the entry at `addr` dirty, as a CPU write would
    pub fn mark_dirty(&self, addr: u64) {
        let mut ptes = self.ptes.lock();
        if let Some((base, _)) = lookup_locked(&ptes, addr) {
            if let Some(Pte::Present { dirty, .. }) = ptes.get_mut(&base) {
                *dirty = true;
            }
        }
    }

    /// Resolve `addr` to its frame, waiting out any migration in flight
    pub fn fault(&self, addr: u64) -> Result<FrameRef> {
        loop {
            match self.lookup(addr) {
                None => return Err(MigrateError::NoEnt),
                Some((_, Pte::Present { frame, .. })) => return Ok(frame),
                Some((_, Pte::DevicePrivate { .. })) => return Err(MigrateError::Fault),
                Some((_, Pte::Migration { .. })) => migration_entry_wait(self, addr),
            }
        }
    }
}

fn lookup_locked(ptes: &BTreeMap<u64, Pte>, addr: u64) -> Option<(u64, Pte)> {
    let (&base, pte) = ptes.range(..=addr).next_back()?;
    if addr < base + pte.span() {
        Some((base, pte.clone()))
    } else {
        None
    }
}

// ============================================================================
// Unmap / remap
// ============================================================================

/// Replace every mapping of `frame` with a migration entry.
///
/// Each replaced mapping gives up its frame reference and map count; a
/// dirty entry passes its dirty bit to the frame. The caller holds the
/// frame lock.
pub fn try_to_unmap(frame: &FrameRef) -> UnmapRecord {
    let mut record = UnmapRecord::new();
    for site in frame.rmap_sites() {
        let mm = match site.mm.upgrade() {
            Some(mm) => mm,
            None => continue,
        };
        let span = (frame.nr_pages() * PAGE_SIZE) as u64;
        let _inv = mm.invalidate_range(site.addr, site.addr + span);
        let mut ptes = mm.ptes.lock();
        let replaced = match ptes.get(&site.addr) {
            Some(Pte::Present {
                frame: cur,
                writable,
                dirty,
                huge,
            }) if Arc::ptr_eq(cur, frame) => Some(Pte::Migration {
                frame: frame.clone(),
                writable: *writable,
                dirty: *dirty,
                huge: *huge,
            }),
            Some(Pte::DevicePrivate { frame: cur, writable }) if Arc::ptr_eq(cur, frame) => {
                Some(Pte::Migration {
                    frame: frame.clone(),
                    writable: *writable,
                    dirty: false,
                    huge: false,
                })
            }
            _ => None,
        };
        if let Some(entry) = replaced {
            if let Pte::Migration { dirty: true, .. } = entry {
                frame.set_dirty();
            }
            ptes.insert(site.addr, entry);
            frame.dec_mapcount();
            frame.rmap_remove(&mm, site.addr);
            drop(ptes);
            frame.put();
            record.push(mm.clone(), site.addr);
        }
    }
    log::trace!(
        "frame {}: unmapped {} sites, mapcount now {}",
        frame.pfn(),
        record.len(),
        frame.mapcount()
    );
    record
}

/// Rewrite one migration entry for `old` at `addr` to map `target`.
/// Returns false if the entry no longer names `old`.
pub fn remove_migration_pte(mm: &Arc<Mm>, addr: u64, old: &FrameRef, target: &FrameRef) -> bool {
    let vma = mm.find_vma(addr);
    let _inv = mm.invalidate_range(addr, addr + (target.nr_pages() * PAGE_SIZE) as u64);
    let mut ptes = mm.ptes.lock();
    let (writable, dirty, huge) = match ptes.get(&addr) {
        Some(Pte::Migration {
            frame,
            writable,
            dirty,
            huge,
        }) if Arc::ptr_eq(frame, old) => (*writable, *dirty, *huge),
        _ => return false,
    };
    let entry = if target.is_device_private() {
        Pte::DevicePrivate {
            frame: target.clone(),
            writable,
        }
    } else {
        Pte::Present {
            frame: target.clone(),
            writable,
            dirty,
            huge,
        }
    };
    target.get();
    target.inc_mapcount();
    target.rmap_add(mm, addr);
    ptes.insert(addr, entry);
    drop(ptes);
    if vma.map(|v| v.flags.contains(VmFlags::LOCKED)).unwrap_or(false) {
        target.set_flags(FrameFlags::MLOCKED);
    }
    true
}

/// Rewrite the migration entries in `record` that still name `old` to
/// map `target`. Returns how many were rewritten.
pub fn remove_migration_ptes(record: &UnmapRecord, old: &FrameRef, target: &FrameRef) -> usize {
    let restored = record
        .sites()
        .iter()
        .filter(|site| remove_migration_pte(&site.mm, site.addr, old, target))
        .count();
    log::trace!(
        "frame {}: {} migration entries now map frame {}",
        old.pfn(),
        restored,
        target.pfn()
    );
    restored
}

/// Wait until the migration behind the entry at `addr` finishes
pub fn migration_entry_wait(mm: &Mm, addr: u64) {
    let frame = match mm.lookup(addr) {
        Some((_, Pte::Migration { frame, .. })) => frame,
        _ => return,
    };
    // A free or frozen frame means the swap is mid-commit; just look again
    if !frame.try_get() {
        crate::cond_resched();
        return;
    }
    while frame.is_locked() {
        crate::cond_resched();
    }
    frame.put();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::node::{Node, NodeKind};
    use core::sync::atomic::AtomicBool;

    struct CountingNotifier {
        starts: AtomicU32,
        ends: AtomicU32,
    }

    impl MmuNotifier for CountingNotifier {
        fn invalidate_range_start(&self, _start: u64, _end: u64) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }
        fn invalidate_range_end(&self, _start: u64, _end: u64) {
            self.ends.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn setup() -> (Node, Arc<Mm>) {
        let node = Node::new(0, NodeKind::Cpu, 0, 8);
        let mm = Mm::new();
        mm.add_vma(Vma::anon(0x10000, 0x20000, VmFlags::READ | VmFlags::WRITE))
            .unwrap();
        (node, mm)
    }

    #[test]
    fn test_map_lookup_unmap() {
        let (node, mm) = setup();
        let f = node.alloc_frame().unwrap();
        mm.map(0x11000, &f, true).unwrap();
        assert_eq!(f.ref_count(), 2);
        assert_eq!(f.mapcount(), 1);
        assert!(f.is_anon());
        let (base, pte) = mm.lookup(0x11abc).unwrap();
        assert_eq!(base, 0x11000);
        assert!(Arc::ptr_eq(pte.frame(), &f));
        assert_eq!(mm.map(0x11000, &f, true), Err(MigrateError::Busy));

        mm.unmap(0x11000).unwrap();
        assert_eq!(f.ref_count(), 1);
        assert_eq!(f.mapcount(), 0);
        assert!(mm.lookup(0x11000).is_none());
    }

    #[test]
    fn test_unmap_and_restore() {
        let (node, mm) = setup();
        let f = node.alloc_frame().unwrap();
        mm.map(0x12000, &f, true).unwrap();
        mm.mark_dirty(0x12000);

        let record = try_to_unmap(&f);
        assert_eq!(record.len(), 1);
        assert!(!f.is_mapped());
        assert!(f.is_dirty());
        assert_eq!(f.ref_count(), 1);
        assert!(mm.lookup(0x12000).unwrap().1.is_migration());

        let g = node.alloc_frame().unwrap();
        assert_eq!(remove_migration_ptes(&record, &f, &g), 1);
        assert_eq!(g.ref_count(), 2);
        assert!(Arc::ptr_eq(mm.lookup(0x12000).unwrap().1.frame(), &g));
        // Replaying is a no-op once the entry is gone
        assert_eq!(remove_migration_ptes(&record, &f, &f), 0);
    }

    #[test]
    fn test_unmap_leaves_migration_entry() {
        let (node, mm) = setup();
        let f = node.alloc_frame().unwrap();
        mm.map(0x15000, &f, true).unwrap();
        f.lock();
        let record = try_to_unmap(&f);

        assert_eq!(mm.unmap(0x15000), Err(MigrateError::Busy));
        assert!(mm.lookup(0x15000).unwrap().1.is_migration());
        assert_eq!(remove_migration_ptes(&record, &f, &f), 1);
        f.unlock();

        mm.unmap(0x15000).unwrap();
        assert_eq!(f.ref_count(), 1);
        assert_eq!(f.mapcount(), 0);
        assert!(f.rmap_sites().is_empty());
    }

    #[test]
    fn test_unmap_races_migration_entries() {
        let (node, mm) = setup();
        let f = node.alloc_frame().unwrap();
        let stop = Arc::new(AtomicBool::new(false));

        let churn = {
            let (mm, f, stop) = (mm.clone(), f.clone(), stop.clone());
            std::thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    let _ = mm.map(0x16000, &f, true);
                    let _ = mm.unmap(0x16000);
                }
            })
        };
        for _ in 0..2000 {
            f.lock();
            let record = try_to_unmap(&f);
            remove_migration_ptes(&record, &f, &f);
            f.unlock();
        }
        stop.store(true, Ordering::SeqCst);
        churn.join().unwrap();

        let _ = mm.unmap(0x16000);
        assert!(mm.lookup(0x16000).is_none());
        assert_eq!(f.ref_count(), 1);
        assert_eq!(f.mapcount(), 0);
        assert!(f.rmap_sites().is_empty());
    }

    #[test]
    fn test_invalidate_bracket() {
        let (node, mm) = setup();
        let n = Arc::new(CountingNotifier {
            starts: AtomicU32::new(0),
            ends: AtomicU32::new(0),
        });
        mm.register_notifier(n.clone());
        let f = node.alloc_frame().unwrap();
        mm.map(0x13000, &f, false).unwrap();
        {
            let _g = mm.invalidate_range(0x13000, 0x14000);
            assert_eq!(mm.invalidations_in_progress(), 1);
        }
        assert_eq!(mm.invalidations_in_progress(), 0);
        assert_eq!(n.starts.load(Ordering::SeqCst), n.ends.load(Ordering::SeqCst));
        assert!(n.starts.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn test_fault_waits_for_migration() {
        let (node, mm) = setup();
        let f = node.alloc_frame().unwrap();
        mm.map(0x14000, &f, true).unwrap();
        f.lock();
        let record = try_to_unmap(&f);

        let waiter = {
            let mm = mm.clone();
            std::thread::spawn(move || mm.fault(0x14000).map(|fr| fr.pfn()))
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        remove_migration_ptes(&record, &f, &f);
        f.unlock();
        assert_eq!(waiter.join().unwrap(), Ok(f.pfn()));
    }
}

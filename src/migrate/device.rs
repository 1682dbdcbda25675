//! Device-Memory Migration Sessions
//!
//! A driver moves a virtual range between system memory and memory the
//! CPU cannot address (or back) in four steps:
//!
//! ```text
//! setup (collect -> prepare -> unmap)   driver fills dst   pages   finalize
//! ```
//!
//! `setup` pins, locks and unmaps every unit it can, leaving migration
//! entries in the page table. The driver then supplies a destination for
//! each unit still marked `migrate` and copies the content itself (unless
//! the session copies it). `pages` swaps identities, and `finalize`
//! rewrites every migration entry to the winning frame and releases
//! everything the session holds.
//!
//! Units without a backing frame (holes) can be populated directly: the
//! driver supplies a frame for them and `pages` inserts it into the empty
//! page-table slot.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::counters::PGMIGRATE_DEVICE;
use crate::error::{MigrateError, Result};
use crate::migrate::state::migrate_page;
use crate::migrate::MigrateMode;
use crate::mm::frame::{page_aligned, FrameFlags, FrameRef, PAGE_SIZE};
use crate::mm::huge::split_huge_page;
use crate::mm::node::{isolate_lru_page, putback_lru_page};
use crate::mm::pmap::{
    remove_migration_pte, remove_migration_ptes, try_to_unmap, Mm, Pte, UnmapRecord, Vma, VmFlags,
};

const PAGE: u64 = PAGE_SIZE as u64;

// ============================================================================
// Descriptor
// ============================================================================

/// One unit of a session's `src` or `dst` array
#[derive(Debug, Clone, Default)]
pub struct MigratePfn {
    /// Backing frame, if any
    pub frame: Option<FrameRef>,
    /// `frame` is meaningful
    pub valid: bool,
    /// Unit is still eligible for migration
    pub migrate: bool,
    /// Session holds the frame lock
    pub locked: bool,
    /// Mapping allowed writes
    pub write: bool,
}

impl MigratePfn {
    /// Unit that takes no part in the migration
    pub fn empty() -> Self {
        Self::default()
    }

    fn hole() -> Self {
        Self {
            migrate: true,
            ..Self::default()
        }
    }

    fn backed(frame: FrameRef, write: bool) -> Self {
        Self {
            frame: Some(frame),
            valid: true,
            migrate: true,
            locked: false,
            write,
        }
    }

    /// Destination descriptor for a driver-owned frame
    pub fn destination(frame: FrameRef) -> Self {
        Self {
            frame: Some(frame),
            valid: true,
            migrate: false,
            locked: true,
            write: false,
        }
    }
}

// ============================================================================
// Session
// ============================================================================

/// Migration of one virtual range to or from device memory
pub struct MigrateVma {
    mm: Arc<Mm>,
    vma: Vma,
    start: u64,
    end: u64,
    src: Vec<MigratePfn>,
    dst: Vec<MigratePfn>,
    records: Vec<UnmapRecord>,
    cpages: usize,
    copy_content: bool,
    finalized: bool,
}

impl core::fmt::Debug for MigrateVma {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MigrateVma")
            .field("start", &self.start)
            .field("end", &self.end)
            .field("cpages", &self.cpages)
            .finish()
    }
}

impl MigrateVma {
    /// Open a session over `[start, end)` of `mm`, using the caller's
    /// `src`/`dst` arrays, and collect, prepare and unmap the range.
    pub fn setup(
        mm: &Arc<Mm>,
        start: u64,
        end: u64,
        mut src: Vec<MigratePfn>,
        mut dst: Vec<MigratePfn>,
    ) -> Result<Self> {
        if start >= end || !page_aligned(start) || !page_aligned(end) {
            return Err(MigrateError::Inval);
        }
        let vma = mm.find_vma(start).ok_or(MigrateError::Inval)?;
        if end > vma.end
            || vma
                .flags
                .intersects(VmFlags::HUGETLB | VmFlags::IO | VmFlags::PFNMAP)
        {
            return Err(MigrateError::Inval);
        }
        let npages = ((end - start) / PAGE) as usize;
        if src.len() < npages || dst.len() < npages {
            return Err(MigrateError::Inval);
        }
        src.truncate(npages);
        dst.truncate(npages);
        src.fill(MigratePfn::empty());
        dst.fill(MigratePfn::empty());

        let mut session = Self {
            mm: mm.clone(),
            vma,
            start,
            end,
            src,
            dst,
            records: (0..npages).map(|_| UnmapRecord::new()).collect(),
            cpages: 0,
            copy_content: false,
            finalized: false,
        };

        session.collect();
        if session.cpages > 0 {
            session.prepare();
        }
        if session.cpages > 0 {
            session.unmap();
        }
        log::debug!(
            "migrate_vma {:#x}-{:#x}: {} of {} units collected",
            start,
            end,
            session.cpages,
            npages
        );
        Ok(session)
    }

    /// Let `pages` copy content instead of leaving it to the driver
    pub fn set_copy_content(&mut self, on: bool) {
        self.copy_content = on;
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn npages(&self) -> usize {
        self.src.len()
    }

    /// Units still collected (eligible and held by the session)
    pub fn cpages(&self) -> usize {
        self.cpages
    }

    pub fn src(&self) -> &[MigratePfn] {
        &self.src
    }

    pub fn dst(&self) -> &[MigratePfn] {
        &self.dst
    }

    fn addr(&self, i: usize) -> u64 {
        self.start + i as u64 * PAGE
    }

    /// Supply the destination for unit `i`. Only units still marked
    /// `migrate` accept one; the frame is locked for the session.
    pub fn set_dst(&mut self, i: usize, frame: FrameRef) -> Result<()> {
        if self.finalized {
            return Err(MigrateError::Inval);
        }
        let eligible = self.src.get(i).map(|s| s.migrate).unwrap_or(false);
        if !eligible {
            return Err(MigrateError::Inval);
        }
        frame.lock();
        self.dst[i] = MigratePfn::destination(frame);
        Ok(())
    }

    // ========================================================================
    // Collect
    // ========================================================================

    fn collect(&mut self) {
        let mm = self.mm.clone();
        let _mmap = mm.mmap_read();
        let _inv = mm.invalidate_range(self.start, self.end);
        let mut i = 0;
        while i < self.src.len() {
            let addr = self.addr(i);
            match mm.lookup(addr) {
                None => {
                    self.src[i] = MigratePfn::hole();
                    self.cpages += 1;
                    i += 1;
                }
                Some((base, pte)) if pte.is_huge() => {
                    if !self.split_mapping(pte.frame()) {
                        // Whatever part of the huge mapping lies in range
                        // stays out of the session
                        let end = base + pte.span();
                        while i < self.src.len() && self.addr(i) < end {
                            self.src[i] = MigratePfn::empty();
                            i += 1;
                        }
                    }
                }
                Some((_, Pte::Migration { .. })) => {
                    i += 1;
                }
                Some((_, Pte::DevicePrivate { frame, writable })) => {
                    self.collect_frame(i, addr, frame, writable);
                    i += 1;
                }
                Some((_, Pte::Present { frame, writable, .. })) => {
                    if !frame.is_compound() && !frame.owner().is_unowned() {
                        self.collect_frame(i, addr, frame, writable);
                    }
                    i += 1;
                }
            }
        }
    }

    /// Split a huge mapping so collection can see its members
    fn split_mapping(&self, head: &FrameRef) -> bool {
        if !head.try_get() {
            return false;
        }
        let ok = if head.try_lock() {
            let rc = split_huge_page(head, None);
            head.unlock();
            rc.is_ok()
        } else {
            false
        };
        head.put();
        ok
    }

    /// Pin the frame at unit `i` and, if its lock is free, swap the
    /// mapping for a migration entry right away. A unit whose entry no
    /// longer maps `frame` is left out of the session.
    fn collect_frame(&mut self, i: usize, addr: u64, frame: FrameRef, writable: bool) {
        let mm = self.mm.clone();
        let mut ptes = mm.page_table();
        let dirty = match ptes.get(&addr) {
            Some(Pte::Present { frame: cur, dirty, .. }) if Arc::ptr_eq(cur, &frame) => *dirty,
            Some(Pte::DevicePrivate { frame: cur, .. }) if Arc::ptr_eq(cur, &frame) => false,
            _ => {
                log::trace!("migrate_vma {:#x}: entry changed under collect", addr);
                return;
            }
        };
        if !frame.try_get() {
            return;
        }
        self.cpages += 1;
        let mut pfn = MigratePfn::backed(frame.clone(), writable);

        if frame.try_lock() {
            pfn.locked = true;
            if dirty {
                frame.set_dirty();
            }
            ptes.insert(
                addr,
                Pte::Migration {
                    frame: frame.clone(),
                    writable,
                    dirty,
                    huge: false,
                },
            );
            frame.dec_mapcount();
            frame.rmap_remove(&mm, addr);
            drop(ptes);
            // The mapping's reference; the session holds its own
            frame.put();
            self.records[i].push(mm.clone(), addr);
        }
        self.src[i] = pfn;
    }

    // ========================================================================
    // Prepare
    // ========================================================================

    fn prepare(&mut self) {
        let mut restore = 0;
        for i in 0..self.src.len() {
            let frame = match self.src[i].frame.clone() {
                Some(frame) => frame,
                None => continue,
            };
            let remap = self.src[i].locked;
            if !remap {
                if !frame.try_lock() {
                    self.src[i] = MigratePfn::empty();
                    self.cpages -= 1;
                    frame.put();
                    continue;
                }
                self.src[i].locked = true;
            }

            let device = frame.is_device_private();
            if !device {
                if isolate_lru_page(&frame).is_err() {
                    if remap {
                        self.src[i].migrate = false;
                        self.cpages -= 1;
                        restore += 1;
                    } else {
                        self.src[i] = MigratePfn::empty();
                        frame.unlock();
                        self.cpages -= 1;
                        frame.put();
                    }
                    continue;
                }
                // The isolation reference replaces the collect pin
                frame.put();
            }

            if !check_page(&frame) {
                if remap {
                    self.src[i].migrate = false;
                    self.cpages -= 1;
                    restore += 1;
                    if !device {
                        frame.get();
                        putback_lru_page(&frame);
                    }
                } else {
                    self.src[i] = MigratePfn::empty();
                    frame.unlock();
                    self.cpages -= 1;
                    if device {
                        frame.put();
                    } else {
                        putback_lru_page(&frame);
                    }
                }
            }
        }

        if restore == 0 {
            return;
        }
        for i in 0..self.src.len() {
            let frame = match (&self.src[i].frame, self.src[i].migrate) {
                (Some(frame), false) => frame.clone(),
                _ => continue,
            };
            remove_migration_pte(&self.mm, self.addr(i), &frame, &frame);
            self.src[i] = MigratePfn::empty();
            frame.unlock();
            frame.put();
        }
    }

    // ========================================================================
    // Unmap
    // ========================================================================

    fn unmap(&mut self) {
        let mut restore = 0;
        for i in 0..self.src.len() {
            let frame = match (&self.src[i].frame, self.src[i].migrate) {
                (Some(frame), true) => frame.clone(),
                _ => continue,
            };
            if frame.is_mapped() {
                let record = try_to_unmap(&frame);
                for site in record.sites() {
                    self.records[i].push(site.mm.clone(), site.addr);
                }
                if frame.is_mapped() {
                    self.src[i].migrate = false;
                    self.cpages -= 1;
                    restore += 1;
                    continue;
                }
            }
            if !check_page(&frame) {
                self.src[i].migrate = false;
                self.cpages -= 1;
                restore += 1;
            }
        }

        if restore == 0 {
            return;
        }
        for i in 0..self.src.len() {
            let frame = match (&self.src[i].frame, self.src[i].migrate) {
                (Some(frame), false) => frame.clone(),
                _ => continue,
            };
            remove_migration_ptes(&self.records[i], &frame, &frame);
            self.src[i] = MigratePfn::empty();
            frame.unlock();
            if frame.is_device_private() {
                frame.put();
            } else {
                putback_lru_page(&frame);
            }
        }
    }

    // ========================================================================
    // Pages
    // ========================================================================

    /// Swap identities for every unit with a destination. Units that fail
    /// lose their `migrate` mark and are restored by `finalize`.
    pub fn pages(&mut self) {
        if self.finalized {
            return;
        }
        let mode = if self.copy_content {
            MigrateMode::SYNC
        } else {
            MigrateMode::SYNC_NO_COPY
        };
        let mut moved = 0;
        for i in 0..self.src.len() {
            let new = match &self.dst[i].frame {
                Some(frame) => frame.clone(),
                None => {
                    self.src[i].migrate = false;
                    continue;
                }
            };
            let old = match &self.src[i].frame {
                Some(frame) => frame.clone(),
                None => {
                    if self.src[i].migrate {
                        self.insert_page(i, &new);
                    }
                    continue;
                }
            };

            let mapping = old.mapping();
            if new.is_device_private() && mapping.is_some() {
                // Cached content cannot live where the CPU cannot reach it
                self.src[i].migrate = false;
                continue;
            }
            match migrate_page(mapping.as_ref(), &new, &old, mode) {
                Ok(()) => moved += 1,
                Err(err) => {
                    log::trace!("migrate_vma unit {}: {}", i, err);
                    self.src[i].migrate = false;
                }
            }
        }
        log::trace!("migrate_vma {:#x}: {} identities swapped", self.start, moved);
    }

    /// Populate the hole at unit `i` with the driver's frame
    fn insert_page(&mut self, i: usize, new: &FrameRef) {
        let addr = self.addr(i);
        let inserted = self.vma.is_anonymous()
            && self.mm.lookup(addr).is_none()
            && {
                new.set_flags(FrameFlags::UPTODATE);
                self.mm.map(addr, new, self.vma.writable()).is_ok()
            };
        if !inserted {
            self.src[i].migrate = false;
            return;
        }
        if !new.is_device_private() {
            new.node_data().lru_add(new);
        }
        self.src[i].migrate = true;
        log::trace!("migrate_vma {:#x}: hole filled with frame {}", addr, new.pfn());
    }

    // ========================================================================
    // Finalize
    // ========================================================================

    /// Commit every unit still marked `migrate` and restore the rest.
    /// Returns how many backed units were committed.
    pub fn finalize(&mut self) -> usize {
        if self.finalized {
            return 0;
        }
        self.finalized = true;
        let mut committed = 0;

        for i in 0..self.src.len() {
            let new = self.dst[i].frame.clone();
            let old = match self.src[i].frame.clone() {
                Some(frame) => frame,
                None => {
                    if let Some(new) = new {
                        new.unlock();
                        new.put();
                    }
                    continue;
                }
            };

            let target = match new {
                Some(new) if self.src[i].migrate => new,
                other => {
                    if let Some(new) = other {
                        new.unlock();
                        new.put();
                    }
                    self.src[i].migrate = false;
                    old.clone()
                }
            };

            remove_migration_ptes(&self.records[i], &old, &target);
            old.unlock();
            self.src[i].locked = false;
            self.cpages = self.cpages.saturating_sub(1);
            if old.is_device_private() {
                old.put();
            } else {
                putback_lru_page(&old);
            }

            if !Arc::ptr_eq(&target, &old) {
                target.unlock();
                if target.is_device_private() {
                    target.put();
                } else {
                    putback_lru_page(&target);
                }
                self.dst[i].locked = false;
                committed += 1;
            }
        }

        PGMIGRATE_DEVICE.add(committed as u64);
        log::debug!(
            "migrate_vma {:#x}-{:#x}: {} units committed",
            self.start,
            self.end,
            committed
        );
        committed
    }
}

/// Whether `frame` carries no reference the session cannot account for
fn check_page(frame: &FrameRef) -> bool {
    if frame.is_compound() {
        return false;
    }
    // Device frames are only ever referenced through their mapping
    if frame.is_device_private() {
        return true;
    }
    let mut extra = 1i64;
    if frame.mapping().is_some() {
        extra += 1 + i64::from(frame.has_private());
    }
    i64::from(frame.ref_count()) - extra <= i64::from(frame.mapcount())
}

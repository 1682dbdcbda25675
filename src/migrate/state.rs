//! Per-Frame Move State Machine
//!
//! Moves one isolated frame to a freshly supplied one:
//!
//! ```text
//! Idle -> Locked -> Unmapped -> MappingSwapped -> ContentCopied -> Remapped
//!                                                          -> Committed | RolledBack
//! ```
//!
//! The old frame is always locked before the new one. Every page-table
//! mapping of the old frame is replaced by a migration entry for the
//! duration of the move and rewritten to the final frame afterwards.
//!
//! ## Outcomes
//!
//! - `Ok`: the isolation reference on the old frame is gone, the new frame
//!   is on its LRU list (or back with its driver)
//! - `Err(Again)`: nothing changed, the old frame stays isolated on the
//!   caller's list for another pass
//! - `Err(NoMem)`: no destination; the old frame stays isolated
//! - any other error: the old frame went back where it came from

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::config;
use crate::error::{MigrateError, Result};
use crate::migrate::buffer::{buffer_migrate_page, buffer_migrate_page_norefs};
use crate::migrate::copy::{migrate_page_copy, migrate_page_states};
use crate::migrate::swap::{migrate_huge_page_move_mapping, migrate_page_move_mapping};
use crate::migrate::{FrameSupplier, MigrateMode, MigrateReason, SyncMode};
use crate::mm::buffer::try_to_free_buffers;
use crate::mm::frame::{FrameFlags, FrameRef, Private};
use crate::mm::huge::{isolate_huge_page, putback_active_hugepage};
use crate::mm::mapping::{AddressSpace, MigrateHandler};
use crate::mm::node::{isolate_lru_page, isolated_stat, putback_lru_page, NodeStat};
use crate::mm::pmap::{remove_migration_ptes, try_to_unmap, UnmapRecord};

// ============================================================================
// Isolation
// ============================================================================

/// Take a driver-managed frame away from its driver for migration.
///
/// The reference taken here becomes the isolation reference.
pub fn isolate_movable_page(frame: &FrameRef, mode: MigrateMode) -> Result<()> {
    if !frame.try_get() {
        return Err(MigrateError::Busy);
    }
    if !frame.is_driver_managed() || !frame.try_lock() {
        frame.put();
        return Err(MigrateError::Busy);
    }
    let isolated = match frame.movable_ops() {
        Some(ops) if !frame.is_isolated() => ops.isolate(frame, mode),
        _ => false,
    };
    if isolated {
        frame.set_flags(FrameFlags::ISOLATED);
    }
    frame.unlock();
    if !isolated {
        frame.put();
        return Err(MigrateError::Busy);
    }
    log::trace!("frame {}: isolated from driver", frame.pfn());
    Ok(())
}

/// Hand an isolated driver-managed frame back to its driver. The caller
/// holds the frame lock.
pub fn putback_movable_page(frame: &FrameRef) {
    if let Some(ops) = frame.movable_ops() {
        ops.putback(frame);
    }
    frame.clear_flags(FrameFlags::ISOLATED);
}

/// Isolate `frame` onto `list` for migration, whatever kind of frame it is
pub fn isolate_for_migration(
    frame: &FrameRef,
    mode: MigrateMode,
    list: &mut Vec<FrameRef>,
) -> Result<()> {
    if frame.is_hugetlb() {
        return if isolate_huge_page(frame, list) {
            Ok(())
        } else {
            Err(MigrateError::Busy)
        };
    }
    if frame.is_driver_managed() {
        isolate_movable_page(frame, mode)?;
    } else {
        isolate_lru_page(frame)?;
        frame
            .node_data()
            .stats
            .add(isolated_stat(frame), frame.nr_pages() as i64);
    }
    list.push(frame.clone());
    Ok(())
}

pub(crate) fn unaccount_isolated(frame: &FrameRef) {
    frame
        .node_data()
        .stats
        .add(isolated_stat(frame), -(frame.nr_pages() as i64));
}

/// Undo driver isolation of a frame that is leaving the worklist
pub(crate) fn release_movable(frame: &FrameRef) {
    frame.lock();
    if frame.is_movable() {
        putback_movable_page(frame);
    } else {
        frame.clear_flags(FrameFlags::ISOLATED);
    }
    frame.unlock();
    frame.put();
}

/// Return every isolated frame on `list` to where it came from
pub fn putback_movable_pages(list: &mut Vec<FrameRef>) {
    for frame in list.drain(..) {
        if frame.is_hugetlb() {
            putback_active_hugepage(&frame);
        } else if frame.is_driver_managed() {
            release_movable(&frame);
        } else {
            unaccount_isolated(&frame);
            putback_lru_page(&frame);
        }
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Default migration of a cached or anonymous frame: identity swap, then
/// content (or only state, when the caller copies content itself)
pub fn migrate_page(
    mapping: Option<&Arc<AddressSpace>>,
    new: &FrameRef,
    old: &FrameRef,
    mode: MigrateMode,
) -> Result<()> {
    migrate_page_move_mapping(mapping, new, old, 0)?;
    if mode.no_copy() {
        migrate_page_states(new, old);
    } else {
        migrate_page_copy(new, old, mode);
    }
    Ok(())
}

fn hugetlb_migrate_page(
    mapping: &Arc<AddressSpace>,
    new: &FrameRef,
    old: &FrameRef,
    mode: MigrateMode,
) -> Result<()> {
    migrate_huge_page_move_mapping(mapping, new, old)?;
    move_private_word(new, old);
    if mode.no_copy() {
        migrate_page_states(new, old);
    } else {
        migrate_page_copy(new, old, mode);
    }
    Ok(())
}

/// Hand an uncounted private word (pool tag) over to `new`
fn move_private_word(new: &FrameRef, old: &FrameRef) {
    let word = {
        let mut owner = old.owner();
        match owner.private {
            Private::Word(w) => {
                owner.private = Private::None;
                Some(w)
            }
            _ => None,
        }
    };
    if let Some(w) = word {
        new.set_private_word(w);
    }
}

/// Clear the dirty bit ahead of writeback, moving it out of the node's
/// dirty accounting
fn clear_page_dirty_for_io(mapping: &AddressSpace, frame: &FrameRef) -> bool {
    if !frame.test_and_clear(FrameFlags::DIRTY) {
        return false;
    }
    if mapping.account_dirty() {
        let stats = &frame.node_data().stats;
        stats.add(NodeStat::FileDirty, -1);
        stats.add(NodeStat::WritePending, -1);
    }
    true
}

/// Write a dirty frame back so a later pass finds it clean
fn writeout(mapping: &Arc<AddressSpace>, old: &FrameRef, record: &UnmapRecord) -> Result<()> {
    let writer = mapping.writer().ok_or(MigrateError::Inval)?;
    if !clear_page_dirty_for_io(mapping, old) {
        return Err(MigrateError::Again);
    }
    // Writeback may take a while; give the mappings back meanwhile
    remove_migration_ptes(record, old, old);
    match writer.writepage(old) {
        Ok(()) => {
            log::trace!("frame {}: written out for migration", old.pfn());
            Err(MigrateError::Again)
        }
        Err(err) => {
            log::warn!("frame {}: writeout failed: {}", old.pfn(), err);
            Err(MigrateError::Io)
        }
    }
}

/// Migration for mappings without a handler of their own
pub fn fallback_migrate_page(
    mapping: &Arc<AddressSpace>,
    new: &FrameRef,
    old: &FrameRef,
    mode: MigrateMode,
    record: &UnmapRecord,
) -> Result<()> {
    if old.is_dirty() {
        return match mode.sync {
            SyncMode::Sync | SyncMode::SyncNoCopy => writeout(mapping, old, record),
            _ => Err(MigrateError::Busy),
        };
    }
    if old.has_private() && !crate::mm::buffer::try_to_release_page(old) {
        return Err(if mode.is_sync() {
            MigrateError::Again
        } else {
            MigrateError::Busy
        });
    }
    migrate_page(Some(mapping), new, old, mode)
}

/// Run the handler that owns `old`. Both frames are locked and `old` is
/// no longer mapped.
fn move_to_new_page(
    new: &FrameRef,
    old: &FrameRef,
    mode: MigrateMode,
    record: &UnmapRecord,
) -> Result<()> {
    if old.is_driver_managed() {
        let ops = match old.movable_ops() {
            Some(ops) => ops,
            None => {
                // The driver let go of it while isolated; nothing to move
                old.clear_flags(FrameFlags::ISOLATED);
                return Ok(());
            }
        };
        ops.migrate(new, old, mode)?;
        if !old.is_isolated() {
            log::warn!("frame {}: driver migrated a frame it never isolated", old.pfn());
        }
        if !new.is_driver_managed() {
            new.set_movable(ops);
        }
        old.clear_movable();
        old.clear_flags(FrameFlags::ISOLATED);
        return Ok(());
    }

    let mapping = old.mapping();
    let rc = match &mapping {
        None => migrate_page(None, new, old, mode),
        Some(m) => match m.handler() {
            MigrateHandler::None => fallback_migrate_page(m, new, old, mode, record),
            MigrateHandler::Simple => migrate_page(Some(m), new, old, mode),
            MigrateHandler::Buffers { check_refs: false } => buffer_migrate_page(m, new, old, mode),
            MigrateHandler::Buffers { check_refs: true } => {
                buffer_migrate_page_norefs(m, new, old, mode)
            }
            MigrateHandler::HugeTlb => hugetlb_migrate_page(m, new, old, mode),
            MigrateHandler::Custom(hook) => hook.migrate(m, new, old, mode),
        },
    };
    if rc.is_ok() && !old.is_anon() {
        old.owner().mapping = None;
    }
    rc
}

// ============================================================================
// Per-frame move
// ============================================================================

/// Steps run with the old frame locked
fn move_locked(old: &FrameRef, new: &FrameRef, force: bool, mode: MigrateMode) -> Result<()> {
    // Writeback is only tracked on the head of a group, so groups skip it
    if old.is_writeback() && !old.is_compound() {
        if !matches!(mode.sync, SyncMode::Sync | SyncMode::SyncNoCopy) || !force {
            return Err(MigrateError::Again);
        }
        old.wait_on_writeback();
    }

    let _anon_pin = old.anon_vma().and_then(|anon| anon.pin());

    if !new.try_lock() {
        return Err(MigrateError::Again);
    }
    let rc = unmap_and_swap(old, new, mode);
    new.unlock();
    rc
}

fn unmap_and_swap(old: &FrameRef, new: &FrameRef, mode: MigrateMode) -> Result<()> {
    let none = UnmapRecord::new();
    if old.is_driver_managed() {
        return move_to_new_page(new, old, mode, &none);
    }

    let unowned = old.owner().is_unowned();
    let mut record = UnmapRecord::new();
    if unowned {
        // Truncated while isolated; shed leftover buffers and let the
        // next pass find it freed
        if old.has_private() {
            try_to_free_buffers(old);
            return Err(MigrateError::Again);
        }
    } else if old.is_mapped() {
        record = try_to_unmap(old);
    }

    let rc = if old.is_mapped() {
        Err(MigrateError::Again)
    } else {
        move_to_new_page(new, old, mode, &record)
    };

    if !record.is_empty() {
        let target = if rc.is_ok() { new } else { old };
        remove_migration_ptes(&record, old, target);
    }
    rc
}

/// Lock `old` and move it to `new`
fn unmap_and_move_pair(
    old: &FrameRef,
    new: &FrameRef,
    force: bool,
    mode: MigrateMode,
) -> Result<()> {
    let driver_managed = old.is_driver_managed();
    if !old.try_lock() {
        if !force || !mode.may_block() {
            return Err(MigrateError::Again);
        }
        old.lock();
    }
    let rc = move_locked(old, new, force, mode);
    old.unlock();

    if rc.is_ok() {
        if driver_managed {
            new.put();
        } else {
            putback_lru_page(new);
        }
    }
    rc
}

/// Move one isolated frame, drawing its destination from `supplier`
pub(crate) fn unmap_and_move(
    supplier: &dyn FrameSupplier,
    old: &FrameRef,
    force: bool,
    mode: MigrateMode,
    reason: MigrateReason,
) -> Result<()> {
    if old.is_transhuge() && !config::tunables().thp_migration() {
        return Err(MigrateError::NoMem);
    }

    let rc = if old.ref_count() == 1 {
        // Everyone else let go while it sat isolated
        old.clear_flags(FrameFlags::ACTIVE | FrameFlags::UNEVICTABLE);
        if old.is_driver_managed() {
            old.lock();
            if !old.is_movable() {
                old.clear_flags(FrameFlags::ISOLATED);
            }
            old.unlock();
        }
        log::trace!("frame {}: freed while isolated", old.pfn());
        Ok(())
    } else {
        let new = supplier.supply(old).ok_or(MigrateError::NoMem)?;
        let rc = unmap_and_move_pair(old, &new, force, mode);
        if rc.is_err() {
            supplier.dispose(new);
        }
        rc
    };

    finish_isolated(old, &rc, reason);
    rc
}

/// Settle the old frame once its attempt is final
pub(crate) fn finish_isolated(old: &FrameRef, rc: &Result<()>, reason: MigrateReason) {
    if let Err(MigrateError::Again) = rc {
        return;
    }
    let driver_managed = old.is_driver_managed();
    if !driver_managed {
        unaccount_isolated(old);
    }
    match rc {
        Ok(()) => {
            if reason == MigrateReason::MemoryFailure {
                old.set_flags(FrameFlags::HWPOISON);
                log::debug!("frame {}: poisoned after migration", old.pfn());
            }
            old.put();
        }
        Err(_) if driver_managed => release_movable(old),
        Err(_) => putback_lru_page(old),
    }
}

/// Move one isolated hugetlb page
pub(crate) fn unmap_and_move_huge_page(
    supplier: &dyn FrameSupplier,
    old: &FrameRef,
    force: bool,
    mode: MigrateMode,
    reason: MigrateReason,
) -> Result<()> {
    let migratable = match old.compound_kind() {
        Some(crate::mm::frame::CompoundKind::HugeTlb(hs)) => hs.migratable,
        _ => false,
    };
    if !migratable {
        putback_active_hugepage(old);
        return Err(MigrateError::NoSys);
    }

    let new = supplier.supply(old).ok_or(MigrateError::NoMem)?;

    let rc = (|| {
        if !old.try_lock() {
            if !force || !matches!(mode.sync, SyncMode::Sync | SyncMode::SyncNoCopy) {
                return Err(MigrateError::Again);
            }
            old.lock();
        }
        let _anon_pin = old.anon_vma().and_then(|anon| anon.pin());
        let rc = if new.try_lock() {
            let mut record = UnmapRecord::new();
            if old.is_mapped() {
                record = try_to_unmap(old);
            }
            let rc = if old.is_mapped() {
                Err(MigrateError::Again)
            } else {
                move_to_new_page(&new, old, mode, &record)
            };
            if !record.is_empty() {
                let target = if rc.is_ok() { &new } else { old };
                remove_migration_ptes(&record, old, target);
            }
            new.unlock();
            rc
        } else {
            Err(MigrateError::Again)
        };
        if rc.is_ok() {
            if old.is_anon() {
                move_private_word(&new, old);
            }
            if reason == MigrateReason::MemoryFailure {
                old.set_flags(FrameFlags::HWPOISON);
            }
        }
        old.unlock();
        rc
    })();

    if !matches!(rc, Err(MigrateError::Again)) {
        putback_active_hugepage(old);
    }
    match rc {
        Ok(()) => putback_active_hugepage(&new),
        Err(_) => supplier.dispose(new),
    }
    rc
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::NodeSupplier;
    use crate::mm::mapping::{MovableOps, PageWriter, SpaceKind};
    use crate::mm::node::{Node, NodeKind};
    use crate::mm::pmap::{Mm, Vma, VmFlags};
    use core::sync::atomic::{AtomicUsize, Ordering};

    fn lru_frame(node: &Node) -> FrameRef {
        let f = node.alloc_frame().unwrap();
        node.data().lru_add(&f);
        f
    }

    #[test]
    fn test_migrate_mapped_anon() {
        let src = Node::new(0, NodeKind::Cpu, 0, 4);
        let dst = Node::new(1, NodeKind::Cpu, 100, 4);
        let mm = Mm::new();
        mm.add_vma(Vma::anon(0x1000, 0x5000, VmFlags::READ | VmFlags::WRITE))
            .unwrap();
        let old = lru_frame(&src);
        old.fill(0x77);
        mm.map(0x2000, &old, true).unwrap();
        old.put();

        let mut list = Vec::new();
        isolate_for_migration(&old, MigrateMode::SYNC, &mut list).unwrap();
        assert_eq!(src.data().stats.get(NodeStat::IsolatedAnon), 1);

        let supplier = NodeSupplier::new(&dst);
        unmap_and_move(&supplier, &old, true, MigrateMode::SYNC, MigrateReason::Syscall).unwrap();

        let now = mm.fault(0x2000).unwrap();
        assert_eq!(now.node_id(), 1);
        assert_eq!(now.read_byte(0), 0x77);
        assert_eq!(now.ref_count(), 1);
        assert!(now.is_lru());
        assert_eq!(old.ref_count(), 0);
        assert_eq!(src.data().stats.get(NodeStat::IsolatedAnon), 0);
    }

    #[test]
    fn test_async_skips_locked_frame() {
        let node = Node::new(0, NodeKind::Cpu, 0, 4);
        let old = lru_frame(&node);
        old.owner().anon = Some(crate::mm::mapping::AnonVma::new());
        old.get();
        let mut list = Vec::new();
        isolate_for_migration(&old, MigrateMode::ASYNC, &mut list).unwrap();
        assert!(old.try_lock());
        let supplier = NodeSupplier::new(&node);
        assert_eq!(
            unmap_and_move(&supplier, &old, true, MigrateMode::ASYNC, MigrateReason::Compaction),
            Err(MigrateError::Again)
        );
        old.unlock();
        assert_eq!(node.nr_free(), 3);
    }

    struct CountingWriter(AtomicUsize);

    impl PageWriter for CountingWriter {
        fn writepage(&self, _frame: &FrameRef) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_dirty_without_handler_is_written_out() {
        let node = Node::new(0, NodeKind::Cpu, 0, 4);
        let writer = Arc::new(CountingWriter(AtomicUsize::new(0)));
        let space = Arc::new(
            AddressSpace::new(SpaceKind::File, MigrateHandler::None).with_writer(writer.clone()),
        );
        let old = lru_frame(&node);
        old.set_dirty();
        space.add_frame(&old, 0).unwrap();
        old.put();
        let mut list = Vec::new();
        isolate_for_migration(&old, MigrateMode::SYNC, &mut list).unwrap();
        let supplier = NodeSupplier::new(&node);

        assert_eq!(
            unmap_and_move(&supplier, &old, false, MigrateMode::ASYNC, MigrateReason::Syscall),
            Err(MigrateError::Busy)
        );
        assert!(old.is_lru());

        isolate_for_migration(&old, MigrateMode::SYNC, &mut list).unwrap();
        assert_eq!(
            unmap_and_move(&supplier, &old, true, MigrateMode::SYNC, MigrateReason::Syscall),
            Err(MigrateError::Again)
        );
        assert_eq!(writer.0.load(Ordering::SeqCst), 1);
        assert!(!old.is_dirty());

        unmap_and_move(&supplier, &old, true, MigrateMode::SYNC, MigrateReason::Syscall).unwrap();
        let new = space.lookup(0).unwrap();
        assert!(!Arc::ptr_eq(&new, &old));
    }

    struct Driver {
        isolated: AtomicUsize,
        migrated: AtomicUsize,
        returned: AtomicUsize,
    }

    impl MovableOps for Driver {
        fn isolate(&self, _frame: &FrameRef, _mode: MigrateMode) -> bool {
            self.isolated.fetch_add(1, Ordering::SeqCst);
            true
        }

        fn migrate(&self, new: &FrameRef, old: &FrameRef, _mode: MigrateMode) -> Result<()> {
            self.migrated.fetch_add(1, Ordering::SeqCst);
            new.data().copy_from_slice(&old.data());
            // The driver's own reference moves with its object
            new.get();
            old.put();
            Ok(())
        }

        fn putback(&self, _frame: &FrameRef) {
            self.returned.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_driver_managed_frame() {
        let node = Node::new(0, NodeKind::Cpu, 0, 4);
        let driver = Arc::new(Driver {
            isolated: AtomicUsize::new(0),
            migrated: AtomicUsize::new(0),
            returned: AtomicUsize::new(0),
        });
        let old = node.alloc_frame().unwrap();
        old.set_movable(driver.clone());
        old.fill(9);

        let mut list = Vec::new();
        isolate_for_migration(&old, MigrateMode::SYNC, &mut list).unwrap();
        assert!(old.is_isolated());
        assert_eq!(old.ref_count(), 2);

        putback_movable_pages(&mut list);
        assert_eq!(driver.returned.load(Ordering::SeqCst), 1);
        assert!(!old.is_isolated());

        isolate_for_migration(&old, MigrateMode::SYNC, &mut list).unwrap();
        let supplier = NodeSupplier::new(&node);
        unmap_and_move(&supplier, &old, true, MigrateMode::SYNC, MigrateReason::Compaction)
            .unwrap();
        assert_eq!(driver.migrated.load(Ordering::SeqCst), 1);
        assert!(!old.is_isolated());
        assert_eq!(old.ref_count(), 0);
        let new = node.frames().iter().find(|f| f.is_movable()).unwrap().clone();
        assert_eq!(new.ref_count(), 1);
        assert_eq!(new.read_byte(0), 9);
    }

    #[test]
    fn test_freed_while_isolated() {
        let node = Node::new(0, NodeKind::Cpu, 0, 2);
        let old = lru_frame(&node);
        let mut list = Vec::new();
        isolate_for_migration(&old, MigrateMode::SYNC, &mut list).unwrap();
        old.put();
        assert_eq!(old.ref_count(), 1);
        let never = |_: &FrameRef| -> Option<FrameRef> { None };
        unmap_and_move(&never, &old, false, MigrateMode::SYNC, MigrateReason::Syscall).unwrap();
        assert_eq!(old.ref_count(), 0);
        assert_eq!(node.nr_free(), 2);
    }

    #[test]
    fn test_memory_failure_poisons_old() {
        let node = Node::new(0, NodeKind::Cpu, 0, 4);
        let mm = Mm::new();
        mm.add_vma(Vma::anon(0x1000, 0x3000, VmFlags::READ)).unwrap();
        let old = lru_frame(&node);
        mm.map(0x1000, &old, false).unwrap();
        old.put();
        let mut list = Vec::new();
        isolate_for_migration(&old, MigrateMode::SYNC, &mut list).unwrap();
        assert_eq!(node.nr_free(), 3);

        let supplier = NodeSupplier::new(&node);
        unmap_and_move(&supplier, &old, true, MigrateMode::SYNC, MigrateReason::MemoryFailure)
            .unwrap();
        assert!(old.has_flags(FrameFlags::HWPOISON));
        assert_eq!(old.ref_count(), 0);
        assert!(!old.try_claim());
        // One frame in use, one poisoned
        assert_eq!(node.nr_free(), 2);
    }
}

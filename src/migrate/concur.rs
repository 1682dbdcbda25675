//! Concurrent (pipelined) migration
//!
//! Runs the per-frame steps stage by stage over the whole worklist so the
//! content of every eligible frame can be moved with a single copy call:
//!
//! 1. unmap every frame and pair it with a destination
//! 2. swap identities
//! 3. copy all content at once, then transfer state
//! 4. remap and commit
//!
//! Only standalone anonymous frames take this path. Huge, hugetlb,
//! cached and driver-managed frames are set aside and, together with
//! anything that failed transiently, finished by the serial engine after
//! the single pipelined pass.

use alloc::vec::Vec;

use crate::counters;
use crate::error::{MigrateError, Result};
use crate::migrate::copy::{copy_frame_list, migrate_page_states, CopyStrategy};
use crate::migrate::engine::{migrate_pages, MigrateSummary};
use crate::migrate::state::finish_isolated;
use crate::migrate::swap::migrate_page_move_mapping;
use crate::migrate::{FrameSupplier, MigrateMode, MigrateReason};
use crate::mm::buffer::try_to_free_buffers;
use crate::mm::frame::{FrameFlags, FrameRef};
use crate::mm::mapping::AnonPin;
use crate::mm::node::putback_lru_page;
use crate::mm::pmap::{remove_migration_ptes, try_to_unmap, UnmapRecord};

/// A frame that is locked, unmapped and paired with its destination
struct WorkItem {
    old: FrameRef,
    new: FrameRef,
    anon_pin: Option<AnonPin>,
    record: UnmapRecord,
}

impl WorkItem {
    /// Give the mappings back to the old frame and release both locks
    fn unwind(self, supplier: &dyn FrameSupplier) -> FrameRef {
        remove_migration_ptes(&self.record, &self.old, &self.old);
        self.new.unlock();
        self.old.unlock();
        supplier.dispose(self.new);
        self.old
    }
}

fn takes_serial_path(frame: &FrameRef) -> bool {
    frame.is_hugetlb()
        || frame.is_compound()
        || frame.is_driver_managed()
        || frame.mapping().is_some()
}

/// Lock `old` and `new` and replace every mapping of `old` by a
/// migration entry. Never blocks.
fn lock_and_unmap(old: &FrameRef, new: &FrameRef) -> Result<(Option<AnonPin>, UnmapRecord)> {
    if !old.try_lock() {
        return Err(MigrateError::Again);
    }
    if old.is_writeback() {
        old.unlock();
        return Err(MigrateError::Again);
    }
    let anon_pin = old.anon_vma().and_then(|anon| anon.pin());
    if !new.try_lock() {
        old.unlock();
        return Err(MigrateError::Again);
    }

    let unowned = old.owner().is_unowned();
    if unowned && old.has_private() {
        try_to_free_buffers(old);
        new.unlock();
        old.unlock();
        return Err(MigrateError::Again);
    }
    let record = if !unowned && old.is_mapped() {
        try_to_unmap(old)
    } else {
        UnmapRecord::new()
    };
    if old.is_mapped() {
        remove_migration_ptes(&record, old, old);
        new.unlock();
        old.unlock();
        return Err(MigrateError::Again);
    }
    Ok((anon_pin, record))
}

/// Stage one for a single frame. `Ok(None)` means the frame was freed
/// while it sat isolated.
fn unmap_one(supplier: &dyn FrameSupplier, old: &FrameRef) -> Result<Option<WorkItem>> {
    if old.ref_count() == 1 {
        return Ok(None);
    }
    let new = supplier.supply(old).ok_or(MigrateError::NoMem)?;
    match lock_and_unmap(old, &new) {
        Ok((anon_pin, record)) => Ok(Some(WorkItem {
            old: old.clone(),
            new,
            anon_pin,
            record,
        })),
        Err(err) => {
            supplier.dispose(new);
            Err(err)
        }
    }
}

/// Migrate the isolated frames on `list` with one pipelined pass, then
/// finish whatever is left with [`migrate_pages`].
///
/// The list semantics match `migrate_pages`: frames still on `list` when
/// this returns are isolated and belong to the caller.
pub fn migrate_pages_concur(
    list: &mut Vec<FrameRef>,
    supplier: &dyn FrameSupplier,
    mode: MigrateMode,
    reason: MigrateReason,
) -> Result<MigrateSummary> {
    let mut wip: Vec<FrameRef> = Vec::new();
    let mut serialized: Vec<FrameRef> = Vec::new();
    let mut unmapped: Vec<WorkItem> = Vec::new();
    let mut summary = MigrateSummary::default();
    let mut out_of_memory = false;

    // Stage 1: unmap and pair
    for old in list.drain(..) {
        if out_of_memory {
            wip.push(old);
            continue;
        }
        if takes_serial_path(&old) {
            serialized.push(old);
            continue;
        }
        match unmap_one(supplier, &old) {
            Ok(Some(item)) => unmapped.push(item),
            Ok(None) => {
                old.clear_flags(FrameFlags::ACTIVE | FrameFlags::UNEVICTABLE);
                finish_isolated(&old, &Ok(()), reason);
                summary.succeeded += 1;
            }
            Err(MigrateError::Again) => wip.push(old),
            Err(MigrateError::NoMem) => {
                // Leave the rest to the serial engine, which reports it
                out_of_memory = true;
                wip.push(old);
            }
            Err(err) => {
                finish_isolated(&old, &Err(err), reason);
                summary.failed += 1;
            }
        }
    }

    // Stage 2: identity swap
    let mut swapped: Vec<WorkItem> = Vec::with_capacity(unmapped.len());
    for item in unmapped {
        match migrate_page_move_mapping(None, &item.new, &item.old, 0) {
            Ok(()) => swapped.push(item),
            Err(_) => wip.push(item.unwind(supplier)),
        }
    }

    // Stage 3: one copy call for the whole batch
    if !swapped.is_empty() {
        if !mode.no_copy() {
            let dsts: Vec<FrameRef> = swapped.iter().map(|w| w.new.clone()).collect();
            let srcs: Vec<FrameRef> = swapped.iter().map(|w| w.old.clone()).collect();
            let strategy = CopyStrategy::select(mode, &dsts[0], false);
            copy_frame_list(&dsts, &srcs, &strategy);
        }
        for item in &swapped {
            migrate_page_states(&item.new, &item.old);
        }
    }

    // Stage 4: remap and commit
    let committed = swapped.len();
    for item in swapped {
        remove_migration_ptes(&item.record, &item.old, &item.new);
        item.new.unlock();
        drop(item.anon_pin);
        item.old.unlock();
        finish_isolated(&item.old, &Ok(()), reason);
        putback_lru_page(&item.new);
    }
    summary.succeeded += committed;
    counters::count_run(summary.succeeded, summary.failed);
    log::debug!(
        "migrate concur {:?}: {} committed, {} to serial engine",
        reason,
        summary.succeeded,
        wip.len() + serialized.len()
    );

    // Whatever is left runs through the retrying engine
    list.append(&mut wip);
    list.append(&mut serialized);
    if list.is_empty() {
        return Ok(summary);
    }
    let rest = migrate_pages(list, supplier, mode, reason)?;
    summary.merge(rest);
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::state::{isolate_for_migration, putback_movable_pages};
    use crate::migrate::NodeSupplier;
    use crate::mm::mapping::{AddressSpace, MigrateHandler, SpaceKind};
    use crate::mm::node::{Node, NodeKind, NodeStat};
    use crate::mm::pmap::{Mm, Vma, VmFlags};
    use alloc::sync::Arc;

    fn anon_mm() -> Arc<Mm> {
        let mm = Mm::new();
        mm.add_vma(Vma::anon(0x10000, 0x40000, VmFlags::READ | VmFlags::WRITE))
            .unwrap();
        mm
    }

    fn map_at(node: &Node, mm: &Arc<Mm>, addr: u64, byte: u8) -> FrameRef {
        let f = node.alloc_frame().unwrap();
        f.fill(byte);
        node.data().lru_add(&f);
        mm.map(addr, &f, true).unwrap();
        f.put();
        f
    }

    #[test]
    fn test_pipelined_batch() {
        let src = Node::new(0, NodeKind::Cpu, 0, 8);
        let dst = Node::new(1, NodeKind::Cpu, 100, 8);
        let mm = anon_mm();
        let mut list = Vec::new();
        for i in 0..5u64 {
            let f = map_at(&src, &mm, 0x10000 + i * 0x1000, i as u8 + 10);
            isolate_for_migration(&f, MigrateMode::SYNC, &mut list).unwrap();
        }

        let summary = migrate_pages_concur(
            &mut list,
            &NodeSupplier::new(&dst),
            MigrateMode::SYNC,
            MigrateReason::Syscall,
        )
        .unwrap();
        assert_eq!(summary.succeeded, 5);
        assert_eq!(summary.failed, 0);
        assert!(list.is_empty());
        for i in 0..5u64 {
            let f = mm.fault(0x10000 + i * 0x1000).unwrap();
            assert_eq!(f.node_id(), 1);
            assert_eq!(f.read_byte(9), i as u8 + 10);
            assert!(f.is_lru());
            assert_eq!(f.ref_count(), 1);
        }
        assert_eq!(src.nr_free(), 8);
        assert_eq!(src.data().stats.get(NodeStat::IsolatedAnon), 0);
    }

    #[test]
    fn test_cached_frame_goes_serial() {
        let src = Node::new(0, NodeKind::Cpu, 0, 8);
        let dst = Node::new(1, NodeKind::Cpu, 100, 8);
        let space = Arc::new(AddressSpace::new(SpaceKind::File, MigrateHandler::Simple));
        let cached = src.alloc_frame().unwrap();
        cached.fill(0x42);
        src.data().lru_add(&cached);
        space.add_frame(&cached, 5).unwrap();
        cached.put();

        let mm = anon_mm();
        let anon = map_at(&src, &mm, 0x20000, 0x24);

        let mut list = Vec::new();
        isolate_for_migration(&cached, MigrateMode::SYNC, &mut list).unwrap();
        isolate_for_migration(&anon, MigrateMode::SYNC, &mut list).unwrap();

        let summary = migrate_pages_concur(
            &mut list,
            &NodeSupplier::new(&dst),
            MigrateMode::SYNC,
            MigrateReason::Syscall,
        )
        .unwrap();
        assert_eq!(summary.succeeded, 2);
        let moved = space.lookup(5).unwrap();
        assert_eq!(moved.node_id(), 1);
        assert_eq!(moved.read_byte(0), 0x42);
        assert_eq!(mm.fault(0x20000).unwrap().node_id(), 1);
    }

    #[test]
    fn test_pinned_frame_handed_to_serial_engine() {
        let node = Node::new(0, NodeKind::Cpu, 0, 8);
        let mm = anon_mm();
        let a = map_at(&node, &mm, 0x10000, 1);
        let b = map_at(&node, &mm, 0x11000, 2);
        let mut list = Vec::new();
        isolate_for_migration(&a, MigrateMode::SYNC, &mut list).unwrap();
        isolate_for_migration(&b, MigrateMode::SYNC, &mut list).unwrap();
        b.get();

        let summary = migrate_pages_concur(
            &mut list,
            &NodeSupplier::new(&node),
            MigrateMode::SYNC,
            MigrateReason::Syscall,
        )
        .unwrap();
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(list.len(), 1);
        assert!(Arc::ptr_eq(&mm.fault(0x11000).unwrap(), &b));

        putback_movable_pages(&mut list);
        b.put();
        assert_eq!(b.ref_count(), 1);
    }

    #[test]
    fn test_no_copy_mode_only_moves_state() {
        let src = Node::new(0, NodeKind::Cpu, 0, 4);
        let dst = Node::new(1, NodeKind::Cpu, 100, 4);
        let mm = anon_mm();
        let f = map_at(&src, &mm, 0x10000, 0x99);
        f.set_flags(FrameFlags::REFERENCED);
        let mut list = Vec::new();
        isolate_for_migration(&f, MigrateMode::SYNC, &mut list).unwrap();

        migrate_pages_concur(
            &mut list,
            &NodeSupplier::new(&dst),
            MigrateMode::SYNC_NO_COPY,
            MigrateReason::DeviceMemory,
        )
        .unwrap();
        let now = mm.fault(0x10000).unwrap();
        assert_eq!(now.read_byte(0), 0);
        assert!(now.has_flags(FrameFlags::REFERENCED));
    }
}

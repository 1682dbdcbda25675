//! Misplaced-NUMA migration
//!
//! Best-effort relocation of a single frame found to be accessed mostly
//! from another node. Never blocks and never retries: a frame that cannot
//! move right away simply stays where it is.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::counters::{NUMA_PAGE_MIGRATE, PGMIGRATE_FAIL, PGMIGRATE_SUCCESS};
use crate::migrate::copy::{migrate_page_copy, restore_page_states};
use crate::migrate::engine::migrate_pages;
use crate::migrate::state::{putback_movable_pages, unaccount_isolated};
use crate::migrate::{MigrateMode, MigrateReason};
use crate::mm::frame::{CompoundKind, FrameFlags, FrameRef, PAGE_SIZE};
use crate::mm::node::{isolate_lru_page, isolated_stat, putback_lru_page, Node};
use crate::mm::pmap::{Mm, Pte, Vma, VmFlags};

fn is_file_cache(frame: &FrameRef) -> bool {
    !frame.has_flags(FrameFlags::SWAPBACKED)
}

/// Isolate `frame` for a move to `node`, consuming the caller's reference
/// on success
fn numamigrate_isolate_page(node: &Node, frame: &FrameRef) -> bool {
    // Avoid filling a node that is nearly full
    if !node.data().watermark_ok(frame.nr_pages()) {
        return false;
    }
    if isolate_lru_page(frame).is_err() {
        return false;
    }
    // Mapping, caller and isolation; any other pin blocks the move
    if frame.is_transhuge() && frame.ref_count() != 3 {
        putback_lru_page(frame);
        return false;
    }
    frame
        .node_data()
        .stats
        .add(isolated_stat(frame), frame.nr_pages() as i64);
    frame.put();
    true
}

/// Move `frame`, mapped by `vma`, to `node`.
///
/// The caller holds a reference on `frame`, which this call always
/// consumes. Returns whether the frame now lives on `node`.
pub fn migrate_misplaced_page(frame: &FrameRef, vma: &Vma, node: &Node) -> bool {
    let file = is_file_cache(frame);

    // Shared libraries: executable file frames mapped more than once
    let shared_exec = frame.mapcount() != 1 && file && vma.flags.contains(VmFlags::EXEC);
    // Not every filesystem can move dirty frames without blocking
    let dirty_file = file && frame.is_dirty();
    if shared_exec || dirty_file || !numamigrate_isolate_page(node, frame) {
        frame.put();
        return false;
    }

    let supplier = |old: &FrameRef| {
        if old.is_compound() {
            None
        } else {
            node.alloc_frame()
        }
    };
    let mut list = Vec::new();
    list.push(frame.clone());
    let migrated = match migrate_pages(
        &mut list,
        &supplier,
        MigrateMode::ASYNC,
        MigrateReason::NumaMisplaced,
    ) {
        Ok(summary) => summary.failed == 0,
        Err(_) => false,
    };
    if !list.is_empty() {
        putback_movable_pages(&mut list);
    }
    if migrated {
        NUMA_PAGE_MIGRATE.inc();
    }
    log::trace!(
        "frame {}: misplaced move to node {} {}",
        frame.pfn(),
        node.id(),
        if migrated { "done" } else { "skipped" }
    );
    migrated
}

/// Move the transparent huge group `head`, mapped whole at `addr` in
/// `mm`, to `node`.
///
/// The caller holds the group lock and a reference; both are released
/// before returning. Returns whether the group now lives on `node`.
pub fn migrate_misplaced_transhuge_page(
    mm: &Arc<Mm>,
    vma: &Vma,
    addr: u64,
    head: &FrameRef,
    node: &Node,
) -> bool {
    let nr = head.nr_pages();
    let span = (nr * PAGE_SIZE) as u64;
    let start = addr & !(span - 1);

    let new = match node.alloc_compound(head.order(), CompoundKind::Transparent) {
        Some(new) => new,
        None => return fail(head, nr),
    };
    if !numamigrate_isolate_page(node, head) {
        new.put();
        return fail(head, nr);
    }

    new.lock();
    if head.has_flags(FrameFlags::SWAPBACKED) {
        new.set_flags(FrameFlags::SWAPBACKED);
    }
    {
        let (anon, index) = {
            let o = head.owner();
            (o.anon.clone(), o.index)
        };
        let mut n = new.owner();
        n.anon = anon;
        n.index = index;
    }
    migrate_page_copy(&new, head, MigrateMode::ASYNC);

    let _inv = mm.invalidate_range(start, start + span);
    let mut ptes = mm.page_table();
    let same = matches!(
        ptes.get(&start),
        Some(Pte::Present { frame, huge: true, .. }) if Arc::ptr_eq(frame, head)
    );
    if !same || !head.freeze(2) {
        drop(ptes);
        restore_page_states(head, &new);
        new.unlock();
        new.put();
        // The isolation reference goes back with the group
        head.get();
        putback_lru_page(head);
        unaccount_isolated(head);
        head.unlock();
        head.put();
        log::trace!("frame {}: misplaced huge move lost a race", head.pfn());
        return false;
    }

    ptes.insert(
        start,
        Pte::Present {
            frame: new.clone(),
            writable: vma.writable(),
            dirty: true,
            huge: true,
        },
    );
    // The allocation reference becomes the mapping's
    new.inc_mapcount();
    new.rmap_add(mm, start);
    head.unfreeze(2);
    head.dec_mapcount();
    head.rmap_remove(mm, start);
    drop(ptes);

    new.get();
    putback_lru_page(&new);
    new.unlock();
    head.unlock();
    unaccount_isolated(head);
    // Mapping, then isolation
    head.put();
    head.put();

    PGMIGRATE_SUCCESS.add(nr as u64);
    NUMA_PAGE_MIGRATE.add(nr as u64);
    log::debug!(
        "frame {}: huge group moved to node {} as {}",
        head.pfn(),
        node.id(),
        new.pfn()
    );
    true
}

fn fail(head: &FrameRef, nr: usize) -> bool {
    PGMIGRATE_FAIL.add(nr as u64);
    head.unlock();
    head.put();
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::mapping::{AddressSpace, MigrateHandler, SpaceKind};
    use crate::mm::node::NodeKind;

    fn anon_setup() -> (Arc<Mm>, Vma) {
        let mm = Mm::new();
        let vma = Vma::anon(0x40000, 0x80000, VmFlags::READ | VmFlags::WRITE);
        mm.add_vma(vma.clone()).unwrap();
        (mm, vma)
    }

    #[test]
    fn test_misplaced_anon_moves() {
        let src = Node::new(0, NodeKind::Cpu, 0, 4);
        let dst = Node::new(1, NodeKind::Cpu, 100, 4);
        let (mm, vma) = anon_setup();
        let f = src.alloc_frame().unwrap();
        f.fill(0x61);
        src.data().lru_add(&f);
        mm.map(0x40000, &f, true).unwrap();
        // The alloc reference doubles as the caller's

        assert!(migrate_misplaced_page(&f, &vma, &dst));
        let now = mm.fault(0x40000).unwrap();
        assert_eq!(now.node_id(), 1);
        assert_eq!(now.read_byte(0), 0x61);
        assert_eq!(f.ref_count(), 0);
        assert_eq!(src.nr_free(), 4);
    }

    #[test]
    fn test_watermark_blocks_move() {
        let src = Node::new(0, NodeKind::Cpu, 0, 4);
        let dst = Node::new(1, NodeKind::Cpu, 100, 4);
        dst.data().set_high_wmark(4);
        let (mm, vma) = anon_setup();
        let f = src.alloc_frame().unwrap();
        src.data().lru_add(&f);
        mm.map(0x40000, &f, true).unwrap();

        assert!(!migrate_misplaced_page(&f, &vma, &dst));
        assert_eq!(f.ref_count(), 1);
        assert!(f.is_lru());
    }

    #[test]
    fn test_dirty_file_frame_skipped() {
        let src = Node::new(0, NodeKind::Cpu, 0, 4);
        let dst = Node::new(1, NodeKind::Cpu, 100, 4);
        let space = Arc::new(AddressSpace::new(SpaceKind::File, MigrateHandler::Simple));
        let mm = Mm::new();
        let vma = Vma::file(0x40000, 0x50000, VmFlags::READ, space.clone(), 0);
        mm.add_vma(vma.clone()).unwrap();
        let f = src.alloc_frame().unwrap();
        f.set_dirty();
        space.add_frame(&f, 0).unwrap();
        src.data().lru_add(&f);

        assert!(!migrate_misplaced_page(&f, &vma, &dst));
        assert!(Arc::ptr_eq(&space.lookup(0).unwrap(), &f));
        assert_eq!(f.ref_count(), 1);
    }

    #[test]
    fn test_misplaced_thp_moves_whole() {
        let src = Node::new(0, NodeKind::Cpu, 0, 8);
        let dst = Node::new(1, NodeKind::Cpu, 100, 8);
        let (mm, vma) = anon_setup();
        let head = src.alloc_compound(2, CompoundKind::Transparent).unwrap();
        head.fill(0x7e);
        src.data().lru_add(&head);
        mm.map(0x40000, &head, true).unwrap();
        head.lock();

        assert!(migrate_misplaced_transhuge_page(&mm, &vma, 0x41000, &head, &dst));
        let (base, pte) = mm.lookup(0x42000).unwrap();
        assert_eq!(base, 0x40000);
        let new = pte.frame().clone();
        assert!(new.is_transhuge());
        assert_eq!(new.node_id(), 1);
        assert_eq!(new.read_byte(0), 0x7e);
        assert_eq!(new.ref_count(), 1);
        assert_eq!(new.mapcount(), 1);
        assert!(new.is_lru() && !new.is_locked());
        assert_eq!(head.ref_count(), 0);
        assert_eq!(src.nr_free(), 8);
    }

    #[test]
    fn test_misplaced_thp_pinned_stays() {
        let src = Node::new(0, NodeKind::Cpu, 0, 8);
        let dst = Node::new(1, NodeKind::Cpu, 100, 8);
        let (mm, vma) = anon_setup();
        let head = src.alloc_compound(2, CompoundKind::Transparent).unwrap();
        src.data().lru_add(&head);
        mm.map(0x40000, &head, true).unwrap();
        head.get();
        head.lock();

        assert!(!migrate_misplaced_transhuge_page(&mm, &vma, 0x40000, &head, &dst));
        assert!(!head.is_locked());
        assert!(head.is_lru());
        // Mapping plus the extra pin
        assert_eq!(head.ref_count(), 2);
        assert_eq!(dst.nr_free(), 8);
        let (_, pte) = mm.lookup(0x40000).unwrap();
        assert!(Arc::ptr_eq(pte.frame(), &head));
    }
}

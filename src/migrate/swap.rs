//! Identity Swap
//!
//! Hands a cache slot (or, for anonymous content, just the owner record)
//! from an old frame to a new one. The swap only happens while the old
//! frame's count equals exactly the references the migration accounts
//! for; the count is frozen across the slot store so nobody can take a
//! new reference halfway through.
//!
//! Expected references on the old frame:
//!
//! | holder                    | refs              |
//! |---------------------------|-------------------|
//! | migration (isolation)     | 1                 |
//! | device-private idle count | 1 if device frame |
//! | cache slots               | members in group  |
//! | attached private data     | 1 if PRIVATE      |
//! | caller extras             | `extra`           |

use alloc::sync::Arc;

use crate::error::{MigrateError, Result};
use crate::mm::frame::{Frame, FrameFlags, FrameRef, Private};
use crate::mm::mapping::AddressSpace;
use crate::mm::node::NodeStat;

/// References `frame` must hold for its identity to be swapped
pub fn expected_page_refs(mapping: Option<&AddressSpace>, frame: &Frame) -> u32 {
    let mut expected = 1 + u32::from(frame.is_device_private());
    if mapping.is_some() {
        expected += frame.nr_pages() as u32 + u32::from(frame.has_private());
    }
    expected
}

/// Copy the owner fields that name the content
fn copy_identity(new: &Frame, old: &Frame, mapping: Option<&Arc<AddressSpace>>) {
    let (anon, index) = {
        let o = old.owner();
        (o.anon.clone(), o.index)
    };
    let mut n = new.owner();
    n.index = index;
    n.anon = anon;
    n.mapping = mapping.cloned();
}

/// Swap the identity of `old` over to `new`.
///
/// `new` must be locked and invisible to everyone else. On success `new`
/// holds one extra reference per slot it now fills and `old` has given
/// those up; the caller still owns its own references on both frames.
pub fn migrate_page_move_mapping(
    mapping: Option<&Arc<AddressSpace>>,
    new: &FrameRef,
    old: &FrameRef,
    extra: u32,
) -> Result<()> {
    let expected = expected_page_refs(mapping.map(|m| &**m), old) + extra;

    let mapping = match mapping {
        Some(mapping) => mapping,
        None => {
            // No slot to race on; a plain count check is enough
            if old.ref_count() != expected {
                return Err(MigrateError::Again);
            }
            copy_identity(new, old, None);
            if old.has_flags(FrameFlags::SWAPBACKED) {
                new.set_flags(FrameFlags::SWAPBACKED);
            }
            log::trace!("frame {} -> {}: anon identity moved", old.pfn(), new.pfn());
            return Ok(());
        }
    };

    let nr = old.nr_pages();
    let index = old.index();
    let dirty;
    {
        let mut slots = mapping.slots();
        let occupant = slots.get(&index).map(|f| Arc::ptr_eq(f, old)).unwrap_or(false);
        if old.ref_count() != expected || !occupant {
            return Err(MigrateError::Again);
        }
        if !old.freeze(expected) {
            return Err(MigrateError::Again);
        }

        // Frozen: nobody else can look the old frame up and pin it
        new.add_refs(nr as u32);
        copy_identity(new, old, Some(mapping));
        if old.has_flags(FrameFlags::SWAPBACKED) {
            new.set_flags(FrameFlags::SWAPBACKED);
            if old.has_flags(FrameFlags::SWAPCACHE) {
                new.set_flags(FrameFlags::SWAPCACHE);
                if let Some(entry) = old.private_word() {
                    new.set_private_word(entry);
                }
            }
        }

        dirty = old.test_and_clear(FrameFlags::DIRTY);
        if dirty {
            new.set_dirty();
        }

        for i in 0..nr as u64 {
            slots.insert(index + i, new.clone());
        }

        // The slot references on the old frame go with the slots
        old.unfreeze(expected - nr as u32);
    }

    let (from, to) = (old.node_data(), new.node_data());
    if !Arc::ptr_eq(from, to) {
        let nr = nr as i64;
        from.stats.add(NodeStat::FilePages, -nr);
        to.stats.add(NodeStat::FilePages, nr);
        if old.has_flags(FrameFlags::SWAPBACKED) && !old.has_flags(FrameFlags::SWAPCACHE) {
            from.stats.add(NodeStat::Shmem, -nr);
            to.stats.add(NodeStat::Shmem, nr);
        }
        if dirty && mapping.account_dirty() {
            from.stats.add(NodeStat::FileDirty, -nr);
            from.stats.add(NodeStat::WritePending, -nr);
            to.stats.add(NodeStat::FileDirty, nr);
            to.stats.add(NodeStat::WritePending, nr);
        }
    }
    log::trace!(
        "frame {} -> {}: {} slot(s) at {} swapped",
        old.pfn(),
        new.pfn(),
        nr,
        index
    );
    Ok(())
}

/// Swap the single cache slot of a hugetlb page.
///
/// Hugetlb pages are cached whole under one index, so the old page is
/// expected at its slot reference plus the migration's own, plus one for
/// attached private data.
pub fn migrate_huge_page_move_mapping(
    mapping: &Arc<AddressSpace>,
    new: &FrameRef,
    old: &FrameRef,
) -> Result<()> {
    let expected = 2 + u32::from(old.has_private());
    let index = old.index();
    let mut slots = mapping.slots();
    let occupant = slots.get(&index).map(|f| Arc::ptr_eq(f, old)).unwrap_or(false);
    if old.ref_count() != expected || !occupant {
        return Err(MigrateError::Again);
    }
    if !old.freeze(expected) {
        return Err(MigrateError::Again);
    }
    copy_identity(new, old, Some(mapping));
    new.get();
    slots.insert(index, new.clone());
    old.unfreeze(expected - 1);
    drop(slots);
    log::trace!("hugetlb {} -> {}: slot {} swapped", old.pfn(), new.pfn(), index);
    Ok(())
}

/// Move counted private data from `old` to `new`
pub fn transfer_private(new: &Frame, old: &Frame) {
    match old.detach_private() {
        Private::None => {}
        private => new.attach_private(private),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::frame::CompoundKind;
    use crate::mm::mapping::{MigrateHandler, SpaceKind};
    use crate::mm::node::{Node, NodeKind};

    fn file_space() -> Arc<AddressSpace> {
        Arc::new(AddressSpace::new(SpaceKind::File, MigrateHandler::Simple))
    }

    #[test]
    fn test_expected_refs() {
        let node = Node::new(0, NodeKind::Cpu, 0, 8);
        let space = file_space();
        let f = node.alloc_frame().unwrap();
        assert_eq!(expected_page_refs(None, &f), 1);
        assert_eq!(expected_page_refs(Some(&space), &f), 2);
        let thp = node.alloc_compound(2, CompoundKind::Transparent).unwrap();
        assert_eq!(expected_page_refs(Some(&space), &thp), 5);

        let dev = Node::new(1, NodeKind::Device, 100, 1);
        let d = dev.alloc_frame().unwrap();
        assert_eq!(d.ref_count(), 2);
        assert_eq!(expected_page_refs(None, &d), 2);
    }

    #[test]
    fn test_anon_swap_checks_count() {
        let node = Node::new(0, NodeKind::Cpu, 0, 4);
        let old = node.alloc_frame().unwrap();
        let new = node.alloc_frame().unwrap();
        old.owner().index = 7;
        old.set_flags(FrameFlags::SWAPBACKED);

        old.get();
        assert_eq!(
            migrate_page_move_mapping(None, &new, &old, 0),
            Err(MigrateError::Again)
        );
        old.put();

        migrate_page_move_mapping(None, &new, &old, 0).unwrap();
        assert_eq!(new.index(), 7);
        assert!(new.has_flags(FrameFlags::SWAPBACKED));
        assert_eq!(old.ref_count(), 1);
    }

    #[test]
    fn test_cache_slot_swap() {
        let n0 = Node::new(0, NodeKind::Cpu, 0, 4);
        let n1 = Node::new(1, NodeKind::Cpu, 100, 4);
        let space = file_space();
        let old = n0.alloc_frame().unwrap();
        old.set_dirty();
        space.add_frame(&old, 3).unwrap();
        let new = n1.alloc_frame().unwrap();

        migrate_page_move_mapping(Some(&space), &new, &old, 0).unwrap();
        assert!(Arc::ptr_eq(&space.lookup(3).unwrap(), &new));
        assert_eq!(old.ref_count(), 1);
        assert_eq!(new.ref_count(), 2);
        assert!(new.is_dirty() && !old.is_dirty());
        assert_eq!(new.index(), 3);
        assert_eq!(n0.data().stats.get(NodeStat::FilePages), 0);
        assert_eq!(n1.data().stats.get(NodeStat::FilePages), 1);
        assert_eq!(n1.data().stats.get(NodeStat::FileDirty), 1);
    }

    #[test]
    fn test_extra_pin_refuses_swap() {
        let node = Node::new(0, NodeKind::Cpu, 0, 4);
        let space = file_space();
        let old = node.alloc_frame().unwrap();
        space.add_frame(&old, 0).unwrap();
        let new = node.alloc_frame().unwrap();
        assert!(old.try_get());

        assert_eq!(
            migrate_page_move_mapping(Some(&space), &new, &old, 0),
            Err(MigrateError::Again)
        );
        assert!(Arc::ptr_eq(&space.lookup(0).unwrap(), &old));
        assert_eq!(old.ref_count(), 3);
        assert_eq!(new.ref_count(), 1);
    }

    #[test]
    fn test_swapcache_entry_follows() {
        let node = Node::new(0, NodeKind::Cpu, 0, 4);
        let space = Arc::new(AddressSpace::swap());
        let old = node.alloc_frame().unwrap();
        space.add_frame(&old, 11).unwrap();
        old.set_private_word(0xdead);
        let new = node.alloc_frame().unwrap();

        migrate_page_move_mapping(Some(&space), &new, &old, 0).unwrap();
        assert!(new.has_flags(FrameFlags::SWAPCACHE));
        assert_eq!(new.private_word(), Some(0xdead));
    }

    #[test]
    fn test_huge_slot_swap() {
        let node = Node::new(0, NodeKind::Cpu, 0, 8);
        let space = Arc::new(AddressSpace::new(SpaceKind::File, MigrateHandler::HugeTlb));
        let hs = crate::mm::frame::Hstate {
            order: 2,
            migratable: true,
        };
        let old = node.alloc_compound(2, CompoundKind::HugeTlb(hs)).unwrap();
        space.add_frame(&old, 1).unwrap();
        assert_eq!(old.ref_count(), 2);
        let new = node.alloc_compound(2, CompoundKind::HugeTlb(hs)).unwrap();

        migrate_huge_page_move_mapping(&space, &new, &old).unwrap();
        assert_eq!(old.ref_count(), 1);
        assert_eq!(new.ref_count(), 2);
        assert!(Arc::ptr_eq(&space.lookup(1).unwrap(), &new));
    }
}

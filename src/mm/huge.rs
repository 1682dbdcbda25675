//! Huge page helpers: splitting transparent groups and hugetlb isolation

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::error::{MigrateError, Result};
use crate::mm::frame::{Compound, FrameFlags, FrameRef, PAGE_SIZE};
use crate::mm::pmap::Pte;

/// Flags a member inherits from its head when a group is split
const SPLIT_INHERIT: FrameFlags = FrameFlags::from_bits_truncate(
    FrameFlags::DIRTY.bits()
        | FrameFlags::ACTIVE.bits()
        | FrameFlags::UNEVICTABLE.bits()
        | FrameFlags::SWAPBACKED.bits()
        | FrameFlags::SWAPCACHE.bits()
        | FrameFlags::MLOCKED.bits()
        | FrameFlags::UPTODATE.bits()
        | FrameFlags::REFERENCED.bits()
        | FrameFlags::WORKINGSET.bits()
        | FrameFlags::YOUNG.bits()
        | FrameFlags::IDLE.bits(),
);

/// Split a locked transparent huge group into standalone frames.
///
/// The caller holds exactly one pin besides the mappings and cache slots;
/// any other reference makes the split fail with `Busy`. Each huge
/// mapping becomes one normal mapping per member. With `list`, the caller
/// has isolated the head and every new standalone frame is isolated too
/// and appended to `list`; otherwise members follow the head onto the LRU.
pub fn split_huge_page(head: &FrameRef, list: Option<&mut Vec<FrameRef>>) -> Result<()> {
    if !head.is_transhuge() {
        return Err(MigrateError::Inval);
    }
    let nr = head.nr_pages();
    let mapping = head.mapping();
    let cache_ref = u32::from(mapping.is_some());
    let sites = head.rmap_sites();
    let mapcount = head.mapcount();
    let expected = mapcount + cache_ref * nr as u32 + 1;

    let mut live = Vec::new();
    for site in &sites {
        let mm = site.mm.upgrade().ok_or(MigrateError::Busy)?;
        match mm.lookup(site.addr) {
            Some((base, Pte::Present { frame, .. })) if base == site.addr && Arc::ptr_eq(&frame, head) => {}
            _ => return Err(MigrateError::Busy),
        }
        live.push((mm, site.addr));
    }
    if live.len() as u32 != mapcount || !head.freeze(expected) {
        return Err(MigrateError::Busy);
    }

    let tails = head.tails();
    let on_lru = head.is_lru();
    let isolate = list.is_some();
    let inherit = head.flags().intersection(SPLIT_INHERIT);
    let owner = head.owner().clone();
    let per_frame = mapcount + cache_ref;

    for (i, tail) in tails.iter().enumerate() {
        let idx = i as u64 + 1;
        tail.set_compound(Compound::Standalone);
        tail.set_ref_count(per_frame + u32::from(isolate));
        tail.set_mapcount(mapcount);
        tail.set_flags(inherit);
        {
            let mut o = tail.owner();
            o.anon = owner.anon.clone();
            o.mapping = owner.mapping.clone();
            o.index = owner.index + idx;
        }
        tail.set_memcg(head.memcg());
        tail.set_cpupid(head.cpupid());
        for (mm, addr) in &live {
            tail.rmap_add(mm, addr + idx * PAGE_SIZE as u64);
        }
    }

    if let Some(space) = &mapping {
        let mut slots = space.slots();
        for (i, tail) in tails.iter().enumerate() {
            slots.insert(owner.index + i as u64 + 1, tail.clone());
        }
    }

    for (mm, addr) in &live {
        let _inv = mm.invalidate_range(*addr, addr + (nr * PAGE_SIZE) as u64);
        let mut ptes = mm.page_table();
        let (writable, dirty) = match ptes.get(addr) {
            Some(Pte::Present { writable, dirty, .. }) => (*writable, *dirty),
            _ => (false, false),
        };
        ptes.insert(
            *addr,
            Pte::Present {
                frame: head.clone(),
                writable,
                dirty,
                huge: false,
            },
        );
        for (i, tail) in tails.iter().enumerate() {
            ptes.insert(
                addr + (i as u64 + 1) * PAGE_SIZE as u64,
                Pte::Present {
                    frame: tail.clone(),
                    writable,
                    dirty,
                    huge: false,
                },
            );
        }
    }

    head.set_compound(Compound::Standalone);
    head.unfreeze(per_frame + 1);
    head.set_mapcount(mapcount);

    if let Some(list) = list {
        list.extend(tails.iter().cloned());
    } else if on_lru {
        for tail in &tails {
            tail.node_data().lru_add(tail);
        }
    }
    log::debug!("frame {}: split into {} frames", head.pfn(), nr);
    Ok(())
}

/// Take an active hugetlb head off its pool's active list onto `list`
pub fn isolate_huge_page(head: &FrameRef, list: &mut Vec<FrameRef>) -> bool {
    if !head.is_hugetlb() || !head.has_flags(FrameFlags::HUGE_ACTIVE) || !head.try_get() {
        return false;
    }
    head.clear_flags(FrameFlags::HUGE_ACTIVE);
    list.push(head.clone());
    true
}

/// Return an isolated hugetlb head to its pool's active list
pub fn putback_active_hugepage(head: &FrameRef) {
    head.set_flags(FrameFlags::HUGE_ACTIVE);
    head.put();
}

//! Migration for block-backed caches
//!
//! Frames of a block-backed cache may carry a buffer ring. The ring is
//! locked for the whole move, moved to the new frame after the identity
//! swap, and every buffer is re-pointed at the new frame before the
//! content is copied.

use alloc::sync::Arc;

use crate::error::{MigrateError, Result};
use crate::migrate::copy::{migrate_page_copy, migrate_page_states};
use crate::migrate::state::migrate_page;
use crate::migrate::swap::{expected_page_refs, migrate_page_move_mapping, transfer_private};
use crate::migrate::{MigrateMode, SyncMode};
use crate::mm::buffer::BufferRing;
use crate::mm::frame::FrameRef;
use crate::mm::mapping::AddressSpace;

/// Lock every buffer; async callers only try
fn lock_buffers(ring: &BufferRing, mode: MigrateMode) -> bool {
    if mode.sync != SyncMode::Async {
        for bh in ring.heads() {
            bh.lock();
        }
        return true;
    }
    for (i, bh) in ring.heads().iter().enumerate() {
        if !bh.try_lock() {
            for held in &ring.heads()[..i] {
                held.unlock();
            }
            return false;
        }
    }
    true
}

fn migrate_buffers(
    mapping: &Arc<AddressSpace>,
    new: &FrameRef,
    old: &FrameRef,
    mode: MigrateMode,
    check_refs: bool,
) -> Result<()> {
    let ring = match old.buffers() {
        Some(ring) => ring,
        None => return migrate_page(Some(mapping), new, old, mode),
    };

    if old.ref_count() != expected_page_refs(Some(mapping), old) {
        return Err(MigrateError::Again);
    }
    if !lock_buffers(&ring, mode) {
        return Err(MigrateError::Again);
    }

    // Held across the swap so no lookup can take a buffer reference
    let _private = if check_refs {
        let mut guard = mapping.private_lock.lock();
        if ring.has_refs() {
            drop(guard);
            ring.invalidate_cached();
            guard = mapping.private_lock.lock();
            if ring.has_refs() {
                ring.unlock_all();
                return Err(MigrateError::Again);
            }
        }
        Some(guard)
    } else {
        None
    };

    if let Err(err) = migrate_page_move_mapping(Some(mapping), new, old, 0) {
        ring.unlock_all();
        return Err(err);
    }

    transfer_private(new, old);
    ring.set_page(new.pfn());

    if mode.no_copy() {
        migrate_page_states(new, old);
    } else {
        migrate_page_copy(new, old, mode);
    }
    ring.unlock_all();
    log::trace!("frame {} -> {}: buffers moved", old.pfn(), new.pfn());
    Ok(())
}

/// Migrate a frame of a block device cache, whose buffers may be looked
/// up without the frame lock but are never referenced across it
pub fn buffer_migrate_page(
    mapping: &Arc<AddressSpace>,
    new: &FrameRef,
    old: &FrameRef,
    mode: MigrateMode,
) -> Result<()> {
    migrate_buffers(mapping, new, old, mode, false)
}

/// Like `buffer_migrate_page`, but also refuses frames whose buffers are
/// still referenced, after one attempt to drop cached lookup references
pub fn buffer_migrate_page_norefs(
    mapping: &Arc<AddressSpace>,
    new: &FrameRef,
    old: &FrameRef,
    mode: MigrateMode,
) -> Result<()> {
    migrate_buffers(mapping, new, old, mode, true)
}

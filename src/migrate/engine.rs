//! Batched Migration Engine
//!
//! Drives the per-frame state machine over a worklist of isolated frames.
//! Transient failures stay on the list for the next pass; everything else
//! leaves the list as soon as its outcome is final.
//!
//! ## Passes
//!
//! At most `MIGRATE_MAX_PASSES` passes are made. From the fourth pass on
//! the engine may block on the frame lock (if the mode allows it at all).
//! Frames still transient after the last pass count as failed and stay
//! on the list, isolated; the caller hands them to `putback_movable_pages`.

use alloc::vec::Vec;

use crate::counters::{self, THP_MIGRATION_SPLIT, THP_MIGRATION_SUCCESS};
use crate::error::{MigrateError, Result};
use crate::migrate::state::{unmap_and_move, unmap_and_move_huge_page};
use crate::migrate::{FrameSupplier, MigrateMode, MigrateReason};
use crate::mm::frame::FrameRef;
use crate::mm::huge::split_huge_page;

/// Upper bound on passes over the worklist
pub const MIGRATE_MAX_PASSES: usize = 10;

/// Passes made before the engine starts forcing lock acquisition
const FORCE_AFTER_PASS: usize = 2;

/// Outcome of one engine run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrateSummary {
    /// Frames now living at their destination (or freed meanwhile)
    pub succeeded: usize,
    /// Frames that never made it, permanently failed or out of retries
    pub failed: usize,
    /// Transparent huge groups split because no huge destination existed
    pub thp_split: usize,
}

impl MigrateSummary {
    /// Fold another run's outcome into this one
    pub fn merge(&mut self, other: MigrateSummary) {
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.thp_split += other.thp_split;
    }
}

/// Migrate every isolated frame on `list`, drawing destinations from
/// `supplier`.
///
/// Frames that succeed or fail permanently are removed from `list`.
/// Returns `Err(NoMem)` if a destination could not be supplied for a frame
/// that cannot be split; the frames still on `list` remain isolated.
pub fn migrate_pages(
    list: &mut Vec<FrameRef>,
    supplier: &dyn FrameSupplier,
    mode: MigrateMode,
    reason: MigrateReason,
) -> Result<MigrateSummary> {
    let mut summary = MigrateSummary::default();
    let mut thp_succeeded = 0u64;
    let mut retry = 1;
    let mut pass = 0;

    while pass < MIGRATE_MAX_PASSES && retry > 0 {
        retry = 0;
        let force = pass > FORCE_AFTER_PASS;
        let mut i = 0;

        while i < list.len() {
            let frame = list[i].clone();
            let is_thp = frame.is_transhuge();
            let rc = if frame.is_hugetlb() {
                unmap_and_move_huge_page(supplier, &frame, force, mode, reason)
            } else {
                unmap_and_move(supplier, &frame, force, mode, reason)
            };

            match rc {
                Ok(()) => {
                    list.remove(i);
                    summary.succeeded += 1;
                    if is_thp {
                        thp_succeeded += 1;
                    }
                }
                Err(MigrateError::Again) => {
                    retry += 1;
                    i += 1;
                }
                Err(MigrateError::NoMem) => {
                    if is_thp && split_isolated_thp(list, i) {
                        summary.thp_split += 1;
                        // Same index now holds the former head
                        continue;
                    }
                    finish_run(&summary, thp_succeeded, reason);
                    log::debug!(
                        "migrate: out of memory after {} succeeded, {} left on list",
                        summary.succeeded,
                        list.len()
                    );
                    return Err(MigrateError::NoMem);
                }
                Err(err) => {
                    log::trace!("frame {}: migration failed: {}", frame.pfn(), err);
                    list.remove(i);
                    summary.failed += 1;
                }
            }
            crate::cond_resched();
        }
        pass += 1;
    }

    summary.failed += retry;
    finish_run(&summary, thp_succeeded, reason);
    Ok(summary)
}

/// Split the isolated huge group at `list[i]`, queueing its former
/// members right behind it
fn split_isolated_thp(list: &mut Vec<FrameRef>, i: usize) -> bool {
    let head = list[i].clone();
    let mut members = Vec::new();
    head.lock();
    let rc = split_huge_page(&head, Some(&mut members));
    head.unlock();
    match rc {
        Ok(()) => {
            THP_MIGRATION_SPLIT.inc();
            list.splice(i + 1..i + 1, members);
            true
        }
        Err(err) => {
            log::trace!("frame {}: split for migration failed: {}", head.pfn(), err);
            false
        }
    }
}

fn finish_run(summary: &MigrateSummary, thp_succeeded: u64, reason: MigrateReason) {
    counters::count_run(summary.succeeded, summary.failed);
    if thp_succeeded > 0 {
        THP_MIGRATION_SUCCESS.add(thp_succeeded);
    }
    log::debug!(
        "migrate {:?}: {} succeeded, {} failed, {} split",
        reason,
        summary.succeeded,
        summary.failed,
        summary.thp_split
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;
    use crate::migrate::state::{isolate_for_migration, putback_movable_pages};
    use crate::migrate::NodeSupplier;
    use crate::mm::frame::CompoundKind;
    use crate::mm::node::{Node, NodeKind, NodeStat};
    use crate::mm::pmap::{Mm, Vma, VmFlags};
    use alloc::sync::Arc;

    fn mapped_frames(node: &Node, mm: &Arc<Mm>, n: usize) -> Vec<FrameRef> {
        (0..n)
            .map(|i| {
                let f = node.alloc_frame().unwrap();
                f.fill(i as u8 + 1);
                node.data().lru_add(&f);
                mm.map(0x10000 + (i as u64) * 0x1000, &f, true).unwrap();
                f.put();
                f
            })
            .collect()
    }

    fn anon_mm() -> Arc<Mm> {
        let mm = Mm::new();
        mm.add_vma(Vma::anon(0x10000, 0x80000, VmFlags::READ | VmFlags::WRITE))
            .unwrap();
        mm
    }

    #[test]
    fn test_all_frames_move() {
        let src = Node::new(0, NodeKind::Cpu, 0, 8);
        let dst = Node::new(1, NodeKind::Cpu, 100, 8);
        let mm = anon_mm();
        let frames = mapped_frames(&src, &mm, 4);
        let mut list = Vec::new();
        for f in &frames {
            isolate_for_migration(f, MigrateMode::SYNC, &mut list).unwrap();
        }

        let summary = migrate_pages(
            &mut list,
            &NodeSupplier::new(&dst),
            MigrateMode::SYNC,
            MigrateReason::Syscall,
        )
        .unwrap();

        assert_eq!(summary.succeeded, 4);
        assert_eq!(summary.failed, 0);
        assert!(list.is_empty());
        for i in 0..4u64 {
            let f = mm.fault(0x10000 + i * 0x1000).unwrap();
            assert_eq!(f.node_id(), 1);
            assert_eq!(f.read_byte(7), i as u8 + 1);
        }
        assert_eq!(src.nr_free(), 8);
        assert_eq!(src.data().stats.get(NodeStat::IsolatedAnon), 0);
    }

    #[test]
    fn test_pinned_frame_exhausts_retries() {
        let node = Node::new(0, NodeKind::Cpu, 0, 8);
        let mm = anon_mm();
        let frames = mapped_frames(&node, &mm, 2);
        let mut list = Vec::new();
        for f in &frames {
            isolate_for_migration(f, MigrateMode::SYNC, &mut list).unwrap();
        }
        // An external pin the migration cannot account for
        frames[1].get();

        let summary = migrate_pages(
            &mut list,
            &NodeSupplier::new(&node),
            MigrateMode::SYNC,
            MigrateReason::Compaction,
        )
        .unwrap();
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(list.len(), 1);
        assert!(Arc::ptr_eq(&list[0], &frames[1]));

        // Still mapped where it was
        let f = mm.fault(0x11000).unwrap();
        assert!(Arc::ptr_eq(&f, &frames[1]));

        putback_movable_pages(&mut list);
        assert!(frames[1].is_lru());
        frames[1].put();
        assert_eq!(frames[1].ref_count(), 1);
    }

    #[test]
    fn test_out_of_memory_aborts() {
        let node = Node::new(0, NodeKind::Cpu, 0, 8);
        let mm = anon_mm();
        let frames = mapped_frames(&node, &mm, 2);
        let mut list = Vec::new();
        for f in &frames {
            isolate_for_migration(f, MigrateMode::SYNC, &mut list).unwrap();
        }
        let none = |_: &FrameRef| -> Option<FrameRef> { None };
        assert_eq!(
            migrate_pages(&mut list, &none, MigrateMode::SYNC, MigrateReason::Syscall),
            Err(MigrateError::NoMem)
        );
        assert_eq!(list.len(), 2);
        putback_movable_pages(&mut list);
        assert!(frames.iter().all(|f| f.is_lru() && f.ref_count() == 1));
    }

    #[test]
    fn test_thp_split_when_no_huge_destination() {
        let _tunables = config::TUNABLES_TEST_LOCK.read();
        let node = Node::new(0, NodeKind::Cpu, 0, 16);
        let mm = anon_mm();
        let head = node.alloc_compound(2, CompoundKind::Transparent).unwrap();
        head.fill(0x3c);
        for tail in head.tails() {
            tail.fill(0x3c);
        }
        node.data().lru_add(&head);
        mm.map(0x40000, &head, true).unwrap();
        head.put();

        let mut list = Vec::new();
        isolate_for_migration(&head, MigrateMode::SYNC, &mut list).unwrap();
        assert_eq!(node.data().stats.get(NodeStat::IsolatedAnon), 4);

        // Only single frames are available
        let small = |old: &FrameRef| {
            if old.is_compound() {
                None
            } else {
                node.alloc_frame()
            }
        };
        let summary =
            migrate_pages(&mut list, &small, MigrateMode::SYNC, MigrateReason::Syscall).unwrap();
        assert_eq!(summary.thp_split, 1);
        assert_eq!(summary.succeeded, 4);
        assert!(list.is_empty());
        for i in 0..4u64 {
            let f = mm.fault(0x40000 + i * 0x1000).unwrap();
            assert!(!f.is_compound());
            assert_eq!(f.read_byte(0), 0x3c);
        }
        assert_eq!(node.data().stats.get(NodeStat::IsolatedAnon), 0);
    }

    #[test]
    fn test_thp_split_when_thp_migration_disabled() {
        let node = Node::new(0, NodeKind::Cpu, 0, 16);
        let mm = anon_mm();
        let head = node.alloc_compound(1, CompoundKind::Transparent).unwrap();
        node.data().lru_add(&head);
        mm.map(0x40000, &head, true).unwrap();
        head.put();
        let mut list = Vec::new();
        isolate_for_migration(&head, MigrateMode::SYNC, &mut list).unwrap();

        let rc = {
            let _tunables = config::TUNABLES_TEST_LOCK.write();
            config::tunables().set_thp_migration(false);
            let rc = migrate_pages(
                &mut list,
                &NodeSupplier::new(&node),
                MigrateMode::SYNC,
                MigrateReason::Syscall,
            );
            config::tunables().set_thp_migration(true);
            rc
        };

        let summary = rc.unwrap();
        assert_eq!(summary.thp_split, 1);
        assert_eq!(summary.succeeded, 2);
    }

    #[test]
    fn test_summary_merge() {
        let mut a = MigrateSummary {
            succeeded: 1,
            failed: 2,
            thp_split: 0,
        };
        a.merge(MigrateSummary {
            succeeded: 3,
            failed: 0,
            thp_split: 1,
        });
        assert_eq!(
            a,
            MigrateSummary {
                succeeded: 4,
                failed: 2,
                thp_split: 1
            }
        );
    }
}

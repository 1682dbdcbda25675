//! Bulk Relocation and Placement Queries
//!
//! Per-address entry points for moving the frames behind a process's
//! addresses to chosen nodes, and for asking where they live now.
//!
//! ## Status
//!
//! Every address gets a status of its own: the node the frame lives on
//! after the call, or the error that kept it from being considered or
//! moved. A bad address or node never stops the rest of the batch.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use crate::error::{MigrateError, Result};
use crate::migrate::concur::migrate_pages_concur;
use crate::migrate::engine::migrate_pages;
use crate::migrate::state::{isolate_for_migration, putback_movable_pages};
use crate::migrate::{CopyFlags, MigrateMode, MigrateReason, NodeSupplier};
use crate::mm::frame::FrameRef;
use crate::mm::node::{NodeId, NodeMask, Topology};
use crate::mm::pmap::{Mm, Pte};

/// Addresses handled per batch by `pages_stat`
pub const PAGES_STAT_CHUNK: usize = 16;

// ============================================================================
// Request Types
// ============================================================================

/// Request modifiers
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct MoveFlags(u32);

impl MoveFlags {
    /// Move frames even if other processes map them too
    pub const MOVE_ALL: Self = Self(0x1);
    /// Copy content with several threads
    pub const MT: Self = Self(0x2);
    /// Copy content with the offload engine
    pub const DMA: Self = Self(0x4);
    /// Use the pipelined engine
    pub const CONCUR: Self = Self(0x8);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    fn copy_flags(&self) -> CopyFlags {
        let mut copy = CopyFlags::empty();
        if self.contains(Self::MT) {
            copy = copy | CopyFlags::MT;
        }
        if self.contains(Self::DMA) {
            copy = copy | CopyFlags::DMA;
        }
        copy
    }
}

impl core::ops::BitOr for MoveFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for MoveFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MoveFlags({:#x})", self.0)
    }
}

/// Move the frame behind `addr` to `node`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveRequest {
    pub addr: u64,
    pub node: NodeId,
}

/// Outcome for one address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageStatus {
    /// The frame lives on this node
    Node(NodeId),
    /// The address could not be resolved, or its frame not moved
    Error(MigrateError),
}

impl PageStatus {
    /// Node id, or negative errno
    pub fn code(&self) -> i32 {
        match self {
            Self::Node(node) => i32::from(*node),
            Self::Error(err) => err.errno(),
        }
    }
}

/// Result of a bulk move
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveReport {
    /// Per-address outcome, in request order
    pub status: Vec<PageStatus>,
    /// Addresses queued for migration whose frame did not reach its node
    pub failed: usize,
}

// ============================================================================
// Bulk Move
// ============================================================================

/// A run of consecutive requests for one node
struct Run {
    node: Option<NodeId>,
    queued: Vec<usize>,
    list: Vec<FrameRef>,
}

/// Resolve `addr` and isolate its frame onto `list` unless it already
/// lives on `node`. Returns whether the frame was queued.
fn add_page_for_migration(
    mm: &Arc<Mm>,
    addr: u64,
    node: NodeId,
    list: &mut Vec<FrameRef>,
    move_all: bool,
) -> Result<bool> {
    let _mmap = mm.mmap_read();
    let vma = mm.find_vma(addr).ok_or(MigrateError::Fault)?;
    if !vma.migratable() {
        return Err(MigrateError::Fault);
    }
    let frame = match mm.lookup(addr) {
        Some((_, Pte::Present { frame, .. })) => frame,
        Some((_, Pte::Migration { .. })) => return Err(MigrateError::Busy),
        Some((_, Pte::DevicePrivate { .. })) | None => return Err(MigrateError::NoEnt),
    };
    if !frame.try_get() {
        return Err(MigrateError::NoEnt);
    }

    let rc = if frame.node_id() == node {
        Ok(false)
    } else if frame.mapcount() > 1 && !move_all {
        Err(MigrateError::Access)
    } else if frame.is_tail() {
        Err(MigrateError::Busy)
    } else {
        isolate_for_migration(&frame, MigrateMode::SYNC, list).map(|()| true)
    };
    // Isolation holds its own reference
    frame.put();
    rc
}

/// Current node of the frame mapped at `addr`
fn placement(mm: &Mm, addr: u64) -> Option<NodeId> {
    match mm.lookup(addr) {
        Some((_, Pte::Present { frame, .. })) => Some(frame.node_id()),
        _ => None,
    }
}

/// Migrate the queued frames of `run` and settle their status. Returns
/// how many queued addresses failed.
fn flush_run(
    topo: &Topology,
    mm: &Mm,
    requests: &[MoveRequest],
    run: &mut Run,
    status: &mut [PageStatus],
    flags: MoveFlags,
) -> usize {
    let target = match run.node {
        Some(node) => node,
        None => return 0,
    };
    if run.list.is_empty() {
        run.queued.clear();
        return 0;
    }
    let node = match topo.node(target) {
        Some(node) => node,
        None => return 0,
    };

    let supplier = NodeSupplier::new(node);
    let mode = MigrateMode::SYNC.with_copy(flags.copy_flags());
    let rc = if flags.contains(MoveFlags::CONCUR) {
        migrate_pages_concur(&mut run.list, &supplier, mode, MigrateReason::Syscall)
    } else {
        migrate_pages(&mut run.list, &supplier, mode, MigrateReason::Syscall)
    };
    if !run.list.is_empty() {
        putback_movable_pages(&mut run.list);
    }

    let mut failed = 0;
    for &i in &run.queued {
        status[i] = match placement(mm, requests[i].addr) {
            Some(now) if now == target => PageStatus::Node(target),
            _ => {
                failed += 1;
                PageStatus::Error(match rc {
                    Err(err) => err,
                    Ok(_) => MigrateError::Busy,
                })
            }
        };
    }
    run.queued.clear();
    log::debug!(
        "move_pages: run to node {} done, {} failed",
        target,
        failed
    );
    failed
}

/// Move the frames behind `requests` to their nodes.
///
/// Consecutive requests for the same node are migrated as one batch.
/// Nodes outside `allowed` or without memory get `InvalidNode`; shared
/// frames get `Access` unless `MOVE_ALL` is set.
pub fn move_pages(
    topo: &Topology,
    mm: &Arc<Mm>,
    requests: &[MoveRequest],
    allowed: NodeMask,
    flags: MoveFlags,
) -> MoveReport {
    let mut status = Vec::with_capacity(requests.len());
    status.resize(requests.len(), PageStatus::Error(MigrateError::NoEnt));
    let mut run = Run {
        node: None,
        queued: Vec::new(),
        list: Vec::new(),
    };
    let mut failed = 0;
    let move_all = flags.contains(MoveFlags::MOVE_ALL);

    for (i, req) in requests.iter().enumerate() {
        if !topo.node_has_memory(req.node) || !allowed.contains(req.node) {
            status[i] = PageStatus::Error(MigrateError::InvalidNode(req.node));
            continue;
        }
        if run.node != Some(req.node) {
            failed += flush_run(topo, mm, requests, &mut run, &mut status, flags);
            run.node = Some(req.node);
        }
        status[i] = match add_page_for_migration(mm, req.addr, req.node, &mut run.list, move_all) {
            Ok(true) => {
                run.queued.push(i);
                continue;
            }
            Ok(false) => PageStatus::Node(req.node),
            Err(err) => PageStatus::Error(err),
        };
    }
    failed += flush_run(topo, mm, requests, &mut run, &mut status, flags);

    MoveReport { status, failed }
}

// ============================================================================
// Placement Query
// ============================================================================

fn stat_one(mm: &Mm, addr: u64) -> PageStatus {
    if mm.find_vma(addr).is_none() {
        return PageStatus::Error(MigrateError::Fault);
    }
    match mm.fault(addr) {
        Ok(frame) => PageStatus::Node(frame.node_id()),
        // Device memory has no CPU placement to report
        Err(MigrateError::Fault) => PageStatus::Error(MigrateError::NoEnt),
        Err(err) => PageStatus::Error(err),
    }
}

/// Report the node behind each address without moving anything
pub fn pages_stat(mm: &Mm, addrs: &[u64]) -> Vec<PageStatus> {
    let mut out = Vec::with_capacity(addrs.len());
    for chunk in addrs.chunks(PAGES_STAT_CHUNK) {
        let mut pages: heapless::Vec<u64, PAGES_STAT_CHUNK> = heapless::Vec::new();
        let mut status: heapless::Vec<PageStatus, PAGES_STAT_CHUNK> = heapless::Vec::new();
        pages.extend_from_slice(chunk).ok(); // bounded by `chunks`

        let mmap = mm.mmap_read();
        for &addr in &pages {
            status.push(stat_one(mm, addr)).ok(); // bounded by `pages`
        }
        drop(mmap);
        out.extend_from_slice(&status);
    }
    out
}

//! Page migration engine
//!
//! Moves the content and identity of in-use frames to new frames while
//! every mapping, cache slot and reference keeps working.
//!
//! ## Submodules
//!
//! - `swap`: identity swap of cache slots under a frozen refcount
//! - `copy`: content and state transfer, serial / threaded / offload
//! - `buffer`: migration for block-backed caches with buffer rings
//! - `state`: per-frame move state machine, isolation and putback
//! - `engine`: batched engine with bounded retries
//! - `concur`: pipelined single-pass variant of the batched engine
//! - `device`: four-phase device-memory migration sessions
//! - `numa`: best-effort migration of misplaced frames
//! - `bulk`: per-address bulk move and status queries

pub mod buffer;
pub mod bulk;
pub mod concur;
pub mod copy;
pub mod device;
pub mod engine;
pub mod numa;
pub mod state;
pub mod swap;

use core::fmt;

use crate::mm::frame::FrameRef;
use crate::mm::node::Node;

pub use bulk::{move_pages, pages_stat, MoveFlags, MoveRequest, MoveReport, PageStatus};
pub use concur::migrate_pages_concur;
pub use copy::{migrate_page_copy, migrate_page_states, CopyOffload, CopyStrategy};
pub use device::{MigratePfn, MigrateVma};
pub use engine::{migrate_pages, MigrateSummary, MIGRATE_MAX_PASSES};
pub use numa::{migrate_misplaced_page, migrate_misplaced_transhuge_page};
pub use state::{isolate_movable_page, migrate_page, putback_movable_pages};
pub use swap::{expected_page_refs, migrate_huge_page_move_mapping, migrate_page_move_mapping};

// ============================================================================
// Mode
// ============================================================================

/// How hard a migration may try
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Never block
    Async,
    /// May block on locks, not on writeback
    SyncLight,
    /// May block on everything
    Sync,
    /// Like Sync, but the caller copies content itself
    SyncNoCopy,
}

/// Copy acceleration requested by the caller
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct CopyFlags(u32);

impl CopyFlags {
    /// Multi-threaded copy
    pub const MT: Self = Self(0x1);
    /// Offload engine copy
    pub const DMA: Self = Self(0x2);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl core::ops::BitOr for CopyFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl fmt::Debug for CopyFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CopyFlags(")?;
        if self.contains(Self::MT) {
            write!(f, "MT")?;
        }
        if self.contains(Self::DMA) {
            write!(f, "DMA")?;
        }
        write!(f, ")")
    }
}

/// Migration mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrateMode {
    pub sync: SyncMode,
    pub copy: CopyFlags,
    /// Caller is reclaiming memory and must never block
    pub reclaim: bool,
}

impl MigrateMode {
    pub const ASYNC: Self = Self::new(SyncMode::Async);
    pub const SYNC_LIGHT: Self = Self::new(SyncMode::SyncLight);
    pub const SYNC: Self = Self::new(SyncMode::Sync);
    pub const SYNC_NO_COPY: Self = Self::new(SyncMode::SyncNoCopy);

    pub const fn new(sync: SyncMode) -> Self {
        Self {
            sync,
            copy: CopyFlags::empty(),
            reclaim: false,
        }
    }

    pub const fn with_copy(mut self, copy: CopyFlags) -> Self {
        self.copy = copy;
        self
    }

    pub const fn in_reclaim(mut self) -> Self {
        self.reclaim = true;
        self
    }

    /// Blocking lock acquisition is allowed
    pub fn may_block(&self) -> bool {
        self.sync != SyncMode::Async && !self.reclaim
    }

    /// Full synchronous semantics
    pub fn is_sync(&self) -> bool {
        self.sync == SyncMode::Sync
    }

    /// Content copy is left to the caller
    pub fn no_copy(&self) -> bool {
        self.sync == SyncMode::SyncNoCopy
    }
}

/// Why frames are being migrated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrateReason {
    Compaction,
    MemoryFailure,
    MemoryHotplug,
    Syscall,
    MempolicyMbind,
    NumaMisplaced,
    ContigRange,
    DeviceMemory,
}

// ============================================================================
// Allocator capability
// ============================================================================

/// Supplies destination frames
pub trait FrameSupplier {
    /// A new frame shaped like `old`, holding one reference, or `None`
    /// if memory is exhausted
    fn supply(&self, old: &FrameRef) -> Option<FrameRef>;

    /// Take back a frame that was supplied but not used
    fn dispose(&self, frame: FrameRef) {
        frame.put();
    }
}

impl<F> FrameSupplier for F
where
    F: Fn(&FrameRef) -> Option<FrameRef>,
{
    fn supply(&self, old: &FrameRef) -> Option<FrameRef> {
        self(old)
    }
}

/// Allocates destinations on one node, matching the old frame's group shape
pub struct NodeSupplier<'a> {
    node: &'a Node,
}

impl<'a> NodeSupplier<'a> {
    pub fn new(node: &'a Node) -> Self {
        Self { node }
    }
}

impl FrameSupplier for NodeSupplier<'_> {
    fn supply(&self, old: &FrameRef) -> Option<FrameRef> {
        match old.compound_kind() {
            Some(kind) => self.node.alloc_compound(old.order(), kind),
            None => self.node.alloc_frame(),
        }
    }
}

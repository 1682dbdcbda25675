//! Content and State Transfer
//!
//! Copies the bytes of a frame (or of every member of a compound group)
//! and hands the transferable status over from the old frame to the new
//! one. Three copy strategies exist:
//!
//! - `Serial`: one member at a time on the calling thread
//! - `Threaded`: members (or byte ranges of a single frame) spread over
//!   scoped worker threads; needs the `std` feature
//! - `Offload`: a registered copy engine, falling back to a serial copy of
//!   exactly the member it failed on
//!
//! Group members are reached through the head's member table rather than
//! by physical-number stride, so very large groups whose members are not
//! linearly addressable copy correctly.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use spin::RwLock;

use crate::config;
use crate::error::{MigrateError, Result};
use crate::migrate::{CopyFlags, MigrateMode};
use crate::mm::frame::{Frame, FrameFlags, FrameRef, Private, MAX_ORDER_NR_PAGES};
use crate::mm::node::NodeKind;

// ============================================================================
// Offload engine
// ============================================================================

/// Hardware copy engine
pub trait CopyOffload: Send + Sync {
    /// Copy each `src[i]` into `dst[i]`. On error the content of `dst` is
    /// unspecified and the caller recopies.
    fn copy_frames(&self, dst: &[FrameRef], src: &[FrameRef]) -> Result<()>;
}

static OFFLOAD: RwLock<Option<Arc<dyn CopyOffload>>> = RwLock::new(None);

/// Make `engine` the copy engine used for `CopyFlags::DMA`
pub fn register_offload(engine: Arc<dyn CopyOffload>) {
    *OFFLOAD.write() = Some(engine);
}

/// Remove the registered copy engine
pub fn unregister_offload() {
    *OFFLOAD.write() = None;
}

fn offload_engine() -> Option<Arc<dyn CopyOffload>> {
    OFFLOAD.read().clone()
}

// ============================================================================
// Strategy
// ============================================================================

/// How content is copied
#[derive(Clone)]
pub enum CopyStrategy {
    Serial,
    Threaded { threads: usize },
    Offload(Arc<dyn CopyOffload>),
}

impl fmt::Debug for CopyStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serial => write!(f, "Serial"),
            Self::Threaded { threads } => write!(f, "Threaded({})", threads),
            Self::Offload(_) => write!(f, "Offload"),
        }
    }
}

impl CopyStrategy {
    /// Strategy for copying into `dst` under `mode`
    pub fn select(mode: MigrateMode, dst: &Frame, huge: bool) -> Self {
        let tun = config::tunables();
        let threads = tun.copy_threads();
        if mode.copy.contains(CopyFlags::DMA) {
            if let Some(engine) = offload_engine() {
                return Self::Offload(engine);
            }
        }
        if mode.copy.contains(CopyFlags::MT) {
            return Self::Threaded { threads };
        }
        if huge {
            let to_pmem = dst.node_data().kind() == NodeKind::Pmem;
            if tun.accel_page_copy() || (to_pmem && tun.avoid_remote_pmem_write()) {
                return Self::Threaded { threads };
            }
        }
        Self::Serial
    }
}

// ============================================================================
// Copy primitives
// ============================================================================

/// Copy one frame on the calling thread
pub fn copy_frame_serial(dst: &Frame, src: &Frame) {
    let s = src.data();
    let mut d = dst.data();
    d.copy_from_slice(&s);
}

/// Copy one frame with `threads` workers, each taking a byte range
#[cfg(any(test, feature = "std"))]
pub fn copy_frame_threaded(dst: &Frame, src: &Frame, threads: usize) -> Result<()> {
    let threads = threads.clamp(1, config::MAX_COPY_THREADS);
    let s = src.data();
    let mut d = dst.data();
    let chunk = s.len().div_ceil(threads);
    std::thread::scope(|scope| {
        for (dc, sc) in d.chunks_mut(chunk).zip(s.chunks(chunk)) {
            scope.spawn(move || dc.copy_from_slice(sc));
        }
    });
    Ok(())
}

#[cfg(not(any(test, feature = "std")))]
pub fn copy_frame_threaded(_dst: &Frame, _src: &Frame, _threads: usize) -> Result<()> {
    Err(MigrateError::NoSys)
}

/// Copy frame lists with `threads` workers, each taking a run of frames
#[cfg(any(test, feature = "std"))]
pub fn copy_frames_threaded(dst: &[FrameRef], src: &[FrameRef], threads: usize) -> Result<()> {
    if dst.len() != src.len() {
        return Err(MigrateError::Inval);
    }
    if dst.is_empty() {
        return Ok(());
    }
    let threads = threads.clamp(1, config::MAX_COPY_THREADS);
    let per = dst.len().div_ceil(threads);
    std::thread::scope(|scope| {
        for (dc, sc) in dst.chunks(per).zip(src.chunks(per)) {
            scope.spawn(move || {
                for (d, s) in dc.iter().zip(sc) {
                    copy_frame_serial(d, s);
                }
            });
        }
    });
    Ok(())
}

#[cfg(not(any(test, feature = "std")))]
pub fn copy_frames_threaded(_dst: &[FrameRef], _src: &[FrameRef], _threads: usize) -> Result<()> {
    Err(MigrateError::NoSys)
}

/// Head followed by every member, in group order
pub fn group_members(head: &FrameRef) -> Vec<FrameRef> {
    let mut members = Vec::with_capacity(head.nr_pages());
    members.push(head.clone());
    members.extend(head.tails());
    members
}

/// Copy every member one by one, with per-member offload fallback
fn copy_members_each(dst: &[FrameRef], src: &[FrameRef], strategy: &CopyStrategy) {
    for (i, (d, s)) in dst.iter().zip(src).enumerate() {
        match strategy {
            CopyStrategy::Offload(engine) => {
                if engine
                    .copy_frames(core::slice::from_ref(d), core::slice::from_ref(s))
                    .is_err()
                {
                    log::trace!("copy: offload failed on member {}, copying serially", i);
                    copy_frame_serial(d, s);
                }
            }
            CopyStrategy::Threaded { threads } => {
                if copy_frame_threaded(d, s, *threads).is_err() {
                    copy_frame_serial(d, s);
                }
            }
            CopyStrategy::Serial => copy_frame_serial(d, s),
        }
        if i % 64 == 63 {
            crate::cond_resched();
        }
    }
}

/// Copy a whole group
pub fn copy_huge_page(dst: &FrameRef, src: &FrameRef, strategy: &CopyStrategy) {
    let d = group_members(dst);
    let s = group_members(src);
    if d.len() != s.len() {
        log::warn!(
            "copy: group size mismatch {} -> {} ({} vs {} members)",
            src.pfn(),
            dst.pfn(),
            s.len(),
            d.len()
        );
    }
    let n = d.len().min(s.len());
    let (d, s) = (&d[..n], &s[..n]);

    match strategy {
        CopyStrategy::Threaded { threads } if n <= MAX_ORDER_NR_PAGES => {
            if copy_frames_threaded(d, s, *threads).is_err() {
                copy_members_each(d, s, &CopyStrategy::Serial);
            }
        }
        // Gigantic groups and offload copies go member by member so a
        // failure only ever redoes one member
        _ => copy_members_each(d, s, strategy),
    }
}

/// Copy a list of frame pairs in one call, amortizing strategy setup
pub fn copy_frame_list(dst: &[FrameRef], src: &[FrameRef], strategy: &CopyStrategy) {
    let n = dst.len().min(src.len());
    let (d, s) = (&dst[..n], &src[..n]);
    let done = match strategy {
        CopyStrategy::Offload(engine) => engine.copy_frames(d, s).is_ok(),
        CopyStrategy::Threaded { threads } => copy_frames_threaded(d, s, *threads).is_ok(),
        CopyStrategy::Serial => false,
    };
    if !done {
        for (i, (d, s)) in d.iter().zip(s).enumerate() {
            if d.is_head() {
                copy_huge_page(d, s, &CopyStrategy::Serial);
            } else {
                copy_frame_serial(d, s);
            }
            if i % 64 == 63 {
                crate::cond_resched();
            }
        }
    }
}

// ============================================================================
// State transfer
// ============================================================================

/// Hand the transferable state of `old` over to `new`.
///
/// Transferable flags are moved (set on `new`, cleared on `old`), the
/// placement hint is exchanged, and the cgroup association follows the
/// content. If `new` was under writeback, its waiters are released.
pub fn migrate_page_states(new: &Frame, old: &Frame) {
    let moved = old.take_flags(FrameFlags::TRANSFERABLE);
    new.set_flags(moved);

    new.set_cpupid(old.xchg_cpupid(0));

    old.clear_flags(FrameFlags::SWAPCACHE);
    {
        let mut owner = old.owner();
        if let Private::Word(_) = owner.private {
            owner.private = Private::None;
        }
    }

    if new.is_writeback() {
        new.end_writeback();
    }

    new.set_memcg(old.memcg());
    log::trace!("frame {} -> {}: moved state {:?}", old.pfn(), new.pfn(), moved);
}

/// Undo `migrate_page_states` after a late failure
pub fn restore_page_states(old: &Frame, new: &Frame) {
    let moved = new.take_flags(FrameFlags::TRANSFERABLE);
    old.set_flags(moved);
    old.set_cpupid(new.xchg_cpupid(0));
}

/// Copy content then state from `old` to `new`
pub fn migrate_page_copy(new: &FrameRef, old: &FrameRef, mode: MigrateMode) {
    let huge = old.is_head();
    let strategy = CopyStrategy::select(mode, new, huge);
    if huge {
        copy_huge_page(new, old, &strategy);
    } else {
        copy_members_each(
            core::slice::from_ref(new),
            core::slice::from_ref(old),
            &strategy,
        );
    }
    migrate_page_states(new, old);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::frame::CompoundKind;
    use crate::mm::node::Node;
    use core::sync::atomic::{AtomicUsize, Ordering};

    /// Fails on every other call
    struct FlakyEngine {
        calls: AtomicUsize,
    }

    impl CopyOffload for FlakyEngine {
        fn copy_frames(&self, dst: &[FrameRef], src: &[FrameRef]) -> Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            for (d, s) in dst.iter().zip(src) {
                // Scribble a partial copy before failing
                d.write_byte(0, s.read_byte(0));
            }
            if n % 2 == 1 {
                return Err(MigrateError::Io);
            }
            for (d, s) in dst.iter().zip(src) {
                copy_frame_serial(d, s);
            }
            Ok(())
        }
    }

    fn pattern(frame: &Frame, seed: u8) {
        let mut data = frame.data();
        for (i, b) in data.iter_mut().enumerate() {
            *b = seed.wrapping_add(i as u8);
        }
    }

    #[test]
    fn test_serial_and_threaded_copy() {
        let node = Node::new(0, NodeKind::Cpu, 0, 4);
        let a = node.alloc_frame().unwrap();
        let b = node.alloc_frame().unwrap();
        let c = node.alloc_frame().unwrap();
        pattern(&a, 3);
        copy_frame_serial(&b, &a);
        assert_eq!(&b.data()[..], &a.data()[..]);
        copy_frame_threaded(&c, &a, 3).unwrap();
        assert_eq!(&c.data()[..], &a.data()[..]);
    }

    #[test]
    fn test_offload_fallback_per_member() {
        let node = Node::new(0, NodeKind::Cpu, 0, 16);
        let src = node.alloc_compound(2, CompoundKind::Transparent).unwrap();
        let dst = node.alloc_compound(2, CompoundKind::Transparent).unwrap();
        for (i, m) in group_members(&src).iter().enumerate() {
            pattern(m, i as u8 * 31);
        }
        let engine = Arc::new(FlakyEngine {
            calls: AtomicUsize::new(0),
        });
        copy_huge_page(&dst, &src, &CopyStrategy::Offload(engine.clone()));
        assert_eq!(engine.calls.load(Ordering::SeqCst), 4);
        for (d, s) in group_members(&dst).iter().zip(group_members(&src).iter()) {
            assert_eq!(&d.data()[..], &s.data()[..]);
        }
    }

    #[test]
    fn test_threaded_list_copy() {
        let node = Node::new(0, NodeKind::Cpu, 0, 12);
        let src: Vec<_> = (0..6).map(|_| node.alloc_frame().unwrap()).collect();
        let dst: Vec<_> = (0..6).map(|_| node.alloc_frame().unwrap()).collect();
        for (i, s) in src.iter().enumerate() {
            pattern(s, i as u8);
        }
        copy_frame_list(&dst, &src, &CopyStrategy::Threaded { threads: 4 });
        for (d, s) in dst.iter().zip(&src) {
            assert_eq!(&d.data()[..], &s.data()[..]);
        }
    }

    #[test]
    fn test_state_transfer_moves_flags() {
        let node = Node::new(0, NodeKind::Cpu, 0, 4);
        let old = node.alloc_frame().unwrap();
        let new = node.alloc_frame().unwrap();
        old.set_flags(FrameFlags::DIRTY | FrameFlags::ACTIVE | FrameFlags::REFERENCED);
        old.set_flags(FrameFlags::SWAPCACHE);
        old.set_cpupid(42);
        old.set_memcg(5);
        new.set_writeback();

        migrate_page_states(&new, &old);
        assert!(new.has_flags(FrameFlags::DIRTY | FrameFlags::ACTIVE | FrameFlags::REFERENCED));
        assert!(!old.flags().intersects(FrameFlags::TRANSFERABLE));
        assert!(!old.has_flags(FrameFlags::SWAPCACHE));
        assert_eq!(new.cpupid(), 42);
        assert_eq!(old.cpupid(), 0);
        assert_eq!(new.memcg(), 5);
        assert!(!new.is_writeback());

        restore_page_states(&old, &new);
        assert!(old.has_flags(FrameFlags::DIRTY | FrameFlags::ACTIVE));
        assert_eq!(old.cpupid(), 42);
    }

    #[test]
    fn test_select_strategy() {
        let node = Node::new(0, NodeKind::Cpu, 0, 1);
        let f = node.frame(0).unwrap();
        let mt = MigrateMode::SYNC.with_copy(CopyFlags::MT);
        assert!(matches!(
            CopyStrategy::select(mt, &f, false),
            CopyStrategy::Threaded { .. }
        ));
        assert!(matches!(
            CopyStrategy::select(MigrateMode::SYNC, &f, false),
            CopyStrategy::Serial
        ));
    }
}

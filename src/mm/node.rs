//! NUMA Nodes - Frame Pools, LRU Lists and Topology
//!
//! Each node owns a contiguous pool of frames and the bookkeeping shared
//! with those frames: LRU lists, per-node accounting and a watermark.
//! The bookkeeping lives in `NodeData` behind an `Arc` so that every
//! frame can reach its node without a global table.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use spin::Mutex;

use crate::error::{MigrateError, Result};
use crate::mm::frame::{Compound, CompoundKind, Frame, FrameFlags, FrameRef, Pfn};

// ============================================================================
// Constants
// ============================================================================

/// Node identifier
pub type NodeId = u16;

/// Maximum number of nodes
pub const MAX_NUMNODES: usize = 16;

/// Distance to self
pub const LOCAL_DISTANCE: u8 = 10;

/// Default distance between two different nodes
pub const REMOTE_DISTANCE: u8 = 20;

/// Node flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Memory with CPUs attached
    Cpu,
    /// Memory-only persistent memory
    Pmem,
    /// Device memory the CPU cannot address
    Device,
}

// ============================================================================
// Node Statistics
// ============================================================================

/// Per-node accounting items
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum NodeStat {
    IsolatedAnon = 0,
    IsolatedFile = 1,
    FilePages = 2,
    Shmem = 3,
    FileDirty = 4,
    WritePending = 5,
}

const NR_NODE_STATS: usize = 6;

/// Per-node counters
#[derive(Debug)]
pub struct NodeStats {
    items: [AtomicI64; NR_NODE_STATS],
}

impl NodeStats {
    pub const fn new() -> Self {
        Self {
            items: [
                AtomicI64::new(0),
                AtomicI64::new(0),
                AtomicI64::new(0),
                AtomicI64::new(0),
                AtomicI64::new(0),
                AtomicI64::new(0),
            ],
        }
    }

    pub fn add(&self, item: NodeStat, delta: i64) {
        self.items[item as usize].fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self, item: NodeStat) -> i64 {
        self.items[item as usize].load(Ordering::Relaxed)
    }
}

impl Default for NodeStats {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// LRU Lists
// ============================================================================

/// Which LRU list a frame sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LruList {
    Inactive,
    Active,
    Unevictable,
}

/// The three LRU lists of one node
#[derive(Debug, Default)]
pub struct LruLists {
    inactive: VecDeque<Pfn>,
    active: VecDeque<Pfn>,
    unevictable: VecDeque<Pfn>,
}

impl LruLists {
    fn list_mut(&mut self, which: LruList) -> &mut VecDeque<Pfn> {
        match which {
            LruList::Inactive => &mut self.inactive,
            LruList::Active => &mut self.active,
            LruList::Unevictable => &mut self.unevictable,
        }
    }

    fn list(&self, which: LruList) -> &VecDeque<Pfn> {
        match which {
            LruList::Inactive => &self.inactive,
            LruList::Active => &self.active,
            LruList::Unevictable => &self.unevictable,
        }
    }

    fn remove(&mut self, pfn: Pfn) -> bool {
        for which in [LruList::Inactive, LruList::Active, LruList::Unevictable] {
            let list = self.list_mut(which);
            if let Some(pos) = list.iter().position(|&p| p == pfn) {
                list.remove(pos);
                return true;
            }
        }
        false
    }

    /// List holding `pfn`, if any
    pub fn find(&self, pfn: Pfn) -> Option<LruList> {
        [LruList::Inactive, LruList::Active, LruList::Unevictable]
            .into_iter()
            .find(|&which| self.list(which).contains(&pfn))
    }

    pub fn len(&self) -> usize {
        self.inactive.len() + self.active.len() + self.unevictable.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// List a frame belongs on, judging by its flags
pub fn lru_list_for(frame: &Frame) -> LruList {
    let flags = frame.flags();
    if flags.contains(FrameFlags::UNEVICTABLE) {
        LruList::Unevictable
    } else if flags.contains(FrameFlags::ACTIVE) {
        LruList::Active
    } else {
        LruList::Inactive
    }
}

// ============================================================================
// Node Data
// ============================================================================

/// Bookkeeping shared between a node and its frames
#[derive(Debug)]
pub struct NodeData {
    id: NodeId,
    kind: NodeKind,
    lru: Mutex<LruLists>,
    pub stats: NodeStats,
    nr_free: AtomicUsize,
    high_wmark: AtomicUsize,
}

impl NodeData {
    pub fn new(id: NodeId, kind: NodeKind) -> Self {
        Self {
            id,
            kind,
            lru: Mutex::new(LruLists::default()),
            stats: NodeStats::new(),
            nr_free: AtomicUsize::new(0),
            high_wmark: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn nr_free(&self) -> usize {
        self.nr_free.load(Ordering::Relaxed)
    }

    pub fn high_wmark(&self) -> usize {
        self.high_wmark.load(Ordering::Relaxed)
    }

    pub fn set_high_wmark(&self, frames: usize) {
        self.high_wmark.store(frames, Ordering::Relaxed);
    }

    /// Room for `nr` more frames above the high watermark
    pub fn watermark_ok(&self, nr: usize) -> bool {
        self.nr_free() >= self.high_wmark() + nr
    }

    pub(crate) fn account_free(&self, nr: usize) {
        self.nr_free.fetch_add(nr, Ordering::Relaxed);
    }

    pub(crate) fn account_alloc(&self, nr: usize) {
        self.nr_free.fetch_sub(nr, Ordering::Relaxed);
    }

    /// Link `frame` on the list its flags select
    pub fn lru_add(&self, frame: &Frame) {
        let which = lru_list_for(frame);
        let mut lru = self.lru.lock();
        lru.remove(frame.pfn());
        lru.list_mut(which).push_back(frame.pfn());
        frame.set_flags(FrameFlags::LRU);
    }

    pub(crate) fn lru_del(&self, pfn: Pfn) {
        self.lru.lock().remove(pfn);
    }

    /// List currently holding `pfn`
    pub fn lru_find(&self, pfn: Pfn) -> Option<LruList> {
        self.lru.lock().find(pfn)
    }

    pub fn lru_len(&self) -> usize {
        self.lru.lock().len()
    }
}

// ============================================================================
// LRU isolation
// ============================================================================

/// Isolation accounting bucket for `frame`
pub fn isolated_stat(frame: &Frame) -> NodeStat {
    if frame.has_flags(FrameFlags::SWAPBACKED) {
        NodeStat::IsolatedAnon
    } else {
        NodeStat::IsolatedFile
    }
}

/// Take `frame` off its LRU list, pinning it with an isolation reference
pub fn isolate_lru_page(frame: &Frame) -> Result<()> {
    let node = frame.node_data();
    {
        let mut lru = node.lru.lock();
        if frame.ref_count() == 0 || !frame.test_and_clear(FrameFlags::LRU) {
            return Err(MigrateError::Busy);
        }
        lru.remove(frame.pfn());
    }
    frame.get();
    log::trace!("frame {}: isolated from lru", frame.pfn());
    Ok(())
}

/// Put an isolated frame back on its LRU list and drop the isolation reference
pub fn putback_lru_page(frame: &Frame) {
    frame.node_data().lru_add(frame);
    frame.put();
}

// ============================================================================
// Node (frame pool)
// ============================================================================

/// A node and its frames
pub struct Node {
    data: Arc<NodeData>,
    base_pfn: Pfn,
    frames: Vec<FrameRef>,
    alloc_lock: Mutex<()>,
}

impl Node {
    /// Create a node covering `nr_frames` frames from `base_pfn`
    pub fn new(id: NodeId, kind: NodeKind, base_pfn: Pfn, nr_frames: usize) -> Self {
        let data = Arc::new(NodeData::new(id, kind));
        let frames = (0..nr_frames as u64)
            .map(|i| Arc::new(Frame::new(base_pfn + i, data.clone())))
            .collect();
        data.account_free(nr_frames);
        Self {
            data,
            base_pfn,
            frames,
            alloc_lock: Mutex::new(()),
        }
    }

    pub fn id(&self) -> NodeId {
        self.data.id()
    }

    pub fn kind(&self) -> NodeKind {
        self.data.kind()
    }

    pub fn data(&self) -> &Arc<NodeData> {
        &self.data
    }

    pub fn frames(&self) -> &[FrameRef] {
        &self.frames
    }

    /// Frame with physical number `pfn`
    pub fn frame(&self, pfn: Pfn) -> Option<FrameRef> {
        let idx = pfn.checked_sub(self.base_pfn)? as usize;
        self.frames.get(idx).cloned()
    }

    pub fn contains(&self, pfn: Pfn) -> bool {
        pfn >= self.base_pfn && pfn < self.base_pfn + self.frames.len() as u64
    }

    pub fn nr_free(&self) -> usize {
        self.data.nr_free()
    }

    /// Allocate one frame holding a single reference
    pub fn alloc_frame(&self) -> Option<FrameRef> {
        let _guard = self.alloc_lock.lock();
        let frame = self.frames.iter().find(|f| f.try_claim())?.clone();
        self.data.account_alloc(1);
        log::trace!("node {}: alloc frame {}", self.id(), frame.pfn());
        Some(frame)
    }

    /// Allocate an aligned group of `1 << order` frames; the head holds
    /// a single reference
    pub fn alloc_compound(&self, order: u32, kind: CompoundKind) -> Option<FrameRef> {
        if order == 0 {
            return self.alloc_frame();
        }
        let nr = 1usize << order;
        let _guard = self.alloc_lock.lock();
        let mut start = 0;
        while start + nr <= self.frames.len() {
            let run = &self.frames[start..start + nr];
            let free = run
                .iter()
                .all(|f| f.ref_count() == 0 && !f.is_compound() && f.flags().is_empty());
            if free && run[0].try_claim() {
                let head = run[0].clone();
                let tails: Vec<FrameRef> = run[1..].to_vec();
                for (i, tail) in tails.iter().enumerate() {
                    tail.set_compound(Compound::Member {
                        head: Arc::downgrade(&head),
                        index: i + 1,
                    });
                }
                head.set_compound(Compound::Head { order, kind, tails });
                self.data.account_alloc(nr);
                log::trace!("node {}: alloc order-{} group at {}", self.id(), order, head.pfn());
                return Some(head);
            }
            start += nr;
        }
        None
    }
}

// ============================================================================
// Node Mask
// ============================================================================

/// Set of nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeMask(u64);

impl NodeMask {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn all() -> Self {
        Self(u64::MAX)
    }

    pub fn set(&mut self, node: NodeId) {
        if (node as usize) < 64 {
            self.0 |= 1 << node;
        }
    }

    pub fn contains(&self, node: NodeId) -> bool {
        (node as usize) < 64 && self.0 & (1 << node) != 0
    }

    pub fn from_nodes(nodes: &[NodeId]) -> Self {
        let mut mask = Self::empty();
        for &n in nodes {
            mask.set(n);
        }
        mask
    }
}

// ============================================================================
// Topology
// ============================================================================

/// Nearest CPU node for each node, indexed by node id
pub type NearestTable = heapless::Vec<Option<NodeId>, MAX_NUMNODES>;

/// The machine's nodes and the distances between them
pub struct Topology {
    nodes: Vec<Node>,
    distance: Vec<Vec<u8>>,
    nearest_cpu: spin::Once<NearestTable>,
}

impl Topology {
    /// Build a topology with default distances
    pub fn new(nodes: Vec<Node>) -> Self {
        let n = nodes.len();
        let distance = (0..n)
            .map(|a| {
                (0..n)
                    .map(|b| if a == b { LOCAL_DISTANCE } else { REMOTE_DISTANCE })
                    .collect()
            })
            .collect();
        Self {
            nodes,
            distance,
            nearest_cpu: spin::Once::new(),
        }
    }

    /// Replace the distance table; rows and columns follow node order
    pub fn with_distances(mut self, table: Vec<Vec<u8>>) -> Result<Self> {
        let n = self.nodes.len();
        if table.len() != n || table.iter().any(|row| row.len() != n) {
            return Err(MigrateError::Inval);
        }
        self.distance = table;
        Ok(self)
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id() == id)
    }

    fn position(&self, id: NodeId) -> Option<usize> {
        self.nodes.iter().position(|n| n.id() == id)
    }

    pub fn node_distance(&self, a: NodeId, b: NodeId) -> Option<u8> {
        let (a, b) = (self.position(a)?, self.position(b)?);
        Some(self.distance[a][b])
    }

    /// Whether `id` names a node holding CPU-addressable memory
    pub fn node_has_memory(&self, id: NodeId) -> bool {
        self.node(id)
            .map(|n| n.kind() != NodeKind::Device && !n.frames().is_empty())
            .unwrap_or(false)
    }

    /// Frame with physical number `pfn`, on whichever node holds it
    pub fn frame(&self, pfn: Pfn) -> Option<FrameRef> {
        self.nodes.iter().find(|n| n.contains(pfn))?.frame(pfn)
    }

    /// Nearest CPU node for `id`. A CPU node is its own nearest;
    /// memory-only nodes pick the closest CPU node.
    ///
    /// The table is computed once; concurrent first callers wait for the
    /// single computation instead of racing to fill it.
    pub fn nearest_cpu_node(&self, id: NodeId) -> Option<NodeId> {
        let table = self.nearest_cpu.call_once(|| self.compute_nearest());
        let pos = self.position(id)?;
        table.get(pos).copied().flatten()
    }

    fn compute_nearest(&self) -> NearestTable {
        let mut table = NearestTable::new();
        for node in self.nodes.iter().take(MAX_NUMNODES) {
            let nearest = match node.kind() {
                NodeKind::Cpu => Some(node.id()),
                NodeKind::Pmem | NodeKind::Device => self
                    .nodes
                    .iter()
                    .filter(|c| c.kind() == NodeKind::Cpu)
                    .filter_map(|c| Some((self.node_distance(node.id(), c.id())?, c.id())))
                    .min()
                    .map(|(_, id)| id),
            };
            table.push(nearest).ok(); // bounded by the `take` above
        }
        log::debug!("topology: nearest cpu nodes {:?}", table);
        table
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_and_free() {
        let node = Node::new(0, NodeKind::Cpu, 0, 4);
        assert_eq!(node.nr_free(), 4);
        let f = node.alloc_frame().unwrap();
        assert_eq!(f.ref_count(), 1);
        assert_eq!(node.nr_free(), 3);
        assert!(f.put());
        assert_eq!(node.nr_free(), 4);
    }

    #[test]
    fn test_alloc_compound() {
        let node = Node::new(0, NodeKind::Cpu, 0, 8);
        let _single = node.alloc_frame().unwrap();
        let head = node.alloc_compound(2, CompoundKind::Transparent).unwrap();
        assert_eq!(head.pfn(), 4);
        assert_eq!(head.nr_pages(), 4);
        let tail = node.frame(5).unwrap();
        assert!(tail.is_tail());
        tail.get();
        assert_eq!(head.ref_count(), 2);
        tail.put();
        assert!(head.put());
        assert!(!tail.is_tail());
        assert_eq!(node.nr_free(), 7);
    }

    #[test]
    fn test_lru_isolate_putback() {
        let node = Node::new(0, NodeKind::Cpu, 0, 2);
        let f = node.alloc_frame().unwrap();
        f.set_flags(FrameFlags::ACTIVE);
        node.data().lru_add(&f);
        assert_eq!(node.data().lru_find(f.pfn()), Some(LruList::Active));

        isolate_lru_page(&f).unwrap();
        assert_eq!(f.ref_count(), 2);
        assert!(!f.is_lru());
        assert_eq!(isolate_lru_page(&f), Err(MigrateError::Busy));

        putback_lru_page(&f);
        assert_eq!(f.ref_count(), 1);
        assert_eq!(node.data().lru_find(f.pfn()), Some(LruList::Active));
    }

    #[test]
    fn test_nearest_cpu_node() {
        let topo = Topology::new(vec![
            Node::new(0, NodeKind::Cpu, 0, 1),
            Node::new(1, NodeKind::Cpu, 100, 1),
            Node::new(2, NodeKind::Pmem, 200, 1),
        ])
        .with_distances(vec![vec![10, 20, 40], vec![20, 10, 17], vec![40, 17, 10]])
        .unwrap();
        assert_eq!(topo.nearest_cpu_node(0), Some(0));
        assert_eq!(topo.nearest_cpu_node(2), Some(1));
        assert_eq!(topo.nearest_cpu_node(9), None);
    }

    #[test]
    fn test_watermark() {
        let node = Node::new(0, NodeKind::Cpu, 0, 4);
        node.data().set_high_wmark(2);
        assert!(node.data().watermark_ok(2));
        assert!(!node.data().watermark_ok(3));
    }
}

//! Memory model the migration engine operates on
//!
//! - `frame`: physical frames, reference counts, lock bit, flags
//! - `node`: NUMA nodes, frame pools, LRU lists, topology
//! - `mapping`: file/swap caches, anonymous lifetime tokens, handler capabilities
//! - `pmap`: process address spaces, page tables, migration entries
//! - `buffer`: buffer rings of block-backed caches
//! - `huge`: splitting transparent huge groups, hugetlb isolation

pub mod buffer;
pub mod frame;
pub mod huge;
pub mod mapping;
pub mod node;
pub mod pmap;

pub use frame::{
    CompoundKind, Frame, FrameFlags, FrameOwner, FrameRef, Hstate, Pfn, Private, PAGE_SHIFT,
    PAGE_SIZE,
};
pub use mapping::{
    AddressSpace, AnonVma, MappingMigrate, MigrateHandler, MovableOps, PageWriter, SpaceKind,
};
pub use node::{
    isolate_lru_page, putback_lru_page, Node, NodeData, NodeId, NodeKind, NodeMask, NodeStat,
    Topology,
};
pub use pmap::{Mm, MmuNotifier, Pte, UnmapRecord, Vma, VmFlags};

//! Shared fixtures for the integration tests

#![allow(dead_code)]

use std::sync::Arc;

use page_migrate::migrate::state::isolate_for_migration;
use page_migrate::mm::{FrameRef, Mm, Node, NodeKind, VmFlags, Vma};
use page_migrate::MigrateMode;

/// Base of the anonymous region every fixture maps into
pub const BASE: u64 = 0x10_0000;

pub fn cpu_node(id: u16, base_pfn: u64, nr: usize) -> Node {
    Node::new(id, NodeKind::Cpu, base_pfn, nr)
}

/// Address space with one read-write anonymous region of `len` bytes at `BASE`
pub fn anon_mm(len: u64) -> Arc<Mm> {
    let mm = Mm::new();
    mm.add_vma(Vma::anon(BASE, BASE + len, VmFlags::READ | VmFlags::WRITE))
        .unwrap();
    mm
}

/// Map a fresh frame from `node` at `addr`, filled with `byte`; the
/// mapping holds the only reference
pub fn map_filled(node: &Node, mm: &Arc<Mm>, addr: u64, byte: u8) -> FrameRef {
    let f = node.alloc_frame().unwrap();
    f.fill(byte);
    node.data().lru_add(&f);
    mm.map(addr, &f, true).unwrap();
    f.put();
    f
}

/// Isolate every frame onto a new worklist
pub fn isolate_all(frames: &[FrameRef]) -> Vec<FrameRef> {
    let mut list = Vec::new();
    for f in frames {
        isolate_for_migration(f, MigrateMode::SYNC, &mut list).unwrap();
    }
    list
}

pub fn addr_of(i: usize) -> u64 {
    BASE + (i as u64) * 0x1000
}

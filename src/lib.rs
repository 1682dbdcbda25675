//! page_migrate - live physical frame migration
//!
//! Moves the content and identity of in-use frames to other frames, on
//! the same node or elsewhere, while mappings, cache lookups and
//! references keep resolving correctly.
//!
//! ## Layout
//!
//! - `mm`: the memory model (frames, nodes, caches, address spaces)
//! - `migrate`: the migration engine built on top of it
//! - `config`: process-wide tunables
//! - `counters`: event counters
//! - `error`: the error taxonomy shared by every operation

#![cfg_attr(not(any(test, feature = "std")), no_std)]
// Several model types are only ever built behind an Arc and have no
// sensible Default
#![allow(clippy::new_without_default)]
// Flag structs spell out bit values next to their names
#![allow(clippy::identity_op)]

extern crate alloc;

pub mod config;
pub mod counters;
pub mod error;
pub mod migrate;
pub mod mm;

pub use config::MigrateConfig;
pub use error::{ErrorClass, MigrateError, Result};
pub use migrate::{
    migrate_misplaced_page, migrate_misplaced_transhuge_page, migrate_page, migrate_pages,
    migrate_pages_concur, move_pages, pages_stat, putback_movable_pages, CopyFlags,
    FrameSupplier, MigrateMode, MigrateReason, MigrateSummary, MigrateVma, NodeSupplier,
    SyncMode,
};

/// Apply `cfg` as the process-wide tunables
pub fn init(cfg: MigrateConfig) {
    config::configure(cfg);
    log::info!(
        "page_migrate: thp migration {}, copy threads {}",
        if cfg.thp_migration { "on" } else { "off" },
        cfg.copy_threads
    );
}

/// Give other work a chance to run between frames of a long batch
#[cfg(any(test, feature = "std"))]
pub(crate) fn cond_resched() {
    std::thread::yield_now();
}

#[cfg(not(any(test, feature = "std")))]
pub(crate) fn cond_resched() {
    core::hint::spin_loop();
}

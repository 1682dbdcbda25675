//! Process-wide migration tunables
//!
//! Knobs that steer copy strategy selection and huge page handling.
//! They live in one static table of atomics so readers on the hot path
//! never take a lock. `configure` swaps in a whole `MigrateConfig`
//! snapshot; individual setters exist for the sysctl-style callers.

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Default number of worker threads for a multi-threaded copy
pub const DEFAULT_COPY_THREADS: usize = 4;

/// Upper bound on copy workers
pub const MAX_COPY_THREADS: usize = 32;

/// Snapshot of the tunables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrateConfig {
    /// Use the multi-threaded path for huge page copies
    pub accel_page_copy: bool,
    /// Copy into persistent memory from the nearest CPU node
    pub avoid_remote_pmem_write: bool,
    /// Transparent huge pages may be migrated without splitting
    pub thp_migration: bool,
    /// Worker threads used by multi-threaded copies
    pub copy_threads: usize,
}

impl MigrateConfig {
    pub const fn new() -> Self {
        Self {
            accel_page_copy: true,
            avoid_remote_pmem_write: false,
            thp_migration: true,
            copy_threads: DEFAULT_COPY_THREADS,
        }
    }
}

impl Default for MigrateConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Live tunables table
#[derive(Debug)]
pub struct Tunables {
    accel_page_copy: AtomicBool,
    avoid_remote_pmem_write: AtomicBool,
    thp_migration: AtomicBool,
    copy_threads: AtomicUsize,
}

impl Tunables {
    pub const fn new() -> Self {
        let cfg = MigrateConfig::new();
        Self {
            accel_page_copy: AtomicBool::new(cfg.accel_page_copy),
            avoid_remote_pmem_write: AtomicBool::new(cfg.avoid_remote_pmem_write),
            thp_migration: AtomicBool::new(cfg.thp_migration),
            copy_threads: AtomicUsize::new(cfg.copy_threads),
        }
    }

    pub fn accel_page_copy(&self) -> bool {
        self.accel_page_copy.load(Ordering::Relaxed)
    }

    pub fn set_accel_page_copy(&self, on: bool) {
        self.accel_page_copy.store(on, Ordering::Relaxed);
    }

    pub fn avoid_remote_pmem_write(&self) -> bool {
        self.avoid_remote_pmem_write.load(Ordering::Relaxed)
    }

    pub fn set_avoid_remote_pmem_write(&self, on: bool) {
        self.avoid_remote_pmem_write.store(on, Ordering::Relaxed);
    }

    pub fn thp_migration(&self) -> bool {
        self.thp_migration.load(Ordering::Relaxed)
    }

    pub fn set_thp_migration(&self, on: bool) {
        self.thp_migration.store(on, Ordering::Relaxed);
    }

    pub fn copy_threads(&self) -> usize {
        self.copy_threads.load(Ordering::Relaxed)
    }

    /// Set the copy worker count, clamped to `1..=MAX_COPY_THREADS`
    pub fn set_copy_threads(&self, n: usize) {
        self.copy_threads
            .store(n.clamp(1, MAX_COPY_THREADS), Ordering::Relaxed);
    }

    /// Apply a whole snapshot
    pub fn apply(&self, cfg: &MigrateConfig) {
        self.set_accel_page_copy(cfg.accel_page_copy);
        self.set_avoid_remote_pmem_write(cfg.avoid_remote_pmem_write);
        self.set_thp_migration(cfg.thp_migration);
        self.set_copy_threads(cfg.copy_threads);
    }

    /// Read the current values back
    pub fn snapshot(&self) -> MigrateConfig {
        MigrateConfig {
            accel_page_copy: self.accel_page_copy(),
            avoid_remote_pmem_write: self.avoid_remote_pmem_write(),
            thp_migration: self.thp_migration(),
            copy_threads: self.copy_threads(),
        }
    }
}

impl Default for Tunables {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Global State
// ============================================================================

static TUNABLES: Tunables = Tunables::new();

/// The process-wide tunables
pub fn tunables() -> &'static Tunables {
    &TUNABLES
}

/// Serializes unit tests that flip the process-wide tunables (write)
/// against tests whose outcome depends on them (read)
#[cfg(test)]
pub(crate) static TUNABLES_TEST_LOCK: spin::RwLock<()> = spin::RwLock::new(());

/// Replace the process-wide tunables
pub fn configure(cfg: MigrateConfig) {
    log::debug!("migrate: configure {:?}", cfg);
    TUNABLES.apply(&cfg);
}

/// Current process-wide tunables
pub fn snapshot() -> MigrateConfig {
    TUNABLES.snapshot()
}

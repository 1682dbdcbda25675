//! VM event counters for migration
//!
//! Event counters bumped by the engines. They are cumulative, shared by
//! every caller in the process, and never reset by the engine itself.
//!
//! ## Counter Categories
//!
//! - **Migrate**: frames migrated and frames that failed
//! - **Huge**: transparent huge page migrations and splits
//! - **NUMA**: misplaced-frame migrations
//! - **Device**: device-memory session commits

use core::sync::atomic::{AtomicU64, Ordering};

// ============================================================================
// Counter Type
// ============================================================================

/// VM event counter (atomically updated)
#[derive(Debug)]
pub struct VmEventCounter {
    value: AtomicU64,
    name: &'static str,
}

impl VmEventCounter {
    /// Create a new counter
    pub const fn new(name: &'static str) -> Self {
        Self {
            value: AtomicU64::new(0),
            name,
        }
    }

    /// Increment counter by 1
    #[inline]
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment counter by n
    #[inline]
    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Get current value
    #[inline]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Get counter name
    pub fn name(&self) -> &'static str {
        self.name
    }
}

// ============================================================================
// Migrate Counters
// ============================================================================

/// Frames migrated successfully
pub static PGMIGRATE_SUCCESS: VmEventCounter = VmEventCounter::new("pgmigrate_success");
/// Frames that could not be migrated
pub static PGMIGRATE_FAIL: VmEventCounter = VmEventCounter::new("pgmigrate_fail");

// ============================================================================
// Huge Page Counters
// ============================================================================

/// Transparent huge pages migrated whole
pub static THP_MIGRATION_SUCCESS: VmEventCounter = VmEventCounter::new("thp_migration_success");
/// Transparent huge pages split after a failed destination allocation
pub static THP_MIGRATION_SPLIT: VmEventCounter = VmEventCounter::new("thp_migration_split");

// ============================================================================
// NUMA / Device Counters
// ============================================================================

/// Frames moved by misplaced-NUMA migration
pub static NUMA_PAGE_MIGRATE: VmEventCounter = VmEventCounter::new("numa_pages_migrated");
/// Device-memory session units committed to their destination
pub static PGMIGRATE_DEVICE: VmEventCounter = VmEventCounter::new("pgmigrate_device");

// ============================================================================
// Snapshot
// ============================================================================

/// All counter values at one point in time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub pgmigrate_success: u64,
    pub pgmigrate_fail: u64,
    pub thp_migration_success: u64,
    pub thp_migration_split: u64,
    pub numa_page_migrate: u64,
    pub pgmigrate_device: u64,
}

impl CounterSnapshot {
    /// Take a snapshot of all counters
    pub fn capture() -> Self {
        Self {
            pgmigrate_success: PGMIGRATE_SUCCESS.get(),
            pgmigrate_fail: PGMIGRATE_FAIL.get(),
            thp_migration_success: THP_MIGRATION_SUCCESS.get(),
            thp_migration_split: THP_MIGRATION_SPLIT.get(),
            numa_page_migrate: NUMA_PAGE_MIGRATE.get(),
            pgmigrate_device: PGMIGRATE_DEVICE.get(),
        }
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Account the outcome of one engine run
pub fn count_run(succeeded: usize, failed: usize) {
    if succeeded > 0 {
        PGMIGRATE_SUCCESS.add(succeeded as u64);
    }
    if failed > 0 {
        PGMIGRATE_FAIL.add(failed as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_basic() {
        let c = VmEventCounter::new("test");
        assert_eq!(c.get(), 0);
        c.inc();
        c.add(4);
        assert_eq!(c.get(), 5);
        assert_eq!(c.name(), "test");
    }

    #[test]
    fn test_count_run_is_monotonic() {
        let before = CounterSnapshot::capture();
        count_run(3, 2);
        let after = CounterSnapshot::capture();
        assert!(after.pgmigrate_success >= before.pgmigrate_success + 3);
        assert!(after.pgmigrate_fail >= before.pgmigrate_fail + 2);
    }
}

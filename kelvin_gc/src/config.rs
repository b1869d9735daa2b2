//! Heap configuration and collection statistics.

/// Default heap size: 64 Ki cells (256 KiB), a mid-range target device.
pub const DEFAULT_HEAP_CELLS: usize = 64 * 1024;

/// Permanent space grows downward in steps of this many cells (2 KiB).
pub const PERMANENT_GROWTH_CELLS: usize = 512;

/// Configuration for a [`crate::Heap`].
#[derive(Clone, Debug)]
pub struct Configuration {
    /// Total heap size in cells (collected space + permanent space).
    pub heap_cells: usize,
    /// Whether the collector may compact when a request cannot be
    /// satisfied from the swept free list.
    pub compaction_enabled: bool,
    /// Debug mode: run a full collection before every allocation.
    pub collect_on_every_allocation: bool,
    /// Debug mode: validate every header during sweep and fail fast on
    /// corruption.
    pub debug_sweep: bool,
}

impl Default for Configuration {
    fn default() -> Self {
        Configuration {
            heap_cells: DEFAULT_HEAP_CELLS,
            compaction_enabled: true,
            collect_on_every_allocation: false,
            debug_sweep: cfg!(debug_assertions),
        }
    }
}

impl Configuration {
    /// Builder-style heap size override.
    #[must_use]
    pub fn with_heap_cells(mut self, heap_cells: usize) -> Self {
        self.heap_cells = heap_cells;
        self
    }

    /// Builder-style compaction toggle.
    #[must_use]
    pub fn with_compaction(mut self, enabled: bool) -> Self {
        self.compaction_enabled = enabled;
        self
    }

    /// Builder-style allocate-stress toggle.
    #[must_use]
    pub fn with_collect_on_every_allocation(mut self, enabled: bool) -> Self {
        self.collect_on_every_allocation = enabled;
        self
    }
}

/// Counters accumulated across the life of a heap.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Statistics {
    /// Full collections run.
    pub collections: u64,
    /// Compaction phases run.
    pub compactions: u64,
    /// Total cells reclaimed by sweeps.
    pub cells_reclaimed: u64,
    /// Objects reclaimed by sweeps.
    pub objects_reclaimed: u64,
    /// Weak slots cleared.
    pub weak_slots_cleared: u64,
    /// Monitors dissolved after their contention ended.
    pub monitors_dissolved: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let configuration = Configuration::default()
            .with_heap_cells(1024)
            .with_compaction(false)
            .with_collect_on_every_allocation(true);
        assert_eq!(configuration.heap_cells, 1024);
        assert!(!configuration.compaction_enabled);
        assert!(configuration.collect_on_every_allocation);
    }
}

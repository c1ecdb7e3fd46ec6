//! # Reuse Pool
//!
//! Allocations parked between queue lifetimes. Destroying a queue stores
//! its command buffers here instead of freeing them, the next queue on the
//! device takes them back.

use alloc::vec::Vec;

use basalt_core::{AllocationHandle, AllocationType, ByteSize};

#[derive(Debug, Clone, Copy)]
struct PooledEntry {
    handle: AllocationHandle,
    kind: AllocationType,
    size: ByteSize,
}

/// Reuse pool statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReuseStats {
    /// Requests served from the pool
    pub hits: u64,
    /// Requests the pool could not serve
    pub misses: u64,
    /// Allocations stored
    pub stores: u64,
}

/// Pool of reusable allocations
#[derive(Debug, Default)]
pub struct ReusePool {
    entries: Vec<PooledEntry>,
    stats: ReuseStats,
}

impl ReusePool {
    /// Create an empty pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Park an allocation
    pub fn store(&mut self, handle: AllocationHandle, kind: AllocationType, size: ByteSize) {
        self.entries.push(PooledEntry { handle, kind, size });
        self.stats.stores += 1;
    }

    /// Take an allocation of `kind` holding at least `min_size` bytes
    ///
    /// Most recently stored entries are preferred.
    pub fn take(&mut self, min_size: ByteSize, kind: AllocationType) -> Option<AllocationHandle> {
        let position = self
            .entries
            .iter()
            .rposition(|entry| entry.kind == kind && entry.size >= min_size);

        match position {
            Some(index) => {
                self.stats.hits += 1;
                Some(self.entries.remove(index).handle)
            },
            None => {
                self.stats.misses += 1;
                None
            },
        }
    }

    /// Remove every entry, returning their handles
    pub fn drain(&mut self) -> Vec<AllocationHandle> {
        self.entries.drain(..).map(|entry| entry.handle).collect()
    }

    /// Whether `handle` is parked here
    pub fn contains(&self, handle: AllocationHandle) -> bool {
        self.entries.iter().any(|entry| entry.handle == handle)
    }

    /// Number of parked allocations
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the pool is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Statistics
    pub fn stats(&self) -> ReuseStats {
        self.stats
    }
}

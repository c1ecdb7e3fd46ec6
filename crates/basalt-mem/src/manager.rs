//! # Memory Manager
//!
//! Device-wide owner of the allocation arena and the reuse pool.
//!
//! Lock order: the unified-memory registry (when held by the caller) comes
//! before the arena; the arena and the reuse pool are never held together.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use basalt_core::{
    AllocationHandle, AllocationRequest, AllocationType, ByteSize, Error, MemoryBackend, Result,
};
use spin::Mutex;

use crate::allocation::GraphicsAllocation;
use crate::arena::AllocationArena;
use crate::reuse::{ReusePool, ReuseStats};

/// Device-wide memory manager
pub struct MemoryManager {
    root_device_index: u32,
    backend: Arc<dyn MemoryBackend>,
    arena: Mutex<AllocationArena>,
    reuse: Mutex<ReusePool>,
    indirect_as_pack: bool,
}

impl MemoryManager {
    /// Create a memory manager over an allocation backend
    pub fn new(root_device_index: u32, backend: Arc<dyn MemoryBackend>) -> Self {
        Self {
            root_device_index,
            backend,
            arena: Mutex::new(AllocationArena::new()),
            reuse: Mutex::new(ReusePool::new()),
            indirect_as_pack: false,
        }
    }

    /// Let indirect allocations be made resident as one pack
    pub fn with_indirect_pack(mut self, enabled: bool) -> Self {
        self.indirect_as_pack = enabled;
        self
    }

    /// Root device index
    pub fn root_device_index(&self) -> u32 {
        self.root_device_index
    }

    /// Whether indirect allocations may be made resident as one pack
    pub fn allow_indirect_allocations_as_pack(&self) -> bool {
        self.indirect_as_pack
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Allocate fresh graphics memory
    pub fn allocate_graphics_memory(&self, request: &AllocationRequest) -> Result<AllocationHandle> {
        let gpu_addr = self
            .backend
            .allocate(request)
            .ok_or(Error::OutOfDeviceMemory)?;

        let allocation = GraphicsAllocation::new(
            request.kind,
            gpu_addr,
            request.size,
            request.root_device_index,
            request.cpu_visible,
        );
        let handle = self.arena.lock().insert(allocation);

        log::trace!(
            "allocated {:?} {} at {} as {:?}",
            request.kind,
            request.size,
            gpu_addr,
            handle
        );
        Ok(handle)
    }

    /// Release graphics memory back to the backend
    pub fn free_graphics_memory(&self, handle: AllocationHandle) -> Result<()> {
        let allocation = self.arena.lock().remove(handle)?;
        self.backend.free(allocation.gpu_addr(), allocation.size());
        Ok(())
    }

    // =========================================================================
    // Reuse pool
    // =========================================================================

    /// Take a parked allocation of `kind` holding at least `min_size` bytes
    pub fn obtain_reusable_allocation(
        &self,
        min_size: ByteSize,
        kind: AllocationType,
    ) -> Option<AllocationHandle> {
        let handle = self.reuse.lock().take(min_size, kind);
        match handle {
            Some(handle) => log::debug!("reusing {:?} for {:?} ({})", handle, kind, min_size),
            None => log::debug!("no reusable {:?} of {}", kind, min_size),
        }
        handle
    }

    /// Park an allocation for later reuse
    pub fn store_reusable_allocation(&self, handle: AllocationHandle) -> Result<()> {
        let (kind, size) = {
            let arena = self.arena.lock();
            let allocation = arena.get(handle)?;
            (allocation.kind(), allocation.size())
        };
        self.reuse.lock().store(handle, kind, size);
        Ok(())
    }

    /// Free every parked allocation
    pub fn release_reuse_pool(&self) {
        let handles = self.reuse.lock().drain();
        for handle in handles {
            if let Err(err) = self.free_graphics_memory(handle) {
                log::warn!("pooled allocation {:?} already gone: {}", handle, err);
            }
        }
    }

    /// Reuse pool statistics
    pub fn reuse_stats(&self) -> ReuseStats {
        self.reuse.lock().stats()
    }

    /// Number of parked allocations
    pub fn reuse_pool_len(&self) -> usize {
        self.reuse.lock().len()
    }

    // =========================================================================
    // Access
    // =========================================================================

    /// Run `f` on an allocation
    pub fn with_allocation<R>(
        &self,
        handle: AllocationHandle,
        f: impl FnOnce(&GraphicsAllocation) -> R,
    ) -> Result<R> {
        let arena = self.arena.lock();
        arena.get(handle).map(f)
    }

    /// Run `f` on an allocation mutably
    pub fn with_allocation_mut<R>(
        &self,
        handle: AllocationHandle,
        f: impl FnOnce(&mut GraphicsAllocation) -> R,
    ) -> Result<R> {
        let mut arena = self.arena.lock();
        arena.get_mut(handle).map(f)
    }

    /// Whether `handle` refers to a live allocation
    pub fn is_live(&self, handle: AllocationHandle) -> bool {
        self.arena.lock().contains(handle)
    }

    /// Number of live allocations, pooled ones included
    pub fn live_allocations(&self) -> usize {
        self.arena.lock().len()
    }

    /// Handles of live allocations of `kind`
    pub fn allocations_of_kind(&self, kind: AllocationType) -> Vec<AllocationHandle> {
        self.arena
            .lock()
            .iter()
            .filter(|(_, allocation)| allocation.kind() == kind)
            .map(|(handle, _)| handle)
            .collect()
    }
}

impl fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryManager")
            .field("root_device_index", &self.root_device_index)
            .field("live", &self.live_allocations())
            .field("pooled", &self.reuse_pool_len())
            .field("indirect_as_pack", &self.indirect_as_pack)
            .finish()
    }
}

//! # Unified Memory Registry
//!
//! Tracks host, device and shared allocations that kernels can reach
//! through raw pointers ("indirect" allocations). A submission must make
//! them resident because nothing in the command stream names them.
//!
//! The registry is guarded by an ownership lock. Allocation and free take
//! it briefly; residency-list construction holds it until the submission
//! that relies on the list has been issued.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::fmt;

use basalt_core::{
    AllocationHandle, AllocationType, ByteSize, CommandBackend, ContextId, GpuAddr, Result,
    TaskCount,
};
use hashbrown::HashMap;
use spin::{Mutex, MutexGuard};

use crate::allocation::GraphicsAllocation;
use crate::manager::MemoryManager;

// =============================================================================
// MEMORY KINDS
// =============================================================================

bitflags::bitflags! {
    /// Unified memory kinds
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct UnifiedMemoryKinds: u32 {
        /// Host allocation visible to the device
        const HOST = 1 << 0;
        /// Device allocation
        const DEVICE = 1 << 1;
        /// Shared allocation migrating between domains
        const SHARED = 1 << 2;
    }
}

/// Which indirect allocation kinds a submission may touch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UnifiedMemoryControls {
    /// Kernels may dereference host allocations
    pub indirect_host_allowed: bool,
    /// Kernels may dereference device allocations
    pub indirect_device_allowed: bool,
    /// Kernels may dereference shared allocations
    pub indirect_shared_allowed: bool,
}

impl UnifiedMemoryControls {
    /// All indirect kinds allowed
    pub const fn all() -> Self {
        Self {
            indirect_host_allowed: true,
            indirect_device_allowed: true,
            indirect_shared_allowed: true,
        }
    }

    /// Capability mask filtering the registry
    pub fn generate_mask(&self) -> UnifiedMemoryKinds {
        let mut mask = UnifiedMemoryKinds::empty();
        mask.set(UnifiedMemoryKinds::HOST, self.indirect_host_allowed);
        mask.set(UnifiedMemoryKinds::DEVICE, self.indirect_device_allowed);
        mask.set(UnifiedMemoryKinds::SHARED, self.indirect_shared_allowed);
        mask
    }
}

// =============================================================================
// REGISTRY ENTRY
// =============================================================================

/// A registered unified-memory allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SvmEntry {
    /// Backing graphics allocation
    pub allocation: AllocationHandle,
    /// GPU address the pointer maps to
    pub gpu_addr: GpuAddr,
    /// Size in bytes
    pub size: ByteSize,
    /// Memory kind, exactly one bit
    pub memory_kind: UnifiedMemoryKinds,
    /// Backing allocation kind
    pub allocation_kind: AllocationType,
}

impl SvmEntry {
    /// Whether `addr` falls inside this entry
    pub fn contains(&self, addr: GpuAddr) -> bool {
        addr >= self.gpu_addr && addr.raw() - self.gpu_addr.raw() < self.size.as_bytes()
    }
}

// =============================================================================
// REGISTRY
// =============================================================================

/// Registry state behind the ownership lock
#[derive(Debug, Default)]
pub struct SvmMap {
    by_addr: BTreeMap<GpuAddr, SvmEntry>,
    /// Bumped on every register
    allocations_counter: u64,
    /// Per context: counter value at the last pack residency pass
    packed_at: HashMap<ContextId, u64>,
}

/// Ownership of the registry, held while a residency list is in use
pub type RegistryGuard<'a> = MutexGuard<'a, SvmMap>;

impl SvmMap {
    /// Append allocations matching `mask` to `residency`
    pub fn add_internal_allocations_to_residency(
        &self,
        mask: UnifiedMemoryKinds,
        residency: &mut Vec<SvmEntry>,
    ) {
        residency.extend(
            self.by_addr
                .values()
                .filter(|entry| mask.intersects(entry.memory_kind))
                .copied(),
        );
    }

    /// Entry containing `addr`
    pub fn lookup(&self, addr: GpuAddr) -> Option<&SvmEntry> {
        self.by_addr
            .range(..=addr)
            .next_back()
            .map(|(_, entry)| entry)
            .filter(|entry| entry.contains(addr))
    }

    /// Number of registered allocations
    pub fn len(&self) -> usize {
        self.by_addr.len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.by_addr.is_empty()
    }
}

/// Device-wide unified memory registry
#[derive(Default)]
pub struct UnifiedMemoryRegistry {
    inner: Mutex<SvmMap>,
}

impl UnifiedMemoryRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an allocation
    pub fn register(&self, entry: SvmEntry) {
        let mut map = self.inner.lock();
        map.allocations_counter += 1;
        map.by_addr.insert(entry.gpu_addr, entry);
    }

    /// Unregister the allocation starting at `gpu_addr`
    pub fn unregister(&self, gpu_addr: GpuAddr) -> Option<SvmEntry> {
        self.inner.lock().by_addr.remove(&gpu_addr)
    }

    /// Entry containing `addr`
    pub fn lookup(&self, addr: GpuAddr) -> Option<SvmEntry> {
        self.inner.lock().lookup(addr).copied()
    }

    /// Number of registered allocations
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Take exclusive ownership of the registry
    ///
    /// Blocks concurrent register/unregister until the guard is dropped.
    pub fn obtain_ownership(&self) -> RegistryGuard<'_> {
        self.inner.lock()
    }

    /// Bulk residency for backends supporting pack mode
    ///
    /// The first pass on a context, and any pass after new registrations,
    /// makes every registered allocation resident for the context's
    /// lifetime. Otherwise nothing needs to be done. Returns the number of
    /// allocations made resident.
    pub fn make_indirect_allocations_resident(
        &self,
        backend: &dyn CommandBackend,
        memory: &MemoryManager,
        task_count: TaskCount,
    ) -> Result<usize> {
        let mut map = self.inner.lock();
        let context = backend.context_id();
        let counter = map.allocations_counter;

        if map.packed_at.get(&context) == Some(&counter) {
            return Ok(0);
        }

        let mut made_resident = 0;
        for entry in map.by_addr.values() {
            memory.with_allocation_mut(entry.allocation, |allocation| {
                allocation
                    .update_residency_task_count(GraphicsAllocation::ALWAYS_RESIDENT, context);
            })?;
            backend.make_resident(entry.allocation);
            made_resident += 1;
        }
        map.packed_at.insert(context, counter);

        log::trace!(
            "{:?}: {} indirect allocations resident as pack for task {}",
            context,
            made_resident,
            task_count
        );
        Ok(made_resident)
    }
}

impl fmt::Debug for UnifiedMemoryRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnifiedMemoryRegistry")
            .field("registered", &self.len())
            .finish()
    }
}

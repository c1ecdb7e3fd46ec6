//! # Indirect Allocation Residency
//!
//! Kernels may dereference unified-memory pointers that no command names.
//! Before such a submission every reachable allocation has to be resident
//! on the submitting context.
//!
//! - **Pack mode**: the backend keeps all registered allocations resident
//!   for the context's lifetime. One bulk pass per registry change.
//! - **Explicit mode**: the registry is locked, filtered by the submission's
//!   capability mask and every match is made resident, optionally migrating
//!   its pages to the GPU. The lock is held until the submission has been
//!   issued, so no allocation in the list can be freed underneath it.

use alloc::vec::Vec;

use basalt_core::{CommandBackend, QueueConfig, Result};
use basalt_mem::{RegistryGuard, SvmEntry, UnifiedMemoryControls};

use crate::device::Device;

/// Outcome of the residency pass, kept alive until the submission is issued
pub enum IndirectResidency<'a> {
    /// Handled in bulk; nothing to hold
    Packed,
    /// Registry ownership plus the allocations made resident
    Explicit {
        /// Registry lock
        guard: RegistryGuard<'a>,
        /// Entries made resident
        entries: Vec<SvmEntry>,
    },
}

impl IndirectResidency<'_> {
    /// Whether pack mode was used
    pub fn is_packed(&self) -> bool {
        matches!(self, IndirectResidency::Packed)
    }

    /// Entries made resident explicitly
    pub fn entries(&self) -> &[SvmEntry] {
        match self {
            IndirectResidency::Packed => &[],
            IndirectResidency::Explicit { entries, .. } => entries,
        }
    }
}

impl core::fmt::Debug for IndirectResidency<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            IndirectResidency::Packed => f.write_str("Packed"),
            IndirectResidency::Explicit { entries, .. } => f
                .debug_struct("Explicit")
                .field("entries", &entries.len())
                .finish(),
        }
    }
}

/// Make the indirect allocations of `device` resident on `backend`
///
/// The configured pack override wins over the memory manager's capability.
pub fn handle_indirect_allocation_residency<'a>(
    device: &'a Device,
    backend: &dyn CommandBackend,
    config: &QueueConfig,
    controls: UnifiedMemoryControls,
    perform_migration: bool,
) -> Result<IndirectResidency<'a>> {
    let as_pack = config
        .indirect_allocations_as_pack
        .unwrap_or_else(|| device.memory().allow_indirect_allocations_as_pack());

    if as_pack {
        let pending = backend.peek_task_count() + 1;
        device
            .svm()
            .make_indirect_allocations_resident(backend, device.memory(), pending)?;
        return Ok(IndirectResidency::Packed);
    }

    let guard = device.svm().obtain_ownership();
    let mut entries = Vec::new();
    guard.add_internal_allocations_to_residency(controls.generate_mask(), &mut entries);
    make_resident_and_migrate(device, backend, perform_migration, &entries);

    Ok(IndirectResidency::Explicit { guard, entries })
}

/// Make each entry resident, migrating migratable ones when asked
///
/// Migration needs a page-fault manager on the device; without one it is
/// skipped and the allocation faults in later.
pub fn make_resident_and_migrate(
    device: &Device,
    backend: &dyn CommandBackend,
    perform_migration: bool,
    entries: &[SvmEntry],
) {
    let page_faults = if perform_migration {
        device.page_fault_manager()
    } else {
        None
    };

    for entry in entries {
        backend.make_resident(entry.allocation);
        if let Some(page_faults) = page_faults {
            if entry.allocation_kind.is_migratable() {
                page_faults.move_allocation_to_gpu_domain(entry.gpu_addr);
            }
        }
    }
}

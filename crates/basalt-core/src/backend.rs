//! # Backend Traits
//!
//! Seams to the collaborators that sit outside the queue core.
//!
//! ## Trait Map
//!
//! ```text
//! CommandBackend      execution context on the kernel driver
//!    │                (task counts, submit, kernel waits, residency set)
//! MemoryBackend       graphics memory allocation primitive
//! PageFaultManager    shared-allocation page migration
//! KernelDiagnostics   per-submission printf / assert payload
//! TrapHandler         fatal abort on an in-kernel assertion
//! DebuggerHooks       optional debugger notifications
//! ```
//!
//! Backends use interior mutability: one backend context can be shared by
//! several queues, and the GPU advances it concurrently.

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use crate::batch::BatchBuffer;
use crate::error::Result;
use crate::status::{QueueThrottle, SubmissionStatus, WaitStatus};
use crate::types::*;

// =============================================================================
// COMMAND BACKEND
// =============================================================================

/// Execution context on the kernel-mode driver
pub trait CommandBackend: Send + Sync {
    /// Context identifier, keys per-context task-count watermarks
    fn context_id(&self) -> ContextId;

    /// Sub-devices the context spans
    fn device_bitfield(&self) -> DeviceBitfield;

    /// Task count of the latest issued submission
    fn peek_task_count(&self) -> TaskCount;

    /// Task count the GPU has reported as completed
    fn completed_task_count(&self) -> TaskCount;

    /// Query the kernel driver for a device-lost condition
    fn is_gpu_hang_detected(&self) -> bool;

    /// Add an allocation to the residency set of the next submission
    fn make_resident(&self, allocation: AllocationHandle);

    /// Current residency set
    fn residency_allocations(&self) -> Vec<AllocationHandle>;

    /// Submit a batch buffer with its residency set
    ///
    /// On success the backend advances its task count by one.
    fn submit_batch_buffer(
        &self,
        batch: &BatchBuffer,
        residency: &[AllocationHandle],
    ) -> SubmissionStatus;

    /// Flush stamp of the latest submission
    fn obtain_current_flush_stamp(&self) -> FlushStamp;

    /// Kernel-assisted wait on a flush stamp
    ///
    /// Only called when the backend advertises `BackendCaps::KMD_NOTIFY`.
    fn wait_for_flush_stamp(&self, flush_stamp: FlushStamp, throttle: QueueThrottle) -> WaitStatus;

    /// Set the partition count used by following submissions
    fn set_active_partitions(&self, count: u32);

    /// Partition count used by submissions
    fn active_partitions(&self) -> u32;

    /// Register a client queue
    fn register_client(&self);

    /// Unregister a client queue
    fn unregister_client(&self);

    /// Number of registered client queues
    fn num_clients(&self) -> u32;

    /// Power hint the context was created with
    fn power_hint(&self) -> u32 {
        0
    }

    /// Change the power hint; takes effect on the next context re-init
    fn set_power_hint(&self, _hint: u32) {}

    /// Recreate the OS context with the current power hint
    fn reinitialize_context(&self) -> Result<()> {
        Ok(())
    }

    /// Allocate backend-side resources (tag buffers, preemption surfaces)
    fn initialize_resources(&self) -> Result<()> {
        Ok(())
    }

    /// Start ring-based direct submission when supported
    fn init_direct_submission(&self) -> Result<()> {
        Ok(())
    }

    /// Monotonic time in nanoseconds
    fn time_ns(&self) -> u64;

    /// Back off between two completion queries
    fn pause(&self) {
        core::hint::spin_loop();
    }
}

// =============================================================================
// MEMORY BACKEND
// =============================================================================

/// Graphics memory allocation request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationRequest {
    /// Root device owning the memory
    pub root_device_index: u32,
    /// Size, already rounded to the allocation granularity
    pub size: ByteSize,
    /// Required alignment
    pub alignment: u64,
    /// Allocation kind
    pub kind: AllocationType,
    /// Usable from contexts on several sub-devices
    pub multi_os_context_capable: bool,
    /// Sub-devices the memory must be visible to
    pub device_bitfield: DeviceBitfield,
    /// Needs a CPU mapping
    pub cpu_visible: bool,
}

/// Graphics memory allocation primitive of the OS interface
pub trait MemoryBackend: Send + Sync {
    /// Allocate memory, returning its GPU virtual address
    fn allocate(&self, request: &AllocationRequest) -> Option<GpuAddr>;

    /// Release memory obtained from [`MemoryBackend::allocate`]
    fn free(&self, gpu_addr: GpuAddr, size: ByteSize);
}

// =============================================================================
// PAGE FAULT MANAGER
// =============================================================================

/// Migrates shared allocations between host and device memory domains
pub trait PageFaultManager: Send + Sync {
    /// Move the pages backing `gpu_addr` to the GPU domain
    fn move_allocation_to_gpu_domain(&self, gpu_addr: GpuAddr);
}

// =============================================================================
// DIAGNOSTICS
// =============================================================================

/// Assertion raised by a kernel on the GPU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssertTrap {
    /// Kernel that trapped
    pub kernel: String,
    /// Assertion text read back from the assert buffer
    pub message: String,
}

impl fmt::Display for AssertTrap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "assertion in kernel `{}`: {}", self.kernel, self.message)
    }
}

/// Diagnostic payload attached to a submission
///
/// Processed after the submission is known to be complete (or the device
/// is lost).
pub trait KernelDiagnostics: Send + Sync {
    /// Flush buffered printf output
    fn flush_printf(&self, hang_detected: bool);

    /// Read back an assertion trap, if the kernel raised one
    fn take_assert_trap(&self) -> Option<AssertTrap> {
        None
    }
}

/// Terminates the process on an in-kernel assertion
pub trait TrapHandler: Send + Sync {
    /// Report the trap and never return
    fn abort(&self, trap: &AssertTrap) -> !;
}

// =============================================================================
// DEBUGGER
// =============================================================================

/// Debugger notifications
pub trait DebuggerHooks: Send + Sync {
    /// A queue was created on the root device
    fn notify_queue_created(&self, root_device_index: u32);

    /// A queue was destroyed on the root device
    fn notify_queue_destroyed(&self, root_device_index: u32);

    /// Print addresses tracked for a context
    fn print_tracked_addresses(&self, context: ContextId);
}

//! # Graphics Allocation
//!
//! A GPU-resident memory region with per-context usage watermarks.

use alloc::vec;
use alloc::vec::Vec;

use basalt_core::{AllocationType, ByteSize, ContextId, Error, GpuAddr, Result, TaskCount};
use hashbrown::HashMap;

// =============================================================================
// GRAPHICS ALLOCATION
// =============================================================================

/// Watermarks of one context, captured before a speculative update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UsageSnapshot {
    /// Last-use task count
    pub task_count: Option<TaskCount>,
    /// Residency task count
    pub residency_task_count: Option<TaskCount>,
}

/// A graphics allocation owned by the device arena
///
/// Two watermarks are kept per execution context:
/// - the task count of the last submission that used the allocation
/// - the task count until which the allocation must stay resident
#[derive(Debug)]
pub struct GraphicsAllocation {
    kind: AllocationType,
    gpu_addr: GpuAddr,
    size: ByteSize,
    root_device_index: u32,
    /// CPU mapping, empty when the allocation is not CPU visible
    storage: Vec<u8>,
    task_counts: HashMap<ContextId, TaskCount>,
    residency_task_counts: HashMap<ContextId, TaskCount>,
}

impl GraphicsAllocation {
    /// Residency watermark of allocations kept resident for a context's
    /// whole lifetime
    pub const ALWAYS_RESIDENT: TaskCount = TaskCount::MAX - 1;

    /// Create an allocation record
    pub fn new(
        kind: AllocationType,
        gpu_addr: GpuAddr,
        size: ByteSize,
        root_device_index: u32,
        cpu_visible: bool,
    ) -> Self {
        let storage = if cpu_visible {
            vec![0u8; size.as_usize()]
        } else {
            Vec::new()
        };

        Self {
            kind,
            gpu_addr,
            size,
            root_device_index,
            storage,
            task_counts: HashMap::new(),
            residency_task_counts: HashMap::new(),
        }
    }

    /// Allocation kind
    pub fn kind(&self) -> AllocationType {
        self.kind
    }

    /// GPU virtual address
    pub fn gpu_addr(&self) -> GpuAddr {
        self.gpu_addr
    }

    /// Size in bytes
    pub fn size(&self) -> ByteSize {
        self.size
    }

    /// Root device the memory belongs to
    pub fn root_device_index(&self) -> u32 {
        self.root_device_index
    }

    /// CPU view of the memory
    pub fn underlying_buffer(&self) -> &[u8] {
        &self.storage
    }

    /// Copy bytes into the CPU view
    pub fn write(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        let end = offset
            .checked_add(bytes.len())
            .ok_or(Error::InvalidParameter)?;
        let dst = self
            .storage
            .get_mut(offset..end)
            .ok_or(Error::InvalidParameter)?;
        dst.copy_from_slice(bytes);
        Ok(())
    }

    /// Record the last submission using this allocation on `context`
    pub fn update_task_count(&mut self, task_count: TaskCount, context: ContextId) {
        self.task_counts.insert(context, task_count);
    }

    /// Last submission using this allocation on `context`
    pub fn task_count(&self, context: ContextId) -> Option<TaskCount> {
        self.task_counts.get(&context).copied()
    }

    /// Record the task count until which the allocation stays resident
    pub fn update_residency_task_count(&mut self, task_count: TaskCount, context: ContextId) {
        self.residency_task_counts.insert(context, task_count);
    }

    /// Residency watermark on `context`
    pub fn residency_task_count(&self, context: ContextId) -> Option<TaskCount> {
        self.residency_task_counts.get(&context).copied()
    }

    /// Whether any context recorded a use
    pub fn is_used(&self) -> bool {
        !self.task_counts.is_empty()
    }

    /// Whether `context` recorded a use
    pub fn is_used_by_context(&self, context: ContextId) -> bool {
        self.task_counts.contains_key(&context)
    }

    /// Whether `context` may still be executing work that touches this
    /// allocation
    pub fn is_busy(&self, context: ContextId, completed: TaskCount) -> bool {
        self.task_count(context).is_some_and(|used| used > completed)
    }

    /// Both watermarks on `context`, for a later [`Self::restore_usage`]
    pub fn snapshot_usage(&self, context: ContextId) -> UsageSnapshot {
        UsageSnapshot {
            task_count: self.task_count(context),
            residency_task_count: self.residency_task_count(context),
        }
    }

    /// Put both watermarks on `context` back to a snapshot
    pub fn restore_usage(&mut self, context: ContextId, snapshot: UsageSnapshot) {
        match snapshot.task_count {
            Some(task_count) => self.update_task_count(task_count, context),
            None => {
                self.task_counts.remove(&context);
            },
        }
        match snapshot.residency_task_count {
            Some(task_count) => self.update_residency_task_count(task_count, context),
            None => {
                self.residency_task_counts.remove(&context);
            },
        }
    }

    /// Forget the usage recorded for `context`
    pub fn release_usage_in_context(&mut self, context: ContextId) {
        self.task_counts.remove(&context);
        self.residency_task_counts.remove(&context);
    }
}

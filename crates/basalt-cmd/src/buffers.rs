//! # Command Buffer Manager
//!
//! Two command buffers per queue. The host encodes into one while the GPU
//! may still execute the other.
//!
//! ```text
//!          encode                        GPU executes
//!            │                               │
//!   ┌────────▼─────────┐           ┌─────────▼────────┐
//!   │  slot (active)   │  switch   │  slot (inactive) │
//!   │  flush id (t, s) │◀─────────▶│  flush id (t, s) │
//!   └──────────────────┘           └──────────────────┘
//! ```
//!
//! Every submission records its (task count, flush stamp) on the active
//! slot. Switching back to a slot first waits for the work recorded there,
//! so a buffer is never overwritten while the GPU may still read it.

use basalt_core::{
    AllocationHandle, AllocationType, ByteSize, CommandBackend, Error, FlushStamp, QueueThrottle,
    Result, TaskCount, WaitStatus,
};

use crate::completion::{wait_for_task_count_with_kmd_notify_fallback, WaitPolicy};
use crate::device::Device;

// =============================================================================
// BUFFER SLOT
// =============================================================================

/// One of the two command buffer slots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferSlot {
    /// First slot, active after initialization
    First,
    /// Second slot
    Second,
}

impl BufferSlot {
    /// The other slot
    pub const fn other(self) -> Self {
        match self {
            BufferSlot::First => BufferSlot::Second,
            BufferSlot::Second => BufferSlot::First,
        }
    }

    const fn index(self) -> usize {
        match self {
            BufferSlot::First => 0,
            BufferSlot::Second => 1,
        }
    }
}

// =============================================================================
// MANAGER
// =============================================================================

/// Flush id of a slot: task count and flush stamp of its last submission
type FlushId = (TaskCount, FlushStamp);

/// Double-buffered command buffers of a queue
#[derive(Debug)]
pub struct CommandBufferManager {
    buffers: [Option<AllocationHandle>; 2],
    flush_ids: [FlushId; 2],
    active: BufferSlot,
    switches: u64,
}

impl Default for CommandBufferManager {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandBufferManager {
    /// Create an empty manager
    pub const fn new() -> Self {
        Self {
            buffers: [None; 2],
            flush_ids: [(0, 0); 2],
            active: BufferSlot::First,
            switches: 0,
        }
    }

    /// Acquire both buffers, reusing pooled ones when possible
    ///
    /// The size is rounded up to 64 KiB. On failure the buffers acquired so
    /// far stay attached so that [`Self::destroy`] returns them to the pool.
    pub fn initialize(&mut self, device: &Device, size_requested: ByteSize) -> Result<()> {
        let size = size_requested.align_up(ByteSize::KIB_64.as_bytes());

        for slot in self.buffers.iter_mut() {
            let reused = device
                .memory()
                .obtain_reusable_allocation(size, AllocationType::CommandBuffer);
            let handle = match reused {
                Some(handle) => handle,
                None => match device.allocate_command_buffer(size) {
                    Ok(handle) => handle,
                    Err(err) => {
                        log::warn!("command buffer allocation of {} failed: {}", size, err);
                        return Err(Error::OutOfDeviceMemory);
                    },
                },
            };
            *slot = Some(handle);
        }

        self.flush_ids = [(0, 0); 2];
        self.active = BufferSlot::First;
        log::debug!("command buffers {:?} of {}", self.buffers, size);
        Ok(())
    }

    /// Buffer of the active slot
    pub fn current_buffer_allocation(&self) -> Result<AllocationHandle> {
        self.buffers[self.active.index()].ok_or(Error::Uninitialized)
    }

    /// Buffer held by `slot`
    pub fn buffer(&self, slot: BufferSlot) -> Option<AllocationHandle> {
        self.buffers[slot.index()]
    }

    /// Active slot
    pub fn active_slot(&self) -> BufferSlot {
        self.active
    }

    /// Number of switches since creation
    pub fn switch_count(&self) -> u64 {
        self.switches
    }

    /// Make the other slot active, waiting for the work last flushed from it
    ///
    /// A slot that was never flushed (stamp zero) is taken without waiting.
    pub fn switch_buffers(&mut self, backend: &dyn CommandBackend, policy: &WaitPolicy) -> WaitStatus {
        self.active = self.active.other();
        self.switches += 1;

        let (task_count, flush_stamp) = self.flush_ids[self.active.index()];
        log::debug!(
            "{:?}: switched to {:?} (flush id {}, {})",
            backend.context_id(),
            self.active,
            task_count,
            flush_stamp
        );

        if flush_stamp == 0 {
            return WaitStatus::Ready;
        }
        wait_for_task_count_with_kmd_notify_fallback(
            backend,
            policy,
            task_count,
            flush_stamp,
            QueueThrottle::Medium,
        )
    }

    /// Record the latest submission on the active slot
    pub fn set_current_flush_stamp(&mut self, task_count: TaskCount, flush_stamp: FlushStamp) {
        self.flush_ids[self.active.index()] = (task_count, flush_stamp);
    }

    /// Record a submission on whichever slot holds `allocation`
    ///
    /// Returns whether a slot matched.
    pub fn set_flush_stamp_for(
        &mut self,
        allocation: AllocationHandle,
        task_count: TaskCount,
        flush_stamp: FlushStamp,
    ) -> bool {
        let slot = self
            .buffers
            .iter()
            .position(|buffer| *buffer == Some(allocation));
        match slot {
            Some(index) => {
                self.flush_ids[index] = (task_count, flush_stamp);
                true
            },
            None => false,
        }
    }

    /// Flush id of the active slot
    pub fn current_flush_stamp(&self) -> (TaskCount, FlushStamp) {
        self.flush_ids[self.active.index()]
    }

    /// Flush id recorded on `slot`
    pub fn flush_id(&self, slot: BufferSlot) -> (TaskCount, FlushStamp) {
        self.flush_ids[slot.index()]
    }

    /// Return both buffers to the device reuse pool
    pub fn destroy(&mut self, device: &Device) {
        for slot in self.buffers.iter_mut() {
            if let Some(handle) = slot.take() {
                if let Err(err) = device.memory().store_reusable_allocation(handle) {
                    log::warn!("command buffer {:?} not pooled: {}", handle, err);
                }
            }
        }
        self.flush_ids = [(0, 0); 2];
    }
}

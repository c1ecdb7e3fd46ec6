//! # Linear Stream
//!
//! Append-only cursor over the active command buffer. The stream does not
//! own its memory: it views an allocation held by the buffer manager and is
//! re-pointed on every buffer switch.

use basalt_core::{AllocationHandle, Error, GpuAddr, Result};

/// Append-only view over a command buffer
#[derive(Debug, Clone, Default)]
pub struct LinearStream {
    allocation: Option<AllocationHandle>,
    gpu_base: GpuAddr,
    capacity: usize,
    used: usize,
}

impl LinearStream {
    /// Create a stream bound to nothing
    pub const fn new() -> Self {
        Self {
            allocation: None,
            gpu_base: GpuAddr::null(),
            capacity: 0,
            used: 0,
        }
    }

    /// Re-point the stream at a new buffer, resetting the cursor
    ///
    /// `capacity` excludes the tail the encoder keeps for the batch end.
    pub fn replace_buffer(&mut self, allocation: AllocationHandle, gpu_base: GpuAddr, capacity: usize) {
        self.allocation = Some(allocation);
        self.gpu_base = gpu_base;
        self.capacity = capacity;
        self.used = 0;
    }

    /// Detach from the current buffer
    pub fn clear(&mut self) {
        *self = Self::new();
    }

    /// Buffer currently written to
    pub fn graphics_allocation(&self) -> Option<AllocationHandle> {
        self.allocation
    }

    /// GPU address of the buffer start
    pub fn gpu_base(&self) -> GpuAddr {
        self.gpu_base
    }

    /// GPU address of the next byte to be written
    pub fn current_gpu_address(&self) -> GpuAddr {
        self.gpu_base.offset(self.used as u64)
    }

    /// Bytes written since the last replace
    pub fn used(&self) -> usize {
        self.used
    }

    /// Usable size of the buffer
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes left before the tail reserve
    pub fn available_space(&self) -> usize {
        self.capacity - self.used
    }

    /// Claim `size` bytes, returning their offset
    pub fn get_space(&mut self, size: usize) -> Result<usize> {
        if self.allocation.is_none() {
            return Err(Error::Uninitialized);
        }
        if size > self.available_space() {
            return Err(Error::InvalidParameter);
        }
        let offset = self.used;
        self.used += size;
        Ok(offset)
    }
}

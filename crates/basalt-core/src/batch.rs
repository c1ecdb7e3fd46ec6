//! # Batch Buffer
//!
//! Ephemeral descriptor of a command range handed to the backend. Built per
//! submission, never stored.

use crate::status::QueueThrottle;
use crate::types::AllocationHandle;

/// Descriptor of a submitted command range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchBuffer {
    /// Command buffer holding the first command
    pub allocation: AllocationHandle,
    /// Byte offset of the first new command inside `allocation`
    pub start_offset: usize,
    /// Bytes used in the starting stream when the batch was built
    pub used_size: usize,
    /// End of the submitted range, for backends that need it
    pub end_offset: Option<usize>,
    /// Scheduling throttle
    pub throttle: QueueThrottle,
    /// Partitions the batch executes on
    pub partition_count: u32,
    /// Backend clients registered when the batch was built
    pub num_clients: u32,
    /// Cooperative dispatch (all work groups resident at once)
    pub cooperative: bool,
}

impl BatchBuffer {
    /// Bytes between the start offset and the end of the range
    pub fn submitted_bytes(&self) -> usize {
        self.end_offset
            .unwrap_or(self.used_size)
            .saturating_sub(self.start_offset)
    }
}

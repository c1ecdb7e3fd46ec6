//! # Queue Configuration
//!
//! Immutable knobs handed to a queue when it is created. Nothing here is
//! read from global state; two queues on the same device can run with
//! different configurations.

use crate::types::ByteSize;

// =============================================================================
// QUEUE MODE
// =============================================================================

/// Queue execution mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueMode {
    /// Implementation-defined, asynchronous in practice
    #[default]
    Default,
    /// Every execution waits for completion before returning
    Synchronous,
    /// Execution returns as soon as the batch is submitted
    Asynchronous,
}

/// Queue scheduling priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum QueuePriority {
    /// Background
    Low,
    /// Normal
    #[default]
    Normal,
    /// High
    High,
}

// =============================================================================
// QUEUE DESCRIPTOR
// =============================================================================

/// Per-queue creation parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueDesc {
    /// Engine group ordinal
    pub ordinal: u32,
    /// Queue index inside the engine group
    pub index: u32,
    /// Execution mode
    pub mode: QueueMode,
    /// Scheduling priority
    pub priority: QueuePriority,
}

// =============================================================================
// QUEUE CONFIG
// =============================================================================

/// Queue configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    /// Bytes the linear stream may use in one command buffer
    pub queue_cmd_buffer_size: ByteSize,
    /// Bytes allocated behind the stream (cache line + prefetch overfetch)
    pub cmd_buffer_tail_reserve: ByteSize,
    /// Overrides the descriptor's execution mode
    pub mode_override: Option<QueueMode>,
    /// Use the kernel-assisted wait for unbounded synchronize
    pub use_kmd_wait: Option<bool>,
    /// Overrides the memory manager's pack-residency capability
    pub indirect_allocations_as_pack: Option<bool>,
    /// Interval between device-lost queries while polling
    pub gpu_hang_check_period_us: u64,
    /// Ask debugger hooks to print tracked addresses after synchronize
    pub log_tracked_addresses: bool,
}

impl QueueConfig {
    /// Default stream size
    pub const DEFAULT_QUEUE_CMD_BUFFER_SIZE: ByteSize = ByteSize::from_kib(128);
    /// Default tail reserve: cache line plus one page of overfetch
    pub const DEFAULT_TAIL_RESERVE: ByteSize =
        ByteSize::from_bytes(ByteSize::CACHE_LINE.as_bytes() + ByteSize::KIB_4.as_bytes());
    /// Default device-lost query interval
    pub const DEFAULT_HANG_CHECK_PERIOD_US: u64 = 500_000;

    /// Default configuration
    pub const fn new() -> Self {
        Self {
            queue_cmd_buffer_size: Self::DEFAULT_QUEUE_CMD_BUFFER_SIZE,
            cmd_buffer_tail_reserve: Self::DEFAULT_TAIL_RESERVE,
            mode_override: None,
            use_kmd_wait: None,
            indirect_allocations_as_pack: None,
            gpu_hang_check_period_us: Self::DEFAULT_HANG_CHECK_PERIOD_US,
            log_tracked_addresses: false,
        }
    }

    /// Set the stream size
    pub const fn with_queue_cmd_buffer_size(mut self, size: ByteSize) -> Self {
        self.queue_cmd_buffer_size = size;
        self
    }

    /// Set the tail reserve
    pub const fn with_tail_reserve(mut self, size: ByteSize) -> Self {
        self.cmd_buffer_tail_reserve = size;
        self
    }

    /// Force a queue mode
    pub const fn with_mode_override(mut self, mode: QueueMode) -> Self {
        self.mode_override = Some(mode);
        self
    }

    /// Force kernel-assisted waits on or off
    pub const fn with_kmd_wait(mut self, enabled: bool) -> Self {
        self.use_kmd_wait = Some(enabled);
        self
    }

    /// Force pack residency on or off
    pub const fn with_indirect_pack(mut self, enabled: bool) -> Self {
        self.indirect_allocations_as_pack = Some(enabled);
        self
    }

    /// Set the device-lost query interval
    pub const fn with_hang_check_period_us(mut self, period_us: u64) -> Self {
        self.gpu_hang_check_period_us = period_us;
        self
    }

    /// Enable tracked-address logging
    pub const fn with_tracked_address_logging(mut self, enabled: bool) -> Self {
        self.log_tracked_addresses = enabled;
        self
    }

    /// Bytes requested for each command buffer before granularity rounding
    pub const fn total_cmd_buffer_size(&self) -> ByteSize {
        ByteSize::from_bytes(
            self.queue_cmd_buffer_size.as_bytes() + self.cmd_buffer_tail_reserve.as_bytes(),
        )
    }

    /// Whether unbounded synchronize goes through the kernel wait
    pub const fn kmd_wait_enabled(&self) -> bool {
        match self.use_kmd_wait {
            Some(enabled) => enabled,
            None => false,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_total_size() {
        let config = QueueConfig::default();
        assert_eq!(config.total_cmd_buffer_size().as_bytes(), 128 * 1024 + 64 + 4096);
        assert!(!config.kmd_wait_enabled());
    }

    #[test]
    fn test_builder_overrides() {
        let config = QueueConfig::new()
            .with_kmd_wait(true)
            .with_mode_override(QueueMode::Synchronous)
            .with_queue_cmd_buffer_size(ByteSize::KIB_4);
        assert!(config.kmd_wait_enabled());
        assert_eq!(config.mode_override, Some(QueueMode::Synchronous));
        assert_eq!(config.queue_cmd_buffer_size, ByteSize::KIB_4);
    }
}

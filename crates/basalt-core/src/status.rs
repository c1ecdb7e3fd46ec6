//! # Status Codes
//!
//! Outcomes of waits and submissions as reported by the backend.

use crate::error::Result;

/// Timeout value that selects an unbounded wait
pub const WAIT_FOREVER: u64 = u64::MAX;

// =============================================================================
// WAIT STATUS
// =============================================================================

/// Result of waiting on a task count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// Target not reached before the timeout elapsed
    NotReady,
    /// Target reached
    Ready,
    /// Backend reported a device-lost condition
    GpuHang,
}

impl WaitStatus {
    /// Convert into a `Result`, mapping hang to `DeviceLost`
    #[inline]
    pub fn into_result(self) -> Result<()> {
        self.into()
    }
}

// =============================================================================
// SUBMISSION STATUS
// =============================================================================

/// Result of handing a batch buffer to the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionStatus {
    /// Batch accepted
    Success,
    /// Device memory exhausted while making the batch resident
    OutOfMemory,
    /// Host memory exhausted
    OutOfHostMemory,
    /// Backend rejected the batch
    Failed,
    /// Backend cannot execute this kind of batch
    Unsupported,
}

impl SubmissionStatus {
    /// Whether the batch reached the GPU
    #[inline]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }

    /// Convert into a `Result`
    #[inline]
    pub fn into_result(self) -> Result<()> {
        self.into()
    }
}

// =============================================================================
// THROTTLE
// =============================================================================

/// Scheduling throttle class passed with submissions and kernel waits
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum QueueThrottle {
    /// Background work
    Low,
    /// Default throttle for waits
    #[default]
    Medium,
    /// Default throttle for queue submissions
    High,
}

// =============================================================================
// WAIT PARAMETERS
// =============================================================================

/// Parameters of a polling wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitParams {
    /// Honor `timeout_us`
    pub enable_timeout: bool,
    /// Timeout in microseconds; meaningful only with `enable_timeout`
    pub timeout_us: u64,
}

impl WaitParams {
    /// Build parameters from a caller-supplied timeout
    ///
    /// [`WAIT_FOREVER`] disables the timeout.
    pub const fn from_timeout(timeout_us: u64) -> Self {
        Self {
            enable_timeout: timeout_us != WAIT_FOREVER,
            timeout_us,
        }
    }

    /// Unbounded wait
    pub const fn forever() -> Self {
        Self::from_timeout(WAIT_FOREVER)
    }
}

//! # BASALT Error Handling
//!
//! One error type for the whole queue stack.
//!
//! - Errors are typed and `no_std` compatible
//! - No panics in production paths, except the deliberate fatal trap path
//! - Failures never overstate GPU progress: callers can retry `NotReady`,
//!   everything under "fatal" below is terminal for the device

use core::fmt;

use crate::status::{SubmissionStatus, WaitStatus};

// =============================================================================
// RESULT TYPE
// =============================================================================

/// BASALT Result type alias
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// ERROR ENUM
// =============================================================================

/// BASALT unified error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    // =========================================================================
    // Memory
    // =========================================================================
    /// Device memory could not be allocated
    OutOfDeviceMemory,
    /// Host memory could not be allocated
    OutOfHostMemory,

    // =========================================================================
    // Submission
    // =========================================================================
    /// Backend rejected the batch buffer
    SubmissionFailed,
    /// Operation not supported by the backend
    Unsupported,

    // =========================================================================
    // Synchronization
    // =========================================================================
    /// Wait timed out before the target task count was reached
    NotReady,
    /// GPU hang detected; the device is lost (fatal)
    DeviceLost,

    // =========================================================================
    // Generic
    // =========================================================================
    /// Object used before a successful initialization
    Uninitialized,
    /// Invalid parameter provided
    InvalidParameter,
    /// Stale or foreign arena handle
    InvalidHandle,
    /// Resource not found
    NotFound,
}

impl Error {
    /// Whether the device must be considered permanently lost
    #[inline]
    pub const fn is_fatal(self) -> bool {
        matches!(self, Self::DeviceLost)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfDeviceMemory => write!(f, "out of device memory"),
            Self::OutOfHostMemory => write!(f, "out of host memory"),
            Self::SubmissionFailed => write!(f, "submission failed"),
            Self::Unsupported => write!(f, "operation not supported"),
            Self::NotReady => write!(f, "not ready"),
            Self::DeviceLost => write!(f, "device lost"),
            Self::Uninitialized => write!(f, "object not initialized"),
            Self::InvalidParameter => write!(f, "invalid parameter"),
            Self::InvalidHandle => write!(f, "invalid handle"),
            Self::NotFound => write!(f, "resource not found"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

// =============================================================================
// ERROR CONVERSION
// =============================================================================

impl From<SubmissionStatus> for Result<()> {
    fn from(status: SubmissionStatus) -> Self {
        match status {
            SubmissionStatus::Success => Ok(()),
            SubmissionStatus::OutOfMemory => Err(Error::OutOfDeviceMemory),
            SubmissionStatus::OutOfHostMemory => Err(Error::OutOfHostMemory),
            SubmissionStatus::Failed => Err(Error::SubmissionFailed),
            SubmissionStatus::Unsupported => Err(Error::Unsupported),
        }
    }
}

impl From<WaitStatus> for Result<()> {
    fn from(status: WaitStatus) -> Self {
        match status {
            WaitStatus::Ready => Ok(()),
            WaitStatus::NotReady => Err(Error::NotReady),
            WaitStatus::GpuHang => Err(Error::DeviceLost),
        }
    }
}

//! # BASALT Core
//!
//! Foundational types, status codes and backend traits for the BASALT
//! compute command queue.
//!
//! ## Layering
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        basalt-cmd                           │
//! │   (queue, double buffering, synchronizer, residency)        │
//! ├─────────────────────────────────────────────────────────────┤
//! │                        basalt-mem                           │
//! │   (allocation arena, reuse pool, unified memory registry)   │
//! ├─────────────────────────────────────────────────────────────┤
//! │                        basalt-core                          │
//! │  ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌──────────┐  │
//! │  │   Types   │  │  Status   │  │  Config   │  │ Backend  │  │
//! │  │ (GpuAddr, │  │  (Wait,   │  │  (Queue   │  │ (traits, │  │
//! │  │  Handle)  │  │  Submit)  │  │   knobs)  │  │  batch)  │  │
//! │  └───────────┘  └───────────┘  └───────────┘  └──────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The kernel-mode driver and the instruction encoder are external
//! collaborators. They are reached only through the traits in [`backend`].

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod backend;
pub mod batch;
pub mod config;
pub mod error;
pub mod generation;
pub mod status;
pub mod types;

// Re-exports for convenience
pub use backend::{
    AllocationRequest, AssertTrap, CommandBackend, DebuggerHooks, KernelDiagnostics,
    MemoryBackend, PageFaultManager, TrapHandler,
};
pub use batch::BatchBuffer;
pub use config::{QueueConfig, QueueDesc, QueueMode, QueuePriority};
pub use error::{Error, Result};
pub use generation::{BackendCaps, GpuGeneration};
pub use status::{QueueThrottle, SubmissionStatus, WaitParams, WaitStatus, WAIT_FOREVER};
pub use types::*;

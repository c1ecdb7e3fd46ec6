//! # BASALT Command Queue
//!
//! Submission and synchronization core of a GPU compute command queue.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                          CommandQueue                             │
//! │                                                                   │
//! │  ┌──────────────────┐   ┌──────────────┐   ┌──────────────────┐   │
//! │  │ CommandBuffer    │   │   Linear     │   │   Completion     │   │
//! │  │ Manager (2 slots)│──▶│   Stream     │   │   Log            │   │
//! │  └────────┬─────────┘   └──────┬───────┘   └────────┬─────────┘   │
//! │           │ flush stamps       │ batch              │ printf      │
//! │           ▼                    ▼                    ▼ asserts     │
//! │  ┌─────────────────────────────────────────────────────────────┐  │
//! │  │                 CommandBackend (one per context)            │  │
//! │  └─────────────────────────────────────────────────────────────┘  │
//! └───────────────────────────────────────────────────────────────────┘
//!                │ handles                       │ residency
//!        ┌───────▼────────┐             ┌────────▼──────────────┐
//!        │ MemoryManager  │             │ UnifiedMemoryRegistry │
//!        │ (arena, pool)  │             │ (indirect allocations)│
//!        └────────────────┘             └───────────────────────┘
//! ```
//!
//! ## Submission Flow
//!
//! 1. Reserve space, switching command buffers when the current one is full
//! 2. Encode commands into the linear stream
//! 3. Make residency sets resident and bump allocation watermarks
//! 4. Hand the batch to the backend, rolling watermarks back on failure
//! 5. Synchronize, then flush printf buffers and check for assertions

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

pub mod buffers;
pub mod completion;
pub mod device;
pub mod diagnostics;
pub mod queue;
pub mod residency;
pub mod stream;

#[cfg(any(test, feature = "sim"))]
pub mod sim;

// Re-exports
pub use buffers::{BufferSlot, CommandBufferManager};
pub use completion::WaitPolicy;
pub use device::{Device, DeviceBuilder};
pub use diagnostics::{CompletionLog, CompletionRecord, PanicTrapHandler};
pub use queue::{CommandQueue, ExecuteDesc, QueueFlags};
pub use residency::IndirectResidency;
pub use stream::LinearStream;

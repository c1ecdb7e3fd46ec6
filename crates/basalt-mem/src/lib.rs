//! # BASALT Memory Management
//!
//! Graphics allocations, the device arena that owns them, the device-wide
//! reuse pool and the unified-memory registry.
//!
//! ## Ownership
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       MemoryManager                          │
//! │                                                              │
//! │  ┌──────────────────────────┐   ┌─────────────────────────┐  │
//! │  │     AllocationArena      │   │       ReusePool         │  │
//! │  │  slot ─▶ GraphicsAlloc   │◀──│  handles parked between │  │
//! │  │  (generational handles)  │   │  queue lifetimes        │  │
//! │  └──────────────────────────┘   └─────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//!            ▲ handles                         ▲ handles
//!   ┌────────┴─────────┐             ┌─────────┴───────────────┐
//!   │  command queues  │             │  UnifiedMemoryRegistry  │
//!   └──────────────────┘             └─────────────────────────┘
//! ```
//!
//! Queues and the registry hold [`AllocationHandle`]s, never owning
//! pointers. A stale handle fails lookup instead of reaching freed memory.
//!
//! [`AllocationHandle`]: basalt_core::AllocationHandle

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

pub mod allocation;
pub mod arena;
pub mod manager;
pub mod reuse;
pub mod unified;

// Re-exports
pub use allocation::{GraphicsAllocation, UsageSnapshot};
pub use arena::AllocationArena;
pub use manager::MemoryManager;
pub use reuse::{ReusePool, ReuseStats};
pub use unified::{
    RegistryGuard, SvmEntry, SvmMap, UnifiedMemoryControls, UnifiedMemoryKinds, UnifiedMemoryRegistry,
};

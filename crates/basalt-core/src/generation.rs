//! # Hardware Generations
//!
//! Each supported generation maps to a fixed capability set. The set is
//! resolved once when a device is created; queue code only ever tests
//! capability bits and never branches on the generation itself.

// =============================================================================
// GPU GENERATION
// =============================================================================

/// GPU hardware generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u32)]
pub enum GpuGeneration {
    /// Unknown/unsupported generation
    Unknown = 0,
    /// Gen9 (integrated, single tile)
    Gen9    = 9,
    /// Gen11
    Gen11   = 11,
    /// Gen12 low-power
    Gen12Lp = 12,
    /// Xe high-performance graphics
    XeHpg   = 13,
    /// Xe high-performance compute (multi-tile)
    XeHpc   = 14,
}

// =============================================================================
// BACKEND CAPABILITIES
// =============================================================================

bitflags::bitflags! {
    /// Capabilities of a command backend
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BackendCaps: u32 {
        /// Kernel-assisted completion notification is available
        const KMD_NOTIFY = 1 << 0;
        /// Indirect allocations can be made resident in one bulk call
        const INDIRECT_PACK = 1 << 1;
        /// Submissions can execute across several partitions
        const MULTI_PARTITION = 1 << 2;
        /// Ring-based direct submission bypassing the kernel
        const DIRECT_SUBMISSION = 1 << 3;
        /// Shared allocations can be migrated by the page-fault manager
        const PAGE_MIGRATION = 1 << 4;
        /// Dedicated copy engines
        const COPY_ENGINE = 1 << 5;
    }
}

impl BackendCaps {
    /// Capability set for a generation, `None` when unsupported
    pub const fn for_generation(generation: GpuGeneration) -> Option<Self> {
        let caps = match generation {
            GpuGeneration::Unknown => return None,
            GpuGeneration::Gen9 | GpuGeneration::Gen11 => Self::KMD_NOTIFY,
            GpuGeneration::Gen12Lp => Self::KMD_NOTIFY
                .union(Self::PAGE_MIGRATION)
                .union(Self::COPY_ENGINE),
            GpuGeneration::XeHpg => Self::KMD_NOTIFY
                .union(Self::INDIRECT_PACK)
                .union(Self::PAGE_MIGRATION)
                .union(Self::COPY_ENGINE),
            GpuGeneration::XeHpc => Self::KMD_NOTIFY
                .union(Self::INDIRECT_PACK)
                .union(Self::MULTI_PARTITION)
                .union(Self::DIRECT_SUBMISSION)
                .union(Self::PAGE_MIGRATION)
                .union(Self::COPY_ENGINE),
        };
        Some(caps)
    }
}

//! # BASALT Core Types
//!
//! Strongly typed addresses, sizes, counters and handles shared by every
//! layer of the queue stack.

use core::fmt;
use core::ops::Add;

// =============================================================================
// GPU ADDRESS
// =============================================================================

/// GPU virtual address
///
/// An address in the GPU's virtual address space. It is not a CPU pointer.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct GpuAddr(u64);

impl GpuAddr {
    /// Create a new GPU address
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Null GPU address
    #[inline]
    pub const fn null() -> Self {
        Self(0)
    }

    /// Raw value
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Check if null
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Offset by bytes
    #[inline]
    pub const fn offset(self, bytes: u64) -> Self {
        Self(self.0.wrapping_add(bytes))
    }
}

impl Add<u64> for GpuAddr {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        self.offset(rhs)
    }
}

impl fmt::Debug for GpuAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GpuAddr(0x{:016x})", self.0)
    }
}

impl fmt::Display for GpuAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

// =============================================================================
// SIZE TYPES
// =============================================================================

/// Size in bytes
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct ByteSize(u64);

impl ByteSize {
    /// Zero size
    pub const ZERO: Self = Self(0);
    /// 4 KiB page
    pub const KIB_4: Self = Self(4 * 1024);
    /// 64 KiB page, the command buffer allocation granularity
    pub const KIB_64: Self = Self(64 * 1024);
    /// Cache line
    pub const CACHE_LINE: Self = Self(64);

    /// Create from bytes
    #[inline]
    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    /// Create from KiB
    #[inline]
    pub const fn from_kib(kib: u64) -> Self {
        Self(kib * 1024)
    }

    /// Create from MiB
    #[inline]
    pub const fn from_mib(mib: u64) -> Self {
        Self(mib * 1024 * 1024)
    }

    /// Get as bytes
    #[inline]
    pub const fn as_bytes(self) -> u64 {
        self.0
    }

    /// Get as `usize`
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Align up to a power-of-two boundary
    #[inline]
    pub const fn align_up(self, alignment: u64) -> Self {
        let mask = alignment - 1;
        Self((self.0 + mask) & !mask)
    }
}

impl Add for ByteSize {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl fmt::Debug for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= 1024 * 1024 && self.0 % (1024 * 1024) == 0 {
            write!(f, "{} MiB", self.0 / (1024 * 1024))
        } else if self.0 >= 1024 && self.0 % 1024 == 0 {
            write!(f, "{} KiB", self.0 / 1024)
        } else {
            write!(f, "{} B", self.0)
        }
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// =============================================================================
// COUNTERS
// =============================================================================

/// Monotonic per-context submission counter
///
/// Submissions through one context complete in issue order, so
/// "task count >= N completed" implies every earlier submission completed.
pub type TaskCount = u64;

/// Backend-specific completion token paired with a [`TaskCount`]
///
/// Zero means "no token"; kernel-assisted waits are skipped for it.
pub type FlushStamp = u64;

/// Execution context identifier on the backend
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct ContextId(pub u32);

impl fmt::Debug for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx#{}", self.0)
    }
}

/// Bitfield of sub-devices (tiles) a context spans
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct DeviceBitfield(pub u32);

impl DeviceBitfield {
    /// Single-tile bitfield
    pub const SINGLE: Self = Self(1);

    /// Number of sub-devices in the field
    #[inline]
    pub const fn count(self) -> u32 {
        self.0.count_ones()
    }
}

impl fmt::Debug for DeviceBitfield {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceBitfield({:#b})", self.0)
    }
}

// =============================================================================
// HANDLE TYPES
// =============================================================================

/// Opaque generational handle to an arena-owned resource
///
/// The low 32 bits hold the slot index, the high 32 bits the slot
/// generation. A handle to a freed and reused slot never aliases the new
/// occupant.
#[repr(transparent)]
pub struct Handle<T> {
    id: u64,
    _marker: core::marker::PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    /// Create a handle from a raw id
    #[inline]
    pub const fn from_raw(id: u64) -> Self {
        Self {
            id,
            _marker: core::marker::PhantomData,
        }
    }

    /// Create a handle from slot index and generation
    #[inline]
    pub const fn new(index: u32, generation: u32) -> Self {
        Self::from_raw(((generation as u64) << 32) | index as u64)
    }

    /// Raw id
    #[inline]
    pub const fn raw(self) -> u64 {
        self.id
    }

    /// Slot index
    #[inline]
    pub const fn index(self) -> u32 {
        self.id as u32
    }

    /// Slot generation
    #[inline]
    pub const fn generation(self) -> u32 {
        (self.id >> 32) as u32
    }
}

// Manual impls so `T` needs no bounds
impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for Handle<T> {}

impl<T> PartialOrd for Handle<T> {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Handle<T> {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        self.id.cmp(&other.id)
    }
}

impl<T> core::hash::Hash for Handle<T> {
    fn hash<H: core::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({}v{})", self.index(), self.generation())
    }
}

/// Marker for graphics allocation handles
#[derive(Debug)]
pub struct AllocationMarker;

/// Handle to a graphics allocation in the device arena
pub type AllocationHandle = Handle<AllocationMarker>;

// =============================================================================
// ALLOCATION TYPE
// =============================================================================

/// Kind of graphics allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocationType {
    /// Queue command buffer
    CommandBuffer,
    /// Plain device buffer
    Buffer,
    /// Internal driver heap
    InternalHeap,
    /// Unified (shared) allocation, host backing
    SvmCpu,
    /// Unified (shared) allocation, device backing
    SvmGpu,
    /// Host allocation visible to the device
    SvmZeroCopy,
}

impl AllocationType {
    /// Whether pages can be migrated between host and device domains
    #[inline]
    pub const fn is_migratable(self) -> bool {
        matches!(self, Self::SvmCpu | Self::SvmGpu)
    }
}

// =============================================================================
// STATIC ASSERTIONS
// =============================================================================

static_assertions::assert_impl_all!(GpuAddr: Send, Sync, Copy);
static_assertions::assert_impl_all!(ByteSize: Send, Sync, Copy);
static_assertions::assert_impl_all!(AllocationHandle: Send, Sync, Copy);

//! # Device
//!
//! Per-device state shared by every queue: the memory manager with its
//! reuse pool, the unified-memory registry and the optional collaborators
//! (page-fault manager, debugger, trap handler).
//!
//! The capability set is resolved from the hardware generation once, here.
//! Queues test capability bits and never look at the generation again.

use alloc::sync::Arc;
use core::fmt;

use basalt_core::{
    AllocationHandle, AllocationRequest, AllocationType, BackendCaps, ByteSize, DebuggerHooks,
    DeviceBitfield, GpuGeneration, MemoryBackend, PageFaultManager, Result, TrapHandler,
};
use basalt_mem::{MemoryManager, UnifiedMemoryRegistry};

use crate::diagnostics::PanicTrapHandler;

// =============================================================================
// DEVICE
// =============================================================================

/// A root device
pub struct Device {
    root_device_index: u32,
    generation: GpuGeneration,
    caps: Option<BackendCaps>,
    device_bitfield: DeviceBitfield,
    memory: MemoryManager,
    svm: UnifiedMemoryRegistry,
    page_fault_manager: Option<Arc<dyn PageFaultManager>>,
    debugger: Option<Arc<dyn DebuggerHooks>>,
    trap_handler: Arc<dyn TrapHandler>,
    power_hint: u32,
}

impl Device {
    /// Start building a device
    pub fn builder(generation: GpuGeneration, memory_backend: Arc<dyn MemoryBackend>) -> DeviceBuilder {
        DeviceBuilder::new(generation, memory_backend)
    }

    /// Root device index
    pub fn root_device_index(&self) -> u32 {
        self.root_device_index
    }

    /// Hardware generation
    pub fn generation(&self) -> GpuGeneration {
        self.generation
    }

    /// Capability set, `None` when the generation is unsupported
    pub fn caps(&self) -> Option<BackendCaps> {
        self.caps
    }

    /// Sub-devices this root device spans
    pub fn device_bitfield(&self) -> DeviceBitfield {
        self.device_bitfield
    }

    /// Number of generic sub-devices
    pub fn num_sub_devices(&self) -> u32 {
        self.device_bitfield.count()
    }

    /// Memory manager
    pub fn memory(&self) -> &MemoryManager {
        &self.memory
    }

    /// Unified memory registry
    pub fn svm(&self) -> &UnifiedMemoryRegistry {
        &self.svm
    }

    /// Page-fault manager, when the device migrates shared allocations
    pub fn page_fault_manager(&self) -> Option<&dyn PageFaultManager> {
        self.page_fault_manager.as_deref()
    }

    /// Debugger hooks, when a debugger is attached
    pub fn debugger(&self) -> Option<&dyn DebuggerHooks> {
        self.debugger.as_deref()
    }

    /// Handler invoked on kernel assertion failures
    pub fn trap_handler(&self) -> &dyn TrapHandler {
        &*self.trap_handler
    }

    /// Power hint applied to queue contexts, zero when unset
    pub fn power_hint(&self) -> u32 {
        self.power_hint
    }

    /// Allocate a command buffer of `size` bytes
    ///
    /// Command buffers are CPU visible and usable from every context of the
    /// device.
    pub fn allocate_command_buffer(&self, size: ByteSize) -> Result<AllocationHandle> {
        let request = AllocationRequest {
            root_device_index: self.root_device_index,
            size,
            alignment: ByteSize::KIB_64.as_bytes(),
            kind: AllocationType::CommandBuffer,
            multi_os_context_capable: self.num_sub_devices() > 1,
            device_bitfield: self.device_bitfield,
            cpu_visible: true,
        };
        self.memory.allocate_graphics_memory(&request)
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("root_device_index", &self.root_device_index)
            .field("generation", &self.generation)
            .field("caps", &self.caps)
            .field("device_bitfield", &self.device_bitfield)
            .field("memory", &self.memory)
            .field("svm", &self.svm)
            .field("page_faults", &self.page_fault_manager.is_some())
            .field("debugger", &self.debugger.is_some())
            .finish()
    }
}

// =============================================================================
// BUILDER
// =============================================================================

/// Builder for [`Device`]
pub struct DeviceBuilder {
    root_device_index: u32,
    generation: GpuGeneration,
    device_bitfield: DeviceBitfield,
    memory_backend: Arc<dyn MemoryBackend>,
    page_fault_manager: Option<Arc<dyn PageFaultManager>>,
    debugger: Option<Arc<dyn DebuggerHooks>>,
    trap_handler: Option<Arc<dyn TrapHandler>>,
    power_hint: u32,
}

impl DeviceBuilder {
    /// Builder for a single-tile root device 0
    pub fn new(generation: GpuGeneration, memory_backend: Arc<dyn MemoryBackend>) -> Self {
        Self {
            root_device_index: 0,
            generation,
            device_bitfield: DeviceBitfield::SINGLE,
            memory_backend,
            page_fault_manager: None,
            debugger: None,
            trap_handler: None,
            power_hint: 0,
        }
    }

    /// Root device index
    pub fn root_device_index(mut self, index: u32) -> Self {
        self.root_device_index = index;
        self
    }

    /// Sub-devices spanned
    pub fn sub_devices(mut self, bitfield: DeviceBitfield) -> Self {
        self.device_bitfield = bitfield;
        self
    }

    /// Page-fault manager for shared allocation migration
    pub fn page_fault_manager(mut self, manager: Arc<dyn PageFaultManager>) -> Self {
        self.page_fault_manager = Some(manager);
        self
    }

    /// Attach debugger hooks
    pub fn debugger(mut self, debugger: Arc<dyn DebuggerHooks>) -> Self {
        self.debugger = Some(debugger);
        self
    }

    /// Replace the default panicking trap handler
    pub fn trap_handler(mut self, handler: Arc<dyn TrapHandler>) -> Self {
        self.trap_handler = Some(handler);
        self
    }

    /// Power hint for queue contexts
    pub fn power_hint(mut self, hint: u32) -> Self {
        self.power_hint = hint;
        self
    }

    /// Build the device
    pub fn build(self) -> Device {
        let caps = BackendCaps::for_generation(self.generation);
        match caps {
            Some(caps) => log::debug!(
                "root device {}: {:?} with {:?}",
                self.root_device_index,
                self.generation,
                caps
            ),
            None => log::warn!(
                "root device {}: unsupported generation {:?}",
                self.root_device_index,
                self.generation
            ),
        }

        let indirect_as_pack = caps.is_some_and(|caps| caps.contains(BackendCaps::INDIRECT_PACK));
        let memory = MemoryManager::new(self.root_device_index, self.memory_backend)
            .with_indirect_pack(indirect_as_pack);

        Device {
            root_device_index: self.root_device_index,
            generation: self.generation,
            caps,
            device_bitfield: self.device_bitfield,
            memory,
            svm: UnifiedMemoryRegistry::new(),
            page_fault_manager: self.page_fault_manager,
            debugger: self.debugger,
            trap_handler: self
                .trap_handler
                .unwrap_or_else(|| Arc::new(PanicTrapHandler)),
            power_hint: self.power_hint,
        }
    }
}

impl fmt::Debug for DeviceBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuilder")
            .field("root_device_index", &self.root_device_index)
            .field("generation", &self.generation)
            .field("device_bitfield", &self.device_bitfield)
            .field("power_hint", &self.power_hint)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimMemory;

    #[test]
    fn test_caps_resolved_once() {
        let device = Device::builder(GpuGeneration::XeHpc, SimMemory::new()).build();
        let caps = device.caps().expect("supported");
        assert!(caps.contains(BackendCaps::MULTI_PARTITION));
        assert!(device.memory().allow_indirect_allocations_as_pack());
    }

    #[test]
    fn test_unsupported_generation_has_no_caps() {
        let device = Device::builder(GpuGeneration::Unknown, SimMemory::new()).build();
        assert!(device.caps().is_none());
        assert!(!device.memory().allow_indirect_allocations_as_pack());
    }

    #[test]
    fn test_command_buffer_is_cpu_visible() {
        let device = Device::builder(GpuGeneration::Gen12Lp, SimMemory::new())
            .sub_devices(DeviceBitfield(0b11))
            .build();
        assert_eq!(device.num_sub_devices(), 2);

        let handle = device
            .allocate_command_buffer(ByteSize::KIB_64)
            .expect("allocates");
        let (kind, len) = device
            .memory()
            .with_allocation(handle, |a| (a.kind(), a.underlying_buffer().len()))
            .expect("live");
        assert_eq!(kind, AllocationType::CommandBuffer);
        assert_eq!(len, 64 * 1024);
    }
}

//! # Simulated Backends
//!
//! In-memory [`CommandBackend`], [`MemoryBackend`] and collaborator
//! implementations for exercising queues without hardware. Completion is
//! driven by the test through [`SimCompletion`] and explicit calls; time
//! advances by a fixed tick on every clock read.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use basalt_core::{
    AllocationHandle, AllocationRequest, AssertTrap, BatchBuffer, ByteSize, CommandBackend,
    ContextId, DebuggerHooks, DeviceBitfield, Error, FlushStamp, GpuAddr, KernelDiagnostics,
    MemoryBackend, PageFaultManager, QueueThrottle, Result, SubmissionStatus, TaskCount,
    WaitStatus,
};
use spin::Mutex;

// =============================================================================
// COMMAND BACKEND
// =============================================================================

/// When submitted work completes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimCompletion {
    /// Only on explicit completion calls or kernel waits
    Manual,
    /// As soon as it is submitted
    Immediate,
    /// After the given number of completion queries
    AfterPolls(u32),
}

/// A batch the backend accepted
#[derive(Debug, Clone)]
pub struct SimSubmission {
    /// Descriptor handed over
    pub batch: BatchBuffer,
    /// Residency set handed over
    pub residency: Vec<AllocationHandle>,
    /// Task count assigned
    pub task_count: TaskCount,
}

#[derive(Debug)]
struct SimState {
    completion: SimCompletion,
    task_count: TaskCount,
    completed: TaskCount,
    polls_left: u32,
    hang: bool,
    fail_next: Option<SubmissionStatus>,
    flush_stamps: bool,
    resident: Vec<AllocationHandle>,
    submissions: Vec<SimSubmission>,
    partitions: u32,
    clients: u32,
    power_hint: u32,
    clock_ns: u64,
}

impl SimState {
    fn advance(&mut self) -> TaskCount {
        self.task_count += 1;
        match self.completion {
            SimCompletion::Manual => {},
            SimCompletion::Immediate => self.completed = self.task_count,
            SimCompletion::AfterPolls(polls) => self.polls_left = polls,
        }
        self.task_count
    }
}

/// Simulated command backend
#[derive(Debug)]
pub struct SimBackend {
    context: ContextId,
    device_bitfield: DeviceBitfield,
    tick_ns: u64,
    state: Mutex<SimState>,
    hang_queries: AtomicU64,
    kmd_waits: AtomicU64,
    context_reinits: AtomicU32,
    resources_initialized: AtomicBool,
    direct_submission: AtomicBool,
    fail_resources: AtomicBool,
}

impl Default for SimBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SimBackend {
    /// Single-tile backend on context 0, manual completion
    pub fn new() -> Self {
        Self {
            context: ContextId(0),
            device_bitfield: DeviceBitfield::SINGLE,
            tick_ns: 1_000,
            state: Mutex::new(SimState {
                completion: SimCompletion::Manual,
                task_count: 0,
                completed: 0,
                polls_left: 0,
                hang: false,
                fail_next: None,
                flush_stamps: true,
                resident: Vec::new(),
                submissions: Vec::new(),
                partitions: 1,
                clients: 0,
                power_hint: 0,
                clock_ns: 0,
            }),
            hang_queries: AtomicU64::new(0),
            kmd_waits: AtomicU64::new(0),
            context_reinits: AtomicU32::new(0),
            resources_initialized: AtomicBool::new(false),
            direct_submission: AtomicBool::new(false),
            fail_resources: AtomicBool::new(false),
        }
    }

    /// Use another context id
    pub fn with_context(mut self, context: ContextId) -> Self {
        self.context = context;
        self
    }

    /// Span several sub-devices, with one partition per sub-device active
    pub fn with_device_bitfield(mut self, bitfield: DeviceBitfield) -> Self {
        self.device_bitfield = bitfield;
        self.state.get_mut().partitions = bitfield.count();
        self
    }

    /// Change the completion mode
    pub fn set_completion(&self, completion: SimCompletion) {
        self.state.lock().completion = completion;
    }

    /// Account for `count` submissions made outside any queue
    pub fn advance_task_count(&self, count: u64) {
        let mut state = self.state.lock();
        for _ in 0..count {
            state.advance();
        }
    }

    /// Complete everything submitted so far
    pub fn complete_all(&self) {
        let mut state = self.state.lock();
        state.completed = state.task_count;
    }

    /// Complete up to `task_count`
    pub fn complete_up_to(&self, task_count: TaskCount) {
        let mut state = self.state.lock();
        state.completed = state.completed.max(task_count.min(state.task_count));
    }

    /// Report a GPU hang from now on
    pub fn inject_hang(&self) {
        self.state.lock().hang = true;
    }

    /// Reject the next submission with `status`
    pub fn fail_next_submission(&self, status: SubmissionStatus) {
        self.state.lock().fail_next = Some(status);
    }

    /// Return zero flush stamps
    pub fn disable_flush_stamps(&self) {
        self.state.lock().flush_stamps = false;
    }

    /// Fail the next resource initialization
    pub fn fail_initialize_resources(&self) {
        self.fail_resources.store(true, Ordering::Relaxed);
    }

    /// Highest completed task count
    pub fn completed(&self) -> TaskCount {
        self.state.lock().completed
    }

    /// Accepted submissions, oldest first
    pub fn submissions(&self) -> Vec<SimSubmission> {
        self.state.lock().submissions.clone()
    }

    /// Whether `allocation` was made resident
    pub fn is_resident(&self, allocation: AllocationHandle) -> bool {
        self.state.lock().resident.contains(&allocation)
    }

    /// Hang queries so far
    pub fn hang_queries(&self) -> u64 {
        self.hang_queries.load(Ordering::Relaxed)
    }

    /// Kernel waits so far
    pub fn kmd_waits(&self) -> u64 {
        self.kmd_waits.load(Ordering::Relaxed)
    }

    /// Context reinitializations so far
    pub fn context_reinits(&self) -> u32 {
        self.context_reinits.load(Ordering::Relaxed)
    }

    /// Whether backend resources were initialized
    pub fn resources_initialized(&self) -> bool {
        self.resources_initialized.load(Ordering::Relaxed)
    }

    /// Whether direct submission was started
    pub fn direct_submission_started(&self) -> bool {
        self.direct_submission.load(Ordering::Relaxed)
    }
}

impl CommandBackend for SimBackend {
    fn context_id(&self) -> ContextId {
        self.context
    }

    fn device_bitfield(&self) -> DeviceBitfield {
        self.device_bitfield
    }

    fn peek_task_count(&self) -> TaskCount {
        self.state.lock().task_count
    }

    fn completed_task_count(&self) -> TaskCount {
        let mut state = self.state.lock();
        if state.completion == SimCompletion::Immediate {
            state.completed = state.task_count;
        }
        if state.polls_left > 0 {
            state.polls_left -= 1;
            if state.polls_left == 0 {
                state.completed = state.task_count;
            }
        }
        state.completed
    }

    fn is_gpu_hang_detected(&self) -> bool {
        self.hang_queries.fetch_add(1, Ordering::Relaxed);
        self.state.lock().hang
    }

    fn make_resident(&self, allocation: AllocationHandle) {
        let mut state = self.state.lock();
        if !state.resident.contains(&allocation) {
            state.resident.push(allocation);
        }
    }

    fn residency_allocations(&self) -> Vec<AllocationHandle> {
        self.state.lock().resident.clone()
    }

    fn submit_batch_buffer(
        &self,
        batch: &BatchBuffer,
        residency: &[AllocationHandle],
    ) -> SubmissionStatus {
        let mut state = self.state.lock();
        if let Some(status) = state.fail_next.take() {
            return status;
        }
        let task_count = state.advance();
        state.submissions.push(SimSubmission {
            batch: *batch,
            residency: residency.to_vec(),
            task_count,
        });
        SubmissionStatus::Success
    }

    fn obtain_current_flush_stamp(&self) -> FlushStamp {
        let state = self.state.lock();
        if state.flush_stamps {
            state.task_count
        } else {
            0
        }
    }

    fn wait_for_flush_stamp(&self, flush_stamp: FlushStamp, _throttle: QueueThrottle) -> WaitStatus {
        self.kmd_waits.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();
        if state.hang {
            return WaitStatus::GpuHang;
        }
        state.completed = state.completed.max(flush_stamp.min(state.task_count));
        WaitStatus::Ready
    }

    fn set_active_partitions(&self, count: u32) {
        self.state.lock().partitions = count;
    }

    fn active_partitions(&self) -> u32 {
        self.state.lock().partitions
    }

    fn register_client(&self) {
        self.state.lock().clients += 1;
    }

    fn unregister_client(&self) {
        let mut state = self.state.lock();
        state.clients = state.clients.saturating_sub(1);
    }

    fn num_clients(&self) -> u32 {
        self.state.lock().clients
    }

    fn power_hint(&self) -> u32 {
        self.state.lock().power_hint
    }

    fn set_power_hint(&self, hint: u32) {
        self.state.lock().power_hint = hint;
    }

    fn reinitialize_context(&self) -> Result<()> {
        self.context_reinits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn initialize_resources(&self) -> Result<()> {
        if self.fail_resources.swap(false, Ordering::Relaxed) {
            return Err(Error::OutOfHostMemory);
        }
        self.resources_initialized.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn init_direct_submission(&self) -> Result<()> {
        self.direct_submission.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn time_ns(&self) -> u64 {
        let mut state = self.state.lock();
        state.clock_ns += self.tick_ns;
        state.clock_ns
    }
}

// =============================================================================
// MEMORY BACKEND
// =============================================================================

/// Bump allocator over a fake GPU address space
#[derive(Debug)]
pub struct SimMemory {
    next: AtomicU64,
    budget: AtomicUsize,
    allocations: AtomicUsize,
    frees: AtomicUsize,
}

impl SimMemory {
    /// Unlimited allocator
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next: AtomicU64::new(0x1_0000_0000),
            budget: AtomicUsize::new(usize::MAX),
            allocations: AtomicUsize::new(0),
            frees: AtomicUsize::new(0),
        })
    }

    /// Fail every allocation after the next `count`
    pub fn fail_after(&self, count: usize) {
        self.budget.store(count, Ordering::Relaxed);
    }

    /// Successful allocations so far
    pub fn allocations(&self) -> usize {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Frees so far
    pub fn frees(&self) -> usize {
        self.frees.load(Ordering::Relaxed)
    }
}

impl MemoryBackend for SimMemory {
    fn allocate(&self, request: &AllocationRequest) -> Option<GpuAddr> {
        self.budget
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |left| left.checked_sub(1))
            .ok()?;

        let size = request.size.align_up(request.alignment.max(1)).as_bytes();
        let base = self.next.fetch_add(size, Ordering::Relaxed);
        self.allocations.fetch_add(1, Ordering::Relaxed);
        Some(GpuAddr::new(base))
    }

    fn free(&self, _gpu_addr: GpuAddr, _size: ByteSize) {
        self.frees.fetch_add(1, Ordering::Relaxed);
    }
}

// =============================================================================
// COLLABORATORS
// =============================================================================

/// Kernel diagnostics counting printf flushes
#[derive(Debug, Default)]
pub struct SimDiagnostics {
    flushes: AtomicUsize,
    last_hang: AtomicBool,
    trap: Mutex<Option<AssertTrap>>,
}

impl SimDiagnostics {
    /// Diagnostics of a kernel that never asserts
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Diagnostics of a kernel whose assertion fired
    pub fn with_trap(kernel: &str, message: &str) -> Arc<Self> {
        Arc::new(Self {
            trap: Mutex::new(Some(AssertTrap {
                kernel: String::from(kernel),
                message: String::from(message),
            })),
            ..Self::default()
        })
    }

    /// Printf flushes so far
    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::Relaxed)
    }

    /// Hang flag passed to the last flush
    pub fn last_flush_saw_hang(&self) -> bool {
        self.last_hang.load(Ordering::Relaxed)
    }
}

impl KernelDiagnostics for SimDiagnostics {
    fn flush_printf(&self, hang_detected: bool) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.last_hang.store(hang_detected, Ordering::Relaxed);
    }

    fn take_assert_trap(&self) -> Option<AssertTrap> {
        self.trap.lock().take()
    }
}

/// Page-fault manager recording migrations
#[derive(Debug, Default)]
pub struct SimPageFaults {
    migrated: Mutex<Vec<GpuAddr>>,
}

impl SimPageFaults {
    /// Create a recorder
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Addresses moved to the GPU domain, in order
    pub fn migrated(&self) -> Vec<GpuAddr> {
        self.migrated.lock().clone()
    }
}

impl PageFaultManager for SimPageFaults {
    fn move_allocation_to_gpu_domain(&self, gpu_addr: GpuAddr) {
        self.migrated.lock().push(gpu_addr);
    }
}

/// Debugger recording notifications
#[derive(Debug, Default)]
pub struct SimDebugger {
    created: AtomicU32,
    destroyed: AtomicU32,
    printed: AtomicU32,
}

impl SimDebugger {
    /// Create a recorder
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// (created, destroyed, tracked-address prints)
    pub fn counts(&self) -> (u32, u32, u32) {
        (
            self.created.load(Ordering::Relaxed),
            self.destroyed.load(Ordering::Relaxed),
            self.printed.load(Ordering::Relaxed),
        )
    }
}

impl DebuggerHooks for SimDebugger {
    fn notify_queue_created(&self, _root_device_index: u32) {
        self.created.fetch_add(1, Ordering::Relaxed);
    }

    fn notify_queue_destroyed(&self, _root_device_index: u32) {
        self.destroyed.fetch_add(1, Ordering::Relaxed);
    }

    fn print_tracked_addresses(&self, _context: ContextId) {
        self.printed.fetch_add(1, Ordering::Relaxed);
    }
}

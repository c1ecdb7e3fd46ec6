//! # Command Queue
//!
//! Ties the command buffers, the linear stream and the backend together:
//!
//! ```text
//!  encode ──▶ reserve ──(full)──▶ switch + wait ──▶ rebind stream
//!                │
//!                ▼
//!  submit ──▶ residency ──▶ bump watermarks ──▶ backend submit
//!                                                   │
//!                              failure ◀────────────┤
//!                         (roll back, report)       │ success
//!                                                   ▼
//!                                         record flush stamp
//!                                                   │
//!  synchronize ──▶ kernel wait / polling ──▶ post-sync housekeeping
//!                                            (printf, assert, debugger)
//! ```
//!
//! A queue is driven by one thread at a time. The device and its memory
//! manager may be shared by many queues.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use basalt_core::{
    AllocationHandle, BackendCaps, BatchBuffer, CommandBackend, ContextId, Error, FlushStamp,
    KernelDiagnostics, QueueConfig, QueueDesc, QueueMode, QueuePriority, QueueThrottle, Result,
    SubmissionStatus, TaskCount, WaitParams, WaitStatus, WAIT_FOREVER,
};
use basalt_mem::{UnifiedMemoryControls, UsageSnapshot};

use crate::buffers::CommandBufferManager;
use crate::completion::{
    wait_for_completion_with_timeout, wait_for_task_count_with_kmd_notify_fallback, WaitPolicy,
};
use crate::device::Device;
use crate::diagnostics::CompletionLog;
use crate::residency::handle_indirect_allocation_residency;
use crate::stream::LinearStream;

// =============================================================================
// FLAGS AND DESCRIPTORS
// =============================================================================

/// Queue creation flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueFlags {
    /// Queue feeds a copy engine only
    pub copy_only: bool,
    /// Driver-internal queue, hidden from debuggers
    pub internal: bool,
    /// Backs an immediate command list
    pub immediate: bool,
}

/// One execution: encoded commands plus what the GPU needs resident
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecuteDesc<'a> {
    /// Allocations referenced by the commands
    pub residency: &'a [AllocationHandle],
    /// Cooperative dispatch
    pub cooperative: bool,
    /// Indirect allocations the kernels may reach, `None` when they reach
    /// none
    pub unified_memory: Option<UnifiedMemoryControls>,
    /// Migrate shared allocations to the GPU before submission
    pub migrate: bool,
}

/// Where the commands of the pending submission start
#[derive(Debug, Clone, Copy)]
struct SubmissionStart {
    allocation: AllocationHandle,
    offset: usize,
    /// Bytes used in `allocation`, frozen when the stream leaves it
    used: Option<usize>,
}

// =============================================================================
// COMMAND QUEUE
// =============================================================================

/// A compute command queue bound to one backend context
pub struct CommandQueue {
    desc: QueueDesc,
    config: QueueConfig,
    device: Arc<Device>,
    backend: Arc<dyn CommandBackend>,
    caps: BackendCaps,
    policy: WaitPolicy,
    use_kmd_wait: bool,

    buffers: CommandBufferManager,
    stream: LinearStream,
    start: Option<SubmissionStart>,
    completions: CompletionLog,
    task_count: TaskCount,
    /// Flush stamp of the last successful submission
    flush_stamp: FlushStamp,

    flags: QueueFlags,
    active_sub_devices: u32,
    partition_count: u32,
    client_registered: bool,
    debugger_notified: bool,
    initialized: bool,
}

impl CommandQueue {
    /// Create and initialize a queue
    ///
    /// Fails with [`Error::Uninitialized`] when the device generation has
    /// no backend capabilities. A queue whose initialization fails is torn
    /// down before the error is returned.
    pub fn create(
        device: Arc<Device>,
        backend: Arc<dyn CommandBackend>,
        desc: QueueDesc,
        flags: QueueFlags,
        config: QueueConfig,
    ) -> Result<Self> {
        let mut queue = Self::new(device, backend, desc, config)?;

        if let Err(err) = queue.initialize(flags.copy_only, flags.internal, flags.immediate) {
            log::warn!("queue {}:{} initialization failed: {}", desc.ordinal, desc.index, err);
            queue.destroy();
            return Err(err);
        }

        let hint = queue.device.power_hint();
        if hint != 0 && hint != queue.backend.power_hint() {
            queue.backend.set_power_hint(hint);
            queue.backend.reinitialize_context()?;
        }

        queue.backend.initialize_resources()?;
        if queue.caps.contains(BackendCaps::DIRECT_SUBMISSION) {
            queue.backend.init_direct_submission()?;
        }

        log::debug!(
            "queue {}:{} created on {:?} ({:?}, {} partitions)",
            desc.ordinal,
            desc.index,
            queue.backend.context_id(),
            queue.synchronous_mode(),
            queue.partition_count
        );
        Ok(queue)
    }

    /// Create an uninitialized queue
    pub fn new(
        device: Arc<Device>,
        backend: Arc<dyn CommandBackend>,
        desc: QueueDesc,
        config: QueueConfig,
    ) -> Result<Self> {
        let caps = device.caps().ok_or(Error::Uninitialized)?;
        let policy = WaitPolicy::new(&config, caps);
        let use_kmd_wait = config.kmd_wait_enabled() && caps.contains(BackendCaps::KMD_NOTIFY);

        Ok(Self {
            desc,
            config,
            device,
            backend,
            caps,
            policy,
            use_kmd_wait,
            buffers: CommandBufferManager::new(),
            stream: LinearStream::new(),
            start: None,
            completions: CompletionLog::new(),
            task_count: 0,
            flush_stamp: 0,
            flags: QueueFlags::default(),
            active_sub_devices: 1,
            partition_count: 1,
            client_registered: false,
            debugger_notified: false,
            initialized: false,
        })
    }

    /// Acquire command buffers and bind the stream to the first one
    pub fn initialize(&mut self, copy_only: bool, internal: bool, immediate: bool) -> Result<()> {
        self.flags = QueueFlags {
            copy_only,
            internal,
            immediate,
        };

        self.buffers
            .initialize(&self.device, self.config.total_cmd_buffer_size())?;
        self.bind_stream_to_current_buffer()?;

        self.active_sub_devices = self.backend.device_bitfield().count();
        if !internal {
            self.partition_count = self.backend.active_partitions().max(1);
            if self.partition_count > 1 && !self.caps.contains(BackendCaps::MULTI_PARTITION) {
                log::warn!(
                    "{:?}: {} partitions without multi-partition support, using 1",
                    self.backend.context_id(),
                    self.partition_count
                );
                self.partition_count = 1;
            }

            if let Some(debugger) = self.device.debugger() {
                debugger.notify_queue_created(self.device.root_device_index());
                self.debugger_notified = true;
            }
        }

        self.initialized = true;
        Ok(())
    }

    fn bind_stream_to_current_buffer(&mut self) -> Result<()> {
        let allocation = self.buffers.current_buffer_allocation()?;
        let gpu_base = self
            .device
            .memory()
            .with_allocation(allocation, |a| a.gpu_addr())?;
        self.stream.replace_buffer(
            allocation,
            gpu_base,
            self.config.queue_cmd_buffer_size.as_usize(),
        );
        Ok(())
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Queue descriptor
    pub fn desc(&self) -> &QueueDesc {
        &self.desc
    }

    /// Queue configuration
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Device the queue runs on
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Backend context
    pub fn backend(&self) -> &dyn CommandBackend {
        &*self.backend
    }

    /// Execution mode after the configured override
    pub fn synchronous_mode(&self) -> QueueMode {
        self.config.mode_override.unwrap_or(self.desc.mode)
    }

    /// Task count of the last successful submission
    pub fn task_count(&self) -> TaskCount {
        self.task_count
    }

    /// Linear stream over the active command buffer
    pub fn stream(&self) -> &LinearStream {
        &self.stream
    }

    /// Command buffers
    pub fn buffers(&self) -> &CommandBufferManager {
        &self.buffers
    }

    /// Whether the queue feeds a copy engine only
    pub fn is_copy_only(&self) -> bool {
        self.flags.copy_only
    }

    /// Whether the queue is driver internal
    pub fn is_internal(&self) -> bool {
        self.flags.internal
    }

    /// Whether the queue backs an immediate command list
    pub fn is_immediate(&self) -> bool {
        self.flags.immediate
    }

    /// Sub-devices the backend context spans
    pub fn active_sub_devices(&self) -> u32 {
        self.active_sub_devices
    }

    /// Partitions submissions execute on
    pub fn partition_count(&self) -> u32 {
        self.partition_count
    }

    /// Outstanding completion records
    pub fn pending_completions(&self) -> usize {
        self.completions.pending()
    }

    // =========================================================================
    // Encoding
    // =========================================================================

    /// Ensure `size` contiguous bytes are available in the stream
    ///
    /// Switches to the other command buffer when the active one is too
    /// full, waiting for the GPU to release it. A reservation larger than
    /// a whole buffer still switches once; it cannot be satisfied.
    pub fn reserve_linear_stream_size(&mut self, size: usize) -> Result<WaitStatus> {
        if !self.initialized {
            return Err(Error::Uninitialized);
        }
        if self.stream.available_space() >= size {
            return Ok(WaitStatus::Ready);
        }
        if size > self.stream.capacity() {
            log::warn!(
                "{:?}: reservation of {} bytes exceeds command buffer capacity {}",
                self.backend.context_id(),
                size,
                self.stream.capacity()
            );
        }

        if let Some(start) = self.start.as_mut() {
            if Some(start.allocation) == self.stream.graphics_allocation() && start.used.is_none() {
                start.used = Some(self.stream.used());
            }
        }

        let status = self.buffers.switch_buffers(&*self.backend, &self.policy);
        self.bind_stream_to_current_buffer()?;
        Ok(status)
    }

    /// Copy encoded commands into the stream, returning their offset
    pub fn encode(&mut self, bytes: &[u8]) -> Result<usize> {
        self.reserve_linear_stream_size(bytes.len())?.into_result()?;

        let allocation = self
            .stream
            .graphics_allocation()
            .ok_or(Error::Uninitialized)?;
        let offset = self.stream.get_space(bytes.len())?;
        self.device
            .memory()
            .with_allocation_mut(allocation, |a| a.write(offset, bytes))??;
        Ok(offset)
    }

    /// Mark where the next submission's commands begin
    pub fn begin_submission(&mut self) -> usize {
        let offset = self.stream.used();
        self.start = self.stream.graphics_allocation().map(|allocation| SubmissionStart {
            allocation,
            offset,
            used: None,
        });
        offset
    }

    /// Attach kernel diagnostics to the next submission
    pub fn stage_diagnostics(&mut self, diagnostics: Arc<dyn KernelDiagnostics>) {
        self.completions.stage(diagnostics);
    }

    // =========================================================================
    // Submission
    // =========================================================================

    /// Submit the commands starting at `offset`
    ///
    /// `residency` lists allocations the commands reference. On failure
    /// the watermarks of the command buffers are restored and the status is
    /// returned without retrying.
    pub fn submit_batch_buffer(
        &mut self,
        offset: usize,
        residency: &[AllocationHandle],
        end_offset: Option<usize>,
        cooperative: bool,
    ) -> SubmissionStatus {
        let Some(current) = self.stream.graphics_allocation() else {
            log::warn!("submission on an uninitialized queue");
            return SubmissionStatus::Failed;
        };
        let start = self.start.take().unwrap_or(SubmissionStart {
            allocation: current,
            offset,
            used: None,
        });
        let split = start.allocation != current;

        if !self.client_registered {
            self.backend.register_client();
            self.client_registered = true;
        }

        let batch = BatchBuffer {
            allocation: start.allocation,
            start_offset: offset,
            used_size: if split {
                start.used.unwrap_or(start.offset)
            } else {
                self.stream.used()
            },
            end_offset,
            throttle: self.throttle(),
            partition_count: self.partition_count,
            num_clients: self.backend.num_clients(),
            cooperative,
        };

        if split {
            self.backend.make_resident(start.allocation);
        }
        self.backend.make_resident(current);
        for &allocation in residency {
            self.backend.make_resident(allocation);
        }

        let context = self.backend.context_id();
        let previous = self.backend.peek_task_count();
        let touched: Vec<AllocationHandle> = if split {
            alloc::vec![start.allocation, current]
        } else {
            alloc::vec![current]
        };
        let snapshots = match self.bump_watermarks(&touched, previous + 1, context) {
            Ok(snapshots) => snapshots,
            Err(err) => {
                log::warn!("{:?}: command buffer lost before submission: {}", context, err);
                self.completions.discard_staged();
                return SubmissionStatus::Failed;
            },
        };

        self.backend.set_active_partitions(self.partition_count);
        let residency_set = self.backend.residency_allocations();
        let status = self.backend.submit_batch_buffer(&batch, &residency_set);

        if !status.is_success() {
            self.restore_watermarks(&snapshots, context);
            self.completions.discard_staged();
            log::warn!("{:?}: submission of task {} failed: {:?}", context, previous + 1, status);
            return status;
        }

        let task_count = self.backend.peek_task_count();
        let flush_stamp = self.backend.obtain_current_flush_stamp();
        self.task_count = task_count;
        self.flush_stamp = flush_stamp;
        self.buffers.set_current_flush_stamp(task_count, flush_stamp);
        if split {
            self.buffers
                .set_flush_stamp_for(start.allocation, task_count, flush_stamp);
        }
        self.completions.commit(task_count, flush_stamp);

        log::trace!(
            "{:?}: task {} submitted ({} bytes from {:?}, stamp {})",
            context,
            task_count,
            batch.submitted_bytes(),
            batch.allocation,
            flush_stamp
        );
        SubmissionStatus::Success
    }

    fn throttle(&self) -> QueueThrottle {
        match self.desc.priority {
            QueuePriority::Low => QueueThrottle::Low,
            QueuePriority::Normal | QueuePriority::High => QueueThrottle::High,
        }
    }

    fn bump_watermarks(
        &self,
        allocations: &[AllocationHandle],
        task_count: TaskCount,
        context: ContextId,
    ) -> Result<Vec<(AllocationHandle, UsageSnapshot)>> {
        let memory = self.device.memory();
        let mut snapshots = Vec::with_capacity(allocations.len());
        for &allocation in allocations {
            let bumped = memory.with_allocation_mut(allocation, |a| {
                let snapshot = a.snapshot_usage(context);
                a.update_task_count(task_count, context);
                a.update_residency_task_count(task_count, context);
                snapshot
            });
            match bumped {
                Ok(snapshot) => snapshots.push((allocation, snapshot)),
                Err(err) => {
                    self.restore_watermarks(&snapshots, context);
                    return Err(err);
                },
            }
        }
        Ok(snapshots)
    }

    fn restore_watermarks(&self, snapshots: &[(AllocationHandle, UsageSnapshot)], context: ContextId) {
        let memory = self.device.memory();
        for &(allocation, snapshot) in snapshots {
            if let Err(err) = memory.with_allocation_mut(allocation, |a| a.restore_usage(context, snapshot)) {
                log::warn!("{:?}: watermark rollback of {:?} failed: {}", context, allocation, err);
            }
        }
    }

    /// Encode, submit and, in synchronous mode, wait for one execution
    ///
    /// Indirect allocations stay locked from the residency pass until the
    /// batch has been handed to the backend.
    pub fn execute(&mut self, commands: &[u8], desc: ExecuteDesc<'_>) -> Result<()> {
        self.reserve_linear_stream_size(commands.len())?.into_result()?;
        let offset = self.begin_submission();
        self.encode(commands)?;
        let end_offset = self.stream.used();

        let device = Arc::clone(&self.device);
        let indirect = match desc.unified_memory {
            Some(controls) => Some(handle_indirect_allocation_residency(
                &device,
                &*self.backend,
                &self.config,
                controls,
                desc.migrate,
            )?),
            None => None,
        };

        let status =
            self.submit_batch_buffer(offset, desc.residency, Some(end_offset), desc.cooperative);
        drop(indirect);
        status.into_result()?;

        if self.synchronous_mode() == QueueMode::Synchronous {
            self.synchronize(WAIT_FOREVER)?;
        }
        Ok(())
    }

    // =========================================================================
    // Synchronization
    // =========================================================================

    /// Wait for the last submission
    ///
    /// [`WAIT_FOREVER`] blocks until completion, through the kernel wait
    /// when enabled. A finite timeout polls and returns
    /// [`Error::NotReady`] once it elapses. A GPU hang returns
    /// [`Error::DeviceLost`] after post-sync housekeeping ran.
    pub fn synchronize(&mut self, timeout_us: u64) -> Result<()> {
        if timeout_us == WAIT_FOREVER && self.use_kmd_wait {
            let status = wait_for_task_count_with_kmd_notify_fallback(
                &*self.backend,
                &self.policy,
                self.task_count,
                self.flush_stamp,
                QueueThrottle::Medium,
            );
            return self.finish_wait(status);
        }

        self.synchronize_by_polling_for_task_count(timeout_us)
    }

    /// Poll for the last submission's task count
    pub fn synchronize_by_polling_for_task_count(&mut self, timeout_us: u64) -> Result<()> {
        let status = wait_for_completion_with_timeout(
            &*self.backend,
            &self.policy,
            WaitParams::from_timeout(timeout_us),
            self.task_count,
        );
        self.finish_wait(status)
    }

    fn finish_wait(&mut self, status: WaitStatus) -> Result<()> {
        match status {
            WaitStatus::Ready => {
                self.post_sync_operations(false);
                Ok(())
            },
            WaitStatus::NotReady => {
                log::warn!(
                    "{:?}: task {} not ready before timeout",
                    self.backend.context_id(),
                    self.task_count
                );
                Err(Error::NotReady)
            },
            WaitStatus::GpuHang => {
                self.post_sync_operations(true);
                Err(Error::DeviceLost)
            },
        }
    }

    fn post_sync_operations(&mut self, hang_detected: bool) {
        let completed = self.backend.completed_task_count();
        if let Some(trap) = self.completions.retire(completed, hang_detected) {
            log::error!("{:?}: {}", self.backend.context_id(), trap);
            self.device.trap_handler().abort(&trap);
        }

        if self.config.log_tracked_addresses {
            if let Some(debugger) = self.device.debugger() {
                debugger.print_tracked_addresses(self.backend.context_id());
            }
        }
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// Release the queue's resources
    ///
    /// Command buffers go back to the device reuse pool. Outstanding work
    /// must have been synchronized by the caller.
    pub fn destroy(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.client_registered {
            self.backend.unregister_client();
            self.client_registered = false;
        }

        self.stream.clear();
        self.start = None;
        self.buffers.destroy(&self.device);

        if self.debugger_notified {
            if let Some(debugger) = self.device.debugger() {
                debugger.notify_queue_destroyed(self.device.root_device_index());
            }
            self.debugger_notified = false;
        }

        if self.initialized {
            log::debug!(
                "queue {}:{} destroyed on {:?}",
                self.desc.ordinal,
                self.desc.index,
                self.backend.context_id()
            );
            self.initialized = false;
        }
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandQueue")
            .field("desc", &self.desc)
            .field("context", &self.backend.context_id())
            .field("caps", &self.caps)
            .field("task_count", &self.task_count)
            .field("flush_stamp", &self.flush_stamp)
            .field("stream", &self.stream)
            .field("buffers", &self.buffers)
            .field("completions", &self.completions)
            .field("flags", &self.flags)
            .field("partition_count", &self.partition_count)
            .finish()
    }
}

static_assertions::assert_impl_all!(CommandQueue: Send);
static_assertions::assert_impl_all!(Device: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffers::BufferSlot;
    use crate::sim::{SimBackend, SimCompletion, SimDebugger, SimDiagnostics, SimMemory};
    use basalt_core::{AllocationType, ByteSize, DeviceBitfield, GpuGeneration};
    use basalt_mem::{SvmEntry, UnifiedMemoryKinds};

    const STREAM_SIZE: usize = 4096;

    fn config() -> QueueConfig {
        QueueConfig::default().with_queue_cmd_buffer_size(ByteSize::from_bytes(STREAM_SIZE as u64))
    }

    fn device(generation: GpuGeneration) -> (Arc<Device>, Arc<SimMemory>) {
        let memory = SimMemory::new();
        let device = Arc::new(Device::builder(generation, memory.clone()).build());
        (device, memory)
    }

    fn create(device: &Arc<Device>, backend: &Arc<SimBackend>, config: QueueConfig) -> CommandQueue {
        CommandQueue::create(
            device.clone(),
            backend.clone(),
            QueueDesc::default(),
            QueueFlags::default(),
            config,
        )
        .expect("creates")
    }

    fn submit(queue: &mut CommandQueue, bytes: usize) -> SubmissionStatus {
        queue.reserve_linear_stream_size(bytes).expect("reserves");
        let offset = queue.begin_submission();
        queue.encode(&alloc::vec![0xa5; bytes]).expect("encodes");
        let end = queue.stream().used();
        queue.submit_batch_buffer(offset, &[], Some(end), false)
    }

    fn watermark(queue: &CommandQueue, allocation: AllocationHandle) -> Option<TaskCount> {
        let context = queue.backend().context_id();
        queue
            .device()
            .memory()
            .with_allocation(allocation, |a| a.task_count(context))
            .expect("live")
    }

    // =========================================================================
    // Creation
    // =========================================================================

    #[test]
    fn test_create_rejects_unknown_generation() {
        let (device, _) = device(GpuGeneration::Unknown);
        let backend = Arc::new(SimBackend::new());
        let result = CommandQueue::create(
            device,
            backend,
            QueueDesc::default(),
            QueueFlags::default(),
            config(),
        );
        assert!(matches!(result, Err(Error::Uninitialized)));
    }

    #[test]
    fn test_create_failure_pools_partial_buffers() {
        let (device, memory) = device(GpuGeneration::Gen12Lp);
        memory.fail_after(1);
        let backend = Arc::new(SimBackend::new());

        let result = CommandQueue::create(
            device.clone(),
            backend.clone(),
            QueueDesc::default(),
            QueueFlags::default(),
            config(),
        );
        assert!(matches!(result, Err(Error::OutOfDeviceMemory)));
        assert_eq!(device.memory().reuse_pool_len(), 1);
        assert!(!backend.resources_initialized());
    }

    #[test]
    fn test_create_failure_after_initialize_releases_buffers() {
        let (device, _) = device(GpuGeneration::Gen12Lp);
        let backend = Arc::new(SimBackend::new());
        backend.fail_initialize_resources();

        let result = CommandQueue::create(
            device.clone(),
            backend.clone(),
            QueueDesc::default(),
            QueueFlags::default(),
            config(),
        );
        assert!(matches!(result, Err(Error::OutOfHostMemory)));
        assert_eq!(device.memory().reuse_pool_len(), 2);
    }

    #[test]
    fn test_power_hint_reinitializes_context() {
        let memory = SimMemory::new();
        let device = Arc::new(
            Device::builder(GpuGeneration::Gen12Lp, memory)
                .power_hint(3)
                .build(),
        );
        let backend = Arc::new(SimBackend::new());
        let _queue = create(&device, &backend, config());

        assert_eq!(backend.power_hint(), 3);
        assert_eq!(backend.context_reinits(), 1);
        assert!(backend.resources_initialized());
        assert!(!backend.direct_submission_started());
    }

    #[test]
    fn test_direct_submission_started_when_supported() {
        let (device, _) = device(GpuGeneration::XeHpc);
        let backend = Arc::new(SimBackend::new());
        let _queue = create(&device, &backend, config());
        assert!(backend.direct_submission_started());
        assert_eq!(backend.context_reinits(), 0);
    }

    #[test]
    fn test_synchronous_mode_override() {
        let (device, _) = device(GpuGeneration::Gen12Lp);
        let backend = Arc::new(SimBackend::new());
        let desc = QueueDesc {
            mode: QueueMode::Asynchronous,
            ..QueueDesc::default()
        };

        let queue = CommandQueue::create(
            device.clone(),
            backend.clone(),
            desc,
            QueueFlags::default(),
            config().with_mode_override(QueueMode::Synchronous),
        )
        .expect("creates");
        assert_eq!(queue.synchronous_mode(), QueueMode::Synchronous);

        let plain = CommandQueue::create(device, backend, desc, QueueFlags::default(), config())
            .expect("creates");
        assert_eq!(plain.synchronous_mode(), QueueMode::Asynchronous);
    }

    #[test]
    fn test_flags_are_recorded() {
        let (device, _) = device(GpuGeneration::Gen12Lp);
        let backend = Arc::new(SimBackend::new());
        let queue = CommandQueue::create(
            device,
            backend,
            QueueDesc::default(),
            QueueFlags {
                copy_only: true,
                internal: true,
                immediate: true,
            },
            config(),
        )
        .expect("creates");
        assert!(queue.is_copy_only() && queue.is_internal() && queue.is_immediate());
    }

    // =========================================================================
    // Partitions
    // =========================================================================

    #[test]
    fn test_partitions_follow_backend() {
        let (device, _) = device(GpuGeneration::XeHpc);
        let backend = Arc::new(SimBackend::new().with_device_bitfield(DeviceBitfield(0b11)));
        let mut queue = create(&device, &backend, config());

        assert_eq!(queue.active_sub_devices(), 2);
        assert_eq!(queue.partition_count(), 2);

        assert_eq!(submit(&mut queue, 64), SubmissionStatus::Success);
        assert_eq!(backend.submissions()[0].batch.partition_count, 2);
    }

    #[test]
    fn test_internal_queue_keeps_one_partition() {
        let (device, _) = device(GpuGeneration::XeHpc);
        let backend = Arc::new(SimBackend::new().with_device_bitfield(DeviceBitfield(0b11)));
        let queue = CommandQueue::create(
            device,
            backend,
            QueueDesc::default(),
            QueueFlags {
                internal: true,
                ..QueueFlags::default()
            },
            config(),
        )
        .expect("creates");
        assert_eq!(queue.active_sub_devices(), 2);
        assert_eq!(queue.partition_count(), 1);
    }

    #[test]
    fn test_partitions_clamped_without_capability() {
        let (device, _) = device(GpuGeneration::Gen12Lp);
        let backend = Arc::new(SimBackend::new().with_device_bitfield(DeviceBitfield(0b11)));
        let queue = create(&device, &backend, config());
        assert_eq!(queue.partition_count(), 1);
    }

    // =========================================================================
    // Encoding and buffer switching
    // =========================================================================

    #[test]
    fn test_reserve_one_past_capacity_switches_once() {
        let (device, _) = device(GpuGeneration::Gen12Lp);
        let backend = Arc::new(SimBackend::new());
        let mut queue = create(&device, &backend, config());

        assert_eq!(queue.reserve_linear_stream_size(STREAM_SIZE + 1), Ok(WaitStatus::Ready));
        assert_eq!(queue.buffers().switch_count(), 1);
        assert_eq!(queue.buffers().active_slot(), BufferSlot::Second);
        assert_eq!(queue.stream().used(), 0);
        assert_eq!(
            queue.stream().graphics_allocation(),
            queue.buffers().buffer(BufferSlot::Second)
        );
    }

    #[test]
    fn test_reserve_within_capacity_does_not_switch() {
        let (device, _) = device(GpuGeneration::Gen12Lp);
        let backend = Arc::new(SimBackend::new());
        let mut queue = create(&device, &backend, config());

        assert_eq!(queue.reserve_linear_stream_size(STREAM_SIZE), Ok(WaitStatus::Ready));
        assert_eq!(queue.buffers().switch_count(), 0);
    }

    #[test]
    fn test_reserve_on_uninitialized_queue() {
        let (device, _) = device(GpuGeneration::Gen12Lp);
        let backend = Arc::new(SimBackend::new());
        let mut queue =
            CommandQueue::new(device, backend, QueueDesc::default(), config()).expect("supported");
        assert_eq!(queue.reserve_linear_stream_size(1), Err(Error::Uninitialized));
        assert_eq!(
            queue.submit_batch_buffer(0, &[], None, false),
            SubmissionStatus::Failed
        );
    }

    #[test]
    fn test_overflow_relocates_without_data_loss() {
        let (device, _) = device(GpuGeneration::Gen12Lp);
        let backend = Arc::new(SimBackend::new());
        let mut queue = create(&device, &backend, config());

        queue.encode(&[1; 3000]).expect("fits");
        let offset = queue.encode(&[2; 3000]).expect("switches");

        assert_eq!(offset, 0);
        assert_eq!(queue.stream().used(), 3000);

        let second = queue.buffers().buffer(BufferSlot::Second).expect("initialized");
        let first = queue.buffers().buffer(BufferSlot::First).expect("initialized");
        let memory = device.memory();
        assert!(memory
            .with_allocation(second, |a| a.underlying_buffer()[..3000].iter().all(|&b| b == 2))
            .expect("live"));
        assert!(memory
            .with_allocation(first, |a| a.underlying_buffer()[..3000].iter().all(|&b| b == 1))
            .expect("live"));
    }

    #[test]
    fn test_switch_back_waits_for_prior_submission() {
        let (device, _) = device(GpuGeneration::Gen12Lp);
        let backend = Arc::new(SimBackend::new());
        let mut queue = create(&device, &backend, config());

        assert_eq!(submit(&mut queue, 3000), SubmissionStatus::Success);
        assert_eq!(submit(&mut queue, 3000), SubmissionStatus::Success);
        assert_eq!(backend.kmd_waits(), 0);
        assert_eq!(backend.completed(), 0);

        // back into the first buffer: task 1 must be complete first
        queue.encode(&[0; 3000]).expect("switches back");
        assert_eq!(queue.buffers().active_slot(), BufferSlot::First);
        assert_eq!(backend.kmd_waits(), 1);
        assert_eq!(backend.completed(), 1);
    }

    #[test]
    fn test_switch_into_hung_buffer_reports_device_lost() {
        let (device, _) = device(GpuGeneration::Gen12Lp);
        let backend = Arc::new(SimBackend::new());
        let mut queue = create(&device, &backend, config());

        assert_eq!(submit(&mut queue, 3000), SubmissionStatus::Success);
        assert_eq!(submit(&mut queue, 3000), SubmissionStatus::Success);
        backend.inject_hang();

        assert_eq!(queue.encode(&[0; 3000]), Err(Error::DeviceLost));
    }

    // =========================================================================
    // Submission
    // =========================================================================

    #[test]
    fn test_task_count_follows_submissions() {
        let (device, _) = device(GpuGeneration::Gen12Lp);
        let backend = Arc::new(SimBackend::new());
        let mut queue = create(&device, &backend, config());

        for k in 1..=5 {
            assert_eq!(submit(&mut queue, 256), SubmissionStatus::Success);
            assert_eq!(queue.task_count(), k);
            assert_eq!(queue.synchronize(0), Err(Error::NotReady));

            backend.complete_up_to(k);
            assert_eq!(queue.synchronize(0), Ok(()));
        }
    }

    #[test]
    fn test_submission_bumps_watermarks() {
        let (device, _) = device(GpuGeneration::Gen12Lp);
        let backend = Arc::new(SimBackend::new());
        let mut queue = create(&device, &backend, config());
        let buffer = queue.stream().graphics_allocation().expect("bound");

        assert_eq!(watermark(&queue, buffer), None);
        assert_eq!(submit(&mut queue, 64), SubmissionStatus::Success);
        assert_eq!(watermark(&queue, buffer), Some(1));
        assert!(backend.is_resident(buffer));

        let batch = backend.submissions()[0].batch;
        assert_eq!(batch.allocation, buffer);
        assert_eq!(batch.start_offset, 0);
        assert_eq!(batch.submitted_bytes(), 64);
        assert_eq!(batch.throttle, QueueThrottle::High);
        assert_eq!(queue.buffers().current_flush_stamp(), (1, 1));
    }

    #[test]
    fn test_failed_submission_rolls_back_watermark() {
        let (device, _) = device(GpuGeneration::Gen12Lp);
        let backend = Arc::new(SimBackend::new());
        let mut queue = create(&device, &backend, config());
        let buffer = queue.stream().graphics_allocation().expect("bound");

        assert_eq!(submit(&mut queue, 64), SubmissionStatus::Success);
        let stamp = queue.buffers().current_flush_stamp();

        backend.fail_next_submission(SubmissionStatus::OutOfMemory);
        queue.stage_diagnostics(SimDiagnostics::new());
        assert_eq!(submit(&mut queue, 64), SubmissionStatus::OutOfMemory);

        assert_eq!(watermark(&queue, buffer), Some(1));
        assert_eq!(queue.task_count(), 1);
        assert_eq!(queue.buffers().current_flush_stamp(), stamp);
        assert_eq!(queue.pending_completions(), 0);
    }

    #[test]
    fn test_failed_first_submission_leaves_buffer_unused() {
        let (device, _) = device(GpuGeneration::Gen12Lp);
        let backend = Arc::new(SimBackend::new());
        let mut queue = create(&device, &backend, config());
        let buffer = queue.stream().graphics_allocation().expect("bound");

        backend.fail_next_submission(SubmissionStatus::Unsupported);
        assert_eq!(submit(&mut queue, 64), SubmissionStatus::Unsupported);
        assert_eq!(watermark(&queue, buffer), None);
        assert_eq!(
            SubmissionStatus::Unsupported.into_result(),
            Err(Error::Unsupported)
        );
    }

    #[test]
    fn test_split_submission_keeps_start_resident() {
        let (device, _) = device(GpuGeneration::Gen12Lp);
        let backend = Arc::new(SimBackend::new());
        let mut queue = create(&device, &backend, config());
        let first = queue.buffers().buffer(BufferSlot::First).expect("initialized");
        let second = queue.buffers().buffer(BufferSlot::Second).expect("initialized");

        let offset = queue.begin_submission();
        queue.encode(&[0; 3000]).expect("fits");
        queue.encode(&[0; 3000]).expect("switches");
        let end = queue.stream().used();
        assert_eq!(
            queue.submit_batch_buffer(offset, &[], Some(end), false),
            SubmissionStatus::Success
        );

        let submission = &backend.submissions()[0];
        assert_eq!(submission.batch.allocation, first);
        assert_eq!(submission.batch.used_size, 3000);
        assert!(submission.residency.contains(&first));
        assert!(submission.residency.contains(&second));
        assert_eq!(watermark(&queue, first), Some(1));
        assert_eq!(watermark(&queue, second), Some(1));
    }

    #[test]
    fn test_failed_split_submission_rolls_back_both_buffers() {
        let (device, _) = device(GpuGeneration::Gen12Lp);
        let backend = Arc::new(SimBackend::new());
        let mut queue = create(&device, &backend, config());
        let first = queue.buffers().buffer(BufferSlot::First).expect("initialized");
        let second = queue.buffers().buffer(BufferSlot::Second).expect("initialized");

        assert_eq!(submit(&mut queue, 64), SubmissionStatus::Success);
        assert_eq!(queue.buffers().flush_id(BufferSlot::First), (1, 1));

        let offset = queue.begin_submission();
        queue.encode(&[0; 3000]).expect("fits");
        queue.encode(&[0; 3000]).expect("switches");
        assert_eq!(queue.buffers().active_slot(), BufferSlot::Second);

        backend.fail_next_submission(SubmissionStatus::OutOfHostMemory);
        queue.stage_diagnostics(SimDiagnostics::new());
        let end = queue.stream().used();
        assert_eq!(
            queue.submit_batch_buffer(offset, &[], Some(end), false),
            SubmissionStatus::OutOfHostMemory
        );

        assert_eq!(watermark(&queue, first), Some(1));
        assert_eq!(watermark(&queue, second), None);
        assert_eq!(queue.buffers().flush_id(BufferSlot::First), (1, 1));
        assert_eq!(queue.buffers().flush_id(BufferSlot::Second), (0, 0));
        assert_eq!(queue.task_count(), 1);
        assert_eq!(queue.pending_completions(), 0);
    }

    #[test]
    fn test_caller_residency_is_submitted() {
        let (device, _) = device(GpuGeneration::Gen12Lp);
        let backend = Arc::new(SimBackend::new());
        let mut queue = create(&device, &backend, config());
        let kernel_heap = device
            .allocate_command_buffer(ByteSize::KIB_64)
            .expect("allocates");

        let offset = queue.begin_submission();
        queue.encode(&[0; 64]).expect("fits");
        assert_eq!(
            queue.submit_batch_buffer(offset, &[kernel_heap], None, true),
            SubmissionStatus::Success
        );

        let submission = &backend.submissions()[0];
        assert!(submission.residency.contains(&kernel_heap));
        assert!(submission.batch.cooperative);
    }

    #[test]
    fn test_client_registered_once() {
        let (device, _) = device(GpuGeneration::Gen12Lp);
        let backend = Arc::new(SimBackend::new());
        let mut queue = create(&device, &backend, config());

        assert_eq!(backend.num_clients(), 0);
        assert_eq!(submit(&mut queue, 64), SubmissionStatus::Success);
        assert_eq!(submit(&mut queue, 64), SubmissionStatus::Success);
        assert_eq!(backend.num_clients(), 1);
        assert_eq!(backend.submissions()[0].batch.num_clients, 1);

        queue.destroy();
        assert_eq!(backend.num_clients(), 0);
    }

    // =========================================================================
    // Synchronization
    // =========================================================================

    #[test]
    fn test_zero_timeout_before_completion_is_not_ready() {
        let (device, _) = device(GpuGeneration::Gen12Lp);
        let backend = Arc::new(SimBackend::new());
        let mut queue = create(&device, &backend, config());

        assert_eq!(submit(&mut queue, 64), SubmissionStatus::Success);
        assert_eq!(queue.synchronize(0), Err(Error::NotReady));
        assert_eq!(backend.completed(), 0);
    }

    #[test]
    fn test_synchronize_without_submissions_is_ready() {
        let (device, _) = device(GpuGeneration::Gen12Lp);
        let backend = Arc::new(SimBackend::new());
        let mut queue = create(&device, &backend, config().with_kmd_wait(true));
        assert_eq!(queue.synchronize(WAIT_FOREVER), Ok(()));
        assert_eq!(queue.synchronize(0), Ok(()));
    }

    #[test]
    fn test_infinite_synchronize_polls_by_default() {
        let (device, _) = device(GpuGeneration::Gen12Lp);
        let backend = Arc::new(SimBackend::new());
        backend.set_completion(SimCompletion::AfterPolls(4));
        let mut queue = create(&device, &backend, config());

        assert_eq!(submit(&mut queue, 64), SubmissionStatus::Success);
        assert_eq!(queue.synchronize(WAIT_FOREVER), Ok(()));
        assert_eq!(backend.kmd_waits(), 0);
    }

    #[test]
    fn test_infinite_synchronize_uses_kernel_wait() {
        let (device, _) = device(GpuGeneration::Gen12Lp);
        let backend = Arc::new(SimBackend::new());
        let mut queue = create(&device, &backend, config().with_kmd_wait(true));

        assert_eq!(submit(&mut queue, 64), SubmissionStatus::Success);
        assert_eq!(queue.synchronize(WAIT_FOREVER), Ok(()));
        assert_eq!(backend.kmd_waits(), 1);
        assert_eq!(backend.completed(), 1);
    }

    #[test]
    fn test_kernel_wait_targets_last_submission_after_switch() {
        let (device, _) = device(GpuGeneration::Gen12Lp);
        let backend = Arc::new(SimBackend::new());
        let mut queue = create(&device, &backend, config().with_kmd_wait(true));
        let diagnostics = SimDiagnostics::new();

        queue.stage_diagnostics(diagnostics.clone());
        assert_eq!(submit(&mut queue, 64), SubmissionStatus::Success);
        assert_eq!(
            queue.reserve_linear_stream_size(STREAM_SIZE),
            Ok(WaitStatus::Ready)
        );
        assert_eq!(queue.buffers().active_slot(), BufferSlot::Second);
        assert_eq!(backend.completed(), 0);

        assert_eq!(queue.synchronize(WAIT_FOREVER), Ok(()));
        assert_eq!(backend.kmd_waits(), 1);
        assert_eq!(backend.completed(), 1);
        assert_eq!(diagnostics.flushes(), 1);
        assert_eq!(queue.pending_completions(), 0);
    }

    #[test]
    fn test_device_lost_still_runs_housekeeping() {
        let (device, _) = device(GpuGeneration::Gen12Lp);
        let backend = Arc::new(SimBackend::new());
        let mut queue = create(&device, &backend, config());
        let diagnostics = SimDiagnostics::new();

        queue.stage_diagnostics(diagnostics.clone());
        assert_eq!(submit(&mut queue, 64), SubmissionStatus::Success);
        backend.inject_hang();

        assert_eq!(queue.synchronize(WAIT_FOREVER), Err(Error::DeviceLost));
        assert_eq!(diagnostics.flushes(), 1);
        assert!(diagnostics.last_flush_saw_hang());
        assert_eq!(queue.pending_completions(), 0);
    }

    #[test]
    fn test_printf_flushed_once_per_submission() {
        let (device, _) = device(GpuGeneration::Gen12Lp);
        let backend = Arc::new(SimBackend::new());
        let mut queue = create(&device, &backend, config());
        let diagnostics = SimDiagnostics::new();

        queue.stage_diagnostics(diagnostics.clone());
        assert_eq!(submit(&mut queue, 64), SubmissionStatus::Success);
        backend.complete_all();

        assert_eq!(queue.synchronize(0), Ok(()));
        assert_eq!(queue.synchronize(0), Ok(()));
        assert_eq!(diagnostics.flushes(), 1);
        assert!(!diagnostics.last_flush_saw_hang());
    }

    #[test]
    fn test_not_ready_skips_housekeeping() {
        let (device, _) = device(GpuGeneration::Gen12Lp);
        let backend = Arc::new(SimBackend::new());
        let mut queue = create(&device, &backend, config());
        let diagnostics = SimDiagnostics::new();

        queue.stage_diagnostics(diagnostics.clone());
        assert_eq!(submit(&mut queue, 64), SubmissionStatus::Success);
        assert_eq!(queue.synchronize(0), Err(Error::NotReady));
        assert_eq!(diagnostics.flushes(), 0);
        assert_eq!(queue.pending_completions(), 1);
    }

    #[test]
    #[should_panic(expected = "GPU kernel assertion")]
    fn test_kernel_assertion_aborts() {
        let (device, _) = device(GpuGeneration::Gen12Lp);
        let backend = Arc::new(SimBackend::new());
        let mut queue = create(&device, &backend, config());

        queue.stage_diagnostics(SimDiagnostics::with_trap("reduce", "group_id < 64"));
        assert_eq!(submit(&mut queue, 64), SubmissionStatus::Success);
        backend.complete_all();
        let _ = queue.synchronize(0);
    }

    // =========================================================================
    // Debugger
    // =========================================================================

    #[test]
    fn test_debugger_notifications() {
        let debugger = SimDebugger::new();
        let device = Arc::new(
            Device::builder(GpuGeneration::Gen12Lp, SimMemory::new())
                .debugger(debugger.clone())
                .build(),
        );
        let backend = Arc::new(SimBackend::new());

        let mut queue = create(&device, &backend, config().with_tracked_address_logging(true));
        assert_eq!(debugger.counts(), (1, 0, 0));

        assert_eq!(queue.synchronize(0), Ok(()));
        assert_eq!(debugger.counts(), (1, 0, 1));

        queue.destroy();
        assert_eq!(debugger.counts(), (1, 1, 1));
    }

    #[test]
    fn test_internal_queue_hidden_from_debugger() {
        let debugger = SimDebugger::new();
        let device = Arc::new(
            Device::builder(GpuGeneration::Gen12Lp, SimMemory::new())
                .debugger(debugger.clone())
                .build(),
        );
        let backend = Arc::new(SimBackend::new());

        let queue = CommandQueue::create(
            device,
            backend,
            QueueDesc::default(),
            QueueFlags {
                internal: true,
                ..QueueFlags::default()
            },
            config(),
        )
        .expect("creates");
        drop(queue);
        assert_eq!(debugger.counts(), (0, 0, 0));
    }

    // =========================================================================
    // Reuse across queues
    // =========================================================================

    #[test]
    fn test_command_buffers_reused_across_queues() {
        let (device, memory) = device(GpuGeneration::Gen12Lp);
        let backend = Arc::new(SimBackend::new());

        let queue = create(&device, &backend, config());
        assert_eq!(memory.allocations(), 2);
        let mut first: Vec<_> = [BufferSlot::First, BufferSlot::Second]
            .iter()
            .filter_map(|&slot| queue.buffers().buffer(slot))
            .collect();
        queue.destroy();
        assert_eq!(device.memory().reuse_pool_len(), 2);

        let queue = create(&device, &backend, config());
        assert_eq!(memory.allocations(), 2);
        let mut second: Vec<_> = [BufferSlot::First, BufferSlot::Second]
            .iter()
            .filter_map(|&slot| queue.buffers().buffer(slot))
            .collect();

        first.sort();
        second.sort();
        assert_eq!(first, second);
        assert_eq!(device.memory().reuse_stats().hits, 2);
        assert_eq!(device.memory().reuse_pool_len(), 0);
    }

    #[test]
    fn test_drop_returns_buffers_to_pool() {
        let (device, _) = device(GpuGeneration::Gen12Lp);
        let backend = Arc::new(SimBackend::new());
        drop(create(&device, &backend, config()));
        assert_eq!(device.memory().reuse_pool_len(), 2);
    }

    // =========================================================================
    // Execute
    // =========================================================================

    fn register_shared(device: &Device) -> SvmEntry {
        let allocation = device
            .allocate_command_buffer(ByteSize::KIB_64)
            .expect("allocates");
        let gpu_addr = device
            .memory()
            .with_allocation(allocation, |a| a.gpu_addr())
            .expect("live");
        let entry = SvmEntry {
            allocation,
            gpu_addr,
            size: ByteSize::KIB_64,
            memory_kind: UnifiedMemoryKinds::SHARED,
            allocation_kind: AllocationType::SvmGpu,
        };
        device.svm().register(entry);
        entry
    }

    #[test]
    fn test_execute_synchronous_waits() {
        let (device, _) = device(GpuGeneration::Gen12Lp);
        let backend = Arc::new(SimBackend::new());
        backend.set_completion(SimCompletion::AfterPolls(3));
        let mut queue = create(
            &device,
            &backend,
            config().with_mode_override(QueueMode::Synchronous),
        );

        queue
            .execute(&[0; 128], ExecuteDesc::default())
            .expect("executes");
        assert_eq!(queue.task_count(), 1);
        assert_eq!(backend.completed(), 1);
    }

    #[test]
    fn test_execute_makes_indirect_allocations_resident() {
        let (device, _) = device(GpuGeneration::Gen12Lp);
        let backend = Arc::new(SimBackend::new());
        let mut queue = create(&device, &backend, config());
        let entry = register_shared(&device);

        let desc = ExecuteDesc {
            unified_memory: Some(UnifiedMemoryControls::all()),
            ..ExecuteDesc::default()
        };
        queue.execute(&[0; 128], desc).expect("executes");

        assert!(backend.submissions()[0].residency.contains(&entry.allocation));
        // registry released once the batch is issued
        assert_eq!(device.svm().len(), 1);
    }

    #[test]
    fn test_execute_reports_submission_failure() {
        let (device, _) = device(GpuGeneration::Gen12Lp);
        let backend = Arc::new(SimBackend::new());
        let mut queue = create(&device, &backend, config());

        backend.fail_next_submission(SubmissionStatus::OutOfHostMemory);
        assert_eq!(
            queue.execute(&[0; 128], ExecuteDesc::default()),
            Err(Error::OutOfHostMemory)
        );
        assert_eq!(queue.task_count(), 0);
    }
}

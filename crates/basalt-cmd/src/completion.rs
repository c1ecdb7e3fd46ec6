//! # Completion Waits
//!
//! Two ways of waiting for a task count:
//!
//! - **Polling**: read the completion tag until it reaches the target,
//!   checking for a GPU hang periodically and honoring an optional timeout.
//! - **Kernel-assisted**: block in the kernel driver on a flush stamp, then
//!   confirm through polling. Used when the backend can notify.
//!
//! Both return a [`WaitStatus`]. Neither touches queue state.

use basalt_core::{
    BackendCaps, CommandBackend, FlushStamp, QueueConfig, QueueThrottle, TaskCount, WaitParams,
    WaitStatus,
};

// =============================================================================
// WAIT POLICY
// =============================================================================

/// How a queue waits, fixed at queue creation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    /// Interval between two hang queries while polling
    pub hang_check_period_ns: u64,
    /// Backend can block on flush stamps
    pub kmd_notify: bool,
}

impl WaitPolicy {
    /// Policy for a queue configuration on a backend with `caps`
    pub fn new(config: &QueueConfig, caps: BackendCaps) -> Self {
        Self {
            hang_check_period_ns: config.gpu_hang_check_period_us.saturating_mul(1_000),
            kmd_notify: caps.contains(BackendCaps::KMD_NOTIFY),
        }
    }
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self::new(&QueueConfig::default(), BackendCaps::empty())
    }
}

// =============================================================================
// WAITS
// =============================================================================

/// Poll until `task_count` completes, a hang is detected or the timeout
/// in `params` elapses
///
/// The hang check runs on the first iteration and then once per
/// `hang_check_period_ns`. A zero timeout makes this a single query.
pub fn wait_for_completion_with_timeout(
    backend: &dyn CommandBackend,
    policy: &WaitPolicy,
    params: WaitParams,
    task_count: TaskCount,
) -> WaitStatus {
    let start = backend.time_ns();
    let timeout_ns = params.timeout_us.saturating_mul(1_000);
    let mut next_hang_check = start;

    loop {
        if backend.completed_task_count() >= task_count {
            return WaitStatus::Ready;
        }

        let now = backend.time_ns();
        if now >= next_hang_check {
            if backend.is_gpu_hang_detected() {
                log::error!(
                    "{:?}: GPU hang while waiting for task {}",
                    backend.context_id(),
                    task_count
                );
                return WaitStatus::GpuHang;
            }
            next_hang_check = now.saturating_add(policy.hang_check_period_ns);
        }

        if params.enable_timeout && now.saturating_sub(start) >= timeout_ns {
            return WaitStatus::NotReady;
        }

        backend.pause();
    }
}

/// Wait for `task_count` with kernel notification, falling back to
/// polling
///
/// A zero flush stamp means nothing was flushed under it: the kernel wait
/// is skipped. The result is always confirmed against the completion tag.
pub fn wait_for_task_count_with_kmd_notify_fallback(
    backend: &dyn CommandBackend,
    policy: &WaitPolicy,
    task_count: TaskCount,
    flush_stamp: FlushStamp,
    throttle: QueueThrottle,
) -> WaitStatus {
    if backend.completed_task_count() >= task_count {
        return WaitStatus::Ready;
    }

    if policy.kmd_notify && flush_stamp != 0 {
        if backend.wait_for_flush_stamp(flush_stamp, throttle) == WaitStatus::GpuHang {
            log::error!(
                "{:?}: GPU hang in kernel wait on stamp {}",
                backend.context_id(),
                flush_stamp
            );
            return WaitStatus::GpuHang;
        }
    }

    wait_for_completion_with_timeout(backend, policy, WaitParams::forever(), task_count)
}

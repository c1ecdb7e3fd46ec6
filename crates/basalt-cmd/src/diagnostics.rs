//! # Post-Sync Diagnostics
//!
//! Kernels may write printf output and assertion state into buffers the
//! host reads after the work completes. Each submission carries a
//! [`CompletionRecord`] listing the diagnostics of the kernels it ran.
//! Retiring a record flushes their printf output and collects the first
//! assertion failure.
//!
//! ```text
//!   stage() ──▶ staged ──commit(task, stamp)──▶ records ──retire(completed)──▶ printf
//!                  │                                                        └─▶ assert trap
//!                  └── discard() on failed submission
//! ```

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use basalt_core::{AssertTrap, FlushStamp, KernelDiagnostics, TaskCount, TrapHandler};

// =============================================================================
// COMPLETION RECORD
// =============================================================================

/// Diagnostics owed by one submission
pub struct CompletionRecord {
    /// Task count the submission completes at
    pub task_count: TaskCount,
    /// Flush stamp of the submission
    pub flush_stamp: FlushStamp,
    diagnostics: Vec<Arc<dyn KernelDiagnostics>>,
}

impl CompletionRecord {
    /// Number of kernels with diagnostics
    pub fn len(&self) -> usize {
        self.diagnostics.len()
    }

    /// Whether no kernel in the submission has diagnostics
    pub fn is_empty(&self) -> bool {
        self.diagnostics.is_empty()
    }
}

impl fmt::Debug for CompletionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionRecord")
            .field("task_count", &self.task_count)
            .field("flush_stamp", &self.flush_stamp)
            .field("diagnostics", &self.diagnostics.len())
            .finish()
    }
}

// =============================================================================
// COMPLETION LOG
// =============================================================================

/// Outstanding completion records of a queue, oldest first
#[derive(Default)]
pub struct CompletionLog {
    staged: Vec<Arc<dyn KernelDiagnostics>>,
    records: VecDeque<CompletionRecord>,
}

impl CompletionLog {
    /// Create an empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach diagnostics to the next submission
    pub fn stage(&mut self, diagnostics: Arc<dyn KernelDiagnostics>) {
        self.staged.push(diagnostics);
    }

    /// Bind staged diagnostics to a submitted task count
    pub fn commit(&mut self, task_count: TaskCount, flush_stamp: FlushStamp) {
        if self.staged.is_empty() {
            return;
        }
        let diagnostics = core::mem::take(&mut self.staged);
        log::trace!(
            "task {}: {} kernels with diagnostics",
            task_count,
            diagnostics.len()
        );
        self.records.push_back(CompletionRecord {
            task_count,
            flush_stamp,
            diagnostics,
        });
    }

    /// Drop staged diagnostics of a submission that never reached the GPU
    pub fn discard_staged(&mut self) {
        self.staged.clear();
    }

    /// Retire every record at or below `completed`, every record when the
    /// GPU hung
    ///
    /// Printf output of all retired kernels is flushed before the first
    /// assertion failure, if any, is returned.
    pub fn retire(&mut self, completed: TaskCount, hang_detected: bool) -> Option<AssertTrap> {
        let mut trap = None;

        while let Some(record) = self.records.front() {
            if !hang_detected && record.task_count > completed {
                break;
            }
            let Some(record) = self.records.pop_front() else {
                break;
            };
            log::trace!("retiring completion record for task {}", record.task_count);

            for diagnostics in &record.diagnostics {
                diagnostics.flush_printf(hang_detected);
            }
            if trap.is_none() {
                trap = record
                    .diagnostics
                    .iter()
                    .find_map(|diagnostics| diagnostics.take_assert_trap());
            }
        }

        trap
    }

    /// Number of outstanding records
    pub fn pending(&self) -> usize {
        self.records.len()
    }

    /// Number of staged diagnostics
    pub fn staged(&self) -> usize {
        self.staged.len()
    }
}

impl fmt::Debug for CompletionLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionLog")
            .field("staged", &self.staged.len())
            .field("records", &self.records)
            .finish()
    }
}

// =============================================================================
// TRAP HANDLERS
// =============================================================================

/// Trap handler that logs the assertion and panics
#[derive(Debug, Clone, Copy, Default)]
pub struct PanicTrapHandler;

impl TrapHandler for PanicTrapHandler {
    fn abort(&self, trap: &AssertTrap) -> ! {
        log::error!("{}", trap);
        panic!("GPU kernel assertion: {}", trap);
    }
}

/// Trap handler that logs the assertion and aborts the process
#[cfg(feature = "std")]
#[derive(Debug, Clone, Copy, Default)]
pub struct AbortTrapHandler;

#[cfg(feature = "std")]
impl TrapHandler for AbortTrapHandler {
    fn abort(&self, trap: &AssertTrap) -> ! {
        log::error!("{}", trap);
        std::process::abort()
    }
}

//! Per-zone submission tracking
//!
//! The coordinator appends a [`TaskHandle`] to the zone's tracker for every
//! batch it submits, strictly in submission order. The updater drains
//! completed handles from the head, which is what recovers per-zone
//! submission order from the pool's completion-order stream.

use crate::reencrypt::batch::ReencryptionTask;
use crate::namespace::inode::ZoneId;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Result slot of one submitted task
#[derive(Debug)]
pub enum TaskOutcome {
    /// The task ran; the batch (and failure count) are ready to apply
    Completed(ReencryptionTask),

    /// The task was canceled while still queued and never ran
    Canceled {
        zone_id: ZoneId,
        /// Records in the batch that never reached the KMS
        records: u64,
    },
}

#[derive(Debug, Default)]
struct TaskState {
    canceled: AtomicBool,
    outcome: Mutex<Option<TaskOutcome>>,
}

/// Shared handle to one submitted task. The coordinator holds it in the
/// zone tracker; the pool worker fills the outcome; the updater takes it.
#[derive(Debug, Clone, Default)]
pub struct TaskHandle {
    state: Arc<TaskState>,
}

impl TaskHandle {
    /// Create an unfinished handle
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. A worker that dequeues a canceled task skips
    /// the KMS call; a task already running completes normally and its
    /// result is discarded at apply time.
    pub fn cancel(&self) {
        self.state.canceled.store(true, Ordering::SeqCst);
    }

    /// True if cancellation was requested
    pub fn is_canceled(&self) -> bool {
        self.state.canceled.load(Ordering::SeqCst)
    }

    /// Fill the outcome. Called exactly once by the pool worker.
    pub fn complete(&self, outcome: TaskOutcome) {
        *self.state.outcome.lock() = Some(outcome);
    }

    /// True once the outcome has been filled
    pub fn is_done(&self) -> bool {
        self.state.outcome.lock().is_some()
    }

    /// Take the outcome, leaving the slot empty
    pub fn take_outcome(&self) -> Option<TaskOutcome> {
        self.state.outcome.lock().take()
    }
}

/// Ordered list of outstanding tasks for one zone, plus the
/// submission-done marker
#[derive(Debug, Default)]
pub struct ZoneSubmissionTracker {
    tasks: VecDeque<TaskHandle>,
    submission_done: bool,
}

impl ZoneSubmissionTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a task in submission order
    pub fn add_task(&mut self, handle: TaskHandle) {
        self.tasks.push_back(handle);
    }

    /// Oldest outstanding task, if any
    pub fn front(&self) -> Option<&TaskHandle> {
        self.tasks.front()
    }

    /// Remove and return the oldest outstanding task
    pub fn pop_front(&mut self) -> Option<TaskHandle> {
        self.tasks.pop_front()
    }

    /// Cancel every outstanding task
    pub fn cancel_all_tasks(&mut self) {
        for task in &self.tasks {
            task.cancel();
        }
    }

    /// Mark that the coordinator has submitted the zone's last batch
    pub fn set_submission_done(&mut self) {
        self.submission_done = true;
    }

    /// True once the last batch has been submitted
    pub fn is_submission_done(&self) -> bool {
        self.submission_done
    }

    /// Clear all state for a fresh scan of the zone
    pub fn reset(&mut self) {
        self.cancel_all_tasks();
        self.tasks.clear();
        self.submission_done = false;
    }

    /// Outstanding task count
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// True if no tasks are outstanding
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// The handler-mutex-guarded map of zone id to tracker
pub type Submissions = HashMap<ZoneId, ZoneSubmissionTracker>;

//! Partition entries.
//!
//! A [`SyncTask`] is one partition of one enqueue: a byte window of the
//! parent tensor, the remaining itinerary it must traverse, and the shared
//! completion state of its sibling set. Tasks are owned by exactly one
//! scheduled queue at a time; handing the boxed task to the next queue is
//! the only way a stage releases it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::debug;

use gradsync_types::dtype::TensorDtype;
use gradsync_types::error::{Result, Status, SyncError};
use gradsync_types::stage::StageId;

use crate::capability::{DeviceTensor, ReadyEvent};
use crate::context::TensorContext;

/// User completion callback, shared by every sibling partition and invoked
/// exactly once per enqueue.
pub type StatusCallback = Arc<dyn Fn(Status) + Send + Sync>;

/// One partition traversing the pipeline.
#[derive(Clone)]
pub struct SyncTask {
    /// Parent tensor name, suffixed `_{i}` for the i-th partition.
    pub name: String,
    pub context: Arc<TensorContext>,
    /// Globally unique partition key, assigned from the parent's
    /// `key_list[i]` by the enqueue step.
    pub key: u64,
    /// Byte window within the tensor and its staging buffer.
    pub offset: usize,
    pub len: usize,
    pub tensor: Option<Arc<dyn DeviceTensor>>,
    pub output: Option<Arc<dyn DeviceTensor>>,
    pub device: i32,
    pub priority: i32,
    pub version: u64,
    pub ready_event: Option<Arc<dyn ReadyEvent>>,
    /// Full itinerary; `cursor` indexes the stage currently servicing the
    /// task.
    pub queue_list: Vec<StageId>,
    pub(crate) cursor: usize,
    pub callback: StatusCallback,
    /// Completed-partition counter shared across siblings.
    pub counter: Arc<AtomicUsize>,
    /// Number of sibling partitions; the callback fires on the increment
    /// that observes this value.
    pub total_partnum: usize,
}

impl std::fmt::Debug for SyncTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncTask")
            .field("name", &self.name)
            .field("key", &self.key)
            .field("offset", &self.offset)
            .field("len", &self.len)
            .field("device", &self.device)
            .field("priority", &self.priority)
            .field("version", &self.version)
            .field("queue_list", &self.queue_list)
            .field("cursor", &self.cursor)
            .field("total_partnum", &self.total_partnum)
            .finish()
    }
}

impl SyncTask {
    /// The stage currently responsible for this task, if any remain.
    pub fn current_stage(&self) -> Option<StageId> {
        self.queue_list.get(self.cursor).copied()
    }

    /// Byte size of the parent tensor.
    pub fn parent_size(&self) -> usize {
        self.tensor
            .as_ref()
            .or(self.output.as_ref())
            .map_or(0, |t| t.size_bytes())
    }

    /// Dtype of the underlying device buffer.
    pub fn dtype(&self) -> Result<TensorDtype> {
        self.tensor
            .as_ref()
            .or(self.output.as_ref())
            .map(|t| t.dtype())
            .ok_or_else(|| {
                SyncError::InvariantViolation(format!("{}: no device buffer", self.name))
            })
    }

    /// The device buffer written by reduce/broadcast/H2D stages. Falls back
    /// to the input for in-place operation.
    pub fn output_or_tensor(&self) -> Result<&Arc<dyn DeviceTensor>> {
        self.output.as_ref().or(self.tensor.as_ref()).ok_or_else(|| {
            SyncError::InvariantViolation(format!("{}: no device buffer", self.name))
        })
    }

    /// True once the framework-supplied readiness event has fired (or none
    /// was supplied).
    pub fn is_ready(&self) -> bool {
        self.ready_event.as_ref().map_or(true, |e| e.ready())
    }

    /// Advance past the current stage. Returns the next stage, or `None`
    /// when the itinerary is exhausted.
    pub(crate) fn advance(&mut self) -> Option<StageId> {
        self.cursor += 1;
        self.current_stage()
    }

    /// Record this partition's completion; the last arriver fires the
    /// callback. `SeqCst` makes the last arriver unique and publishes every
    /// preceding stage's side effects to the callback.
    pub(crate) fn finish(self: Box<Self>) {
        let done = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        if done == self.total_partnum {
            debug!(
                name = %self.context.name(),
                parts = self.total_partnum,
                "tensor finished pipeline"
            );
            (self.callback)(Ok(()));
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

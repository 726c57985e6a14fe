//! Per-stage scheduled queues.
//!
//! Each active stage owns one queue: producers (enqueue, upstream stage
//! loops) append from any thread, the stage's single worker drains it.
//! Extraction is gated, not FIFO — a task is eligible once its readiness
//! event has fired and the queue's byte credit admits its length, and the
//! highest-priority eligible task wins. Credit is taken on extraction and
//! returned on stage completion, bounding the bytes a stage holds in
//! flight.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

use tracing::trace;

use gradsync_types::stage::StageId;

use crate::task::SyncTask;

/// Default per-queue credit: enough for a handful of maximum-size
/// partitions in flight.
pub const DEFAULT_CREDIT: usize = 64 * 1024 * 1024;

struct QueueInner {
    tasks: Vec<Box<SyncTask>>,
    credit: usize,
}

pub struct ScheduledQueue {
    stage: StageId,
    inner: Mutex<QueueInner>,
    cond: Condvar,
}

impl ScheduledQueue {
    pub fn new(stage: StageId) -> Self {
        Self::with_credit(stage, DEFAULT_CREDIT)
    }

    pub fn with_credit(stage: StageId, credit: usize) -> Self {
        Self {
            stage,
            inner: Mutex::new(QueueInner {
                tasks: Vec::new(),
                credit,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn stage(&self) -> StageId {
        self.stage
    }

    /// Thread-safe append from any producer.
    pub fn add_task(&self, task: Box<SyncTask>) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        trace!(stage = %self.stage, name = %task.name, key = task.key, "task queued");
        inner.tasks.push(task);
        drop(inner);
        self.cond.notify_one();
    }

    /// Extract the best eligible task without blocking. Returns `None` when
    /// nothing is currently admissible.
    pub fn get_task(&self) -> Option<Box<SyncTask>> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Self::pick(&mut inner)
    }

    /// Extract the best eligible task, parking up to `timeout` for one to
    /// become admissible.
    pub fn wait_for_task(&self, timeout: Duration) -> Option<Box<SyncTask>> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(task) = Self::pick(&mut inner) {
            return Some(task);
        }
        let (mut inner, _timed_out) = self
            .cond
            .wait_timeout(inner, timeout)
            .unwrap_or_else(|e| e.into_inner());
        Self::pick(&mut inner)
    }

    /// Return credit taken when the finished task was extracted.
    pub fn recover_credit(&self, len: usize) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.credit += len;
        drop(inner);
        self.cond.notify_one();
    }

    /// Wake the consumer without enqueuing (shutdown path).
    pub fn wake(&self) {
        self.cond.notify_all();
    }

    /// Number of tasks buffered, eligible or not.
    pub fn pending(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.tasks.len()
    }

    fn pick(inner: &mut QueueInner) -> Option<Box<SyncTask>> {
        let mut best: Option<usize> = None;
        for (i, task) in inner.tasks.iter().enumerate() {
            if task.len > inner.credit || !task.is_ready() {
                continue;
            }
            match best {
                None => best = Some(i),
                Some(b) if task.priority > inner.tasks[b].priority => best = Some(i),
                _ => {}
            }
        }
        let i = best?;
        let task = inner.tasks.remove(i);
        inner.credit -= task.len;
        Some(task)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    use crate::capability::ReadyEvent;
    use crate::context::ContextRegistry;
    use crate::loopback::VecTensor;

    struct ManualEvent(AtomicBool);

    impl ReadyEvent for ManualEvent {
        fn ready(&self) -> bool {
            self.0.load(Ordering::Acquire)
        }
    }

    fn task(name: &str, len: usize, priority: i32, event: Option<Arc<ManualEvent>>) -> Box<SyncTask> {
        let registry = ContextRegistry::new();
        let ctx = registry.get_or_register(name, len, len).unwrap();
        Box::new(SyncTask {
            name: format!("{name}_0"),
            context: ctx,
            key: 0,
            offset: 0,
            len,
            tensor: Some(Arc::new(VecTensor::zeroed_bytes(len))),
            output: None,
            device: 0,
            priority,
            version: 0,
            ready_event: event.map(|e| e as Arc<dyn ReadyEvent>),
            queue_list: vec![StageId::Reduce],
            cursor: 0,
            callback: Arc::new(|_| {}),
            counter: Arc::new(AtomicUsize::new(0)),
            total_partnum: 1,
        })
    }

    #[test]
    fn fifo_when_priorities_equal() {
        let queue = ScheduledQueue::new(StageId::Reduce);
        queue.add_task(task("a", 8, 0, None));
        queue.add_task(task("b", 8, 0, None));

        assert_eq!(queue.get_task().unwrap().name, "a_0");
        assert_eq!(queue.get_task().unwrap().name, "b_0");
        assert!(queue.get_task().is_none());
    }

    #[test]
    fn higher_priority_drains_first() {
        let queue = ScheduledQueue::new(StageId::Reduce);
        queue.add_task(task("low", 8, -5, None));
        queue.add_task(task("high", 8, -1, None));

        assert_eq!(queue.get_task().unwrap().name, "high_0");
        assert_eq!(queue.get_task().unwrap().name, "low_0");
    }

    #[test]
    fn unready_task_is_skipped_until_event_fires() {
        let queue = ScheduledQueue::new(StageId::Reduce);
        let event = Arc::new(ManualEvent(AtomicBool::new(false)));
        queue.add_task(task("gated", 8, 10, Some(Arc::clone(&event))));
        queue.add_task(task("free", 8, 0, None));

        // Higher priority but not ready: the free task wins.
        assert_eq!(queue.get_task().unwrap().name, "free_0");
        assert!(queue.get_task().is_none());

        event.0.store(true, Ordering::Release);
        assert_eq!(queue.get_task().unwrap().name, "gated_0");
    }

    #[test]
    fn credit_gates_admission() {
        let queue = ScheduledQueue::with_credit(StageId::Push, 10);
        queue.add_task(task("big", 8, 0, None));
        queue.add_task(task("huge", 8, 0, None));

        let first = queue.get_task().unwrap();
        assert_eq!(first.name, "big_0");
        // 2 bytes of credit left; the second 8-byte task must wait.
        assert!(queue.get_task().is_none());
        assert_eq!(queue.pending(), 1);

        queue.recover_credit(first.len);
        assert_eq!(queue.get_task().unwrap().name, "huge_0");
    }

    #[test]
    fn wait_for_task_wakes_on_add() {
        let queue = Arc::new(ScheduledQueue::new(StageId::Reduce));
        let producer = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(10));
                queue.add_task(task("late", 8, 0, None));
            })
        };

        let got = queue.wait_for_task(Duration::from_secs(5));
        producer.join().unwrap();
        assert_eq!(got.unwrap().name, "late_0");
    }

    #[test]
    fn wait_for_task_times_out_empty() {
        let queue = ScheduledQueue::new(StageId::Reduce);
        assert!(queue.wait_for_task(Duration::from_millis(5)).is_none());
    }
}

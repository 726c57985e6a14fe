//! Tensor partitioning.
//!
//! A parent task of byte size `S` is split into `ceil(S / bound)` children
//! with `offset = i·bound` and `len = min(bound, S − i·bound)`. Children
//! shallow-share everything else, including the completion counter and
//! callback. Keys are *not* assigned here; the enqueue step assigns
//! `key_list[i]` to the i-th partition.

use gradsync_types::error::{Result, SyncError};

use crate::task::SyncTask;

/// Split `parent` into per-partition tasks bounded by `bound` bytes.
pub fn partition_task(parent: &SyncTask, bound: usize) -> Result<Vec<Box<SyncTask>>> {
    let size = parent.parent_size();
    let mut partitions = Vec::with_capacity(size.div_ceil(bound));
    let mut accumulated = 0usize;
    let mut i = 0usize;

    while accumulated < size {
        let len = (size - accumulated).min(bound);
        let mut child = parent.clone();
        child.name = format!("{}_{i}", parent.name);
        child.offset = accumulated;
        child.len = len;
        partitions.push(Box::new(child));

        accumulated += len;
        i += 1;
    }

    if partitions.len() != parent.context.key_list().len() {
        return Err(SyncError::InvariantViolation(format!(
            "{}: {} partitions for {} keys",
            parent.name,
            partitions.len(),
            parent.context.key_list().len()
        )));
    }

    Ok(partitions)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    use gradsync_types::stage::StageId;

    use crate::context::ContextRegistry;
    use crate::loopback::VecTensor;

    const MIB: usize = 1024 * 1024;

    fn parent(size: usize, bound: usize) -> SyncTask {
        let registry = ContextRegistry::new();
        let ctx = registry.get_or_register("grad", size, bound).unwrap();
        SyncTask {
            name: "grad".into(),
            context: ctx,
            key: 0,
            offset: 0,
            len: size,
            tensor: Some(Arc::new(VecTensor::zeroed_bytes(size))),
            output: None,
            device: 0,
            priority: -3,
            version: 1,
            ready_event: None,
            queue_list: vec![StageId::Reduce],
            cursor: 0,
            callback: Arc::new(|_| {}),
            counter: Arc::new(AtomicUsize::new(0)),
            total_partnum: ctx_parts(size, bound),
        }
    }

    fn ctx_parts(size: usize, bound: usize) -> usize {
        size.div_ceil(bound)
    }

    #[test]
    fn ten_mib_at_four_mib_bound() {
        let parent = parent(10 * MIB, 4 * MIB);
        let parts = partition_task(&parent, 4 * MIB).unwrap();

        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len, 4 * MIB);
        assert_eq!(parts[1].len, 4 * MIB);
        assert_eq!(parts[2].len, 2 * MIB);
        assert_eq!(parts[0].offset, 0);
        assert_eq!(parts[1].offset, 4 * MIB);
        assert_eq!(parts[2].offset, 8 * MIB);
    }

    #[test]
    fn partition_conservation() {
        for (size, bound) in [(9, 4), (4, 4), (1, 4), (4 * MIB + 1, MIB)] {
            let parent = parent(size, bound);
            let parts = partition_task(&parent, bound).unwrap();
            let total: usize = parts.iter().map(|p| p.len).sum();
            assert_eq!(total, size, "size={size} bound={bound}");
        }
    }

    #[test]
    fn children_share_completion_state() {
        let parent = parent(9, 4);
        let parts = partition_task(&parent, 4).unwrap();
        for child in &parts {
            assert!(Arc::ptr_eq(&child.counter, &parent.counter));
            assert_eq!(child.total_partnum, parent.total_partnum);
            assert_eq!(child.priority, parent.priority);
            assert_eq!(child.version, parent.version);
        }
        assert_eq!(parts[0].name, "grad_0");
        assert_eq!(parts[2].name, "grad_2");
    }

    #[test]
    fn key_count_mismatch_is_rejected() {
        // Context registered with bound 4 (3 keys), partitioned with bound 2.
        let parent = parent(9, 4);
        let err = partition_task(&parent, 2).unwrap_err();
        assert!(matches!(err, SyncError::InvariantViolation(_)));
    }
}

//! Itinerary construction.
//!
//! An itinerary is the ordered list of stages a partition traverses,
//! derived purely from the submit direction (push or pull), the device, and
//! the node's role flags. CPU tensors get an empty itinerary and the
//! enqueue path short-circuits to an immediate successful callback.
//!
//! The orderings and role-gated inclusions here are contractual; the tests
//! enumerate every flag combination for both directions.

use gradsync_types::config::{RoleFlags, CPU_DEVICE_ID};
use gradsync_types::stage::StageId;

/// Stages a partition traverses when pushing gradients out.
pub fn push_queue_list(device: i32, role: &RoleFlags) -> Vec<StageId> {
    let mut queues = Vec::new();
    if device == CPU_DEVICE_ID {
        return queues;
    }

    // Per-PCIe-switch collective reduce.
    if role.is_signal_root {
        queues.push(StageId::Reduce);
    } else {
        queues.push(StageId::CoordinateReduce);
        queues.push(StageId::Reduce);
    }

    // Stage into host memory.
    if role.is_distributed || role.is_cross_pcie_switch {
        queues.push(StageId::CopyD2h);
    }

    // Cross-switch combine.
    if role.is_cross_pcie_switch {
        queues.push(StageId::PcieReduce);
    }

    // Inter-node push.
    if role.is_distributed {
        if role.is_root_device {
            queues.push(StageId::Push);
        } else {
            queues.push(StageId::CoordinatePush);
        }
    }

    queues
}

/// Stages a partition traverses when pulling parameters back.
pub fn pull_queue_list(device: i32, role: &RoleFlags) -> Vec<StageId> {
    let mut queues = Vec::new();
    if device == CPU_DEVICE_ID {
        return queues;
    }

    // Inter-node pull, root device only.
    if role.is_distributed && role.is_root_device {
        queues.push(StageId::Pull);
    }

    // Unstage from host memory.
    if role.is_distributed || role.is_cross_pcie_switch {
        queues.push(StageId::CopyH2d);
    }

    // Per-PCIe-switch collective broadcast.
    if role.is_signal_root {
        queues.push(StageId::Broadcast);
    } else {
        queues.push(StageId::CoordinateBroadcast);
        queues.push(StageId::Broadcast);
    }

    queues
}

/// The set of stages any legal itinerary can contain for this role — the
/// engine spawns exactly one worker per member.
pub fn active_stages(role: &RoleFlags) -> Vec<StageId> {
    let mut stages = push_queue_list(0, role);
    for stage in pull_queue_list(0, role) {
        if !stages.contains(&stage) {
            stages.push(stage);
        }
    }
    stages
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use StageId::*;

    const GPU: i32 = 0;

    fn role(
        is_distributed: bool,
        is_root_device: bool,
        is_cross_pcie_switch: bool,
        is_signal_root: bool,
    ) -> RoleFlags {
        RoleFlags {
            is_distributed,
            is_root_device,
            is_cross_pcie_switch,
            is_signal_root,
        }
    }

    /// Reference expansion of the push table, written independently of the
    /// production code path.
    fn expected_push(r: &RoleFlags) -> Vec<StageId> {
        let mut q = Vec::new();
        if !r.is_signal_root {
            q.push(CoordinateReduce);
        }
        q.push(Reduce);
        if r.is_distributed || r.is_cross_pcie_switch {
            q.push(CopyD2h);
        }
        if r.is_cross_pcie_switch {
            q.push(PcieReduce);
        }
        if r.is_distributed {
            q.push(if r.is_root_device { Push } else { CoordinatePush });
        }
        q
    }

    fn expected_pull(r: &RoleFlags) -> Vec<StageId> {
        let mut q = Vec::new();
        if r.is_distributed && r.is_root_device {
            q.push(Pull);
        }
        if r.is_distributed || r.is_cross_pcie_switch {
            q.push(CopyH2d);
        }
        if !r.is_signal_root {
            q.push(CoordinateBroadcast);
        }
        q.push(Broadcast);
        q
    }

    #[test]
    fn push_table_all_role_combinations() {
        for bits in 0..16u32 {
            let r = role(bits & 1 != 0, bits & 2 != 0, bits & 4 != 0, bits & 8 != 0);
            assert_eq!(push_queue_list(GPU, &r), expected_push(&r), "{r:?}");
        }
    }

    #[test]
    fn pull_table_all_role_combinations() {
        for bits in 0..16u32 {
            let r = role(bits & 1 != 0, bits & 2 != 0, bits & 4 != 0, bits & 8 != 0);
            assert_eq!(pull_queue_list(GPU, &r), expected_pull(&r), "{r:?}");
        }
    }

    #[test]
    fn cpu_device_short_circuits_both_directions() {
        for bits in 0..16u32 {
            let r = role(bits & 1 != 0, bits & 2 != 0, bits & 4 != 0, bits & 8 != 0);
            assert!(push_queue_list(CPU_DEVICE_ID, &r).is_empty());
            assert!(pull_queue_list(CPU_DEVICE_ID, &r).is_empty());
        }
    }

    #[test]
    fn local_signal_root_reduces_only() {
        let r = role(false, true, false, true);
        assert_eq!(push_queue_list(GPU, &r), vec![Reduce]);
        assert_eq!(pull_queue_list(GPU, &r), vec![Broadcast]);
    }

    #[test]
    fn distributed_root_single_switch() {
        let r = role(true, true, false, true);
        assert_eq!(push_queue_list(GPU, &r), vec![Reduce, CopyD2h, Push]);
        assert_eq!(pull_queue_list(GPU, &r), vec![Pull, CopyH2d, Broadcast]);
    }

    #[test]
    fn distributed_non_root() {
        let r = role(true, false, false, true);
        assert_eq!(
            push_queue_list(GPU, &r),
            vec![Reduce, CopyD2h, CoordinatePush]
        );
        assert_eq!(pull_queue_list(GPU, &r), vec![CopyH2d, Broadcast]);
    }

    #[test]
    fn cross_pcie_local_non_signal_root() {
        let r = role(false, true, true, false);
        assert_eq!(
            push_queue_list(GPU, &r),
            vec![CoordinateReduce, Reduce, CopyD2h, PcieReduce]
        );
        assert_eq!(
            pull_queue_list(GPU, &r),
            vec![CopyH2d, CoordinateBroadcast, Broadcast]
        );
    }

    #[test]
    fn active_set_is_union_of_both_directions() {
        let r = role(true, true, false, true);
        let stages = active_stages(&r);
        assert_eq!(
            stages,
            vec![Reduce, CopyD2h, Push, Pull, CopyH2d, Broadcast]
        );

        let r = role(false, true, false, true);
        assert_eq!(active_stages(&r), vec![Reduce, Broadcast]);
    }
}

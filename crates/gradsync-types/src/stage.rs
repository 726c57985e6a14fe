//! Stage identifiers for the synchronization pipeline.
//!
//! A tensor partition traverses an ordered list of stages (its itinerary);
//! each stage identifier names the scheduled queue and worker loop that
//! service it. Which stages appear in an itinerary depends on the node's
//! role in the cluster topology — see `gradsync-engine::itinerary`.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One stage of the synchronization pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StageId {
    /// Non-signal-root rendezvous preceding the intra-node reduce.
    CoordinateReduce,
    /// Intra-node collective reduce across local devices.
    Reduce,
    /// Device-to-host copy into the staging buffer.
    CopyD2h,
    /// Combine per-PCIe-switch staging buffers into the canonical one.
    PcieReduce,
    /// Non-root-device rendezvous preceding the root's network push.
    CoordinatePush,
    /// Push the staged byte window to the parameter server.
    Push,
    /// Pull the byte window from the parameter server.
    Pull,
    /// Host-to-device copy out of the staging buffer.
    CopyH2d,
    /// Non-signal-root rendezvous preceding the intra-node broadcast.
    CoordinateBroadcast,
    /// Intra-node collective broadcast across local devices.
    Broadcast,
}

impl StageId {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CoordinateReduce => "coordinate_reduce",
            Self::Reduce => "reduce",
            Self::CopyD2h => "copy_d2h",
            Self::PcieReduce => "pcie_reduce",
            Self::CoordinatePush => "coordinate_push",
            Self::Push => "push",
            Self::Pull => "pull",
            Self::CopyH2d => "copy_h2d",
            Self::CoordinateBroadcast => "coordinate_broadcast",
            Self::Broadcast => "broadcast",
        }
    }

    /// Short name used for worker thread names (kept under the kernel's
    /// 15-byte thread name limit).
    pub fn thread_name(&self) -> &'static str {
        match self {
            Self::CoordinateReduce => "gs-creduce",
            Self::Reduce => "gs-reduce",
            Self::CopyD2h => "gs-d2h",
            Self::PcieReduce => "gs-pcie",
            Self::CoordinatePush => "gs-cpush",
            Self::Push => "gs-push",
            Self::Pull => "gs-pull",
            Self::CopyH2d => "gs-h2d",
            Self::CoordinateBroadcast => "gs-cbcast",
            Self::Broadcast => "gs-bcast",
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_as_str() {
        assert_eq!(StageId::CoordinateReduce.to_string(), "coordinate_reduce");
        assert_eq!(StageId::Push.to_string(), "push");
    }

    #[test]
    fn thread_names_fit_kernel_limit() {
        let all = [
            StageId::CoordinateReduce,
            StageId::Reduce,
            StageId::CopyD2h,
            StageId::PcieReduce,
            StageId::CoordinatePush,
            StageId::Push,
            StageId::Pull,
            StageId::CopyH2d,
            StageId::CoordinateBroadcast,
            StageId::Broadcast,
        ];
        for stage in all {
            assert!(stage.thread_name().len() <= 15, "{stage}");
        }
    }
}

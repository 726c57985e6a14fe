//! Topology configuration and role flags.
//!
//! The topology is read once at process start (from `GRADSYNC_*` environment
//! variables set by the launcher) and never changes during a run. Role flags
//! are a pure function of the topology plus the collective library's
//! signal-root query; they are snapshotted at engine init and passed to the
//! itinerary builder as an immutable record.

/// Device id used for tensors that live on the host. CPU tensors are not
/// routed through the pipeline at all.
pub const CPU_DEVICE_ID: i32 = -1;

const DEFAULT_PARTITION_BOUND: usize = 4 * 1024 * 1024;

// ── Topology ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TopologyConfig {
    /// Index of this worker (machine) within the job.
    pub worker_id: u32,
    /// Total number of workers in the job.
    pub num_workers: u32,
    /// Index of this device within the worker.
    pub local_rank: u32,
    /// Number of devices on this worker.
    pub local_size: u32,
    /// Number of PCIe switches spanning the local devices.
    pub num_pcie_switches: u32,
    /// Maximum byte length of a single partition. Deployment-wide constant.
    pub partition_bound: usize,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            worker_id: 0,
            num_workers: 1,
            local_rank: 0,
            local_size: 1,
            num_pcie_switches: 1,
            partition_bound: DEFAULT_PARTITION_BOUND,
        }
    }
}

impl TopologyConfig {
    /// Read the topology from `GRADSYNC_*` environment variables, falling
    /// back to single-worker defaults for anything unset.
    pub fn from_env() -> Self {
        Self {
            worker_id: env_u32("GRADSYNC_WORKER_ID", 0),
            num_workers: env_u32("GRADSYNC_NUM_WORKERS", 1),
            local_rank: env_u32("GRADSYNC_LOCAL_RANK", 0),
            local_size: env_u32("GRADSYNC_LOCAL_SIZE", 1),
            num_pcie_switches: env_u32("GRADSYNC_PCIE_SWITCHES", 1),
            partition_bound: env_usize(
                "GRADSYNC_PARTITION_BOUND",
                DEFAULT_PARTITION_BOUND,
            ),
        }
    }

    /// Global rank of this device across the whole job.
    pub fn rank(&self) -> u32 {
        self.worker_id * self.local_size + self.local_rank
    }

    /// Total number of devices across the whole job.
    pub fn size(&self) -> u32 {
        self.num_workers * self.local_size
    }

    pub fn is_distributed(&self) -> bool {
        self.num_workers > 1
    }

    /// The root device of a worker owns inter-node push/pull.
    pub fn is_root_device(&self) -> bool {
        self.local_rank == 0
    }

    pub fn is_cross_pcie_switch(&self) -> bool {
        self.num_pcie_switches > 1
    }
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

// ── Role flags ────────────────────────────────────────────────────────────────

/// Immutable snapshot of the node's role, taken at engine init.
///
/// The itinerary builder and the active-stage set are pure functions of this
/// record; it never changes during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleFlags {
    pub is_distributed: bool,
    pub is_root_device: bool,
    pub is_cross_pcie_switch: bool,
    pub is_signal_root: bool,
}

impl RoleFlags {
    /// Derive role flags from the topology and the collective library's
    /// signal-root answer.
    pub fn derive(topology: &TopologyConfig, is_signal_root: bool) -> Self {
        Self {
            is_distributed: topology.is_distributed(),
            is_root_device: topology.is_root_device(),
            is_cross_pcie_switch: topology.is_cross_pcie_switch(),
            is_signal_root,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

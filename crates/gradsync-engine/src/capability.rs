//! Capability traits at the engine's trust boundary.
//!
//! The engine is a coordination layer, not a transport layer. Everything
//! that moves bytes — the parameter-server client, the intra-node
//! collective, device memory, the node-local coordination channel — is
//! consumed behind one of these traits. Loopback implementations for tests
//! and the smoke binary live in [`crate::loopback`].

use std::sync::Arc;

use gradsync_shm::{HostRegion, ShmAllocator};
use gradsync_types::dtype::TensorDtype;
use gradsync_types::error::{Result, SyncError};

use crate::signal::CoordSignal;

// ── Parameter server ──────────────────────────────────────────────────────────

/// A partition key scattered across parameter-server shards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedKey {
    pub keys: Vec<u64>,
    pub lens: Vec<usize>,
}

/// Handle to an in-flight push or pull, redeemed with [`PsClient::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpHandle(pub u64);

/// Client for the external parameter server.
///
/// Assumed thread-safe; the engine calls it concurrently from the push,
/// pull, and init paths.
pub trait PsClient: Send + Sync {
    /// Scatter a partition key over the server shards.
    fn encode_key(&self, key: u64, len: usize) -> EncodedKey;

    /// Start pushing `val` under `keys`. Completion is observed via `wait`.
    fn z_push(&self, keys: &EncodedKey, val: &[u8], cmd: i32) -> Result<OpHandle>;

    /// Start pulling into `dst` under `keys`. Completion is observed via
    /// `wait`.
    fn z_pull(&self, keys: &EncodedKey, dst: &mut [u8], cmd: i32) -> Result<OpHandle>;

    fn wait(&self, handle: OpHandle) -> Result<()>;

    /// Barrier across the worker group.
    fn barrier(&self) -> Result<()>;
}

// ── Intra-node collective ─────────────────────────────────────────────────────

/// Intra-node collective capability (reduce/broadcast across local devices).
pub trait Collective: Send + Sync {
    /// True iff this device owns initiation of the collective for its PCIe
    /// switch.
    fn is_signal_root(&self) -> bool;

    /// Reduce `tensor[offset..offset+len]` across local devices into
    /// `output` (which may be the same buffer for in-place reduction).
    fn reduce(
        &self,
        tensor: &dyn DeviceTensor,
        output: &dyn DeviceTensor,
        offset: usize,
        len: usize,
    ) -> Result<()>;

    /// Broadcast `output[offset..offset+len]` from the signal root to all
    /// local devices.
    fn broadcast(&self, output: &dyn DeviceTensor, offset: usize, len: usize) -> Result<()>;
}

// ── Coordination ──────────────────────────────────────────────────────────────

/// Node-local rendezvous channel between non-root participants and their
/// root. Blocks until the peer side has acknowledged the signal.
pub trait Coordinator: Send + Sync {
    fn rendezvous(&self, signal: &CoordSignal) -> Result<()>;
}

// ── Device memory ─────────────────────────────────────────────────────────────

/// Opaque device buffer handle passed through from the framework binding.
pub trait DeviceTensor: Send + Sync {
    fn size_bytes(&self) -> usize;

    fn dtype(&self) -> TensorDtype;

    /// Copy `[offset, offset + dst.len())` of the device buffer into `dst`.
    fn copy_to_host(&self, offset: usize, dst: &mut [u8]) -> Result<()>;

    /// Copy `src` into `[offset, offset + src.len())` of the device buffer.
    fn copy_from_host(&self, offset: usize, src: &[u8]) -> Result<()>;
}

/// Framework-supplied readiness handle, polled by stage loops before a
/// partition's first use. Liveness is a trust boundary: if the event never
/// fires, the partition never drains — a watchdog belongs in the binding
/// layer, not here.
pub trait ReadyEvent: Send + Sync {
    fn ready(&self) -> bool;
}

// ── Staging allocation ────────────────────────────────────────────────────────

/// Source of host staging buffers for contexts that do not bring their own.
pub trait StagingAllocator: Send + Sync {
    fn open_shared_memory(&self, key: u64, size: usize) -> Result<Arc<dyn HostRegion>>;

    /// One region per PCIe switch; the last is the canonical buffer.
    fn open_pcie_shared_memory(
        &self,
        key: u64,
        size: usize,
    ) -> Result<Vec<Arc<dyn HostRegion>>>;
}

impl StagingAllocator for ShmAllocator {
    fn open_shared_memory(&self, key: u64, size: usize) -> Result<Arc<dyn HostRegion>> {
        let region = ShmAllocator::open_shared_memory(self, key, size)
            .map_err(|e| SyncError::CapabilityFailure {
                stage: "shm".into(),
                reason: e.to_string(),
            })?;
        Ok(region as Arc<dyn HostRegion>)
    }

    fn open_pcie_shared_memory(
        &self,
        key: u64,
        size: usize,
    ) -> Result<Vec<Arc<dyn HostRegion>>> {
        let regions = ShmAllocator::open_pcie_shared_memory(self, key, size)
            .map_err(|e| SyncError::CapabilityFailure {
                stage: "shm".into(),
                reason: e.to_string(),
            })?;
        Ok(regions
            .into_iter()
            .map(|r| r as Arc<dyn HostRegion>)
            .collect())
    }
}

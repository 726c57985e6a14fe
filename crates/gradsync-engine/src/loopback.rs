//! In-process capability implementations.
//!
//! These back the engine when there is no real cluster: unit and
//! integration tests, and the smoke subcommand of `gradsync-node`. They
//! satisfy the capability contracts on a single device — the parameter
//! server is a hash map, the collective copies input to output, and
//! coordination records wire-encoded signals for later inspection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::trace;

use gradsync_shm::{HeapRegion, HostRegion};
use gradsync_types::dtype::TensorDtype;
use gradsync_types::error::{Result, SyncError};

use crate::capability::{
    Collective, Coordinator, DeviceTensor, EncodedKey, OpHandle, PsClient, ReadyEvent,
    StagingAllocator,
};
use crate::signal::{decode_signal, encode_signal, CoordSignal};

// ── Parameter server ──────────────────────────────────────────────────────────

/// Hash-map parameter server. Push overwrites the keyed range, pull reads
/// it back; both complete before their handle is returned.
#[derive(Default)]
pub struct LoopbackPs {
    store: Mutex<HashMap<u64, Vec<u8>>>,
    pushes: AtomicUsize,
    pulls: AtomicUsize,
    barriers: AtomicUsize,
}

impl LoopbackPs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_count(&self) -> usize {
        self.pushes.load(Ordering::SeqCst)
    }

    pub fn pull_count(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }

    pub fn barrier_count(&self) -> usize {
        self.barriers.load(Ordering::SeqCst)
    }

    /// Stored bytes for `key`, if any worker has pushed it.
    pub fn stored(&self, key: u64) -> Option<Vec<u8>> {
        self.store
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
            .cloned()
    }
}

impl PsClient for LoopbackPs {
    fn encode_key(&self, key: u64, len: usize) -> EncodedKey {
        EncodedKey {
            keys: vec![key],
            lens: vec![len],
        }
    }

    fn z_push(&self, keys: &EncodedKey, val: &[u8], _cmd: i32) -> Result<OpHandle> {
        let key = keys.keys[0];
        self.store
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, val.to_vec());
        self.pushes.fetch_add(1, Ordering::SeqCst);
        trace!(key, len = val.len(), "loopback push");
        Ok(OpHandle(key))
    }

    fn z_pull(&self, keys: &EncodedKey, dst: &mut [u8], _cmd: i32) -> Result<OpHandle> {
        let key = keys.keys[0];
        let store = self.store.lock().unwrap_or_else(|e| e.into_inner());
        let val = store.get(&key).ok_or_else(|| SyncError::CapabilityFailure {
            stage: "pull".into(),
            reason: format!("key {key} was never pushed"),
        })?;
        if val.len() != dst.len() {
            return Err(SyncError::CapabilityFailure {
                stage: "pull".into(),
                reason: format!("key {key}: stored {} bytes, need {}", val.len(), dst.len()),
            });
        }
        dst.copy_from_slice(val);
        self.pulls.fetch_add(1, Ordering::SeqCst);
        trace!(key, len = dst.len(), "loopback pull");
        Ok(OpHandle(key))
    }

    fn wait(&self, _handle: OpHandle) -> Result<()> {
        Ok(())
    }

    fn barrier(&self) -> Result<()> {
        self.barriers.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ── Collective ────────────────────────────────────────────────────────────────

/// Single-device collective: reduce degenerates to a copy from input to
/// output, broadcast is a no-op.
pub struct LoopbackCollective {
    signal_root: bool,
}

impl LoopbackCollective {
    pub fn new(signal_root: bool) -> Self {
        Self { signal_root }
    }
}

impl Collective for LoopbackCollective {
    fn is_signal_root(&self) -> bool {
        self.signal_root
    }

    fn reduce(
        &self,
        tensor: &dyn DeviceTensor,
        output: &dyn DeviceTensor,
        offset: usize,
        len: usize,
    ) -> Result<()> {
        if std::ptr::eq(
            tensor as *const dyn DeviceTensor as *const (),
            output as *const dyn DeviceTensor as *const (),
        ) {
            return Ok(());
        }
        let mut staged = vec![0u8; len];
        tensor.copy_to_host(offset, &mut staged)?;
        output.copy_from_host(offset, &staged)
    }

    fn broadcast(&self, _output: &dyn DeviceTensor, _offset: usize, _len: usize) -> Result<()> {
        Ok(())
    }
}

// ── Coordinator ───────────────────────────────────────────────────────────────

/// Records coordination traffic in wire form; `drain` decodes it back for
/// inspection.
#[derive(Default)]
pub struct LoopbackCoordinator {
    frames: Mutex<Vec<Vec<u8>>>,
}

impl LoopbackCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode and drain every recorded signal, in rendezvous order.
    pub fn drain(&self) -> Result<Vec<CoordSignal>> {
        let frames = std::mem::take(&mut *self.frames.lock().unwrap_or_else(|e| e.into_inner()));
        frames.iter().map(|f| decode_signal(f)).collect()
    }
}

impl Coordinator for LoopbackCoordinator {
    fn rendezvous(&self, signal: &CoordSignal) -> Result<()> {
        let frame = encode_signal(signal)?;
        self.frames
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(frame);
        Ok(())
    }
}

// ── Staging allocation ────────────────────────────────────────────────────────

/// Heap-backed staging allocator, for running the engine without touching
/// `/dev/shm`.
pub struct HeapAllocator {
    num_pcie_switches: u32,
}

impl HeapAllocator {
    pub fn new(num_pcie_switches: u32) -> Self {
        Self {
            num_pcie_switches: num_pcie_switches.max(1),
        }
    }
}

impl StagingAllocator for HeapAllocator {
    fn open_shared_memory(&self, _key: u64, size: usize) -> Result<Arc<dyn HostRegion>> {
        Ok(Arc::new(HeapRegion::zeroed(size)))
    }

    fn open_pcie_shared_memory(
        &self,
        _key: u64,
        size: usize,
    ) -> Result<Vec<Arc<dyn HostRegion>>> {
        Ok((0..self.num_pcie_switches)
            .map(|_| Arc::new(HeapRegion::zeroed(size)) as Arc<dyn HostRegion>)
            .collect())
    }
}

// ── Device buffers ────────────────────────────────────────────────────────────

/// Host-vector "device" buffer used wherever the tests and the smoke
/// binary need a tensor.
pub struct VecTensor {
    data: Mutex<Vec<u8>>,
    dtype: TensorDtype,
}

impl VecTensor {
    pub fn zeroed_bytes(len: usize) -> Self {
        Self {
            data: Mutex::new(vec![0u8; len]),
            dtype: TensorDtype::U8,
        }
    }

    pub fn from_f32(vals: &[f32]) -> Self {
        Self {
            data: Mutex::new(vals.iter().flat_map(|v| v.to_ne_bytes()).collect()),
            dtype: TensorDtype::F32,
        }
    }

    pub fn to_f32(&self) -> Vec<f32> {
        self.data
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .chunks_exact(4)
            .map(|c| f32::from_ne_bytes(c.try_into().expect("chunk size")))
            .collect()
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.data.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl DeviceTensor for VecTensor {
    fn size_bytes(&self) -> usize {
        self.data.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn dtype(&self) -> TensorDtype {
        self.dtype
    }

    fn copy_to_host(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        let data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        let end = offset + dst.len();
        if end > data.len() {
            return Err(SyncError::CapabilityFailure {
                stage: "copy_d2h".into(),
                reason: format!("window [{offset}, {end}) exceeds {} bytes", data.len()),
            });
        }
        dst.copy_from_slice(&data[offset..end]);
        Ok(())
    }

    fn copy_from_host(&self, offset: usize, src: &[u8]) -> Result<()> {
        let mut data = self.data.lock().unwrap_or_else(|e| e.into_inner());
        let end = offset + src.len();
        if end > data.len() {
            return Err(SyncError::CapabilityFailure {
                stage: "copy_h2d".into(),
                reason: format!("window [{offset}, {end}) exceeds {} bytes", data.len()),
            });
        }
        data[offset..end].copy_from_slice(src);
        Ok(())
    }
}

// ── Capability bundles ────────────────────────────────────────────────────────

/// Full loopback capability set, plus handles to the parameter server and
/// coordinator for asserting on traffic.
pub fn loopback_capabilities(
    signal_root: bool,
    num_pcie_switches: u32,
) -> (
    crate::engine::Capabilities,
    Arc<LoopbackPs>,
    Arc<LoopbackCoordinator>,
) {
    let ps = Arc::new(LoopbackPs::new());
    let coordinator = Arc::new(LoopbackCoordinator::new());
    let caps = crate::engine::Capabilities {
        ps: Arc::clone(&ps) as Arc<dyn PsClient>,
        collective: Arc::new(LoopbackCollective::new(signal_root)),
        coordinator: Arc::clone(&coordinator) as Arc<dyn Coordinator>,
        allocator: Arc::new(HeapAllocator::new(num_pcie_switches)),
    };
    (caps, ps, coordinator)
}

/// Manually fired readiness event.
#[derive(Default)]
pub struct ManualReadyEvent {
    fired: AtomicBool,
}

impl ManualReadyEvent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fire(&self) {
        self.fired.store(true, Ordering::Release);
    }
}

impl ReadyEvent for ManualReadyEvent {
    fn ready(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use gradsync_types::stage::StageId;

    #[test]
    fn ps_push_then_pull_round_trips() {
        let ps = LoopbackPs::new();
        let keys = ps.encode_key(3, 4);
        ps.wait(ps.z_push(&keys, &[1, 2, 3, 4], 0).unwrap()).unwrap();

        let mut out = [0u8; 4];
        ps.wait(ps.z_pull(&keys, &mut out, 0).unwrap()).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
        assert_eq!(ps.push_count(), 1);
        assert_eq!(ps.pull_count(), 1);
    }

    #[test]
    fn pull_of_unknown_key_fails() {
        let ps = LoopbackPs::new();
        let keys = ps.encode_key(9, 4);
        let mut out = [0u8; 4];
        assert!(ps.z_pull(&keys, &mut out, 0).is_err());
    }

    #[test]
    fn collective_reduce_copies_into_output() {
        let coll = LoopbackCollective::new(true);
        let input = VecTensor::from_f32(&[1.0, 2.0]);
        let output = VecTensor::from_f32(&[0.0, 0.0]);
        coll.reduce(&input, &output, 0, 8).unwrap();
        assert_eq!(output.to_f32(), vec![1.0, 2.0]);
    }

    #[test]
    fn coordinator_round_trips_signals() {
        let coord = LoopbackCoordinator::new();
        let signal = CoordSignal {
            src_rank: 1,
            stage: StageId::CoordinateReduce,
            key: 4,
        };
        coord.rendezvous(&signal).unwrap();
        assert_eq!(coord.drain().unwrap(), vec![signal]);
        assert!(coord.drain().unwrap().is_empty());
    }

    #[test]
    fn manual_event_gates_until_fired() {
        let event = ManualReadyEvent::new();
        assert!(!event.ready());
        event.fire();
        assert!(event.ready());
    }
}

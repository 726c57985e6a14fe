//! Tensor registration records.
//!
//! A context binds a symbolic tensor name to its partition keys and staging
//! buffers. Records are created once, live for the process, and are
//! write-once after init: `key_list` and `buff_len` are fixed at
//! registration, the staging buffers land exactly once, and `initialized`
//! is monotonic.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

use tracing::debug;

use gradsync_shm::HostRegion;
use gradsync_types::error::{Result, SyncError};

// ── Context ───────────────────────────────────────────────────────────────────

/// Staging buffers bound to a context by the init protocol.
pub struct StagingBuffers {
    /// Canonical host staging buffer.
    pub cpubuff: Arc<dyn HostRegion>,
    /// Per-PCIe-switch staging buffers; empty outside multi-switch
    /// topologies. When present, the last entry is `cpubuff`.
    pub pcie_cpubuff: Vec<Arc<dyn HostRegion>>,
    /// True iff `cpubuff` was supplied by the caller rather than opened
    /// from shared memory.
    pub reuse_buff: bool,
}

/// Registration record for one tensor name.
pub struct TensorContext {
    name: String,
    key_list: Vec<u64>,
    buff_len: usize,
    buffers: OnceLock<StagingBuffers>,
    initialized: AtomicBool,
}

impl std::fmt::Debug for TensorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TensorContext")
            .field("name", &self.name)
            .field("key_list", &self.key_list)
            .field("buff_len", &self.buff_len)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

impl TensorContext {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Globally unique partition keys, one per partition.
    pub fn key_list(&self) -> &[u64] {
        &self.key_list
    }

    /// Total byte length of the tensor.
    pub fn buff_len(&self) -> usize {
        self.buff_len
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Staging buffers, available once init has bound them.
    pub fn buffers(&self) -> Result<&StagingBuffers> {
        self.buffers.get().ok_or_else(|| {
            SyncError::Uninitialized(format!("tensor {} has no staging buffers", self.name))
        })
    }

    /// Bind the staging buffers. Only the first call takes effect.
    pub(crate) fn bind_buffers(&self, buffers: StagingBuffers) {
        let _ = self.buffers.set(buffers);
    }

    pub(crate) fn mark_initialized(&self) {
        self.initialized.store(true, Ordering::Release);
    }
}

// ── Registry ──────────────────────────────────────────────────────────────────

/// Process-wide map from tensor name to registration record.
///
/// Write-once per name, read-many; the name → record mapping is stable for
/// the life of the process.
pub struct ContextRegistry {
    inner: RwLock<HashMap<String, Arc<TensorContext>>>,
    next_key: AtomicU64,
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            next_key: AtomicU64::new(0),
        }
    }

    /// Look up or create the context for `name`.
    ///
    /// On first registration, `ceil(buff_len / partition_bound)` consecutive
    /// keys are allocated from the process-wide counter. A re-registration
    /// with a different byte length is a framework-binding bug.
    pub fn get_or_register(
        &self,
        name: &str,
        buff_len: usize,
        partition_bound: usize,
    ) -> Result<Arc<TensorContext>> {
        if buff_len == 0 {
            return Err(SyncError::InvariantViolation(format!(
                "{name}: cannot register a zero-length tensor"
            )));
        }

        {
            let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
            if let Some(ctx) = inner.get(name) {
                if ctx.buff_len != buff_len {
                    return Err(SyncError::InvariantViolation(format!(
                        "{name}: registered with {} bytes, now {buff_len}",
                        ctx.buff_len
                    )));
                }
                return Ok(Arc::clone(ctx));
            }
        }

        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        // Lost the race to another producer; reuse its record.
        if let Some(ctx) = inner.get(name) {
            return Ok(Arc::clone(ctx));
        }

        let parts = buff_len.div_ceil(partition_bound);
        let base = self.next_key.fetch_add(parts as u64, Ordering::SeqCst);
        let key_list: Vec<u64> = (base..base + parts as u64).collect();

        debug!(
            name,
            buff_len,
            parts,
            first_key = key_list[0],
            "registered tensor"
        );

        let ctx = Arc::new(TensorContext {
            name: name.to_string(),
            key_list,
            buff_len,
            buffers: OnceLock::new(),
            initialized: AtomicBool::new(false),
        });
        inner.insert(name.to_string(), Arc::clone(&ctx));
        Ok(ctx)
    }

    /// The registration record for `name`, if one exists.
    pub fn get(&self, name: &str) -> Result<Arc<TensorContext>> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .get(name)
            .cloned()
            .ok_or_else(|| SyncError::Uninitialized(format!("no context for tensor {name}")))
    }

    /// True iff a context exists under `name` with a matching byte length.
    pub fn is_tensor_initialized(&self, name: &str, size: usize) -> bool {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.get(name).is_some_and(|ctx| ctx.buff_len == size)
    }

    /// Drop all records, releasing any engine-owned staging memory.
    pub fn clear(&self) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.clear();
    }
}

impl Default for ContextRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use gradsync_shm::HeapRegion;

    #[test]
    fn registration_allocates_consecutive_keys() {
        let registry = ContextRegistry::new();
        let a = registry.get_or_register("a", 9, 4).unwrap();
        let b = registry.get_or_register("b", 4, 4).unwrap();

        assert_eq!(a.key_list(), &[0, 1, 2]);
        assert_eq!(b.key_list(), &[3]);
    }

    #[test]
    fn reregistration_returns_same_record() {
        let registry = ContextRegistry::new();
        let first = registry.get_or_register("t", 10, 4).unwrap();
        let again = registry.get_or_register("t", 10, 4).unwrap();
        assert!(Arc::ptr_eq(&first, &again));
    }

    #[test]
    fn size_change_is_rejected() {
        let registry = ContextRegistry::new();
        registry.get_or_register("t", 10, 4).unwrap();
        let err = registry.get_or_register("t", 12, 4).unwrap_err();
        assert!(matches!(err, SyncError::InvariantViolation(_)));
    }

    #[test]
    fn zero_length_is_rejected() {
        let registry = ContextRegistry::new();
        assert!(registry.get_or_register("t", 0, 4).is_err());
    }

    #[test]
    fn is_tensor_initialized_checks_size() {
        let registry = ContextRegistry::new();
        registry.get_or_register("t", 10, 4).unwrap();
        assert!(registry.is_tensor_initialized("t", 10));
        assert!(!registry.is_tensor_initialized("t", 11));
        assert!(!registry.is_tensor_initialized("u", 10));
    }

    #[test]
    fn buffers_bind_once() {
        let registry = ContextRegistry::new();
        let ctx = registry.get_or_register("t", 8, 4).unwrap();
        assert!(ctx.buffers().is_err());

        ctx.bind_buffers(StagingBuffers {
            cpubuff: Arc::new(HeapRegion::zeroed(8)),
            pcie_cpubuff: vec![],
            reuse_buff: false,
        });
        ctx.bind_buffers(StagingBuffers {
            cpubuff: Arc::new(HeapRegion::zeroed(99)),
            pcie_cpubuff: vec![],
            reuse_buff: true,
        });

        let bufs = ctx.buffers().unwrap();
        assert_eq!(bufs.cpubuff.len(), 8);
        assert!(!bufs.reuse_buff);
    }

    #[test]
    fn unknown_name_is_uninitialized() {
        let registry = ContextRegistry::new();
        assert!(matches!(
            registry.get("nope").unwrap_err(),
            SyncError::Uninitialized(_)
        ));
    }
}

//! Engine lifecycle and the producer-facing surface.
//!
//! The [`Engine`] owns the scheduler: the context registry, one scheduled
//! queue per active stage, and one worker thread per queue. Producers
//! (framework-binding threads) call [`Engine::enqueue_tensor`] concurrently;
//! completion is asynchronous through the supplied callback. The init
//! protocol runs on the calling thread.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tracing::{debug, info, trace, warn};

use gradsync_shm::HostRegion;
use gradsync_types::config::{RoleFlags, TopologyConfig};
use gradsync_types::dtype::{command_type, RequestType, TensorDtype};
use gradsync_types::error::{Result, SyncError};
use gradsync_types::stage::StageId;

use crate::capability::{
    Collective, Coordinator, DeviceTensor, PsClient, ReadyEvent, StagingAllocator,
};
use crate::context::{ContextRegistry, StagingBuffers, TensorContext};
use crate::itinerary::{active_stages, pull_queue_list, push_queue_list};
use crate::loops;
use crate::partition::partition_task;
use crate::queue::ScheduledQueue;
use crate::task::{StatusCallback, SyncTask};

// ── Capabilities ──────────────────────────────────────────────────────────────

/// The external services the engine drives. All are assumed thread-safe.
pub struct Capabilities {
    pub ps: Arc<dyn PsClient>,
    pub collective: Arc<dyn Collective>,
    pub coordinator: Arc<dyn Coordinator>,
    pub allocator: Arc<dyn StagingAllocator>,
}

// ── Shared state ──────────────────────────────────────────────────────────────

/// State shared between the producer surface and the stage workers.
pub(crate) struct EngineShared {
    pub(crate) topology: TopologyConfig,
    pub(crate) role: RoleFlags,
    pub(crate) registry: ContextRegistry,
    pub(crate) queues: HashMap<StageId, ScheduledQueue>,
    pub(crate) caps: Capabilities,
    pub(crate) shutdown: AtomicBool,
}

impl EngineShared {
    pub(crate) fn build(topology: TopologyConfig, caps: Capabilities) -> Arc<Self> {
        let role = RoleFlags::derive(&topology, caps.collective.is_signal_root());
        let queues = active_stages(&role)
            .into_iter()
            .map(|stage| (stage, ScheduledQueue::new(stage)))
            .collect();
        Arc::new(Self {
            topology,
            role,
            registry: ContextRegistry::new(),
            queues,
            caps,
            shutdown: AtomicBool::new(false),
        })
    }

    /// The scheduled queue for `stage`. Routing a task to a stage outside
    /// the active set is a scheduler bug, not a runtime condition.
    pub(crate) fn queue(&self, stage: StageId) -> &ScheduledQueue {
        self.queues
            .get(&stage)
            .unwrap_or_else(|| panic!("no scheduled queue for stage {stage}"))
    }
}

// ── Engine ────────────────────────────────────────────────────────────────────

pub struct Engine {
    shared: Arc<EngineShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl Engine {
    /// Bootstrap the engine: snapshot role flags, build one queue per
    /// active stage, and spawn the stage workers.
    pub fn init(topology: TopologyConfig, caps: Capabilities) -> Result<Arc<Self>> {
        let shared = EngineShared::build(topology, caps);
        let workers = loops::spawn_stage_loops(&shared)?;
        info!(
            rank = shared.topology.rank(),
            size = shared.topology.size(),
            role = ?shared.role,
            workers = workers.len(),
            "engine started"
        );
        Ok(Arc::new(Self {
            shared,
            workers: Mutex::new(workers),
            stopped: AtomicBool::new(false),
        }))
    }

    /// Stop admitting work, join the stage workers, and release
    /// engine-owned staging memory. In-flight tasks do not fire callbacks.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.shutdown.store(true, Ordering::Release);
        for queue in self.shared.queues.values() {
            queue.wake();
        }
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        for handle in workers.drain(..) {
            if handle.join().is_err() {
                warn!("stage worker panicked during shutdown");
            }
        }
        self.shared.registry.clear();
        info!("engine shut down");
    }

    // ── Accessors ────────────────────────────────────────────────────────

    pub fn rank(&self) -> u32 {
        self.shared.topology.rank()
    }

    pub fn local_rank(&self) -> u32 {
        self.shared.topology.local_rank
    }

    pub fn size(&self) -> u32 {
        self.shared.topology.size()
    }

    pub fn local_size(&self) -> u32 {
        self.shared.topology.local_size
    }

    pub fn role(&self) -> &RoleFlags {
        &self.shared.role
    }

    /// OK iff the engine is up and not shut down.
    pub fn check_initialized(&self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(SyncError::ShutdownInProgress);
        }
        Ok(())
    }

    /// Push itinerary for the engine's role and the given device.
    pub fn push_queue_list(&self, device: i32) -> Vec<StageId> {
        push_queue_list(device, &self.shared.role)
    }

    /// Pull itinerary for the engine's role and the given device.
    pub fn pull_queue_list(&self, device: i32) -> Vec<StageId> {
        pull_queue_list(device, &self.shared.role)
    }

    // ── Registration ─────────────────────────────────────────────────────

    pub fn get_or_register(&self, name: &str, buff_len: usize) -> Result<Arc<TensorContext>> {
        self.shared
            .registry
            .get_or_register(name, buff_len, self.shared.topology.partition_bound)
    }

    pub fn get_context(&self, name: &str) -> Result<Arc<TensorContext>> {
        self.shared.registry.get(name)
    }

    pub fn is_tensor_initialized(&self, name: &str, size: usize) -> bool {
        self.shared.registry.is_tensor_initialized(name, size)
    }

    // ── Init protocol ────────────────────────────────────────────────────

    /// Bind staging buffers to `context` and, on the distributed root
    /// device, seed the parameter server with the tensor's initial bytes.
    ///
    /// Worker 0 pushes each partition window; every worker then passes a
    /// worker-group barrier per partition, so all workers observe the same
    /// initial state before any training-time pull. Re-initializing an
    /// initialized context is a no-op.
    pub fn init_tensor(
        &self,
        context: &Arc<TensorContext>,
        dtype: TensorDtype,
        cpubuff: Option<Arc<dyn HostRegion>>,
    ) -> Result<()> {
        if context.is_initialized() {
            debug!(name = %context.name(), "already initialized, skipped");
            return Ok(());
        }

        let size = context.buff_len();
        let bound = self.shared.topology.partition_bound;
        let parts = context.key_list().len();
        if parts == 0 || parts != size.div_ceil(bound) {
            return Err(SyncError::InvariantViolation(format!(
                "{}: {parts} keys for {size} bytes at bound {bound}",
                context.name()
            )));
        }

        trace!(name = %context.name(), size, parts, "begin tensor init");

        match cpubuff {
            Some(buff) => {
                if buff.len() < size {
                    return Err(SyncError::InvariantViolation(format!(
                        "{}: caller buffer is {} bytes, need {size}",
                        context.name(),
                        buff.len()
                    )));
                }
                context.bind_buffers(StagingBuffers {
                    cpubuff: buff,
                    pcie_cpubuff: Vec::new(),
                    reuse_buff: true,
                });
            }
            None => {
                // The first key indexes the shared-memory segment.
                let first_key = context.key_list()[0];
                if self.shared.role.is_cross_pcie_switch {
                    let regions = self
                        .shared
                        .caps
                        .allocator
                        .open_pcie_shared_memory(first_key, size)?;
                    let canonical = regions.last().cloned().ok_or_else(|| {
                        SyncError::InvariantViolation(format!(
                            "{}: allocator returned no per-switch regions",
                            context.name()
                        ))
                    })?;
                    context.bind_buffers(StagingBuffers {
                        cpubuff: canonical,
                        pcie_cpubuff: regions,
                        reuse_buff: false,
                    });
                } else {
                    let region = self
                        .shared
                        .caps
                        .allocator
                        .open_shared_memory(first_key, size)?;
                    context.bind_buffers(StagingBuffers {
                        cpubuff: region,
                        pcie_cpubuff: Vec::new(),
                        reuse_buff: false,
                    });
                }
            }
        }

        if self.shared.role.is_distributed && self.shared.role.is_root_device {
            let bufs = context.buffers()?;
            let cmd = command_type(RequestType::DefaultPushPull, dtype);
            let mut accumulated = 0usize;
            for &key in context.key_list() {
                let len = (size - accumulated).min(bound);
                // Only worker 0 seeds initial values.
                if self.shared.topology.worker_id == 0 {
                    let keys = self.shared.caps.ps.encode_key(key, len);
                    // Safety: init runs before any stage touches this
                    // context's windows.
                    let val = unsafe { bufs.cpubuff.window(accumulated, len) };
                    let handle = self.shared.caps.ps.z_push(&keys, val, cmd)?;
                    self.shared.caps.ps.wait(handle)?;
                }
                self.shared.caps.ps.barrier()?;
                accumulated += len;
            }
        }

        context.mark_initialized();
        trace!(name = %context.name(), size, parts, "finished tensor init");
        Ok(())
    }

    /// [`Engine::init_tensor`] plus the user callback, fired with OK on the
    /// calling thread.
    pub fn enqueue_tensor_init(
        &self,
        context: &Arc<TensorContext>,
        dtype: TensorDtype,
        cpubuff: Option<Arc<dyn HostRegion>>,
        callback: StatusCallback,
    ) -> Result<()> {
        self.init_tensor(context, dtype, cpubuff)?;
        callback(Ok(()));
        Ok(())
    }

    // ── Enqueue protocol ─────────────────────────────────────────────────

    /// Submit one round of synchronization for a tensor.
    ///
    /// The tensor is partitioned along the context's key list and every
    /// partition is appended to the head stage of `queue_list`. An empty
    /// `queue_list` (CPU tensors) completes synchronously with OK. The
    /// callback fires exactly once, after the last partition leaves its
    /// last stage.
    pub fn enqueue_tensor(
        &self,
        context: Arc<TensorContext>,
        input: Option<Arc<dyn DeviceTensor>>,
        output: Option<Arc<dyn DeviceTensor>>,
        ready_event: Option<Arc<dyn ReadyEvent>>,
        device: i32,
        priority: i32,
        version: u64,
        callback: StatusCallback,
        queue_list: Vec<StageId>,
    ) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) || self.shared.shutdown.load(Ordering::Acquire) {
            return Err(SyncError::ShutdownInProgress);
        }

        if let (Some(input), Some(output)) = (&input, &output) {
            if input.size_bytes() != output.size_bytes() {
                return Err(SyncError::InvariantViolation(format!(
                    "{}: input is {} bytes, output is {}",
                    context.name(),
                    input.size_bytes(),
                    output.size_bytes()
                )));
            }
        }

        for stage in &queue_list {
            if !self.shared.queues.contains_key(stage) {
                return Err(SyncError::InvariantViolation(format!(
                    "{}: stage {stage} is not active for this role",
                    context.name()
                )));
            }
        }

        let parent = SyncTask {
            name: context.name().to_string(),
            context: Arc::clone(&context),
            key: 0,
            offset: 0,
            len: 0,
            tensor: input,
            output,
            device,
            priority,
            version,
            ready_event,
            queue_list: queue_list.clone(),
            cursor: 0,
            callback,
            counter: Arc::new(AtomicUsize::new(0)),
            total_partnum: context.key_list().len(),
        };
        let size = parent.parent_size();

        let mut partitions = partition_task(&parent, self.shared.topology.partition_bound)?;

        if queue_list.is_empty() {
            debug!(name = %parent.name, device, "no queue list assigned, skipped");
            (parent.callback)(Ok(()));
            return Ok(());
        }

        let mut accumulated = 0usize;
        for (i, task) in partitions.iter_mut().enumerate() {
            task.key = context.key_list()[i];
            accumulated += task.len;
            trace!(
                name = %task.name,
                key = task.key,
                offset = task.offset,
                len = task.len,
                device = task.device,
                rank = self.shared.topology.local_rank,
                "enqueue partition"
            );
        }
        if accumulated != size {
            return Err(SyncError::InvariantViolation(format!(
                "{}: partitions cover {accumulated} of {size} bytes",
                context.name()
            )));
        }

        let head = self.shared.queue(queue_list[0]);
        for task in partitions {
            head.add_task(task);
        }

        trace!(name = %context.name(), rank = self.shared.topology.local_rank, "enqueue finished");
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

//! Stage worker loops.
//!
//! One dedicated OS thread per active stage. A loop parks on its queue,
//! pulls the next admissible task, drives the stage's capability, and hands
//! the task to the next queue in its itinerary — or, when the itinerary is
//! exhausted, records the partition's completion.
//!
//! Errors from capabilities are not retried: the loop logs and aborts the
//! process. The job controller restarts crashed training jobs; a wedged
//! gradient pipeline must not limp along.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, trace};

use gradsync_types::dtype::{command_type, RequestType};
use gradsync_types::error::{Result, SyncError};
use gradsync_types::stage::StageId;

use crate::engine::EngineShared;
use crate::itinerary::active_stages;
use crate::reduce::sum_into;
use crate::signal::CoordSignal;
use crate::task::SyncTask;

/// How long an idle worker parks before re-polling readiness events.
const PARK_TIMEOUT: Duration = Duration::from_millis(5);

/// Spawn one worker per active stage for this role.
pub(crate) fn spawn_stage_loops(shared: &Arc<EngineShared>) -> Result<Vec<JoinHandle<()>>> {
    active_stages(&shared.role)
        .into_iter()
        .map(|stage| {
            let shared = Arc::clone(shared);
            thread::Builder::new()
                .name(stage.thread_name().to_string())
                .spawn(move || stage_loop(shared, stage))
                .map_err(|e| SyncError::CapabilityFailure {
                    stage: stage.as_str().into(),
                    reason: format!("failed to spawn worker: {e}"),
                })
        })
        .collect()
}

fn stage_loop(shared: Arc<EngineShared>, stage: StageId) {
    debug!(stage = %stage, "stage worker started");
    while !shared.shutdown.load(Ordering::Acquire) {
        let Some(task) = shared.queue(stage).wait_for_task(PARK_TIMEOUT) else {
            continue;
        };
        trace!(
            stage = %stage,
            name = %task.name,
            key = task.key,
            offset = task.offset,
            len = task.len,
            "stage running"
        );
        if let Err(err) = run_stage(&shared, stage, &task) {
            error!(
                stage = %stage,
                name = %task.name,
                key = task.key,
                %err,
                "unrecoverable stage failure"
            );
            std::process::abort();
        }
        shared.queue(stage).recover_credit(task.len);
        advance_task(&shared, task);
    }
    debug!(stage = %stage, "stage worker stopped");
}

/// Drive one stage's capability for one task.
pub(crate) fn run_stage(shared: &EngineShared, stage: StageId, task: &SyncTask) -> Result<()> {
    match stage {
        StageId::Reduce => {
            let input = task
                .tensor
                .as_ref()
                .or(task.output.as_ref())
                .ok_or_else(|| {
                    SyncError::InvariantViolation(format!("{}: no device buffer", task.name))
                })?;
            let output = task.output_or_tensor()?;
            shared
                .caps
                .collective
                .reduce(input.as_ref(), output.as_ref(), task.offset, task.len)
        }

        StageId::Broadcast => {
            let output = task.output_or_tensor()?;
            shared
                .caps
                .collective
                .broadcast(output.as_ref(), task.offset, task.len)
        }

        StageId::CoordinateReduce | StageId::CoordinateBroadcast | StageId::CoordinatePush => {
            shared.caps.coordinator.rendezvous(&CoordSignal {
                src_rank: shared.topology.rank(),
                stage,
                key: task.key,
            })
        }

        StageId::CopyD2h => {
            let bufs = task.context.buffers()?;
            let input = task
                .tensor
                .as_ref()
                .or(task.output.as_ref())
                .ok_or_else(|| {
                    SyncError::InvariantViolation(format!("{}: no device buffer", task.name))
                })?;
            // Safety: sibling partitions hold disjoint windows, and a
            // partition visits its stages strictly in sequence.
            let dst = unsafe { bufs.cpubuff.window(task.offset, task.len) };
            input.copy_to_host(task.offset, dst)
        }

        StageId::PcieReduce => {
            let bufs = task.context.buffers()?;
            let switches = bufs.pcie_cpubuff.len();
            if switches > 1 {
                let dtype = task.dtype()?;
                // Safety: disjoint windows, see CopyD2h.
                let dst = unsafe { bufs.cpubuff.window(task.offset, task.len) };
                for region in &bufs.pcie_cpubuff[..switches - 1] {
                    let src = unsafe { region.window(task.offset, task.len) };
                    sum_into(dst, src, dtype)?;
                }
            }
            Ok(())
        }

        StageId::Push => {
            let bufs = task.context.buffers()?;
            let keys = shared.caps.ps.encode_key(task.key, task.len);
            let cmd = command_type(RequestType::DefaultPushPull, task.dtype()?);
            // Safety: disjoint windows, see CopyD2h.
            let src = unsafe { bufs.cpubuff.window(task.offset, task.len) };
            let handle = shared.caps.ps.z_push(&keys, src, cmd)?;
            shared.caps.ps.wait(handle)
        }

        StageId::Pull => {
            let bufs = task.context.buffers()?;
            let keys = shared.caps.ps.encode_key(task.key, task.len);
            let cmd = command_type(RequestType::DefaultPushPull, task.dtype()?);
            // Safety: disjoint windows, see CopyD2h.
            let dst = unsafe { bufs.cpubuff.window(task.offset, task.len) };
            let handle = shared.caps.ps.z_pull(&keys, dst, cmd)?;
            shared.caps.ps.wait(handle)
        }

        StageId::CopyH2d => {
            let bufs = task.context.buffers()?;
            let output = task.output_or_tensor()?;
            // Safety: disjoint windows, see CopyD2h.
            let src = unsafe { bufs.cpubuff.window(task.offset, task.len) };
            output.copy_from_host(task.offset, src)
        }
    }
}

/// Hand the task to the next stage of its itinerary, or record completion.
pub(crate) fn advance_task(shared: &EngineShared, mut task: Box<SyncTask>) {
    match task.advance() {
        Some(next) => {
            trace!(name = %task.name, key = task.key, next = %next, "task advanced");
            shared.queue(next).add_task(task);
        }
        None => {
            trace!(name = %task.name, key = task.key, "task finished itinerary");
            task.finish();
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

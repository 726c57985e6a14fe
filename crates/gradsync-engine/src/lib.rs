//! `gradsync-engine` — control plane of the gradient synchronization engine.
//!
//! Training workers submit tensors for collective reduction; the engine
//! partitions each tensor, routes the pieces through a role-derived sequence
//! of stages, and fires the user's completion callback once every piece has
//! traversed its itinerary.
//!
//! ```text
//!            ┌──────────┐   ┌─────────┐   ┌──────┐
//! enqueue ──▶│  REDUCE  │──▶│ COPYD2H │──▶│ PUSH │──▶ counter──▶ callback
//!   (×N      └──────────┘   └─────────┘   └──────┘      (last
//! partitions)  one worker thread per active stage       partition)
//! ```
//!
//! The physical transports are consumed as opaque capabilities (see
//! [`capability`]): the parameter-server client, the intra-node collective,
//! the coordination channel, and device memory. This crate owns only the
//! scheduling: queues, worker loops, partition accounting, and the
//! registration/init lifecycle.

pub mod capability;
pub mod context;
pub mod engine;
pub mod itinerary;
pub mod loopback;
pub mod loops;
pub mod partition;
pub mod queue;
pub mod reduce;
pub mod signal;
pub mod task;

// ── Public re-exports ────────────────────────────────────────────────────────

pub use capability::{
    Collective, Coordinator, DeviceTensor, EncodedKey, OpHandle, PsClient,
    ReadyEvent, StagingAllocator,
};
pub use context::{ContextRegistry, StagingBuffers, TensorContext};
pub use engine::{Capabilities, Engine};
pub use itinerary::{active_stages, pull_queue_list, push_queue_list};
pub use loopback::loopback_capabilities;
pub use partition::partition_task;
pub use queue::ScheduledQueue;
pub use signal::{decode_signal, encode_signal, CoordSignal};
pub use task::{StatusCallback, SyncTask};

pub use gradsync_types::error::{Result, Status, SyncError};

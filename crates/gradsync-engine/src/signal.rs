//! Coordination signal codec.
//!
//! Non-root participants rendezvous with their root through fixed-shape
//! messages: source rank, the stage being coordinated, and the partition
//! key. Messages are serialized with bincode (standard config) so a
//! socket- or shm-channel-backed [`crate::capability::Coordinator`] can
//! frame them directly.

use serde::{Deserialize, Serialize};

use gradsync_types::error::{Result, SyncError};
use gradsync_types::stage::StageId;

/// One coordination message from a non-root participant to its root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordSignal {
    /// Global rank of the sender.
    pub src_rank: u32,
    /// The stage being coordinated.
    pub stage: StageId,
    /// Partition key the sender is ready to advance.
    pub key: u64,
}

/// Encode a [`CoordSignal`] for the node-local coordination channel.
pub fn encode_signal(signal: &CoordSignal) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(signal, bincode::config::standard())
        .map_err(|e| SyncError::Serialization(e.to_string()))
}

/// Decode a [`CoordSignal`] from channel bytes.
pub fn decode_signal(data: &[u8]) -> Result<CoordSignal> {
    let (signal, _) =
        bincode::serde::decode_from_slice(data, bincode::config::standard())
            .map_err(|e| SyncError::Serialization(e.to_string()))?;
    Ok(signal)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

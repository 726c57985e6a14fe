/// Top-level error type shared across the GradSync crates.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncError {
    /// An API was called before `init()` or before a tensor's context was
    /// registered.
    #[error("not initialized: {0}")]
    Uninitialized(String),

    /// Size mismatch, key-count mismatch, or partition accounting error.
    /// Indicates programmer error in the framework binding.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// An underlying collective, copy, or network capability reported a
    /// non-recoverable error. The stage loops treat this as fatal.
    #[error("capability failure in {stage}: {reason}")]
    CapabilityFailure { stage: String, reason: String },

    /// Enqueue was attempted after shutdown; the completion callback is
    /// never fired for these.
    #[error("shutdown in progress")]
    ShutdownInProgress,

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Completion status delivered to the user callback.
pub type Status = std::result::Result<(), SyncError>;

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Crate-local error type for shared-memory operations.
#[derive(Debug, thiserror::Error)]
pub enum ShmError {
    #[error("failed to create region {name}: {reason}")]
    Create { name: String, reason: String },

    #[error("failed to open region {name}: {reason}")]
    Open { name: String, reason: String },

    #[error("region {name} is {actual} bytes, need {expected}")]
    SizeMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, ShmError>;

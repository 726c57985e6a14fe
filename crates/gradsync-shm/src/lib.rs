//! POSIX shared-memory staging buffers.
//!
//! Tensor bytes cross process boundaries (device workers, the root device's
//! push/pull loops) through named shared-memory regions. A region is keyed
//! by the first partition key of the tensor that owns it, so every process
//! on the node derives the same name without coordination.

pub mod allocator;
pub mod error;
pub mod region;

pub use allocator::ShmAllocator;
pub use error::ShmError;
pub use region::{HeapRegion, HostRegion, SharedRegion};

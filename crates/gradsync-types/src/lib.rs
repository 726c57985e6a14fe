pub mod config;
pub mod dtype;
pub mod error;
pub mod stage;

pub use config::{RoleFlags, TopologyConfig, CPU_DEVICE_ID};
pub use dtype::{command_type, RequestType, TensorDtype};
pub use error::{Status, SyncError};
pub use stage::StageId;

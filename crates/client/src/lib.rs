pub mod bridge;
#[cfg(feature = "ffi")]
pub mod ffi;

pub use bridge::Bridge;
pub use nbx_common::{BridgeConfig, IpcReadMode, NbxError, PartitionId, Result, TaskId};
pub use nbx_execution::{ExportCursor, ImportCursor, RowLayout};
pub use nbx_shuffle::Segment;

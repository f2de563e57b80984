//! Execution-layer primitives for exchanging Arrow batches with a native engine.
//!
//! Architecture role:
//! - task lifetime and completion hooks that drive deterministic cleanup
//! - batch stream abstractions for the native side
//! - the rendezvous channel plus the import/export cursors built on it
//!
//! Key modules:
//! - [`context`]
//! - [`channel`]
//! - [`descriptor`]
//! - [`import`]
//! - [`export`]
//! - [`producer`]
//! - [`rows`]
//! - [`stream`]
//!
//! Feature flags:
//! - none; Arrow is always built with its `ffi` feature.

pub mod channel;
pub mod context;
pub mod descriptor;
pub mod export;
pub mod import;
pub mod producer;
pub mod rows;
pub mod stream;

// Re-export only what you want at the crate root (no globs).
pub use channel::{BatchChannel, Handoff, ProducerEndpoint, ServeOutcome};
pub use context::{SharedTaskContext, TaskContext, TaskOutcome};
pub use descriptor::{DescriptorHandles, DescriptorPair};
pub use export::{ExportBatch, ExportCursor};
pub use import::{ImportCursor, ImportMetricsSnapshot, ImportRows};
pub use producer::{BatchProducer, ProducerHandle, StreamProducer, ThreadedProducer};
pub use rows::RowLayout;
pub use stream::{RecordBatchStream, SendableRecordBatchStream, StreamAdapter, iter_stream};

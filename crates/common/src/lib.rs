//! Shared configuration, error types, ids and observability primitives for NBX crates.
//!
//! Architecture role:
//! - defines the bridge configuration passed to cursors and frame readers
//! - provides common [`NbxError`] / [`Result`] contracts
//! - hosts the prometheus metrics registry and the memory pool used for
//!   accounting batches held by cursors
//!
//! Key modules:
//! - [`config`]
//! - [`error`]
//! - [`ids`]
//! - [`memory`]
//! - [`metrics`]

pub mod config;
pub mod error;
pub mod ids;
pub mod memory;
pub mod metrics;

pub use config::{BridgeConfig, IpcReadMode};
pub use error::{NbxError, Result};
pub use ids::*;
pub use memory::{MemoryPool, MemoryReservation};
pub use metrics::MetricsRegistry;

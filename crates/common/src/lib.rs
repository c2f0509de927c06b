#![deny(missing_docs)]

//! Shared configuration, error types, IDs, and observability primitives for
//! ShuffleFlow crates.
//!
//! Architecture role:
//! - defines executor configuration passed across layers
//! - provides common [`SflError`] / [`Result`] contracts
//! - hosts the typed identifier hierarchy and metrics registry
//!
//! Key modules:
//! - [`config`]
//! - [`error`]
//! - [`ids`]
//! - [`metrics`]

/// Executor and per-stage write configuration types.
pub mod config;
/// Shared error taxonomy.
pub mod error;
/// Strongly-typed identifier wrappers.
pub mod ids;
/// Metrics registry and Prometheus rendering helpers.
pub mod metrics;

pub use config::{ExecutorConfig, ShuffleWriteConfig};
pub use error::{Result, SflError};
pub use ids::*;
pub use metrics::{global_metrics, MetricsRegistry};

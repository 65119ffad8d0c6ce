//! Shared configuration, error types, IDs, and observability primitives for sift crates.
//!
//! Architecture role:
//! - defines dynamic-filter and scheduler configuration passed across layers
//! - provides common [`SiftError`] / [`Result`] contracts
//! - hosts the prometheus metrics registry used by the coordinator
//!
//! Key modules:
//! - [`config`]
//! - [`error`]
//! - [`ids`]
//! - [`metrics`]

pub mod config;
pub mod error;
pub mod ids;
pub mod metrics;

pub use config::{DynamicFilterConfig, SchedulerConfig};
pub use error::{Result, SiftError};
pub use ids::*;
pub use metrics::MetricsRegistry;

//! Coordinator configuration for dynamic filtering and split scheduling.
//!
//! Both structs are plain serde values with defaults; `from_env` overlays
//! `SIFT_*` environment variables on top of the defaults.

use std::env;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SiftError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
/// Dynamic filter service knobs.
pub struct DynamicFilterConfig {
    /// When false no query is registered and every consumer sees "no filtering".
    pub enabled: bool,
    /// Size of the bounded aggregation pool.
    pub service_thread_count: usize,
    /// Range count a published summary is simplified down to.
    pub max_domain_ranges: usize,
    /// Discrete values kept in a summary before it collapses to its span.
    pub max_discrete_values: usize,
}

impl Default for DynamicFilterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            service_thread_count: 2,
            max_domain_ranges: 100,
            max_discrete_values: 1_000,
        }
    }
}

impl DynamicFilterConfig {
    /// Defaults overlaid with `SIFT_DYNAMIC_FILTER_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let d = Self::default();
        let cfg = Self {
            enabled: env_or_default("SIFT_DYNAMIC_FILTER_ENABLED", d.enabled)?,
            service_thread_count: env_or_default(
                "SIFT_DYNAMIC_FILTER_SERVICE_THREADS",
                d.service_thread_count,
            )?,
            max_domain_ranges: env_or_default(
                "SIFT_DYNAMIC_FILTER_MAX_DOMAIN_RANGES",
                d.max_domain_ranges,
            )?,
            max_discrete_values: env_or_default(
                "SIFT_DYNAMIC_FILTER_MAX_DISCRETE_VALUES",
                d.max_discrete_values,
            )?,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.service_thread_count == 0 {
            return Err(SiftError::InvalidConfig(
                "dynamic filter service_thread_count must be > 0".to_string(),
            ));
        }
        if self.max_domain_ranges == 0 {
            return Err(SiftError::InvalidConfig(
                "dynamic filter max_domain_ranges must be > 0".to_string(),
            ));
        }
        if self.max_discrete_values == 0 {
            return Err(SiftError::InvalidConfig(
                "dynamic filter max_discrete_values must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
/// Source-stage split scheduling knobs.
pub struct SchedulerConfig {
    /// Hard cap on splits assigned but not yet finished on one node, across all tasks.
    pub max_splits_per_node: usize,
    /// Cap on queued (not yet started) splits for one task.
    pub max_pending_splits_per_task: usize,
    /// Max splits requested from a split source per fetch.
    pub split_batch_size: usize,
    /// Prefer a remotely accessible split's listed hosts while they have capacity.
    pub optimized_local_scheduling: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_splits_per_node: 100,
            max_pending_splits_per_task: 10,
            split_batch_size: 1_000,
            optimized_local_scheduling: true,
        }
    }
}

impl SchedulerConfig {
    /// Defaults overlaid with `SIFT_SCHEDULER_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let d = Self::default();
        let cfg = Self {
            max_splits_per_node: env_or_default(
                "SIFT_SCHEDULER_MAX_SPLITS_PER_NODE",
                d.max_splits_per_node,
            )?,
            max_pending_splits_per_task: env_or_default(
                "SIFT_SCHEDULER_MAX_PENDING_SPLITS_PER_TASK",
                d.max_pending_splits_per_task,
            )?,
            split_batch_size: env_or_default(
                "SIFT_SCHEDULER_SPLIT_BATCH_SIZE",
                d.split_batch_size,
            )?,
            optimized_local_scheduling: env_or_default(
                "SIFT_SCHEDULER_OPTIMIZED_LOCAL_SCHEDULING",
                d.optimized_local_scheduling,
            )?,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_splits_per_node == 0 {
            return Err(SiftError::InvalidConfig(
                "max_splits_per_node must be > 0".to_string(),
            ));
        }
        if self.max_pending_splits_per_task == 0 {
            return Err(SiftError::InvalidConfig(
                "max_pending_splits_per_task must be > 0".to_string(),
            ));
        }
        if self.split_batch_size == 0 {
            return Err(SiftError::InvalidConfig(
                "split_batch_size must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_or_default<T: FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| SiftError::InvalidConfig(format!("{key}: cannot parse '{raw}'"))),
        Err(_) => Ok(default),
    }
}

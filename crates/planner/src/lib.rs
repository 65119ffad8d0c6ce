//! Plan-side building blocks consumed by the sift coordinator.
//!
//! - [`domain`]: immutable predicate values (`Domain`, `TupleDomain`)
//! - [`plan`]: fragment trees with explicit dynamic filter producers/consumers
//! - [`dynamic_filters`]: deadlock-avoidance classification of filter ids

pub mod domain;
pub mod dynamic_filters;
pub mod plan;

pub use domain::*;
pub use dynamic_filters::*;
pub use plan::*;

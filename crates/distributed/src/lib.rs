//! Coordinator-side dynamic filtering and split scheduling for source-distributed stages.
//!
//! Architecture role:
//! - [`filter_service`] collects per-task partial domains into one summary per filter
//! - [`dynamic_filter`] exposes published summaries to probe-side execution
//! - [`scheduler`] places source splits onto worker tasks under node capacity limits
//!
//! Key modules:
//! - [`filter_service`]
//! - [`dynamic_filter`]
//! - [`placement`]
//! - [`scheduler`]
//! - [`split_source`]

pub mod dynamic_filter;
pub mod filter_service;
pub mod nodes;
pub mod placement;
pub mod pool;
pub mod scheduler;
pub mod signal;
pub mod split_source;
pub mod stage;
pub mod task;

pub use dynamic_filter::{CoordinatorDynamicFilter, DynamicFilter, EmptyDynamicFilter};
pub use filter_service::{DynamicFilterDomainStats, DynamicFilterService, DynamicFiltersStats};
pub use nodes::{InMemoryNodeManager, InternalNode, NodeManager, NodeTaskMap};
pub use placement::{DynamicSplitPlacementPolicy, SplitPlacementResult};
pub use pool::AggregationPool;
pub use scheduler::{
    BlockedReason, BufferUtilization, ScheduleResult, SchedulerState, SourcePartitionedScheduler,
};
pub use signal::CompletionSignal;
pub use split_source::{
    BlockedSplitSource, FixedSplitSource, QueuedSplitSource, SplitBatch, SplitQueue, SplitSource,
};
pub use stage::{StageExecution, StageState};
pub use task::{InMemoryRemoteTask, InMemoryRemoteTaskFactory, RemoteTask, RemoteTaskFactory, Split};

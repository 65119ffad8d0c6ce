//! Typed identifiers shared across coordinator components.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable query identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueryId(
    /// Raw numeric id value.
    pub u64,
);

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stage identifier: owning query plus stage ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StageId {
    /// Owning query.
    pub query_id: QueryId,
    /// Stage ordinal within the query.
    pub id: u32,
}

impl StageId {
    pub fn new(query_id: QueryId, id: u32) -> Self {
        Self { query_id, id }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.query_id, self.id)
    }
}

/// Task identifier: owning stage plus task ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId {
    /// Owning stage.
    pub stage_id: StageId,
    /// Task ordinal within the stage.
    pub id: u32,
}

impl TaskId {
    pub fn new(stage_id: StageId, id: u32) -> Self {
        Self { stage_id, id }
    }

    pub fn query_id(&self) -> QueryId {
        self.stage_id.query_id
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.stage_id, self.id)
    }
}

/// Identifier of a dynamic filter produced by one join/semi-join node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DynamicFilterId(
    /// Raw numeric id value.
    pub u64,
);

impl fmt::Display for DynamicFilterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "df_{}", self.0)
    }
}

/// Stable worker node identifier assigned by cluster membership.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(
    /// Raw node name.
    pub String,
);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a plan fragment (one fragment per stage).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FragmentId(
    /// Raw numeric id value.
    pub u32,
);

impl fmt::Display for FragmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

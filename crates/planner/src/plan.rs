use serde::{Deserialize, Serialize};
use sift_common::{DynamicFilterId, FragmentId};
use std::collections::BTreeMap;
use std::fmt;

/// Plan-level variable name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Symbol(pub String);

impl Symbol {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Connector column a probe-side symbol resolves to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ColumnHandle(pub String);

impl ColumnHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

impl fmt::Display for ColumnHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlanNodeId(pub u32);

/// Comparison applied between the probe input and the collected build values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComparisonOperator {
    Equal,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
}

/// Reference to a dynamic filter from a probe-side predicate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DynamicFilterDescriptor {
    pub id: DynamicFilterId,
    /// Probe-side input the filter constrains.
    pub input: Symbol,
    pub operator: ComparisonOperator,
    /// Nulls on the probe side survive (`IS NOT DISTINCT FROM` joins).
    #[serde(default)]
    pub null_allowed: bool,
}

impl DynamicFilterDescriptor {
    pub fn equal(id: DynamicFilterId, input: Symbol) -> Self {
        Self {
            id,
            input,
            operator: ComparisonOperator::Equal,
            null_allowed: false,
        }
    }
}

/// Filter predicate: opaque static conjuncts plus dynamic filter references.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Predicate {
    /// Rendered static conjuncts; not interpreted by the coordinator.
    #[serde(default)]
    pub static_conjuncts: Vec<String>,
    #[serde(default)]
    pub dynamic_filters: Vec<DynamicFilterDescriptor>,
}

/// How the build side of a join reaches the probe tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JoinDistribution {
    /// Build side broadcast identically to every probe task.
    Replicated,
    /// Build and probe hash-partitioned on the join keys.
    Partitioned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExchangeType {
    Gather,
    Repartition,
    Replicate,
}

/// How a fragment's tasks are laid out across the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PartitioningHandle {
    /// Tasks created on demand as source splits arrive.
    Source,
    /// Fixed hash-partitioned task set.
    Hash,
    Single,
    Coordinator,
    Arbitrary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableScanNode {
    pub id: PlanNodeId,
    pub catalog: String,
    pub table: String,
    pub assignments: BTreeMap<Symbol, ColumnHandle>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterNode {
    pub id: PlanNodeId,
    pub predicate: Predicate,
    pub source: Box<PlanNode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectNode {
    pub id: PlanNodeId,
    pub outputs: Vec<Symbol>,
    pub source: Box<PlanNode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinNode {
    pub id: PlanNodeId,
    pub probe: Box<PlanNode>,
    pub build: Box<PlanNode>,
    /// Equi-join criteria `(probe, build)`.
    pub criteria: Vec<(Symbol, Symbol)>,
    pub distribution: JoinDistribution,
    /// Filters produced by this join, keyed to the build symbol they collect.
    #[serde(default)]
    pub dynamic_filters: BTreeMap<DynamicFilterId, Symbol>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SemiJoinNode {
    pub id: PlanNodeId,
    pub source: Box<PlanNode>,
    pub filtering_source: Box<PlanNode>,
    pub source_join_symbol: Symbol,
    pub filtering_source_join_symbol: Symbol,
    pub distribution: JoinDistribution,
    #[serde(default)]
    pub dynamic_filter_id: Option<DynamicFilterId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteSourceNode {
    pub id: PlanNodeId,
    pub source_fragment_ids: Vec<FragmentId>,
    pub exchange_type: ExchangeType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputNode {
    pub id: PlanNodeId,
    pub columns: Vec<Symbol>,
    pub source: Box<PlanNode>,
}

/// Operator tree of one fragment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PlanNode {
    TableScan(TableScanNode),
    Filter(FilterNode),
    Project(ProjectNode),
    Join(JoinNode),
    SemiJoin(SemiJoinNode),
    /// Reads the output of other fragments.
    RemoteSource(RemoteSourceNode),
    Output(OutputNode),
}

impl PlanNode {
    pub fn id(&self) -> PlanNodeId {
        match self {
            PlanNode::TableScan(x) => x.id,
            PlanNode::Filter(x) => x.id,
            PlanNode::Project(x) => x.id,
            PlanNode::Join(x) => x.id,
            PlanNode::SemiJoin(x) => x.id,
            PlanNode::RemoteSource(x) => x.id,
            PlanNode::Output(x) => x.id,
        }
    }

    /// Returns direct child operators. Joins list the probe side first.
    pub fn children(&self) -> Vec<&PlanNode> {
        match self {
            PlanNode::TableScan(_) | PlanNode::RemoteSource(_) => vec![],
            PlanNode::Filter(x) => vec![x.source.as_ref()],
            PlanNode::Project(x) => vec![x.source.as_ref()],
            PlanNode::Join(x) => vec![x.probe.as_ref(), x.build.as_ref()],
            PlanNode::SemiJoin(x) => vec![x.source.as_ref(), x.filtering_source.as_ref()],
            PlanNode::Output(x) => vec![x.source.as_ref()],
        }
    }

    /// Dynamic filters created by this node (not its children).
    pub fn produced_dynamic_filters(&self) -> Vec<DynamicFilterId> {
        match self {
            PlanNode::Join(x) => x.dynamic_filters.keys().copied().collect(),
            PlanNode::SemiJoin(x) => x.dynamic_filter_id.into_iter().collect(),
            _ => vec![],
        }
    }

    /// Dynamic filter references held by this node's own predicate.
    pub fn consumed_dynamic_filters(&self) -> Vec<&DynamicFilterDescriptor> {
        match self {
            PlanNode::Filter(x) => x.predicate.dynamic_filters.iter().collect(),
            _ => vec![],
        }
    }

    /// Build-side distribution for join-like nodes.
    pub fn join_distribution(&self) -> Option<JoinDistribution> {
        match self {
            PlanNode::Join(x) => Some(x.distribution),
            PlanNode::SemiJoin(x) => Some(x.distribution),
            _ => None,
        }
    }

    /// Pre-order walk over this subtree.
    pub fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a PlanNode)) {
        visit(self);
        for child in self.children() {
            child.walk(visit);
        }
    }

    pub fn table_scans(&self) -> Vec<&TableScanNode> {
        let mut out = Vec::new();
        self.walk(&mut |node| {
            if let PlanNode::TableScan(scan) = node {
                out.push(scan);
            }
        });
        out
    }
}

/// Plan tree for one stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanFragment {
    pub id: FragmentId,
    pub root: PlanNode,
    pub partitioning: PartitioningHandle,
}

impl PlanFragment {
    pub fn new(id: FragmentId, root: PlanNode, partitioning: PartitioningHandle) -> Self {
        Self {
            id,
            root,
            partitioning,
        }
    }

    pub fn is_source_distributed(&self) -> bool {
        self.partitioning == PartitioningHandle::Source
    }
}

/// Fragment tree of a whole query; children feed their parent via remote sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubPlan {
    pub fragment: PlanFragment,
    #[serde(default)]
    pub children: Vec<SubPlan>,
}

impl SubPlan {
    pub fn leaf(fragment: PlanFragment) -> Self {
        Self {
            fragment,
            children: Vec::new(),
        }
    }

    /// Every fragment, parents before children.
    pub fn all_fragments(&self) -> Vec<&PlanFragment> {
        let mut out = vec![&self.fragment];
        for child in &self.children {
            out.extend(child.all_fragments());
        }
        out
    }
}

//! Static dynamic-filter classification over plan fragments.
//!
//! A filter is *lazy* when its consumers may start without waiting for it:
//! - it is consumed by a different fragment than the one producing it, or
//! - it is produced by a replicated join inside a source-distributed fragment
//!   that also consumes it (see [`source_stage_inner_lazy_dynamic_filters`]).
//!
//! Every other filter is eager: the consumer blocks until it is collected.

use std::collections::BTreeSet;

use sift_common::DynamicFilterId;

use crate::plan::{JoinDistribution, PlanFragment, PlanNode, SubPlan};

pub fn produced_dynamic_filters(root: &PlanNode) -> BTreeSet<DynamicFilterId> {
    let mut out = BTreeSet::new();
    root.walk(&mut |node| out.extend(node.produced_dynamic_filters()));
    out
}

pub fn consumed_dynamic_filters(root: &PlanNode) -> BTreeSet<DynamicFilterId> {
    let mut out = BTreeSet::new();
    root.walk(&mut |node| out.extend(node.consumed_dynamic_filters().into_iter().map(|d| d.id)));
    out
}

/// Filters produced by joins whose build side is broadcast.
pub fn replicated_dynamic_filters(root: &PlanNode) -> BTreeSet<DynamicFilterId> {
    let mut out = BTreeSet::new();
    root.walk(&mut |node| {
        if node.join_distribution() == Some(JoinDistribution::Replicated) {
            out.extend(node.produced_dynamic_filters());
        }
    });
    out
}

/// Filters produced and consumed inside one source-distributed fragment by a
/// replicated join.
///
/// Such a fragment only gets tasks when probe splits are placed, and probe
/// splits may be withheld until the filter resolves. The scheduler breaks the
/// cycle by creating one collecting task for these filters.
pub fn source_stage_inner_lazy_dynamic_filters(
    fragment: &PlanFragment,
) -> BTreeSet<DynamicFilterId> {
    if !fragment.is_source_distributed() {
        return BTreeSet::new();
    }
    let produced = produced_dynamic_filters(&fragment.root);
    let consumed = consumed_dynamic_filters(&fragment.root);
    let replicated = replicated_dynamic_filters(&fragment.root);
    produced
        .intersection(&consumed)
        .filter(|id| replicated.contains(id))
        .copied()
        .collect()
}

pub fn lazy_dynamic_filters(fragment: &PlanFragment) -> BTreeSet<DynamicFilterId> {
    let produced = produced_dynamic_filters(&fragment.root);
    let consumed = consumed_dynamic_filters(&fragment.root);
    let mut lazy = produced
        .difference(&consumed)
        .copied()
        .collect::<BTreeSet<_>>();
    lazy.extend(source_stage_inner_lazy_dynamic_filters(fragment));
    lazy
}

pub fn is_collecting_task_needed(fragment: &PlanFragment) -> bool {
    !source_stage_inner_lazy_dynamic_filters(fragment).is_empty()
}

/// Produced/lazy/replicated filter ids of a whole query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryDynamicFilters {
    pub produced: BTreeSet<DynamicFilterId>,
    pub lazy: BTreeSet<DynamicFilterId>,
    pub replicated: BTreeSet<DynamicFilterId>,
}

pub fn classify_sub_plan(plan: &SubPlan) -> QueryDynamicFilters {
    let mut out = QueryDynamicFilters::default();
    for fragment in plan.all_fragments() {
        out.produced.extend(produced_dynamic_filters(&fragment.root));
        out.lazy.extend(lazy_dynamic_filters(fragment));
        out.replicated.extend(replicated_dynamic_filters(&fragment.root));
    }
    out
}

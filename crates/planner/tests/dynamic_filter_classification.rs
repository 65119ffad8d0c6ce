use std::collections::{BTreeMap, BTreeSet};

use sift_common::{DynamicFilterId, FragmentId};
use sift_planner::{
    DynamicFilterDescriptor, ExchangeType, FilterNode, JoinDistribution, JoinNode,
    PartitioningHandle, PlanFragment, PlanNode, PlanNodeId, Predicate, RemoteSourceNode,
    SemiJoinNode, SubPlan, Symbol, TableScanNode, classify_sub_plan, consumed_dynamic_filters,
    is_collecting_task_needed, lazy_dynamic_filters, produced_dynamic_filters,
    replicated_dynamic_filters, source_stage_inner_lazy_dynamic_filters,
};

fn scan(id: u32, table: &str, column: &str) -> PlanNode {
    let mut assignments = BTreeMap::new();
    assignments.insert(
        Symbol::new(column),
        sift_planner::ColumnHandle::new(column),
    );
    PlanNode::TableScan(TableScanNode {
        id: PlanNodeId(id),
        catalog: "tpch".to_string(),
        table: table.to_string(),
        assignments,
    })
}

fn filtered_scan(id: u32, df: DynamicFilterId, column: &str) -> PlanNode {
    PlanNode::Filter(FilterNode {
        id: PlanNodeId(id + 100),
        predicate: Predicate {
            static_conjuncts: vec![],
            dynamic_filters: vec![DynamicFilterDescriptor::equal(df, Symbol::new(column))],
        },
        source: Box::new(scan(id, "probe", column)),
    })
}

fn join(
    probe: PlanNode,
    build: PlanNode,
    distribution: JoinDistribution,
    df: DynamicFilterId,
) -> PlanNode {
    let mut dynamic_filters = BTreeMap::new();
    dynamic_filters.insert(df, Symbol::new("build_key"));
    PlanNode::Join(JoinNode {
        id: PlanNodeId(50),
        probe: Box::new(probe),
        build: Box::new(build),
        criteria: vec![(Symbol::new("probe_key"), Symbol::new("build_key"))],
        distribution,
        dynamic_filters,
    })
}

fn remote(id: u32, source: u32) -> PlanNode {
    PlanNode::RemoteSource(RemoteSourceNode {
        id: PlanNodeId(id),
        source_fragment_ids: vec![FragmentId(source)],
        exchange_type: ExchangeType::Replicate,
    })
}

fn ids(values: &[u64]) -> BTreeSet<DynamicFilterId> {
    values.iter().copied().map(DynamicFilterId).collect()
}

#[test]
fn replicated_join_in_source_stage_is_inner_lazy() {
    let df = DynamicFilterId(1);
    let root = join(
        filtered_scan(1, df, "probe_key"),
        remote(2, 1),
        JoinDistribution::Replicated,
        df,
    );
    let fragment = PlanFragment::new(FragmentId(0), root, PartitioningHandle::Source);

    assert_eq!(produced_dynamic_filters(&fragment.root), ids(&[1]));
    assert_eq!(consumed_dynamic_filters(&fragment.root), ids(&[1]));
    assert_eq!(replicated_dynamic_filters(&fragment.root), ids(&[1]));
    assert_eq!(source_stage_inner_lazy_dynamic_filters(&fragment), ids(&[1]));
    assert_eq!(lazy_dynamic_filters(&fragment), ids(&[1]));
    assert!(is_collecting_task_needed(&fragment));
}

#[test]
fn partitioned_join_in_source_stage_stays_eager() {
    let df = DynamicFilterId(2);
    let root = join(
        filtered_scan(1, df, "probe_key"),
        remote(2, 1),
        JoinDistribution::Partitioned,
        df,
    );
    let fragment = PlanFragment::new(FragmentId(0), root, PartitioningHandle::Source);

    assert!(replicated_dynamic_filters(&fragment.root).is_empty());
    assert!(lazy_dynamic_filters(&fragment).is_empty());
    assert!(!is_collecting_task_needed(&fragment));
}

#[test]
fn replicated_join_in_hash_stage_needs_no_collecting_task() {
    let df = DynamicFilterId(3);
    let root = join(
        filtered_scan(1, df, "probe_key"),
        remote(2, 1),
        JoinDistribution::Replicated,
        df,
    );
    let fragment = PlanFragment::new(FragmentId(0), root, PartitioningHandle::Hash);

    assert!(source_stage_inner_lazy_dynamic_filters(&fragment).is_empty());
    assert!(!is_collecting_task_needed(&fragment));
}

#[test]
fn filter_consumed_in_other_fragment_is_lazy() {
    let df = DynamicFilterId(4);
    // Join in fragment 0 produces df; its probe side is a remote source over fragment 1,
    // which consumes df in a scan filter.
    let producer = PlanFragment::new(
        FragmentId(0),
        join(remote(3, 1), remote(4, 2), JoinDistribution::Partitioned, df),
        PartitioningHandle::Hash,
    );
    let consumer = PlanFragment::new(
        FragmentId(1),
        filtered_scan(1, df, "probe_key"),
        PartitioningHandle::Source,
    );
    let build = PlanFragment::new(FragmentId(2), scan(5, "build", "build_key"), PartitioningHandle::Source);

    assert_eq!(lazy_dynamic_filters(&producer), ids(&[4]));
    assert!(lazy_dynamic_filters(&consumer).is_empty());

    let plan = SubPlan {
        fragment: producer,
        children: vec![SubPlan::leaf(consumer), SubPlan::leaf(build)],
    };
    let classified = classify_sub_plan(&plan);
    assert_eq!(classified.produced, ids(&[4]));
    assert_eq!(classified.lazy, ids(&[4]));
    assert!(classified.replicated.is_empty());
}

#[test]
fn semi_join_produces_its_filter() {
    let df = DynamicFilterId(5);
    let root = PlanNode::SemiJoin(SemiJoinNode {
        id: PlanNodeId(9),
        source: Box::new(filtered_scan(1, df, "probe_key")),
        filtering_source: Box::new(remote(2, 1)),
        source_join_symbol: Symbol::new("probe_key"),
        filtering_source_join_symbol: Symbol::new("build_key"),
        distribution: JoinDistribution::Replicated,
        dynamic_filter_id: Some(df),
    });
    let fragment = PlanFragment::new(FragmentId(0), root, PartitioningHandle::Source);

    assert_eq!(produced_dynamic_filters(&fragment.root), ids(&[5]));
    assert!(is_collecting_task_needed(&fragment));
}

#[test]
fn fragment_decodes_from_json() {
    let raw = r#"{
        "id": 3,
        "partitioning": "Source",
        "root": {"TableScan": {"id": 1, "catalog": "tpch", "table": "orders", "assignments": {}}}
    }"#;
    let fragment: PlanFragment = serde_json::from_str(raw).expect("decode fragment");
    assert_eq!(fragment.id, FragmentId(3));
    assert_eq!(fragment.root.table_scans().len(), 1);
    assert!(!is_collecting_task_needed(&fragment));
}

//! Split-to-node placement for source-distributed stages.
//!
//! A node is eligible for another split while both hold:
//! - its splits across all stages stay below `max_splits_per_node`;
//! - this stage's task on it has fewer than `max_pending_splits_per_task`
//!   splits not yet started.
//!
//! Among eligible candidates the least-loaded node wins, ties broken by node
//! order. Splits with no eligible candidate stay unassigned and the result
//! carries a future that resolves when node capacity frees.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::future::BoxFuture;
use sift_common::{NodeId, Result, SchedulerConfig, SiftError};
use tracing::debug;

use crate::nodes::{InternalNode, NodeManager, NodeTaskMap};
use crate::signal;
use crate::task::{RemoteTask, Split};

pub struct SplitPlacementResult {
    /// Splits per chosen node, in node order.
    pub assignments: Vec<(InternalNode, Vec<Split>)>,
    /// Splits no node could take; retry once `blocked` resolves.
    pub unassigned: Vec<Split>,
    pub blocked: BoxFuture<'static, ()>,
}

impl SplitPlacementResult {
    pub fn assigned_count(&self) -> usize {
        self.assignments.iter().map(|(_, s)| s.len()).sum()
    }
}

impl std::fmt::Debug for SplitPlacementResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SplitPlacementResult")
            .field("assigned", &self.assigned_count())
            .field("unassigned", &self.unassigned.len())
            .finish()
    }
}

#[derive(Debug)]
struct NodeLoad {
    node: InternalNode,
    node_splits: usize,
    task_pending: usize,
    has_task: bool,
}

#[derive(Debug)]
pub struct DynamicSplitPlacementPolicy {
    node_manager: Arc<dyn NodeManager>,
    node_task_map: Arc<NodeTaskMap>,
    config: SchedulerConfig,
    catalog: Option<String>,
}

impl DynamicSplitPlacementPolicy {
    pub fn new(
        node_manager: Arc<dyn NodeManager>,
        node_task_map: Arc<NodeTaskMap>,
        config: SchedulerConfig,
        catalog: Option<String>,
    ) -> Self {
        Self {
            node_manager,
            node_task_map,
            config,
            catalog,
        }
    }

    fn candidate_nodes(&self) -> Result<Vec<InternalNode>> {
        let nodes = self
            .node_manager
            .active_nodes_for_catalog(self.catalog.as_deref());
        if nodes.is_empty() {
            return Err(SiftError::ResourceUnavailable(format!(
                "no active nodes available for catalog {}",
                self.catalog.as_deref().unwrap_or("<any>")
            )));
        }
        Ok(nodes)
    }

    /// Least-loaded active node; hosts a task that runs without splits.
    pub fn choose_node_for_task(&self) -> Result<InternalNode> {
        let nodes = self.candidate_nodes()?;
        nodes
            .into_iter()
            .enumerate()
            .min_by_key(|(i, n)| (self.node_task_map.splits_on_node(&n.node_id), *i))
            .map(|(_, n)| n)
            .ok_or_else(|| SiftError::ResourceUnavailable("no active nodes".to_string()))
    }

    /// Places `splits` on nodes. `existing_tasks` are this stage's tasks by node;
    /// nodes without one are only used when `allow_new_tasks` is set.
    pub fn compute_assignments(
        &self,
        splits: &[Split],
        existing_tasks: &BTreeMap<NodeId, Arc<dyn RemoteTask>>,
        allow_new_tasks: bool,
    ) -> Result<SplitPlacementResult> {
        // Subscribe before reading loads so a concurrent release is not missed.
        let space_freed = self.node_task_map.space_freed();
        let mut loads = self
            .candidate_nodes()?
            .into_iter()
            .map(|node| {
                let task = existing_tasks.get(&node.node_id);
                NodeLoad {
                    node_splits: self.node_task_map.splits_on_node(&node.node_id),
                    task_pending: task.map(|t| t.pending_splits()).unwrap_or(0),
                    has_task: task.is_some(),
                    node,
                }
            })
            .collect::<Vec<_>>();
        let index_by_node = loads
            .iter()
            .enumerate()
            .map(|(i, l)| (l.node.node_id.clone(), i))
            .collect::<HashMap<_, _>>();

        let mut assigned: BTreeMap<usize, Vec<Split>> = BTreeMap::new();
        let mut unassigned = Vec::new();
        for split in splits {
            match self.choose(&loads, &index_by_node, split, allow_new_tasks)? {
                Some(i) => {
                    loads[i].node_splits += 1;
                    loads[i].task_pending += 1;
                    assigned.entry(i).or_default().push(split.clone());
                }
                None => unassigned.push(split.clone()),
            }
        }

        if !unassigned.is_empty() {
            debug!(
                unassigned = unassigned.len(),
                max_splits_per_node = self.config.max_splits_per_node,
                operator = "SplitPlacement",
                "split queues full"
            );
        }
        let blocked = if unassigned.is_empty() {
            signal::resolved()
        } else {
            space_freed
        };
        let assignments = assigned
            .into_iter()
            .map(|(i, splits)| (loads[i].node.clone(), splits))
            .collect();
        Ok(SplitPlacementResult {
            assignments,
            unassigned,
            blocked,
        })
    }

    fn choose(
        &self,
        loads: &[NodeLoad],
        index_by_node: &HashMap<NodeId, usize>,
        split: &Split,
        allow_new_tasks: bool,
    ) -> Result<Option<usize>> {
        let preferred = split
            .addresses
            .iter()
            .filter_map(|a| index_by_node.get(a).copied())
            .collect::<Vec<_>>();
        let eligible = |i: &usize| {
            let load = &loads[*i];
            (allow_new_tasks || load.has_task)
                && load.node_splits < self.config.max_splits_per_node
                && load.task_pending < self.config.max_pending_splits_per_task
        };
        let least_loaded = |candidates: &mut dyn Iterator<Item = usize>| {
            candidates
                .filter(|i| eligible(i))
                .min_by_key(|i| (loads[*i].node_splits, *i))
        };

        if !split.remotely_accessible {
            if preferred.is_empty() {
                return Err(SiftError::ResourceUnavailable(format!(
                    "split {} is only readable on inactive nodes {:?}",
                    split.id, split.addresses
                )));
            }
            return Ok(least_loaded(&mut preferred.iter().copied()));
        }
        if self.config.optimized_local_scheduling {
            if let Some(i) = least_loaded(&mut preferred.iter().copied()) {
                return Ok(Some(i));
            }
        }
        Ok(least_loaded(&mut (0..loads.len())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::InMemoryNodeManager;
    use crate::task::{InMemoryRemoteTask, RemoteTask};
    use sift_common::{QueryId, StageId, TaskId};

    fn config(max_splits_per_node: usize, max_pending_splits_per_task: usize) -> SchedulerConfig {
        SchedulerConfig {
            max_splits_per_node,
            max_pending_splits_per_task,
            ..SchedulerConfig::default()
        }
    }

    fn policy(nodes: &[&str], config: SchedulerConfig) -> (DynamicSplitPlacementPolicy, Arc<NodeTaskMap>) {
        let manager = Arc::new(InMemoryNodeManager::new(
            nodes
                .iter()
                .map(|n| InternalNode::new(*n, format!("{n}:8080"))),
        ));
        let map = Arc::new(NodeTaskMap::new());
        (
            DynamicSplitPlacementPolicy::new(manager, Arc::clone(&map), config, None),
            map,
        )
    }

    fn counts(result: &SplitPlacementResult) -> Vec<(String, usize)> {
        result
            .assignments
            .iter()
            .map(|(n, s)| (n.node_id.0.clone(), s.len()))
            .collect()
    }

    #[test]
    fn spreads_evenly_across_idle_nodes() {
        let (policy, _) = policy(&["a", "b", "c"], config(10, 10));
        let result = policy
            .compute_assignments(&(0..7).map(Split::new).collect::<Vec<_>>(), &BTreeMap::new(), true)
            .expect("placement");
        assert_eq!(
            counts(&result),
            vec![("a".to_string(), 3), ("b".to_string(), 2), ("c".to_string(), 2)]
        );
        assert!(result.unassigned.is_empty());
    }

    #[test]
    fn saturated_nodes_leave_splits_unassigned() {
        let (policy, map) = policy(&["a", "b"], config(2, 10));
        map.add_splits(&NodeId::new("a"), 2);
        let result = policy
            .compute_assignments(&(0..4).map(Split::new).collect::<Vec<_>>(), &BTreeMap::new(), true)
            .expect("placement");
        assert_eq!(counts(&result), vec![("b".to_string(), 2)]);
        assert_eq!(result.unassigned.len(), 2);

        let blocked = result.blocked;
        map.remove_splits(&NodeId::new("a"), 1);
        assert!(futures::FutureExt::now_or_never(blocked).is_some());
    }

    #[test]
    fn pending_cap_applies_per_task() {
        let (policy, map) = policy(&["a"], config(100, 3));
        let task: Arc<dyn RemoteTask> = Arc::new(InMemoryRemoteTask::new(
            TaskId::new(StageId::new(QueryId(1), 0), 0),
            NodeId::new("a"),
            Arc::clone(&map),
        ));
        task.add_splits(vec![Split::new(100), Split::new(101)]);
        let existing = BTreeMap::from([(NodeId::new("a"), task)]);
        let result = policy
            .compute_assignments(&(0..3).map(Split::new).collect::<Vec<_>>(), &existing, true)
            .expect("placement");
        assert_eq!(counts(&result), vec![("a".to_string(), 1)]);
        assert_eq!(result.unassigned.len(), 2);
    }

    #[test]
    fn new_tasks_suppressed_when_not_allowed() {
        let (policy, map) = policy(&["a", "b"], config(10, 10));
        let task: Arc<dyn RemoteTask> = Arc::new(InMemoryRemoteTask::new(
            TaskId::new(StageId::new(QueryId(1), 0), 0),
            NodeId::new("b"),
            Arc::clone(&map),
        ));
        let existing = BTreeMap::from([(NodeId::new("b"), task)]);
        let result = policy
            .compute_assignments(&(0..3).map(Split::new).collect::<Vec<_>>(), &existing, false)
            .expect("placement");
        assert_eq!(counts(&result), vec![("b".to_string(), 3)]);
    }

    #[test]
    fn local_splits_only_go_to_their_hosts() {
        let (policy, _) = policy(&["a", "b"], config(1, 10));
        let splits = vec![
            Split::local(0, [NodeId::new("b")]),
            Split::local(1, [NodeId::new("b")]),
        ];
        let result = policy
            .compute_assignments(&splits, &BTreeMap::new(), true)
            .expect("placement");
        assert_eq!(counts(&result), vec![("b".to_string(), 1)]);
        assert_eq!(
            result.unassigned.iter().map(|s| s.id).collect::<Vec<_>>(),
            vec![1]
        );
    }

    #[test]
    fn local_split_without_active_host_is_resource_unavailable() {
        let (policy, _) = policy(&["a"], config(10, 10));
        let err = policy
            .compute_assignments(
                &[Split::new(0), Split::local(1, [NodeId::new("z")])],
                &BTreeMap::new(),
                true,
            )
            .expect_err("no live host");
        assert!(matches!(err, SiftError::ResourceUnavailable(_)));
    }

    #[test]
    fn preferred_hosts_win_for_remote_splits() {
        let (policy, _) = policy(&["a", "b"], config(10, 10));
        let mut split = Split::new(0);
        split.addresses = vec![NodeId::new("b")];
        let result = policy
            .compute_assignments(&[split], &BTreeMap::new(), true)
            .expect("placement");
        assert_eq!(counts(&result), vec![("b".to_string(), 1)]);
    }

    #[test]
    fn no_nodes_is_resource_unavailable() {
        let (policy, _) = policy(&[], config(10, 10));
        let err = policy
            .compute_assignments(&[Split::new(0)], &BTreeMap::new(), true)
            .expect_err("no nodes");
        assert!(matches!(err, SiftError::ResourceUnavailable(_)));
        assert!(matches!(
            policy.choose_node_for_task(),
            Err(SiftError::ResourceUnavailable(_))
        ));
    }
}

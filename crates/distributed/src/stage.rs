//! Coordinator-side state of one stage: its fragment and the tasks created for it.

use std::collections::BTreeMap;
use std::sync::Arc;

use sift_common::{NodeId, Result, SiftError, StageId, TaskId};
use sift_planner::PlanFragment;
use tracing::{debug, info};

use crate::nodes::{InternalNode, NodeTaskMap};
use crate::task::{RemoteTask, RemoteTaskFactory, Split};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    Planned,
    Scheduling,
    /// Task topology final; tasks drain their remaining splits.
    Running,
    Aborted,
}

/// At most one task per node; tasks are created on first use.
#[derive(Debug)]
pub struct StageExecution {
    stage_id: StageId,
    fragment: Arc<PlanFragment>,
    task_factory: Arc<dyn RemoteTaskFactory>,
    node_task_map: Arc<NodeTaskMap>,
    tasks: BTreeMap<NodeId, Arc<dyn RemoteTask>>,
    next_task_id: u32,
    splits_scheduled: usize,
    state: StageState,
}

impl StageExecution {
    pub fn new(
        stage_id: StageId,
        fragment: Arc<PlanFragment>,
        task_factory: Arc<dyn RemoteTaskFactory>,
        node_task_map: Arc<NodeTaskMap>,
    ) -> Self {
        Self {
            stage_id,
            fragment,
            task_factory,
            node_task_map,
            tasks: BTreeMap::new(),
            next_task_id: 0,
            splits_scheduled: 0,
            state: StageState::Planned,
        }
    }

    pub fn stage_id(&self) -> StageId {
        self.stage_id
    }

    pub fn fragment(&self) -> &Arc<PlanFragment> {
        &self.fragment
    }

    pub fn node_task_map(&self) -> &Arc<NodeTaskMap> {
        &self.node_task_map
    }

    pub fn state(&self) -> StageState {
        self.state
    }

    pub fn tasks(&self) -> &BTreeMap<NodeId, Arc<dyn RemoteTask>> {
        &self.tasks
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn splits_scheduled(&self) -> usize {
        self.splits_scheduled
    }

    /// Routes `splits` to the stage's task on `node`, creating the task first if needed.
    /// Returns the task when it was created by this call.
    pub fn schedule_splits(
        &mut self,
        node: &InternalNode,
        splits: Vec<Split>,
    ) -> Result<Option<Arc<dyn RemoteTask>>> {
        if self.state == StageState::Aborted {
            return Err(SiftError::Execution(format!(
                "stage {} is aborted",
                self.stage_id
            )));
        }
        self.state = StageState::Scheduling;
        let created = match self.tasks.get(&node.node_id) {
            Some(_) => None,
            None => {
                let task_id = TaskId::new(self.stage_id, self.next_task_id);
                self.next_task_id += 1;
                let task = self.task_factory.create_remote_task(
                    task_id,
                    node,
                    Arc::clone(&self.node_task_map),
                );
                debug!(
                    task_id = %task_id,
                    node_id = %node.node_id,
                    operator = "StageExecution",
                    "task created"
                );
                self.tasks.insert(node.node_id.clone(), Arc::clone(&task));
                Some(task)
            }
        };
        if !splits.is_empty() {
            self.splits_scheduled += splits.len();
            if let Some(task) = self.tasks.get(&node.node_id) {
                task.add_splits(splits);
            }
        }
        Ok(created)
    }

    /// Marks the task topology final.
    pub fn no_more_splits(&mut self) {
        if self.state == StageState::Aborted {
            return;
        }
        for task in self.tasks.values() {
            task.no_more_splits();
        }
        self.state = StageState::Running;
    }

    pub fn abort(&mut self) {
        if self.state == StageState::Aborted {
            return;
        }
        for task in self.tasks.values() {
            task.abort();
        }
        self.state = StageState::Aborted;
        info!(
            stage_id = %self.stage_id,
            tasks = self.tasks.len(),
            operator = "StageExecution",
            "stage aborted"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::InMemoryRemoteTaskFactory;
    use sift_common::{FragmentId, QueryId};
    use sift_planner::{PartitioningHandle, PlanNode, PlanNodeId, TableScanNode};

    fn stage(factory: Arc<InMemoryRemoteTaskFactory>) -> StageExecution {
        let fragment = PlanFragment::new(
            FragmentId(0),
            PlanNode::TableScan(TableScanNode {
                id: PlanNodeId(0),
                catalog: "tpch".to_string(),
                table: "orders".to_string(),
                assignments: BTreeMap::new(),
            }),
            PartitioningHandle::Source,
        );
        StageExecution::new(
            StageId::new(QueryId(1), 0),
            Arc::new(fragment),
            factory,
            Arc::new(NodeTaskMap::new()),
        )
    }

    #[test]
    fn one_task_per_node() {
        let factory = Arc::new(InMemoryRemoteTaskFactory::new());
        let mut stage = stage(Arc::clone(&factory));
        let a = InternalNode::new("a", "a:8080");
        let b = InternalNode::new("b", "b:8080");

        let first = stage.schedule_splits(&a, vec![Split::new(0)]).expect("schedule");
        let again = stage.schedule_splits(&a, vec![Split::new(1)]).expect("schedule");
        let other = stage.schedule_splits(&b, Vec::new()).expect("schedule");

        assert_eq!(first.map(|t| t.task_id().id), Some(0));
        assert!(again.is_none());
        assert_eq!(other.map(|t| t.task_id().id), Some(1));
        assert_eq!(stage.task_count(), 2);
        assert_eq!(stage.splits_scheduled(), 2);
        assert_eq!(factory.tasks_on_node(&a.node_id)[0].split_ids(), vec![0, 1]);
    }

    #[test]
    fn abort_closes_tasks_and_rejects_scheduling() {
        let factory = Arc::new(InMemoryRemoteTaskFactory::new());
        let mut stage = stage(Arc::clone(&factory));
        let a = InternalNode::new("a", "a:8080");
        stage.schedule_splits(&a, vec![Split::new(0)]).expect("schedule");
        stage.abort();
        assert_eq!(stage.state(), StageState::Aborted);
        assert!(factory.tasks()[0].is_aborted());
        assert!(stage.schedule_splits(&a, vec![Split::new(1)]).is_err());
    }
}

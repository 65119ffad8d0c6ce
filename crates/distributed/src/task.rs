//! Splits and the coordinator's handle on remote tasks.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use sift_common::{NodeId, TaskId};
use tracing::debug;

use crate::nodes::{InternalNode, NodeTaskMap};

/// Opaque unit of partitioned input; handed to exactly one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Split {
    pub id: u64,
    /// Preferred hosts.
    pub addresses: Vec<NodeId>,
    /// False when the split can only be read on one of `addresses`.
    pub remotely_accessible: bool,
}

impl Split {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            addresses: Vec::new(),
            remotely_accessible: true,
        }
    }

    /// Split readable only on `addresses`.
    pub fn local(id: u64, addresses: impl IntoIterator<Item = NodeId>) -> Self {
        Self {
            id,
            addresses: addresses.into_iter().collect(),
            remotely_accessible: false,
        }
    }
}

pub trait RemoteTask: Send + Sync + fmt::Debug {
    fn task_id(&self) -> TaskId;

    fn node_id(&self) -> &NodeId;

    fn add_splits(&self, splits: Vec<Split>);

    /// Splits assigned but not yet started.
    fn pending_splits(&self) -> usize;

    /// Splits assigned and not finished, started or not.
    fn assigned_splits(&self) -> usize;

    fn no_more_splits(&self);

    fn abort(&self);
}

pub trait RemoteTaskFactory: Send + Sync + fmt::Debug {
    fn create_remote_task(
        &self,
        task_id: TaskId,
        node: &InternalNode,
        node_task_map: Arc<NodeTaskMap>,
    ) -> Arc<dyn RemoteTask>;
}

#[derive(Debug, Default)]
struct TaskSplits {
    pending: VecDeque<Split>,
    running: VecDeque<Split>,
    finished: Vec<Split>,
    no_more_splits: bool,
    aborted: bool,
}

/// Task that keeps its splits in memory; execution is driven by the caller
/// through [`InMemoryRemoteTask::start_splits`] and [`InMemoryRemoteTask::finish_splits`].
pub struct InMemoryRemoteTask {
    task_id: TaskId,
    node_id: NodeId,
    node_task_map: Arc<NodeTaskMap>,
    splits: Mutex<TaskSplits>,
}

impl InMemoryRemoteTask {
    pub fn new(task_id: TaskId, node_id: NodeId, node_task_map: Arc<NodeTaskMap>) -> Self {
        Self {
            task_id,
            node_id,
            node_task_map,
            splits: Mutex::new(TaskSplits::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, TaskSplits> {
        self.splits.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Moves up to `count` pending splits to running. Returns how many moved.
    pub fn start_splits(&self, count: usize) -> usize {
        let mut state = self.state();
        let n = count.min(state.pending.len());
        let started = state.pending.drain(..n).collect::<Vec<_>>();
        state.running.extend(started);
        drop(state);
        if n > 0 {
            self.node_task_map.notify_space_freed();
        }
        n
    }

    /// Completes up to `count` running splits and releases their node capacity.
    pub fn finish_splits(&self, count: usize) -> usize {
        let mut state = self.state();
        let n = count.min(state.running.len());
        let done = state.running.drain(..n).collect::<Vec<_>>();
        state.finished.extend(done);
        drop(state);
        self.node_task_map.remove_splits(&self.node_id, n);
        n
    }

    pub fn running_splits(&self) -> usize {
        self.state().running.len()
    }

    /// Every split ever routed to this task, in arrival order per state.
    pub fn split_ids(&self) -> Vec<u64> {
        let state = self.state();
        state
            .finished
            .iter()
            .chain(state.running.iter())
            .chain(state.pending.iter())
            .map(|s| s.id)
            .collect()
    }

    pub fn is_no_more_splits(&self) -> bool {
        self.state().no_more_splits
    }

    pub fn is_aborted(&self) -> bool {
        self.state().aborted
    }
}

impl fmt::Debug for InMemoryRemoteTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("InMemoryRemoteTask")
            .field("task_id", &self.task_id)
            .field("node_id", &self.node_id)
            .field("pending", &state.pending.len())
            .field("running", &state.running.len())
            .field("finished", &state.finished.len())
            .finish()
    }
}

impl RemoteTask for InMemoryRemoteTask {
    fn task_id(&self) -> TaskId {
        self.task_id
    }

    fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    fn add_splits(&self, splits: Vec<Split>) {
        let mut state = self.state();
        if state.aborted || state.no_more_splits {
            debug!(
                task_id = %self.task_id,
                dropped = splits.len(),
                operator = "RemoteTask",
                "splits ignored by closed task"
            );
            return;
        }
        self.node_task_map.add_splits(&self.node_id, splits.len());
        state.pending.extend(splits);
    }

    fn pending_splits(&self) -> usize {
        self.state().pending.len()
    }

    fn assigned_splits(&self) -> usize {
        let state = self.state();
        state.pending.len() + state.running.len()
    }

    fn no_more_splits(&self) {
        self.state().no_more_splits = true;
    }

    fn abort(&self) {
        let mut state = self.state();
        if state.aborted {
            return;
        }
        state.aborted = true;
        let released = state.pending.len() + state.running.len();
        state.pending.clear();
        state.running.clear();
        drop(state);
        self.node_task_map.remove_splits(&self.node_id, released);
    }
}

/// Creates [`InMemoryRemoteTask`]s and keeps them for inspection.
#[derive(Debug, Default)]
pub struct InMemoryRemoteTaskFactory {
    tasks: Mutex<Vec<Arc<InMemoryRemoteTask>>>,
}

impl InMemoryRemoteTaskFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tasks(&self) -> Vec<Arc<InMemoryRemoteTask>> {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn tasks_on_node(&self, node_id: &NodeId) -> Vec<Arc<InMemoryRemoteTask>> {
        self.tasks()
            .into_iter()
            .filter(|t| &t.node_id == node_id)
            .collect()
    }
}

impl RemoteTaskFactory for InMemoryRemoteTaskFactory {
    fn create_remote_task(
        &self,
        task_id: TaskId,
        node: &InternalNode,
        node_task_map: Arc<NodeTaskMap>,
    ) -> Arc<dyn RemoteTask> {
        let task = Arc::new(InMemoryRemoteTask::new(
            task_id,
            node.node_id.clone(),
            node_task_map,
        ));
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&task));
        task
    }
}

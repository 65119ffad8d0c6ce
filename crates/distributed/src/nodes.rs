//! Cluster membership and per-node split accounting.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{PoisonError, RwLock};

use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt};
use sift_common::NodeId;
use tokio::sync::watch;
use tracing::info;

/// Worker node as seen by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalNode {
    pub node_id: NodeId,
    pub address: String,
    /// Catalogs this node serves; empty means every catalog.
    pub catalogs: BTreeSet<String>,
}

impl InternalNode {
    pub fn new(node_id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            node_id: NodeId::new(node_id),
            address: address.into(),
            catalogs: BTreeSet::new(),
        }
    }

    pub fn with_catalogs<I, S>(mut self, catalogs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.catalogs = catalogs.into_iter().map(Into::into).collect();
        self
    }

    pub fn serves(&self, catalog: Option<&str>) -> bool {
        match catalog {
            Some(c) => self.catalogs.is_empty() || self.catalogs.contains(c),
            None => true,
        }
    }
}

pub trait NodeManager: Send + Sync + fmt::Debug {
    /// Active nodes in stable `node_id` order.
    fn active_nodes(&self) -> Vec<InternalNode>;

    fn active_nodes_for_catalog(&self, catalog: Option<&str>) -> Vec<InternalNode> {
        self.active_nodes()
            .into_iter()
            .filter(|n| n.serves(catalog))
            .collect()
    }
}

/// Node set maintained in process; nodes may join and leave at any time.
#[derive(Debug, Default)]
pub struct InMemoryNodeManager {
    nodes: RwLock<BTreeMap<NodeId, InternalNode>>,
}

impl InMemoryNodeManager {
    pub fn new(nodes: impl IntoIterator<Item = InternalNode>) -> Self {
        Self {
            nodes: RwLock::new(nodes.into_iter().map(|n| (n.node_id.clone(), n)).collect()),
        }
    }

    pub fn add_node(&self, node: InternalNode) {
        info!(
            node_id = %node.node_id,
            address = %node.address,
            operator = "NodeManager",
            "node added"
        );
        self.nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(node.node_id.clone(), node);
    }

    pub fn remove_node(&self, node_id: &NodeId) -> Option<InternalNode> {
        let removed = self
            .nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(node_id);
        if removed.is_some() {
            info!(node_id = %node_id, operator = "NodeManager", "node removed");
        }
        removed
    }
}

impl NodeManager for InMemoryNodeManager {
    fn active_nodes(&self) -> Vec<InternalNode> {
        self.nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}

/// Splits assigned to each node and not yet finished, across every stage and query.
#[derive(Debug)]
pub struct NodeTaskMap {
    splits: DashMap<NodeId, usize>,
    space_freed: watch::Sender<u64>,
}

impl NodeTaskMap {
    pub fn new() -> Self {
        let (space_freed, _) = watch::channel(0);
        Self {
            splits: DashMap::new(),
            space_freed,
        }
    }

    pub fn splits_on_node(&self, node_id: &NodeId) -> usize {
        self.splits.get(node_id).map(|n| *n).unwrap_or(0)
    }

    pub fn add_splits(&self, node_id: &NodeId, count: usize) {
        if count == 0 {
            return;
        }
        *self.splits.entry(node_id.clone()).or_insert(0) += count;
    }

    pub fn remove_splits(&self, node_id: &NodeId, count: usize) {
        if count == 0 {
            return;
        }
        if let Some(mut n) = self.splits.get_mut(node_id) {
            *n = n.saturating_sub(count);
        }
        self.notify_space_freed();
    }

    /// Wakes schedulers waiting for split queue space.
    pub fn notify_space_freed(&self) {
        self.space_freed.send_modify(|generation| *generation += 1);
    }

    /// Resolves on the next [`NodeTaskMap::notify_space_freed`] after this call.
    pub fn space_freed(&self) -> BoxFuture<'static, ()> {
        let mut rx = self.space_freed.subscribe();
        async move {
            let _ = rx.changed().await;
        }
        .boxed()
    }
}

impl Default for NodeTaskMap {
    fn default() -> Self {
        Self::new()
    }
}

//! Storage contract for the membership graph.
//!
//! Every call is scoped by an explicit `partition_id`. Implementations only
//! need single-operation atomicity; multi-step consistency is the job of the
//! mutation service and its compensating log.

mod memory;

pub use memory::InMemoryGraphStore;

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use serde::Serialize;

use crate::errors::GraphResult;
use crate::models::{ChildrenReference, EntityNode, ParentReference, Role};

/// Backend-agnostic node and edge storage with transitive-closure queries.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Insert a node into `node.data_partition_id`. Conflict if it already exists.
    async fn create_node(&self, node: &EntityNode) -> GraphResult<()>;

    /// Remove a node. NotFound if absent, Conflict while edges still reference it.
    async fn delete_node(&self, node_id: &str, partition_id: &str) -> GraphResult<()>;

    /// Overwrite name, description and app ids of an existing node.
    async fn update_node(&self, node: &EntityNode) -> GraphResult<()>;

    /// Link `parent_id -> child_id`. NotFound if an endpoint is missing, Conflict if linked.
    async fn add_edge(
        &self,
        parent_id: &str,
        child_id: &str,
        role: Role,
        partition_id: &str,
    ) -> GraphResult<()>;

    async fn remove_edge(&self, parent_id: &str, child_id: &str, partition_id: &str) -> GraphResult<()>;

    async fn get_node(&self, node_id: &str, partition_id: &str) -> GraphResult<Option<EntityNode>>;

    async fn get_direct_children(
        &self,
        node_id: &str,
        partition_id: &str,
    ) -> GraphResult<Vec<ChildrenReference>>;

    async fn get_direct_parents(
        &self,
        node_id: &str,
        partition_id: &str,
    ) -> GraphResult<Vec<ParentReference>>;

    /// Every USER reachable downwards from `node_id`, including the node itself when it is a user.
    async fn get_all_descendant_user_ids(
        &self,
        node_id: &str,
        partition_id: &str,
    ) -> GraphResult<BTreeSet<String>>;

    /// Every group reachable upwards from `node_id`, once each, ordered by id.
    ///
    /// Direct parents carry their edge role; groups reached only through an
    /// intermediate group carry `Role::Member`.
    async fn get_all_ancestors(
        &self,
        node_id: &str,
        partition_id: &str,
    ) -> GraphResult<Vec<ParentReference>>;

    /// Record that `user_id` belongs to the partition's root users group.
    async fn add_partition_association(&self, user_id: &str, partition_id: &str) -> GraphResult<()>;

    async fn remove_partition_association(&self, user_id: &str, partition_id: &str) -> GraphResult<()>;

    async fn has_partition_association(&self, user_id: &str, partition_id: &str) -> GraphResult<bool>;

    /// Full dump of one partition, for reconciliation after an ambiguous rollback.
    async fn snapshot(&self, partition_id: &str) -> GraphResult<GraphSnapshot>;
}

/// Point-in-time copy of a partition's nodes, edges and side index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GraphSnapshot {
    pub nodes: BTreeMap<String, EntityNode>,
    pub edges: BTreeSet<(String, String, Role)>,
    pub partition_users: BTreeSet<String>,
}

impl GraphSnapshot {
    pub fn has_edge(&self, parent_id: &str, child_id: &str) -> bool {
        self.edges
            .iter()
            .any(|(parent, child, _)| parent == parent_id && child == child_id)
    }

    /// Edges that touch `node_id` on either side.
    pub fn edges_referencing(&self, node_id: &str) -> usize {
        self.edges
            .iter()
            .filter(|(parent, child, _)| parent == node_id || child == node_id)
            .count()
    }
}

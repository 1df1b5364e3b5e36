use std::collections::BTreeSet;
use std::sync::Arc;

use crate::errors::{GraphError, GraphResult};
use crate::models::{ChildrenReference, EntityNode, ParentReference};
use crate::retry::{with_retry, RetryPolicy};
use crate::store::GraphStore;

/// Read side of the graph: direct and transitive neighbours, with
/// per-application visibility filtering.
#[derive(Clone)]
pub struct TraversalService {
    store: Arc<dyn GraphStore>,
    retry: RetryPolicy,
}

impl TraversalService {
    pub fn new(store: Arc<dyn GraphStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    pub async fn get_node(&self, node_id: &str, partition_id: &str) -> GraphResult<Option<EntityNode>> {
        let store = self.store.as_ref();
        with_retry(&self.retry, "get_node", move || store.get_node(node_id, partition_id)).await
    }

    /// Like `get_node`, but a missing node is `NotFound`.
    pub async fn require_node(&self, node_id: &str, partition_id: &str) -> GraphResult<EntityNode> {
        self.get_node(node_id, partition_id)
            .await?
            .ok_or_else(|| GraphError::not_found(format!("{node_id} not found in partition {partition_id}")))
    }

    pub async fn direct_children(&self, node_id: &str, partition_id: &str) -> GraphResult<Vec<ChildrenReference>> {
        let store = self.store.as_ref();
        with_retry(&self.retry, "get_direct_children", move || {
            store.get_direct_children(node_id, partition_id)
        })
        .await
    }

    pub async fn direct_parents(&self, node_id: &str, partition_id: &str) -> GraphResult<Vec<ParentReference>> {
        let store = self.store.as_ref();
        with_retry(&self.retry, "get_direct_parents", move || {
            store.get_direct_parents(node_id, partition_id)
        })
        .await
    }

    pub async fn all_ancestors(&self, node_id: &str, partition_id: &str) -> GraphResult<Vec<ParentReference>> {
        let store = self.store.as_ref();
        with_retry(&self.retry, "get_all_ancestors", move || {
            store.get_all_ancestors(node_id, partition_id)
        })
        .await
    }

    pub async fn descendant_user_ids(&self, node_id: &str, partition_id: &str) -> GraphResult<BTreeSet<String>> {
        let store = self.store.as_ref();
        with_retry(&self.retry, "get_all_descendant_user_ids", move || {
            store.get_all_descendant_user_ids(node_id, partition_id)
        })
        .await
    }

    /// True when `candidate_id` is `node_id` itself or sits anywhere above it.
    pub async fn is_self_or_ancestor(
        &self,
        candidate_id: &str,
        node_id: &str,
        partition_id: &str,
    ) -> GraphResult<bool> {
        if candidate_id == node_id {
            return Ok(true);
        }
        Ok(self
            .all_ancestors(node_id, partition_id)
            .await?
            .iter()
            .any(|parent| parent.id == candidate_id))
    }

    /// Keep groups that are unrestricted or tagged with `app_id`.
    pub fn filter_by_app_id(
        parents: impl IntoIterator<Item = ParentReference>,
        app_id: &str,
    ) -> Vec<ParentReference> {
        parents.into_iter().filter(|parent| parent.visible_to(app_id)).collect()
    }

    /// Every group `node_id` belongs to, directly or not, as seen by `app_id`.
    pub async fn list_member_groups(
        &self,
        node_id: &str,
        partition_id: &str,
        app_id: Option<&str>,
    ) -> GraphResult<Vec<ParentReference>> {
        let ancestors = self.all_ancestors(node_id, partition_id).await?;
        Ok(match app_id {
            Some(app_id) => Self::filter_by_app_id(ancestors, app_id),
            None => ancestors,
        })
    }
}

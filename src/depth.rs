use std::collections::{BTreeSet, HashMap};

use crate::errors::{GraphError, GraphResult};
use crate::traversal::TraversalService;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Down,
    Up,
}

/// Bounds group nesting before a group -> group edge is created.
///
/// Depth is counted in groups: a group with no nested groups below it has a
/// descendant depth of 1, a group with no parents an ancestor depth of 1. The
/// sum is the number of groups on the longest chain the new edge would form.
/// Only direct-neighbour queries are used, so the result does not depend on
/// the backend's native traversal. They go through [`TraversalService`] and
/// are retried like every other read.
#[derive(Debug, Clone, Copy)]
pub struct DepthGuard {
    max_depth: usize,
}

impl DepthGuard {
    pub fn new(max_depth: usize) -> Self {
        Self { max_depth }
    }

    pub async fn validate_link_depth(
        &self,
        traversal: &TraversalService,
        parent_id: &str,
        child_id: &str,
        partition_id: &str,
    ) -> GraphResult<()> {
        let below = self.descendant_depth(traversal, child_id, partition_id).await?;
        let above = self.ancestor_depth(traversal, parent_id, partition_id).await?;

        if below + above > self.max_depth {
            tracing::debug!(
                parent_id = %parent_id,
                child_id = %child_id,
                below,
                above,
                max_depth = self.max_depth,
                "link rejected by depth bound"
            );
            return Err(GraphError::precondition(format!(
                "linking {child_id} under {parent_id} would nest {} groups deep (max {})",
                below + above,
                self.max_depth
            )));
        }

        Ok(())
    }

    /// Groups on the longest downward group chain starting at `node_id`.
    pub async fn descendant_depth(
        &self,
        traversal: &TraversalService,
        node_id: &str,
        partition_id: &str,
    ) -> GraphResult<usize> {
        self.longest_chain(traversal, node_id, partition_id, Direction::Down).await
    }

    /// Groups on the longest upward chain starting at `node_id`.
    pub async fn ancestor_depth(
        &self,
        traversal: &TraversalService,
        node_id: &str,
        partition_id: &str,
    ) -> GraphResult<usize> {
        self.longest_chain(traversal, node_id, partition_id, Direction::Up).await
    }

    // Level k of the walk holds every node reachable by exactly k-1 edges; in
    // a DAG the last non-empty level is the longest chain. The walk stops one
    // level past the bound, which is enough to reject.
    async fn longest_chain(
        &self,
        traversal: &TraversalService,
        node_id: &str,
        partition_id: &str,
        direction: Direction,
    ) -> GraphResult<usize> {
        let mut neighbours: HashMap<String, Vec<String>> = HashMap::new();
        let mut frontier: BTreeSet<String> = BTreeSet::from([node_id.to_string()]);
        let mut depth = 0;

        while !frontier.is_empty() && depth <= self.max_depth {
            depth += 1;
            let mut next = BTreeSet::new();

            for id in &frontier {
                if !neighbours.contains_key(id) {
                    let ids = match direction {
                        Direction::Down => traversal
                            .direct_children(id, partition_id)
                            .await?
                            .into_iter()
                            .filter(|child| !child.is_user())
                            .map(|child| child.id)
                            .collect(),
                        Direction::Up => traversal
                            .direct_parents(id, partition_id)
                            .await?
                            .into_iter()
                            .map(|parent| parent.id)
                            .collect(),
                    };
                    neighbours.insert(id.clone(), ids);
                }
                if let Some(ids) = neighbours.get(id) {
                    next.extend(ids.iter().cloned());
                }
            }

            frontier = next;
        }

        Ok(depth)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::models::{EntityNode, Role};
    use crate::retry::RetryPolicy;
    use crate::store::{GraphStore, InMemoryGraphStore};

    const P: &str = "p1";

    async fn chain(store: &InMemoryGraphStore, names: &[&str]) -> Vec<EntityNode> {
        let groups: Vec<EntityNode> = names
            .iter()
            .map(|name| EntityNode::group(name, "", P, "example.com"))
            .collect();
        for group in &groups {
            store.create_node(group).await.unwrap();
        }
        for pair in groups.windows(2) {
            store
                .add_edge(&pair[0].node_id, &pair[1].node_id, Role::Member, P)
                .await
                .unwrap();
        }
        groups
    }

    #[tokio::test]
    async fn depths_count_groups_on_longest_chain() {
        let store = Arc::new(InMemoryGraphStore::new());
        let groups = chain(&store, &["a", "b", "c"]).await;
        // A shortcut a -> c must not shorten the longest chain.
        store.add_edge(&groups[0].node_id, &groups[2].node_id, Role::Member, P).await.unwrap();
        let alice = EntityNode::user("alice@example.com", P);
        store.create_node(&alice).await.unwrap();
        store.add_edge(&groups[2].node_id, &alice.node_id, Role::Member, P).await.unwrap();

        let traversal = TraversalService::new(store, RetryPolicy::immediate(1));
        let guard = DepthGuard::new(10);
        assert_eq!(guard.descendant_depth(&traversal, &groups[0].node_id, P).await.unwrap(), 3);
        assert_eq!(guard.ancestor_depth(&traversal, &groups[2].node_id, P).await.unwrap(), 3);
        assert_eq!(guard.ancestor_depth(&traversal, &groups[0].node_id, P).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn link_beyond_bound_is_rejected() {
        let store = Arc::new(InMemoryGraphStore::new());
        let upper = chain(&store, &["u1", "u2", "u3"]).await;
        let lower = chain(&store, &["l1", "l2"]).await;
        let traversal = TraversalService::new(store, RetryPolicy::immediate(1));

        assert!(DepthGuard::new(5)
            .validate_link_depth(&traversal, &upper[2].node_id, &lower[0].node_id, P)
            .await
            .is_ok());

        let err = DepthGuard::new(4)
            .validate_link_depth(&traversal, &upper[2].node_id, &lower[0].node_id, P)
            .await
            .unwrap_err();
        assert!(matches!(err, GraphError::PreconditionFailed(_)));
    }
}

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{GraphSnapshot, GraphStore};
use crate::errors::{GraphError, GraphResult};
use crate::models::{ChildrenReference, EntityNode, NodeType, ParentReference, Role};

#[derive(Debug, Default)]
struct PartitionGraph {
    nodes: HashMap<String, EntityNode>,
    /// parent -> (child -> role)
    children: HashMap<String, BTreeMap<String, Role>>,
    /// child -> (parent -> role)
    parents: HashMap<String, BTreeMap<String, Role>>,
    partition_users: BTreeSet<String>,
}

impl PartitionGraph {
    fn has_edges(&self, node_id: &str) -> bool {
        self.children.get(node_id).map(|c| !c.is_empty()).unwrap_or(false)
            || self.parents.get(node_id).map(|p| !p.is_empty()).unwrap_or(false)
    }

    fn ancestors(&self, node_id: &str) -> Vec<ParentReference> {
        let mut roles: BTreeMap<String, Role> = BTreeMap::new();
        let mut queue = VecDeque::new();
        let mut visited = HashSet::new();

        if let Some(direct) = self.parents.get(node_id) {
            for (parent, role) in direct {
                roles.insert(parent.clone(), *role);
                visited.insert(parent.clone());
                queue.push_back(parent.clone());
            }
        }

        while let Some(current) = queue.pop_front() {
            let Some(parents) = self.parents.get(&current) else {
                continue;
            };
            for parent in parents.keys() {
                roles.entry(parent.clone()).or_insert(Role::Member);
                if visited.insert(parent.clone()) {
                    queue.push_back(parent.clone());
                }
            }
        }

        roles
            .into_iter()
            .filter_map(|(id, role)| self.nodes.get(&id).map(|node| ParentReference::from_node(node, role)))
            .collect()
    }

    fn descendant_users(&self, node_id: &str) -> BTreeSet<String> {
        let mut users = BTreeSet::new();
        let mut visited = HashSet::from([node_id.to_string()]);
        let mut queue = VecDeque::from([node_id.to_string()]);

        while let Some(current) = queue.pop_front() {
            if let Some(node) = self.nodes.get(&current) {
                if node.node_type == NodeType::User {
                    users.insert(current.clone());
                }
            }
            if let Some(children) = self.children.get(&current) {
                for child in children.keys() {
                    if visited.insert(child.clone()) {
                        queue.push_back(child.clone());
                    }
                }
            }
        }

        users
    }
}

/// Key-value style backend: each node keeps its own adjacency sets and
/// closures are breadth-first walks over them.
#[derive(Debug, Default)]
pub struct InMemoryGraphStore {
    partitions: RwLock<HashMap<String, PartitionGraph>>,
}

impl InMemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GraphStore for InMemoryGraphStore {
    async fn create_node(&self, node: &EntityNode) -> GraphResult<()> {
        let mut partitions = self.partitions.write().await;
        let graph = partitions.entry(node.data_partition_id.clone()).or_default();
        if graph.nodes.contains_key(&node.node_id) {
            return Err(GraphError::conflict(format!("node {} already exists", node.node_id)));
        }
        graph.nodes.insert(node.node_id.clone(), node.clone());
        Ok(())
    }

    async fn delete_node(&self, node_id: &str, partition_id: &str) -> GraphResult<()> {
        let mut partitions = self.partitions.write().await;
        let graph = partitions
            .get_mut(partition_id)
            .ok_or_else(|| GraphError::not_found(format!("node {node_id} not found")))?;
        if !graph.nodes.contains_key(node_id) {
            return Err(GraphError::not_found(format!("node {node_id} not found")));
        }
        if graph.has_edges(node_id) {
            return Err(GraphError::conflict(format!("node {node_id} still has memberships")));
        }
        graph.nodes.remove(node_id);
        graph.children.remove(node_id);
        graph.parents.remove(node_id);
        Ok(())
    }

    async fn update_node(&self, node: &EntityNode) -> GraphResult<()> {
        let mut partitions = self.partitions.write().await;
        let existing = partitions
            .get_mut(&node.data_partition_id)
            .and_then(|graph| graph.nodes.get_mut(&node.node_id))
            .ok_or_else(|| GraphError::not_found(format!("node {} not found", node.node_id)))?;
        if existing.node_type != node.node_type {
            return Err(GraphError::precondition(format!("node {} cannot change type", node.node_id)));
        }
        *existing = node.clone();
        Ok(())
    }

    async fn add_edge(
        &self,
        parent_id: &str,
        child_id: &str,
        role: Role,
        partition_id: &str,
    ) -> GraphResult<()> {
        let mut partitions = self.partitions.write().await;
        let graph = partitions
            .get_mut(partition_id)
            .ok_or_else(|| GraphError::not_found(format!("group {parent_id} not found")))?;

        let parent = graph
            .nodes
            .get(parent_id)
            .ok_or_else(|| GraphError::not_found(format!("group {parent_id} not found")))?;
        if parent.node_type != NodeType::Group {
            return Err(GraphError::precondition(format!("{parent_id} is not a group")));
        }
        if !graph.nodes.contains_key(child_id) {
            return Err(GraphError::not_found(format!("member {child_id} not found")));
        }

        let children = graph.children.entry(parent_id.to_string()).or_default();
        if children.contains_key(child_id) {
            return Err(GraphError::conflict(format!("{child_id} is already a member of {parent_id}")));
        }
        children.insert(child_id.to_string(), role);
        graph
            .parents
            .entry(child_id.to_string())
            .or_default()
            .insert(parent_id.to_string(), role);
        Ok(())
    }

    async fn remove_edge(&self, parent_id: &str, child_id: &str, partition_id: &str) -> GraphResult<()> {
        let mut partitions = self.partitions.write().await;
        let removed = partitions
            .get_mut(partition_id)
            .and_then(|graph| {
                let removed = graph.children.get_mut(parent_id)?.remove(child_id)?;
                if let Some(parents) = graph.parents.get_mut(child_id) {
                    parents.remove(parent_id);
                }
                Some(removed)
            });

        match removed {
            Some(_) => Ok(()),
            None => Err(GraphError::not_found(format!("{child_id} is not a member of {parent_id}"))),
        }
    }

    async fn get_node(&self, node_id: &str, partition_id: &str) -> GraphResult<Option<EntityNode>> {
        let partitions = self.partitions.read().await;
        Ok(partitions
            .get(partition_id)
            .and_then(|graph| graph.nodes.get(node_id))
            .cloned())
    }

    async fn get_direct_children(
        &self,
        node_id: &str,
        partition_id: &str,
    ) -> GraphResult<Vec<ChildrenReference>> {
        let partitions = self.partitions.read().await;
        let Some(graph) = partitions.get(partition_id) else {
            return Ok(Vec::new());
        };
        let Some(children) = graph.children.get(node_id) else {
            return Ok(Vec::new());
        };

        Ok(children
            .iter()
            .filter_map(|(child_id, role)| {
                graph.nodes.get(child_id).map(|child| ChildrenReference {
                    id: child_id.clone(),
                    data_partition_id: partition_id.to_string(),
                    node_type: child.node_type,
                    role: *role,
                })
            })
            .collect())
    }

    async fn get_direct_parents(
        &self,
        node_id: &str,
        partition_id: &str,
    ) -> GraphResult<Vec<ParentReference>> {
        let partitions = self.partitions.read().await;
        let Some(graph) = partitions.get(partition_id) else {
            return Ok(Vec::new());
        };
        let Some(parents) = graph.parents.get(node_id) else {
            return Ok(Vec::new());
        };

        Ok(parents
            .iter()
            .filter_map(|(parent_id, role)| {
                graph
                    .nodes
                    .get(parent_id)
                    .map(|parent| ParentReference::from_node(parent, *role))
            })
            .collect())
    }

    async fn get_all_descendant_user_ids(
        &self,
        node_id: &str,
        partition_id: &str,
    ) -> GraphResult<BTreeSet<String>> {
        let partitions = self.partitions.read().await;
        Ok(partitions
            .get(partition_id)
            .map(|graph| graph.descendant_users(node_id))
            .unwrap_or_default())
    }

    async fn get_all_ancestors(
        &self,
        node_id: &str,
        partition_id: &str,
    ) -> GraphResult<Vec<ParentReference>> {
        let partitions = self.partitions.read().await;
        Ok(partitions
            .get(partition_id)
            .map(|graph| graph.ancestors(node_id))
            .unwrap_or_default())
    }

    async fn add_partition_association(&self, user_id: &str, partition_id: &str) -> GraphResult<()> {
        let mut partitions = self.partitions.write().await;
        let graph = partitions.entry(partition_id.to_string()).or_default();
        if !graph.partition_users.insert(user_id.to_string()) {
            return Err(GraphError::conflict(format!(
                "{user_id} is already associated with partition {partition_id}"
            )));
        }
        Ok(())
    }

    async fn remove_partition_association(&self, user_id: &str, partition_id: &str) -> GraphResult<()> {
        let mut partitions = self.partitions.write().await;
        let removed = partitions
            .get_mut(partition_id)
            .map(|graph| graph.partition_users.remove(user_id))
            .unwrap_or(false);
        if !removed {
            return Err(GraphError::not_found(format!(
                "{user_id} is not associated with partition {partition_id}"
            )));
        }
        Ok(())
    }

    async fn has_partition_association(&self, user_id: &str, partition_id: &str) -> GraphResult<bool> {
        let partitions = self.partitions.read().await;
        Ok(partitions
            .get(partition_id)
            .map(|graph| graph.partition_users.contains(user_id))
            .unwrap_or(false))
    }

    async fn snapshot(&self, partition_id: &str) -> GraphResult<GraphSnapshot> {
        let partitions = self.partitions.read().await;
        let Some(graph) = partitions.get(partition_id) else {
            return Ok(GraphSnapshot::default());
        };

        let nodes = graph
            .nodes
            .iter()
            .map(|(id, node)| (id.clone(), node.clone()))
            .collect();
        let edges = graph
            .children
            .iter()
            .flat_map(|(parent, children)| {
                children
                    .iter()
                    .map(move |(child, role)| (parent.clone(), child.clone(), *role))
            })
            .collect();

        Ok(GraphSnapshot {
            nodes,
            edges,
            partition_users: graph.partition_users.clone(),
        })
    }
}

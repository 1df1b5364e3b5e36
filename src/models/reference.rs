use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::node::{EntityNode, NodeType, Role};

/// A group above some node, together with the role that node holds in it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParentReference {
    pub id: String,
    pub name: String,
    pub description: String,
    pub data_partition_id: String,
    pub app_ids: BTreeSet<String>,
    pub role: Role,
}

impl ParentReference {
    pub fn from_node(node: &EntityNode, role: Role) -> Self {
        Self {
            id: node.node_id.clone(),
            name: node.name.clone(),
            description: node.description.clone(),
            data_partition_id: node.data_partition_id.clone(),
            app_ids: node.app_ids.clone(),
            role,
        }
    }

    /// Visible to `app_id` when unrestricted or explicitly tagged.
    pub fn visible_to(&self, app_id: &str) -> bool {
        self.app_ids.is_empty() || self.app_ids.contains(app_id)
    }
}

/// A direct member of a group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChildrenReference {
    pub id: String,
    pub data_partition_id: String,
    pub node_type: NodeType,
    pub role: Role,
}

impl ChildrenReference {
    pub fn is_user(&self) -> bool {
        self.node_type == NodeType::User
    }
}

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::GraphError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeType {
    User,
    Group,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::User => "USER",
            NodeType::Group => "GROUP",
        }
    }
}

impl FromStr for NodeType {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "USER" => Ok(NodeType::User),
            "GROUP" => Ok(NodeType::Group),
            other => Err(GraphError::internal(format!("unknown node type: {other}"))),
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role carried by a group -> member edge. `Owner` sorts above `Member`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    Member,
    Owner,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Owner => "OWNER",
            Role::Member => "MEMBER",
        }
    }
}

impl FromStr for Role {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "OWNER" => Ok(Role::Owner),
            "MEMBER" => Ok(Role::Member),
            other => Err(GraphError::precondition(format!("unknown role: {other}"))),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A USER or GROUP vertex of the membership graph, scoped to one data partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityNode {
    pub node_id: String,
    pub node_type: NodeType,
    pub data_partition_id: String,
    pub name: String,
    pub description: String,
    /// Application tags restricting visibility. Always empty for users.
    #[serde(default)]
    pub app_ids: BTreeSet<String>,
}

impl EntityNode {
    /// A user node; the email doubles as name and id.
    pub fn user(email: &str, partition_id: &str) -> Self {
        let node_id = email.trim().to_lowercase();
        Self {
            name: node_id.clone(),
            node_id,
            node_type: NodeType::User,
            data_partition_id: partition_id.to_string(),
            description: String::new(),
            app_ids: BTreeSet::new(),
        }
    }

    /// A group node whose id is derived from its name.
    pub fn group(name: &str, description: &str, partition_id: &str, domain: &str) -> Self {
        let name = name.trim().to_lowercase();
        Self {
            node_id: group_node_id(&name, partition_id, domain),
            node_type: NodeType::Group,
            data_partition_id: partition_id.to_string(),
            name,
            description: description.to_string(),
            app_ids: BTreeSet::new(),
        }
    }

    pub fn with_app_ids(mut self, app_ids: impl IntoIterator<Item = String>) -> Self {
        self.app_ids = app_ids.into_iter().collect();
        self
    }

    pub fn is_group(&self) -> bool {
        self.node_type == NodeType::Group
    }

    pub fn is_user(&self) -> bool {
        self.node_type == NodeType::User
    }

    /// Same node renamed; identity follows the new name.
    pub fn renamed(&self, new_name: &str, domain: &str) -> Self {
        EntityNode::group(new_name, &self.description, &self.data_partition_id, domain)
            .with_app_ids(self.app_ids.iter().cloned())
    }
}

pub fn group_node_id(name: &str, partition_id: &str, domain: &str) -> String {
    format!("{}@{}.{}", name.trim().to_lowercase(), partition_id, domain)
}

#[derive(Debug, Clone)]
pub struct DbNode {
    pub partition_id: String,
    pub node_id: String,
    pub node_type: String,
    pub name: String,
    pub description: String,
    pub app_ids: String,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<DbNode> for EntityNode {
    type Error = GraphError;

    fn try_from(value: DbNode) -> Result<Self, Self::Error> {
        let app_ids: BTreeSet<String> = serde_json::from_str(&value.app_ids)
            .map_err(|err| GraphError::internal(format!("invalid app_ids for {}: {err}", value.node_id)))?;

        Ok(EntityNode {
            node_id: value.node_id,
            node_type: value.node_type.parse()?,
            data_partition_id: value.partition_id,
            name: value.name,
            description: value.description,
            app_ids,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_id_is_derived_from_name() {
        let group = EntityNode::group("Data.Wells.Viewers", "viewers", "opendes", "example.com");
        assert_eq!(group.node_id, "data.wells.viewers@opendes.example.com");
        assert_eq!(group.name, "data.wells.viewers");
        assert!(group.is_group());
    }

    #[test]
    fn renamed_keeps_partition_and_app_ids() {
        let group = EntityNode::group("data.x", "d", "p1", "example.com")
            .with_app_ids(vec!["app1".to_string()]);
        let renamed = group.renamed("data.y", "example.com");

        assert_eq!(renamed.node_id, "data.y@p1.example.com");
        assert_eq!(renamed.description, "d");
        assert!(renamed.app_ids.contains("app1"));
    }

    #[test]
    fn owner_outranks_member() {
        assert!(Role::Owner > Role::Member);
        assert_eq!("owner".parse::<Role>().unwrap(), Role::Owner);
        assert!("admin".parse::<Role>().is_err());
    }

    #[test]
    fn db_node_with_bad_app_ids_is_rejected() {
        let row = DbNode {
            partition_id: "p1".to_string(),
            node_id: "g@p1.example.com".to_string(),
            node_type: "GROUP".to_string(),
            name: "g".to_string(),
            description: String::new(),
            app_ids: "not json".to_string(),
            created_at: Utc::now(),
        };

        assert!(EntityNode::try_from(row).is_err());
    }
}

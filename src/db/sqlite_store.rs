use std::collections::BTreeSet;

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use super::row_parsers;
use crate::errors::{GraphError, GraphResult};
use crate::models::{ChildrenReference, EntityNode, NodeType, ParentReference, Role};
use crate::store::{GraphSnapshot, GraphStore};
use crate::utils::utc_now;

const NODE_COLUMNS: &str = "n.partition_id, n.node_id, n.node_type, n.name, n.description, n.app_ids, n.created_at";

/// Relational backend; closures are recursive CTEs evaluated by SQLite.
#[derive(Debug, Clone)]
pub struct SqliteGraphStore {
    pool: SqlitePool,
}

impl SqliteGraphStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn node_type_of(&self, node_id: &str, partition_id: &str) -> GraphResult<Option<NodeType>> {
        let node_type: Option<String> = sqlx::query_scalar(
            "SELECT node_type FROM nodes WHERE partition_id = ? AND node_id = ?",
        )
        .bind(partition_id)
        .bind(node_id)
        .fetch_optional(&self.pool)
        .await?;

        node_type.map(|s| s.parse()).transpose()
    }
}

fn app_ids_json(node: &EntityNode) -> GraphResult<String> {
    serde_json::to_string(&node.app_ids)
        .map_err(|err| GraphError::internal(format!("failed to encode app_ids: {err}")))
}

/// Replace the driver's constraint text with one naming the entity.
fn conflict_as(err: sqlx::Error, message: String) -> GraphError {
    match GraphError::from(err) {
        GraphError::Conflict(_) => GraphError::conflict(message),
        other => other,
    }
}

#[async_trait]
impl GraphStore for SqliteGraphStore {
    async fn create_node(&self, node: &EntityNode) -> GraphResult<()> {
        sqlx::query(
            "INSERT INTO nodes (partition_id, node_id, node_type, name, description, app_ids, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&node.data_partition_id)
        .bind(&node.node_id)
        .bind(node.node_type.as_str())
        .bind(&node.name)
        .bind(&node.description)
        .bind(app_ids_json(node)?)
        .bind(utc_now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|err| conflict_as(err, format!("node {} already exists", node.node_id)))?;

        Ok(())
    }

    async fn delete_node(&self, node_id: &str, partition_id: &str) -> GraphResult<()> {
        let linked: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM memberships WHERE partition_id = ? AND (parent_id = ? OR child_id = ?))",
        )
        .bind(partition_id)
        .bind(node_id)
        .bind(node_id)
        .fetch_one(&self.pool)
        .await?;

        if linked {
            return Err(GraphError::conflict(format!("node {node_id} still has memberships")));
        }

        let affected = sqlx::query("DELETE FROM nodes WHERE partition_id = ? AND node_id = ?")
            .bind(partition_id)
            .bind(node_id)
            .execute(&self.pool)
            .await
            .map_err(|err| conflict_as(err, format!("node {node_id} still has memberships")))?;

        if affected.rows_affected() == 0 {
            return Err(GraphError::not_found(format!("node {node_id} not found")));
        }

        Ok(())
    }

    async fn update_node(&self, node: &EntityNode) -> GraphResult<()> {
        let affected = sqlx::query(
            "UPDATE nodes SET name = ?, description = ?, app_ids = ? \
             WHERE partition_id = ? AND node_id = ? AND node_type = ?",
        )
        .bind(&node.name)
        .bind(&node.description)
        .bind(app_ids_json(node)?)
        .bind(&node.data_partition_id)
        .bind(&node.node_id)
        .bind(node.node_type.as_str())
        .execute(&self.pool)
        .await?;

        if affected.rows_affected() == 0 {
            return Err(GraphError::not_found(format!("{} {} not found", node.node_type, node.node_id)));
        }

        Ok(())
    }

    async fn add_edge(
        &self,
        parent_id: &str,
        child_id: &str,
        role: Role,
        partition_id: &str,
    ) -> GraphResult<()> {
        match self.node_type_of(parent_id, partition_id).await? {
            None => return Err(GraphError::not_found(format!("group {parent_id} not found"))),
            Some(NodeType::User) => return Err(GraphError::precondition(format!("{parent_id} is not a group"))),
            Some(NodeType::Group) => {}
        }
        if self.node_type_of(child_id, partition_id).await?.is_none() {
            return Err(GraphError::not_found(format!("member {child_id} not found")));
        }

        sqlx::query(
            "INSERT INTO memberships (partition_id, parent_id, child_id, role, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(partition_id)
        .bind(parent_id)
        .bind(child_id)
        .bind(role.as_str())
        .bind(utc_now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|err| conflict_as(err, format!("{child_id} is already a member of {parent_id}")))?;

        Ok(())
    }

    async fn remove_edge(&self, parent_id: &str, child_id: &str, partition_id: &str) -> GraphResult<()> {
        let affected = sqlx::query(
            "DELETE FROM memberships WHERE partition_id = ? AND parent_id = ? AND child_id = ?",
        )
        .bind(partition_id)
        .bind(parent_id)
        .bind(child_id)
        .execute(&self.pool)
        .await?;

        if affected.rows_affected() == 0 {
            return Err(GraphError::not_found(format!("{child_id} is not a member of {parent_id}")));
        }

        Ok(())
    }

    async fn get_node(&self, node_id: &str, partition_id: &str) -> GraphResult<Option<EntityNode>> {
        let row = sqlx::query(&format!(
            "SELECT {NODE_COLUMNS} FROM nodes n WHERE n.partition_id = ? AND n.node_id = ?"
        ))
        .bind(partition_id)
        .bind(node_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_parsers::node_from_row).transpose()
    }

    async fn get_direct_children(
        &self,
        node_id: &str,
        partition_id: &str,
    ) -> GraphResult<Vec<ChildrenReference>> {
        let rows = sqlx::query(
            "SELECT m.partition_id, m.child_id, m.role, n.node_type \
             FROM memberships m \
             JOIN nodes n ON n.partition_id = m.partition_id AND n.node_id = m.child_id \
             WHERE m.partition_id = ? AND m.parent_id = ? \
             ORDER BY m.child_id",
        )
        .bind(partition_id)
        .bind(node_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_parsers::child_reference_from_row).collect()
    }

    async fn get_direct_parents(
        &self,
        node_id: &str,
        partition_id: &str,
    ) -> GraphResult<Vec<ParentReference>> {
        let rows = sqlx::query(&format!(
            "SELECT {NODE_COLUMNS}, m.role \
             FROM memberships m \
             JOIN nodes n ON n.partition_id = m.partition_id AND n.node_id = m.parent_id \
             WHERE m.partition_id = ? AND m.child_id = ? \
             ORDER BY n.node_id"
        ))
        .bind(partition_id)
        .bind(node_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_parsers::parent_reference_from_row).collect()
    }

    async fn get_all_descendant_user_ids(
        &self,
        node_id: &str,
        partition_id: &str,
    ) -> GraphResult<BTreeSet<String>> {
        // UNION (not UNION ALL) deduplicates the frontier, so diamonds are
        // visited once and the walk terminates.
        let ids: Vec<String> = sqlx::query_scalar(
            "WITH RECURSIVE descendants(node_id) AS (
                SELECT ?
                UNION
                SELECT m.child_id FROM memberships m
                JOIN descendants d ON m.parent_id = d.node_id
                WHERE m.partition_id = ?
            )
            SELECT n.node_id FROM descendants d
            JOIN nodes n ON n.partition_id = ? AND n.node_id = d.node_id
            WHERE n.node_type = 'USER'",
        )
        .bind(node_id)
        .bind(partition_id)
        .bind(partition_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids.into_iter().collect())
    }

    async fn get_all_ancestors(
        &self,
        node_id: &str,
        partition_id: &str,
    ) -> GraphResult<Vec<ParentReference>> {
        let rows = sqlx::query(&format!(
            "WITH RECURSIVE ancestors(node_id) AS (
                SELECT parent_id FROM memberships WHERE partition_id = ? AND child_id = ?
                UNION
                SELECT m.parent_id FROM memberships m
                JOIN ancestors a ON m.child_id = a.node_id
                WHERE m.partition_id = ?
            )
            SELECT {NODE_COLUMNS}, direct.role AS role
            FROM ancestors a
            JOIN nodes n ON n.partition_id = ? AND n.node_id = a.node_id
            LEFT JOIN memberships direct
                ON direct.partition_id = n.partition_id AND direct.parent_id = n.node_id AND direct.child_id = ?
            ORDER BY n.node_id"
        ))
        .bind(partition_id)
        .bind(node_id)
        .bind(partition_id)
        .bind(partition_id)
        .bind(node_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_parsers::parent_reference_from_row).collect()
    }

    async fn add_partition_association(&self, user_id: &str, partition_id: &str) -> GraphResult<()> {
        sqlx::query("INSERT INTO user_partitions (user_id, partition_id, created_at) VALUES (?, ?, ?)")
            .bind(user_id)
            .bind(partition_id)
            .bind(utc_now().to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(|err| {
                conflict_as(err, format!("{user_id} is already associated with partition {partition_id}"))
            })?;

        Ok(())
    }

    async fn remove_partition_association(&self, user_id: &str, partition_id: &str) -> GraphResult<()> {
        let affected = sqlx::query("DELETE FROM user_partitions WHERE user_id = ? AND partition_id = ?")
            .bind(user_id)
            .bind(partition_id)
            .execute(&self.pool)
            .await?;

        if affected.rows_affected() == 0 {
            return Err(GraphError::not_found(format!(
                "{user_id} is not associated with partition {partition_id}"
            )));
        }

        Ok(())
    }

    async fn has_partition_association(&self, user_id: &str, partition_id: &str) -> GraphResult<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM user_partitions WHERE user_id = ? AND partition_id = ?)",
        )
        .bind(user_id)
        .bind(partition_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    async fn snapshot(&self, partition_id: &str) -> GraphResult<GraphSnapshot> {
        let node_rows = sqlx::query(&format!("SELECT {NODE_COLUMNS} FROM nodes n WHERE n.partition_id = ?"))
            .bind(partition_id)
            .fetch_all(&self.pool)
            .await?;

        let mut snapshot = GraphSnapshot::default();
        for row in &node_rows {
            let node = row_parsers::node_from_row(row)?;
            snapshot.nodes.insert(node.node_id.clone(), node);
        }

        let edge_rows = sqlx::query("SELECT parent_id, child_id, role FROM memberships WHERE partition_id = ?")
            .bind(partition_id)
            .fetch_all(&self.pool)
            .await?;

        for row in &edge_rows {
            let parent: String = row.try_get("parent_id")?;
            let child: String = row.try_get("child_id")?;
            let role: String = row.try_get("role")?;
            snapshot.edges.insert((parent, child, role.parse()?));
        }

        let users: Vec<String> = sqlx::query_scalar("SELECT user_id FROM user_partitions WHERE partition_id = ?")
            .bind(partition_id)
            .fetch_all(&self.pool)
            .await?;
        snapshot.partition_users = users.into_iter().collect();

        Ok(snapshot)
    }
}

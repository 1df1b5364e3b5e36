use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::errors::GraphError;
use crate::models::{ChildrenReference, DbNode, EntityNode, ParentReference, Role};

pub fn parse_datetime(s: &str) -> Result<DateTime<Utc>, GraphError> {
    let s = s.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }

    // SQLite CURRENT_TIMESTAMP format, for rows written outside the store
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Ok(Utc.from_utc_datetime(&naive));
    }

    Err(GraphError::internal(format!("invalid datetime: {}", s)))
}

fn column<'r, T>(row: &'r SqliteRow, name: &str) -> Result<T, GraphError>
where
    T: sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
    row.try_get(name)
        .map_err(|e| GraphError::internal(format!("missing {}: {}", name, e)))
}

pub fn db_node_from_row(row: &SqliteRow) -> Result<DbNode, GraphError> {
    let partition_id: String = column(row, "partition_id")?;
    let node_id: String = column(row, "node_id")?;
    let node_type: String = column(row, "node_type")?;
    let name: String = column(row, "name")?;
    let description: String = column(row, "description")?;
    let app_ids: String = column(row, "app_ids")?;
    let created_at_s: String = column(row, "created_at")?;

    let created_at = parse_datetime(&created_at_s)?;

    Ok(DbNode { partition_id, node_id, node_type, name, description, app_ids, created_at })
}

pub fn node_from_row(row: &SqliteRow) -> Result<EntityNode, GraphError> {
    EntityNode::try_from(db_node_from_row(row)?)
}

/// Node columns plus a nullable `role`; a missing role means the group was
/// reached transitively.
pub fn parent_reference_from_row(row: &SqliteRow) -> Result<ParentReference, GraphError> {
    let node = node_from_row(row)?;
    let role_s: Option<String> = column(row, "role")?;
    let role = match role_s {
        Some(s) => s.parse::<Role>()?,
        None => Role::Member,
    };

    Ok(ParentReference::from_node(&node, role))
}

pub fn child_reference_from_row(row: &SqliteRow) -> Result<ChildrenReference, GraphError> {
    let id: String = column(row, "child_id")?;
    let data_partition_id: String = column(row, "partition_id")?;
    let node_type_s: String = column(row, "node_type")?;
    let role_s: String = column(row, "role")?;

    Ok(ChildrenReference {
        id,
        data_partition_id,
        node_type: node_type_s.parse()?,
        role: role_s.parse()?,
    })
}

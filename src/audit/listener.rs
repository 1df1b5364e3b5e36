use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use super::AuditEvent;
use crate::errors::{GraphError, GraphResult};

fn chain_hash(prev_hash: Option<&str>, payload: &str) -> String {
    let mut hasher = Sha256::new();
    if let Some(prev) = prev_hash {
        hasher.update(prev.as_bytes());
    }
    hasher.update(payload.as_bytes());
    hex::encode(hasher.finalize())
}

/// Append one event to `audit_log`, chained to the previous row by
/// SHA256(prev_hash || payload).
pub async fn record_event(pool: &SqlitePool, event: &AuditEvent) -> GraphResult<()> {
    let payload = serde_json::to_string(event)
        .map_err(|err| GraphError::internal(format!("failed to encode audit event: {err}")))?;
    let targets = serde_json::to_string(&event.targets)
        .map_err(|err| GraphError::internal(format!("failed to encode audit targets: {err}")))?;

    let prev_hash: Option<String> = sqlx::query_scalar("SELECT hash FROM audit_log ORDER BY seq DESC LIMIT 1")
        .fetch_optional(pool)
        .await?;
    let hash = chain_hash(prev_hash.as_deref(), &payload);

    sqlx::query(
        "INSERT INTO audit_log (id, operation, outcome, partition_id, targets, error_code, occurred_at, payload, prev_hash, hash) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(event.id.to_string())
    .bind(event.operation.as_str())
    .bind(event.outcome.as_str())
    .bind(&event.partition_id)
    .bind(targets)
    .bind(&event.error_code)
    .bind(event.occurred_at.to_rfc3339())
    .bind(&payload)
    .bind(&prev_hash)
    .bind(&hash)
    .execute(pool)
    .await?;

    Ok(())
}

/// Recompute the hash chain; false if any row was altered, removed or reordered.
pub async fn verify_chain(pool: &SqlitePool) -> GraphResult<bool> {
    let rows = sqlx::query("SELECT payload, prev_hash, hash FROM audit_log ORDER BY seq ASC")
        .fetch_all(pool)
        .await?;

    let mut expected_prev: Option<String> = None;
    for row in rows {
        let payload: String = row.try_get("payload")?;
        let prev_hash: Option<String> = row.try_get("prev_hash")?;
        let hash: String = row.try_get("hash")?;

        if prev_hash != expected_prev || chain_hash(prev_hash.as_deref(), &payload) != hash {
            return Ok(false);
        }
        expected_prev = Some(hash);
    }

    Ok(true)
}

/// Persist events from the bus until every sender is dropped.
pub async fn start_audit_listener(mut rx: broadcast::Receiver<AuditEvent>, pool: SqlitePool) {
    tracing::info!("audit listener started");
    loop {
        match rx.recv().await {
            Ok(event) => {
                if let Err(err) = record_event(&pool, &event).await {
                    tracing::error!(event_id = %event.id, error = %err, "failed to persist audit event");
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "audit listener lagged, events lost");
            }
            Err(RecvError::Closed) => break,
        }
    }
    tracing::info!("audit listener stopped");
}

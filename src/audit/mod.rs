//! Mutation audit trail.
//!
//! Loggers are fire-and-forget: they never return errors and never block the
//! mutation path on I/O.

mod listener;

pub use listener::{record_event, start_audit_listener, verify_chain};

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::errors::GraphError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    CreateGroup,
    AddMember,
    RemoveMember,
    DeleteGroup,
    RenameGroup,
    UpdateGroupAppIds,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::CreateGroup => "create_group",
            OperationKind::AddMember => "add_member",
            OperationKind::RemoveMember => "remove_member",
            OperationKind::DeleteGroup => "delete_group",
            OperationKind::RenameGroup => "rename_group",
            OperationKind::UpdateGroupAppIds => "update_group_app_ids",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuditOutcome {
    Success,
    Failure,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOutcome::Success => "SUCCESS",
            AuditOutcome::Failure => "FAILURE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub operation: OperationKind,
    pub outcome: AuditOutcome,
    pub partition_id: String,
    pub targets: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn success(operation: OperationKind, partition_id: &str, targets: &[String]) -> Self {
        Self {
            id: Uuid::new_v4(),
            operation,
            outcome: AuditOutcome::Success,
            partition_id: partition_id.to_string(),
            targets: targets.to_vec(),
            error_code: None,
            error: None,
            occurred_at: Utc::now(),
        }
    }

    pub fn failure(operation: OperationKind, partition_id: &str, targets: &[String], error: &GraphError) -> Self {
        Self {
            outcome: AuditOutcome::Failure,
            error_code: Some(error.code().to_string()),
            error: Some(error.to_string()),
            ..Self::success(operation, partition_id, targets)
        }
    }
}

pub trait AuditLogger: Send + Sync {
    fn record_success(&self, operation: OperationKind, partition_id: &str, targets: &[String]);

    fn record_failure(&self, operation: OperationKind, partition_id: &str, targets: &[String], error: &GraphError);
}

/// Writes audit records as structured `tracing` events under the `audit` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditLogger;

impl AuditLogger for TracingAuditLogger {
    fn record_success(&self, operation: OperationKind, partition_id: &str, targets: &[String]) {
        tracing::info!(
            target: "audit",
            operation = %operation,
            partition_id = %partition_id,
            targets = ?targets,
            outcome = AuditOutcome::Success.as_str(),
            "mutation audited"
        );
    }

    fn record_failure(&self, operation: OperationKind, partition_id: &str, targets: &[String], error: &GraphError) {
        tracing::warn!(
            target: "audit",
            operation = %operation,
            partition_id = %partition_id,
            targets = ?targets,
            outcome = AuditOutcome::Failure.as_str(),
            error_code = error.code(),
            error = %error,
            "mutation audited"
        );
    }
}

pub type AuditBus = broadcast::Sender<AuditEvent>;

pub fn init_audit_bus() -> (AuditBus, broadcast::Receiver<AuditEvent>) {
    broadcast::channel(1024)
}

/// Publishes audit records on a broadcast channel for asynchronous persistence.
#[derive(Debug, Clone)]
pub struct EventBusAuditLogger {
    bus: AuditBus,
}

impl EventBusAuditLogger {
    pub fn new(bus: AuditBus) -> Self {
        Self { bus }
    }

    fn publish(&self, event: AuditEvent) {
        // No subscriber is not an error for the mutation.
        if self.bus.send(event).is_err() {
            tracing::debug!("audit event dropped: no listener");
        }
    }
}

impl AuditLogger for EventBusAuditLogger {
    fn record_success(&self, operation: OperationKind, partition_id: &str, targets: &[String]) {
        self.publish(AuditEvent::success(operation, partition_id, targets));
    }

    fn record_failure(&self, operation: OperationKind, partition_id: &str, targets: &[String], error: &GraphError) {
        self.publish(AuditEvent::failure(operation, partition_id, targets, error));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn event_bus_logger_publishes_failures_with_codes() {
        let (bus, mut rx) = init_audit_bus();
        let logger = EventBusAuditLogger::new(bus);
        let targets = vec!["data.x@p1.example.com".to_string()];

        logger.record_failure(
            OperationKind::AddMember,
            "p1",
            &targets,
            &GraphError::precondition("cyclic membership"),
        );

        let event = rx.recv().await.unwrap();
        assert_eq!(event.operation, OperationKind::AddMember);
        assert_eq!(event.outcome, AuditOutcome::Failure);
        assert_eq!(event.error_code.as_deref(), Some("precondition_failed"));
        assert_eq!(event.targets, targets);
    }

    #[test]
    fn logging_without_listener_does_not_panic() {
        let (bus, rx) = init_audit_bus();
        drop(rx);
        EventBusAuditLogger::new(bus).record_success(OperationKind::CreateGroup, "p1", &[]);
    }
}

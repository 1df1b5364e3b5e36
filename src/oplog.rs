//! Compensating log for multi-step mutations.
//!
//! The store has no multi-key transactions, so each forward step that
//! succeeds is recorded here and undone in reverse order if a later step
//! fails.

use std::time::Duration;

use crate::errors::GraphResult;
use crate::models::{EntityNode, Role};
use crate::retry::{with_retry, RetryPolicy};
use crate::store::GraphStore;

/// A forward step that has already been applied to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubOperation {
    CreateNode(EntityNode),
    DeleteNode(EntityNode),
    UpdateNode {
        previous: EntityNode,
    },
    AddEdge {
        parent_id: String,
        child_id: String,
        role: Role,
        partition_id: String,
    },
    RemoveEdge {
        parent_id: String,
        child_id: String,
        role: Role,
        partition_id: String,
    },
    AddPartitionAssociation {
        user_id: String,
        partition_id: String,
    },
    RemovePartitionAssociation {
        user_id: String,
        partition_id: String,
    },
}

impl SubOperation {
    pub fn name(&self) -> &'static str {
        match self {
            SubOperation::CreateNode(_) => "create_node",
            SubOperation::DeleteNode(_) => "delete_node",
            SubOperation::UpdateNode { .. } => "update_node",
            SubOperation::AddEdge { .. } => "add_edge",
            SubOperation::RemoveEdge { .. } => "remove_edge",
            SubOperation::AddPartitionAssociation { .. } => "add_partition_association",
            SubOperation::RemovePartitionAssociation { .. } => "remove_partition_association",
        }
    }

    /// Apply the inverse of this step.
    pub async fn compensate(&self, store: &dyn GraphStore) -> GraphResult<()> {
        match self {
            SubOperation::CreateNode(node) => store.delete_node(&node.node_id, &node.data_partition_id).await,
            SubOperation::DeleteNode(node) => store.create_node(node).await,
            SubOperation::UpdateNode { previous } => store.update_node(previous).await,
            SubOperation::AddEdge {
                parent_id,
                child_id,
                partition_id,
                ..
            } => store.remove_edge(parent_id, child_id, partition_id).await,
            SubOperation::RemoveEdge {
                parent_id,
                child_id,
                role,
                partition_id,
            } => store.add_edge(parent_id, child_id, *role, partition_id).await,
            SubOperation::AddPartitionAssociation { user_id, partition_id } => {
                store.remove_partition_association(user_id, partition_id).await
            }
            SubOperation::RemovePartitionAssociation { user_id, partition_id } => {
                store.add_partition_association(user_id, partition_id).await
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct OperationLog {
    executed: Vec<SubOperation>,
}

impl OperationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, operation: SubOperation) {
        self.executed.push(operation);
    }

    pub fn len(&self) -> usize {
        self.executed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executed.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SubOperation> {
        self.executed.iter()
    }

    /// Undo every recorded step, newest first. Each compensation is retried on
    /// contention and bounded by `step_timeout`; a failing step does not stop
    /// the unwind. Returns how many compensations did not complete.
    pub async fn unwind(self, store: &dyn GraphStore, retry: &RetryPolicy, step_timeout: Duration) -> usize {
        let mut failed = 0;

        for operation in self.executed.into_iter().rev() {
            let step = &operation;
            let attempt = with_retry(retry, step.name(), move || step.compensate(store));

            match tokio::time::timeout(step_timeout, attempt).await {
                Ok(Ok(())) => {
                    tracing::debug!(step = step.name(), "compensated");
                }
                Ok(Err(err)) => {
                    failed += 1;
                    tracing::warn!(step = step.name(), operation = ?step, error = %err, "compensation failed");
                }
                Err(_) => {
                    failed += 1;
                    tracing::warn!(
                        step = step.name(),
                        operation = ?step,
                        timeout_ms = step_timeout.as_millis() as u64,
                        "compensation timed out"
                    );
                }
            }
        }

        failed
    }
}

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use membership_engine::audit::{AuditEvent, AuditLogger, AuditOutcome, OperationKind};
use membership_engine::cache::{EffectiveGroups, InMemoryCache};
use membership_engine::retry::RetryPolicy;
use membership_engine::{
    ChildrenReference, EngineConfig, EntityNode, GraphError, GraphResult, GraphSnapshot, GraphStore,
    InMemoryGraphStore, MembershipEngine, ParentReference, Role,
};

pub const P: &str = "opendes";
pub const DOMAIN: &str = "example.com";

pub fn test_config() -> EngineConfig {
    EngineConfig {
        domain: DOMAIN.to_string(),
        retry: RetryPolicy::immediate(3),
        rollback_step_timeout: Duration::from_millis(200),
        ..EngineConfig::default()
    }
}

pub fn group(name: &str) -> EntityNode {
    EntityNode::group(name, "", P, DOMAIN)
}

pub fn user(email: &str) -> EntityNode {
    EntityNode::user(email, P)
}

pub fn ids(values: &[&str]) -> BTreeSet<String> {
    values.iter().map(|v| v.to_string()).collect()
}

pub fn engine_over(store: Arc<dyn GraphStore>, audit: Arc<dyn AuditLogger>) -> MembershipEngine {
    MembershipEngine::new(store, Arc::new(InMemoryCache::<EffectiveGroups>::new()), audit, test_config())
}

/// Audit sink that keeps every event for inspection.
#[derive(Default)]
pub struct RecordingAuditLogger {
    events: Mutex<Vec<AuditEvent>>,
}

impl RecordingAuditLogger {
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn last(&self) -> Option<AuditEvent> {
        self.events.lock().unwrap().last().cloned()
    }

    pub fn outcomes(&self, operation: OperationKind) -> Vec<AuditOutcome> {
        self.events()
            .into_iter()
            .filter(|event| event.operation == operation)
            .map(|event| event.outcome)
            .collect()
    }
}

impl AuditLogger for RecordingAuditLogger {
    fn record_success(&self, operation: OperationKind, partition_id: &str, targets: &[String]) {
        self.events
            .lock()
            .unwrap()
            .push(AuditEvent::success(operation, partition_id, targets));
    }

    fn record_failure(&self, operation: OperationKind, partition_id: &str, targets: &[String], error: &GraphError) {
        self.events
            .lock()
            .unwrap()
            .push(AuditEvent::failure(operation, partition_id, targets, error));
    }
}

#[derive(Debug, Clone, Copy)]
pub enum FaultAction {
    Fail(fn() -> GraphError),
    Stall(Duration),
}

#[derive(Debug)]
struct Fault {
    operation: &'static str,
    skip: usize,
    remaining: usize,
    action: FaultAction,
}

/// In-memory store whose calls can be made to fail or hang on demand.
#[derive(Default)]
pub struct FaultyStore {
    inner: InMemoryGraphStore,
    faults: Mutex<Vec<Fault>>,
    calls: Mutex<Vec<&'static str>>,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inner(&self) -> &InMemoryGraphStore {
        &self.inner
    }

    /// Let `skip` calls of `operation` through, then apply `action` to the next `times`.
    pub fn arm(&self, operation: &'static str, skip: usize, times: usize, action: FaultAction) {
        self.faults.lock().unwrap().push(Fault {
            operation,
            skip,
            remaining: times,
            action,
        });
    }

    pub fn fail(&self, operation: &'static str, skip: usize, times: usize, error: fn() -> GraphError) {
        self.arm(operation, skip, times, FaultAction::Fail(error));
    }

    pub fn disarm(&self) {
        self.faults.lock().unwrap().clear();
    }

    pub fn calls(&self, operation: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|op| **op == operation).count()
    }

    async fn check(&self, operation: &'static str) -> GraphResult<()> {
        self.calls.lock().unwrap().push(operation);

        let action = {
            let mut faults = self.faults.lock().unwrap();
            faults
                .iter_mut()
                .find(|fault| fault.operation == operation && (fault.skip > 0 || fault.remaining > 0))
                .and_then(|fault| {
                    if fault.skip > 0 {
                        fault.skip -= 1;
                        None
                    } else {
                        fault.remaining -= 1;
                        Some(fault.action)
                    }
                })
        };

        match action {
            None => Ok(()),
            Some(FaultAction::Fail(error)) => Err(error()),
            Some(FaultAction::Stall(duration)) => {
                tokio::time::sleep(duration).await;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl GraphStore for FaultyStore {
    async fn create_node(&self, node: &EntityNode) -> GraphResult<()> {
        self.check("create_node").await?;
        self.inner.create_node(node).await
    }

    async fn delete_node(&self, node_id: &str, partition_id: &str) -> GraphResult<()> {
        self.check("delete_node").await?;
        self.inner.delete_node(node_id, partition_id).await
    }

    async fn update_node(&self, node: &EntityNode) -> GraphResult<()> {
        self.check("update_node").await?;
        self.inner.update_node(node).await
    }

    async fn add_edge(&self, parent_id: &str, child_id: &str, role: Role, partition_id: &str) -> GraphResult<()> {
        self.check("add_edge").await?;
        self.inner.add_edge(parent_id, child_id, role, partition_id).await
    }

    async fn remove_edge(&self, parent_id: &str, child_id: &str, partition_id: &str) -> GraphResult<()> {
        self.check("remove_edge").await?;
        self.inner.remove_edge(parent_id, child_id, partition_id).await
    }

    async fn get_node(&self, node_id: &str, partition_id: &str) -> GraphResult<Option<EntityNode>> {
        self.check("get_node").await?;
        self.inner.get_node(node_id, partition_id).await
    }

    async fn get_direct_children(&self, node_id: &str, partition_id: &str) -> GraphResult<Vec<ChildrenReference>> {
        self.check("get_direct_children").await?;
        self.inner.get_direct_children(node_id, partition_id).await
    }

    async fn get_direct_parents(&self, node_id: &str, partition_id: &str) -> GraphResult<Vec<ParentReference>> {
        self.check("get_direct_parents").await?;
        self.inner.get_direct_parents(node_id, partition_id).await
    }

    async fn get_all_descendant_user_ids(&self, node_id: &str, partition_id: &str) -> GraphResult<BTreeSet<String>> {
        self.check("get_all_descendant_user_ids").await?;
        self.inner.get_all_descendant_user_ids(node_id, partition_id).await
    }

    async fn get_all_ancestors(&self, node_id: &str, partition_id: &str) -> GraphResult<Vec<ParentReference>> {
        self.check("get_all_ancestors").await?;
        self.inner.get_all_ancestors(node_id, partition_id).await
    }

    async fn add_partition_association(&self, user_id: &str, partition_id: &str) -> GraphResult<()> {
        self.check("add_partition_association").await?;
        self.inner.add_partition_association(user_id, partition_id).await
    }

    async fn remove_partition_association(&self, user_id: &str, partition_id: &str) -> GraphResult<()> {
        self.check("remove_partition_association").await?;
        self.inner.remove_partition_association(user_id, partition_id).await
    }

    async fn has_partition_association(&self, user_id: &str, partition_id: &str) -> GraphResult<bool> {
        self.check("has_partition_association").await?;
        self.inner.has_partition_association(user_id, partition_id).await
    }

    async fn snapshot(&self, partition_id: &str) -> GraphResult<GraphSnapshot> {
        self.inner.snapshot(partition_id).await
    }
}

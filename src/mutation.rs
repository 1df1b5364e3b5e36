//! Group and membership mutations as compensable sagas.
//!
//! Every public operation follows the same protocol: validate, apply
//! sub-operations one by one (recording each in an [`OperationLog`]), compute
//! the affected users, then either invalidate their cache entries and audit
//! success, or unwind the log and audit the failure. Errors are returned
//! unchanged unless the unwind itself fails, in which case they are wrapped
//! in `AmbiguousRollback`.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::audit::{AuditLogger, OperationKind};
use crate::cache::MembershipCache;
use crate::config::EngineConfig;
use crate::depth::DepthGuard;
use crate::errors::{GraphError, GraphResult};
use crate::models::{ChildrenReference, EntityNode, Role};
use crate::oplog::{OperationLog, SubOperation};
use crate::retry::with_retry;
use crate::store::GraphStore;
use crate::traversal::TraversalService;
use crate::utils::{data_root_group_id, is_bootstrap_group, users_group_id};

/// Users whose effective group set changed.
pub type AffectedUsers = BTreeSet<String>;

pub struct GroupMutationService {
    store: Arc<dyn GraphStore>,
    traversal: TraversalService,
    depth_guard: DepthGuard,
    cache: Arc<MembershipCache>,
    audit: Arc<dyn AuditLogger>,
    config: EngineConfig,
}

fn ensure_partition(node: &EntityNode, partition_id: &str) -> GraphResult<()> {
    if node.data_partition_id != partition_id {
        return Err(GraphError::precondition(format!(
            "{} belongs to partition {}, not {}",
            node.node_id, node.data_partition_id, partition_id
        )));
    }
    Ok(())
}

fn ensure_group(node: &EntityNode) -> GraphResult<()> {
    if !node.is_group() {
        return Err(GraphError::precondition(format!("{} is not a group", node.node_id)));
    }
    Ok(())
}

impl GroupMutationService {
    pub fn new(
        store: Arc<dyn GraphStore>,
        cache: Arc<MembershipCache>,
        audit: Arc<dyn AuditLogger>,
        config: EngineConfig,
    ) -> Self {
        Self {
            traversal: TraversalService::new(Arc::clone(&store), config.retry.clone()),
            depth_guard: DepthGuard::new(config.max_depth),
            store,
            cache,
            audit,
            config,
        }
    }

    pub fn traversal(&self) -> &TraversalService {
        &self.traversal
    }

    // ------------------------------------------------------------------
    // Public operations
    // ------------------------------------------------------------------

    /// Create `group` owned by `requester`, optionally nesting the
    /// partition's data root group under it.
    pub async fn create_group(
        &self,
        group: &EntityNode,
        requester: &EntityNode,
        partition_id: &str,
        add_data_root_group: bool,
    ) -> GraphResult<AffectedUsers> {
        let targets = vec![group.node_id.clone(), requester.node_id.clone()];
        let mut log = OperationLog::new();
        let outcome = self
            .create_group_steps(&mut log, group, requester, partition_id, add_data_root_group)
            .await;
        self.complete(OperationKind::CreateGroup, partition_id, targets, log, outcome)
            .await
    }

    pub async fn add_member(
        &self,
        group: &EntityNode,
        member: &EntityNode,
        role: Role,
        partition_id: &str,
    ) -> GraphResult<AffectedUsers> {
        let targets = vec![group.node_id.clone(), member.node_id.clone()];
        let mut log = OperationLog::new();
        let outcome = self.add_member_steps(&mut log, group, member, role, partition_id).await;
        self.complete(OperationKind::AddMember, partition_id, targets, log, outcome)
            .await
    }

    pub async fn remove_member(
        &self,
        group: &EntityNode,
        member: &EntityNode,
        partition_id: &str,
    ) -> GraphResult<AffectedUsers> {
        let targets = vec![group.node_id.clone(), member.node_id.clone()];
        let mut log = OperationLog::new();
        let outcome = self.remove_member_steps(&mut log, group, member, partition_id).await;
        self.complete(OperationKind::RemoveMember, partition_id, targets, log, outcome)
            .await
    }

    pub async fn delete_group(&self, group: &EntityNode, partition_id: &str) -> GraphResult<AffectedUsers> {
        let targets = vec![group.node_id.clone()];
        let mut log = OperationLog::new();
        let outcome = self.delete_group_steps(&mut log, group, partition_id).await;
        self.complete(OperationKind::DeleteGroup, partition_id, targets, log, outcome)
            .await
    }

    /// Rename by re-creating the group under its new id, moving every edge
    /// across and deleting the original, all under one log.
    pub async fn rename_group(
        &self,
        group: &EntityNode,
        new_name: &str,
        partition_id: &str,
    ) -> GraphResult<AffectedUsers> {
        let renamed = group.renamed(new_name, &self.config.domain);
        let targets = vec![group.node_id.clone(), renamed.node_id.clone()];
        let mut log = OperationLog::new();
        let outcome = self.rename_group_steps(&mut log, group, &renamed, partition_id).await;
        self.complete(OperationKind::RenameGroup, partition_id, targets, log, outcome)
            .await
    }

    pub async fn update_group_app_ids(
        &self,
        group: &EntityNode,
        app_ids: BTreeSet<String>,
        partition_id: &str,
    ) -> GraphResult<AffectedUsers> {
        let targets = vec![group.node_id.clone()];
        let mut log = OperationLog::new();
        let outcome = self
            .update_app_ids_steps(&mut log, group, app_ids, partition_id)
            .await;
        self.complete(OperationKind::UpdateGroupAppIds, partition_id, targets, log, outcome)
            .await
    }

    // ------------------------------------------------------------------
    // Saga bodies; each appends to the caller's log so they compose.
    // ------------------------------------------------------------------

    async fn create_group_steps(
        &self,
        log: &mut OperationLog,
        group: &EntityNode,
        requester: &EntityNode,
        partition_id: &str,
        add_data_root_group: bool,
    ) -> GraphResult<AffectedUsers> {
        ensure_partition(group, partition_id)?;
        ensure_partition(requester, partition_id)?;
        ensure_group(group)?;
        if !requester.is_user() {
            return Err(GraphError::precondition(format!("requester {} is not a user", requester.node_id)));
        }

        let data_root_id = data_root_group_id(partition_id, &self.config.domain);
        let data_root = if add_data_root_group && group.node_id != data_root_id {
            let root = self.traversal.require_node(&data_root_id, partition_id).await?;
            self.depth_guard
                .validate_link_depth(&self.traversal, &group.node_id, &root.node_id, partition_id)
                .await?;
            Some(root)
        } else {
            None
        };

        self.exec_create_node(log, group).await?;
        self.ensure_user_node(log, requester, partition_id).await?;
        self.exec_add_edge(log, &group.node_id, &requester.node_id, Role::Owner, partition_id)
            .await?;
        if group.node_id == users_group_id(partition_id, &self.config.domain) {
            self.ensure_partition_association(log, &requester.node_id, partition_id)
                .await?;
        }

        let mut affected = AffectedUsers::from([requester.node_id.clone()]);
        if let Some(root) = data_root {
            self.exec_add_edge(log, &group.node_id, &root.node_id, Role::Member, partition_id)
                .await?;
            affected.extend(self.traversal.descendant_user_ids(&root.node_id, partition_id).await?);
        }

        Ok(affected)
    }

    async fn add_member_steps(
        &self,
        log: &mut OperationLog,
        group: &EntityNode,
        member: &EntityNode,
        role: Role,
        partition_id: &str,
    ) -> GraphResult<AffectedUsers> {
        ensure_partition(group, partition_id)?;
        ensure_partition(member, partition_id)?;
        ensure_group(group)?;
        self.traversal.require_node(&group.node_id, partition_id).await?;

        if member.is_group() {
            self.traversal.require_node(&member.node_id, partition_id).await?;
            if self
                .traversal
                .is_self_or_ancestor(&member.node_id, &group.node_id, partition_id)
                .await?
            {
                return Err(GraphError::precondition(format!(
                    "adding {} to {} would create a cyclic membership",
                    member.node_id, group.node_id
                )));
            }
            self.depth_guard
                .validate_link_depth(&self.traversal, &group.node_id, &member.node_id, partition_id)
                .await?;
        } else {
            self.ensure_user_node(log, member, partition_id).await?;
        }

        self.exec_add_edge(log, &group.node_id, &member.node_id, role, partition_id)
            .await?;

        if member.is_user() && group.node_id == users_group_id(partition_id, &self.config.domain) {
            self.ensure_partition_association(log, &member.node_id, partition_id)
                .await?;
        }

        self.traversal.descendant_user_ids(&member.node_id, partition_id).await
    }

    async fn remove_member_steps(
        &self,
        log: &mut OperationLog,
        group: &EntityNode,
        member: &EntityNode,
        partition_id: &str,
    ) -> GraphResult<AffectedUsers> {
        ensure_partition(group, partition_id)?;
        ensure_partition(member, partition_id)?;
        ensure_group(group)?;

        let children = self.traversal.direct_children(&group.node_id, partition_id).await?;
        let edge = children
            .iter()
            .find(|child| child.id == member.node_id)
            .ok_or_else(|| {
                GraphError::not_found(format!("{} is not a member of {}", member.node_id, group.node_id))
            })?;

        let owners = children.iter().filter(|child| child.role == Role::Owner).count();
        if edge.role == Role::Owner && owners == 1 {
            return Err(GraphError::precondition(format!(
                "{} is the last owner of {}",
                member.node_id, group.node_id
            )));
        }

        // Computed before the edge goes away, while the member is still reachable.
        let affected = self.traversal.descendant_user_ids(&member.node_id, partition_id).await?;

        self.exec_remove_edge(log, &group.node_id, &member.node_id, edge.role, partition_id)
            .await?;

        if edge.is_user() {
            if group.node_id == users_group_id(partition_id, &self.config.domain)
                && self.has_partition_association(&member.node_id, partition_id).await?
            {
                self.exec_remove_partition_association(log, &member.node_id, partition_id)
                    .await?;
            }
            self.collect_orphaned_user(log, &member.node_id, partition_id).await?;
        }

        Ok(affected)
    }

    async fn delete_group_steps(
        &self,
        log: &mut OperationLog,
        group: &EntityNode,
        partition_id: &str,
    ) -> GraphResult<AffectedUsers> {
        ensure_partition(group, partition_id)?;
        ensure_group(group)?;
        if is_bootstrap_group(&group.node_id, partition_id, &self.config.domain) {
            return Err(GraphError::precondition(format!("{} cannot be deleted", group.node_id)));
        }

        let existing = self.traversal.require_node(&group.node_id, partition_id).await?;
        let affected = self.traversal.descendant_user_ids(&existing.node_id, partition_id).await?;
        let children = self.traversal.direct_children(&existing.node_id, partition_id).await?;
        let parents = self.traversal.direct_parents(&existing.node_id, partition_id).await?;

        // Edges first: a failed node delete can then be compensated by re-linking.
        for child in &children {
            self.exec_remove_edge(log, &existing.node_id, &child.id, child.role, partition_id)
                .await?;
        }
        for parent in &parents {
            self.exec_remove_edge(log, &parent.id, &existing.node_id, parent.role, partition_id)
                .await?;
        }
        self.exec_delete_node(log, &existing).await?;

        for child in children.iter().filter(|child| child.is_user()) {
            self.collect_orphaned_user(log, &child.id, partition_id).await?;
        }

        Ok(affected)
    }

    async fn rename_group_steps(
        &self,
        log: &mut OperationLog,
        group: &EntityNode,
        renamed: &EntityNode,
        partition_id: &str,
    ) -> GraphResult<AffectedUsers> {
        ensure_partition(group, partition_id)?;
        ensure_group(group)?;
        if is_bootstrap_group(&group.node_id, partition_id, &self.config.domain) {
            return Err(GraphError::precondition(format!("{} cannot be renamed", group.node_id)));
        }
        if renamed.node_id == group.node_id {
            return Err(GraphError::precondition(format!("{} already has that name", group.node_id)));
        }

        self.traversal.require_node(&group.node_id, partition_id).await?;
        if self.traversal.get_node(&renamed.node_id, partition_id).await?.is_some() {
            return Err(GraphError::conflict(format!("group {} already exists", renamed.node_id)));
        }

        let children = self.traversal.direct_children(&group.node_id, partition_id).await?;
        let parents = self.traversal.direct_parents(&group.node_id, partition_id).await?;
        let owner: &ChildrenReference = children
            .iter()
            .find(|child| child.role == Role::Owner && child.is_user())
            .ok_or_else(|| GraphError::precondition(format!("{} has no direct user owner", group.node_id)))?;
        let requester = self.traversal.require_node(&owner.id, partition_id).await?;

        let mut affected = self
            .create_group_steps(log, renamed, &requester, partition_id, false)
            .await?;

        for child in children.iter().filter(|child| child.id != owner.id) {
            self.exec_add_edge(log, &renamed.node_id, &child.id, child.role, partition_id)
                .await?;
        }
        for parent in &parents {
            self.exec_add_edge(log, &parent.id, &renamed.node_id, parent.role, partition_id)
                .await?;
        }

        affected.extend(self.delete_group_steps(log, group, partition_id).await?);
        Ok(affected)
    }

    async fn update_app_ids_steps(
        &self,
        log: &mut OperationLog,
        group: &EntityNode,
        app_ids: BTreeSet<String>,
        partition_id: &str,
    ) -> GraphResult<AffectedUsers> {
        ensure_partition(group, partition_id)?;
        ensure_group(group)?;

        let existing = self.traversal.require_node(&group.node_id, partition_id).await?;
        if existing.app_ids == app_ids {
            return Ok(AffectedUsers::new());
        }

        let updated = EntityNode {
            app_ids,
            ..existing.clone()
        };
        self.exec_update_node(log, &existing, &updated).await?;

        self.traversal.descendant_user_ids(&existing.node_id, partition_id).await
    }

    // ------------------------------------------------------------------
    // Completion
    // ------------------------------------------------------------------

    async fn complete(
        &self,
        operation: OperationKind,
        partition_id: &str,
        targets: Vec<String>,
        log: OperationLog,
        outcome: GraphResult<AffectedUsers>,
    ) -> GraphResult<AffectedUsers> {
        match outcome {
            Ok(affected) => {
                self.cache.invalidate_all(&affected, partition_id).await;
                self.audit.record_success(operation, partition_id, &targets);
                tracing::info!(
                    operation = %operation,
                    partition_id = %partition_id,
                    sub_operations = log.len(),
                    affected_users = affected.len(),
                    "mutation committed"
                );
                Ok(affected)
            }
            Err(err) => {
                // Readers may have cached the half-applied graph.
                let exposed = self.exposed_users(&log, partition_id).await;
                let err = self.roll_back(operation, partition_id, log, err).await;
                self.cache.invalidate_all(&exposed, partition_id).await;
                if matches!(err, GraphError::InternalStore(_) | GraphError::AmbiguousRollback { .. }) {
                    tracing::error!(operation = %operation, partition_id = %partition_id, error = %err, "mutation failed");
                } else {
                    tracing::debug!(operation = %operation, partition_id = %partition_id, error = %err, "mutation rejected");
                }
                self.audit.record_failure(operation, partition_id, &targets, &err);
                Err(err)
            }
        }
    }

    /// Users whose effective groups any recorded step could have changed,
    /// read while the log is still applied.
    async fn exposed_users(&self, log: &OperationLog, partition_id: &str) -> AffectedUsers {
        let mut exposed = AffectedUsers::new();
        for step in log.iter() {
            let below = match step {
                SubOperation::AddEdge { child_id, .. } | SubOperation::RemoveEdge { child_id, .. } => child_id,
                SubOperation::UpdateNode { previous } => &previous.node_id,
                SubOperation::CreateNode(node) | SubOperation::DeleteNode(node) => {
                    if node.is_user() {
                        exposed.insert(node.node_id.clone());
                    }
                    continue;
                }
                SubOperation::AddPartitionAssociation { .. } | SubOperation::RemovePartitionAssociation { .. } => {
                    continue
                }
            };
            match self.traversal.descendant_user_ids(below, partition_id).await {
                Ok(users) => exposed.extend(users),
                Err(err) => tracing::warn!(
                    node_id = %below,
                    partition_id = %partition_id,
                    error = %err,
                    "could not resolve users to invalidate after failure"
                ),
            }
        }
        exposed
    }

    async fn roll_back(
        &self,
        operation: OperationKind,
        partition_id: &str,
        log: OperationLog,
        err: GraphError,
    ) -> GraphError {
        if log.is_empty() {
            return err;
        }

        tracing::warn!(
            operation = %operation,
            partition_id = %partition_id,
            steps = log.len(),
            error = %err,
            "mutation failed part-way, rolling back"
        );

        let failed = log
            .unwind(self.store.as_ref(), &self.config.retry, self.config.rollback_step_timeout)
            .await;

        if failed == 0 {
            err
        } else {
            tracing::error!(
                operation = %operation,
                partition_id = %partition_id,
                failed_steps = failed,
                "rollback incomplete, partition needs reconciliation"
            );
            GraphError::ambiguous_rollback(failed, err)
        }
    }

    // ------------------------------------------------------------------
    // Sub-operations: retried on contention, logged once applied.
    // ------------------------------------------------------------------

    async fn exec_create_node(&self, log: &mut OperationLog, node: &EntityNode) -> GraphResult<()> {
        let store = self.store.as_ref();
        with_retry(&self.config.retry, "create_node", move || store.create_node(node)).await?;
        log.record(SubOperation::CreateNode(node.clone()));
        Ok(())
    }

    async fn exec_delete_node(&self, log: &mut OperationLog, node: &EntityNode) -> GraphResult<()> {
        let store = self.store.as_ref();
        let (node_id, partition_id) = (node.node_id.as_str(), node.data_partition_id.as_str());
        with_retry(&self.config.retry, "delete_node", move || {
            store.delete_node(node_id, partition_id)
        })
        .await?;
        log.record(SubOperation::DeleteNode(node.clone()));
        Ok(())
    }

    async fn exec_update_node(
        &self,
        log: &mut OperationLog,
        previous: &EntityNode,
        updated: &EntityNode,
    ) -> GraphResult<()> {
        let store = self.store.as_ref();
        with_retry(&self.config.retry, "update_node", move || store.update_node(updated)).await?;
        log.record(SubOperation::UpdateNode {
            previous: previous.clone(),
        });
        Ok(())
    }

    async fn exec_add_edge(
        &self,
        log: &mut OperationLog,
        parent_id: &str,
        child_id: &str,
        role: Role,
        partition_id: &str,
    ) -> GraphResult<()> {
        let store = self.store.as_ref();
        with_retry(&self.config.retry, "add_edge", move || {
            store.add_edge(parent_id, child_id, role, partition_id)
        })
        .await?;
        log.record(SubOperation::AddEdge {
            parent_id: parent_id.to_string(),
            child_id: child_id.to_string(),
            role,
            partition_id: partition_id.to_string(),
        });
        Ok(())
    }

    async fn exec_remove_edge(
        &self,
        log: &mut OperationLog,
        parent_id: &str,
        child_id: &str,
        role: Role,
        partition_id: &str,
    ) -> GraphResult<()> {
        let store = self.store.as_ref();
        with_retry(&self.config.retry, "remove_edge", move || {
            store.remove_edge(parent_id, child_id, partition_id)
        })
        .await?;
        log.record(SubOperation::RemoveEdge {
            parent_id: parent_id.to_string(),
            child_id: child_id.to_string(),
            role,
            partition_id: partition_id.to_string(),
        });
        Ok(())
    }

    async fn exec_add_partition_association(
        &self,
        log: &mut OperationLog,
        user_id: &str,
        partition_id: &str,
    ) -> GraphResult<()> {
        let store = self.store.as_ref();
        with_retry(&self.config.retry, "add_partition_association", move || {
            store.add_partition_association(user_id, partition_id)
        })
        .await?;
        log.record(SubOperation::AddPartitionAssociation {
            user_id: user_id.to_string(),
            partition_id: partition_id.to_string(),
        });
        Ok(())
    }

    async fn exec_remove_partition_association(
        &self,
        log: &mut OperationLog,
        user_id: &str,
        partition_id: &str,
    ) -> GraphResult<()> {
        let store = self.store.as_ref();
        with_retry(&self.config.retry, "remove_partition_association", move || {
            store.remove_partition_association(user_id, partition_id)
        })
        .await?;
        log.record(SubOperation::RemovePartitionAssociation {
            user_id: user_id.to_string(),
            partition_id: partition_id.to_string(),
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    async fn has_partition_association(&self, user_id: &str, partition_id: &str) -> GraphResult<bool> {
        let store = self.store.as_ref();
        with_retry(&self.config.retry, "has_partition_association", move || {
            store.has_partition_association(user_id, partition_id)
        })
        .await
    }

    /// Users are created on first reference.
    async fn ensure_user_node(
        &self,
        log: &mut OperationLog,
        user: &EntityNode,
        partition_id: &str,
    ) -> GraphResult<()> {
        if self.traversal.get_node(&user.node_id, partition_id).await?.is_none() {
            self.exec_create_node(log, user).await?;
        }
        Ok(())
    }

    async fn ensure_partition_association(
        &self,
        log: &mut OperationLog,
        user_id: &str,
        partition_id: &str,
    ) -> GraphResult<()> {
        if !self.has_partition_association(user_id, partition_id).await? {
            self.exec_add_partition_association(log, user_id, partition_id)
                .await?;
        }
        Ok(())
    }

    /// A user with no remaining group is not kept as a node.
    async fn collect_orphaned_user(&self, log: &mut OperationLog, user_id: &str, partition_id: &str) -> GraphResult<()> {
        if !self.traversal.direct_parents(user_id, partition_id).await?.is_empty() {
            return Ok(());
        }
        let Some(user) = self.traversal.get_node(user_id, partition_id).await? else {
            return Ok(());
        };
        if !user.is_user() {
            return Ok(());
        }

        tracing::debug!(user_id = %user_id, partition_id = %partition_id, "removing orphaned user node");
        self.exec_delete_node(log, &user).await
    }
}

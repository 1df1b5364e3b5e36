use std::collections::BTreeSet;
use std::sync::Arc;

use crate::audit::{AuditLogger, TracingAuditLogger};
use crate::cache::{Cache, EffectiveGroups, InMemoryCache, MembershipCache};
use crate::config::EngineConfig;
use crate::errors::{GraphError, GraphResult};
use crate::models::{ChildrenReference, EntityNode, ParentReference, Role};
use crate::mutation::{AffectedUsers, GroupMutationService};
use crate::store::{GraphStore, InMemoryGraphStore};
use crate::traversal::TraversalService;
use crate::utils::{data_root_group_id, users_group_id, DATA_ROOT_GROUP_NAME, USERS_GROUP_NAME};

/// Entry point wiring store, cache, audit sink and configuration together.
pub struct MembershipEngine {
    store: Arc<dyn GraphStore>,
    traversal: TraversalService,
    cache: Arc<MembershipCache>,
    mutations: GroupMutationService,
    config: EngineConfig,
}

impl MembershipEngine {
    pub fn new(
        store: Arc<dyn GraphStore>,
        cache_backend: Arc<dyn Cache<EffectiveGroups>>,
        audit: Arc<dyn AuditLogger>,
        config: EngineConfig,
    ) -> Self {
        let traversal = TraversalService::new(Arc::clone(&store), config.retry.clone());
        let cache = Arc::new(MembershipCache::new(cache_backend, traversal.clone(), config.cache_ttl));
        let mutations = GroupMutationService::new(Arc::clone(&store), Arc::clone(&cache), audit, config.clone());

        Self {
            store,
            traversal,
            cache,
            mutations,
            config,
        }
    }

    /// Fully in-process engine: in-memory graph, in-memory cache, tracing audit.
    pub fn in_memory(config: EngineConfig) -> Self {
        Self::new(
            Arc::new(InMemoryGraphStore::new()),
            Arc::new(InMemoryCache::<EffectiveGroups>::new()),
            Arc::new(TracingAuditLogger),
            config,
        )
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn GraphStore> {
        &self.store
    }

    pub fn traversal(&self) -> &TraversalService {
        &self.traversal
    }

    pub fn cache(&self) -> &MembershipCache {
        &self.cache
    }

    pub fn group_id(&self, name: &str, partition_id: &str) -> String {
        EntityNode::group(name, "", partition_id, &self.config.domain).node_id
    }

    pub async fn resolve_group(&self, name_or_id: &str, partition_id: &str) -> GraphResult<EntityNode> {
        let node_id = if name_or_id.contains('@') {
            name_or_id.trim().to_lowercase()
        } else {
            self.group_id(name_or_id, partition_id)
        };
        let node = self.traversal.require_node(&node_id, partition_id).await?;
        if !node.is_group() {
            return Err(GraphError::precondition(format!("{node_id} is not a group")));
        }
        Ok(node)
    }

    /// Existing node for `email`, or a fresh (unsaved) user node.
    pub async fn resolve_user(&self, email: &str, partition_id: &str) -> GraphResult<EntityNode> {
        let candidate = EntityNode::user(email, partition_id);
        Ok(self
            .traversal
            .get_node(&candidate.node_id, partition_id)
            .await?
            .unwrap_or(candidate))
    }

    /// A group id when one exists under that id, a user otherwise.
    pub async fn resolve_member(&self, id: &str, partition_id: &str) -> GraphResult<EntityNode> {
        match self.traversal.get_node(&id.trim().to_lowercase(), partition_id).await? {
            Some(node) => Ok(node),
            None => self.resolve_user(id, partition_id).await,
        }
    }

    pub async fn create_group(
        &self,
        group: &EntityNode,
        requester: &EntityNode,
        partition_id: &str,
        add_data_root_group: bool,
    ) -> GraphResult<AffectedUsers> {
        self.mutations
            .create_group(group, requester, partition_id, add_data_root_group)
            .await
    }

    pub async fn add_member(
        &self,
        group: &EntityNode,
        member: &EntityNode,
        role: Role,
        partition_id: &str,
    ) -> GraphResult<AffectedUsers> {
        self.mutations.add_member(group, member, role, partition_id).await
    }

    pub async fn remove_member(
        &self,
        group: &EntityNode,
        member: &EntityNode,
        partition_id: &str,
    ) -> GraphResult<AffectedUsers> {
        self.mutations.remove_member(group, member, partition_id).await
    }

    pub async fn delete_group(&self, group: &EntityNode, partition_id: &str) -> GraphResult<AffectedUsers> {
        self.mutations.delete_group(group, partition_id).await
    }

    pub async fn rename_group(
        &self,
        group: &EntityNode,
        new_name: &str,
        partition_id: &str,
    ) -> GraphResult<AffectedUsers> {
        self.mutations.rename_group(group, new_name, partition_id).await
    }

    pub async fn update_group_app_ids(
        &self,
        group: &EntityNode,
        app_ids: BTreeSet<String>,
        partition_id: &str,
    ) -> GraphResult<AffectedUsers> {
        self.mutations.update_group_app_ids(group, app_ids, partition_id).await
    }

    /// Groups `user_id` belongs to, served from the membership cache and
    /// filtered to what `app_id` may see.
    pub async fn effective_groups(
        &self,
        user_id: &str,
        partition_id: &str,
        app_id: Option<&str>,
    ) -> GraphResult<Vec<ParentReference>> {
        let groups = self.cache.effective_groups(user_id, partition_id).await?;
        Ok(match app_id {
            Some(app_id) => TraversalService::filter_by_app_id(groups.iter().cloned(), app_id),
            None => groups.as_ref().clone(),
        })
    }

    pub async fn is_authorized(
        &self,
        user_id: &str,
        group_id: &str,
        partition_id: &str,
        app_id: Option<&str>,
    ) -> GraphResult<bool> {
        let groups = self.cache.effective_groups(user_id, partition_id).await?;
        let authorized = groups
            .iter()
            .any(|group| group.id == group_id && app_id.map_or(true, |app_id| group.visible_to(app_id)));

        tracing::debug!(
            user_id = %user_id,
            group_id = %group_id,
            partition_id = %partition_id,
            authorized,
            "authorization evaluated"
        );
        Ok(authorized)
    }

    pub async fn members(&self, group: &EntityNode, partition_id: &str) -> GraphResult<Vec<ChildrenReference>> {
        self.traversal.direct_children(&group.node_id, partition_id).await
    }

    /// Create the `users` and `users.data.root` groups of a partition, owned by
    /// `service_principal`. Groups that already exist are left alone.
    pub async fn bootstrap_partition(&self, partition_id: &str, service_principal: &str) -> GraphResult<AffectedUsers> {
        let principal = self.resolve_user(service_principal, partition_id).await?;
        let domain = self.config.domain.as_str();
        let mut affected = AffectedUsers::new();

        for (name, node_id) in [
            (USERS_GROUP_NAME, users_group_id(partition_id, domain)),
            (DATA_ROOT_GROUP_NAME, data_root_group_id(partition_id, domain)),
        ] {
            if self.traversal.get_node(&node_id, partition_id).await?.is_some() {
                tracing::debug!(group_id = %node_id, partition_id = %partition_id, "bootstrap group already present");
                continue;
            }
            let group = EntityNode::group(name, "", partition_id, domain);
            affected.extend(self.create_group(&group, &principal, partition_id, false).await?);
        }

        tracing::info!(partition_id = %partition_id, principal = %principal.node_id, "partition bootstrapped");
        Ok(affected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const P: &str = "opendes";

    #[tokio::test]
    async fn bootstrap_is_idempotent() {
        let engine = MembershipEngine::in_memory(EngineConfig::default());

        let first = engine.bootstrap_partition(P, "svc@example.com").await.unwrap();
        assert!(first.contains("svc@example.com"));
        engine.bootstrap_partition(P, "svc@example.com").await.unwrap();

        let users = engine.resolve_group(USERS_GROUP_NAME, P).await.unwrap();
        assert_eq!(engine.members(&users, P).await.unwrap().len(), 1);
        assert!(engine
            .store()
            .has_partition_association("svc@example.com", P)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn authorization_follows_nested_groups_and_app_ids() {
        let engine = MembershipEngine::in_memory(EngineConfig::default());
        engine.bootstrap_partition(P, "svc@example.com").await.unwrap();
        let owner = engine.resolve_user("owner@example.com", P).await.unwrap();

        let outer = EntityNode::group("data.outer", "", P, "example.com").with_app_ids(["app1".to_string()]);
        let inner = EntityNode::group("data.inner", "", P, "example.com");
        engine.create_group(&outer, &owner, P, false).await.unwrap();
        engine.create_group(&inner, &owner, P, false).await.unwrap();
        engine.add_member(&outer, &inner, Role::Member, P).await.unwrap();

        let alice = engine.resolve_user("alice@example.com", P).await.unwrap();
        engine.add_member(&inner, &alice, Role::Member, P).await.unwrap();

        assert!(engine.is_authorized(&alice.node_id, &outer.node_id, P, None).await.unwrap());
        assert!(engine.is_authorized(&alice.node_id, &outer.node_id, P, Some("app1")).await.unwrap());
        assert!(!engine.is_authorized(&alice.node_id, &outer.node_id, P, Some("app2")).await.unwrap());
        assert!(engine.is_authorized(&alice.node_id, &inner.node_id, P, Some("app2")).await.unwrap());
    }
}

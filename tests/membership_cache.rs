mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{group, test_config, user, RecordingAuditLogger, P};
use membership_engine::cache::{Cache, EffectiveGroups, InMemoryCache, MembershipCache};
use membership_engine::{AffectedUsers, EngineConfig, GraphError, GraphStore, InMemoryGraphStore, MembershipEngine, Role};

fn engine_with_cache(
    config: EngineConfig,
) -> (Arc<InMemoryGraphStore>, Arc<InMemoryCache<EffectiveGroups>>, MembershipEngine) {
    let store = Arc::new(InMemoryGraphStore::new());
    let cache = Arc::new(InMemoryCache::<EffectiveGroups>::new());
    let engine = MembershipEngine::new(
        store.clone(),
        cache.clone(),
        Arc::new(RecordingAuditLogger::default()),
        config,
    );
    (store, cache, engine)
}

#[tokio::test]
async fn add_member_is_visible_through_a_warm_cache() {
    let (_, cache, engine) = engine_with_cache(test_config());
    let owner = user("o@example.com");
    let (outer, inner) = (group("outer"), group("inner"));
    engine.create_group(&outer, &owner, P, false).await.unwrap();
    engine.create_group(&inner, &owner, P, false).await.unwrap();
    engine.add_member(&inner, &user("w@example.com"), Role::Member, P).await.unwrap();

    // Warm the entry.
    let groups = engine.effective_groups("w@example.com", P, None).await.unwrap();
    assert_eq!(groups.len(), 1);
    assert!(cache.get(&MembershipCache::key("w@example.com", P)).await.is_some());

    engine.add_member(&outer, &inner, Role::Member, P).await.unwrap();

    // The nested add invalidated the inherited user.
    assert!(cache.get(&MembershipCache::key("w@example.com", P)).await.is_none());
    let ids: Vec<String> = engine
        .effective_groups("w@example.com", P, None)
        .await
        .unwrap()
        .into_iter()
        .map(|g| g.id)
        .collect();
    assert_eq!(ids, vec![inner.node_id.clone(), outer.node_id.clone()]);
}

#[tokio::test]
async fn unaffected_users_keep_their_entries() {
    let (_, cache, engine) = engine_with_cache(test_config());
    let owner = user("o@example.com");
    let (a, b) = (group("a"), group("b"));
    engine.create_group(&a, &owner, P, false).await.unwrap();
    engine.create_group(&b, &owner, P, false).await.unwrap();
    engine.add_member(&a, &user("x@example.com"), Role::Member, P).await.unwrap();
    engine.effective_groups("x@example.com", P, None).await.unwrap();

    engine.add_member(&b, &user("y@example.com"), Role::Member, P).await.unwrap();

    assert!(cache.get(&MembershipCache::key("x@example.com", P)).await.is_some());
}

#[tokio::test]
async fn entries_expire_after_ttl() {
    let config = EngineConfig {
        cache_ttl: Duration::from_millis(50),
        ..test_config()
    };
    let (store, _, engine) = engine_with_cache(config);
    let g = group("ttl");
    engine.create_group(&g, &user("o@example.com"), P, false).await.unwrap();
    assert!(engine.effective_groups("t@example.com", P, None).await.unwrap().is_empty());

    // Written directly to the store, so no invalidation happens.
    store.create_node(&user("t@example.com")).await.unwrap();
    store.add_edge(&g.node_id, "t@example.com", Role::Member, P).await.unwrap();
    assert!(engine.effective_groups("t@example.com", P, None).await.unwrap().is_empty());

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(engine.effective_groups("t@example.com", P, None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn concurrent_reads_and_writes_settle_on_the_store() {
    let (_, _, engine) = engine_with_cache(test_config());
    let engine = Arc::new(engine);
    let owner = user("o@example.com");
    let groups: Vec<_> = (0..8).map(|i| group(&format!("g{i}"))).collect();
    for g in &groups {
        engine.create_group(g, &owner, P, false).await.unwrap();
    }

    let mut tasks = tokio::task::JoinSet::new();
    for g in groups.clone() {
        let writer = Arc::clone(&engine);
        tasks.spawn(async move {
            writer
                .add_member(&g, &user("r@example.com"), Role::Member, P)
                .await
        });
        let reader = Arc::clone(&engine);
        tasks.spawn(async move {
            reader
                .effective_groups("r@example.com", P, None)
                .await
                .map(|_| AffectedUsers::new())
        });
    }
    while let Some(joined) = tasks.join_next().await {
        match joined.unwrap() {
            Ok(_) => {}
            // Racing first-time creation of the user node can lose.
            Err(GraphError::Conflict(_)) => {}
            Err(other) => panic!("unexpected failure: {other:?}"),
        }
    }

    let cached = engine.effective_groups("r@example.com", P, None).await.unwrap();
    let direct = engine.traversal().all_ancestors("r@example.com", P).await.unwrap();
    assert_eq!(cached, direct);
}

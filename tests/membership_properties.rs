mod common;

use std::sync::Arc;

use proptest::prelude::*;
use proptest::test_runner::TestCaseError;

use common::{engine_over, group, user, RecordingAuditLogger, P};
use membership_engine::db::{self, SqliteGraphStore};
use membership_engine::{EntityNode, InMemoryGraphStore, MembershipEngine, Role};

const GROUPS: usize = 5;
const USERS: usize = 3;

#[derive(Debug, Clone)]
enum Step {
    Add { parent: usize, child: usize, owner: bool },
    Remove { parent: usize, child: usize },
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        3 => (0..GROUPS, 0..GROUPS + USERS, any::<bool>())
            .prop_map(|(parent, child, owner)| Step::Add { parent, child, owner }),
        1 => (0..GROUPS, 0..GROUPS + USERS).prop_map(|(parent, child)| Step::Remove { parent, child }),
    ]
}

fn group_at(index: usize) -> EntityNode {
    group(&format!("g{index}"))
}

// Indexes past the groups name users.
fn node_at(index: usize) -> EntityNode {
    if index < GROUPS {
        group_at(index)
    } else {
        user(&format!("u{}@example.com", index - GROUPS))
    }
}

fn every_node() -> Vec<EntityNode> {
    let mut nodes: Vec<EntityNode> = (0..GROUPS + USERS).map(node_at).collect();
    nodes.push(user("o@example.com"));
    nodes
}

async fn apply(engine: &MembershipEngine, step: &Step) -> Result<(), &'static str> {
    let result = match step {
        Step::Add { parent, child, owner } => {
            let role = if *owner { Role::Owner } else { Role::Member };
            engine.add_member(&group_at(*parent), &node_at(*child), role, P).await
        }
        Step::Remove { parent, child } => engine.remove_member(&group_at(*parent), &node_at(*child), P).await,
    };
    result.map(|_| ()).map_err(|err| err.code())
}

async fn ancestors(engine: &MembershipEngine, node_id: &str) -> Vec<(String, Role)> {
    engine
        .traversal()
        .all_ancestors(node_id, P)
        .await
        .unwrap()
        .into_iter()
        .map(|parent| (parent.id, parent.role))
        .collect()
}

async fn run_steps(steps: Vec<Step>) -> Result<(), TestCaseError> {
    let memory = engine_over(
        Arc::new(InMemoryGraphStore::new()),
        Arc::new(RecordingAuditLogger::default()),
    );
    let pool = db::in_memory().await.unwrap();
    let sqlite = engine_over(
        Arc::new(SqliteGraphStore::new(pool)),
        Arc::new(RecordingAuditLogger::default()),
    );

    let owner = user("o@example.com");
    for engine in [&memory, &sqlite] {
        for index in 0..GROUPS {
            engine.create_group(&group_at(index), &owner, P, false).await.unwrap();
        }
    }

    for step in &steps {
        let on_memory = apply(&memory, step).await;
        let on_sqlite = apply(&sqlite, step).await;
        prop_assert_eq!(on_memory, on_sqlite, "outcome of {:?}", step);

        for node in every_node() {
            let above = ancestors(&memory, &node.node_id).await;
            prop_assert!(
                above.iter().all(|(id, _)| *id != node.node_id),
                "{} is its own ancestor after {:?}",
                node.node_id,
                step
            );
            prop_assert_eq!(&above, &ancestors(&sqlite, &node.node_id).await);

            let below_memory = memory.traversal().descendant_user_ids(&node.node_id, P).await.unwrap();
            let below_sqlite = sqlite.traversal().descendant_user_ids(&node.node_id, P).await.unwrap();
            prop_assert_eq!(below_memory, below_sqlite);
        }
    }

    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn membership_sequences_stay_acyclic_on_both_backends(steps in prop::collection::vec(step(), 1..24)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(run_steps(steps))?;
    }
}

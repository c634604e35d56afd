use flowsync_crdt::{Change, MergeCore, Replica};
use flowsync_model::{EntityId, Node, PositionUpdate, ReplicaId, Workspace};
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde_json::json;

const REPLICAS: usize = 3;

#[derive(Debug, Clone)]
enum Step {
    AddWorkspace(u8),
    AddNode(u8),
    Rename(u8, u8),
    Remove(u8),
    RemoveWorkspace(u8),
    Move(u8, i16),
    ReverseOrder,
    Pull(usize),
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        (0..4u8).prop_map(Step::AddWorkspace),
        (0..8u8).prop_map(Step::AddNode),
        (0..8u8, 0..4u8).prop_map(|(n, v)| Step::Rename(n, v)),
        (0..8u8).prop_map(Step::Remove),
        (0..4u8).prop_map(Step::RemoveWorkspace),
        (0..8u8, -500..500i16).prop_map(|(n, x)| Step::Move(n, x)),
        Just(Step::ReverseOrder),
        (0..REPLICAS).prop_map(Step::Pull),
    ]
}

fn pull(replicas: &mut [Replica], to: usize, from: usize) {
    let missing = replicas[from].changes_since(&replicas[to].state_vector());
    for change in missing {
        replicas[to].apply_remote(change).unwrap();
    }
}

/// Run a script; local mutations that fail validation are simply skipped
fn run(script: &[(usize, Step)]) -> (Vec<Replica>, Vec<Change>) {
    let mut replicas: Vec<Replica> = (0..REPLICAS)
        .map(|i| Replica::new(ReplicaId::from_u128(i as u128 + 1)))
        .collect();
    let mut changes = Vec::new();

    for (who, step) in script {
        if let Step::Pull(from) = step {
            if from != who {
                pull(&mut replicas, *who, *from);
            }
            continue;
        }

        let r = &mut replicas[*who];
        let made = match step {
            Step::AddWorkspace(w) => r
                .add_node(Workspace::new(format!("ws{w}"), format!("Flow {w}")).into())
                .ok(),
            Step::AddNode(n) => {
                let z = r.snapshot().workspace_order.first().cloned();
                let mut node = Node::new(format!("n{who}-{n}"), "inject");
                if let Some(z) = z {
                    node = node.on(z);
                }
                r.add_node(node.into()).ok()
            }
            Step::Rename(n, v) => {
                let id = format!("n{who}-{n}").into();
                let partial = match json!({ "name": format!("name-{v}") }) {
                    serde_json::Value::Object(m) => m,
                    _ => unreachable!(),
                };
                r.update_node(&id, partial).ok().flatten()
            }
            Step::Remove(n) => r.remove_node(&format!("n{who}-{n}").into(), None).ok(),
            Step::RemoveWorkspace(w) => r.remove_node(&format!("ws{w}").into(), None).ok(),
            Step::Move(n, x) => r
                .batch_position_update(&[PositionUpdate::new(
                    format!("n{who}-{n}"),
                    f64::from(*x),
                    f64::from(*x) / 2.0,
                )])
                .ok()
                .flatten(),
            Step::ReverseOrder => {
                let mut order: Vec<EntityId> = r.snapshot().workspace_order;
                order.reverse();
                r.set_workspace_order(order).ok()
            }
            Step::Pull(_) => None,
        };
        changes.extend(made);
    }
    (replicas, changes)
}

fn deliver(changes: &[Change], seed: u64, duplicate_every: usize) -> Replica {
    let mut delivery: Vec<Change> = changes.to_vec();
    let copies: Vec<Change> = changes.iter().step_by(duplicate_every).cloned().collect();
    delivery.extend(copies);
    delivery.shuffle(&mut StdRng::seed_from_u64(seed));

    let mut observer = Replica::new(ReplicaId::from_u128(99));
    for change in delivery {
        observer.apply_remote(change).unwrap();
    }
    observer
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_any_delivery_order_converges(
        script in proptest::collection::vec((0..REPLICAS, step()), 1..60),
        seed_a in any::<u64>(),
        seed_b in any::<u64>(),
        dup in 1..5usize,
    ) {
        let (mut replicas, changes) = run(&script);

        let a = deliver(&changes, seed_a, dup);
        let b = deliver(&changes, seed_b, dup + 1);
        prop_assert_eq!(a.core().pending(), 0);
        prop_assert_eq!(a.snapshot(), b.snapshot());

        // Full mesh sync brings every author to the same state
        for to in 0..REPLICAS {
            for from in 0..REPLICAS {
                if to != from {
                    pull(&mut replicas, to, from);
                }
            }
        }
        for to in 0..REPLICAS {
            pull(&mut replicas, to, (to + 1) % REPLICAS);
        }
        let expected = a.snapshot().digest().unwrap();
        for r in &replicas {
            prop_assert_eq!(r.snapshot().digest().unwrap(), expected);
        }
    }

    #[test]
    fn prop_workspace_order_holds_exactly_live_workspaces(
        script in proptest::collection::vec((0..REPLICAS, step()), 1..40),
        seed in any::<u64>(),
    ) {
        let (_, changes) = run(&script);
        let doc = deliver(&changes, seed, 3).snapshot();

        let mut ordered = doc.workspace_order.clone();
        ordered.sort();
        let live: Vec<EntityId> = doc.workspaces.keys().cloned().collect();
        prop_assert_eq!(ordered, live);
    }
}

#[test]
fn same_seed_gives_same_delivery() {
    let (_, changes) = run(&[
        (0, Step::AddWorkspace(1)),
        (0, Step::AddNode(1)),
        (0, Step::AddNode(2)),
        (0, Step::Rename(1, 3)),
        (0, Step::Move(2, 40)),
    ]);
    let a = deliver(&changes, 7, 2);
    let b = deliver(&changes, 7, 2);
    assert_eq!(a.snapshot(), b.snapshot());
    assert_eq!(a.core().pending(), 0);
    assert!(a.get(&"n0-2".into()).is_some());
}

#[test]
fn concurrent_adds_both_survive() {
    let (mut replicas, _) = run(&[
        (0, Step::AddWorkspace(1)),
        (1, Step::Pull(0)),
        (0, Step::AddNode(1)),
        (1, Step::AddNode(1)),
    ]);
    pull(&mut replicas, 0, 1);
    pull(&mut replicas, 1, 0);

    for r in &replicas[..2] {
        let doc = r.snapshot();
        assert!(doc.nodes.contains_key("n0-1"));
        assert!(doc.nodes.contains_key("n1-1"));
    }
}

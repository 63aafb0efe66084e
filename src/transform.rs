//! Transform Engine: reconciling concurrent operations
//!
//! [`transform`] takes two concurrent operations and returns adjusted
//! versions such that applying `a` then `b'` produces the same document
//! as applying `b` then `a'`. `None` means that side became a no-op.
//!
//! The function is total over every kind pair. Policy:
//! - delete/delete of the same target: both no-ops
//! - update or move concurrent with a delete of its target: delete wins
//! - update/update on the same target: the loser of the total order keeps
//!   only the fields the winner did not touch (field-level merge); an
//!   empty remainder becomes a no-op
//! - insert/insert of the same node id: total-order winner keeps the node
//! - move/update on the same node commute untouched (parent vs attrs)
//! - non-overlapping targets pass through unchanged
//!
//! The same engine drives live sync and history merge.

use crate::operation::{Operation, OperationKind};
use std::collections::BTreeSet;

/// Result of transforming one concurrent pair.
/// `left`/`right` correspond to the inputs; `None` is a no-op.
pub type TransformPair = (Option<Operation>, Option<Operation>);

/// Transform two concurrent operations into a convergent pair
pub fn transform(a: &Operation, b: &Operation) -> TransformPair {
    if !a.target.overlaps(&b.target) {
        return (Some(a.clone()), Some(b.clone()));
    }

    use OperationKind::*;
    match (a.kind, b.kind) {
        // Concurrent deletes of one target are idempotent
        (Delete, Delete) => (None, None),

        // Delete wins over anything still editing the target
        (Delete, Update) | (Delete, Move) => (Some(a.clone()), None),
        (Update, Delete) | (Move, Delete) => (None, Some(b.clone())),

        // Field-level merge; total order settles contested fields
        (Update, Update) => transform_updates(a, b),

        // Reparenting and attribute edits commute
        (Update, Move) | (Move, Update) => (Some(a.clone()), Some(b.clone())),

        // Same node id from two sites: one insert survives
        (Insert, Insert) => keep_winner(a, b),

        // Same target, same total-order rule for the leftover pairs
        // (insert racing a delete/update/move of the same id, move/move)
        (Move, Move)
        | (Insert, Delete)
        | (Delete, Insert)
        | (Insert, Update)
        | (Update, Insert)
        | (Insert, Move)
        | (Move, Insert) => keep_winner(a, b),
    }
}

/// Transform a sequence of local pending operations against one remote
/// operation. Returns the surviving locals and the remote as it stands
/// after passing over all of them.
pub fn transform_batch(
    locals: &[Operation],
    remote: &Operation,
) -> (Vec<Operation>, Option<Operation>) {
    let mut surviving = Vec::with_capacity(locals.len());
    let mut remote_now = Some(remote.clone());

    for local in locals {
        let Some(ref r) = remote_now else {
            surviving.push(local.clone());
            continue;
        };
        let (local_after, remote_after) = transform(local, r);
        if let Some(l) = local_after {
            surviving.push(l);
        }
        remote_now = remote_after;
    }

    (surviving, remote_now)
}

fn keep_winner(a: &Operation, b: &Operation) -> TransformPair {
    if a.wins_over(b) {
        (Some(a.clone()), None)
    } else {
        (None, Some(b.clone()))
    }
}

/// Fields an update touches; `None` means the whole node
fn touched_fields(op: &Operation) -> Option<BTreeSet<String>> {
    if let Some(field) = &op.target.field {
        return Some(std::iter::once(field.clone()).collect());
    }
    match &op.payload {
        serde_json::Value::Object(map) => Some(map.keys().cloned().collect()),
        _ => None,
    }
}

/// Strip the winner's fields out of the loser. Returns `None` when
/// nothing of the loser remains.
fn shrink_loser(loser: &Operation, winner_fields: &BTreeSet<String>) -> Option<Operation> {
    if let Some(field) = &loser.target.field {
        if winner_fields.contains(field) {
            return None;
        }
        return Some(loser.clone());
    }

    let serde_json::Value::Object(map) = &loser.payload else {
        // Opaque payload on a contested node: the winner takes it all
        return None;
    };

    let remaining: serde_json::Map<String, serde_json::Value> = map
        .iter()
        .filter(|(k, _)| !winner_fields.contains(*k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    if remaining.is_empty() {
        return None;
    }

    let mut shrunk = loser.clone();
    shrunk.payload = serde_json::Value::Object(remaining);
    Some(shrunk)
}

fn transform_updates(a: &Operation, b: &Operation) -> TransformPair {
    let (winner, loser, a_won) = if a.wins_over(b) {
        (a, b, true)
    } else {
        (b, a, false)
    };

    let loser_after = match touched_fields(winner) {
        Some(fields) => shrink_loser(loser, &fields),
        // Winner rewrites the whole node
        None => None,
    };

    if a_won {
        (Some(a.clone()), loser_after)
    } else {
        (loser_after, Some(b.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::DocumentState;
    use crate::operation::test_support::op_at;
    use crate::operation::TargetRef;
    use serde_json::json;

    fn seeded_state() -> DocumentState {
        let mut state = DocumentState::new("doc-1");
        let root = op_at(
            -10,
            "seed",
            OperationKind::Insert,
            TargetRef::node("n1"),
            json!({ "attrs": { "label": "old", "color": "blue" } }),
        );
        state.apply(&root).unwrap();
        state
    }

    /// Apply a then b', and b then a', and check both sites converge
    fn assert_converges(a: &Operation, b: &Operation) {
        let (a_prime, b_prime) = transform(a, b);

        let mut site1 = seeded_state();
        site1.apply(a).unwrap();
        if let Some(ref bp) = b_prime {
            site1.apply(bp).unwrap();
        }

        let mut site2 = seeded_state();
        site2.apply(b).unwrap();
        if let Some(ref ap) = a_prime {
            site2.apply(ap).unwrap();
        }

        assert_eq!(site1.content, site2.content);
    }

    #[test]
    fn test_concurrent_deletes_are_noops() {
        let a = op_at(1, "amy", OperationKind::Delete, TargetRef::node("n1"), json!({}));
        let b = op_at(2, "bob", OperationKind::Delete, TargetRef::node("n1"), json!({}));

        assert_eq!(transform(&a, &b), (None, None));
    }

    #[test]
    fn test_delete_wins_over_update() {
        let update = op_at(
            1,
            "amy",
            OperationKind::Update,
            TargetRef::field("n1", "label"),
            json!("new"),
        );
        let delete = op_at(2, "bob", OperationKind::Delete, TargetRef::node("n1"), json!({}));

        let (u, d) = transform(&update, &delete);
        assert!(u.is_none());
        assert_eq!(d.unwrap().kind, OperationKind::Delete);

        assert_converges(&update, &delete);
    }

    #[test]
    fn test_later_update_wins_same_field() {
        let a = op_at(
            1,
            "amy",
            OperationKind::Update,
            TargetRef::node("n1"),
            json!({ "label": "amy's name" }),
        );
        let b = op_at(
            2,
            "bob",
            OperationKind::Update,
            TargetRef::node("n1"),
            json!({ "label": "bob's name" }),
        );

        let (a_prime, b_prime) = transform(&a, &b);
        assert!(a_prime.is_none(), "earlier update on the same field loses");
        assert!(b_prime.is_some());

        assert_converges(&a, &b);
    }

    #[test]
    fn test_update_merge_keeps_disjoint_fields() {
        let a = op_at(
            1,
            "amy",
            OperationKind::Update,
            TargetRef::node("n1"),
            json!({ "label": "renamed", "color": "red" }),
        );
        let b = op_at(
            2,
            "bob",
            OperationKind::Update,
            TargetRef::node("n1"),
            json!({ "color": "green" }),
        );

        // Bob wins; amy keeps only her label edit
        let (a_prime, b_prime) = transform(&a, &b);
        let a_prime = a_prime.unwrap();
        assert_eq!(a_prime.payload, json!({ "label": "renamed" }));
        assert_eq!(b_prime.unwrap().payload, json!({ "color": "green" }));

        assert_converges(&a, &b);
    }

    #[test]
    fn test_move_and_update_commute() {
        let mut state = seeded_state();
        let other = op_at(
            -9,
            "seed",
            OperationKind::Insert,
            TargetRef::node("n2"),
            json!({ "attrs": {} }),
        );
        state.apply(&other).unwrap();

        let mv = op_at(
            1,
            "amy",
            OperationKind::Move,
            TargetRef::node("n1"),
            json!({ "parent": "n2" }),
        );
        let update = op_at(
            2,
            "bob",
            OperationKind::Update,
            TargetRef::field("n1", "label"),
            json!("kept"),
        );

        let (m, u) = transform(&mv, &update);
        assert!(m.is_some());
        assert!(u.is_some());

        let mut site1 = state.clone();
        site1.apply(&mv).unwrap();
        site1.apply(&u.unwrap()).unwrap();

        let mut site2 = state;
        site2.apply(&update).unwrap();
        site2.apply(&m.unwrap()).unwrap();

        assert_eq!(site1.content, site2.content);
    }

    #[test]
    fn test_concurrent_moves_pick_one_parent() {
        let a = op_at(
            1,
            "amy",
            OperationKind::Move,
            TargetRef::node("n1"),
            json!({ "parent": "x" }),
        );
        let b = op_at(
            2,
            "bob",
            OperationKind::Move,
            TargetRef::node("n1"),
            json!({ "parent": "y" }),
        );

        let (a_prime, b_prime) = transform(&a, &b);
        assert!(a_prime.is_none());
        assert_eq!(b_prime.unwrap().payload["parent"], json!("y"));
    }

    #[test]
    fn test_duplicate_insert_keeps_one() {
        let a = op_at(
            1,
            "amy",
            OperationKind::Insert,
            TargetRef::node("new"),
            json!({ "attrs": { "x": 1 } }),
        );
        let b = op_at(
            2,
            "bob",
            OperationKind::Insert,
            TargetRef::node("new"),
            json!({ "attrs": { "x": 2 } }),
        );

        let (a_prime, b_prime) = transform(&a, &b);
        assert!(a_prime.is_none());
        assert!(b_prime.is_some());
    }

    #[test]
    fn test_disjoint_targets_pass_through() {
        let a = op_at(
            1,
            "amy",
            OperationKind::Update,
            TargetRef::field("n1", "label"),
            json!("a"),
        );
        let b = op_at(
            2,
            "bob",
            OperationKind::Update,
            TargetRef::field("n1", "color"),
            json!("b"),
        );

        let (a_prime, b_prime) = transform(&a, &b);
        assert_eq!(a_prime.unwrap(), a);
        assert_eq!(b_prime.unwrap(), b);

        assert_converges(&a, &b);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum EditSpec {
            UpdateField { node: usize, field: usize, value: u8 },
            UpdateNode { node: usize, value: u8 },
            Delete { node: usize },
            Insert { tag: u8 },
        }

        fn edit_spec() -> impl Strategy<Value = EditSpec> {
            prop_oneof![
                (0usize..2, 0usize..2, any::<u8>())
                    .prop_map(|(node, field, value)| EditSpec::UpdateField { node, field, value }),
                (0usize..2, any::<u8>())
                    .prop_map(|(node, value)| EditSpec::UpdateNode { node, value }),
                (0usize..2).prop_map(|node| EditSpec::Delete { node }),
                any::<u8>().prop_map(|tag| EditSpec::Insert { tag }),
            ]
        }

        fn realize(spec: &EditSpec, seconds: i64, user: &str) -> Operation {
            const NODES: [&str; 2] = ["n1", "n2"];
            const FIELDS: [&str; 2] = ["label", "color"];
            match spec {
                EditSpec::UpdateField { node, field, value } => op_at(
                    seconds,
                    user,
                    OperationKind::Update,
                    TargetRef::field(NODES[*node], FIELDS[*field]),
                    json!(format!("v{value}")),
                ),
                EditSpec::UpdateNode { node, value } => op_at(
                    seconds,
                    user,
                    OperationKind::Update,
                    TargetRef::node(NODES[*node]),
                    json!({ "label": format!("v{value}") }),
                ),
                EditSpec::Delete { node } => op_at(
                    seconds,
                    user,
                    OperationKind::Delete,
                    TargetRef::node(NODES[*node]),
                    json!({}),
                ),
                // Fresh ids are namespaced per user, as real sites do
                EditSpec::Insert { tag } => op_at(
                    seconds,
                    user,
                    OperationKind::Insert,
                    TargetRef::node(format!("{user}-{tag}")),
                    json!({ "attrs": { "tag": tag } }),
                ),
            }
        }

        fn two_node_state() -> DocumentState {
            let mut state = seeded_state();
            let other = op_at(
                -9,
                "seed",
                OperationKind::Insert,
                TargetRef::node("n2"),
                json!({ "attrs": { "label": "two", "color": "red" } }),
            );
            state.apply(&other).unwrap();
            state
        }

        proptest! {
            /// apply(a) then b' equals apply(b) then a' for every
            /// generated concurrent pair, in both tie-break directions
            #[test]
            fn transform_pairs_converge(
                a_spec in edit_spec(),
                b_spec in edit_spec(),
                a_is_later in any::<bool>(),
            ) {
                let (a_sec, b_sec) = if a_is_later { (2, 1) } else { (1, 2) };
                let a = realize(&a_spec, a_sec, "amy");
                let b = realize(&b_spec, b_sec, "bob");
                let (a_prime, b_prime) = transform(&a, &b);

                let mut site1 = two_node_state();
                site1.apply(&a).unwrap();
                if let Some(ref bp) = b_prime {
                    site1.apply(bp).unwrap();
                }

                let mut site2 = two_node_state();
                site2.apply(&b).unwrap();
                if let Some(ref ap) = a_prime {
                    site2.apply(ap).unwrap();
                }

                prop_assert_eq!(site1.content, site2.content);
            }
        }
    }

    #[test]
    fn test_transform_batch_against_delete() {
        let locals = vec![
            op_at(1, "amy", OperationKind::Update, TargetRef::field("n1", "label"), json!("x")),
            op_at(2, "amy", OperationKind::Update, TargetRef::field("n2", "label"), json!("y")),
        ];
        let remote = op_at(3, "bob", OperationKind::Delete, TargetRef::node("n1"), json!({}));

        let (surviving, remote_after) = transform_batch(&locals, &remote);
        assert_eq!(surviving.len(), 1);
        assert_eq!(surviving[0].target.node_id, "n2");
        assert!(remote_after.is_some());
    }
}

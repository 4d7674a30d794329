// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Algebraic laws: mutation round trips, failure atomicity, and
//! determinism of independent mutations.
#![allow(clippy::unwrap_used, clippy::expect_used)]

use trellis_core::{
    Database, EdgeSelInput, NodeId, NodeStoreError, QueryInput, Value, ViewOptions,
};
use trellis_testkit::{forum_schema, thread_schema, user_schema};

#[test]
fn link_then_unlink_restores_store_and_subscriptions() {
    let db = Database::new(thread_schema()).unwrap();
    let thread = db.insert("Thread").unwrap();
    db.update(thread, [("name", Value::from("t"))]).unwrap();
    let frame = db.insert("Frame").unwrap();
    db.update(frame, [("ts", Value::Int(1))]).unwrap();

    let view = db
        .view(
            &QueryInput {
                root: "Thread".into(),
                edges: vec![EdgeSelInput {
                    edge: "frames".into(),
                    ..Default::default()
                }],
                ..Default::default()
            },
            ViewOptions {
                immediate: true,
                ..Default::default()
            },
        )
        .unwrap();
    view.expand(thread, "frames").unwrap();
    let baseline_total = view.total();
    let baseline_items: Vec<NodeId> = view.items().iter().map(|i| i.id).collect();

    db.link(thread, "frames", frame).unwrap();
    assert_eq!(view.total(), baseline_total + 1);

    db.unlink(thread, "frames", frame).unwrap();
    assert_eq!(view.total(), baseline_total);
    assert_eq!(
        view.items().iter().map(|i| i.id).collect::<Vec<_>>(),
        baseline_items
    );
    assert_eq!(db.edge_targets(thread, "frames").unwrap(), Vec::new());
    assert_eq!(db.edge_targets(frame, "thread").unwrap(), Vec::new());
}

#[test]
fn failed_operations_leave_no_partial_state() {
    let db = Database::new(forum_schema()).unwrap();
    let user = db.insert("User").unwrap();
    let post = db.insert("Post").unwrap();

    // Unknown type.
    assert!(matches!(
        db.insert("Ghost"),
        Err(NodeStoreError::UnknownType(_))
    ));
    assert_eq!(db.count(), 2);

    // Unknown edge.
    assert!(matches!(
        db.link(user, "likes", post),
        Err(NodeStoreError::UnknownEdge { .. })
    ));

    // Wrong-type target.
    let other_user = db.insert("User").unwrap();
    assert!(matches!(
        db.link(user, "posts", other_user),
        Err(NodeStoreError::EdgeTargetNotFound { .. })
    ));
    assert_eq!(db.edge_targets(user, "posts").unwrap(), Vec::new());
    assert_eq!(db.get(user).unwrap().get("post_count"), Value::Int(0));

    // Unlink of a non-existent membership.
    assert!(matches!(
        db.unlink(user, "posts", post),
        Err(NodeStoreError::EdgeTargetNotFound { .. })
    ));

    // Missing node.
    let ghost = NodeId::from_raw(9999);
    assert!(matches!(
        db.update(ghost, [("views", Value::Int(1))]),
        Err(NodeStoreError::NodeNotFound(_))
    ));
    assert!(matches!(
        db.delete(ghost),
        Err(NodeStoreError::NodeNotFound(_))
    ));
}

#[test]
fn duplicate_links_are_idempotent() {
    let db = Database::new(forum_schema()).unwrap();
    let user = db.insert("User").unwrap();
    let post = db.insert("Post").unwrap();
    db.link(user, "posts", post).unwrap();
    db.link(user, "posts", post).unwrap();
    assert_eq!(db.edge_targets(user, "posts").unwrap(), vec![post]);
    assert_eq!(db.get(user).unwrap().get("post_count"), Value::Int(1));

    db.unlink(user, "posts", post).unwrap();
    assert_eq!(db.edge_targets(user, "posts").unwrap(), Vec::new());
    // The link is fully gone: a second unlink is an error.
    assert!(db.unlink(user, "posts", post).is_err());
}

#[test]
fn insert_order_across_disjoint_types_is_observable_only_via_ids() {
    // Two databases, interleaving inserts of two types differently; each
    // type's relative order (the id tiebreaker) is all that differs.
    let db1 = Database::new(forum_schema()).unwrap();
    let u1 = db1.insert("User").unwrap();
    let p1 = db1.insert("Post").unwrap();
    let u2 = db1.insert("User").unwrap();

    let db2 = Database::new(forum_schema()).unwrap();
    let v1 = db2.insert("User").unwrap();
    let v2 = db2.insert("User").unwrap();
    let q1 = db2.insert("Post").unwrap();

    let users = |db: &Database| -> usize {
        db.subscribe(&QueryInput {
            root: "User".into(),
            ..Default::default()
        })
        .unwrap()
        .total()
    };
    assert_eq!(users(&db1), 2);
    assert_eq!(users(&db2), 2);
    assert!(u1 < u2 && v1 < v2);
    // Ids of the interleaved type differ, nothing else does.
    assert_ne!(p1, q1);
}

#[test]
fn uncovered_sorts_fail_at_registration() {
    let db = Database::new(user_schema()).unwrap();
    // `name` is not indexed; sorted queries never fall back to in-memory
    // sorting, so the subscription is refused up front.
    let err = db
        .subscribe(&QueryInput {
            root: "User".into(),
            sort: vec![trellis_core::SortInput::from("name")],
            ..Default::default()
        })
        .unwrap_err();
    assert!(matches!(
        err,
        trellis_core::QueryError::NoIndexCovers { .. }
    ));
}

#[test]
fn direct_id_queries_bypass_scanning() {
    let db = Database::new(user_schema()).unwrap();
    let u1 = db.insert("User").unwrap();
    let u2 = db.insert("User").unwrap();
    db.update(u1, [("active", Value::Bool(true))]).unwrap();
    db.update(u2, [("active", Value::Bool(true))]).unwrap();

    let sub = db
        .subscribe(&QueryInput {
            root: "User".into(),
            id: Some(u2),
            ..Default::default()
        })
        .unwrap();
    let items = sub.items();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].id, u2);
}

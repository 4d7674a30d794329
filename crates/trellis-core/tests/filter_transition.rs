// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Filter transitions: updates that move a node across a subscription's
//! filter boundary emit exactly one enter or leave.
#![allow(clippy::unwrap_used, clippy::expect_used)]

use trellis_core::{Database, FilterInput, QueryInput, Value, ViewOptions};
use trellis_testkit::{user_schema, EventRecorder, RecordedEvent};

fn active_users_query() -> QueryInput {
    QueryInput {
        root: "User".into(),
        filter: vec![FilterInput {
            field: "active".into(),
            value: Some(Value::Bool(true)),
            ..Default::default()
        }],
        ..Default::default()
    }
}

#[test]
fn update_across_the_filter_boundary_emits_one_enter_then_one_leave() {
    let db = Database::new(user_schema()).unwrap();
    let u1 = db.insert("User").unwrap();
    db.update(u1, [("active", Value::Bool(false))]).unwrap();

    let view = db
        .view(
            &active_users_query(),
            ViewOptions {
                immediate: true,
                ..Default::default()
            },
        )
        .unwrap();
    let recorder = EventRecorder::new();
    view.on_event(recorder.callback());
    assert_eq!(view.total(), 0);

    db.update(u1, [("active", Value::Bool(true))]).unwrap();
    assert_eq!(recorder.take(), vec![RecordedEvent::Enter(u1, 0)]);
    assert_eq!(view.total(), 1);

    db.update(u1, [("active", Value::Bool(false))]).unwrap();
    assert_eq!(recorder.take(), vec![RecordedEvent::Leave(u1, 0)]);
    assert_eq!(view.total(), 0);
}

#[test]
fn redundant_updates_emit_nothing() {
    let db = Database::new(user_schema()).unwrap();
    let u1 = db.insert("User").unwrap();
    db.update(u1, [("active", Value::Bool(true))]).unwrap();

    let view = db
        .view(
            &active_users_query(),
            ViewOptions {
                immediate: true,
                ..Default::default()
            },
        )
        .unwrap();
    let recorder = EventRecorder::new();
    view.on_event(recorder.callback());

    // Same value again: no delta, no events.
    db.update(u1, [("active", Value::Bool(true))]).unwrap();
    assert!(recorder.is_empty());
    assert_eq!(view.total(), 1);
}

#[test]
fn uninitialized_subscriptions_get_hybrid_enters_at_index_zero() {
    let db = Database::new(user_schema()).unwrap();
    // No immediate flag and no read: the subscription never scans.
    let view = db.view(&active_users_query(), ViewOptions::default()).unwrap();
    let recorder = EventRecorder::new();
    view.on_event(recorder.callback());

    let u1 = db.insert("User").unwrap();
    db.update(u1, [("active", Value::Bool(true))]).unwrap();
    // Position unknown before the first scan, so the index is 0.
    assert_eq!(recorder.take(), vec![RecordedEvent::Enter(u1, 0)]);
}

#[test]
fn matching_insert_enters_initialized_subscriptions() {
    let db = Database::new(user_schema()).unwrap();
    let view = db
        .view(
            &active_users_query(),
            ViewOptions {
                immediate: true,
                ..Default::default()
            },
        )
        .unwrap();
    let recorder = EventRecorder::new();
    view.on_event(recorder.callback());

    // A bare insert has every property unset, so active=true fails.
    let u1 = db.insert("User").unwrap();
    assert!(recorder.is_empty());
    db.update(u1, [("active", Value::Bool(true))]).unwrap();
    assert_eq!(recorder.take(), vec![RecordedEvent::Enter(u1, 0)]);
}

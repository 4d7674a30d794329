// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Viewport stability: the window keeps showing the same items when edits
//! land before it.
#![allow(clippy::unwrap_used, clippy::expect_used)]

use trellis_core::{Database, FilterInput, NodeId, QueryInput, SortInput, Value, ViewOptions};
use trellis_testkit::forum_schema;

fn published_by_views_asc() -> QueryInput {
    QueryInput {
        root: "Post".into(),
        filter: vec![FilterInput {
            field: "published".into(),
            value: Some(Value::Bool(true)),
            ..Default::default()
        }],
        // Ascending over a descending index field: served by reverse
        // iteration.
        sort: vec![SortInput::from("views")],
        ..Default::default()
    }
}

fn post(db: &Database, views: i64) -> NodeId {
    let id = db.insert("Post").unwrap();
    db.update(
        id,
        [("published", Value::Bool(true)), ("views", Value::Int(views))],
    )
    .unwrap();
    id
}

#[test]
fn insert_before_the_window_shifts_offset_keeping_items() {
    let db = Database::new(forum_schema()).unwrap();
    let posts: Vec<NodeId> = (0..20).map(|i| post(&db, i)).collect();

    let view = db
        .view(
            &published_by_views_asc(),
            ViewOptions {
                limit: 3,
                immediate: true,
                ..Default::default()
            },
        )
        .unwrap();
    view.scroll_to(5);
    let before: Vec<NodeId> = view.items().iter().map(|i| i.id).collect();
    assert_eq!(before, vec![posts[5], posts[6], posts[7]]);

    // A new post sorting at index 0.
    let first = post(&db, -100);
    assert_eq!(view.index_of(first), Some(0));

    assert_eq!(view.offset(), 6);
    let after: Vec<NodeId> = view.items().iter().map(|i| i.id).collect();
    assert_eq!(after, before, "window must keep showing the same items");
}

#[test]
fn removal_before_the_window_shifts_offset_back() {
    let db = Database::new(forum_schema()).unwrap();
    let posts: Vec<NodeId> = (0..10).map(|i| post(&db, i)).collect();

    let view = db
        .view(
            &published_by_views_asc(),
            ViewOptions {
                limit: 3,
                immediate: true,
                ..Default::default()
            },
        )
        .unwrap();
    view.scroll_to(4);
    let before: Vec<NodeId> = view.items().iter().map(|i| i.id).collect();
    assert_eq!(before, vec![posts[4], posts[5], posts[6]]);

    db.delete(posts[0]).unwrap();
    assert_eq!(view.offset(), 3);
    let after: Vec<NodeId> = view.items().iter().map(|i| i.id).collect();
    assert_eq!(after, before);
}

#[test]
fn scrolling_walks_the_window() {
    let db = Database::new(forum_schema()).unwrap();
    let posts: Vec<NodeId> = (0..8).map(|i| post(&db, i)).collect();

    let view = db
        .view(
            &published_by_views_asc(),
            ViewOptions {
                limit: 2,
                immediate: true,
                ..Default::default()
            },
        )
        .unwrap();
    let ids = |view: &trellis_core::View| -> Vec<NodeId> {
        view.items().iter().map(|i| i.id).collect()
    };
    assert_eq!(ids(&view), vec![posts[0], posts[1]]);
    view.move_by(3);
    assert_eq!(ids(&view), vec![posts[3], posts[4]]);
    view.move_by(-1);
    assert_eq!(ids(&view), vec![posts[2], posts[3]]);
    view.scroll_to(100);
    // Clamped to total - height.
    assert_eq!(ids(&view), vec![posts[6], posts[7]]);
    view.set_height(4);
    assert_eq!(ids(&view), vec![posts[4], posts[5], posts[6], posts[7]]);
}

#[test]
fn events_outside_the_window_are_suppressed() {
    let db = Database::new(forum_schema()).unwrap();
    let posts: Vec<NodeId> = (0..10).map(|i| post(&db, i)).collect();

    let view = db
        .view(
            &published_by_views_asc(),
            ViewOptions {
                limit: 3,
                immediate: true,
                ..Default::default()
            },
        )
        .unwrap();
    view.scroll_to(5);

    let recorder = trellis_testkit::EventRecorder::new();
    view.on_event(recorder.callback());

    // Enters far above the window produce no client event (the offset
    // shift keeps the shown items identical).
    post(&db, -50);
    assert!(recorder.is_empty());

    // An in-window change does surface.
    let shown = view.items()[0].id;
    assert_eq!(shown, posts[5]);
    db.update(shown, [("published", Value::Bool(false))]).unwrap();
    let events = recorder.take();
    assert_eq!(events.len(), 1);
    assert!(matches!(
        events[0],
        trellis_testkit::RecordedEvent::Leave(id, _) if id == shown
    ));
}

// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Delete cascades: every edge unlinks (with per-edge events on the other
//! endpoint) before the node itself leaves.
#![allow(clippy::unwrap_used, clippy::expect_used)]

use trellis_core::{Database, Value};
use trellis_testkit::{forum_schema, NodeEventRecorder};

#[test]
fn deleting_a_post_fires_unlink_on_the_author_watcher() {
    let db = Database::new(forum_schema()).unwrap();
    let user1 = db.insert("User").unwrap();
    let post1 = db.insert("Post").unwrap();
    db.link(post1, "author", user1).unwrap();
    assert_eq!(db.edge_targets(user1, "posts").unwrap(), vec![post1]);

    let watch = db.watch_node(user1).unwrap();
    let recorder = NodeEventRecorder::new();
    watch.on_event(recorder.callback());

    db.delete(post1).unwrap();

    let events = recorder.events();
    assert!(
        events.contains(&("unlink:posts".to_owned(), Some(post1))),
        "expected unlink:posts on the author watcher, got {events:?}"
    );
    assert_eq!(db.edge_targets(user1, "posts").unwrap(), Vec::new());
    assert!(db.get(post1).is_none());
}

#[test]
fn delete_restores_both_edge_directions() {
    let db = Database::new(forum_schema()).unwrap();
    let user = db.insert("User").unwrap();
    let p1 = db.insert("Post").unwrap();
    let p2 = db.insert("Post").unwrap();
    db.link(user, "posts", p1).unwrap();
    db.link(user, "posts", p2).unwrap();

    db.delete(user).unwrap();
    // Forward/reverse consistency: the posts lost their author too.
    assert_eq!(db.edge_targets(p1, "author").unwrap(), Vec::new());
    assert_eq!(db.edge_targets(p2, "author").unwrap(), Vec::new());
    assert_eq!(db.count(), 2);
}

#[test]
fn delete_updates_count_rollups_on_the_surviving_side() {
    let db = Database::new(forum_schema()).unwrap();
    let user = db.insert("User").unwrap();
    let p1 = db.insert("Post").unwrap();
    let p2 = db.insert("Post").unwrap();
    db.link(user, "posts", p1).unwrap();
    db.link(user, "posts", p2).unwrap();
    assert_eq!(db.get(user).unwrap().get("post_count"), Value::Int(2));

    db.delete(p1).unwrap();
    assert_eq!(db.get(user).unwrap().get("post_count"), Value::Int(1));
    db.delete(p2).unwrap();
    // A zero count reads back as 0, not null.
    assert_eq!(db.get(user).unwrap().get("post_count"), Value::Int(0));
}

#[test]
fn delete_of_a_watched_node_fires_delete_last() {
    let db = Database::new(forum_schema()).unwrap();
    let user = db.insert("User").unwrap();
    let post = db.insert("Post").unwrap();
    db.link(user, "posts", post).unwrap();

    let watch = db.watch_node(post).unwrap();
    let recorder = NodeEventRecorder::new();
    watch.on_event(recorder.callback());

    db.delete(post).unwrap();
    let events = recorder.events();
    assert_eq!(events.last().unwrap().0, "delete");
    assert!(events
        .iter()
        .any(|(label, target)| label == "unlink:author" && *target == Some(user)));
}

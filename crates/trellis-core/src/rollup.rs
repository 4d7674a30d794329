// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Write-time computation and caching of rollup fields.
//!
//! Rollups are derived per-node values: the cardinality of an edge, or a
//! property read off a chosen target. They are recomputed whenever an input
//! could have changed (a link/unlink on the observed edge, or an update to
//! the input property on a target) and stored, so reads are O(1). Stored
//! values surface through the unified property lookup and participate in
//! indexes and filters exactly like real properties.

use rustc_hash::FxHashMap;

use crate::ident::NodeId;
use crate::schema::{RollupDef, RollupKind};
use crate::store::NodeStore;
use crate::value::Value;

/// Per-node cache of computed rollup values.
#[derive(Debug, Default)]
pub struct RollupCache {
    values: FxHashMap<NodeId, FxHashMap<String, Value>>,
}

impl RollupCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads a cached rollup value. Absent reads as `Null`.
    #[must_use]
    pub fn value(&self, id: NodeId, name: &str) -> Value {
        self.values
            .get(&id)
            .and_then(|m| m.get(name))
            .cloned()
            .unwrap_or(Value::Null)
    }

    /// Recomputes one rollup for `owner` against live store state.
    ///
    /// Returns `Some((old, new))` when the stored value changed; the caller
    /// treats that exactly like a property update (index maintenance plus
    /// subscription dispatch).
    pub(crate) fn recompute(
        &mut self,
        store: &NodeStore,
        owner: NodeId,
        def: &RollupDef,
    ) -> Option<(Value, Value)> {
        let new = compute(store, owner, &def.kind);
        let slot = self.values.entry(owner).or_default();
        let old = slot.get(&def.name).cloned().unwrap_or(Value::Null);
        if old == new {
            return None;
        }
        if new.is_null() {
            slot.remove(&def.name);
        } else {
            slot.insert(def.name.clone(), new.clone());
        }
        Some((old, new))
    }

    /// Drops every cached value for a deleted node.
    pub(crate) fn drop_node(&mut self, id: NodeId) {
        self.values.remove(&id);
    }
}

/// Computes a rollup value from live store state.
///
/// `first`/`last` read the highest- and lowest-ranked target under the
/// edge's maintained order. Without a declared sort the list order is
/// insertion order; the schema is accepted and the computation simply uses
/// that order.
fn compute(store: &NodeStore, owner: NodeId, kind: &RollupKind) -> Value {
    let Some(node) = store.node(owner) else {
        return Value::Null;
    };
    let read = |target: Option<NodeId>, property: &str| {
        target
            .and_then(|t| store.node(t))
            .and_then(|n| n.prop(property).cloned())
            .unwrap_or(Value::Null)
    };
    match kind {
        RollupKind::Count { edge } => {
            #[allow(clippy::cast_possible_wrap)]
            Value::Int(node.targets(*edge).len() as i64)
        }
        RollupKind::Traverse { edge, property } | RollupKind::First { edge, property } => {
            read(node.first_target(*edge), property)
        }
        RollupKind::Last { edge, property } => {
            read(node.targets(*edge).last().copied(), property)
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::ident::TypeId;
    use crate::key::Direction;
    use crate::schema::{
        EdgeDefInput, EdgeSortInput, PropertyDefInput, RollupKindInput, Schema, SchemaInput,
        TypeDefInput,
    };
    use crate::value::PropertyType;
    use std::sync::Arc;

    fn fixture() -> (NodeStore, TypeId, TypeId) {
        let input = SchemaInput {
            types: vec![
                TypeDefInput {
                    name: "Thread".into(),
                    edges: vec![EdgeDefInput {
                        name: "stacks".into(),
                        target: "Stack".into(),
                        reverse: "thread".into(),
                        sort: Some(EdgeSortInput {
                            property: "ts".into(),
                            direction: Direction::Asc,
                        }),
                    }],
                    rollups: vec![crate::schema::RollupDefInput {
                        name: "stack_count".into(),
                        kind: RollupKindInput::Count {
                            edge: "stacks".into(),
                        },
                    }],
                    ..Default::default()
                },
                TypeDefInput {
                    name: "Stack".into(),
                    properties: vec![PropertyDefInput {
                        name: "ts".into(),
                        ty: PropertyType::Int,
                    }],
                    edges: vec![EdgeDefInput {
                        name: "thread".into(),
                        target: "Thread".into(),
                        reverse: "stacks".into(),
                        sort: None,
                    }],
                    ..Default::default()
                },
            ],
        };
        let schema = Arc::new(Schema::resolve(&input).unwrap());
        let thread = schema.type_id("Thread").unwrap();
        let stack = schema.type_id("Stack").unwrap();
        (NodeStore::new(schema), thread, stack)
    }

    #[test]
    fn count_tracks_edge_cardinality() {
        let (mut store, thread_ty, stack_ty) = fixture();
        let schema = Arc::clone(store.schema());
        let stacks = schema.type_def(thread_ty).edge_id("stacks").unwrap();
        let def = schema.type_def(thread_ty).rollups[0].clone();

        let t = store.allocate(thread_ty);
        let s1 = store.allocate(stack_ty);
        store.insert_target(t, stacks, s1);

        let mut cache = RollupCache::new();
        let (old, new) = cache.recompute(&store, t, &def).unwrap();
        assert_eq!(old, Value::Null);
        assert_eq!(new, Value::Int(1));
        assert_eq!(cache.value(t, "stack_count"), Value::Int(1));

        // Unchanged inputs produce no delta.
        assert!(cache.recompute(&store, t, &def).is_none());
    }

    #[test]
    fn first_and_last_follow_the_declared_order() {
        let (mut store, thread_ty, stack_ty) = fixture();
        let schema = Arc::clone(store.schema());
        let stacks = schema.type_def(thread_ty).edge_id("stacks").unwrap();

        let t = store.allocate(thread_ty);
        let s1 = store.allocate(stack_ty);
        let s2 = store.allocate(stack_ty);
        store.write_prop(s1, "ts", Value::Int(30));
        store.write_prop(s2, "ts", Value::Int(10));
        store.insert_target(t, stacks, s1);
        store.insert_target(t, stacks, s2);

        let first = RollupKind::First {
            edge: stacks,
            property: "ts".into(),
        };
        let last = RollupKind::Last {
            edge: stacks,
            property: "ts".into(),
        };
        assert_eq!(compute(&store, t, &first), Value::Int(10));
        assert_eq!(compute(&store, t, &last), Value::Int(30));
    }
}

// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Filter evaluation and item materialization.
//!
//! The executor is a pure read phase over store, rollups, and schema: it
//! never mutates. Children of a selection are *not* eagerly materialized;
//! views load them lazily on expansion, so [`materialize`] carries only the
//! node's own snapshot.

use rustc_hash::FxHashMap;

use crate::event::Item;
use crate::ident::NodeId;
use crate::key::{CompoundKey, KeyWriter};
use crate::node::Node;
use crate::query::{EdgeSelection, Filter, FilterOp, SortSpec};
use crate::rollup::RollupCache;
use crate::schema::Schema;
use crate::store::NodeStore;
use crate::value::Value;

/// Evaluation context: read-only access to everything a filter can touch.
#[derive(Clone, Copy)]
pub(crate) struct ReadCx<'a> {
    pub schema: &'a Schema,
    pub store: &'a NodeStore,
    pub rollups: &'a RollupCache,
}

impl<'a> ReadCx<'a> {
    /// Unified field lookup: stored property, then rollup, else `Null`.
    pub(crate) fn field(&self, node: &Node, name: &str) -> Value {
        node.prop(name)
            .cloned()
            .unwrap_or_else(|| self.rollups.value(node.id(), name))
    }

    /// Like [`ReadCx::field`], but reading pre-image values from
    /// `overrides` for the changed fields.
    fn field_with(
        &self,
        node: &Node,
        name: &str,
        overrides: Option<&FxHashMap<String, Value>>,
    ) -> Value {
        if let Some(old) = overrides.and_then(|o| o.get(name)) {
            return old.clone();
        }
        self.field(node, name)
    }
}

/// Evaluates every filter against a node (conjunction).
pub(crate) fn matches_filters(cx: ReadCx<'_>, node: &Node, filters: &[Filter]) -> bool {
    filters.iter().all(|f| matches_filter(cx, node, f, None))
}

/// Evaluates filters against a node as it looked before an update:
/// `overrides` maps changed field names to their pre-image values.
/// Overrides apply to the node itself, not to path-hopped neighbors.
pub(crate) fn matches_filters_with(
    cx: ReadCx<'_>,
    node: &Node,
    filters: &[Filter],
    overrides: &FxHashMap<String, Value>,
) -> bool {
    filters
        .iter()
        .all(|f| matches_filter(cx, node, f, Some(overrides)))
}

fn matches_filter(
    cx: ReadCx<'_>,
    node: &Node,
    filter: &Filter,
    overrides: Option<&FxHashMap<String, Value>>,
) -> bool {
    // Walk path hops: the executor follows the first edge match.
    let mut cursor = node;
    let mut hopped = false;
    for hop in &filter.path {
        let Some(next) = cursor
            .first_target(hop.edge)
            .and_then(|id| cx.store.node(id))
        else {
            // A broken path reads as Null at the leaf.
            return op_matches(filter, &Value::Null);
        };
        cursor = next;
        hopped = true;
    }
    let overrides = if hopped { None } else { overrides };

    if filter.leaf_is_edge {
        let Some(edge) = cx.schema.type_def(cursor.ty()).edge_id(&filter.leaf) else {
            return false;
        };
        let targets = cursor.targets(edge);
        let as_id = |v: &Value| match v {
            #[allow(clippy::cast_sign_loss)]
            Value::Int(i) => Some(NodeId::from_raw(*i as u64)),
            _ => None,
        };
        return match filter.op {
            FilterOp::Eq => match as_id(&filter.value) {
                Some(id) => targets.contains(&id),
                None => targets.is_empty(),
            },
            FilterOp::Neq => match as_id(&filter.value) {
                Some(id) => !targets.contains(&id),
                None => !targets.is_empty(),
            },
            FilterOp::In => filter
                .values
                .iter()
                .filter_map(|v| as_id(v))
                .any(|id| targets.contains(&id)),
            // Range operators compare the first target's id.
            _ => {
                #[allow(clippy::cast_possible_wrap)]
                let first = targets.first().map_or(Value::Null, |t| {
                    Value::Int(t.get() as i64)
                });
                op_matches(filter, &first)
            }
        };
    }

    let value = cx.field_with(cursor, &filter.leaf, overrides);
    op_matches(filter, &value)
}

fn op_matches(filter: &Filter, value: &Value) -> bool {
    match filter.op {
        FilterOp::Eq => *value == filter.value,
        FilterOp::Neq => *value != filter.value,
        FilterOp::Gt => *value > filter.value,
        FilterOp::Gte => *value >= filter.value,
        FilterOp::Lt => *value < filter.value,
        FilterOp::Lte => *value <= filter.value,
        FilterOp::In => filter.values.contains(value),
    }
}

/// Materializes an item snapshot: stored properties plus non-null rollups.
pub(crate) fn materialize(
    cx: ReadCx<'_>,
    id: NodeId,
    depth: usize,
    path: Vec<NodeId>,
) -> Option<Item> {
    let node = cx.store.node(id)?;
    let def = cx.schema.type_def(node.ty());
    let mut props: FxHashMap<String, Value> = node
        .props
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    for rollup in &def.rollups {
        let value = cx.rollups.value(id, &rollup.name);
        if !value.is_null() {
            props.insert(rollup.name.clone(), value);
        }
    }
    Some(Item {
        id,
        type_name: def.name.clone(),
        depth,
        path,
        props,
    })
}

/// Targets of `selection`'s edge on `parent` that pass the selection's
/// filters, in the edge's maintained order. Cycle guard: targets already on
/// the ancestry path are skipped.
pub(crate) fn load_children(
    cx: ReadCx<'_>,
    parent: NodeId,
    ancestry: &[NodeId],
    selection: &EdgeSelection,
) -> Vec<NodeId> {
    let Some(node) = cx.store.node(parent) else {
        return Vec::new();
    };
    node.targets(selection.edge)
        .iter()
        .copied()
        .filter(|&t| t != parent && !ancestry.contains(&t))
        .filter(|&t| {
            cx.store
                .node(t)
                .is_some_and(|n| matches_filters(cx, n, &selection.filters))
        })
        .collect()
}

/// Builds one level's key segment on top of an ancestor prefix: the level's
/// sort values in order, then the node id tiebreaker.
pub(crate) fn level_key(
    cx: ReadCx<'_>,
    prefix: &CompoundKey,
    sorts: &[SortSpec],
    id: NodeId,
    max_key_len: usize,
) -> CompoundKey {
    let mut w = KeyWriter::with_prefix(prefix, max_key_len);
    if let Some(node) = cx.store.node(id) {
        for sort in sorts {
            let value = cx.field(node, &sort.field);
            w.push_value(&value, sort.direction);
        }
    }
    w.push_node_id(id);
    w.finish()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::query::{FilterInput, Query, QueryInput};
    use crate::schema::{
        EdgeDefInput, PropertyDefInput, SchemaInput, TypeDefInput,
    };
    use crate::value::PropertyType;
    use std::sync::Arc;

    struct Fixture {
        store: NodeStore,
        rollups: RollupCache,
        schema: Arc<Schema>,
    }

    impl Fixture {
        fn cx(&self) -> ReadCx<'_> {
            ReadCx {
                schema: &self.schema,
                store: &self.store,
                rollups: &self.rollups,
            }
        }
    }

    fn fixture() -> Fixture {
        let schema = Arc::new(
            Schema::resolve(&SchemaInput {
                types: vec![
                    TypeDefInput {
                        name: "User".into(),
                        properties: vec![PropertyDefInput {
                            name: "active".into(),
                            ty: PropertyType::Bool,
                        }],
                        edges: vec![EdgeDefInput {
                            name: "posts".into(),
                            target: "Post".into(),
                            reverse: "author".into(),
                            sort: None,
                        }],
                        ..Default::default()
                    },
                    TypeDefInput {
                        name: "Post".into(),
                        properties: vec![PropertyDefInput {
                            name: "views".into(),
                            ty: PropertyType::Int,
                        }],
                        edges: vec![EdgeDefInput {
                            name: "author".into(),
                            target: "User".into(),
                            reverse: "posts".into(),
                            sort: None,
                        }],
                        ..Default::default()
                    },
                ],
            })
            .unwrap(),
        );
        Fixture {
            store: NodeStore::new(Arc::clone(&schema)),
            rollups: RollupCache::new(),
            schema,
        }
    }

    #[test]
    fn path_filters_walk_the_first_edge_match() {
        let mut fx = fixture();
        let user_ty = fx.schema.type_id("User").unwrap();
        let post_ty = fx.schema.type_id("Post").unwrap();
        let posts = fx.schema.type_def(user_ty).edge_id("posts").unwrap();
        let author = fx.schema.type_def(post_ty).edge_id("author").unwrap();

        let user = fx.store.allocate(user_ty);
        let post = fx.store.allocate(post_ty);
        fx.store.write_prop(user, "active", Value::Bool(true));
        fx.store.insert_target(post, author, user);
        fx.store.insert_target(user, posts, post);

        let query = Query::compile(
            &fx.schema,
            &QueryInput {
                root: "Post".into(),
                filter: vec![FilterInput {
                    field: "author.active".into(),
                    value: Some(Value::Bool(true)),
                    ..Default::default()
                }],
                ..Default::default()
            },
        )
        .unwrap();
        let node = fx.store.node(post).unwrap().clone();
        assert!(matches_filters(fx.cx(), &node, &query.filters));

        fx.store.write_prop(user, "active", Value::Bool(false));
        let node = fx.store.node(post).unwrap().clone();
        assert!(!matches_filters(fx.cx(), &node, &query.filters));
    }

    #[test]
    fn pre_image_overrides_answer_matched_before() {
        let mut fx = fixture();
        let user_ty = fx.schema.type_id("User").unwrap();
        let user = fx.store.allocate(user_ty);
        fx.store.write_prop(user, "active", Value::Bool(true));

        let query = Query::compile(
            &fx.schema,
            &QueryInput {
                root: "User".into(),
                filter: vec![FilterInput {
                    field: "active".into(),
                    value: Some(Value::Bool(true)),
                    ..Default::default()
                }],
                ..Default::default()
            },
        )
        .unwrap();
        let node = fx.store.node(user).unwrap().clone();
        let mut pre = FxHashMap::default();
        pre.insert("active".to_owned(), Value::Bool(false));
        assert!(matches_filters(fx.cx(), &node, &query.filters));
        assert!(!matches_filters_with(fx.cx(), &node, &query.filters, &pre));
    }

    #[test]
    fn materialized_items_carry_stored_properties() {
        let mut fx = fixture();
        let post_ty = fx.schema.type_id("Post").unwrap();
        let post = fx.store.allocate(post_ty);
        fx.store.write_prop(post, "views", Value::Int(9));
        let item = materialize(fx.cx(), post, 2, vec![NodeId::from_raw(77)]).unwrap();
        assert_eq!(item.get("views"), Value::Int(9));
        assert_eq!(item.depth, 2);
        assert_eq!(item.type_name, "Post");
        assert_eq!(item.path, vec![NodeId::from_raw(77)]);
    }
}

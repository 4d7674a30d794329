// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Ordered composite indexes and their maintenance.
//!
//! Every [`IndexDef`] yields one `BTreeMap` from encoded composite key to
//! node id. Keys are rebuilt from live node state (properties, rollups,
//! first edge targets) on every mutation that touches a keyed field; the
//! manager remembers each node's current key per index so removal never
//! needs a pre-image.
//!
//! Scans are half-open byte ranges: an equality prefix narrows to one key
//! neighborhood, an optional range filter tightens one bound, and reverse
//! iteration serves whole-suffix-reversed sorts.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::ident::{IndexId, NodeId, TypeId};
use crate::key::{prefix_successor, Direction, KeyWriter};
use crate::node::Node;
use crate::plan::IndexCoverage;
use crate::query::{Filter, FilterOp};
use crate::rollup::RollupCache;
use crate::schema::{IndexField, Schema};
use crate::store::NodeStore;
use crate::value::Value;

#[derive(Debug, Default)]
struct IndexState {
    map: BTreeMap<Bytes, NodeId>,
    key_of: FxHashMap<NodeId, Bytes>,
}

/// Owns every index tree declared by the schema.
#[derive(Debug)]
pub struct IndexManager {
    schema: Arc<Schema>,
    max_key_len: usize,
    states: Vec<IndexState>,
}

impl IndexManager {
    /// Creates empty trees for every index in the schema.
    #[must_use]
    pub fn new(schema: Arc<Schema>, max_key_len: usize) -> Self {
        let states = (0..schema.index_count())
            .map(|_| IndexState::default())
            .collect();
        Self {
            schema,
            max_key_len,
            states,
        }
    }

    /// Number of entries in one index (test and diagnostics surface).
    #[must_use]
    pub fn entry_count(&self, index: IndexId) -> usize {
        self.states[index.index()].map.len()
    }

    /// Builds the current key of `node` in `index`.
    fn build_key(&self, rollups: &RollupCache, index: IndexId, node: &Node) -> Bytes {
        let def = self.schema.index(index);
        let mut w = KeyWriter::with_max_len(self.max_key_len);
        for field in &def.fields {
            match field {
                IndexField::Property { name, direction } => {
                    let value = node
                        .prop(name)
                        .cloned()
                        .unwrap_or_else(|| rollups.value(node.id(), name));
                    w.push_value(&value, *direction);
                }
                IndexField::Edge {
                    edge, direction, ..
                } => {
                    w.push_edge_ref(node.first_target(*edge), *direction);
                }
            }
        }
        w.push_node_id(node.id());
        w.finish().into_bytes()
    }

    /// Inserts a freshly created node into every index of its type.
    pub(crate) fn index_node(&mut self, store: &NodeStore, rollups: &RollupCache, id: NodeId) {
        let Some(node) = store.node(id) else { return };
        for &index in &self.schema.type_def(node.ty()).indexes {
            let key = self.build_key(rollups, index, node);
            let state = &mut self.states[index.index()];
            state.map.insert(key.clone(), id);
            state.key_of.insert(id, key);
        }
    }

    /// Removes a node from every index of its type.
    pub(crate) fn deindex_node(&mut self, ty: TypeId, id: NodeId) {
        for &index in &self.schema.type_def(ty).indexes {
            let state = &mut self.states[index.index()];
            if let Some(key) = state.key_of.remove(&id) {
                state.map.remove(&key);
            }
        }
    }

    /// Rebuilds `id`'s entries in the given indexes after a field or edge
    /// change.
    pub(crate) fn refresh(
        &mut self,
        store: &NodeStore,
        rollups: &RollupCache,
        id: NodeId,
        indexes: &[IndexId],
    ) {
        let Some(node) = store.node(id) else { return };
        for &index in indexes {
            let key = self.build_key(rollups, index, node);
            let state = &mut self.states[index.index()];
            match state.key_of.get(&id) {
                Some(old) if *old == key => continue,
                Some(old) => {
                    let old = old.clone();
                    state.map.remove(&old);
                }
                None => {}
            }
            trace!(index = index.index(), node = id.get(), "index entry rebuilt");
            state.map.insert(key.clone(), id);
            state.key_of.insert(id, key);
        }
    }

    /// Scans a coverage, yielding node ids in index order (reversed when
    /// the coverage iterates backwards). Residual filters are the caller's
    /// business.
    pub(crate) fn scan(&self, coverage: &IndexCoverage, filters: &[Filter]) -> Vec<NodeId> {
        let def = self.schema.index(coverage.index);
        let mut prefix_writer = KeyWriter::with_max_len(self.max_key_len);
        for field in def.fields.iter().take(coverage.equality_prefix) {
            let Some(filter) = filters.iter().find(|f| {
                f.path.is_empty() && f.op == FilterOp::Eq && f.leaf == field.field_name()
            }) else {
                return Vec::new();
            };
            push_field_value(&mut prefix_writer, field, &filter.value);
        }
        let prefix = prefix_writer.finish().into_bytes().to_vec();

        let mut start: Bound<Vec<u8>> = Bound::Included(prefix.clone());
        let mut end: Bound<Vec<u8>> = match prefix_successor(&prefix) {
            Some(succ) => Bound::Excluded(succ),
            None => Bound::Unbounded,
        };

        if coverage.range_field {
            let field = &def.fields[coverage.equality_prefix];
            if let Some(filter) = filters.iter().find(|f| {
                f.path.is_empty() && f.op.is_range() && f.leaf == field.field_name()
            }) {
                let mut w = KeyWriter::with_max_len(self.max_key_len);
                push_field_value(&mut w, field, &filter.value);
                let mut bound = prefix.clone();
                bound.extend_from_slice(&w.finish().into_bytes());
                // A descending field inverts the byte order, so the range
                // operator flips sides.
                let op = match (filter.op, field.direction()) {
                    (op, Direction::Asc) => op,
                    (FilterOp::Gt, Direction::Desc) => FilterOp::Lt,
                    (FilterOp::Gte, Direction::Desc) => FilterOp::Lte,
                    (FilterOp::Lt, Direction::Desc) => FilterOp::Gt,
                    (FilterOp::Lte, Direction::Desc) => FilterOp::Gte,
                    (op, Direction::Desc) => op,
                };
                match op {
                    FilterOp::Gte => start = Bound::Included(bound),
                    FilterOp::Gt => match prefix_successor(&bound) {
                        Some(succ) => start = Bound::Included(succ),
                        None => return Vec::new(),
                    },
                    FilterOp::Lt => end = Bound::Excluded(bound),
                    FilterOp::Lte => match prefix_successor(&bound) {
                        Some(succ) => end = Bound::Excluded(succ),
                        None => {}
                    },
                    _ => {}
                }
            }
        }

        let state = &self.states[coverage.index.index()];
        let range = state.map.range::<[u8], _>((
            bound_as_ref(&start),
            bound_as_ref(&end),
        ));
        if coverage.reverse {
            range.rev().map(|(_, &id)| id).collect()
        } else {
            range.map(|(_, &id)| id).collect()
        }
    }
}

fn bound_as_ref(bound: &Bound<Vec<u8>>) -> Bound<&[u8]> {
    match bound {
        Bound::Included(b) => Bound::Included(b.as_slice()),
        Bound::Excluded(b) => Bound::Excluded(b.as_slice()),
        Bound::Unbounded => Bound::Unbounded,
    }
}

/// Encodes one filter value as the given index field.
fn push_field_value(w: &mut KeyWriter, field: &IndexField, value: &Value) {
    match field {
        IndexField::Property { direction, .. } => w.push_value(value, *direction),
        IndexField::Edge { direction, .. } => {
            let parent = match value {
                #[allow(clippy::cast_sign_loss)]
                Value::Int(id) => Some(NodeId::from_raw(*id as u64)),
                _ => None,
            };
            w.push_edge_ref(parent, *direction);
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::key::DEFAULT_MAX_KEY_LEN;
    use crate::plan::select_index;
    use crate::query::{FilterInput, Query, QueryInput, SortInput};
    use crate::schema::{
        EdgeDefInput, FieldKind, IndexDefInput, IndexFieldInput, PropertyDefInput, SchemaInput,
        TypeDefInput,
    };
    use crate::value::PropertyType;

    fn post_schema() -> Arc<Schema> {
        Arc::new(
            Schema::resolve(&SchemaInput {
                types: vec![TypeDefInput {
                    name: "Post".into(),
                    properties: vec![
                        PropertyDefInput {
                            name: "published".into(),
                            ty: PropertyType::Bool,
                        },
                        PropertyDefInput {
                            name: "views".into(),
                            ty: PropertyType::Int,
                        },
                    ],
                    indexes: vec![IndexDefInput {
                        fields: vec![
                            IndexFieldInput {
                                field: "published".into(),
                                direction: Direction::Asc,
                                kind: FieldKind::Property,
                            },
                            IndexFieldInput {
                                field: "views".into(),
                                direction: Direction::Desc,
                                kind: FieldKind::Property,
                            },
                        ],
                    }],
                    ..Default::default()
                }],
            })
            .unwrap(),
        )
    }

    fn insert_post(
        store: &mut NodeStore,
        indexes: &mut IndexManager,
        rollups: &RollupCache,
        published: bool,
        views: i64,
    ) -> NodeId {
        let ty = store.schema().type_id("Post").unwrap();
        let id = store.allocate(ty);
        store.write_prop(id, "published", Value::Bool(published));
        store.write_prop(id, "views", Value::Int(views));
        indexes.index_node(store, rollups, id);
        id
    }

    #[test]
    fn equality_prefix_scan_returns_sorted_matches() {
        let schema = post_schema();
        let mut store = NodeStore::new(Arc::clone(&schema));
        let mut indexes = IndexManager::new(Arc::clone(&schema), DEFAULT_MAX_KEY_LEN);
        let rollups = RollupCache::new();

        let p1 = insert_post(&mut store, &mut indexes, &rollups, true, 100);
        let p2 = insert_post(&mut store, &mut indexes, &rollups, true, 200);
        let _unpub = insert_post(&mut store, &mut indexes, &rollups, false, 500);

        let query = Query::compile(
            &schema,
            &QueryInput {
                root: "Post".into(),
                filter: vec![FilterInput {
                    field: "published".into(),
                    value: Some(Value::Bool(true)),
                    ..Default::default()
                }],
                sort: vec![SortInput::from("-views")],
                ..Default::default()
            },
        )
        .unwrap();
        let coverage = select_index(&schema, query.root, &query.filters, &query.sorts)
            .unwrap()
            .unwrap();
        assert_eq!(coverage.equality_prefix, 1);
        assert_eq!(coverage.sort_suffix, 1);
        assert!(!coverage.reverse);

        // Descending views: p2 (200) before p1 (100); unpublished excluded.
        assert_eq!(indexes.scan(&coverage, &query.filters), vec![p2, p1]);
    }

    #[test]
    fn property_update_moves_the_entry() {
        let schema = post_schema();
        let mut store = NodeStore::new(Arc::clone(&schema));
        let mut indexes = IndexManager::new(Arc::clone(&schema), DEFAULT_MAX_KEY_LEN);
        let rollups = RollupCache::new();

        let p1 = insert_post(&mut store, &mut indexes, &rollups, true, 100);
        let p2 = insert_post(&mut store, &mut indexes, &rollups, true, 200);

        store.write_prop(p1, "views", Value::Int(300));
        let ty = schema.type_id("Post").unwrap();
        let touched: Vec<_> = schema.type_def(ty).indexes_touching("views").to_vec();
        indexes.refresh(&store, &rollups, p1, &touched);

        let query = Query::compile(
            &schema,
            &QueryInput {
                root: "Post".into(),
                filter: vec![FilterInput {
                    field: "published".into(),
                    value: Some(Value::Bool(true)),
                    ..Default::default()
                }],
                sort: vec![SortInput::from("-views")],
                ..Default::default()
            },
        )
        .unwrap();
        let coverage = select_index(&schema, query.root, &query.filters, &query.sorts)
            .unwrap()
            .unwrap();
        assert_eq!(indexes.scan(&coverage, &query.filters), vec![p1, p2]);
    }

    #[test]
    fn range_filters_tighten_the_scan() {
        let schema = post_schema();
        let mut store = NodeStore::new(Arc::clone(&schema));
        let mut indexes = IndexManager::new(Arc::clone(&schema), DEFAULT_MAX_KEY_LEN);
        let rollups = RollupCache::new();

        let _p1 = insert_post(&mut store, &mut indexes, &rollups, true, 100);
        let p2 = insert_post(&mut store, &mut indexes, &rollups, true, 200);
        let p3 = insert_post(&mut store, &mut indexes, &rollups, true, 300);

        let query = Query::compile(
            &schema,
            &QueryInput {
                root: "Post".into(),
                filter: vec![
                    FilterInput {
                        field: "published".into(),
                        value: Some(Value::Bool(true)),
                        ..Default::default()
                    },
                    FilterInput {
                        field: "views".into(),
                        op: FilterOp::Gte,
                        value: Some(Value::Int(200)),
                        ..Default::default()
                    },
                ],
                ..Default::default()
            },
        )
        .unwrap();
        let coverage = select_index(&schema, query.root, &query.filters, &query.sorts)
            .unwrap()
            .unwrap();
        assert!(coverage.range_field);
        // The views field is descending, so the index yields 300 then 200.
        assert_eq!(indexes.scan(&coverage, &query.filters), vec![p3, p2]);
    }

    #[test]
    fn cross_entity_index_groups_children_under_their_parent() {
        let schema = Arc::new(
            Schema::resolve(&SchemaInput {
                types: vec![
                    TypeDefInput {
                        name: "Thread".into(),
                        edges: vec![EdgeDefInput {
                            name: "stacks".into(),
                            target: "Stack".into(),
                            reverse: "thread".into(),
                            sort: None,
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
                        indexes: vec![IndexDefInput {
                            fields: vec![
                                IndexFieldInput {
                                    field: "thread".into(),
                                    direction: Direction::Asc,
                                    kind: FieldKind::Edge,
                                },
                                IndexFieldInput {
                                    field: "ts".into(),
                                    direction: Direction::Asc,
                                    kind: FieldKind::Property,
                                },
                            ],
                        }],
                        ..Default::default()
                    },
                ],
            })
            .unwrap(),
        );
        let mut store = NodeStore::new(Arc::clone(&schema));
        let mut indexes = IndexManager::new(Arc::clone(&schema), DEFAULT_MAX_KEY_LEN);
        let rollups = RollupCache::new();

        let thread_ty = schema.type_id("Thread").unwrap();
        let stack_ty = schema.type_id("Stack").unwrap();
        let thread_edge = schema.type_def(stack_ty).edge_id("thread").unwrap();
        let stacks_edge = schema.type_def(thread_ty).edge_id("stacks").unwrap();

        let t1 = store.allocate(thread_ty);
        let t2 = store.allocate(thread_ty);
        let mut stacks = Vec::new();
        for (thread, ts) in [(t2, 5_i64), (t1, 9), (t1, 3)] {
            let s = store.allocate(stack_ty);
            store.write_prop(s, "ts", Value::Int(ts));
            indexes.index_node(&store, &rollups, s);
            store.insert_target(thread, stacks_edge, s);
            store.insert_target(s, thread_edge, thread);
            indexes.refresh(
                &store,
                &rollups,
                s,
                schema.indexes_keyed_by_edge(thread_edge),
            );
            stacks.push(s);
        }

        #[allow(clippy::cast_possible_wrap)]
        let query = Query::compile(
            &schema,
            &QueryInput {
                root: "Stack".into(),
                filter: vec![FilterInput {
                    field: "thread".into(),
                    value: Some(Value::Int(t1.get() as i64)),
                    ..Default::default()
                }],
                sort: vec![SortInput::from("ts")],
                ..Default::default()
            },
        )
        .unwrap();
        let coverage = select_index(&schema, query.root, &query.filters, &query.sorts)
            .unwrap()
            .unwrap();
        // Only thread 1's stacks, ascending by ts: (t1, 3) then (t1, 9).
        assert_eq!(
            indexes.scan(&coverage, &query.filters),
            vec![stacks[2], stacks[1]]
        );
    }
}

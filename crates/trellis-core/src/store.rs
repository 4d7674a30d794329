// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! In-memory node storage: id assignment, property maps, and bidirectional
//! edge target lists.
//!
//! The store holds the primitive state only. Coordination with indexes,
//! rollups, and subscriptions happens one layer up in [`crate::db`]; every
//! public mutation there pre-validates against this store before touching
//! anything, which is what makes partial failure impossible.

use std::collections::BTreeSet;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::ident::{EdgeId, NodeId, TypeId};
use crate::key::Direction;
use crate::node::Node;
use crate::schema::Schema;
use crate::value::Value;

/// Runtime mutation failures. Any operation returning one of these leaves
/// the store (and everything layered on it) unchanged.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NodeStoreError {
    /// `insert` named a type the schema does not declare.
    #[error("unknown type: {0}")]
    UnknownType(String),
    /// `link`/`unlink` named an edge the source type does not declare.
    #[error("unknown edge {edge} on type {type_name}")]
    UnknownEdge {
        /// Source node's type.
        type_name: String,
        /// Missing edge name.
        edge: String,
    },
    /// A referenced node does not exist (or was deleted).
    #[error("node not found: {0:?}")]
    NodeNotFound(NodeId),
    /// `unlink` named a target that is not in the edge's target list, or
    /// `link` named a target of the wrong type.
    #[error("edge target not found: {target:?} via {edge}")]
    EdgeTargetNotFound {
        /// Edge name.
        edge: String,
        /// Offending target.
        target: NodeId,
    },
}

/// Owns every node, keyed by monotonic [`NodeId`].
#[derive(Debug)]
pub struct NodeStore {
    schema: Arc<Schema>,
    nodes: FxHashMap<NodeId, Node>,
    /// Per type: live node ids in ascending id order. Serves unindexed,
    /// unsorted root scans deterministically.
    by_type: Vec<BTreeSet<NodeId>>,
    next_id: u64,
}

impl NodeStore {
    /// Creates an empty store for a resolved schema.
    #[must_use]
    pub fn new(schema: Arc<Schema>) -> Self {
        let by_type = vec![BTreeSet::new(); schema.types().len()];
        Self {
            schema,
            nodes: FxHashMap::default(),
            by_type,
            next_id: 1,
        }
    }

    /// The schema this store was built against.
    #[must_use]
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Number of live nodes.
    #[must_use]
    pub fn count(&self) -> usize {
        self.nodes.len()
    }

    /// Returns a shared reference to a node when it exists.
    #[must_use]
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(&id)
    }

    /// Live nodes of one type, ascending by id.
    pub fn nodes_of_type(&self, ty: TypeId) -> impl Iterator<Item = NodeId> + '_ {
        self.by_type[ty.index()].iter().copied()
    }

    /// Allocates a fresh node of `ty`. Ids are never reused.
    pub(crate) fn allocate(&mut self, ty: TypeId) -> NodeId {
        let id = NodeId::from_raw(self.next_id);
        self.next_id += 1;
        self.nodes.insert(id, Node::new(ty, id));
        self.by_type[ty.index()].insert(id);
        id
    }

    /// Removes a node record. The caller has already unlinked every edge.
    pub(crate) fn remove(&mut self, id: NodeId) -> Option<Node> {
        let node = self.nodes.remove(&id)?;
        self.by_type[node.ty.index()].remove(&id);
        Some(node)
    }

    /// Writes one property, returning the previous value (absent reads as
    /// `Null`).
    pub(crate) fn write_prop(&mut self, id: NodeId, name: &str, value: Value) -> Option<Value> {
        let node = self.nodes.get_mut(&id)?;
        Some(if value.is_null() {
            node.props.remove(name).unwrap_or(Value::Null)
        } else {
            node.props.insert(name.to_owned(), value).unwrap_or(Value::Null)
        })
    }

    /// Inserts `tgt` into `src`'s target list for `edge`, honoring the
    /// edge's declared sort (insertion order otherwise). Returns the
    /// position. No-op (returning `None`) when the link already exists.
    pub(crate) fn insert_target(&mut self, src: NodeId, edge: EdgeId, tgt: NodeId) -> Option<usize> {
        let list = self
            .nodes
            .get(&src)
            .map(|n| n.targets(edge))
            .unwrap_or_default();
        if list.contains(&tgt) {
            return None;
        }
        let pos = self.sorted_position(list, edge, tgt);
        let node = self.nodes.get_mut(&src)?;
        node.targets.entry(edge).or_default().insert(pos, tgt);
        Some(pos)
    }

    /// Removes `tgt` from `src`'s target list for `edge`. Returns `true`
    /// when the link existed.
    pub(crate) fn remove_target(&mut self, src: NodeId, edge: EdgeId, tgt: NodeId) -> bool {
        let Some(node) = self.nodes.get_mut(&src) else {
            return false;
        };
        let Some(list) = node.targets.get_mut(&edge) else {
            return false;
        };
        let Some(pos) = list.iter().position(|&t| t == tgt) else {
            return false;
        };
        list.remove(pos);
        if list.is_empty() {
            node.targets.remove(&edge);
        }
        true
    }

    /// Re-sorts `moved` within `owner`'s target list for `edge` after the
    /// sort property changed on `moved`. Returns `true` if the position
    /// changed.
    pub(crate) fn reorder_target(&mut self, owner: NodeId, edge: EdgeId, moved: NodeId) -> bool {
        let Some(node) = self.nodes.get(&owner) else {
            return false;
        };
        let list = node.targets(edge);
        let Some(old_pos) = list.iter().position(|&t| t == moved) else {
            return false;
        };
        let mut remaining: Vec<NodeId> = list.to_vec();
        remaining.remove(old_pos);
        let new_pos = self.sorted_position(&remaining, edge, moved);
        if new_pos == old_pos {
            return false;
        }
        if let Some(node) = self.nodes.get_mut(&owner) {
            if let Some(list) = node.targets.get_mut(&edge) {
                list.remove(old_pos);
                list.insert(new_pos, moved);
            }
        }
        true
    }

    /// Position `tgt` would occupy in `list` under `edge`'s declared sort.
    /// Appends when the edge has no sort.
    fn sorted_position(&self, list: &[NodeId], edge: EdgeId, tgt: NodeId) -> usize {
        let Some(sort) = &self.schema.edge(edge).sort else {
            return list.len();
        };
        let key_of = |id: NodeId| -> (Value, NodeId) {
            let value = self
                .nodes
                .get(&id)
                .and_then(|n| n.props.get(&sort.property).cloned())
                .unwrap_or(Value::Null);
            (value, id)
        };
        let tgt_key = key_of(tgt);
        let before = |a: &(Value, NodeId), b: &(Value, NodeId)| match sort.direction {
            Direction::Asc => a < b,
            // Descending on the value; the id tiebreaker stays ascending.
            Direction::Desc => (&b.0, &a.1) < (&a.0, &b.1),
        };
        list.iter()
            .position(|&other| before(&tgt_key, &key_of(other)))
            .unwrap_or(list.len())
    }
}

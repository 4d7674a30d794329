// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Node records and read-only node snapshots.

use rustc_hash::FxHashMap;

use crate::ident::{EdgeId, NodeId, TypeId};
use crate::rollup::RollupCache;
use crate::value::Value;

/// Materialised record for a single node.
///
/// Invariants
/// - `ty` is a valid type id in the owning store's schema.
/// - Every edge id in `targets` belongs to the node's type (forward edges)
///   or points back at it (reverse edges of other types' forward edges).
/// - Target lists are ordered per the edge's declared sort when one exists,
///   insertion order otherwise.
/// - Forward/reverse consistency: `a` listing `b` under edge `e` implies
///   `b` lists `a` under `e.reverse`.
#[derive(Clone, Debug)]
pub struct Node {
    pub(crate) ty: TypeId,
    pub(crate) id: NodeId,
    pub(crate) props: FxHashMap<String, Value>,
    pub(crate) targets: FxHashMap<EdgeId, Vec<NodeId>>,
}

impl Node {
    pub(crate) fn new(ty: TypeId, id: NodeId) -> Self {
        Self {
            ty,
            id,
            props: FxHashMap::default(),
            targets: FxHashMap::default(),
        }
    }

    /// The node's type.
    #[must_use]
    pub fn ty(&self) -> TypeId {
        self.ty
    }

    /// The node's id.
    #[must_use]
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// A stored scalar property (rollups are not visible here; see
    /// [`NodeRef::property`] for the unified lookup).
    #[must_use]
    pub fn prop(&self, name: &str) -> Option<&Value> {
        self.props.get(name)
    }

    /// Targets of an edge, in the edge's maintained order.
    #[must_use]
    pub fn targets(&self, edge: EdgeId) -> &[NodeId] {
        self.targets.get(&edge).map_or(&[], Vec::as_slice)
    }

    /// First target of an edge, if any.
    #[must_use]
    pub fn first_target(&self, edge: EdgeId) -> Option<NodeId> {
        self.targets(edge).first().copied()
    }
}

/// Read-only snapshot of a node.
///
/// This wrapper exposes only query methods and the unified property lookup
/// (stored properties first, then rollup values), enforcing read-only
/// access at compile time. Do not add any method returning `&mut` state or
/// the underlying store reference; observers and executors must not be able
/// to mutate through it.
#[derive(Clone, Copy, Debug)]
pub struct NodeRef<'a> {
    node: &'a Node,
    rollups: &'a RollupCache,
}

impl<'a> NodeRef<'a> {
    pub(crate) fn new(node: &'a Node, rollups: &'a RollupCache) -> Self {
        Self { node, rollups }
    }

    /// The node's id.
    #[must_use]
    pub fn id(&self) -> NodeId {
        self.node.id
    }

    /// The node's type.
    #[must_use]
    pub fn ty(&self) -> TypeId {
        self.node.ty
    }

    /// Unified property lookup: stored properties, then rollups. Absent
    /// either way reads as `Null`.
    #[must_use]
    pub fn property(&self, name: &str) -> Value {
        if let Some(v) = self.node.props.get(name) {
            return v.clone();
        }
        self.rollups.value(self.node.id, name)
    }

    /// Targets of an edge, in the edge's maintained order.
    #[must_use]
    pub fn targets(&self, edge: EdgeId) -> &'a [NodeId] {
        self.node.targets(edge)
    }

    /// Stored scalar properties, without rollups.
    pub fn props(&self) -> impl Iterator<Item = (&'a str, &'a Value)> {
        self.node.props.iter().map(|(k, v)| (k.as_str(), v))
    }
}

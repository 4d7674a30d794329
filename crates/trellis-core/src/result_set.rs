// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Per-subscription sorted result sets.
//!
//! A result set is a doubly-linked list of result nodes ordered by
//! composite key, with O(1) id lookup through a side map. Links are node
//! ids into the owning map, never pointers. Insertion and repositioning
//! walk from the tail: mutations overwhelmingly land near the end of the
//! key space (fresh ids are the final tiebreaker).

use rustc_hash::FxHashMap;

use crate::ident::{EdgeId, NodeId};
use crate::key::CompoundKey;

/// One tracked node in a subscription's result.
#[derive(Clone, Debug)]
pub struct ResultNode {
    /// The tracked node.
    pub id: NodeId,
    /// Full composite sort key (every ancestor level's sort values and id,
    /// then the node's own).
    pub key: CompoundKey,
    /// Visible ancestry, outermost first, excluding the node itself.
    /// Virtual hops are elided.
    pub ancestry: Vec<NodeId>,
    /// Full ancestry including virtual hops; key recomputation walks this.
    pub virtual_ancestry: Vec<NodeId>,
    /// The edge by which the (visible) parent reached this node; `None`
    /// for roots.
    pub edge: Option<EdgeId>,
    /// Number of tracked parents (DAG semantics: the node leaves only when
    /// the last parent unlinks).
    pub parent_count: u32,
    prev: Option<NodeId>,
    next: Option<NodeId>,
}

impl ResultNode {
    /// Creates an unlinked result node with one parent.
    #[must_use]
    pub fn new(
        id: NodeId,
        key: CompoundKey,
        ancestry: Vec<NodeId>,
        virtual_ancestry: Vec<NodeId>,
        edge: Option<EdgeId>,
    ) -> Self {
        Self {
            id,
            key,
            ancestry,
            virtual_ancestry,
            edge,
            parent_count: 1,
            prev: None,
            next: None,
        }
    }
}

/// Sorted doubly-linked result list with hash lookup.
#[derive(Debug, Default)]
pub struct ResultSet {
    nodes: FxHashMap<NodeId, ResultNode>,
    head: Option<NodeId>,
    tail: Option<NodeId>,
}

impl ResultSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tracked nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns `true` when nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// O(1) membership test.
    #[must_use]
    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// O(1) lookup.
    #[must_use]
    pub fn get(&self, id: NodeId) -> Option<&ResultNode> {
        self.nodes.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: NodeId) -> Option<&mut ResultNode> {
        self.nodes.get_mut(&id)
    }

    /// Ids in key order.
    pub fn iter(&self) -> impl Iterator<Item = NodeId> + '_ {
        std::iter::successors(self.head, move |&id| {
            self.nodes.get(&id).and_then(|n| n.next)
        })
    }

    /// Position of a tracked node, by walking from the head.
    #[must_use]
    pub fn index_of(&self, id: NodeId) -> Option<usize> {
        self.iter().position(|n| n == id)
    }

    /// Splices a node in at its sorted position (walking from the tail)
    /// and returns that position.
    pub(crate) fn insert(&mut self, node: ResultNode) -> usize {
        let id = node.id;
        let key = node.key.clone();
        self.nodes.insert(id, node);

        // Find the first existing node (from the tail) whose key is below
        // the new one; splice after it.
        let mut cursor = self.tail;
        let mut steps_from_tail = 0;
        while let Some(cur) = cursor {
            if self.nodes[&cur].key < key {
                break;
            }
            steps_from_tail += 1;
            cursor = self.nodes[&cur].prev;
        }
        let prev = cursor;
        let next = match prev {
            Some(p) => self.nodes[&p].next,
            None => self.head,
        };
        self.link(id, prev, next);
        self.len() - 1 - steps_from_tail
    }

    /// Removes a node, returning its record and former position.
    pub(crate) fn remove(&mut self, id: NodeId) -> Option<(ResultNode, usize)> {
        let index = self.index_of(id)?;
        let node = self.nodes.remove(&id)?;
        match node.prev {
            Some(p) => {
                if let Some(prev) = self.nodes.get_mut(&p) {
                    prev.next = node.next;
                }
            }
            None => self.head = node.next,
        }
        match node.next {
            Some(n) => {
                if let Some(next) = self.nodes.get_mut(&n) {
                    next.prev = node.prev;
                }
            }
            None => self.tail = node.prev,
        }
        Some((node, index))
    }

    /// Re-keys a node and moves it to its new sorted position. Returns
    /// `(old_index, new_index)`, equal when the order did not change.
    pub(crate) fn reposition(&mut self, id: NodeId, key: CompoundKey) -> Option<(usize, usize)> {
        let (mut node, old_index) = self.remove(id)?;
        node.key = key;
        node.prev = None;
        node.next = None;
        let new_index = self.insert(node);
        Some((old_index, new_index))
    }

    fn link(&mut self, id: NodeId, prev: Option<NodeId>, next: Option<NodeId>) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.prev = prev;
            node.next = next;
        }
        match prev {
            Some(p) => {
                if let Some(prev) = self.nodes.get_mut(&p) {
                    prev.next = Some(id);
                }
            }
            None => self.head = Some(id),
        }
        match next {
            Some(n) => {
                if let Some(next) = self.nodes.get_mut(&n) {
                    next.prev = Some(id);
                }
            }
            None => self.tail = Some(id),
        }
    }
}

// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The reactive tree: a DFS-flattened visible chain over an arena of tree
//! nodes with per-edge expansion state.
//!
//! Three overlapping linked structures live on one owning arena, all links
//! expressed as node ids (never pointers):
//!
//! 1. the hierarchy (parent + per-edge child buckets),
//! 2. sibling order within a parent's edge bucket (sorted by key),
//! 3. the visible chain: a doubly-linked DFS traversal of every node whose
//!    path of ancestor edges is fully expanded.
//!
//! Invariants (checked by [`ReactiveTree::validate`]):
//! - `visible_count(n) = 1 + Σ visible_count(c)` over children in expanded
//!   buckets; root-level nodes contribute directly to `total_visible`.
//! - The visible chain is a valid DFS of the visible forest; a node not on
//!   the chain has both chain links `None`.
//! - `total_visible = Σ visible_count` over roots, and equals the chain
//!   length walked forward and backward.
//!
//! Chain work never iterates the expansion hash set: bucket order comes
//! from `edge_order` (deterministic insertion order) and segment lengths
//! from `visible_count`, because hash iteration order is undefined.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::ident::{EdgeId, NodeId};
use crate::key::CompoundKey;

/// One edge bucket: the child list of a parent along one edge.
#[derive(Debug, Default)]
struct EdgeChildren {
    first: Option<NodeId>,
    last: Option<NodeId>,
    count: usize,
}

/// Arena record for one tree position.
#[derive(Debug)]
struct TreeNode {
    key: CompoundKey,
    parent: Option<NodeId>,
    parent_edge: Option<EdgeId>,
    prev_sibling: Option<NodeId>,
    next_sibling: Option<NodeId>,
    edges: FxHashMap<EdgeId, EdgeChildren>,
    /// Bucket creation order; the authority for DFS bucket sequencing.
    edge_order: Vec<EdgeId>,
    expanded: FxHashSet<EdgeId>,
    prev_visible: Option<NodeId>,
    next_visible: Option<NodeId>,
    /// 1 + visible descendants, maintained locally even while the node
    /// itself is hidden by a collapsed ancestor.
    visible_count: usize,
    flat_index: usize,
    depth: usize,
}

impl TreeNode {
    fn new(key: CompoundKey, parent: Option<NodeId>, parent_edge: Option<EdgeId>, depth: usize) -> Self {
        Self {
            key,
            parent,
            parent_edge,
            prev_sibling: None,
            next_sibling: None,
            edges: FxHashMap::default(),
            edge_order: Vec::new(),
            expanded: FxHashSet::default(),
            prev_visible: None,
            next_visible: None,
            visible_count: 1,
            flat_index: 0,
            depth,
        }
    }
}

/// Structural change notifications, buffered per mutation.
///
/// Payloads carry everything an observer needs (ids, pre-mutation indices,
/// post-mutation totals) so no tree state needs to be read back during
/// translation.
#[derive(Clone, Debug)]
pub enum TreeEvent {
    /// A contiguous run of nodes became visible.
    Inserted {
        /// First node of the run.
        first: NodeId,
        /// Flat index the run starts at.
        start: usize,
        /// Run length.
        count: usize,
        /// Visible total after the insert.
        new_total: usize,
    },
    /// A contiguous run of nodes left the visible chain.
    Removed {
        /// The removed nodes, in chain order.
        ids: Vec<NodeId>,
        /// Flat index the run started at.
        start: usize,
        /// Run length.
        count: usize,
        /// Visible total after the removal.
        new_total: usize,
    },
    /// A node (with its subtree) moved to a new position.
    Moved {
        /// The moved node.
        id: NodeId,
        /// Flat index before.
        old_index: usize,
        /// Flat index after.
        new_index: usize,
    },
}

/// The reactive tree.
#[derive(Debug, Default)]
pub struct ReactiveTree {
    nodes: FxHashMap<NodeId, TreeNode>,
    first_root: Option<NodeId>,
    last_root: Option<NodeId>,
    root_count: usize,
    /// Head of the visible chain (always the first root).
    head: Option<NodeId>,
    total_visible: usize,
    indices_dirty: bool,
    events: Vec<TreeEvent>,
}

impl ReactiveTree {
    /// Creates an empty tree.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of visible nodes.
    #[must_use]
    pub fn total_visible(&self) -> usize {
        self.total_visible
    }

    /// Number of roots.
    #[must_use]
    pub fn root_count(&self) -> usize {
        self.root_count
    }

    /// Whether the arena holds `id` (visible or not).
    #[must_use]
    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// The node's depth (roots are 0), when present.
    #[must_use]
    pub fn depth(&self, id: NodeId) -> Option<usize> {
        self.nodes.get(&id).map(|n| n.depth)
    }

    /// The node's current sort key, when present.
    #[must_use]
    pub fn key(&self, id: NodeId) -> Option<&CompoundKey> {
        self.nodes.get(&id).map(|n| &n.key)
    }

    /// Whether `edge` is marked expanded on `id`.
    #[must_use]
    pub fn is_expanded(&self, id: NodeId, edge: EdgeId) -> bool {
        self.nodes
            .get(&id)
            .is_some_and(|n| n.expanded.contains(&edge))
    }

    /// Expanded edges of a node, in bucket order then any never-populated
    /// expansions (by edge id, for determinism).
    #[must_use]
    pub fn expanded_edges(&self, id: NodeId) -> Vec<EdgeId> {
        self.nodes.get(&id).map_or_else(Vec::new, |n| {
            let mut out: Vec<EdgeId> = n
                .edge_order
                .iter()
                .copied()
                .filter(|e| n.expanded.contains(e))
                .collect();
            let mut rest: Vec<EdgeId> = n
                .expanded
                .iter()
                .copied()
                .filter(|e| !out.contains(e))
                .collect();
            rest.sort_unstable();
            out.extend(rest);
            out
        })
    }

    /// Children of one edge bucket, in sibling order.
    #[must_use]
    pub fn children(&self, parent: NodeId, edge: EdgeId) -> Vec<NodeId> {
        let Some(bucket) = self.nodes.get(&parent).and_then(|n| n.edges.get(&edge)) else {
            return Vec::new();
        };
        let mut out = Vec::with_capacity(bucket.count);
        let mut cursor = bucket.first;
        while let Some(id) = cursor {
            out.push(id);
            cursor = self.nodes.get(&id).and_then(|n| n.next_sibling);
        }
        out
    }

    /// Whether the node has any children in any bucket.
    #[must_use]
    pub fn has_children(&self, id: NodeId) -> bool {
        self.nodes
            .get(&id)
            .is_some_and(|n| n.edges.values().any(|b| b.count > 0))
    }

    /// Visible nodes in chain order.
    pub fn iter_visible(&self) -> impl Iterator<Item = NodeId> + '_ {
        std::iter::successors(self.head, move |&id| {
            self.nodes.get(&id).and_then(|n| n.next_visible)
        })
    }

    /// Visible nodes in chain order, starting at (and including) `id`.
    pub fn iter_from(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        std::iter::successors(self.contains(id).then_some(id), move |&cur| {
            self.nodes.get(&cur).and_then(|n| n.next_visible)
        })
    }

    /// The chain predecessor of a visible node.
    #[must_use]
    pub fn prev_visible_of(&self, id: NodeId) -> Option<NodeId> {
        self.nodes.get(&id).and_then(|n| n.prev_visible)
    }

    /// Drains the buffered structural events.
    pub fn take_events(&mut self) -> Vec<TreeEvent> {
        std::mem::take(&mut self.events)
    }

    /// Flat index of a visible node.
    pub fn index_of(&mut self, id: NodeId) -> Option<usize> {
        if !self.contains(id) || !self.path_visible(id) {
            return None;
        }
        self.ensure_indices();
        self.nodes.get(&id).map(|n| n.flat_index)
    }

    /// Node at a flat visible index.
    #[must_use]
    pub fn node_at_index(&self, index: usize) -> Option<NodeId> {
        self.iter_visible().nth(index)
    }

    // ------------------------------------------------------------------
    // Roots
    // ------------------------------------------------------------------

    /// Inserts a fresh root at its key-sorted position.
    pub fn insert_root(&mut self, id: NodeId, key: CompoundKey) {
        let mut prev = None;
        let mut cursor = self.first_root;
        while let Some(c) = cursor {
            if self.nodes[&c].key > key {
                break;
            }
            prev = Some(c);
            cursor = self.nodes[&c].next_sibling;
        }
        self.insert_root_after(id, key, prev);
    }

    /// Inserts a fresh root at an explicit position.
    pub fn insert_root_at(&mut self, id: NodeId, key: CompoundKey, index: usize) {
        let mut prev = None;
        let mut cursor = self.first_root;
        for _ in 0..index {
            let Some(c) = cursor else { break };
            prev = Some(c);
            cursor = self.nodes[&c].next_sibling;
        }
        self.insert_root_after(id, key, prev);
    }

    fn insert_root_after(&mut self, id: NodeId, key: CompoundKey, prev: Option<NodeId>) {
        if self.nodes.contains_key(&id) {
            return;
        }
        self.ensure_indices();
        let anchor = prev.map(|p| self.last_visible_descendant(p));
        let start = anchor.map_or(0, |a| self.nodes[&a].flat_index + 1);

        self.nodes.insert(id, TreeNode::new(key, None, None, 0));
        self.sibling_link_root(id, prev);
        self.root_count += 1;
        self.chain_link_run(anchor, &[id]);
        self.total_visible += 1;
        self.mark_dirty();
        self.events.push(TreeEvent::Inserted {
            first: id,
            start,
            count: 1,
            new_total: self.total_visible,
        });
        self.debug_validate();
    }

    /// Removes a root and its entire subtree.
    pub fn remove_root(&mut self, id: NodeId) {
        let Some(node) = self.nodes.get(&id) else { return };
        if node.parent.is_some() {
            return;
        }
        self.ensure_indices();
        let node = &self.nodes[&id];
        let count = node.visible_count;
        let start = node.flat_index;
        let ids = self.chain_unsplice(id, count);
        self.sibling_unlink_root(id);
        self.root_count -= 1;
        self.total_visible -= count;
        self.remove_subtree_arena(id);
        self.mark_dirty();
        self.events.push(TreeEvent::Removed {
            ids,
            start,
            count,
            new_total: self.total_visible,
        });
        self.debug_validate();
    }

    /// Moves a root to an explicit sibling position, keeping its key.
    pub fn move_root(&mut self, id: NodeId, new_index: usize) {
        let Some(node) = self.nodes.get(&id) else { return };
        if node.parent.is_some() {
            return;
        }
        self.ensure_indices();
        let old_flat = self.nodes[&id].flat_index;
        let count = self.nodes[&id].visible_count;
        let last = self.chain_detach_segment(id, count);
        self.sibling_unlink_root(id);
        self.root_count -= 1;

        let mut prev = None;
        let mut cursor = self.first_root;
        for _ in 0..new_index {
            let Some(c) = cursor else { break };
            prev = Some(c);
            cursor = self.nodes[&c].next_sibling;
        }
        self.sibling_link_root(id, prev);
        self.root_count += 1;
        let anchor = prev.map(|p| self.last_visible_descendant(p));
        self.chain_attach_segment(anchor, id, last);
        self.mark_dirty();
        self.ensure_indices();
        let new_flat = self.nodes[&id].flat_index;
        if new_flat != old_flat {
            self.events.push(TreeEvent::Moved {
                id,
                old_index: old_flat,
                new_index: new_flat,
            });
        }
        self.debug_validate();
    }

    /// Re-keys a root and moves it to its sorted position.
    pub fn update_root_key(&mut self, id: NodeId, key: CompoundKey) {
        self.update_key(id, key);
    }

    // ------------------------------------------------------------------
    // Children
    // ------------------------------------------------------------------

    /// Replaces one edge bucket's children wholesale.
    pub fn set_children(&mut self, parent: NodeId, edge: EdgeId, children: &[(NodeId, CompoundKey)]) {
        for child in self.children(parent, edge) {
            self.remove_child(child);
        }
        for (id, key) in children {
            self.insert_child(parent, edge, *id, key.clone());
        }
    }

    /// Inserts a fresh leaf under `parent` along `edge`, at its key-sorted
    /// sibling position.
    pub fn insert_child(&mut self, parent: NodeId, edge: EdgeId, id: NodeId, key: CompoundKey) {
        if self.nodes.contains_key(&id) || !self.nodes.contains_key(&parent) {
            return;
        }
        self.ensure_indices();
        let depth = self.nodes[&parent].depth + 1;
        self.nodes
            .insert(id, TreeNode::new(key.clone(), Some(parent), Some(edge), depth));

        // Sorted sibling insert.
        let (prev_sib, next_sib) = self.sibling_position(parent, edge, &key);
        self.sibling_link_child(parent, edge, id, prev_sib, next_sib);

        let expanded = self.nodes[&parent].expanded.contains(&edge);
        if expanded {
            if let Some(p) = self.nodes.get_mut(&parent) {
                p.visible_count += 1;
            }
            let visible = self.propagate(parent, 1);
            if visible {
                let anchor = self.chain_anchor_for_child(parent, edge, prev_sib);
                let start = self.nodes[&anchor].flat_index + 1;
                self.chain_link_run(Some(anchor), &[id]);
                self.total_visible += 1;
                self.mark_dirty();
                self.events.push(TreeEvent::Inserted {
                    first: id,
                    start,
                    count: 1,
                    new_total: self.total_visible,
                });
            }
        }
        self.debug_validate();
    }

    /// Removes a child node and its entire subtree.
    pub fn remove_child(&mut self, id: NodeId) {
        let Some(node) = self.nodes.get(&id) else { return };
        let Some(parent) = node.parent else {
            self.remove_root(id);
            return;
        };
        let Some(edge) = node.parent_edge else { return };
        self.ensure_indices();
        let delta = self.nodes[&id].visible_count;

        let expanded = self.nodes[&parent].expanded.contains(&edge);
        let mut visible = false;
        if expanded {
            if let Some(p) = self.nodes.get_mut(&parent) {
                p.visible_count -= delta;
            }
            visible = self.propagate(parent, -(isize_of(delta)));
        }
        if visible {
            let start = self.nodes[&id].flat_index;
            let ids = self.chain_unsplice(id, delta);
            self.total_visible -= delta;
            self.mark_dirty();
            self.events.push(TreeEvent::Removed {
                ids,
                start,
                count: delta,
                new_total: self.total_visible,
            });
        }
        self.sibling_unlink_child(parent, edge, id);
        self.remove_subtree_arena(id);
        self.debug_validate();
    }

    /// Re-keys any node and moves it (with its subtree) to its sorted
    /// position among its siblings.
    pub fn update_key(&mut self, id: NodeId, key: CompoundKey) {
        let Some(node) = self.nodes.get(&id) else { return };
        let parent = node.parent;
        let parent_edge = node.parent_edge;
        self.ensure_indices();
        let visible = self.path_visible(id);
        let old_flat = self.nodes[&id].flat_index;
        let count = self.nodes[&id].visible_count;

        // Detach from the chain (keeping the subtree segment intact).
        let last = if visible {
            Some(self.chain_detach_segment(id, count))
        } else {
            None
        };

        // Unlink and re-link the sibling chain at the new key position.
        match (parent, parent_edge) {
            (Some(p), Some(e)) => {
                self.sibling_unlink_child(p, e, id);
                if let Some(n) = self.nodes.get_mut(&id) {
                    n.key = key.clone();
                }
                let (prev_sib, next_sib) = self.sibling_position(p, e, &key);
                self.sibling_link_child(p, e, id, prev_sib, next_sib);
                if let Some(last) = last {
                    let anchor = self.chain_anchor_for_child(p, e, prev_sib);
                    self.chain_attach_segment(Some(anchor), id, last);
                }
            }
            _ => {
                self.sibling_unlink_root(id);
                self.root_count -= 1;
                if let Some(n) = self.nodes.get_mut(&id) {
                    n.key = key.clone();
                }
                let mut prev = None;
                let mut cursor = self.first_root;
                while let Some(c) = cursor {
                    if self.nodes[&c].key > key {
                        break;
                    }
                    prev = Some(c);
                    cursor = self.nodes[&c].next_sibling;
                }
                self.sibling_link_root(id, prev);
                self.root_count += 1;
                if let Some(last) = last {
                    let anchor = prev.map(|p| self.last_visible_descendant(p));
                    self.chain_attach_segment(anchor, id, last);
                }
            }
        }

        if visible {
            self.mark_dirty();
            self.ensure_indices();
            let new_flat = self.nodes[&id].flat_index;
            if new_flat != old_flat {
                self.events.push(TreeEvent::Moved {
                    id,
                    old_index: old_flat,
                    new_index: new_flat,
                });
            }
        }
        self.debug_validate();
    }

    // ------------------------------------------------------------------
    // Expansion
    // ------------------------------------------------------------------

    /// Marks `edge` expanded on `id`, linking its children (and their
    /// expanded descendants) into the visible chain when the node's own
    /// path is fully expanded. Idempotent.
    pub fn expand(&mut self, id: NodeId, edge: EdgeId) {
        let Some(node) = self.nodes.get(&id) else { return };
        if node.expanded.contains(&edge) {
            return;
        }
        self.ensure_indices();
        let children = self.children(id, edge);
        let delta: usize = children
            .iter()
            .map(|c| self.nodes[c].visible_count)
            .sum();
        if let Some(n) = self.nodes.get_mut(&id) {
            n.expanded.insert(edge);
            n.visible_count += delta;
        }
        let reached_root = self.propagate(id, isize_of(delta));
        if reached_root && delta > 0 {
            // Collect the buckets' visible subtrees in DFS order and link
            // them as one contiguous run right after the anchor.
            let mut run = Vec::with_capacity(delta);
            for &child in &children {
                self.visible_subtree(child, &mut run);
            }
            let anchor = self.chain_anchor_for_child(id, edge, None);
            let start = self.nodes[&anchor].flat_index + 1;
            self.chain_link_run(Some(anchor), &run);
            self.total_visible += delta;
            self.mark_dirty();
            self.events.push(TreeEvent::Inserted {
                first: run[0],
                start,
                count: delta,
                new_total: self.total_visible,
            });
        }
        self.debug_validate();
    }

    /// Unmarks `edge` on `id`, splicing its children's subtrees out of the
    /// chain. Nested expansion state inside the subtree is retained, so a
    /// later re-expand restores the deep shape. Idempotent.
    pub fn collapse(&mut self, id: NodeId, edge: EdgeId) {
        let Some(node) = self.nodes.get(&id) else { return };
        if !node.expanded.contains(&edge) {
            return;
        }
        self.ensure_indices();
        let children = self.children(id, edge);
        let delta: usize = children
            .iter()
            .map(|c| self.nodes[c].visible_count)
            .sum();
        let was_visible = self.path_visible(id);
        if let Some(n) = self.nodes.get_mut(&id) {
            n.expanded.remove(&edge);
            n.visible_count -= delta;
        }
        self.propagate(id, -(isize_of(delta)));
        if was_visible && delta > 0 {
            let first = children[0];
            let start = self.nodes[&first].flat_index;
            let ids = self.chain_unsplice(first, delta);
            self.total_visible -= delta;
            self.mark_dirty();
            self.events.push(TreeEvent::Removed {
                ids,
                start,
                count: delta,
                new_total: self.total_visible,
            });
        }
        self.debug_validate();
    }

    /// Expands when collapsed, collapses when expanded.
    pub fn toggle_expand(&mut self, id: NodeId, edge: EdgeId) {
        if self.is_expanded(id, edge) {
            self.collapse(id, edge);
        } else {
            self.expand(id, edge);
        }
    }

    /// Clears every expansion bit in the whole tree, collapsing to roots.
    pub fn collapse_all(&mut self) {
        let roots: Vec<NodeId> = self.roots();
        for root in roots {
            for edge in self.expanded_edges(root) {
                self.collapse(root, edge);
            }
            // Nested bits would survive a root-only collapse; clear them so
            // a later expand starts shallow. Legal here: every descendant
            // of the root is off the chain after the collapses above.
            for edge in self.bucket_edges(root) {
                self.clear_expansion_in_bucket(root, edge);
            }
        }
        self.debug_validate();
    }

    /// Clears expansion bits (and resets counts) in the subtrees of one
    /// collapsed bucket's children. Must not be called while the bucket is
    /// expanded on a visible path.
    pub fn clear_expansion_in_bucket(&mut self, id: NodeId, edge: EdgeId) {
        let mut stack: Vec<NodeId> = self
            .nodes
            .get(&id)
            .map(|_| self.children(id, edge))
            .unwrap_or_default();
        while let Some(cur) = stack.pop() {
            let Some(node) = self.nodes.get_mut(&cur) else { continue };
            node.expanded.clear();
            node.visible_count = 1;
            for edge in self.bucket_edges(cur) {
                stack.extend(self.children(cur, edge));
            }
        }
        self.debug_validate();
    }

    /// Edges with a (possibly empty) bucket on `id`, in creation order.
    fn bucket_edges(&self, id: NodeId) -> Vec<EdgeId> {
        self.nodes
            .get(&id)
            .map_or_else(Vec::new, |n| n.edge_order.clone())
    }

    /// Roots in sibling order.
    #[must_use]
    pub fn roots(&self) -> Vec<NodeId> {
        let mut out = Vec::with_capacity(self.root_count);
        let mut cursor = self.first_root;
        while let Some(id) = cursor {
            out.push(id);
            cursor = self.nodes.get(&id).and_then(|n| n.next_sibling);
        }
        out
    }

    // ------------------------------------------------------------------
    // Internals: visibility
    // ------------------------------------------------------------------

    /// Whether every edge on the node's ancestor path is expanded.
    fn path_visible(&self, id: NodeId) -> bool {
        let mut cursor = id;
        loop {
            let node = &self.nodes[&cursor];
            let Some(parent) = node.parent else {
                return true;
            };
            let Some(edge) = node.parent_edge else {
                return false;
            };
            if !self.nodes[&parent].expanded.contains(&edge) {
                return false;
            }
            cursor = parent;
        }
    }

    /// Adds `delta` to the visible counts of `start`'s ancestors along the
    /// expanded path. Returns `true` when the walk reaches a root, i.e.
    /// `start` itself is chain-visible.
    fn propagate(&mut self, start: NodeId, delta: isize) -> bool {
        let mut cursor = start;
        loop {
            let (parent, edge) = {
                let node = &self.nodes[&cursor];
                (node.parent, node.parent_edge)
            };
            let Some(parent) = parent else {
                return true;
            };
            let Some(edge) = edge else {
                return false;
            };
            let Some(pnode) = self.nodes.get_mut(&parent) else {
                return false;
            };
            if !pnode.expanded.contains(&edge) {
                return false;
            }
            pnode.visible_count = add_signed(pnode.visible_count, delta);
            cursor = parent;
        }
    }

    /// Last node of `id`'s visible subtree: `visible_count - 1` chain steps
    /// forward. Requires `id` to be on the chain (or a detached segment
    /// head).
    fn last_visible_descendant(&self, id: NodeId) -> NodeId {
        let mut cursor = id;
        for _ in 1..self.nodes[&id].visible_count {
            match self.nodes[&cursor].next_visible {
                Some(next) => cursor = next,
                None => break,
            }
        }
        cursor
    }

    /// DFS of `id`'s visible subtree (itself plus descendants through
    /// expanded buckets, in `edge_order`).
    fn visible_subtree(&self, id: NodeId, out: &mut Vec<NodeId>) {
        out.push(id);
        let node = &self.nodes[&id];
        for &edge in &node.edge_order {
            if !node.expanded.contains(&edge) {
                continue;
            }
            let mut cursor = node.edges.get(&edge).and_then(|b| b.first);
            while let Some(child) = cursor {
                self.visible_subtree(child, out);
                cursor = self.nodes[&child].next_sibling;
            }
        }
    }

    /// Chain node after which a (first-in-bucket or post-sibling) child of
    /// `parent` along `edge` belongs: the previous sibling's subtree end,
    /// else the end of the last earlier expanded bucket, else the parent.
    fn chain_anchor_for_child(
        &self,
        parent: NodeId,
        edge: EdgeId,
        prev_sibling: Option<NodeId>,
    ) -> NodeId {
        if let Some(ps) = prev_sibling {
            return self.last_visible_descendant(ps);
        }
        let mut anchor = parent;
        let pnode = &self.nodes[&parent];
        for &e in &pnode.edge_order {
            if e == edge {
                break;
            }
            if !pnode.expanded.contains(&e) {
                continue;
            }
            if let Some(last) = pnode.edges.get(&e).and_then(|b| b.last) {
                anchor = self.last_visible_descendant(last);
            }
        }
        anchor
    }

    // ------------------------------------------------------------------
    // Internals: chain surgery
    // ------------------------------------------------------------------

    /// Links `run` (currently unlinked nodes, in order) into the chain
    /// right after `anchor` (`None` = at the head).
    fn chain_link_run(&mut self, anchor: Option<NodeId>, run: &[NodeId]) {
        if run.is_empty() {
            return;
        }
        for pair in run.windows(2) {
            if let Some(n) = self.nodes.get_mut(&pair[0]) {
                n.next_visible = Some(pair[1]);
            }
            if let Some(n) = self.nodes.get_mut(&pair[1]) {
                n.prev_visible = Some(pair[0]);
            }
        }
        let first = run[0];
        let last = run[run.len() - 1];
        self.chain_attach_segment(anchor, first, last);
    }

    /// Attaches an internally linked segment `[first..=last]` after
    /// `anchor` (`None` = at the head).
    fn chain_attach_segment(&mut self, anchor: Option<NodeId>, first: NodeId, last: NodeId) {
        let next = match anchor {
            Some(a) => self.nodes[&a].next_visible,
            None => self.head,
        };
        match anchor {
            Some(a) => {
                if let Some(n) = self.nodes.get_mut(&a) {
                    n.next_visible = Some(first);
                }
            }
            None => self.head = Some(first),
        }
        if let Some(n) = self.nodes.get_mut(&first) {
            n.prev_visible = anchor;
        }
        if let Some(n) = self.nodes.get_mut(&last) {
            n.next_visible = next;
        }
        if let Some(nx) = next {
            if let Some(n) = self.nodes.get_mut(&nx) {
                n.prev_visible = Some(last);
            }
        }
    }

    /// Splices `count` nodes out of the chain starting at `first`, nulling
    /// every spliced node's chain links. Returns the spliced ids in order.
    fn chain_unsplice(&mut self, first: NodeId, count: usize) -> Vec<NodeId> {
        if count == 0 {
            return Vec::new();
        }
        let mut ids = Vec::with_capacity(count);
        let mut cursor = Some(first);
        for _ in 0..count {
            let Some(c) = cursor else { break };
            ids.push(c);
            cursor = self.nodes[&c].next_visible;
        }
        let prev = self.nodes[&first].prev_visible;
        let next = cursor;
        match prev {
            Some(p) => {
                if let Some(n) = self.nodes.get_mut(&p) {
                    n.next_visible = next;
                }
            }
            None => self.head = next,
        }
        if let Some(nx) = next {
            if let Some(n) = self.nodes.get_mut(&nx) {
                n.prev_visible = prev;
            }
        }
        for &id in &ids {
            if let Some(n) = self.nodes.get_mut(&id) {
                n.prev_visible = None;
                n.next_visible = None;
            }
        }
        ids
    }

    /// Detaches `count` nodes starting at `first`, keeping the segment's
    /// internal links. Returns the segment's last node.
    fn chain_detach_segment(&mut self, first: NodeId, count: usize) -> NodeId {
        let mut last = first;
        for _ in 1..count {
            if let Some(next) = self.nodes[&last].next_visible {
                last = next;
            }
        }
        let prev = self.nodes[&first].prev_visible;
        let next = self.nodes[&last].next_visible;
        match prev {
            Some(p) => {
                if let Some(n) = self.nodes.get_mut(&p) {
                    n.next_visible = next;
                }
            }
            None => self.head = next,
        }
        if let Some(nx) = next {
            if let Some(n) = self.nodes.get_mut(&nx) {
                n.prev_visible = prev;
            }
        }
        if let Some(n) = self.nodes.get_mut(&first) {
            n.prev_visible = None;
        }
        if let Some(n) = self.nodes.get_mut(&last) {
            n.next_visible = None;
        }
        last
    }

    // ------------------------------------------------------------------
    // Internals: sibling chains and the arena
    // ------------------------------------------------------------------

    fn sibling_link_root(&mut self, id: NodeId, prev: Option<NodeId>) {
        let next = match prev {
            Some(p) => self.nodes[&p].next_sibling,
            None => self.first_root,
        };
        if let Some(n) = self.nodes.get_mut(&id) {
            n.prev_sibling = prev;
            n.next_sibling = next;
        }
        match prev {
            Some(p) => {
                if let Some(n) = self.nodes.get_mut(&p) {
                    n.next_sibling = Some(id);
                }
            }
            None => self.first_root = Some(id),
        }
        match next {
            Some(nx) => {
                if let Some(n) = self.nodes.get_mut(&nx) {
                    n.prev_sibling = Some(id);
                }
            }
            None => self.last_root = Some(id),
        }
    }

    fn sibling_unlink_root(&mut self, id: NodeId) {
        let (prev, next) = {
            let n = &self.nodes[&id];
            (n.prev_sibling, n.next_sibling)
        };
        match prev {
            Some(p) => {
                if let Some(n) = self.nodes.get_mut(&p) {
                    n.next_sibling = next;
                }
            }
            None => self.first_root = next,
        }
        match next {
            Some(nx) => {
                if let Some(n) = self.nodes.get_mut(&nx) {
                    n.prev_sibling = prev;
                }
            }
            None => self.last_root = prev,
        }
        if let Some(n) = self.nodes.get_mut(&id) {
            n.prev_sibling = None;
            n.next_sibling = None;
        }
    }

    /// Sibling neighbors for a key-sorted insert into a bucket.
    fn sibling_position(
        &self,
        parent: NodeId,
        edge: EdgeId,
        key: &CompoundKey,
    ) -> (Option<NodeId>, Option<NodeId>) {
        let mut prev = None;
        let mut cursor = self
            .nodes
            .get(&parent)
            .and_then(|n| n.edges.get(&edge))
            .and_then(|b| b.first);
        while let Some(c) = cursor {
            if self.nodes[&c].key > *key {
                break;
            }
            prev = Some(c);
            cursor = self.nodes[&c].next_sibling;
        }
        (prev, cursor)
    }

    fn sibling_link_child(
        &mut self,
        parent: NodeId,
        edge: EdgeId,
        id: NodeId,
        prev: Option<NodeId>,
        next: Option<NodeId>,
    ) {
        if let Some(n) = self.nodes.get_mut(&id) {
            n.prev_sibling = prev;
            n.next_sibling = next;
        }
        if let Some(p) = prev {
            if let Some(n) = self.nodes.get_mut(&p) {
                n.next_sibling = Some(id);
            }
        }
        if let Some(nx) = next {
            if let Some(n) = self.nodes.get_mut(&nx) {
                n.prev_sibling = Some(id);
            }
        }
        if let Some(pnode) = self.nodes.get_mut(&parent) {
            if !pnode.edges.contains_key(&edge) {
                pnode.edge_order.push(edge);
            }
            let bucket = pnode.edges.entry(edge).or_default();
            bucket.count += 1;
            if prev.is_none() {
                bucket.first = Some(id);
            }
            if next.is_none() {
                bucket.last = Some(id);
            }
        }
    }

    fn sibling_unlink_child(&mut self, parent: NodeId, edge: EdgeId, id: NodeId) {
        let (prev, next) = {
            let n = &self.nodes[&id];
            (n.prev_sibling, n.next_sibling)
        };
        if let Some(p) = prev {
            if let Some(n) = self.nodes.get_mut(&p) {
                n.next_sibling = next;
            }
        }
        if let Some(nx) = next {
            if let Some(n) = self.nodes.get_mut(&nx) {
                n.prev_sibling = prev;
            }
        }
        if let Some(pnode) = self.nodes.get_mut(&parent) {
            if let Some(bucket) = pnode.edges.get_mut(&edge) {
                bucket.count -= 1;
                if bucket.first == Some(id) {
                    bucket.first = next;
                }
                if bucket.last == Some(id) {
                    bucket.last = prev;
                }
            }
        }
        if let Some(n) = self.nodes.get_mut(&id) {
            n.prev_sibling = None;
            n.next_sibling = None;
        }
    }

    /// Removes `id` and every descendant (visible or not) from the arena.
    fn remove_subtree_arena(&mut self, id: NodeId) {
        let mut stack = vec![id];
        while let Some(cur) = stack.pop() {
            if let Some(node) = self.nodes.remove(&cur) {
                for edge in &node.edge_order {
                    let mut cursor = node.edges.get(edge).and_then(|b| b.first);
                    while let Some(child) = cursor {
                        stack.push(child);
                        cursor = self.nodes.get(&child).and_then(|n| n.next_sibling);
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Internals: flat indices and validation
    // ------------------------------------------------------------------

    fn mark_dirty(&mut self) {
        self.indices_dirty = true;
    }

    /// Recomputes every cached flat index in one chain pass.
    fn ensure_indices(&mut self) {
        if !self.indices_dirty {
            return;
        }
        let ids: Vec<NodeId> = self.iter_visible().collect();
        for (i, id) in ids.into_iter().enumerate() {
            if let Some(n) = self.nodes.get_mut(&id) {
                n.flat_index = i;
            }
        }
        self.indices_dirty = false;
    }

    #[cfg(debug_assertions)]
    fn debug_validate(&self) {
        debug_assert!(
            self.validate().is_ok(),
            "tree invariant violated: {:?}",
            self.validate()
        );
    }

    #[cfg(not(debug_assertions))]
    fn debug_validate(&self) {}

    /// Checks every structural invariant; returns the first violation.
    pub fn validate(&self) -> Result<(), String> {
        // Root chain agrees with root_count; roots sum to total_visible.
        let roots = self.roots();
        if roots.len() != self.root_count {
            return Err(format!(
                "root chain length {} != root_count {}",
                roots.len(),
                self.root_count
            ));
        }
        let sum: usize = roots.iter().map(|r| self.nodes[r].visible_count).sum();
        if sum != self.total_visible {
            return Err(format!(
                "roots sum {sum} != total_visible {}",
                self.total_visible
            ));
        }

        // Per-node visible_count recursion.
        for (&id, node) in &self.nodes {
            let mut expected = 1;
            for (&edge, bucket) in &node.edges {
                if !node.expanded.contains(&edge) {
                    continue;
                }
                let mut cursor = bucket.first;
                while let Some(c) = cursor {
                    expected += self.nodes[&c].visible_count;
                    cursor = self.nodes[&c].next_sibling;
                }
            }
            if expected != node.visible_count {
                return Err(format!(
                    "visible_count of {id:?}: stored {} expected {expected}",
                    node.visible_count
                ));
            }
        }

        // Chain walk forward: length, membership, back links.
        let mut seen = 0;
        let mut prev: Option<NodeId> = None;
        let mut cursor = self.head;
        let mut last = None;
        while let Some(id) = cursor {
            let node = &self.nodes[&id];
            if node.prev_visible != prev {
                return Err(format!("chain back link broken at {id:?}"));
            }
            if !self.path_visible(id) {
                return Err(format!("invisible node {id:?} on chain"));
            }
            seen += 1;
            if seen > self.total_visible {
                return Err("chain longer than total_visible".to_owned());
            }
            prev = Some(id);
            last = Some(id);
            cursor = node.next_visible;
        }
        if seen != self.total_visible {
            return Err(format!(
                "chain length {seen} != total_visible {}",
                self.total_visible
            ));
        }
        // Backward walk must see the same count.
        let mut back = 0;
        let mut cursor = last;
        while let Some(id) = cursor {
            back += 1;
            cursor = self.nodes[&id].prev_visible;
        }
        if back != seen {
            return Err(format!("backward chain length {back} != forward {seen}"));
        }

        // Off-chain nodes must have null chain links.
        for (&id, node) in &self.nodes {
            if !self.path_visible(id)
                && (node.prev_visible.is_some() || node.next_visible.is_some())
            {
                return Err(format!("off-chain node {id:?} has chain links"));
            }
        }
        Ok(())
    }
}

const fn isize_of(v: usize) -> isize {
    #[allow(clippy::cast_possible_wrap)]
    {
        v as isize
    }
}

fn add_signed(base: usize, delta: isize) -> usize {
    #[allow(clippy::cast_sign_loss, clippy::cast_possible_wrap)]
    {
        (base as isize + delta) as usize
    }
}

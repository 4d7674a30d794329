// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The change tracker: per-subscription result maintenance under mutation.
//!
//! Every mutation on the database is translated here into an ordered list
//! of [`Action`]s: enters, leaves, repositions, in-place changes, and
//! node-watcher notifications. The dispatch loop in [`crate::db`] applies
//! them one at a time, releasing every internal borrow before each client
//! callback, which is what makes re-entrant mutation from callbacks legal.
//!
//! Ordering guarantees (per mutation):
//! - a delete's cascade unlinks precede the delete itself,
//! - *leave* on filter-fail precedes *enter* on filter-pass,
//! - *leave* is emitted before the node is removed (listeners can still
//!   inspect it), *enter* after insertion, *move* after repositioning,
//! - between mutations, callbacks are strictly serialized; no batching.

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, trace};

use crate::db::CoreState;
use crate::event::{Item, Listeners, NodeEvent, ViewEvent};
use crate::executor::{self, ReadCx};
use crate::ident::{EdgeId, NodeId, SubId, TypeId, ViewId};
use crate::key::CompoundKey;
use crate::plan::{select_index, IndexCoverage};
use crate::query::{EdgeSelection, Query, QueryError, SortSpec};
use crate::result_set::{ResultNode, ResultSet};
use crate::value::Value;

/// A record for a traversed-but-not-emitted (virtual) node.
#[derive(Debug)]
pub(crate) struct VirtualNode {
    /// Composite key prefix for this node's level (ancestors + own segment).
    pub key: CompoundKey,
    /// Visible-only ancestry (what surfaced descendants re-parent onto).
    pub ancestry: Vec<NodeId>,
    /// Full ancestry including virtual hops.
    pub virtual_ancestry: Vec<NodeId>,
    /// The edge by which its parent reached it (`None` for virtual roots).
    pub edge: Option<EdgeId>,
    /// The expanded edge on the nearest visible ancestor that surfaced
    /// this chain (the tree bucket its visible descendants land in).
    pub surface_edge: Option<EdgeId>,
}

/// One live subscription.
#[derive(Debug)]
pub(crate) struct SubState {
    pub query: Query,
    /// Chosen root scan plan; `None` when the root type has no indexes
    /// (unsorted queries fall back to a type scan in id order).
    pub coverage: Option<IndexCoverage>,
    pub result: ResultSet,
    /// Non-virtual root queries defer loading until first read.
    pub initialized: bool,
    /// Virtual nodes tracked for ancestry, keyed by node id.
    pub virtual_nodes: FxHashMap<NodeId, VirtualNode>,
    /// virtual id → tracked descendants whose keys embed its sort values.
    pub virtual_descendants: FxHashMap<NodeId, Vec<NodeId>>,
    /// Buckets whose children have been loaded: node → selection edges.
    pub loaded_edges: FxHashMap<NodeId, FxHashSet<EdgeId>>,
    /// Raw subscription listeners (used when no view is bound).
    pub listeners: Listeners<ViewEvent>,
    /// Bound view, if any.
    pub view: Option<ViewId>,
}

/// Registry of subscriptions, reverse indexes, and node watchers.
#[derive(Default)]
pub(crate) struct ChangeTracker {
    pub(crate) subs: FxHashMap<SubId, SubState>,
    pub(crate) next_sub: u32,
    /// Visible tracked node → subscriptions.
    pub(crate) node_to_subs: FxHashMap<NodeId, FxHashSet<SubId>>,
    /// Virtual tracked node → subscriptions.
    pub(crate) virtual_to_subs: FxHashMap<NodeId, FxHashSet<SubId>>,
    /// Single-node watchers.
    pub(crate) watchers: FxHashMap<NodeId, Listeners<NodeEvent>>,
}

impl std::fmt::Debug for ChangeTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeTracker")
            .field("subs", &self.subs.len())
            .field("tracked", &self.node_to_subs.len())
            .finish_non_exhaustive()
    }
}

/// One step of a mutation's dispatch plan.
#[derive(Debug)]
pub(crate) enum Action {
    /// Insert a node into a subscription's result (then emit *enter*).
    Enter {
        sub: SubId,
        id: NodeId,
        key: CompoundKey,
        ancestry: Vec<NodeId>,
        virtual_ancestry: Vec<NodeId>,
        edge: Option<EdgeId>,
        /// Tree bucket on the visible parent (differs from `edge` across
        /// virtual hops).
        surface_edge: Option<EdgeId>,
    },
    /// Emit *enter* for a node that is already registered in the result
    /// set (silent load that must now surface, e.g. descendants of a
    /// freshly linked virtual node).
    EnterLoaded { sub: SubId, id: NodeId },
    /// Emit *leave*, then remove the node from the subscription.
    Leave { sub: SubId, id: NodeId },
    /// Re-key and reposition (then emit *move* when the position changed).
    Reposition { sub: SubId, id: NodeId, key: CompoundKey },
    /// Emit *change* with old and new snapshots.
    Change { sub: SubId, id: NodeId, old: Item },
    /// Hybrid-mode *enter*/*leave* for a subscription that has not scanned
    /// yet: emitted with index 0 (position unknown), no state touched.
    Hybrid { sub: SubId, id: NodeId, enter: bool },
    /// Notify a node's watchers.
    Watch { node: NodeId, event: NodeEvent },
    /// Drop a node's watcher registration (after its delete fired).
    WatchDrop { node: NodeId },
}

impl ChangeTracker {
    /// Subscriptions whose root type is `ty`.
    fn subs_of_root(&self, ty: TypeId) -> Vec<SubId> {
        let mut out: Vec<SubId> = self
            .subs
            .iter()
            .filter(|(_, s)| s.query.root == ty)
            .map(|(&id, _)| id)
            .collect();
        out.sort_unstable();
        out
    }

    /// Subscriptions tracking `id`, visibly or virtually.
    fn subs_tracking(&self, id: NodeId) -> Vec<SubId> {
        let mut out: Vec<SubId> = self
            .node_to_subs
            .get(&id)
            .into_iter()
            .flatten()
            .chain(self.virtual_to_subs.get(&id).into_iter().flatten())
            .copied()
            .collect();
        out.sort_unstable();
        out.dedup();
        out
    }
}

impl CoreState {
    pub(crate) fn cx(&self) -> ReadCx<'_> {
        ReadCx {
            schema: &self.schema,
            store: &self.store,
            rollups: &self.rollups,
        }
    }

    // ==================================================================
    // Subscription lifecycle
    // ==================================================================

    /// Compiles and registers a subscription. Plan selection runs here so
    /// `NoIndexCovers` surfaces before anything is tracked.
    pub(crate) fn register_subscription(&mut self, query: Query) -> Result<SubId, QueryError> {
        let coverage = select_index(&self.schema, query.root, &query.filters, &query.sorts)?;
        let id = SubId(self.tracker.next_sub);
        self.tracker.next_sub += 1;
        let eager = query.is_virtual;
        self.tracker.subs.insert(
            id,
            SubState {
                query,
                coverage,
                result: ResultSet::new(),
                initialized: false,
                virtual_nodes: FxHashMap::default(),
                virtual_descendants: FxHashMap::default(),
                loaded_edges: FxHashMap::default(),
                listeners: Listeners::default(),
                view: None,
            },
        );
        debug!(sub = id.0, eager, "subscription registered");
        // Virtual root queries load eagerly so ancestry paths exist.
        if eager {
            self.ensure_initialized(id);
        }
        Ok(id)
    }

    /// Drops a subscription and every reverse-index entry pointing at it.
    pub(crate) fn unregister_subscription(&mut self, sub: SubId) {
        if self.tracker.subs.remove(&sub).is_none() {
            return;
        }
        self.tracker.node_to_subs.retain(|_, subs| {
            subs.remove(&sub);
            !subs.is_empty()
        });
        self.tracker.virtual_to_subs.retain(|_, subs| {
            subs.remove(&sub);
            !subs.is_empty()
        });
    }

    /// Scans the chosen plan and populates the subscription's roots. No
    /// events are emitted; initialization is observable only through
    /// `items()`/`total()`. Idempotent.
    pub(crate) fn ensure_initialized(&mut self, sub: SubId) {
        let Some(state) = self.tracker.subs.get(&sub) else { return };
        if state.initialized {
            return;
        }
        let query = state.query.clone();
        let coverage = state.coverage.clone();

        let roots: Vec<NodeId> = if let Some(id) = query.root_id {
            // Direct id lookup bypasses index scanning.
            self.store
                .node(id)
                .filter(|n| n.ty() == query.root)
                .filter(|n| executor::matches_filters(self.cx(), n, &query.filters))
                .map(|n| n.id())
                .into_iter()
                .collect()
        } else if let Some(coverage) = &coverage {
            self.indexes
                .scan(coverage, &query.filters)
                .into_iter()
                .filter(|&id| {
                    self.store
                        .node(id)
                        .is_some_and(|n| executor::matches_filters(self.cx(), n, &query.filters))
                })
                .collect()
        } else {
            self.store
                .nodes_of_type(query.root)
                .filter(|&id| {
                    self.store
                        .node(id)
                        .is_some_and(|n| executor::matches_filters(self.cx(), n, &query.filters))
                })
                .collect()
        };

        if let Some(state) = self.tracker.subs.get_mut(&sub) {
            state.initialized = true;
        }
        trace!(sub = sub.0, roots = roots.len(), "subscription initialized");

        for id in roots {
            let key = self.root_key(&query.sorts, id);
            if query.is_virtual {
                self.register_virtual(sub, id, key, Vec::new(), Vec::new(), None, None);
                let selections = query.selections.clone();
                for sel in &selections {
                    self.load_virtual_bucket(sub, id, sel, sel.edge);
                }
            } else {
                self.register_result(sub, id, key, Vec::new(), Vec::new(), None);
            }
        }
    }

    /// Loads one bucket's children for a tracked parent, registering them
    /// silently, and returns the surfaced `(child, key)` pairs in key
    /// order for the view's tree. Idempotent per (parent, edge).
    pub(crate) fn load_bucket(
        &mut self,
        sub: SubId,
        parent: NodeId,
        edge: EdgeId,
    ) -> Vec<(NodeId, CompoundKey)> {
        let Some(state) = self.tracker.subs.get(&sub) else {
            return Vec::new();
        };
        if state
            .loaded_edges
            .get(&parent)
            .is_some_and(|set| set.contains(&edge))
        {
            return Vec::new();
        }
        let Some(path) = self.edge_path_of(sub, parent) else {
            return Vec::new();
        };
        let Some(sel) = selection_for_child(&self.tracker.subs[&sub].query, &path, edge) else {
            return Vec::new();
        };
        let sel = sel.clone();
        if let Some(state) = self.tracker.subs.get_mut(&sub) {
            state.loaded_edges.entry(parent).or_default().insert(edge);
        }
        let mut out = Vec::new();
        self.load_selection_level(sub, parent, &sel, edge, &mut out);
        out.sort_by(|a, b| a.1.cmp(&b.1));
        out
    }

    /// Loads the children of `parent` along `sel`, surfacing visible ones
    /// under `surface_edge` and traversing virtual ones eagerly.
    fn load_selection_level(
        &mut self,
        sub: SubId,
        parent: NodeId,
        sel: &EdgeSelection,
        surface_edge: EdgeId,
        out: &mut Vec<(NodeId, CompoundKey)>,
    ) {
        let (parent_key, ancestry, virtual_ancestry) = match self.record_of(sub, parent) {
            Some(r) => r,
            None => return,
        };
        let mut full_path = virtual_ancestry.clone();
        full_path.push(parent);
        let parent_visible = self
            .tracker
            .subs
            .get(&sub)
            .is_some_and(|s| s.result.contains(parent));
        let mut child_anc = ancestry;
        if parent_visible {
            child_anc.push(parent);
        }
        let children = executor::load_children(self.cx(), parent, &full_path, sel);
        for child in children {
            let key = executor::level_key(self.cx(), &parent_key, &sel.sorts, child, self.max_key_len);
            let mut child_vanc = virtual_ancestry.clone();
            child_vanc.push(parent);
            if sel.is_virtual {
                // Virtual hop: descendants re-parent onto the nearest
                // visible ancestor chain.
                self.register_virtual(
                    sub,
                    child,
                    key,
                    child_anc.clone(),
                    child_vanc,
                    Some(sel.edge),
                    Some(surface_edge),
                );
                let nested = sel.child_selections().to_vec();
                for inner in &nested {
                    self.load_virtual_bucket(sub, child, inner, surface_edge);
                }
                // Surfaced descendants of this virtual child were registered
                // by the nested loads; fetch them into `out` as well.
                self.collect_surfaced(sub, child, out);
            } else {
                self.register_result(
                    sub,
                    child,
                    key.clone(),
                    child_anc.clone(),
                    child_vanc,
                    Some(sel.edge),
                );
                out.push((child, key));
            }
        }
    }

    /// Eagerly loads one selection bucket under a virtual node.
    fn load_virtual_bucket(
        &mut self,
        sub: SubId,
        parent: NodeId,
        sel: &EdgeSelection,
        surface_edge: EdgeId,
    ) {
        if let Some(state) = self.tracker.subs.get_mut(&sub) {
            state
                .loaded_edges
                .entry(parent)
                .or_default()
                .insert(sel.edge);
        }
        let mut scratch = Vec::new();
        self.load_selection_level(sub, parent, sel, surface_edge, &mut scratch);
        // Visible children registered under a virtual parent must surface
        // into the caller's tree bucket; they are picked up by
        // `collect_surfaced` (virtual roots surface via result scan).
    }

    /// Collects already-registered visible descendants surfaced through
    /// the virtual node `via` into `out` (any depth of virtual chain).
    fn collect_surfaced(&self, sub: SubId, via: NodeId, out: &mut Vec<(NodeId, CompoundKey)>) {
        let Some(state) = self.tracker.subs.get(&sub) else { return };
        if let Some(descendants) = state.virtual_descendants.get(&via) {
            for &id in descendants {
                if let Some(node) = state.result.get(id) {
                    if !out.iter().any(|(o, _)| *o == id) {
                        out.push((id, node.key.clone()));
                    }
                }
            }
        }
    }

    /// Key, visible ancestry, and virtual ancestry of a tracked node.
    fn record_of(&self, sub: SubId, id: NodeId) -> Option<(CompoundKey, Vec<NodeId>, Vec<NodeId>)> {
        let state = self.tracker.subs.get(&sub)?;
        if let Some(node) = state.result.get(id) {
            return Some((
                node.key.clone(),
                node.ancestry.clone(),
                node.virtual_ancestry.clone(),
            ));
        }
        state
            .virtual_nodes
            .get(&id)
            .map(|v| (v.key.clone(), v.ancestry.clone(), v.virtual_ancestry.clone()))
    }

    /// Edge ids from the query root down to `id` (empty for roots).
    fn edge_path_of(&self, sub: SubId, id: NodeId) -> Option<Vec<EdgeId>> {
        let state = self.tracker.subs.get(&sub)?;
        let (vanc, own_edge) = if let Some(n) = state.result.get(id) {
            (n.virtual_ancestry.clone(), n.edge)
        } else if let Some(v) = state.virtual_nodes.get(&id) {
            (v.virtual_ancestry.clone(), v.edge)
        } else {
            return None;
        };
        let mut path = Vec::with_capacity(vanc.len());
        for ancestor in vanc.iter().skip(1) {
            let edge = if let Some(n) = state.result.get(*ancestor) {
                n.edge
            } else {
                state.virtual_nodes.get(ancestor).and_then(|v| v.edge)
            };
            path.push(edge?);
        }
        if let Some(e) = own_edge {
            path.push(e);
        }
        Some(path)
    }

    /// Selection edges applying to children of a tracked node.
    pub(crate) fn child_edges_of(&self, sub: SubId, id: NodeId) -> Vec<EdgeId> {
        let Some(state) = self.tracker.subs.get(&sub) else {
            return Vec::new();
        };
        let Some(path) = self.edge_path_of(sub, id) else {
            return Vec::new();
        };
        level_selections(&state.query, &path)
            .map_or_else(Vec::new, |sels| sels.iter().map(|s| s.edge).collect())
    }

    /// The tree bucket (on the visible parent) a tracked node surfaces in.
    pub(crate) fn surface_edge_of(&self, sub: SubId, id: NodeId) -> Option<EdgeId> {
        let state = self.tracker.subs.get(&sub)?;
        let record = state.result.get(id)?;
        let last = record.virtual_ancestry.last()?;
        if state.result.contains(*last) {
            record.edge
        } else {
            state.virtual_nodes.get(last).and_then(|v| v.surface_edge)
        }
    }

    /// Builds a root-level key: the query's sort values plus the id tail.
    fn root_key(&self, sorts: &[SortSpec], id: NodeId) -> CompoundKey {
        executor::level_key(
            self.cx(),
            &CompoundKey::empty(),
            sorts,
            id,
            self.max_key_len,
        )
    }

    /// Registers a visible tracked node without emitting anything.
    pub(crate) fn register_result(
        &mut self,
        sub: SubId,
        id: NodeId,
        key: CompoundKey,
        ancestry: Vec<NodeId>,
        virtual_ancestry: Vec<NodeId>,
        edge: Option<EdgeId>,
    ) {
        let Some(state) = self.tracker.subs.get_mut(&sub) else { return };
        if let Some(existing) = state.result.get_mut(id) {
            existing.parent_count += 1;
            return;
        }
        state.result.insert(ResultNode::new(
            id,
            key,
            ancestry,
            virtual_ancestry.clone(),
            edge,
        ));
        for ancestor in &virtual_ancestry {
            if state.virtual_nodes.contains_key(ancestor) {
                state
                    .virtual_descendants
                    .entry(*ancestor)
                    .or_default()
                    .push(id);
            }
        }
        self.tracker.node_to_subs.entry(id).or_default().insert(sub);
    }

    /// Registers a virtual tracked node without emitting anything.
    #[allow(clippy::too_many_arguments)]
    fn register_virtual(
        &mut self,
        sub: SubId,
        id: NodeId,
        key: CompoundKey,
        ancestry: Vec<NodeId>,
        virtual_ancestry: Vec<NodeId>,
        edge: Option<EdgeId>,
        surface_edge: Option<EdgeId>,
    ) {
        let Some(state) = self.tracker.subs.get_mut(&sub) else { return };
        state.virtual_nodes.insert(
            id,
            VirtualNode {
                key,
                ancestry,
                virtual_ancestry,
                edge,
                surface_edge,
            },
        );
        self.tracker
            .virtual_to_subs
            .entry(id)
            .or_default()
            .insert(sub);
    }

    // ==================================================================
    // Mutation handlers → dispatch plans
    // ==================================================================

    /// Plan for a freshly inserted node.
    pub(crate) fn on_insert_actions(&mut self, id: NodeId) -> Vec<Action> {
        let Some(node) = self.store.node(id) else {
            return Vec::new();
        };
        let ty = node.ty();
        let mut actions = Vec::new();
        for sub in self.tracker.subs_of_root(ty) {
            let state = &self.tracker.subs[&sub];
            let query = &state.query;
            if query.root_id.is_some_and(|rid| rid != id) {
                continue;
            }
            let Some(node) = self.store.node(id) else { continue };
            if !executor::matches_filters(self.cx(), node, &query.filters) {
                continue;
            }
            if !state.initialized {
                // Hybrid reactivity: position unknown, index 0.
                actions.push(Action::Hybrid { sub, id, enter: true });
                continue;
            }
            if query.is_virtual {
                let key = self.root_key(&state_sorts(self, sub), id);
                self.register_virtual(sub, id, key, Vec::new(), Vec::new(), None, None);
                let selections = self.tracker.subs[&sub].query.selections.clone();
                for sel in &selections {
                    self.load_virtual_bucket(sub, id, sel, sel.edge);
                }
                continue;
            }
            let key = self.root_key(&state_sorts(self, sub), id);
            actions.push(Action::Enter {
                sub,
                id,
                key,
                ancestry: Vec::new(),
                virtual_ancestry: Vec::new(),
                edge: None,
                surface_edge: None,
            });
        }
        actions
    }

    /// Plan for a property (or rollup) change. `changed` maps field names
    /// to their pre-image values.
    pub(crate) fn on_update_actions(
        &mut self,
        id: NodeId,
        changed: &FxHashMap<String, Value>,
    ) -> Vec<Action> {
        let Some(node) = self.store.node(id) else {
            return Vec::new();
        };
        let ty = node.ty();
        let mut actions = Vec::new();

        if self.tracker.watchers.contains_key(&id) {
            let mut names: Vec<String> = changed.keys().cloned().collect();
            names.sort_unstable();
            actions.push(Action::Watch {
                node: id,
                event: NodeEvent::Change { changed: names },
            });
        }

        // Fast path: subscriptions where the node is loaded.
        for sub in self.tracker.subs_tracking(id) {
            let Some(state) = self.tracker.subs.get(&sub) else { continue };
            if state.virtual_nodes.contains_key(&id) {
                self.revisit_virtual(sub, id, &mut actions);
                continue;
            }
            let Some(record) = state.result.get(id) else { continue };
            let filters = match self.level_filters(sub, id) {
                Some(f) => f,
                None => continue,
            };
            let Some(node) = self.store.node(id) else { continue };
            let still_matches = executor::matches_filters(self.cx(), node, &filters);
            if !still_matches {
                // The node's loaded subtree goes with it, deepest first.
                let mut subtree = self.loaded_subtree(sub, id);
                subtree.reverse();
                for member in subtree {
                    actions.push(Action::Leave { sub, id: member });
                }
                actions.push(Action::Leave { sub, id });
                continue;
            }
            let new_key = self.recompute_key(sub, id);
            if new_key != record.key {
                // Write the key eagerly so descendant prefixes read the
                // fresh ancestor chain; the dispatch step re-sorts.
                if let Some(state) = self.tracker.subs.get_mut(&sub) {
                    if let Some(r) = state.result.get_mut(id) {
                        r.key = new_key.clone();
                    }
                }
                actions.push(Action::Reposition { sub, id, key: new_key });
                self.refresh_virtual_descendant_keys(sub, id);
                self.descendant_repositions(sub, id, &mut actions);
            } else if let Some(old) = self.pre_image_item(id, changed) {
                actions.push(Action::Change { sub, id, old });
            }
        }

        // Slow path: type-level transitions for subscriptions that do not
        // have the node loaded.
        for sub in self.tracker.subs_of_root(ty) {
            let Some(state) = self.tracker.subs.get(&sub) else { continue };
            if state.result.contains(id) || state.virtual_nodes.contains_key(&id) {
                continue;
            }
            let query = &state.query;
            if query.root_id.is_some_and(|rid| rid != id) {
                continue;
            }
            let Some(node) = self.store.node(id) else { continue };
            let matched_before =
                executor::matches_filters_with(self.cx(), node, &query.filters, changed);
            let matches_now = executor::matches_filters(self.cx(), node, &query.filters);
            match (state.initialized, matched_before, matches_now) {
                (true, false, true) => {
                    let key = self.root_key(&state_sorts(self, sub), id);
                    actions.push(Action::Enter {
                        sub,
                        id,
                        key,
                        ancestry: Vec::new(),
                        virtual_ancestry: Vec::new(),
                        edge: None,
                        surface_edge: None,
                    });
                }
                (false, false, true) => actions.push(Action::Hybrid { sub, id, enter: true }),
                (false, true, false) => actions.push(Action::Hybrid { sub, id, enter: false }),
                _ => {}
            }
        }
        actions
    }

    /// A virtual ancestor's sort inputs changed: refresh its key and
    /// reposition every affected descendant.
    fn revisit_virtual(&mut self, sub: SubId, id: NodeId, actions: &mut Vec<Action>) {
        let new_key = self.recompute_key(sub, id);
        let changed = {
            let Some(state) = self.tracker.subs.get_mut(&sub) else { return };
            let Some(vn) = state.virtual_nodes.get_mut(&id) else { return };
            if vn.key == new_key {
                false
            } else {
                vn.key = new_key;
                true
            }
        };
        if changed {
            self.refresh_virtual_descendant_keys(sub, id);
            self.descendant_repositions(sub, id, actions);
        }
    }

    /// Rewrites the cached keys of virtual nodes below `id`, parents
    /// first, so later recomputations read fresh prefixes.
    fn refresh_virtual_descendant_keys(&mut self, sub: SubId, id: NodeId) {
        let Some(state) = self.tracker.subs.get(&sub) else { return };
        let mut vids: Vec<(usize, NodeId)> = state
            .virtual_nodes
            .iter()
            .filter(|(_, v)| v.virtual_ancestry.contains(&id))
            .map(|(&vid, v)| (v.virtual_ancestry.len(), vid))
            .collect();
        vids.sort_unstable();
        for (_, vid) in vids {
            let key = self.recompute_key(sub, vid);
            if let Some(state) = self.tracker.subs.get_mut(&sub) {
                if let Some(v) = state.virtual_nodes.get_mut(&vid) {
                    v.key = key;
                }
            }
        }
    }

    /// Repositions for every tracked descendant whose key prefix embeds
    /// `id`'s sort values. The virtual-descendants map serves virtual
    /// ancestors in O(affected); visible ancestors fall back to a result
    /// scan.
    fn descendant_repositions(&mut self, sub: SubId, id: NodeId, actions: &mut Vec<Action>) {
        let Some(state) = self.tracker.subs.get(&sub) else { return };
        let mut affected: Vec<NodeId> = if let Some(list) = state.virtual_descendants.get(&id) {
            list.clone()
        } else {
            state
                .result
                .iter()
                .filter(|&n| {
                    state
                        .result
                        .get(n)
                        .is_some_and(|r| r.virtual_ancestry.contains(&id))
                })
                .collect()
        };
        // Parents first, so each level's prefix is fresh when its children
        // recompute.
        affected.sort_by_key(|n| {
            self.tracker.subs[&sub]
                .result
                .get(*n)
                .map_or(0, |r| r.virtual_ancestry.len())
        });
        for desc in affected {
            let new_key = self.recompute_key(sub, desc);
            let stale = self.tracker.subs[&sub]
                .result
                .get(desc)
                .is_some_and(|r| r.key != new_key);
            if stale {
                if let Some(state) = self.tracker.subs.get_mut(&sub) {
                    if let Some(r) = state.result.get_mut(desc) {
                        r.key = new_key.clone();
                    }
                }
                actions.push(Action::Reposition { sub, id: desc, key: new_key });
            }
        }
    }

    /// Recomputes a tracked node's composite key from its live ancestor
    /// chain.
    fn recompute_key(&self, sub: SubId, id: NodeId) -> CompoundKey {
        let Some(state) = self.tracker.subs.get(&sub) else {
            return CompoundKey::empty();
        };
        let vanc = if let Some(r) = state.result.get(id) {
            r.virtual_ancestry.clone()
        } else if let Some(v) = state.virtual_nodes.get(&id) {
            v.virtual_ancestry.clone()
        } else {
            return CompoundKey::empty();
        };
        let (prefix, sorts) = match vanc.last() {
            None => (CompoundKey::empty(), state.query.sorts.clone()),
            Some(parent) => {
                let prefix = self
                    .record_of(sub, *parent)
                    .map_or_else(CompoundKey::empty, |(k, _, _)| k);
                let sorts = self
                    .edge_path_of(sub, id)
                    .and_then(|path| selection_at(&state.query, &path))
                    .map_or_else(Vec::new, |sel| sel.sorts.clone());
                (prefix, sorts)
            }
        };
        executor::level_key(self.cx(), &prefix, &sorts, id, self.max_key_len)
    }

    /// Filters governing `id`'s level in `sub` (query filters for roots,
    /// selection filters below).
    fn level_filters(&self, sub: SubId, id: NodeId) -> Option<Vec<crate::query::Filter>> {
        let state = self.tracker.subs.get(&sub)?;
        let path = self.edge_path_of(sub, id)?;
        if path.is_empty() {
            Some(state.query.filters.clone())
        } else {
            selection_at(&state.query, &path).map(|sel| sel.filters.clone())
        }
    }

    /// Materializes the node as it looked before `changed` applied.
    fn pre_image_item(&self, id: NodeId, changed: &FxHashMap<String, Value>) -> Option<Item> {
        let mut item = executor::materialize(self.cx(), id, 0, Vec::new())?;
        for (name, old) in changed {
            if old.is_null() {
                item.props.remove(name);
            } else {
                item.props.insert(name.clone(), old.clone());
            }
        }
        Some(item)
    }

    /// Plan for a node about to be deleted (cascade unlinks have already
    /// run; the node is still in the store).
    pub(crate) fn on_delete_actions(&mut self, id: NodeId) -> Vec<Action> {
        let Some(node) = self.store.node(id) else {
            return Vec::new();
        };
        let ty = node.ty();
        let mut actions = Vec::new();
        for sub in self.tracker.subs_tracking(id) {
            let Some(state) = self.tracker.subs.get(&sub) else { continue };
            if state.result.contains(id) {
                // Loaded descendants leave first (deepest first), then the
                // node itself.
                let mut subtree = self.loaded_subtree(sub, id);
                subtree.reverse();
                for member in subtree {
                    actions.push(Action::Leave { sub, id: member });
                }
                actions.push(Action::Leave { sub, id });
            } else if state.virtual_nodes.contains_key(&id) {
                let mut subtree = self.loaded_subtree(sub, id);
                subtree.reverse();
                for member in subtree {
                    actions.push(Action::Leave { sub, id: member });
                }
                actions.push(Action::Leave { sub, id });
            }
        }
        // Uninitialized subscriptions with a matching root type see a
        // hybrid leave when the node matched their filters.
        for sub in self.tracker.subs_of_root(ty) {
            let Some(state) = self.tracker.subs.get(&sub) else { continue };
            if state.initialized || state.query.root_id.is_some_and(|rid| rid != id) {
                continue;
            }
            let Some(node) = self.store.node(id) else { continue };
            if executor::matches_filters(self.cx(), node, &state.query.filters) {
                actions.push(Action::Hybrid { sub, id, enter: false });
            }
        }
        if self.tracker.watchers.contains_key(&id) {
            actions.push(Action::Watch {
                node: id,
                event: NodeEvent::Delete,
            });
            actions.push(Action::WatchDrop { node: id });
        }
        actions
    }

    /// Tracked nodes below `id` in `sub`, shallowest first, excluding `id`.
    fn loaded_subtree(&self, sub: SubId, id: NodeId) -> Vec<NodeId> {
        let Some(state) = self.tracker.subs.get(&sub) else {
            return Vec::new();
        };
        let mut members: Vec<(usize, NodeId)> = state
            .result
            .iter()
            .filter_map(|n| {
                let r = state.result.get(n)?;
                r.virtual_ancestry
                    .contains(&id)
                    .then_some((r.virtual_ancestry.len(), n))
            })
            .collect();
        for (&vid, vn) in &state.virtual_nodes {
            if vn.virtual_ancestry.contains(&id) {
                members.push((vn.virtual_ancestry.len(), vid));
            }
        }
        members.sort_by_key(|&(depth, n)| (depth, n));
        members.into_iter().map(|(_, n)| n).collect()
    }

    /// Plan for a new link `src --edge--> tgt` (both directions are
    /// considered, since the reverse edge is equally real).
    pub(crate) fn on_link_actions(&mut self, src: NodeId, edge: EdgeId, tgt: NodeId) -> Vec<Action> {
        let mut actions = Vec::new();
        let reverse = self.schema.edge(edge).reverse;
        if self.tracker.watchers.contains_key(&src) {
            actions.push(Action::Watch {
                node: src,
                event: NodeEvent::Link {
                    edge: self.schema.edge(edge).name.clone(),
                    target: tgt,
                },
            });
        }
        if self.tracker.watchers.contains_key(&tgt) {
            actions.push(Action::Watch {
                node: tgt,
                event: NodeEvent::Link {
                    edge: self.schema.edge(reverse).name.clone(),
                    target: src,
                },
            });
        }
        self.link_direction(src, edge, tgt, &mut actions);
        self.link_direction(tgt, reverse, src, &mut actions);
        actions
    }

    /// Handles one direction of a link: `parent` gained `child` along
    /// `edge`.
    fn link_direction(
        &mut self,
        parent: NodeId,
        edge: EdgeId,
        child: NodeId,
        actions: &mut Vec<Action>,
    ) {
        for sub in self.tracker.subs_tracking(parent) {
            let Some(state) = self.tracker.subs.get(&sub) else { continue };
            // Only loaded buckets react; unloaded ones pick the child up on
            // expansion.
            if !state
                .loaded_edges
                .get(&parent)
                .is_some_and(|set| set.contains(&edge))
            {
                continue;
            }
            let Some(path) = self.edge_path_of(sub, parent) else { continue };
            let Some(sel) =
                selection_for_child(&self.tracker.subs[&sub].query, &path, edge).cloned()
            else {
                continue;
            };
            let Some(child_node) = self.store.node(child) else { continue };
            if !executor::matches_filters(self.cx(), child_node, &sel.filters) {
                continue;
            }
            let Some((parent_key, parent_anc, parent_vanc)) = self.record_of(sub, parent) else {
                continue;
            };
            // Cycle guard along the current path.
            if parent_vanc.contains(&child) || child == parent {
                continue;
            }
            let key =
                executor::level_key(self.cx(), &parent_key, &sel.sorts, child, self.max_key_len);
            let mut vanc = parent_vanc;
            vanc.push(parent);
            let parent_visible = self.tracker.subs[&sub].result.contains(parent);
            let mut ancestry = parent_anc;
            if parent_visible {
                ancestry.push(parent);
            }
            let surface_edge = if parent_visible {
                Some(edge)
            } else {
                self.tracker.subs[&sub]
                    .virtual_nodes
                    .get(&parent)
                    .and_then(|v| v.surface_edge)
            };
            if sel.is_virtual {
                self.register_virtual(
                    sub,
                    child,
                    key,
                    ancestry,
                    vanc,
                    Some(sel.edge),
                    surface_edge,
                );
                let nested = sel.child_selections().to_vec();
                for inner in &nested {
                    self.load_virtual_bucket(sub, child, inner, surface_edge.unwrap_or(edge));
                }
                // Freshly surfaced visible descendants enter.
                let mut surfaced = Vec::new();
                self.collect_surfaced(sub, child, &mut surfaced);
                for (sid, _) in surfaced {
                    actions.push(Action::EnterLoaded { sub, id: sid });
                }
            } else {
                actions.push(Action::Enter {
                    sub,
                    id: child,
                    key,
                    ancestry,
                    virtual_ancestry: vanc,
                    edge: Some(sel.edge),
                    surface_edge,
                });
            }
        }
    }

    /// Plan for removing the link `src --edge--> tgt`.
    pub(crate) fn on_unlink_actions(
        &mut self,
        src: NodeId,
        edge: EdgeId,
        tgt: NodeId,
    ) -> Vec<Action> {
        let mut actions = Vec::new();
        let reverse = self.schema.edge(edge).reverse;
        if self.tracker.watchers.contains_key(&src) {
            actions.push(Action::Watch {
                node: src,
                event: NodeEvent::Unlink {
                    edge: self.schema.edge(edge).name.clone(),
                    target: tgt,
                },
            });
        }
        if self.tracker.watchers.contains_key(&tgt) {
            actions.push(Action::Watch {
                node: tgt,
                event: NodeEvent::Unlink {
                    edge: self.schema.edge(reverse).name.clone(),
                    target: src,
                },
            });
        }
        self.unlink_direction(src, edge, tgt, &mut actions);
        self.unlink_direction(tgt, reverse, src, &mut actions);
        actions
    }

    fn unlink_direction(
        &mut self,
        parent: NodeId,
        edge: EdgeId,
        child: NodeId,
        actions: &mut Vec<Action>,
    ) {
        for sub in self.tracker.subs_tracking(parent) {
            let Some(state) = self.tracker.subs.get(&sub) else { continue };
            if !state
                .loaded_edges
                .get(&parent)
                .is_some_and(|set| set.contains(&edge))
            {
                continue;
            }
            // The child must have been reached through this parent.
            let reached_here = state
                .result
                .get(child)
                .map(|r| r.virtual_ancestry.last() == Some(&parent))
                .or_else(|| {
                    state
                        .virtual_nodes
                        .get(&child)
                        .map(|v| v.virtual_ancestry.last() == Some(&parent))
                })
                .unwrap_or(false);
            if !reached_here {
                // DAG multi-parent: an unlink from a secondary parent only
                // decrements the count.
                if let Some(state) = self.tracker.subs.get_mut(&sub) {
                    if let Some(r) = state.result.get_mut(child) {
                        if r.parent_count > 1 {
                            r.parent_count -= 1;
                        }
                    }
                }
                continue;
            }
            let last_parent = state
                .result
                .get(child)
                .is_none_or(|r| r.parent_count <= 1);
            if !last_parent {
                if let Some(state) = self.tracker.subs.get_mut(&sub) {
                    if let Some(r) = state.result.get_mut(child) {
                        r.parent_count -= 1;
                    }
                }
                continue;
            }
            let mut subtree = self.loaded_subtree(sub, child);
            subtree.reverse();
            for member in subtree {
                actions.push(Action::Leave { sub, id: member });
            }
            actions.push(Action::Leave { sub, id: child });
        }
    }
}

/// Sorts of a subscription's root level.
fn state_sorts(core: &CoreState, sub: SubId) -> Vec<SortSpec> {
    core.tracker.subs[&sub].query.sorts.clone()
}

/// Resolves the selection reached by walking `path` from the root, then
/// taking the child selection along `edge` (honoring recursion).
fn selection_for_child<'q>(
    query: &'q Query,
    path: &[EdgeId],
    edge: EdgeId,
) -> Option<&'q EdgeSelection> {
    let level = level_selections(query, path)?;
    level.iter().find(|s| s.edge == edge)
}

/// Resolves the selection a node at `path` was produced by.
fn selection_at<'q>(query: &'q Query, path: &[EdgeId]) -> Option<&'q EdgeSelection> {
    let (last, prefix) = path.split_last()?;
    let level = level_selections(query, prefix)?;
    level.iter().find(|s| s.edge == *last)
}

/// The selections applying to children of a node reached via `path`.
fn level_selections<'q>(query: &'q Query, path: &[EdgeId]) -> Option<&'q [EdgeSelection]> {
    let mut level: &[EdgeSelection] = &query.selections;
    for edge in path {
        let sel = level.iter().find(|s| s.edge == *edge)?;
        level = sel.child_selections();
    }
    Some(level)
}

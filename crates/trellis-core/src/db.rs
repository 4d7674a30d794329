// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The database facade: schema, store, indexes, rollups, tracker, and
//! views behind one shared handle.
//!
//! Concurrency model: single-threaded cooperative. All state lives behind
//! one `Rc<RefCell<…>>`; every mutation runs as a sequence of short borrow
//! scopes, and **no borrow is held while a client callback runs**. A
//! callback may therefore re-enter the database and mutate freely — the
//! nested mutation applies immediately and its events are observed
//! recursively, bounded by the mutation's own fan-out. Every post-callback
//! step re-checks presence, so a callback deleting the very node being
//! processed is tolerated.
//!
//! Failure atomicity: every public mutation pre-validates against the
//! store before touching anything, so an error leaves store, indexes,
//! rollups, and subscriptions unchanged.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::event::{Item, Listeners, NodeEvent, ViewEvent};
use crate::executor;
use crate::ident::{EdgeId, NodeId, SubId, ViewId};
use crate::index::IndexManager;
use crate::key::{CompoundKey, DEFAULT_MAX_KEY_LEN};
use crate::node::NodeRef;
use crate::query::{Query, QueryError, QueryInput};
use crate::result_set::ResultNode;
use crate::rollup::RollupCache;
use crate::schema::{Schema, SchemaError, SchemaInput};
use crate::store::{NodeStore, NodeStoreError};
use crate::tracker::{Action, ChangeTracker};
use crate::value::Value;
use crate::view::{view_load, View, ViewOptions, ViewState};
use crate::viewport::Viewport;

/// The core's single-owner state. Everything mutable lives here; the
/// public handles ([`Database`], [`View`], [`Subscription`],
/// [`NodeWatch`]) share it through one `Rc<RefCell<…>>`.
#[derive(Debug)]
pub(crate) struct CoreState {
    pub(crate) schema: Arc<Schema>,
    pub(crate) max_key_len: usize,
    pub(crate) store: NodeStore,
    pub(crate) indexes: IndexManager,
    pub(crate) rollups: RollupCache,
    pub(crate) tracker: ChangeTracker,
    pub(crate) views: FxHashMap<ViewId, ViewState>,
    pub(crate) next_view: u32,
}

/// Fluent builder for [`Database`] instances.
///
/// # Example
///
/// ```ignore
/// let db = Database::builder(schema_input).max_key_len(128).build()?;
/// ```
pub struct DatabaseBuilder {
    input: SchemaInput,
    max_key_len: usize,
}

impl DatabaseBuilder {
    /// Overrides the composite-key length bound (mostly for tests that
    /// exercise truncation).
    #[must_use]
    pub fn max_key_len(mut self, max_key_len: usize) -> Self {
        self.max_key_len = max_key_len;
        self
    }

    /// Resolves the schema and builds the database.
    pub fn build(self) -> Result<Database, SchemaError> {
        let schema = Arc::new(Schema::resolve(&self.input)?);
        let store = NodeStore::new(Arc::clone(&schema));
        let indexes = IndexManager::new(Arc::clone(&schema), self.max_key_len);
        Ok(Database {
            core: Rc::new(RefCell::new(CoreState {
                schema,
                max_key_len: self.max_key_len,
                store,
                indexes,
                rollups: RollupCache::new(),
                tracker: ChangeTracker::default(),
                views: FxHashMap::default(),
                next_view: 0,
            })),
        })
    }
}

/// An in-memory, schema-driven reactive graph database.
///
/// Cloning is cheap; all clones address the same database.
#[derive(Clone)]
pub struct Database {
    core: Rc<RefCell<CoreState>>,
}

impl Database {
    /// Builds a database from an input schema with default settings.
    pub fn new(input: SchemaInput) -> Result<Self, SchemaError> {
        Self::builder(input).build()
    }

    /// Starts a builder.
    #[must_use]
    pub fn builder(input: SchemaInput) -> DatabaseBuilder {
        DatabaseBuilder {
            input,
            max_key_len: DEFAULT_MAX_KEY_LEN,
        }
    }

    /// Number of live nodes.
    #[must_use]
    pub fn count(&self) -> usize {
        self.core.borrow().store.count()
    }

    /// An owned snapshot of a node (properties plus rollups).
    #[must_use]
    pub fn get(&self, id: NodeId) -> Option<Item> {
        let core = self.core.borrow();
        executor::materialize(core.cx(), id, 0, Vec::new())
    }

    /// Targets of an edge, in the edge's maintained order.
    pub fn edge_targets(&self, id: NodeId, edge_name: &str) -> Result<Vec<NodeId>, NodeStoreError> {
        let core = self.core.borrow();
        let node = core.store.node(id).ok_or(NodeStoreError::NodeNotFound(id))?;
        let def = core.schema.type_def(node.ty());
        let edge = def
            .edge_id(edge_name)
            .ok_or_else(|| NodeStoreError::UnknownEdge {
                type_name: def.name.clone(),
                edge: edge_name.to_owned(),
            })?;
        Ok(node.targets(edge).to_vec())
    }

    /// Creates a node of the named type. Properties start unset (null).
    pub fn insert(&self, type_name: &str) -> Result<NodeId, NodeStoreError> {
        let (id, actions) = {
            let mut core = self.core.borrow_mut();
            core.apply_insert(type_name)?
        };
        self.run_actions(actions);
        Ok(id)
    }

    /// Writes properties. Unchanged values are ignored; writing `Null`
    /// unsets.
    pub fn update<S: Into<String>>(
        &self,
        id: NodeId,
        props: impl IntoIterator<Item = (S, Value)>,
    ) -> Result<(), NodeStoreError> {
        let props: Vec<(String, Value)> = props.into_iter().map(|(k, v)| (k.into(), v)).collect();
        let actions = {
            let mut core = self.core.borrow_mut();
            core.apply_update(id, props)?
        };
        self.run_actions(actions);
        Ok(())
    }

    /// Links `src --edge--> tgt` (and the reverse edge with it). Linking
    /// an already-linked pair is a no-op.
    pub fn link(&self, src: NodeId, edge_name: &str, tgt: NodeId) -> Result<(), NodeStoreError> {
        let actions = {
            let mut core = self.core.borrow_mut();
            core.apply_link(src, edge_name, tgt)?
        };
        self.run_actions(actions);
        Ok(())
    }

    /// Removes the link `src --edge--> tgt` (and its reverse).
    pub fn unlink(&self, src: NodeId, edge_name: &str, tgt: NodeId) -> Result<(), NodeStoreError> {
        let actions = {
            let mut core = self.core.borrow_mut();
            let edge = core.resolve_edge(src, edge_name)?;
            if !core
                .store
                .node(src)
                .is_some_and(|n| n.targets(edge).contains(&tgt))
            {
                return Err(NodeStoreError::EdgeTargetNotFound {
                    edge: edge_name.to_owned(),
                    target: tgt,
                });
            }
            core.apply_unlink(src, edge, tgt)
        };
        self.run_actions(actions);
        Ok(())
    }

    /// Deletes a node: every edge (both directions) is unlinked first,
    /// with per-edge unlink events, then the node itself leaves.
    pub fn delete(&self, id: NodeId) -> Result<(), NodeStoreError> {
        let links: Vec<(EdgeId, NodeId)> = {
            let core = self.core.borrow();
            let node = core.store.node(id).ok_or(NodeStoreError::NodeNotFound(id))?;
            let mut links: Vec<(EdgeId, NodeId)> = node
                .targets
                .iter()
                .flat_map(|(&e, ts)| ts.iter().map(move |&t| (e, t)))
                .collect();
            links.sort_unstable();
            links
        };
        debug!(node = id.get(), links = links.len(), "delete cascade");
        for (edge, tgt) in links {
            let actions = {
                let mut core = self.core.borrow_mut();
                // Re-check: a re-entrant callback may have unlinked it.
                if core
                    .store
                    .node(id)
                    .is_some_and(|n| n.targets(edge).contains(&tgt))
                {
                    core.apply_unlink(id, edge, tgt)
                } else {
                    Vec::new()
                }
            };
            self.run_actions(actions);
        }
        let actions = {
            let mut core = self.core.borrow_mut();
            if core.store.node(id).is_none() {
                return Ok(());
            }
            core.on_delete_actions(id)
        };
        self.run_actions(actions);
        let mut core = self.core.borrow_mut();
        core.finalize_delete(id);
        Ok(())
    }

    /// Registers a raw subscription (no tree, no viewport). Result order
    /// follows the query's composite keys.
    pub fn subscribe(&self, input: &QueryInput) -> Result<Subscription, QueryError> {
        let id = {
            let mut core = self.core.borrow_mut();
            let query = Query::compile(&core.schema, input)?;
            core.register_subscription(query)?
        };
        Ok(Subscription {
            core: Rc::clone(&self.core),
            id,
        })
    }

    /// Opens a live view over a query.
    pub fn view(&self, input: &QueryInput, options: ViewOptions) -> Result<View, QueryError> {
        let id = {
            let mut core = self.core.borrow_mut();
            let query = Query::compile(&core.schema, input)?;
            let sub = core.register_subscription(query)?;
            let id = ViewId(core.next_view);
            core.next_view += 1;
            core.views.insert(
                id,
                ViewState {
                    sub,
                    tree: crate::tree::ReactiveTree::new(),
                    viewport: Viewport::new(usize::try_from(options.limit).unwrap_or(usize::MAX)),
                    expanded_nodes: FxHashMap::default(),
                    options,
                    listeners: Listeners::default(),
                    loaded: false,
                },
            );
            if let Some(state) = core.tracker.subs.get_mut(&sub) {
                state.view = Some(id);
            }
            if options.immediate {
                view_load(&mut core, id);
            }
            id
        };
        Ok(View {
            core: Rc::clone(&self.core),
            id,
        })
    }

    /// Watches a single node for link/unlink/change/delete.
    pub fn watch_node(&self, id: NodeId) -> Result<NodeWatch, NodeStoreError> {
        let core = self.core.borrow();
        if core.store.node(id).is_none() {
            return Err(NodeStoreError::NodeNotFound(id));
        }
        drop(core);
        Ok(NodeWatch {
            core: Rc::clone(&self.core),
            node: id,
        })
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Applies a mutation's dispatch plan, one action at a time, releasing
    /// the core borrow before every client callback.
    fn run_actions(&self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Enter {
                    sub,
                    id,
                    key,
                    ancestry,
                    virtual_ancestry,
                    edge,
                    surface_edge,
                } => {
                    let emit = self.core.borrow_mut().commit_enter(
                        sub,
                        id,
                        key,
                        ancestry,
                        virtual_ancestry,
                        edge,
                        surface_edge,
                    );
                    if let Some((listeners, event)) = emit {
                        listeners.emit(&event);
                    }
                }
                Action::EnterLoaded { sub, id } => {
                    let emit = self.core.borrow_mut().commit_enter_loaded(sub, id);
                    if let Some((listeners, event)) = emit {
                        listeners.emit(&event);
                    }
                }
                Action::Leave { sub, id } => {
                    // Leave is emitted *before* removal so listeners can
                    // still inspect the node through the view.
                    let emit = self.core.borrow_mut().prepare_leave(sub, id);
                    if let Some((listeners, event)) = emit {
                        listeners.emit(&event);
                    }
                    self.core.borrow_mut().commit_leave(sub, id);
                }
                Action::Reposition { sub, id, key } => {
                    let emit = self.core.borrow_mut().commit_reposition(sub, id, key);
                    if let Some((listeners, event)) = emit {
                        listeners.emit(&event);
                    }
                }
                Action::Change { sub, id, old } => {
                    let emit = self.core.borrow_mut().prepare_change(sub, id, old);
                    if let Some((listeners, event)) = emit {
                        listeners.emit(&event);
                    }
                }
                Action::Hybrid { sub, id, enter } => {
                    let emit = self.core.borrow_mut().prepare_hybrid(sub, id, enter);
                    if let Some((listeners, event)) = emit {
                        listeners.emit(&event);
                    }
                }
                Action::Watch { node, event } => {
                    let listeners = self.core.borrow().tracker.watchers.get(&node).cloned();
                    if let Some(listeners) = listeners {
                        listeners.emit(&event);
                    }
                }
                Action::WatchDrop { node } => {
                    self.core.borrow_mut().tracker.watchers.remove(&node);
                }
            }
        }
    }
}

impl CoreState {
    // ------------------------------------------------------------------
    // Mutation pipelines
    // ------------------------------------------------------------------

    fn apply_insert(&mut self, type_name: &str) -> Result<(NodeId, Vec<Action>), NodeStoreError> {
        let ty = self
            .schema
            .type_id(type_name)
            .ok_or_else(|| NodeStoreError::UnknownType(type_name.to_owned()))?;
        let id = self.store.allocate(ty);
        // Initial rollup values (e.g. count = 0); nothing can observe the
        // node yet, so no actions arise from these.
        let rollup_defs = self.schema.type_def(ty).rollups.clone();
        for def in &rollup_defs {
            self.rollups.recompute(&self.store, id, def);
        }
        self.indexes.index_node(&self.store, &self.rollups, id);
        debug!(node = id.get(), ty = type_name, "insert");
        let actions = self.on_insert_actions(id);
        Ok((id, actions))
    }

    fn apply_update(
        &mut self,
        id: NodeId,
        props: Vec<(String, Value)>,
    ) -> Result<Vec<Action>, NodeStoreError> {
        if self.store.node(id).is_none() {
            return Err(NodeStoreError::NodeNotFound(id));
        }
        let mut changed: FxHashMap<String, Value> = FxHashMap::default();
        for (name, value) in props {
            let current = self
                .store
                .node(id)
                .and_then(|n| n.prop(&name).cloned())
                .unwrap_or(Value::Null);
            if current == value {
                continue;
            }
            self.store.write_prop(id, &name, value);
            changed.insert(name, current);
        }
        if changed.is_empty() {
            return Ok(Vec::new());
        }
        debug!(node = id.get(), fields = changed.len(), "update");
        let mut actions = Vec::new();
        self.apply_field_changes(id, &changed, &mut actions);
        Ok(actions)
    }

    fn apply_link(
        &mut self,
        src: NodeId,
        edge_name: &str,
        tgt: NodeId,
    ) -> Result<Vec<Action>, NodeStoreError> {
        let edge = self.resolve_edge(src, edge_name)?;
        let def = self.schema.edge(edge);
        let reverse = def.reverse;
        let target_ty = def.target;
        let Some(tgt_node) = self.store.node(tgt) else {
            return Err(NodeStoreError::NodeNotFound(tgt));
        };
        if tgt_node.ty() != target_ty {
            return Err(NodeStoreError::EdgeTargetNotFound {
                edge: edge_name.to_owned(),
                target: tgt,
            });
        }
        if self.store.insert_target(src, edge, tgt).is_none() {
            return Ok(Vec::new());
        }
        self.store.insert_target(tgt, reverse, src);
        debug!(src = src.get(), edge = edge_name, tgt = tgt.get(), "link");

        let keyed_src = self.schema.indexes_keyed_by_edge(edge).to_vec();
        let keyed_tgt = self.schema.indexes_keyed_by_edge(reverse).to_vec();
        self.indexes.refresh(&self.store, &self.rollups, src, &keyed_src);
        self.indexes.refresh(&self.store, &self.rollups, tgt, &keyed_tgt);

        let mut actions = self.on_link_actions(src, edge, tgt);
        self.recompute_edge_rollups(src, edge, &mut actions);
        self.recompute_edge_rollups(tgt, reverse, &mut actions);
        Ok(actions)
    }

    pub(crate) fn apply_unlink(&mut self, src: NodeId, edge: EdgeId, tgt: NodeId) -> Vec<Action> {
        let reverse = self.schema.edge(edge).reverse;
        if !self.store.remove_target(src, edge, tgt) {
            return Vec::new();
        }
        self.store.remove_target(tgt, reverse, src);
        debug!(src = src.get(), edge = edge.index(), tgt = tgt.get(), "unlink");

        let keyed_src = self.schema.indexes_keyed_by_edge(edge).to_vec();
        let keyed_tgt = self.schema.indexes_keyed_by_edge(reverse).to_vec();
        self.indexes.refresh(&self.store, &self.rollups, src, &keyed_src);
        self.indexes.refresh(&self.store, &self.rollups, tgt, &keyed_tgt);

        let mut actions = self.on_unlink_actions(src, edge, tgt);
        self.recompute_edge_rollups(src, edge, &mut actions);
        self.recompute_edge_rollups(tgt, reverse, &mut actions);
        actions
    }

    /// Final phase of a delete: cascade and leaves have run; drop every
    /// trace of the node.
    fn finalize_delete(&mut self, id: NodeId) {
        let Some(node) = self.store.remove(id) else { return };
        self.indexes.deindex_node(node.ty(), id);
        self.rollups.drop_node(id);
        self.tracker.node_to_subs.remove(&id);
        self.tracker.virtual_to_subs.remove(&id);
        self.tracker.watchers.remove(&id);
        for state in self.tracker.subs.values_mut() {
            state.loaded_edges.remove(&id);
            state.virtual_descendants.remove(&id);
            state.virtual_nodes.remove(&id);
            if state.result.contains(id) {
                state.result.remove(id);
            }
        }
    }

    /// Shared tail of every field change (property write or rollup
    /// recompute): index refresh, edge-sort reordering, dependent rollups,
    /// and tracker actions. `changed` maps names to pre-image values.
    fn apply_field_changes(
        &mut self,
        id: NodeId,
        changed: &FxHashMap<String, Value>,
        actions: &mut Vec<Action>,
    ) {
        let Some(node) = self.store.node(id) else { return };
        let ty = node.ty();

        let mut touched: Vec<crate::ident::IndexId> = changed
            .keys()
            .flat_map(|name| self.schema.type_def(ty).indexes_touching(name))
            .copied()
            .collect();
        touched.sort_unstable();
        touched.dedup();
        self.indexes.refresh(&self.store, &self.rollups, id, &touched);

        // Sorted edge lists that read a changed property reorder, and the
        // order-sensitive rollups over them recompute.
        for name in changed.keys() {
            let edges = self.schema.edge_sort_deps(ty, name).to_vec();
            for edge in edges {
                let reverse = self.schema.edge(edge).reverse;
                let owners = self
                    .store
                    .node(id)
                    .map(|n| n.targets(reverse).to_vec())
                    .unwrap_or_default();
                for owner in owners {
                    self.store.reorder_target(owner, edge, id);
                    self.recompute_edge_rollups(owner, edge, actions);
                }
            }
        }

        // Rollups on linked owners that read a changed property.
        for name in changed.keys() {
            let deps = self.schema.rollup_prop_deps(ty, name).to_vec();
            for dep in deps {
                let owners = self
                    .store
                    .node(id)
                    .map(|n| n.targets(dep.via_reverse).to_vec())
                    .unwrap_or_default();
                for owner in owners {
                    self.recompute_one_rollup(owner, dep.rollup, actions);
                }
            }
        }

        actions.extend(self.on_update_actions(id, changed));
    }

    /// Recomputes every rollup on `owner` that observes `edge`.
    fn recompute_edge_rollups(&mut self, owner: NodeId, edge: EdgeId, actions: &mut Vec<Action>) {
        let positions = self.schema.rollups_over_edge(edge).to_vec();
        for pos in positions {
            self.recompute_one_rollup(owner, pos, actions);
        }
    }

    /// Recomputes one rollup; a changed value cascades exactly like a
    /// property update (indexes, dependents, subscriptions). Terminates
    /// because a recompute with unchanged inputs produces no delta.
    fn recompute_one_rollup(&mut self, owner: NodeId, position: usize, actions: &mut Vec<Action>) {
        let Some(node) = self.store.node(owner) else { return };
        let ty = node.ty();
        let Some(def) = self.schema.type_def(ty).rollups.get(position).cloned() else {
            return;
        };
        if let Some((old, _new)) = self.rollups.recompute(&self.store, owner, &def) {
            let mut changed = FxHashMap::default();
            changed.insert(def.name.clone(), old);
            self.apply_field_changes(owner, &changed, actions);
        }
    }

    pub(crate) fn resolve_edge(
        &self,
        id: NodeId,
        edge_name: &str,
    ) -> Result<EdgeId, NodeStoreError> {
        let node = self
            .store
            .node(id)
            .ok_or(NodeStoreError::NodeNotFound(id))?;
        let def = self.schema.type_def(node.ty());
        def.edge_id(edge_name)
            .ok_or_else(|| NodeStoreError::UnknownEdge {
                type_name: def.name.clone(),
                edge: edge_name.to_owned(),
            })
    }

    /// Edge resolution for view operations (reports in the query error
    /// vocabulary).
    pub(crate) fn resolve_edge_of_node(
        &self,
        id: NodeId,
        edge_name: &str,
    ) -> Result<EdgeId, QueryError> {
        self.resolve_edge(id, edge_name)
            .map_err(|_| QueryError::UnknownEdgeInSelection {
                type_name: self
                    .store
                    .node(id)
                    .map_or_else(String::new, |n| {
                        self.schema.type_def(n.ty()).name.clone()
                    }),
                edge: edge_name.to_owned(),
            })
    }

    /// Read-only snapshot wrapper for a node.
    #[allow(dead_code)]
    pub(crate) fn node_ref(&self, id: NodeId) -> Option<NodeRef<'_>> {
        self.store.node(id).map(|n| NodeRef::new(n, &self.rollups))
    }

    // ------------------------------------------------------------------
    // Action commit / prepare steps
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    fn commit_enter(
        &mut self,
        sub: SubId,
        id: NodeId,
        key: CompoundKey,
        ancestry: Vec<NodeId>,
        virtual_ancestry: Vec<NodeId>,
        edge: Option<EdgeId>,
        surface_edge: Option<EdgeId>,
    ) -> Option<(Listeners<ViewEvent>, ViewEvent)> {
        let state = self.tracker.subs.get_mut(&sub)?;
        if let Some(existing) = state.result.get_mut(id) {
            existing.parent_count += 1;
            return None;
        }
        self.store.node(id)?;
        let state = self.tracker.subs.get_mut(&sub)?;
        state.result.insert(ResultNode::new(
            id,
            key.clone(),
            ancestry.clone(),
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
        self.emit_enter(sub, id, &key, &ancestry, surface_edge)
    }

    fn commit_enter_loaded(
        &mut self,
        sub: SubId,
        id: NodeId,
    ) -> Option<(Listeners<ViewEvent>, ViewEvent)> {
        let state = self.tracker.subs.get(&sub)?;
        let record = state.result.get(id)?;
        let key = record.key.clone();
        let ancestry = record.ancestry.clone();
        let surface_edge = self.surface_edge_of(sub, id);
        self.emit_enter(sub, id, &key, &ancestry, surface_edge)
    }

    /// The listener list a subscription's events go to: the bound view's
    /// when one exists (loaded or not), else the raw subscription's.
    fn sub_listeners(&self, state: &crate::tracker::SubState) -> Listeners<ViewEvent> {
        state
            .view
            .and_then(|v| self.views.get(&v))
            .map_or_else(|| state.listeners.clone(), |v| v.listeners.clone())
    }

    /// Shared tail of an enter: sync the bound view's tree, compute the
    /// index, filter by the window, snapshot the item.
    fn emit_enter(
        &mut self,
        sub: SubId,
        id: NodeId,
        key: &CompoundKey,
        ancestry: &[NodeId],
        surface_edge: Option<EdgeId>,
    ) -> Option<(Listeners<ViewEvent>, ViewEvent)> {
        let state = self.tracker.subs.get(&sub)?;
        let view_id = state.view;
        let (listeners, index, in_window) = match view_id {
            Some(view_id) if self.views.get(&view_id).is_some_and(|v| v.loaded) => {
                let view = self.views.get_mut(&view_id)?;
                if !view.tree.contains(id) {
                    match ancestry.last() {
                        None => view.tree.insert_root(id, key.clone()),
                        Some(parent) => {
                            let edge = surface_edge?;
                            view.tree.insert_child(*parent, edge, id, key.clone());
                        }
                    }
                    let events = view.tree.take_events();
                    view.viewport.apply_events(&view.tree, &events);
                }
                let index = view.tree.index_of(id)?;
                let total = view.tree.total_visible();
                let in_window = view.viewport.contains_index(index, total);
                (view.listeners.clone(), index, in_window)
            }
            _ => {
                let index = state.result.index_of(id)?;
                (self.sub_listeners(state), index, true)
            }
        };
        if !in_window {
            return None;
        }
        let item = executor::materialize(self.cx(), id, ancestry.len(), ancestry.to_vec())?;
        Some((listeners, ViewEvent::Enter { item, index }))
    }

    fn prepare_leave(&mut self, sub: SubId, id: NodeId) -> Option<(Listeners<ViewEvent>, ViewEvent)> {
        let state = self.tracker.subs.get(&sub)?;
        let record = state.result.get(id)?;
        let ancestry = record.ancestry.clone();
        let view_id = state.view;
        let (listeners, index, in_window) = match view_id {
            Some(view_id) if self.views.get(&view_id).is_some_and(|v| v.loaded) => {
                let view = self.views.get_mut(&view_id)?;
                let index = view.tree.index_of(id)?;
                let total = view.tree.total_visible();
                (
                    view.listeners.clone(),
                    index,
                    view.viewport.contains_index(index, total),
                )
            }
            _ => {
                let index = state.result.index_of(id)?;
                (self.sub_listeners(state), index, true)
            }
        };
        if !in_window {
            return None;
        }
        let item = executor::materialize(self.cx(), id, ancestry.len(), ancestry)?;
        Some((listeners, ViewEvent::Leave { item, index }))
    }

    fn commit_leave(&mut self, sub: SubId, id: NodeId) {
        let Some(state) = self.tracker.subs.get_mut(&sub) else { return };
        // Virtual nodes unregister silently.
        if state.virtual_nodes.remove(&id).is_some() {
            state.virtual_descendants.remove(&id);
            if let Some(set) = self.tracker.virtual_to_subs.get_mut(&id) {
                set.remove(&sub);
                if set.is_empty() {
                    self.tracker.virtual_to_subs.remove(&id);
                }
            }
        }
        let Some(state) = self.tracker.subs.get_mut(&sub) else { return };
        if state.result.remove(id).is_some() {
            state.loaded_edges.remove(&id);
            for list in state.virtual_descendants.values_mut() {
                list.retain(|&d| d != id);
            }
            if let Some(set) = self.tracker.node_to_subs.get_mut(&id) {
                set.remove(&sub);
                if set.is_empty() {
                    self.tracker.node_to_subs.remove(&id);
                }
            }
        }
        let view_id = self.tracker.subs.get(&sub).and_then(|s| s.view);
        if let Some(view_id) = view_id {
            if let Some(view) = self.views.get_mut(&view_id) {
                if view.loaded && view.tree.contains(id) {
                    view.tree.remove_child(id);
                    let events = view.tree.take_events();
                    view.viewport.apply_events(&view.tree, &events);
                }
            }
        }
    }

    fn commit_reposition(
        &mut self,
        sub: SubId,
        id: NodeId,
        key: CompoundKey,
    ) -> Option<(Listeners<ViewEvent>, ViewEvent)> {
        let state = self.tracker.subs.get_mut(&sub)?;
        let (old_index, new_index) = state.result.reposition(id, key.clone())?;
        let ancestry = state.result.get(id)?.ancestry.clone();
        let view_id = state.view;
        let (listeners, old_index, new_index, in_window) = match view_id {
            Some(view_id) if self.views.get(&view_id).is_some_and(|v| v.loaded) => {
                let view = self.views.get_mut(&view_id)?;
                view.tree.update_key(id, key);
                let events = view.tree.take_events();
                let moved = events.iter().find_map(|e| match e {
                    crate::tree::TreeEvent::Moved {
                        id: mid,
                        old_index,
                        new_index,
                    } if *mid == id => Some((*old_index, *new_index)),
                    _ => None,
                });
                view.viewport.apply_events(&view.tree, &events);
                let total = view.tree.total_visible();
                let (old_i, new_i) = moved?;
                let in_window = view.viewport.contains_index(old_i, total)
                    || view.viewport.contains_index(new_i, total);
                (view.listeners.clone(), old_i, new_i, in_window)
            }
            _ => {
                let state = self.tracker.subs.get(&sub)?;
                (
                    self.sub_listeners(state),
                    old_index,
                    new_index,
                    old_index != new_index,
                )
            }
        };
        if old_index == new_index || !in_window {
            return None;
        }
        let item = executor::materialize(self.cx(), id, ancestry.len(), ancestry)?;
        Some((
            listeners,
            ViewEvent::Move {
                item,
                old_index,
                new_index,
            },
        ))
    }

    fn prepare_change(
        &mut self,
        sub: SubId,
        id: NodeId,
        mut old: Item,
    ) -> Option<(Listeners<ViewEvent>, ViewEvent)> {
        let state = self.tracker.subs.get(&sub)?;
        let record = state.result.get(id)?;
        let ancestry = record.ancestry.clone();
        let view_id = state.view;
        let (listeners, index, in_window) = match view_id {
            Some(view_id) if self.views.get(&view_id).is_some_and(|v| v.loaded) => {
                let view = self.views.get_mut(&view_id)?;
                let index = view.tree.index_of(id)?;
                let total = view.tree.total_visible();
                (
                    view.listeners.clone(),
                    index,
                    view.viewport.contains_index(index, total),
                )
            }
            _ => {
                let index = state.result.index_of(id)?;
                (self.sub_listeners(state), index, true)
            }
        };
        if !in_window {
            return None;
        }
        let item = executor::materialize(self.cx(), id, ancestry.len(), ancestry)?;
        old.depth = item.depth;
        old.path = item.path.clone();
        Some((
            listeners,
            ViewEvent::Change {
                item,
                index,
                old_item: old,
            },
        ))
    }

    fn prepare_hybrid(
        &mut self,
        sub: SubId,
        id: NodeId,
        enter: bool,
    ) -> Option<(Listeners<ViewEvent>, ViewEvent)> {
        let state = self.tracker.subs.get(&sub)?;
        let listeners = state.view.map_or_else(
            || state.listeners.clone(),
            |view_id| {
                self.views
                    .get(&view_id)
                    .map_or_else(|| state.listeners.clone(), |v| v.listeners.clone())
            },
        );
        let item = executor::materialize(self.cx(), id, 0, Vec::new())?;
        let event = if enter {
            ViewEvent::Enter { item, index: 0 }
        } else {
            ViewEvent::Leave { item, index: 0 }
        };
        Some((listeners, event))
    }
}

/// A raw subscription handle (no tree, no viewport): items in composite
/// key order, plus event registration.
#[derive(Clone, Debug)]
pub struct Subscription {
    core: Rc<RefCell<CoreState>>,
    id: SubId,
}

impl Subscription {
    /// Materialized items, in result order. Triggers initialization.
    #[must_use]
    pub fn items(&self) -> Vec<Item> {
        let Ok(mut core) = self.core.try_borrow_mut() else {
            return Vec::new();
        };
        core.ensure_initialized(self.id);
        let Some(state) = core.tracker.subs.get(&self.id) else {
            return Vec::new();
        };
        let rows: Vec<(NodeId, Vec<NodeId>)> = state
            .result
            .iter()
            .filter_map(|id| state.result.get(id).map(|r| (id, r.ancestry.clone())))
            .collect();
        rows.into_iter()
            .filter_map(|(id, ancestry)| {
                executor::materialize(core.cx(), id, ancestry.len(), ancestry)
            })
            .collect()
    }

    /// Number of tracked items. Triggers initialization.
    #[must_use]
    pub fn total(&self) -> usize {
        let mut core = self.core.borrow_mut();
        core.ensure_initialized(self.id);
        core.tracker
            .subs
            .get(&self.id)
            .map_or(0, |s| s.result.len())
    }

    /// Position of a tracked node in result order.
    #[must_use]
    pub fn index_of(&self, id: NodeId) -> Option<usize> {
        self.core
            .borrow()
            .tracker
            .subs
            .get(&self.id)?
            .result
            .index_of(id)
    }

    /// Registers a listener; returns a removal handle.
    pub fn on_event(&self, f: impl FnMut(&ViewEvent) + 'static) -> u64 {
        self.listeners().add(f)
    }

    /// Unregisters a listener.
    pub fn remove_listener(&self, handle: u64) {
        self.listeners().remove(handle);
    }

    /// Ends the subscription.
    pub fn unsubscribe(self) {
        self.core.borrow_mut().unregister_subscription(self.id);
    }

    fn listeners(&self) -> Listeners<ViewEvent> {
        self.core
            .borrow()
            .tracker
            .subs
            .get(&self.id)
            .map(|s| s.listeners.clone())
            .unwrap_or_default()
    }
}

/// A single-node watcher handle.
#[derive(Clone)]
pub struct NodeWatch {
    core: Rc<RefCell<CoreState>>,
    node: NodeId,
}

impl NodeWatch {
    /// Registers a listener for the watched node's events.
    pub fn on_event(&self, f: impl FnMut(&NodeEvent) + 'static) -> u64 {
        let listeners = {
            let mut core = self.core.borrow_mut();
            core.tracker
                .watchers
                .entry(self.node)
                .or_default()
                .clone()
        };
        listeners.add(f)
    }

    /// Unregisters a listener.
    pub fn remove_listener(&self, handle: u64) {
        let listeners = self
            .core
            .borrow()
            .tracker
            .watchers
            .get(&self.node)
            .cloned();
        if let Some(listeners) = listeners {
            listeners.remove(handle);
        }
    }

    /// Drops every listener registered for the node.
    pub fn unwatch(self) {
        self.core.borrow_mut().tracker.watchers.remove(&self.node);
    }
}

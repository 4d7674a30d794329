// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Views: a subscription bound to a reactive tree and a viewport.
//!
//! The view owns the presentation state the subscription does not:
//! per-node per-edge expansion (persisted outside the tree, so it survives
//! reloads), the sliding window, and the client listener list. Children
//! load lazily on expansion; expansion and scrolling emit no events —
//! client events only arise from graph mutations.

use std::cell::RefCell;
use std::rc::Rc;

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::trace;

use crate::db::CoreState;
use crate::event::{Item, Listeners, ViewEvent};
use crate::ident::{EdgeId, NodeId, SubId, ViewId};
use crate::query::QueryError;
use crate::tree::ReactiveTree;
use crate::viewport::Viewport;

/// Options for opening a view.
#[derive(Clone, Copy, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ViewOptions {
    /// Window height; 0 means unbounded.
    #[cfg_attr(feature = "serde", serde(default))]
    pub limit: u32,
    /// Expand every edge as nodes load.
    #[cfg_attr(feature = "serde", serde(default))]
    pub default_expanded: bool,
    /// Initialize eagerly at creation instead of on first read.
    #[cfg_attr(feature = "serde", serde(default))]
    pub immediate: bool,
}

/// One row of a view's window.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ViewItem {
    /// The node.
    pub id: NodeId,
    /// Depth below the view's roots.
    pub depth: usize,
    /// Whether any selection edge of this node's level has targets.
    pub has_children: bool,
    /// Names of the currently expanded edges.
    pub expanded_edges: Vec<String>,
}

/// Internal per-view state, owned by the core.
#[derive(Debug)]
pub(crate) struct ViewState {
    pub sub: SubId,
    pub tree: ReactiveTree,
    pub viewport: Viewport,
    /// Persistent expansion metadata; survives tree rebuilds and collapse
    /// (cleared only by `collapse` on the exact edge, or `collapse_all`).
    pub expanded_nodes: FxHashMap<NodeId, FxHashSet<EdgeId>>,
    pub options: ViewOptions,
    pub listeners: Listeners<ViewEvent>,
    pub loaded: bool,
}

/// Loads the view's roots from its subscription (initializing it if
/// needed). Idempotent.
pub(crate) fn view_load(core: &mut CoreState, view_id: ViewId) {
    let Some(view) = core.views.get(&view_id) else { return };
    if view.loaded {
        return;
    }
    let sub = view.sub;
    core.ensure_initialized(sub);
    let roots: Vec<(NodeId, crate::key::CompoundKey)> = {
        let Some(state) = core.tracker.subs.get(&sub) else { return };
        state
            .result
            .iter()
            .filter_map(|id| {
                let r = state.result.get(id)?;
                r.ancestry.is_empty().then(|| (id, r.key.clone()))
            })
            .collect()
    };
    let default_expanded = {
        let Some(view) = core.views.get_mut(&view_id) else { return };
        view.loaded = true;
        for (id, key) in roots {
            view.tree.insert_root(id, key);
        }
        // Initial population is not an edit stream: start the window at
        // the top rather than letting offset adjustment walk it down.
        view.tree.take_events();
        view.viewport.scroll_to(&view.tree, 0);
        view.options.default_expanded
    };
    trace!(view = view_id.0, "view loaded");
    if default_expanded {
        view_expand_all(core, view_id, None);
    } else {
        // Re-apply persisted expansion (e.g. after a reload).
        let roots: Vec<NodeId> = core.views[&view_id].tree.roots();
        for root in roots {
            replay_expansion(core, view_id, root);
        }
    }
}

fn replay_expansion(core: &mut CoreState, view_id: ViewId, node: NodeId) {
    let edges: Vec<EdgeId> = core.views[&view_id]
        .expanded_nodes
        .get(&node)
        .map(|set| {
            let mut v: Vec<EdgeId> = set.iter().copied().collect();
            v.sort_unstable();
            v
        })
        .unwrap_or_default();
    for edge in edges {
        view_expand(core, view_id, node, edge);
    }
}

/// Expands `edge` on `node`: loads the bucket (virtual chains traversed,
/// filters applied) if this is its first expansion, marks the edge
/// expanded, and recursively restores persisted expansion below.
pub(crate) fn view_expand(core: &mut CoreState, view_id: ViewId, node: NodeId, edge: EdgeId) {
    let Some(view) = core.views.get(&view_id) else { return };
    let sub = view.sub;
    let pairs = core.load_bucket(sub, node, edge);
    let Some(view) = core.views.get_mut(&view_id) else { return };
    if !view.tree.contains(node) {
        return;
    }
    for (id, key) in pairs {
        view.tree.insert_child(node, edge, id, key);
    }
    view.tree.take_events();
    view.tree.expand(node, edge);
    view.expanded_nodes.entry(node).or_default().insert(edge);
    let events = view.tree.take_events();
    view.viewport.apply_events(&view.tree, &events);

    let children = view.tree.children(node, edge);
    for child in children {
        replay_expansion(core, view_id, child);
    }
}

/// Collapses `edge` on `node`. Expansion bits inside the collapsed
/// subtree are cleared from the tree (so a plain re-expand starts
/// shallow), but the view-level metadata persists and is replayed on the
/// next expand.
pub(crate) fn view_collapse(core: &mut CoreState, view_id: ViewId, node: NodeId, edge: EdgeId) {
    let Some(view) = core.views.get_mut(&view_id) else { return };
    view.tree.collapse(node, edge);
    view.tree.clear_expansion_in_bucket(node, edge);
    if let Some(set) = view.expanded_nodes.get_mut(&node) {
        set.remove(&edge);
        if set.is_empty() {
            view.expanded_nodes.remove(&node);
        }
    }
    let events = view.tree.take_events();
    view.viewport.apply_events(&view.tree, &events);
}

/// Expands every selection edge of every visible node, breadth-first, to
/// `max_depth` levels (`None` = unbounded; recursion is still bounded by
/// the executor's cycle guard).
pub(crate) fn view_expand_all(core: &mut CoreState, view_id: ViewId, max_depth: Option<usize>) {
    let Some(view) = core.views.get(&view_id) else { return };
    let sub = view.sub;
    let mut frontier: Vec<(NodeId, usize)> = view
        .tree
        .roots()
        .into_iter()
        .map(|r| (r, 0))
        .collect();
    while let Some((node, depth)) = frontier.pop() {
        if max_depth.is_some_and(|max| depth >= max) {
            continue;
        }
        let edges = core.child_edges_of(sub, node);
        for edge in edges {
            view_expand(core, view_id, node, edge);
            let Some(view) = core.views.get(&view_id) else { return };
            for child in view.tree.children(node, edge) {
                frontier.push((child, depth + 1));
            }
        }
    }
}

/// A live view handle.
///
/// Cloning is cheap; all clones address the same view. Dropping handles
/// does not close the view — call [`View::close`].
#[derive(Clone)]
pub struct View {
    pub(crate) core: Rc<RefCell<CoreState>>,
    pub(crate) id: ViewId,
}

impl View {
    /// The window's rows, in visible order. Loads the view on first use.
    ///
    /// Re-entrancy guard: when called while the core is busy (from inside
    /// a mutation's internal phase), returns the last consistent window
    /// without re-driving initialization.
    #[must_use]
    pub fn items(&self) -> Vec<ViewItem> {
        let Ok(mut core) = self.core.try_borrow_mut() else {
            return Vec::new();
        };
        view_load(&mut core, self.id);
        let Some(view) = core.views.get(&self.id) else {
            return Vec::new();
        };
        let sub = view.sub;
        let ids = view.viewport.window(&view.tree);
        ids.into_iter()
            .filter_map(|id| {
                let view = core.views.get(&self.id)?;
                let depth = view.tree.depth(id)?;
                let expanded_edges = view
                    .tree
                    .expanded_edges(id)
                    .into_iter()
                    .map(|e| core.schema.edge(e).name.clone())
                    .collect();
                let has_children = core
                    .child_edges_of(sub, id)
                    .into_iter()
                    .any(|e| {
                        core.store
                            .node(id)
                            .is_some_and(|n| !n.targets(e).is_empty())
                    });
                Some(ViewItem {
                    id,
                    depth,
                    has_children,
                    expanded_edges,
                })
            })
            .collect()
    }

    /// Total visible items (virtual roots are neither emitted nor
    /// counted).
    #[must_use]
    pub fn total(&self) -> usize {
        let mut core = self.core.borrow_mut();
        view_load(&mut core, self.id);
        core.views
            .get(&self.id)
            .map_or(0, |v| v.tree.total_visible())
    }

    /// Flat visible index of a node, if visible.
    #[must_use]
    pub fn index_of(&self, id: NodeId) -> Option<usize> {
        let mut core = self.core.borrow_mut();
        view_load(&mut core, self.id);
        core.views.get_mut(&self.id)?.tree.index_of(id)
    }

    /// Expands `edge_name` on `id`.
    pub fn expand(&self, id: NodeId, edge_name: &str) -> Result<(), QueryError> {
        let mut core = self.core.borrow_mut();
        view_load(&mut core, self.id);
        let edge = core.resolve_edge_of_node(id, edge_name)?;
        view_expand(&mut core, self.id, id, edge);
        Ok(())
    }

    /// Collapses `edge_name` on `id`, clearing descendant expansion in the
    /// tree (view-level metadata persists).
    pub fn collapse(&self, id: NodeId, edge_name: &str) -> Result<(), QueryError> {
        let mut core = self.core.borrow_mut();
        view_load(&mut core, self.id);
        let edge = core.resolve_edge_of_node(id, edge_name)?;
        view_collapse(&mut core, self.id, id, edge);
        Ok(())
    }

    /// Expands when collapsed, collapses when expanded.
    pub fn toggle_expand(&self, id: NodeId, edge_name: &str) -> Result<(), QueryError> {
        let mut core = self.core.borrow_mut();
        view_load(&mut core, self.id);
        let edge = core.resolve_edge_of_node(id, edge_name)?;
        let expanded = core
            .views
            .get(&self.id)
            .is_some_and(|v| v.tree.is_expanded(id, edge));
        if expanded {
            view_collapse(&mut core, self.id, id, edge);
        } else {
            view_expand(&mut core, self.id, id, edge);
        }
        Ok(())
    }

    /// Expands everything (to `max_depth` levels when given).
    pub fn expand_all(&self, max_depth: Option<usize>) {
        let mut core = self.core.borrow_mut();
        view_load(&mut core, self.id);
        view_expand_all(&mut core, self.id, max_depth);
    }

    /// Collapses everything and clears persisted expansion metadata.
    pub fn collapse_all(&self) {
        let mut core = self.core.borrow_mut();
        view_load(&mut core, self.id);
        if let Some(view) = core.views.get_mut(&self.id) {
            view.tree.collapse_all();
            view.expanded_nodes.clear();
            let events = view.tree.take_events();
            view.viewport.apply_events(&view.tree, &events);
        }
    }

    /// Jumps the window to an absolute offset.
    pub fn scroll_to(&self, offset: usize) {
        let mut core = self.core.borrow_mut();
        view_load(&mut core, self.id);
        if let Some(view) = core.views.get_mut(&self.id) {
            view.viewport.scroll_to(&view.tree, offset);
        }
    }

    /// Scrolls the window by a signed delta.
    pub fn move_by(&self, delta: isize) {
        let mut core = self.core.borrow_mut();
        view_load(&mut core, self.id);
        if let Some(view) = core.views.get_mut(&self.id) {
            view.viewport.scroll_by(&view.tree, delta);
        }
    }

    /// Resizes the window.
    pub fn set_height(&self, height: usize) {
        let mut core = self.core.borrow_mut();
        view_load(&mut core, self.id);
        if let Some(view) = core.views.get_mut(&self.id) {
            view.viewport.set_height(&view.tree, height);
        }
    }

    /// Current window offset.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.core
            .borrow()
            .views
            .get(&self.id)
            .map_or(0, |v| v.viewport.offset())
    }

    /// Registers a listener for every event kind. Returns a handle for
    /// [`View::remove_listener`].
    pub fn on_event(&self, f: impl FnMut(&ViewEvent) + 'static) -> u64 {
        self.listeners().add(f)
    }

    /// Registers an *enter* listener.
    pub fn on_enter(&self, mut f: impl FnMut(&Item, usize) + 'static) -> u64 {
        self.listeners().add(move |e: &ViewEvent| {
            if let ViewEvent::Enter { item, index } = e {
                f(item, *index);
            }
        })
    }

    /// Registers a *leave* listener.
    pub fn on_leave(&self, mut f: impl FnMut(&Item, usize) + 'static) -> u64 {
        self.listeners().add(move |e: &ViewEvent| {
            if let ViewEvent::Leave { item, index } = e {
                f(item, *index);
            }
        })
    }

    /// Registers a *change* listener.
    pub fn on_change(&self, mut f: impl FnMut(&Item, usize, &Item) + 'static) -> u64 {
        self.listeners().add(move |e: &ViewEvent| {
            if let ViewEvent::Change { item, index, old_item } = e {
                f(item, *index, old_item);
            }
        })
    }

    /// Registers a *move* listener.
    pub fn on_move(&self, mut f: impl FnMut(&Item, usize, usize) + 'static) -> u64 {
        self.listeners().add(move |e: &ViewEvent| {
            if let ViewEvent::Move { item, old_index, new_index } = e {
                f(item, *old_index, *new_index);
            }
        })
    }

    /// Unregisters a listener.
    pub fn remove_listener(&self, handle: u64) {
        self.listeners().remove(handle);
    }

    /// Closes the view and its subscription.
    pub fn close(self) {
        let mut core = self.core.borrow_mut();
        if let Some(view) = core.views.remove(&self.id) {
            core.unregister_subscription(view.sub);
        }
    }

    fn listeners(&self) -> Listeners<ViewEvent> {
        self.core
            .borrow()
            .views
            .get(&self.id)
            .map(|v| v.listeners.clone())
            .unwrap_or_default()
    }
}

// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Event payloads and listener registration.
//!
//! Every payload is an owned snapshot: listeners receive no references into
//! core structures and may re-enter the database freely. Delivery is
//! synchronous and strictly serialized in call order; there is no batching.

use std::cell::RefCell;
use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::ident::NodeId;
use crate::value::Value;

/// A materialized result item.
#[derive(Clone, Debug, PartialEq)]
pub struct Item {
    /// The node's id.
    pub id: NodeId,
    /// The node's type name.
    pub type_name: String,
    /// Depth of the item below its subscription root (roots are 0).
    pub depth: usize,
    /// Visible ancestry, outermost first, excluding the node itself.
    pub path: Vec<NodeId>,
    /// Stored properties plus computed rollups.
    pub props: FxHashMap<String, Value>,
}

impl Item {
    /// Reads a property or rollup off the snapshot. Absent reads as `Null`.
    #[must_use]
    pub fn get(&self, name: &str) -> Value {
        self.props.get(name).cloned().unwrap_or(Value::Null)
    }
}

/// A fine-grained view event.
#[derive(Clone, Debug)]
pub enum ViewEvent {
    /// A node entered the visible result at `index`.
    Enter {
        /// The entering item.
        item: Item,
        /// Flat visible index (0 for subscriptions that have not scanned
        /// yet — position unknown).
        index: usize,
    },
    /// A node is about to leave the visible result; it is still present
    /// (and inspectable through the view) while the callback runs.
    Leave {
        /// The leaving item.
        item: Item,
        /// Flat visible index it leaves from.
        index: usize,
    },
    /// A tracked node's selected properties changed in place.
    Change {
        /// The updated item.
        item: Item,
        /// Flat visible index after any repositioning.
        index: usize,
        /// The pre-update snapshot.
        old_item: Item,
    },
    /// A tracked node moved to a new position.
    Move {
        /// The moved item.
        item: Item,
        /// Index before the move.
        old_index: usize,
        /// Index after the move.
        new_index: usize,
    },
}

/// An event delivered to a single-node watcher.
#[derive(Clone, Debug)]
pub enum NodeEvent {
    /// An edge of the watched node gained a target.
    Link {
        /// Edge name on the watched node's type.
        edge: String,
        /// The other endpoint.
        target: NodeId,
    },
    /// An edge of the watched node lost a target.
    Unlink {
        /// Edge name on the watched node's type.
        edge: String,
        /// The other endpoint.
        target: NodeId,
    },
    /// Properties (or rollups) of the watched node changed.
    Change {
        /// Names of the changed fields.
        changed: Vec<String>,
    },
    /// The watched node was deleted. The watcher is dropped afterwards.
    Delete,
}

type Handler<E> = Rc<RefCell<Box<dyn FnMut(&E)>>>;

struct Slot<E> {
    id: u64,
    handler: Handler<E>,
}

/// A shared, re-entrancy-tolerant listener list.
///
/// Emission snapshots the current handlers, releases every borrow, then
/// invokes them one by one. A handler that re-enters the database triggers
/// nested emission while it is still on the stack; in that case:
///
/// - every *other* handler observes the nested event immediately
///   (synchronous recursion),
/// - the causing handler itself cannot be re-entered (its `FnMut` state is
///   exclusively borrowed), so its copy of the nested event is queued and
///   redelivered right after it returns from the current event.
///
/// No event is ever dropped; ordering stays serialized per handler.
pub(crate) struct Listeners<E> {
    slots: Rc<RefCell<Vec<Slot<E>>>>,
    next_id: Rc<RefCell<u64>>,
    pending: Rc<RefCell<std::collections::VecDeque<(Handler<E>, E)>>>,
    draining: Rc<std::cell::Cell<bool>>,
}

impl<E> std::fmt::Debug for Listeners<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Listeners({})", self.slots.borrow().len())
    }
}

impl<E> Clone for Listeners<E> {
    fn clone(&self) -> Self {
        Self {
            slots: Rc::clone(&self.slots),
            next_id: Rc::clone(&self.next_id),
            pending: Rc::clone(&self.pending),
            draining: Rc::clone(&self.draining),
        }
    }
}

impl<E> Default for Listeners<E> {
    fn default() -> Self {
        Self {
            slots: Rc::default(),
            next_id: Rc::default(),
            pending: Rc::default(),
            draining: Rc::default(),
        }
    }
}

impl<E> Listeners<E> {
    pub(crate) fn add(&self, f: impl FnMut(&E) + 'static) -> u64 {
        let mut next = self.next_id.borrow_mut();
        let id = *next;
        *next += 1;
        self.slots.borrow_mut().push(Slot {
            id,
            handler: Rc::new(RefCell::new(Box::new(f))),
        });
        id
    }

    pub(crate) fn remove(&self, id: u64) {
        self.slots.borrow_mut().retain(|s| s.id != id);
    }

    pub(crate) fn emit(&self, event: &E)
    where
        E: Clone,
    {
        let snapshot: Vec<Handler<E>> = self
            .slots
            .borrow()
            .iter()
            .map(|s| Rc::clone(&s.handler))
            .collect();
        for handler in snapshot {
            match handler.try_borrow_mut() {
                Ok(mut f) => f(event),
                // The handler is on the stack causing this very event;
                // redeliver once it returns.
                Err(_) => self
                    .pending
                    .borrow_mut()
                    .push_back((Rc::clone(&handler), event.clone())),
            }
        }
        self.drain_pending();
    }

    fn drain_pending(&self)
    where
        E: Clone,
    {
        // Only the outermost emission drains; nested frames would find
        // their causing handler still borrowed.
        if self.draining.get() {
            return;
        }
        self.draining.set(true);
        loop {
            let next = self.pending.borrow_mut().pop_front();
            let Some((handler, event)) = next else { break };
            let is_busy = handler.try_borrow_mut().is_err();
            if is_busy {
                // Still executing somewhere up the stack; leave it for
                // the frame that owns that call.
                self.pending.borrow_mut().push_back((handler, event));
                break;
            }
            let mut f = handler.borrow_mut();
            f(&event);
        }
        self.draining.set(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn emission_reaches_every_listener_in_registration_order() {
        let listeners: Listeners<u32> = Listeners::default();
        let log = Rc::new(RefCell::new(Vec::new()));
        for tag in ["a", "b"] {
            let log = Rc::clone(&log);
            listeners.add(move |e: &u32| log.borrow_mut().push((tag, *e)));
        }
        listeners.emit(&7);
        assert_eq!(&*log.borrow(), &[("a", 7), ("b", 7)]);
    }

    #[test]
    fn removed_listeners_stop_receiving() {
        let listeners: Listeners<u32> = Listeners::default();
        let hits = Rc::new(Cell::new(0));
        let h = {
            let hits = Rc::clone(&hits);
            listeners.add(move |_: &u32| hits.set(hits.get() + 1))
        };
        listeners.emit(&1);
        listeners.remove(h);
        listeners.emit(&2);
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn nested_events_redeliver_to_the_causing_handler_after_it_returns() {
        let listeners: Listeners<u32> = Listeners::default();
        let inner = listeners.clone();
        let depth = Rc::new(Cell::new(0_u32));
        let max_depth = Rc::new(Cell::new(0_u32));
        let calls = Rc::new(Cell::new(0_u32));
        {
            let (depth, max_depth, calls) =
                (Rc::clone(&depth), Rc::clone(&max_depth), Rc::clone(&calls));
            listeners.add(move |_: &u32| {
                calls.set(calls.get() + 1);
                depth.set(depth.get() + 1);
                max_depth.set(max_depth.get().max(depth.get()));
                if calls.get() < 5 {
                    inner.emit(&0);
                }
                depth.set(depth.get() - 1);
            });
        }
        listeners.emit(&0);
        // Every nested event arrived, but deferred: never re-entrant.
        assert_eq!(calls.get(), 5);
        assert_eq!(max_depth.get(), 1);
    }

    #[test]
    fn other_handlers_observe_nested_events_immediately() {
        let listeners: Listeners<u32> = Listeners::default();
        let inner = listeners.clone();
        let log = Rc::new(RefCell::new(Vec::new()));
        {
            let log = Rc::clone(&log);
            listeners.add(move |e: &u32| {
                log.borrow_mut().push(("a", *e));
                if *e == 1 {
                    inner.emit(&2);
                }
            });
        }
        {
            let log = Rc::clone(&log);
            listeners.add(move |e: &u32| log.borrow_mut().push(("b", *e)));
        }
        listeners.emit(&1);
        // b saw the nested 2 synchronously, inside a's frame (so before
        // its own 1 — that is what synchronous recursion means); a's copy
        // of 2 was deferred until after it returned.
        assert_eq!(
            &*log.borrow(),
            &[("a", 1), ("b", 2), ("b", 1), ("a", 2)]
        );
    }
}

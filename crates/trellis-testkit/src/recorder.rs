// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Event recorders: capture view and node events for later assertions.

use std::cell::RefCell;
use std::rc::Rc;

use trellis_core::{NodeEvent, NodeId, ViewEvent};

/// A compact, comparable rendering of one view event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecordedEvent {
    /// enter(id, index)
    Enter(NodeId, usize),
    /// leave(id, index)
    Leave(NodeId, usize),
    /// change(id, index)
    Change(NodeId, usize),
    /// move(id, old_index, new_index)
    Move(NodeId, usize, usize),
}

/// Records every view event it sees.
#[derive(Clone, Default)]
pub struct EventRecorder {
    log: Rc<RefCell<Vec<RecordedEvent>>>,
}

impl EventRecorder {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A callback suitable for `on_event` registration.
    #[must_use]
    pub fn callback(&self) -> impl FnMut(&ViewEvent) + 'static {
        let log = Rc::clone(&self.log);
        move |event: &ViewEvent| {
            let recorded = match event {
                ViewEvent::Enter { item, index } => RecordedEvent::Enter(item.id, *index),
                ViewEvent::Leave { item, index } => RecordedEvent::Leave(item.id, *index),
                ViewEvent::Change { item, index, .. } => RecordedEvent::Change(item.id, *index),
                ViewEvent::Move {
                    item,
                    old_index,
                    new_index,
                } => RecordedEvent::Move(item.id, *old_index, *new_index),
            };
            log.borrow_mut().push(recorded);
        }
    }

    /// Everything recorded so far, in order.
    #[must_use]
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.log.borrow().clone()
    }

    /// Number of recorded events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.log.borrow().len()
    }

    /// Whether nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.log.borrow().is_empty()
    }

    /// Drops everything recorded so far.
    pub fn clear(&self) {
        self.log.borrow_mut().clear();
    }

    /// Takes the log, leaving it empty.
    #[must_use]
    pub fn take(&self) -> Vec<RecordedEvent> {
        std::mem::take(&mut *self.log.borrow_mut())
    }
}

/// Records node-watcher events as `(label, other_endpoint)` pairs.
#[derive(Clone, Default)]
pub struct NodeEventRecorder {
    log: Rc<RefCell<Vec<(String, Option<NodeId>)>>>,
}

impl NodeEventRecorder {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A callback suitable for `NodeWatch::on_event`.
    #[must_use]
    pub fn callback(&self) -> impl FnMut(&NodeEvent) + 'static {
        let log = Rc::clone(&self.log);
        move |event: &NodeEvent| {
            let recorded = match event {
                NodeEvent::Link { edge, target } => (format!("link:{edge}"), Some(*target)),
                NodeEvent::Unlink { edge, target } => (format!("unlink:{edge}"), Some(*target)),
                NodeEvent::Change { changed } => (format!("change:{}", changed.join(",")), None),
                NodeEvent::Delete => ("delete".to_owned(), None),
            };
            log.borrow_mut().push(recorded);
        }
    }

    /// Everything recorded so far, in order.
    #[must_use]
    pub fn events(&self) -> Vec<(String, Option<NodeId>)> {
        self.log.borrow().clone()
    }
}

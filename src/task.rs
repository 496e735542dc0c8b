//! Owner tasks: where completed events are delivered.
//!
//! The manager never runs completion logic itself. Each request names an
//! owner implementing [`Task`]; when the request finishes the event is
//! posted to that owner, which is expected to queue it and act on it after
//! the manager call returns. `post` must not call back into the manager.

use crate::event::SocketEvent;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// Receiver of completed socket events.
pub trait Task {
    fn post(&self, event: SocketEvent);
}

/// Shared handle to an owner task. Cloning attaches, dropping detaches.
pub type TaskRef = Rc<dyn Task>;

/// Owner identity, used by cancellation filters.
#[inline]
pub(crate) fn same_task(a: &TaskRef, b: &TaskRef) -> bool {
    std::ptr::eq(
        Rc::as_ptr(a) as *const (),
        Rc::as_ptr(b) as *const (),
    )
}

/// A task that collects events in arrival order.
#[derive(Default)]
pub struct EventQueue {
    events: RefCell<VecDeque<SocketEvent>>,
}

impl EventQueue {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// Take the oldest delivered event.
    pub fn pop(&self) -> Option<SocketEvent> {
        self.events.borrow_mut().pop_front()
    }

    /// Take every delivered event.
    pub fn drain(&self) -> Vec<SocketEvent> {
        self.events.borrow_mut().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.events.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.borrow().is_empty()
    }
}

impl Task for EventQueue {
    fn post(&self, event: SocketEvent) {
        self.events.borrow_mut().push_back(event);
    }
}

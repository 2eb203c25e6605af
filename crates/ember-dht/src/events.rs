//! Table membership events.
//!
//! Added/dropped notifications are queued FIFO and delivered to the
//! subscriber only when the owner drains the queue, so emission never runs
//! under the routing lock.

use std::collections::VecDeque;

use ember_core::NodeId;
use parking_lot::{Mutex, RwLock};

/// What happened to a table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeEventKind {
    /// The node entered a bucket.
    Added,
    /// The node left the table.
    Dropped,
}

/// Subscriber for table membership changes.
pub trait NodeEventHandler: Send + Sync {
    /// Called once per event, in emission order.
    fn on_node_event(&self, id: NodeId, kind: NodeEventKind);
}

/// FIFO queue of membership events.
#[derive(Default)]
pub struct EventEmitter {
    queue: Mutex<VecDeque<(NodeId, NodeEventKind)>>,
    handler: RwLock<Option<Box<dyn NodeEventHandler>>>,
}

impl EventEmitter {
    /// Creates an emitter with no subscriber.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the subscriber, replacing any previous one.
    pub fn set_handler(&self, handler: Box<dyn NodeEventHandler>) {
        *self.handler.write() = Some(handler);
    }

    /// Enqueues an event.
    pub fn append(&self, id: NodeId, kind: NodeEventKind) {
        self.queue.lock().push_back((id, kind));
    }

    /// Delivers all queued events to the subscriber, oldest first.
    ///
    /// Without a subscriber the queue is retained.
    pub fn process_events(&self) {
        let handler = self.handler.read();
        let Some(handler) = handler.as_ref() else {
            return;
        };
        loop {
            let next = self.queue.lock().pop_front();
            match next {
                Some((id, kind)) => handler.on_node_event(id, kind),
                None => break,
            }
        }
    }

    /// Number of undelivered events.
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }
}

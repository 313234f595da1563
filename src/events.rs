//! The single event queue and its dispatcher.
//!
//! Store deliveries and identity changes may be produced on any thread, but
//! they are only ever applied by [`Dispatcher`], one event at a time, on the
//! thread that drives it. Application state therefore has one writer and
//! no handler is preempted by another.

use crate::identity::{Identity, IdentityEvent, IdentitySession};
use crate::store::QueryEvent;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Unique identifier for a client-side subscription.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

impl fmt::Debug for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriptionId({})", self.0)
    }
}

/// Everything the dispatcher processes.
#[derive(Clone, Debug)]
pub enum Event {
    Query {
        subscription: SubscriptionId,
        event: QueryEvent,
    },
    Identity(IdentityEvent),
}

/// Receives the query events of one subscription, in delivery order.
pub(crate) trait SnapshotHandler: Send {
    fn handle(&mut self, event: QueryEvent);
}

struct Slot {
    /// Taken out while the handler runs.
    handler: Option<Box<dyn SnapshotHandler>>,
}

/// Handlers of the live subscriptions, by id.
///
/// An id missing from the table is torn down; events still queued for it
/// are discarded.
#[derive(Default)]
pub(crate) struct SubscriptionTable {
    slots: Mutex<HashMap<SubscriptionId, Slot>>,
    next_id: AtomicU64,
}

impl SubscriptionTable {
    pub fn insert(&self, handler: Box<dyn SnapshotHandler>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.slots.lock().insert(
            id,
            Slot {
                handler: Some(handler),
            },
        );
        id
    }

    /// Returns false if the id was already gone.
    pub fn remove(&self, id: SubscriptionId) -> bool {
        self.slots.lock().remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    fn take(&self, id: SubscriptionId) -> Option<Box<dyn SnapshotHandler>> {
        self.slots.lock().get_mut(&id).and_then(|slot| slot.handler.take())
    }

    /// End every subscription, telling each handler why.
    fn fail_all(&self, reason: &str) {
        let drained: Vec<Slot> = self.slots.lock().drain().map(|(_, slot)| slot).collect();
        for mut handler in drained.into_iter().filter_map(|slot| slot.handler) {
            handler.handle(QueryEvent::Failed(reason.to_string()));
        }
    }

    /// Put a handler back unless its subscription ended while it ran.
    fn restore(&self, id: SubscriptionId, handler: Box<dyn SnapshotHandler>) {
        if let Some(slot) = self.slots.lock().get_mut(&id) {
            slot.handler = Some(handler);
        }
    }
}

/// Drains the event queue and applies each event.
pub struct Dispatcher {
    sender: Sender<Event>,
    receiver: Receiver<Event>,
    table: Arc<SubscriptionTable>,
    identity: IdentitySession,
}

impl Dispatcher {
    pub fn new() -> Self {
        let (sender, receiver) = unbounded();
        Self {
            sender,
            receiver,
            table: Arc::new(SubscriptionTable::default()),
            identity: IdentitySession::new(),
        }
    }

    /// Producer side of the queue.
    pub fn sender(&self) -> Sender<Event> {
        self.sender.clone()
    }

    /// Read-only view of the identity this dispatcher maintains.
    pub fn identity(&self) -> Identity {
        self.identity.reader()
    }

    pub(crate) fn table(&self) -> Arc<SubscriptionTable> {
        Arc::clone(&self.table)
    }

    /// Number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.table.len()
    }

    /// Events waiting to be processed.
    pub fn pending(&self) -> usize {
        self.receiver.len()
    }

    /// Apply one event to completion.
    pub fn dispatch(&mut self, event: Event) {
        match event {
            Event::Identity(event) => self.identity.apply(event),
            Event::Query {
                subscription,
                event,
            } => match self.table.take(subscription) {
                Some(mut handler) => {
                    handler.handle(event);
                    self.table.restore(subscription, handler);
                }
                None => debug!("Discarding event for ended {:?}", subscription),
            },
        }
    }

    /// Process every event already queued. Returns how many were handled.
    pub fn run_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.receiver.try_recv() {
            self.dispatch(event);
            handled += 1;
        }
        handled
    }

    /// Process events until the queue stays empty for `idle`.
    pub fn run_for(&mut self, idle: Duration) -> usize {
        let mut handled = 0;
        loop {
            match self.receiver.recv_timeout(idle) {
                Ok(event) => {
                    self.dispatch(event);
                    handled += 1;
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    return handled
                }
            }
        }
    }

    /// Process events until `done` holds or `timeout` passes. Returns
    /// whether `done` held.
    pub fn run_until(&mut self, timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.run_pending();
            if done() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            if let Ok(event) = self.receiver.recv_timeout(deadline - now) {
                self.dispatch(event);
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.table.fail_all("event queue closed");
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

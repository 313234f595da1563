//! Typed snapshot subscriptions.
//!
//! A [`LiveQuery`] turns a standing store query into a [`LiveList`] that is
//! replaced wholesale by every delivered snapshot. There is no diffing or
//! patching: after snapshot *n* is applied the list equals snapshot *n*.
//!
//! A subscription is either active or unsubscribed. Unsubscribing (or
//! dropping the handle) is the only way to stop deliveries, is idempotent,
//! and no snapshot is applied after it returns. Subscribing again creates a
//! new, independent subscription that starts from a fresh initial read.

use crate::error::{Result, SyncError};
use crate::events::{Event, SnapshotHandler, SubscriptionId, SubscriptionTable};
use crate::records::FromDocument;
use crate::store::{DocumentStore, QueryEvent};
use crate::types::{ListenerId, Query};
use crossbeam_channel::Sender;
use parking_lot::RwLock;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, warn};

/// Lifecycle of one subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriptionState {
    Active,
    Unsubscribed,
}

struct ListInner<T> {
    items: Arc<Vec<T>>,
    /// Sequence of the applied snapshot (0 = none yet).
    sequence: u64,
    has_pending_writes: bool,
    state: SubscriptionState,
    /// Set while the data is stale because the store failed us.
    error: Option<String>,
}

/// Locally materialized result of a live query.
pub struct LiveList<T> {
    inner: Arc<RwLock<ListInner<T>>>,
}

impl<T> Clone for LiveList<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> LiveList<T> {
    fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(ListInner {
                items: Arc::new(Vec::new()),
                sequence: 0,
                has_pending_writes: false,
                state: SubscriptionState::Active,
                error: None,
            })),
        }
    }

    /// The current snapshot.
    pub fn items(&self) -> Arc<Vec<T>> {
        Arc::clone(&self.inner.read().items)
    }

    pub fn len(&self) -> usize {
        self.inner.read().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sequence number of the applied snapshot; 0 before the initial read.
    pub fn sequence(&self) -> u64 {
        self.inner.read().sequence
    }

    pub fn has_pending_writes(&self) -> bool {
        self.inner.read().has_pending_writes
    }

    pub fn state(&self) -> SubscriptionState {
        self.inner.read().state
    }

    /// Why the list is stale, if it is.
    pub fn error(&self) -> Option<String> {
        self.inner.read().error.clone()
    }

    pub fn is_degraded(&self) -> bool {
        self.inner.read().error.is_some()
    }

    fn replace(&self, items: Vec<T>, sequence: u64, has_pending_writes: bool) -> Arc<Vec<T>> {
        let mut inner = self.inner.write();
        inner.items = Arc::new(items);
        inner.sequence = sequence;
        inner.has_pending_writes = has_pending_writes;
        inner.error = None;
        Arc::clone(&inner.items)
    }

    fn degrade(&self, reason: String) {
        self.inner.write().error = Some(reason);
    }

    fn mark_unsubscribed(&self) {
        self.inner.write().state = SubscriptionState::Unsubscribed;
    }
}

type SnapshotCallback<T> = Box<dyn FnMut(&[T]) + Send>;

/// Applies deliveries of one subscription to its list.
struct LiveQueryHandler<T> {
    query: Query,
    list: LiveList<T>,
    on_snapshot: Option<SnapshotCallback<T>>,
}

impl<T> SnapshotHandler for LiveQueryHandler<T>
where
    T: FromDocument + Send + Sync + 'static,
{
    fn handle(&mut self, event: QueryEvent) {
        match event {
            QueryEvent::Snapshot(snapshot) => {
                if snapshot.sequence <= self.list.sequence() {
                    debug!(
                        "Ignoring stale snapshot {} on {}",
                        snapshot.sequence, self.query.collection
                    );
                    return;
                }

                let decoded: Result<Vec<T>> =
                    snapshot.documents.iter().map(T::from_document).collect();
                match decoded {
                    Ok(items) => {
                        let items =
                            self.list
                                .replace(items, snapshot.sequence, snapshot.has_pending_writes);
                        debug!(
                            "Applied snapshot {} on {} ({} items)",
                            snapshot.sequence,
                            self.query.collection,
                            items.len()
                        );
                        if let Some(callback) = self.on_snapshot.as_mut() {
                            callback(&items);
                        }
                    }
                    Err(e) => {
                        warn!(
                            "Snapshot {} on {} rejected, keeping previous list: {}",
                            snapshot.sequence, self.query.collection, e
                        );
                        self.list.degrade(e.to_string());
                    }
                }
            }
            QueryEvent::Failed(reason) => {
                warn!("Live query on {} failed: {}", self.query.collection, reason);
                self.list.degrade(reason);
            }
        }
    }
}

/// Owned handle of an active subscription.
pub struct SubscriptionHandle {
    id: SubscriptionId,
    listener: ListenerId,
    store: Arc<dyn DocumentStore>,
    table: Arc<SubscriptionTable>,
    on_unsubscribe: Box<dyn Fn() + Send + Sync>,
    active: bool,
}

impl SubscriptionHandle {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Stop deliveries. Safe to call more than once.
    pub fn unsubscribe(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        self.store.unlisten(self.listener);
        self.table.remove(self.id);
        (self.on_unsubscribe)();
        debug!("Unsubscribed {:?}", self.id);
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

/// A typed live query: its handle plus the list it maintains.
pub struct LiveQuery<T> {
    handle: SubscriptionHandle,
    list: LiveList<T>,
}

impl<T> LiveQuery<T> {
    pub fn list(&self) -> &LiveList<T> {
        &self.list
    }

    pub fn items(&self) -> Arc<Vec<T>> {
        self.list.items()
    }

    pub fn unsubscribe(&mut self) {
        self.handle.unsubscribe();
    }

    pub fn into_parts(self) -> (SubscriptionHandle, LiveList<T>) {
        (self.handle, self.list)
    }
}

/// Opens live queries whose deliveries go through the event queue.
#[derive(Clone)]
pub struct LiveQueries {
    store: Arc<dyn DocumentStore>,
    table: Arc<SubscriptionTable>,
    sender: Sender<Event>,
}

impl LiveQueries {
    pub(crate) fn new(
        store: Arc<dyn DocumentStore>,
        table: Arc<SubscriptionTable>,
        sender: Sender<Event>,
    ) -> Self {
        Self {
            store,
            table,
            sender,
        }
    }

    /// Subscribe to `query`, materializing results as `T`.
    pub fn subscribe<T>(&self, query: Query) -> Result<LiveQuery<T>>
    where
        T: FromDocument + Send + Sync + 'static,
    {
        self.open(query, None)
    }

    /// Like [`subscribe`](Self::subscribe), also calling `on_snapshot` after
    /// each applied snapshot.
    pub fn subscribe_with<T, F>(&self, query: Query, on_snapshot: F) -> Result<LiveQuery<T>>
    where
        T: FromDocument + Send + Sync + 'static,
        F: FnMut(&[T]) + Send + 'static,
    {
        self.open(query, Some(Box::new(on_snapshot)))
    }

    fn open<T>(&self, query: Query, on_snapshot: Option<SnapshotCallback<T>>) -> Result<LiveQuery<T>>
    where
        T: FromDocument + Send + Sync + 'static,
    {
        query.validate()?;
        let list = LiveList::new();
        let id = self.table.insert(Box::new(LiveQueryHandler {
            query: query.clone(),
            list: list.clone(),
            on_snapshot,
        }));

        let sender = self.sender.clone();
        let forward = Box::new(move |event: QueryEvent| {
            let sent = sender.send(Event::Query {
                subscription: id,
                event,
            });
            if sent.is_err() {
                warn!("Event queue closed, dropping {:?}", id);
            }
            sent.is_ok()
        });

        let listener = match self.store.listen(&query, forward) {
            Ok(listener) => listener,
            Err(e) => {
                self.table.remove(id);
                warn!("Could not open live query on {}: {}", query.collection, e);
                return Err(match e {
                    SyncError::Subscription(_) | SyncError::InvalidQuery(_) => e,
                    other => SyncError::Subscription(other.to_string()),
                });
            }
        };
        debug!("Subscribed {:?} to {}", id, query.collection);

        let unsubscribed = list.clone();
        Ok(LiveQuery {
            handle: SubscriptionHandle {
                id,
                listener,
                store: Arc::clone(&self.store),
                table: Arc::clone(&self.table),
                on_unsubscribe: Box::new(move || unsubscribed.mark_unsubscribed()),
                active: true,
            },
            list,
        })
    }
}

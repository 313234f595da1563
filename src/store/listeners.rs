//! Listener registry: fans full snapshots out to standing queries.

use super::{QueryCallback, QueryEvent, QuerySnapshot};
use crate::error::{Result, SyncError};
use crate::types::{CollectionPath, Document, DocumentId, ListenerId, Query};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

/// Internal listener state.
struct Listener {
    query: Query,
    callback: QueryCallback,
    /// Snapshots delivered so far.
    delivered: u64,
}

impl Listener {
    /// Returns false if the callback no longer accepts events.
    fn deliver(&mut self, docs: &BTreeMap<DocumentId, Document>) -> bool {
        let mut documents: Vec<Document> = docs
            .values()
            .filter(|d| self.query.matches(d))
            .cloned()
            .collect();
        documents.sort_by(|a, b| self.query.compare(a, b));

        self.delivered += 1;
        let snapshot = QuerySnapshot {
            sequence: self.delivered,
            has_pending_writes: documents.iter().any(|d| d.has_pending_writes),
            documents,
        };
        (self.callback)(QueryEvent::Snapshot(snapshot))
    }
}

/// Active listeners of one store. Lives under the store's write lock, which
/// serializes every delivery to a given listener.
pub(crate) struct ListenerRegistry {
    listeners: HashMap<ListenerId, Listener>,
    next_id: u64,
    max_listeners: usize,
}

impl ListenerRegistry {
    pub fn new(max_listeners: usize) -> Self {
        Self {
            listeners: HashMap::new(),
            next_id: 1,
            max_listeners,
        }
    }

    /// Register a listener and deliver its initial snapshot.
    pub fn register(
        &mut self,
        query: Query,
        callback: QueryCallback,
        docs: &BTreeMap<DocumentId, Document>,
    ) -> Result<ListenerId> {
        if self.listeners.len() >= self.max_listeners {
            return Err(SyncError::Subscription(format!(
                "listener limit of {} reached",
                self.max_listeners
            )));
        }

        let id = ListenerId(self.next_id);
        self.next_id += 1;

        let mut listener = Listener {
            query,
            callback,
            delivered: 0,
        };
        if !listener.deliver(docs) {
            return Err(SyncError::Subscription(format!(
                "receiver for {} is gone",
                listener.query.collection
            )));
        }
        debug!("Listener {:?} attached to {}", id, listener.query.collection);
        self.listeners.insert(id, listener);

        Ok(id)
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn remove(&mut self, id: ListenerId) -> bool {
        self.listeners.remove(&id).is_some()
    }

    /// Deliver a fresh snapshot to every listener on `collection`.
    pub fn notify(
        &mut self,
        collection: &CollectionPath,
        docs: &BTreeMap<DocumentId, Document>,
    ) {
        let mut dropped = Vec::new();
        for (id, listener) in self.listeners.iter_mut() {
            if &listener.query.collection == collection && !listener.deliver(docs) {
                dropped.push(*id);
            }
        }

        for id in dropped {
            self.listeners.remove(&id);
            warn!("Dropped listener {:?} on {}: receiver gone", id, collection);
        }
    }

    /// Fail and drop every listener.
    pub fn fail_all(&mut self, reason: &str) {
        for (_, listener) in self.listeners.drain() {
            (listener.callback)(QueryEvent::Failed(reason.to_string()));
        }
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }
}

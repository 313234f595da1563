//! Binds subscriptions to the scopes that asked for them.
//!
//! A scope is a mounted view (the feed, one expanded post). Each scope owns
//! at most one live subscription per collection, tracked here under a
//! [`ScopeKey`]. Opening a key that is already live tears the old
//! subscription down before the new one starts, and a [`ScopeGuard`] tears
//! its subscription down when dropped, on every exit path.

use crate::error::Result;
use crate::live_query::SubscriptionHandle;
use crate::types::CollectionPath;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Identity of a subscription scope: which collection, for which view.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ScopeKey {
    pub collection: CollectionPath,
    pub scope: String,
}

impl ScopeKey {
    pub fn new(collection: CollectionPath, scope: impl Into<String>) -> Self {
        Self {
            collection,
            scope: scope.into(),
        }
    }
}

impl fmt::Debug for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ScopeKey({} @ {})", self.collection, self.scope)
    }
}

struct ScopeEntry {
    generation: u64,
    handle: SubscriptionHandle,
}

#[derive(Default)]
struct Scopes {
    live: HashMap<ScopeKey, ScopeEntry>,
    next_generation: u64,
}

/// Registry of live scopes.
#[derive(Default)]
pub struct ScopeRegistry {
    scopes: Mutex<Scopes>,
}

impl ScopeRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Open `key` with the subscription `subscribe` creates.
    ///
    /// Any subscription already live under `key` is torn down first.
    pub fn open<F>(self: &Arc<Self>, key: ScopeKey, subscribe: F) -> Result<ScopeGuard>
    where
        F: FnOnce() -> Result<SubscriptionHandle>,
    {
        let (guard, ()) = self.open_with(key, || subscribe().map(|handle| (handle, ())))?;
        Ok(guard)
    }

    /// Like [`open`](Self::open), passing back whatever else `subscribe`
    /// produced alongside the handle (typically its live list).
    pub fn open_with<F, R>(self: &Arc<Self>, key: ScopeKey, subscribe: F) -> Result<(ScopeGuard, R)>
    where
        F: FnOnce() -> Result<(SubscriptionHandle, R)>,
    {
        let replaced = self.scopes.lock().live.remove(&key);
        if let Some(mut old) = replaced {
            info!("Re-entering {:?}, replacing generation {}", key, old.generation);
            old.handle.unsubscribe();
        }

        let (handle, extra) = subscribe()?;

        let mut scopes = self.scopes.lock();
        scopes.next_generation += 1;
        let generation = scopes.next_generation;
        // A concurrent open of the same key may have landed meanwhile.
        if let Some(mut raced) = scopes.live.insert(key.clone(), ScopeEntry { generation, handle }) {
            raced.handle.unsubscribe();
        }
        debug!("Opened {:?} (generation {})", key, generation);

        let guard = ScopeGuard {
            key,
            generation,
            registry: Arc::clone(self),
        };
        Ok((guard, extra))
    }

    /// Whether `key` has a live subscription.
    pub fn is_open(&self, key: &ScopeKey) -> bool {
        self.scopes.lock().live.contains_key(key)
    }

    /// Number of live scopes.
    pub fn len(&self) -> usize {
        self.scopes.lock().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tear down every live scope.
    pub fn close_all(&self) {
        let drained: Vec<ScopeEntry> = self.scopes.lock().live.drain().map(|(_, e)| e).collect();
        for mut entry in drained {
            entry.handle.unsubscribe();
        }
    }

    fn close(&self, key: &ScopeKey, generation: u64) {
        let entry = {
            let mut scopes = self.scopes.lock();
            match scopes.live.get(key) {
                Some(entry) if entry.generation == generation => scopes.live.remove(key),
                _ => None,
            }
        };
        if let Some(mut entry) = entry {
            entry.handle.unsubscribe();
            debug!("Closed {:?} (generation {})", key, generation);
        }
    }
}

/// Ownership of one open scope. Dropping it tears the subscription down,
/// unless a newer open of the same key has already replaced it.
pub struct ScopeGuard {
    key: ScopeKey,
    generation: u64,
    registry: Arc<ScopeRegistry>,
}

impl ScopeGuard {
    pub fn key(&self) -> &ScopeKey {
        &self.key
    }

    /// Whether this guard's subscription is still the live one for its key.
    pub fn is_current(&self) -> bool {
        self.registry
            .scopes
            .lock()
            .live
            .get(&self.key)
            .is_some_and(|e| e.generation == self.generation)
    }

    /// Close explicitly; same as dropping.
    pub fn close(self) {}
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        self.registry.close(&self.key, self.generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use crate::events::Dispatcher;
    use crate::live_query::{LiveQueries, SubscriptionState};
    use crate::records::Post;
    use crate::store::LocalStore;
    use crate::types::{Direction, Query};

    fn setup() -> (Dispatcher, Arc<LocalStore>, LiveQueries, Arc<ScopeRegistry>) {
        let dispatcher = Dispatcher::new();
        let store = Arc::new(LocalStore::in_memory());
        let queries = LiveQueries::new(store.clone(), dispatcher.table(), dispatcher.sender());
        (dispatcher, store, queries, ScopeRegistry::new())
    }

    fn feed_key() -> ScopeKey {
        ScopeKey::new(CollectionPath::root("posts"), "feed")
    }

    fn feed_query() -> Query {
        Query::new(CollectionPath::root("posts"), "timestamp", Direction::Descending)
    }

    #[test]
    fn test_guard_drop_tears_down() {
        let (_d, store, queries, registry) = setup();

        let guard = registry
            .open(feed_key(), || Ok(queries.subscribe::<Post>(feed_query())?.into_parts().0))
            .unwrap();
        assert!(registry.is_open(&feed_key()));
        assert_eq!(store.listener_count(), 1);

        drop(guard);
        assert!(!registry.is_open(&feed_key()));
        assert_eq!(store.listener_count(), 0);
    }

    #[test]
    fn test_reopen_replaces_instead_of_accumulating() {
        let (_d, store, queries, registry) = setup();

        let (handle, first_list) = queries.subscribe::<Post>(feed_query()).unwrap().into_parts();
        let first = registry.open(feed_key(), || Ok(handle)).unwrap();

        let (handle, second_list) = queries.subscribe::<Post>(feed_query()).unwrap().into_parts();
        let second = registry.open(feed_key(), || Ok(handle)).unwrap();

        assert_eq!(registry.len(), 1);
        assert_eq!(store.listener_count(), 1);
        assert_eq!(first_list.state(), SubscriptionState::Unsubscribed);
        assert_eq!(second_list.state(), SubscriptionState::Active);
        assert!(!first.is_current());
        assert!(second.is_current());

        // The stale guard must not close the newer subscription.
        drop(first);
        assert!(registry.is_open(&feed_key()));
        assert_eq!(store.listener_count(), 1);

        drop(second);
        assert_eq!(store.listener_count(), 0);
    }

    #[test]
    fn test_failed_open_leaves_no_scope() {
        let (_d, _store, _queries, registry) = setup();
        let result = registry.open(feed_key(), || Err(SyncError::Subscription("down".into())));
        assert!(result.is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_distinct_scopes_coexist() {
        let (_d, store, queries, registry) = setup();
        let a = ScopeKey::new(CollectionPath::root("posts"), "feed");
        let b = ScopeKey::new(CollectionPath::root("posts"), "sidebar");

        let _ga = registry
            .open(a, || Ok(queries.subscribe::<Post>(feed_query())?.into_parts().0))
            .unwrap();
        let _gb = registry
            .open(b, || Ok(queries.subscribe::<Post>(feed_query())?.into_parts().0))
            .unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(store.listener_count(), 2);

        registry.close_all();
        assert_eq!(store.listener_count(), 0);
    }
}

//! In-process document store.

use super::listeners::ListenerRegistry;
use super::log::{Mutation, MutationLog};
use super::{DocumentStore, QueryCallback};
use crate::error::{Result, SyncError};
use crate::types::{
    CollectionPath, Document, DocumentId, ListenerId, NewDocument, Query, Timestamp,
};
use fs2::FileExt;
use parking_lot::Mutex;
use rand::distr::Alphanumeric;
use rand::Rng;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Magic bytes for store manifest.
const STORE_MAGIC: &[u8; 4] = b"FDS\0";

/// Current store format version.
const STORE_VERSION: u8 = 1;

/// Length of store-assigned document ids.
const DOCUMENT_ID_LEN: usize = 20;

/// Store configuration.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Directory for the durable log (None = memory only).
    pub path: Option<PathBuf>,

    /// Sync the log every N writes.
    pub sync_interval: u64,

    /// Max concurrent listeners.
    pub max_listeners: usize,

    /// Publish a pending snapshot before each committed add.
    pub latency_compensation: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            sync_interval: 1,
            max_listeners: 1024,
            latency_compensation: false,
        }
    }
}

struct StoreState {
    collections: HashMap<CollectionPath, BTreeMap<DocumentId, Document>>,
    listeners: ListenerRegistry,
    /// Last assigned server timestamp.
    last_commit: Timestamp,
    closed: bool,
}

impl StoreState {
    fn new(max_listeners: usize) -> Self {
        Self {
            collections: HashMap::new(),
            listeners: ListenerRegistry::new(max_listeners),
            last_commit: Timestamp(0),
            closed: false,
        }
    }

    /// Next server timestamp; strictly increasing.
    fn next_commit(&mut self) -> Timestamp {
        let now = Timestamp::now();
        let next = if now > self.last_commit {
            now
        } else {
            Timestamp(self.last_commit.0 + 1)
        };
        self.last_commit = next;
        next
    }

    fn new_document_id(&self, collection: &CollectionPath) -> DocumentId {
        let existing = self.collections.get(collection);
        loop {
            let id: String = rand::rng()
                .sample_iter(&Alphanumeric)
                .take(DOCUMENT_ID_LEN)
                .map(char::from)
                .collect();
            let id = DocumentId(id);
            if existing.map_or(true, |docs| !docs.contains_key(&id)) {
                return id;
            }
        }
    }

    fn parent_exists(&self, collection: &CollectionPath) -> bool {
        match collection.parent() {
            None => true,
            Some((parent, id)) => self
                .collections
                .get(&parent)
                .is_some_and(|docs| docs.contains_key(&id)),
        }
    }

    fn notify(&mut self, collection: &CollectionPath) {
        let empty = BTreeMap::new();
        let docs = self.collections.get(collection).unwrap_or(&empty);
        self.listeners.notify(collection, docs);
    }

    fn put(&mut self, doc: Document) {
        self.collections
            .entry(doc.collection.clone())
            .or_default()
            .insert(doc.id.clone(), doc);
    }

    /// Remove a document and every collection scoped under it.
    /// Returns the collections that changed.
    fn remove(&mut self, collection: &CollectionPath, id: &DocumentId) -> Vec<CollectionPath> {
        let mut changed = Vec::new();
        if let Some(docs) = self.collections.get_mut(collection) {
            if docs.remove(id).is_some() {
                changed.push(collection.clone());
            }
        }

        let prefix = format!("{}/{}/", collection, id);
        let nested: Vec<CollectionPath> = self
            .collections
            .keys()
            .filter(|path| path.as_str().starts_with(&prefix))
            .cloned()
            .collect();
        for path in nested {
            self.collections.remove(&path);
            changed.push(path);
        }
        changed
    }
}

/// In-process [`DocumentStore`] with optional on-disk durability.
///
/// Every mutation and every delivery happens under one lock, so each
/// listener sees snapshots in commit order.
pub struct LocalStore {
    config: StoreConfig,
    state: Mutex<StoreState>,
    log: Option<MutationLog>,
    _lock_file: Option<File>,
}

impl LocalStore {
    /// Open a store. With a `path`, the directory is created if missing,
    /// locked, and its mutation log replayed.
    pub fn open(config: StoreConfig) -> Result<Self> {
        let mut state = StoreState::new(config.max_listeners);

        let (log, lock_file) = match &config.path {
            None => (None, None),
            Some(path) => {
                if path.join("MANIFEST").exists() {
                    Self::verify_manifest(path)?;
                } else {
                    fs::create_dir_all(path)?;
                    Self::write_manifest(path)?;
                }
                let lock_file = Self::acquire_lock(path)?;

                let (log, mutations) =
                    MutationLog::open(path.join("mutations.log"), config.sync_interval)?;
                let count = mutations.len();
                for mutation in mutations {
                    match mutation {
                        Mutation::Put(doc) => {
                            if doc.update_time > state.last_commit {
                                state.last_commit = doc.update_time;
                            }
                            state.put(doc);
                        }
                        Mutation::Delete { collection, id } => {
                            state.remove(&collection, &id);
                        }
                    }
                }
                info!("Opened store at {} ({} mutations replayed)", path.display(), count);
                (Some(log), Some(lock_file))
            }
        };

        Ok(Self {
            config,
            state: Mutex::new(state),
            log,
            _lock_file: lock_file,
        })
    }

    /// Memory-only store with default settings.
    pub fn in_memory() -> Self {
        let config = StoreConfig::default();
        Self {
            state: Mutex::new(StoreState::new(config.max_listeners)),
            config,
            log: None,
            _lock_file: None,
        }
    }

    /// One-shot read of a query's current result set.
    pub fn get(&self, query: &Query) -> Result<Vec<Document>> {
        query.validate()?;
        let state = self.state.lock();
        if state.closed {
            return Err(SyncError::Closed);
        }
        let mut docs: Vec<Document> = state
            .collections
            .get(&query.collection)
            .map(|docs| docs.values().filter(|d| query.matches(d)).cloned().collect())
            .unwrap_or_default();
        docs.sort_by(|a, b| query.compare(a, b));
        Ok(docs)
    }

    /// Number of active listeners.
    pub fn listener_count(&self) -> usize {
        self.state.lock().listeners.len()
    }

    /// Stop serving: every listener gets a `Failed` event, later calls
    /// return [`SyncError::Closed`].
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        state.listeners.fail_all("store closed");
        info!("Store closed");
        if let Some(log) = &self.log {
            log.sync()?;
        }
        Ok(())
    }

    fn write_manifest(path: &Path) -> Result<()> {
        use std::io::Write;

        let mut file = File::create(path.join("MANIFEST"))?;
        file.write_all(STORE_MAGIC)?;
        file.write_all(&[STORE_VERSION])?;
        file.sync_all()?;
        Ok(())
    }

    fn verify_manifest(path: &Path) -> Result<()> {
        use std::io::Read;

        let mut file = File::open(path.join("MANIFEST"))?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != STORE_MAGIC {
            return Err(SyncError::InvalidFormat("Invalid store magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != STORE_VERSION {
            return Err(SyncError::InvalidFormat(format!(
                "Unsupported store version: {}",
                version[0]
            )));
        }
        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_file = File::create(path.join("LOCK"))?;
        lock_file.try_lock_exclusive().map_err(|_| SyncError::Locked)?;
        Ok(lock_file)
    }

    fn persist(&self, mutation: &Mutation) -> Result<()> {
        match &self.log {
            Some(log) => log
                .append(mutation)
                .map_err(|e| SyncError::Write(format!("mutation log: {}", e))),
            None => Ok(()),
        }
    }
}

impl DocumentStore for LocalStore {
    fn add(&self, collection: &CollectionPath, doc: NewDocument) -> Result<DocumentId> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(SyncError::Closed);
        }
        if !state.parent_exists(collection) {
            return Err(SyncError::Write(format!(
                "parent document of {} does not exist",
                collection
            )));
        }

        let id = state.new_document_id(collection);
        let commit = state.next_commit();
        let mut data = doc.fields;

        if self.config.latency_compensation && !doc.server_timestamps.is_empty() {
            let mut pending = data.clone();
            for field in &doc.server_timestamps {
                pending.insert(field.clone(), Value::Null);
            }
            state.put(Document {
                id: id.clone(),
                collection: collection.clone(),
                data: pending,
                update_time: commit,
                has_pending_writes: true,
            });
            state.notify(collection);
        }

        for field in &doc.server_timestamps {
            data.insert(field.clone(), Value::from(commit.0));
        }
        let committed = Document {
            id: id.clone(),
            collection: collection.clone(),
            data,
            update_time: commit,
            has_pending_writes: false,
        };

        if let Err(e) = self.persist(&Mutation::Put(committed.clone())) {
            if self.config.latency_compensation {
                state.remove(collection, &id);
                state.notify(collection);
            }
            return Err(e);
        }

        state.put(committed);
        state.notify(collection);
        debug!("Added {} to {}", id, collection);

        Ok(id)
    }

    fn delete(&self, collection: &CollectionPath, id: &DocumentId) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(SyncError::Closed);
        }
        let exists = state
            .collections
            .get(collection)
            .is_some_and(|docs| docs.contains_key(id));
        if !exists {
            return Err(SyncError::DocumentNotFound(format!("{}/{}", collection, id)));
        }

        self.persist(&Mutation::Delete {
            collection: collection.clone(),
            id: id.clone(),
        })?;

        for changed in state.remove(collection, id) {
            state.notify(&changed);
        }
        debug!("Deleted {} from {}", id, collection);
        Ok(())
    }

    fn listen(&self, query: &Query, on_event: QueryCallback) -> Result<ListenerId> {
        query.validate()?;
        let mut state = self.state.lock();
        if state.closed {
            return Err(SyncError::Closed);
        }

        let state = &mut *state;
        let empty = BTreeMap::new();
        let docs = state.collections.get(&query.collection).unwrap_or(&empty);
        state.listeners.register(query.clone(), on_event, docs)
    }

    fn unlisten(&self, id: ListenerId) {
        if self.state.lock().listeners.remove(id) {
            debug!("Listener {:?} detached", id);
        }
    }
}

impl Drop for LocalStore {
    fn drop(&mut self) {
        if let Some(log) = &self.log {
            let _ = log.sync();
        }
    }
}

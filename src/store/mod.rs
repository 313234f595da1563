//! Document store interface and an in-process implementation.
//!
//! A store holds collections of JSON documents and serves standing
//! queries. Every change to a collection produces a new, complete, ordered
//! snapshot for each listener on that collection; listeners never receive
//! diffs.
//!
//! # Example
//!
//! ```ignore
//! let store = LocalStore::open(StoreConfig::default())?;
//! let posts = CollectionPath::root("posts");
//!
//! let id = store.listen(
//!     &Query::new(posts.clone(), "timestamp", Direction::Descending),
//!     Box::new(|event| {
//!         println!("{:?}", event);
//!         true
//!     }),
//! )?;
//!
//! store.add(&posts, NewDocument::json(&json!({"text": "hi"}))?.with_server_timestamp("timestamp"))?;
//! store.unlisten(id);
//! ```

mod listeners;
mod local;
mod log;

pub use local::{LocalStore, StoreConfig};

use crate::error::Result;
use crate::types::{CollectionPath, Document, DocumentId, ListenerId, NewDocument, Query};

/// A complete, ordered result set for one query.
#[derive(Clone, Debug, PartialEq)]
pub struct QuerySnapshot {
    /// Per-listener delivery number, starting at 1 for the initial read.
    pub sequence: u64,
    pub documents: Vec<Document>,
    /// Some document still waits for server-assigned fields.
    pub has_pending_writes: bool,
}

/// What a listener receives.
#[derive(Clone, Debug, PartialEq)]
pub enum QueryEvent {
    Snapshot(QuerySnapshot),
    /// The store can no longer serve this listener. No events follow.
    Failed(String),
}

/// Listener callback. Invoked by the store while it holds its write lock,
/// so it must not call back into the store.
///
/// Returns false once nothing receives the events any more; the store then
/// drops the listener.
pub type QueryCallback = Box<dyn Fn(QueryEvent) -> bool + Send + Sync>;

/// The remote document store, as seen by the sync core.
pub trait DocumentStore: Send + Sync {
    /// Append a document; the store assigns its id and server timestamps.
    fn add(&self, collection: &CollectionPath, doc: NewDocument) -> Result<DocumentId>;

    /// Remove a document and everything scoped under it.
    fn delete(&self, collection: &CollectionPath, id: &DocumentId) -> Result<()>;

    /// Open a standing query. The initial snapshot is delivered before
    /// this returns; if the callback refuses it, the query is not opened.
    fn listen(&self, query: &Query, on_event: QueryCallback) -> Result<ListenerId>;

    /// Stop a standing query. Unknown ids are ignored.
    fn unlisten(&self, id: ListenerId);
}

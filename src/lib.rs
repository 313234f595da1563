//! # Feed Sync
//!
//! Real-time synchronization core for a social feed: posts with optional
//! images, and comment threads under each post, kept consistent with a
//! document store that pushes a fresh snapshot on every change.
//!
//! ## Core Concepts
//!
//! - **Live queries**: standing store queries whose local list is replaced
//!   wholesale by each delivered snapshot
//! - **Scopes**: views that own their subscriptions; re-entering a scope
//!   replaces its subscription instead of adding one
//! - **Write path**: identity-checked appends with server-assigned
//!   timestamps, publishing media before the record is written
//! - **Event queue**: store deliveries and identity changes are applied
//!   one at a time on the thread that runs the dispatcher
//!
//! ## Example
//!
//! ```ignore
//! use feed_sync::{ClientConfig, FeedClient, LocalAuthProvider, LocalStore};
//!
//! let mut client = FeedClient::new(
//!     Arc::new(LocalStore::in_memory()),
//!     Arc::new(FsBlobStore::new(BlobStoreConfig::default())?),
//!     Arc::new(LocalAuthProvider::new()),
//!     ClientConfig::default(),
//! );
//!
//! client.sign_in_with_email("kim@example.com", "secret1")?;
//! let feed = client.open_feed()?;
//!
//! client.create_post("Hello, world!", None)?;
//! client.run_pending();
//!
//! for post in feed.posts().iter() {
//!     println!("{}: {}", post.author_name, post.text);
//! }
//! ```

pub mod auth;
pub mod blobs;
pub mod client;
pub mod error;
pub mod events;
pub mod feed;
pub mod identity;
pub mod lifecycle;
pub mod live_query;
pub mod media;
pub mod records;
pub mod store;
pub mod types;
pub mod write_path;

pub use auth::{AuthProvider, FederatedCredential, LocalAuthProvider, Registration};
pub use blobs::{BlobSink, BlobStoreConfig, FsBlobStore};
pub use client::{ClientConfig, FeedClient, SyncContext};
pub use error::{ErrorKind, Result, SyncError};
pub use events::{Dispatcher, Event, SubscriptionId};
pub use feed::{FeedView, PostThread};
pub use identity::{Identity, IdentityEvent, IdentitySession, User};
pub use lifecycle::{ScopeGuard, ScopeKey, ScopeRegistry};
pub use live_query::{LiveList, LiveQueries, LiveQuery, SubscriptionHandle, SubscriptionState};
pub use media::{MediaBlob, MediaPublisher};
pub use records::{Comment, CommentRecord, FromDocument, Post, PostRecord};
pub use store::{DocumentStore, LocalStore, QueryEvent, QuerySnapshot, StoreConfig};
pub use types::{
    CollectionPath, Direction, Document, DocumentId, NewDocument, Query, ServerTimestamp, Timestamp,
};
pub use write_path::WritePath;

//! The feed client: wires store, blob sink, and auth provider to the event
//! queue and the views built on it.

use crate::auth::{self, AuthProvider, FederatedCredential, ObserverId, Registration};
use crate::blobs::BlobSink;
use crate::error::Result;
use crate::events::{Dispatcher, Event};
use crate::feed::{FeedView, PostThread};
use crate::identity::{Identity, User};
use crate::lifecycle::ScopeRegistry;
use crate::live_query::LiveQueries;
use crate::media::{MediaBlob, MediaPublisher};
use crate::store::DocumentStore;
use crate::types::{CollectionPath, DocumentId};
use crate::write_path::WritePath;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Collection and folder names.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientConfig {
    /// Top-level collection of posts.
    pub posts_collection: String,

    /// Name of each post's comment sub-collection.
    pub comments_collection: String,

    /// Field both record kinds are ordered by.
    pub order_field: String,

    /// Blob folder for post images.
    pub image_folder: String,

    /// Blob folder for profile avatars.
    pub avatar_folder: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            posts_collection: "posts".to_string(),
            comments_collection: "comment".to_string(),
            order_field: "timestamp".to_string(),
            image_folder: "images".to_string(),
            avatar_folder: "avatars".to_string(),
        }
    }
}

impl ClientConfig {
    pub fn posts(&self) -> CollectionPath {
        CollectionPath::root(&self.posts_collection)
    }

    pub fn comments(&self, post_id: &DocumentId) -> CollectionPath {
        self.posts().subcollection(post_id, &self.comments_collection)
    }
}

/// What a view needs to open its subscriptions.
#[derive(Clone)]
pub struct SyncContext {
    live: LiveQueries,
    scopes: Arc<ScopeRegistry>,
    config: ClientConfig,
}

impl SyncContext {
    pub fn live(&self) -> &LiveQueries {
        &self.live
    }

    pub fn scopes(&self) -> &Arc<ScopeRegistry> {
        &self.scopes
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

/// A signed-in (or anonymous) session against one store.
///
/// Snapshots and identity changes are queued as they arrive and applied
/// only by [`run_pending`](Self::run_pending) and friends, on the calling
/// thread. Auth calls apply the identity change they cause before
/// returning.
pub struct FeedClient {
    dispatcher: Dispatcher,
    auth: Arc<dyn AuthProvider>,
    observer: ObserverId,
    media: MediaPublisher,
    writes: WritePath,
    ctx: SyncContext,
}

impl FeedClient {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        blobs: Arc<dyn BlobSink>,
        auth: Arc<dyn AuthProvider>,
        config: ClientConfig,
    ) -> Self {
        let mut dispatcher = Dispatcher::new();

        let sender = dispatcher.sender();
        let observer = auth.observe(Box::new(move |event| {
            if sender.send(Event::Identity(event)).is_err() {
                warn!("Event queue closed, identity change not applied");
            }
        }));

        let media = MediaPublisher::new(blobs);
        let writes = WritePath::new(
            Arc::clone(&store),
            dispatcher.identity(),
            media.clone(),
            config.clone(),
        );
        let ctx = SyncContext {
            live: LiveQueries::new(store, dispatcher.table(), dispatcher.sender()),
            scopes: ScopeRegistry::new(),
            config,
        };

        dispatcher.run_pending();
        info!("Feed client ready on {}", ctx.config.posts_collection);

        Self {
            dispatcher,
            auth,
            observer,
            media,
            writes,
            ctx,
        }
    }

    /// Apply every queued event.
    pub fn run_pending(&mut self) -> usize {
        self.dispatcher.run_pending()
    }

    /// Apply events until none arrive for `idle`.
    pub fn run_for(&mut self, idle: Duration) -> usize {
        self.dispatcher.run_for(idle)
    }

    /// Apply events until `done` holds or `timeout` passes.
    pub fn run_until(&mut self, timeout: Duration, done: impl FnMut() -> bool) -> bool {
        self.dispatcher.run_until(timeout, done)
    }

    pub fn identity(&self) -> Identity {
        self.dispatcher.identity()
    }

    pub fn current_user(&self) -> Option<User> {
        self.dispatcher.identity().current()
    }

    pub fn sign_in_with_email(&mut self, email: &str, password: &str) -> Result<User> {
        let user = self.auth.sign_in_with_email(email, password)?;
        self.run_pending();
        Ok(user)
    }

    pub fn create_user_with_email(&mut self, email: &str, password: &str) -> Result<User> {
        let user = self.auth.create_user_with_email(email, password)?;
        self.run_pending();
        Ok(user)
    }

    pub fn sign_in_federated(&mut self, credential: &FederatedCredential) -> Result<User> {
        let user = self.auth.sign_in_federated(credential)?;
        self.run_pending();
        Ok(user)
    }

    /// Sign up with a username and optional avatar.
    pub fn register(&mut self, registration: &Registration) -> Result<User> {
        let result = auth::register(
            self.auth.as_ref(),
            &self.media,
            &self.ctx.config.avatar_folder,
            registration,
        );
        // The account may exist even when the avatar failed.
        self.run_pending();
        result
    }

    pub fn send_password_reset(&self, email: &str) -> Result<()> {
        self.auth.send_password_reset(email)
    }

    pub fn sign_out(&mut self) -> Result<()> {
        self.auth.sign_out()?;
        self.run_pending();
        Ok(())
    }

    pub fn create_post(&self, text: &str, image: Option<&MediaBlob>) -> Result<DocumentId> {
        self.writes.create_post(text, image)
    }

    pub fn create_comment(&self, post_id: &DocumentId, text: &str) -> Result<DocumentId> {
        self.writes.create_comment(post_id, text)
    }

    /// A clonable write path, usable from other threads.
    pub fn writer(&self) -> WritePath {
        self.writes.clone()
    }

    pub fn context(&self) -> SyncContext {
        self.ctx.clone()
    }

    /// Open the feed view. Its snapshots arrive through the queue.
    pub fn open_feed(&self) -> Result<FeedView> {
        FeedView::open(&self.ctx)
    }

    /// A collapsed comment thread for `post_id`.
    pub fn thread(&self, post_id: DocumentId) -> PostThread {
        PostThread::new(self.ctx.clone(), post_id)
    }

    /// Number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.dispatcher.subscription_count()
    }
}

impl Drop for FeedClient {
    fn drop(&mut self) {
        self.auth.unobserve(self.observer);
        self.ctx.scopes.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::LocalAuthProvider;
    use crate::blobs::{BlobStoreConfig, FsBlobStore};
    use crate::error::SyncError;
    use crate::store::LocalStore;
    use tempfile::TempDir;

    struct Harness {
        _dir: TempDir,
        blobs: Arc<FsBlobStore>,
        auth: Arc<LocalAuthProvider>,
        client: FeedClient,
    }

    fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let blobs = Arc::new(
            FsBlobStore::new(BlobStoreConfig {
                path: dir.path().join("blobs"),
                cache_size: 8,
                base_url: Some("https://cdn.test".into()),
            })
            .unwrap(),
        );
        let auth = Arc::new(LocalAuthProvider::new());
        let client = FeedClient::new(
            Arc::new(LocalStore::in_memory()),
            blobs.clone(),
            auth.clone(),
            ClientConfig::default(),
        );
        Harness {
            _dir: dir,
            blobs,
            auth,
            client,
        }
    }

    #[test]
    fn test_default_config_paths() {
        let config = ClientConfig::default();
        assert_eq!(config.posts().as_str(), "posts");
        assert_eq!(config.comments(&DocumentId::from("p1")).as_str(), "posts/p1/comment");
    }

    #[test]
    fn test_auth_calls_update_identity() {
        let mut h = harness();
        assert!(h.client.current_user().is_none());

        let user = h.client.create_user_with_email("kim@example.com", "secret1").unwrap();
        assert_eq!(h.client.current_user(), Some(user));

        h.client.sign_out().unwrap();
        assert!(h.client.current_user().is_none());
    }

    #[test]
    fn test_register_publishes_avatar() {
        let mut h = harness();
        let user = h
            .client
            .register(&Registration {
                email: "kim@example.com".into(),
                password: "secret1".into(),
                username: "Kim".into(),
                avatar: Some(MediaBlob::new("me.png", "image/png", b"face".to_vec())),
            })
            .unwrap();

        assert_eq!(user.display_name, "Kim");
        let path = user.avatar_url.strip_prefix("https://cdn.test/").unwrap();
        assert!(path.starts_with("avatars/"));
        assert!(h.blobs.exists(path));

        let current = h.client.current_user().unwrap();
        assert_eq!(current.display_name, "Kim");
        assert_eq!(current.avatar_url, user.avatar_url);
    }

    #[test]
    fn test_register_rejects_bad_password() {
        let mut h = harness();
        let result = h.client.register(&Registration {
            email: "kim@example.com".into(),
            password: "123".into(),
            username: "Kim".into(),
            avatar: None,
        });
        assert!(matches!(result, Err(SyncError::Auth(_))));
        assert!(h.client.current_user().is_none());
    }

    #[test]
    fn test_password_reset_passthrough() {
        let mut h = harness();
        h.client.create_user_with_email("kim@example.com", "secret1").unwrap();
        h.client.send_password_reset("kim@example.com").unwrap();
        assert_eq!(h.auth.reset_requests().len(), 1);
    }

    #[test]
    fn test_drop_releases_subscriptions() {
        let h = harness();
        let store = Arc::new(LocalStore::in_memory());
        let client = FeedClient::new(
            store.clone(),
            h.blobs.clone(),
            h.auth.clone(),
            ClientConfig::default(),
        );
        let feed = client.open_feed().unwrap();
        assert_eq!(store.listener_count(), 1);

        drop(client);
        assert_eq!(store.listener_count(), 0);
        assert_eq!(feed.list().state(), crate::live_query::SubscriptionState::Unsubscribed);
    }
}

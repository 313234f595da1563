//! Feed and thread views: the scopes that own live queries.
//!
//! [`FeedView`] holds the post subscription for as long as it exists.
//! [`PostThread`] holds one post's comment subscription while expanded.

use crate::client::SyncContext;
use crate::error::Result;
use crate::lifecycle::{ScopeGuard, ScopeKey};
use crate::live_query::LiveList;
use crate::records::{Comment, Post};
use crate::types::{Direction, DocumentId, Query};
use std::sync::Arc;
use tracing::debug;

/// Scope name of the top-level feed.
pub const FEED_SCOPE: &str = "feed";

/// The top-level feed, newest post first.
pub struct FeedView {
    posts: LiveList<Post>,
    guard: ScopeGuard,
}

impl FeedView {
    /// Subscribe to the post collection. Replaces any feed already open on
    /// the same context.
    pub fn open(ctx: &SyncContext) -> Result<Self> {
        let query = Query::new(ctx.config().posts(), &ctx.config().order_field, Direction::Descending);
        let key = ScopeKey::new(query.collection.clone(), FEED_SCOPE);
        let (guard, posts) = ctx.scopes().open_with(key, || {
            Ok(ctx.live().subscribe::<Post>(query)?.into_parts())
        })?;
        Ok(Self { posts, guard })
    }

    /// Posts as of the last applied snapshot.
    pub fn posts(&self) -> Arc<Vec<Post>> {
        self.posts.items()
    }

    pub fn list(&self) -> &LiveList<Post> {
        &self.posts
    }

    /// Whether this view still owns the live feed subscription.
    pub fn is_live(&self) -> bool {
        self.guard.is_current()
    }

    /// Tear the subscription down.
    pub fn close(self) {}
}

/// One post's comment thread, collapsed until [`expand`](Self::expand)ed.
pub struct PostThread {
    post_id: DocumentId,
    ctx: SyncContext,
    comments: Option<(LiveList<Comment>, ScopeGuard)>,
}

impl PostThread {
    pub fn new(ctx: SyncContext, post_id: DocumentId) -> Self {
        Self {
            post_id,
            ctx,
            comments: None,
        }
    }

    pub fn post_id(&self) -> &DocumentId {
        &self.post_id
    }

    pub fn is_expanded(&self) -> bool {
        self.comments.is_some()
    }

    /// Start showing comments. Does nothing when already expanded and still
    /// live; re-subscribes when another thread for the same post took over.
    pub fn expand(&mut self) -> Result<()> {
        if let Some((_, guard)) = &self.comments {
            if guard.is_current() {
                return Ok(());
            }
        }
        // Release a stale guard before opening the replacement.
        self.comments = None;

        let config = self.ctx.config();
        let query = Query::new(
            config.comments(&self.post_id),
            &config.order_field,
            Direction::Descending,
        );
        let key = ScopeKey::new(query.collection.clone(), self.post_id.as_str());
        let live = self.ctx.live();
        let (guard, list) = self
            .ctx
            .scopes()
            .open_with(key, || Ok(live.subscribe::<Comment>(query)?.into_parts()))?;

        debug!("Expanded thread of {}", self.post_id);
        self.comments = Some((list, guard));
        Ok(())
    }

    /// Stop showing comments and tear their subscription down.
    pub fn collapse(&mut self) {
        if self.comments.take().is_some() {
            debug!("Collapsed thread of {}", self.post_id);
        }
    }

    /// Flip between expanded and collapsed. Returns whether it is now
    /// expanded.
    pub fn toggle(&mut self) -> Result<bool> {
        if self.is_expanded() {
            self.collapse();
        } else {
            self.expand()?;
        }
        Ok(self.is_expanded())
    }

    /// Comments as of the last applied snapshot, `None` while collapsed.
    pub fn comments(&self) -> Option<Arc<Vec<Comment>>> {
        self.comments.as_ref().map(|(list, _)| list.items())
    }

    pub fn list(&self) -> Option<&LiveList<Comment>> {
        self.comments.as_ref().map(|(list, _)| list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientConfig, FeedClient};
    use crate::auth::LocalAuthProvider;
    use crate::blobs::{BlobStoreConfig, FsBlobStore};
    use crate::live_query::SubscriptionState;
    use crate::store::LocalStore;
    use tempfile::TempDir;

    fn client() -> (TempDir, Arc<LocalStore>, FeedClient) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(LocalStore::in_memory());
        let blobs = Arc::new(
            FsBlobStore::new(BlobStoreConfig {
                path: dir.path().join("blobs"),
                ..Default::default()
            })
            .unwrap(),
        );
        let client = FeedClient::new(
            store.clone(),
            blobs,
            Arc::new(LocalAuthProvider::new()),
            ClientConfig::default(),
        );
        (dir, store, client)
    }

    #[test]
    fn test_empty_feed_is_empty_list() {
        let (_dir, _store, mut client) = client();
        let feed = client.open_feed().unwrap();
        client.run_pending();

        assert!(feed.posts().is_empty());
        assert_eq!(feed.list().sequence(), 1);
    }

    #[test]
    fn test_reopening_feed_replaces_subscription() {
        let (_dir, store, client) = client();
        let first = client.open_feed().unwrap();
        let second = client.open_feed().unwrap();

        assert_eq!(store.listener_count(), 1);
        assert!(!first.is_live());
        assert!(second.is_live());
        assert_eq!(first.list().state(), SubscriptionState::Unsubscribed);

        drop(first);
        assert_eq!(store.listener_count(), 1);
        second.close();
        assert_eq!(store.listener_count(), 0);
    }

    #[test]
    fn test_thread_expand_collapse() {
        let (_dir, store, mut client) = client();
        client.create_user_with_email("kim@example.com", "secret1").unwrap();
        let post = client.create_post("hello", None).unwrap();
        client.create_comment(&post, "first").unwrap();

        let mut thread = client.thread(post.clone());
        assert!(thread.comments().is_none());

        thread.expand().unwrap();
        thread.expand().unwrap();
        assert_eq!(store.listener_count(), 1);

        client.run_pending();
        let comments = thread.comments().unwrap();
        assert_eq!(comments.len(), 1);
        assert_eq!(comments[0].post_id, post);

        assert!(!thread.toggle().unwrap());
        assert_eq!(store.listener_count(), 0);
        assert!(thread.toggle().unwrap());
        assert_eq!(store.listener_count(), 1);
    }

    #[test]
    fn test_threads_of_different_posts_are_independent() {
        let (_dir, store, mut client) = client();
        client.create_user_with_email("kim@example.com", "secret1").unwrap();
        let a = client.create_post("a", None).unwrap();
        let b = client.create_post("b", None).unwrap();

        let mut ta = client.thread(a);
        let mut tb = client.thread(b);
        ta.expand().unwrap();
        tb.expand().unwrap();
        assert_eq!(store.listener_count(), 2);

        drop(ta);
        assert_eq!(store.listener_count(), 1);
        assert!(tb.is_expanded());
    }
}

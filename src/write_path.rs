//! Document write path: composes post and comment records and appends them
//! to the store.
//!
//! Writes are never applied locally. The live query on the target
//! collection observes the new document and republishes.

use crate::client::ClientConfig;
use crate::error::{Result, SyncError};
use crate::identity::{Identity, User};
use crate::media::{MediaBlob, MediaPublisher};
use crate::records::{CommentRecord, PostRecord, TIMESTAMP_FIELD};
use crate::store::DocumentStore;
use crate::types::{CollectionPath, DocumentId, NewDocument, ServerTimestamp};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct WritePath {
    store: Arc<dyn DocumentStore>,
    identity: Identity,
    media: MediaPublisher,
    config: ClientConfig,
}

impl WritePath {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        identity: Identity,
        media: MediaPublisher,
        config: ClientConfig,
    ) -> Self {
        Self {
            store,
            identity,
            media,
            config,
        }
    }

    /// Collection holding the posts.
    pub fn posts_collection(&self) -> CollectionPath {
        self.config.posts()
    }

    /// Comment sub-collection of one post.
    pub fn comments_collection(&self, post_id: &DocumentId) -> CollectionPath {
        self.config.comments(post_id)
    }

    /// Create a post, publishing `image` first when one is attached.
    ///
    /// Nothing is written unless the author is signed in, `text` is not
    /// empty, and the image upload (if any) succeeded.
    pub fn create_post(&self, text: &str, image: Option<&MediaBlob>) -> Result<DocumentId> {
        let author = self.author()?;
        check_text(text)?;

        let image_url = match image {
            Some(blob) => self.media.publish(blob, &self.config.image_folder)?,
            None => String::new(),
        };

        let record = PostRecord {
            avatar: author.avatar_url,
            image: image_url,
            text: text.to_string(),
            timestamp: ServerTimestamp::default(),
            username: author.display_name,
        };
        self.append(&self.posts_collection(), &record)
    }

    /// Create a comment under `post_id`.
    pub fn create_comment(&self, post_id: &DocumentId, text: &str) -> Result<DocumentId> {
        let author = self.author()?;
        check_text(text)?;

        let record = CommentRecord {
            avatar: author.avatar_url,
            text: text.to_string(),
            timestamp: ServerTimestamp::default(),
            username: author.display_name,
        };
        self.append(&self.comments_collection(post_id), &record)
    }

    fn author(&self) -> Result<User> {
        self.identity.current().ok_or(SyncError::NotSignedIn)
    }

    fn append(&self, collection: &CollectionPath, record: &impl serde::Serialize) -> Result<DocumentId> {
        let doc = NewDocument::json(record)?.with_server_timestamp(TIMESTAMP_FIELD);
        match self.store.add(collection, doc) {
            Ok(id) => {
                debug!("Appended {} to {}", id, collection);
                Ok(id)
            }
            Err(e) => {
                warn!("Store rejected write to {}: {}", collection, e);
                Err(match e {
                    SyncError::Write(_) => e,
                    other => SyncError::Write(other.to_string()),
                })
            }
        }
    }
}

fn check_text(text: &str) -> Result<()> {
    if text.is_empty() {
        return Err(SyncError::EmptyText);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blobs::BlobSink;
    use crate::identity::{IdentityEvent, IdentitySession};
    use crate::store::LocalStore;
    use crate::types::{Direction, Query};
    use parking_lot::Mutex;
    use serde_json::Value;

    /// Records uploads in memory; optionally refuses them.
    #[derive(Default)]
    struct MemorySink {
        refuse: bool,
        uploads: Mutex<Vec<String>>,
    }

    impl BlobSink for MemorySink {
        fn upload(&self, path: &str, _content: &[u8], _content_type: &str) -> Result<()> {
            if self.refuse {
                return Err(SyncError::Upload("quota exceeded".into()));
            }
            self.uploads.lock().push(path.to_string());
            Ok(())
        }

        fn download_url(&self, path: &str) -> Result<String> {
            Ok(format!("https://cdn.test/{}", path))
        }
    }

    struct Fixture {
        store: Arc<LocalStore>,
        session: IdentitySession,
        sink: Arc<MemorySink>,
        writes: WritePath,
    }

    fn fixture(refuse_uploads: bool) -> Fixture {
        let store = Arc::new(LocalStore::in_memory());
        let session = IdentitySession::new();
        let sink = Arc::new(MemorySink {
            refuse: refuse_uploads,
            ..Default::default()
        });
        let writes = WritePath::new(
            store.clone(),
            session.reader(),
            MediaPublisher::new(sink.clone()),
            ClientConfig::default(),
        );
        Fixture {
            store,
            session,
            sink,
            writes,
        }
    }

    fn sign_in(session: &mut IdentitySession) {
        session.apply(IdentityEvent::Changed(Some(User {
            id: "u1".into(),
            display_name: "Kim".into(),
            avatar_url: "https://cdn.test/avatars/kim.png".into(),
        })));
    }

    fn posts(store: &LocalStore) -> Vec<crate::types::Document> {
        store
            .get(&Query::new(CollectionPath::root("posts"), "timestamp", Direction::Descending))
            .unwrap()
    }

    #[test]
    fn test_signed_out_write_rejected_without_mutation() {
        let f = fixture(false);
        let image = MediaBlob::new("a.png", "image/png", vec![1, 2]);

        assert!(matches!(
            f.writes.create_post("hello", Some(&image)),
            Err(SyncError::NotSignedIn)
        ));
        assert!(posts(&f.store).is_empty());
        assert!(f.sink.uploads.lock().is_empty());
    }

    #[test]
    fn test_empty_text_rejected() {
        let mut f = fixture(false);
        sign_in(&mut f.session);

        assert!(matches!(f.writes.create_post("", None), Err(SyncError::EmptyText)));
        assert!(posts(&f.store).is_empty());

        f.writes.create_post("  \n", None).unwrap();
        let stored = posts(&f.store);
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].data["text"], "  \n");
    }

    #[test]
    fn test_post_record_shape() {
        let mut f = fixture(false);
        sign_in(&mut f.session);

        let id = f.writes.create_post("hello", None).unwrap();
        let stored = posts(&f.store);
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, id);

        let data = &stored[0].data;
        assert_eq!(data["text"], "hello");
        assert_eq!(data["username"], "Kim");
        assert_eq!(data["avatar"], "https://cdn.test/avatars/kim.png");
        assert_eq!(data["image"], "");
        assert!(data["timestamp"].is_number());
    }

    #[test]
    fn test_image_published_before_write() {
        let mut f = fixture(false);
        sign_in(&mut f.session);

        let image = MediaBlob::new("cat.png", "image/png", vec![7; 16]);
        f.writes.create_post("look", Some(&image)).unwrap();

        let uploads = f.sink.uploads.lock().clone();
        assert_eq!(uploads.len(), 1);
        assert!(uploads[0].starts_with("images/"));

        let stored = posts(&f.store);
        assert_eq!(
            stored[0].data["image"],
            Value::String(format!("https://cdn.test/{}", uploads[0]))
        );
    }

    #[test]
    fn test_upload_failure_writes_nothing() {
        let mut f = fixture(true);
        sign_in(&mut f.session);

        let image = MediaBlob::new("cat.png", "image/png", vec![7]);
        assert!(matches!(
            f.writes.create_post("look", Some(&image)),
            Err(SyncError::Upload(_))
        ));
        assert!(posts(&f.store).is_empty());
    }

    #[test]
    fn test_comment_lands_under_post() {
        let mut f = fixture(false);
        sign_in(&mut f.session);

        let post = f.writes.create_post("hello", None).unwrap();
        f.writes.create_comment(&post, "first").unwrap();

        let comments = f
            .store
            .get(&Query::new(
                f.writes.comments_collection(&post),
                "timestamp",
                Direction::Descending,
            ))
            .unwrap();
        assert_eq!(comments.len(), 1);
        assert_eq!(comments[0].collection.as_str(), format!("posts/{}/comment", post));
    }

    #[test]
    fn test_comment_on_missing_post_is_write_error() {
        let mut f = fixture(false);
        sign_in(&mut f.session);

        let result = f.writes.create_comment(&DocumentId::from("nope"), "hi");
        assert!(matches!(result, Err(SyncError::Write(_))));
    }

    #[test]
    fn test_closed_store_is_write_error() {
        let mut f = fixture(false);
        sign_in(&mut f.session);
        f.store.close().unwrap();

        let result = f.writes.create_post("hello", None);
        assert!(matches!(result, Err(SyncError::Write(_))));
    }
}

//! Post and comment records.
//!
//! The field names of [`PostRecord`] and [`CommentRecord`] are the wire
//! contract with documents already in the store and must not change.

use crate::error::{Result, SyncError};
use crate::types::{Document, DocumentId, ServerTimestamp};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};

/// Name of the server-assigned ordering field on every record.
pub const TIMESTAMP_FIELD: &str = "timestamp";

/// Decoding of a delivered document into a typed value.
pub trait FromDocument: Sized {
    fn from_document(doc: &Document) -> Result<Self>;
}

fn decode_data<T: DeserializeOwned>(doc: &Document) -> Result<T> {
    serde_json::from_value(serde_json::Value::Object(doc.data.clone())).map_err(|e| {
        SyncError::Deserialization(format!("document {} in {}: {}", doc.id, doc.collection, e))
    })
}

/// Profile fields may be absent or null on accounts that never set them.
fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// Stored shape of a post.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PostRecord {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub avatar: String,
    /// Empty when the post has no image.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub image: String,
    pub text: String,
    #[serde(default)]
    pub timestamp: ServerTimestamp,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub username: String,
}

/// Stored shape of a comment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommentRecord {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub avatar: String,
    pub text: String,
    #[serde(default)]
    pub timestamp: ServerTimestamp,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub username: String,
}

/// A post in the feed.
#[derive(Clone, Debug, PartialEq)]
pub struct Post {
    pub id: DocumentId,
    pub author_avatar_url: String,
    pub author_name: String,
    pub text: String,
    pub image_url: String,
    pub created_at: ServerTimestamp,
}

impl Post {
    pub fn has_image(&self) -> bool {
        !self.image_url.is_empty()
    }
}

impl FromDocument for Post {
    fn from_document(doc: &Document) -> Result<Self> {
        let record: PostRecord = decode_data(doc)?;
        Ok(Post {
            id: doc.id.clone(),
            author_avatar_url: record.avatar,
            author_name: record.username,
            text: record.text,
            image_url: record.image,
            created_at: record.timestamp,
        })
    }
}

/// A comment under one post.
#[derive(Clone, Debug, PartialEq)]
pub struct Comment {
    pub id: DocumentId,
    /// Owning post, taken from the sub-collection path.
    pub post_id: DocumentId,
    pub author_avatar_url: String,
    pub author_name: String,
    pub text: String,
    pub created_at: ServerTimestamp,
}

impl FromDocument for Comment {
    fn from_document(doc: &Document) -> Result<Self> {
        let (_, post_id) = doc.collection.parent().ok_or_else(|| {
            SyncError::Deserialization(format!(
                "comment {} is not inside a post: {}",
                doc.id, doc.collection
            ))
        })?;
        let record: CommentRecord = decode_data(doc)?;
        Ok(Comment {
            id: doc.id.clone(),
            post_id,
            author_avatar_url: record.avatar,
            author_name: record.username,
            text: record.text,
            created_at: record.timestamp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CollectionPath, Fields, Timestamp};
    use serde_json::json;

    fn document(collection: CollectionPath, data: serde_json::Value) -> Document {
        let data: Fields = match data {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        };
        Document {
            id: DocumentId::from("d1"),
            collection,
            data,
            update_time: Timestamp(7),
            has_pending_writes: false,
        }
    }

    #[test]
    fn test_post_from_document() {
        let doc = document(
            CollectionPath::root("posts"),
            json!({"avatar": "a.png", "image": "", "text": "hello", "timestamp": 42, "username": "kim"}),
        );
        let post = Post::from_document(&doc).unwrap();
        assert_eq!(post.author_name, "kim");
        assert_eq!(post.created_at, ServerTimestamp(Some(Timestamp(42))));
        assert!(!post.has_image());
    }

    #[test]
    fn test_pending_timestamp_decodes() {
        let doc = document(
            CollectionPath::root("posts"),
            json!({"avatar": "", "image": "", "text": "hi", "timestamp": null, "username": "kim"}),
        );
        let post = Post::from_document(&doc).unwrap();
        assert!(post.created_at.is_pending());
    }

    #[test]
    fn test_comment_takes_post_id_from_path() {
        let path = CollectionPath::root("posts").subcollection(&DocumentId::from("p9"), "comment");
        let doc = document(
            path,
            json!({"avatar": "", "text": "nice", "timestamp": 1, "username": "lee", "id": "bogus"}),
        );
        let comment = Comment::from_document(&doc).unwrap();
        assert_eq!(comment.post_id.as_str(), "p9");
        assert_eq!(comment.id.as_str(), "d1");
    }

    #[test]
    fn test_comment_outside_post_rejected() {
        let doc = document(
            CollectionPath::root("comment"),
            json!({"avatar": "", "text": "x", "timestamp": 1, "username": "lee"}),
        );
        assert!(Comment::from_document(&doc).is_err());
    }

    #[test]
    fn test_missing_text_rejected() {
        let doc = document(
            CollectionPath::root("posts"),
            json!({"avatar": "", "image": "", "timestamp": 1, "username": "kim"}),
        );
        assert!(matches!(
            Post::from_document(&doc),
            Err(SyncError::Deserialization(_))
        ));
    }

    #[test]
    fn test_null_profile_fields_decode_empty() {
        let doc = document(
            CollectionPath::root("posts"),
            json!({"avatar": null, "image": null, "text": "hi", "timestamp": 3, "username": null}),
        );
        let post = Post::from_document(&doc).unwrap();
        assert_eq!(post.author_avatar_url, "");
        assert_eq!(post.author_name, "");
        assert!(!post.has_image());

        let path = CollectionPath::root("posts").subcollection(&DocumentId::from("p1"), "comment");
        let doc = document(path, json!({"text": "anon", "timestamp": 4}));
        let comment = Comment::from_document(&doc).unwrap();
        assert_eq!(comment.author_name, "");
        assert_eq!(comment.author_avatar_url, "");
    }
}

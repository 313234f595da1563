//! Blob storage for uploaded media.
//!
//! The sync core only needs a write-once sink that turns a named upload
//! into a durable URL ([`BlobSink`]). [`FsBlobStore`] is a filesystem
//! implementation of it that keeps each blob under its own key path.

mod storage;

pub use storage::{Blob, BlobStoreConfig, FsBlobStore};

use crate::error::Result;

/// Named binary upload target.
pub trait BlobSink: Send + Sync {
    /// Store `content` under `path`. Uploading to an existing path replaces it.
    fn upload(&self, path: &str, content: &[u8], content_type: &str) -> Result<()>;

    /// Resolve a permanent retrieval URL for an uploaded path.
    fn download_url(&self, path: &str) -> Result<String>;
}

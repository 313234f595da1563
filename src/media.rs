//! Media publisher: uploads a local blob and resolves its durable URL.

use crate::blobs::BlobSink;
use crate::error::{Result, SyncError};
use crate::types::Timestamp;
use rand::Rng;
use std::sync::Arc;
use tracing::{debug, warn};

/// A local binary the user attached.
#[derive(Clone, Debug, PartialEq)]
pub struct MediaBlob {
    /// Original file name, kept as the readable tail of the storage key.
    pub name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl MediaBlob {
    pub fn new(name: impl Into<String>, content_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            content_type: content_type.into(),
            bytes,
        }
    }
}

/// Build a storage key: hex milliseconds, 64 random bits, then the file name.
///
/// Two uploads only share a key if they land in the same millisecond and
/// draw the same 64-bit value; on that collision the later upload wins.
pub fn generate_key(name: &str) -> String {
    let millis = Timestamp::now().as_millis();
    let random: u64 = rand::rng().random();
    format!("{:x}{:016x}_{}", millis, random, sanitize_name(name))
}

/// Keep the file name usable as a single path segment.
fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_matches('.');
    if cleaned.is_empty() {
        "blob".to_string()
    } else {
        cleaned.to_string()
    }
}

/// Uploads blobs into a folder of a [`BlobSink`].
///
/// Holds no state about a blob once `publish` returns.
#[derive(Clone)]
pub struct MediaPublisher {
    sink: Arc<dyn BlobSink>,
}

impl MediaPublisher {
    pub fn new(sink: Arc<dyn BlobSink>) -> Self {
        Self { sink }
    }

    /// Upload `blob` under `folder` and return its retrieval URL.
    ///
    /// Any failure is reported as [`SyncError::Upload`] and not retried.
    pub fn publish(&self, blob: &MediaBlob, folder: &str) -> Result<String> {
        let path = format!("{}/{}", folder.trim_matches('/'), generate_key(&blob.name));

        let result = self
            .sink
            .upload(&path, &blob.bytes, &blob.content_type)
            .and_then(|()| self.sink.download_url(&path));

        match result {
            Ok(url) => {
                debug!("Published {} ({} bytes)", path, blob.bytes.len());
                Ok(url)
            }
            Err(e) => {
                warn!("Media publish failed for {}: {}", path, e);
                Err(match e {
                    SyncError::Upload(_) => e,
                    other => SyncError::Upload(other.to_string()),
                })
            }
        }
    }
}

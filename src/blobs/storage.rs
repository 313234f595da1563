//! Filesystem blob store.

use super::BlobSink;
use crate::error::{Result, SyncError};
use lru::LruCache;
use parking_lot::Mutex;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::num::NonZeroUsize;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Magic bytes for blob files.
const BLOB_MAGIC: &[u8; 4] = b"BLB\0";

/// Current blob format version.
const BLOB_VERSION: u8 = 1;

/// Blob store configuration.
#[derive(Clone, Debug)]
pub struct BlobStoreConfig {
    /// Root directory for blobs.
    pub path: PathBuf,

    /// Read cache size (number of blobs).
    pub cache_size: usize,

    /// Public prefix for download URLs (None = `file://` URLs).
    pub base_url: Option<String>,
}

impl Default for BlobStoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./blobs"),
            cache_size: 256,
            base_url: None,
        }
    }
}

/// A stored blob.
#[derive(Clone, Debug, PartialEq)]
pub struct Blob {
    pub path: String,
    pub content: Vec<u8>,
    pub content_type: String,
}

/// Cached blob data (content + content_type).
#[derive(Clone)]
struct CachedBlob {
    content: Vec<u8>,
    content_type: String,
}

/// Blob storage keyed by relative path (`images/<key>`).
pub struct FsBlobStore {
    root: PathBuf,
    base_url: Option<String>,
    cache: Mutex<LruCache<String, CachedBlob>>,
}

impl FsBlobStore {
    /// Open (or create) a blob store at the configured root.
    pub fn new(config: BlobStoreConfig) -> Result<Self> {
        fs::create_dir_all(&config.path)?;
        let root = fs::canonicalize(&config.path)?;

        let cache_size = NonZeroUsize::new(config.cache_size.max(1)).unwrap_or(NonZeroUsize::MIN);

        Ok(Self {
            root,
            base_url: config.base_url.map(|u| u.trim_end_matches('/').to_string()),
            cache: Mutex::new(LruCache::new(cache_size)),
        })
    }

    /// Get a blob by path, verifying its header and checksum on a cache miss.
    pub fn get(&self, path: &str) -> Result<Option<Blob>> {
        if let Some(cached) = self.cache.lock().get(path).cloned() {
            return Ok(Some(Blob {
                path: path.to_string(),
                content: cached.content,
                content_type: cached.content_type,
            }));
        }

        let blob = match self.read_blob(path)? {
            Some(blob) => blob,
            None => return Ok(None),
        };
        self.cache.lock().put(
            path.to_string(),
            CachedBlob {
                content: blob.content.clone(),
                content_type: blob.content_type.clone(),
            },
        );
        Ok(Some(blob))
    }

    /// Whether an intact blob is stored at `path`.
    pub fn exists(&self, path: &str) -> bool {
        matches!(self.get(path), Ok(Some(_)))
    }

    /// Delete a blob.
    pub fn delete(&self, path: &str) -> Result<bool> {
        self.cache.lock().pop(path);

        let file_path = self.file_path(path)?;
        if file_path.exists() {
            fs::remove_file(&file_path)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// List all blob paths, sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        let mut paths = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let entry_path = entry.path();
                if entry.file_type()?.is_dir() {
                    pending.push(entry_path);
                } else if let Ok(rel) = entry_path.strip_prefix(&self.root) {
                    let key: Vec<String> = rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy().into_owned())
                        .collect();
                    paths.push(key.join("/"));
                }
            }
        }

        paths.sort();
        Ok(paths)
    }

    fn read_blob(&self, path: &str) -> Result<Option<Blob>> {
        let file = match File::open(self.file_path(path)?) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let meta = file.metadata()?;
        if !meta.is_file() {
            return Ok(None);
        }
        let remaining = meta.len();
        let mut frame = Frame { file, remaining };

        if frame.take(BLOB_MAGIC.len() as u64, "magic")? != BLOB_MAGIC {
            return Err(SyncError::InvalidFormat(format!("{}: invalid blob magic", path)));
        }
        let version = frame.take(1, "version")?[0];
        if version != BLOB_VERSION {
            return Err(SyncError::InvalidFormat(format!(
                "{}: unsupported blob version {}",
                path, version
            )));
        }

        let content_type_len = u16::from_le_bytes(frame.array("content type length")?);
        let content_type =
            String::from_utf8_lossy(&frame.take(content_type_len.into(), "content type")?)
                .into_owned();

        let content_len = u64::from_le_bytes(frame.array("content length")?);
        let content = frame.take(content_len, "content")?;

        let expected = u32::from_le_bytes(frame.array("checksum")?);
        let got = crc32fast::hash(&content);
        if expected != got {
            return Err(SyncError::ChecksumMismatch { expected, got });
        }
        if frame.remaining != 0 {
            return Err(SyncError::InvalidFormat(format!(
                "{}: {} trailing bytes",
                path, frame.remaining
            )));
        }

        Ok(Some(Blob {
            path: path.to_string(),
            content,
            content_type,
        }))
    }

    fn write_blob(&self, path: &str, content: &[u8], content_type: &str) -> Result<()> {
        let file_path = self.file_path(path)?;
        if let Some(parent) = file_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = File::create(&file_path)?;

        file.write_all(BLOB_MAGIC)?;
        file.write_all(&[BLOB_VERSION])?;

        let content_type_bytes = content_type.as_bytes();
        let content_type_len = u16::try_from(content_type_bytes.len())
            .map_err(|_| SyncError::Upload("content type too long".into()))?;
        file.write_all(&content_type_len.to_le_bytes())?;
        file.write_all(content_type_bytes)?;

        file.write_all(&(content.len() as u64).to_le_bytes())?;
        file.write_all(content)?;

        let checksum = crc32fast::hash(content);
        file.write_all(&checksum.to_le_bytes())?;

        file.sync_all()?;
        Ok(())
    }

    /// Map a key path onto the filesystem, refusing anything that escapes the root.
    fn file_path(&self, path: &str) -> Result<PathBuf> {
        let rel = Path::new(path);
        let valid = !path.is_empty()
            && rel
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(SyncError::Upload(format!("Invalid blob path: {:?}", path)));
        }
        Ok(self.root.join(rel))
    }
}

/// An open blob file and the bytes not yet read from it.
struct Frame {
    file: File,
    remaining: u64,
}

impl Frame {
    /// Read the next `len` bytes. Lengths past the end of the file are
    /// rejected before anything is allocated.
    fn take(&mut self, len: u64, field: &str) -> Result<Vec<u8>> {
        if len > self.remaining {
            return Err(SyncError::InvalidFormat(format!(
                "{} needs {} bytes, {} left in file",
                field, len, self.remaining
            )));
        }
        let size = usize::try_from(len)
            .map_err(|_| SyncError::InvalidFormat(format!("{} too large: {}", field, len)))?;
        let mut buf = vec![0u8; size];
        self.file.read_exact(&mut buf)?;
        self.remaining -= len;
        Ok(buf)
    }

    fn array<const N: usize>(&mut self, field: &str) -> Result<[u8; N]> {
        let bytes = self.take(N as u64, field)?;
        let mut out = [0u8; N];
        out.copy_from_slice(&bytes);
        Ok(out)
    }
}

impl BlobSink for FsBlobStore {
    fn upload(&self, path: &str, content: &[u8], content_type: &str) -> Result<()> {
        self.write_blob(path, content, content_type)
            .map_err(|e| match e {
                SyncError::Upload(_) => e,
                other => SyncError::Upload(other.to_string()),
            })?;

        self.cache.lock().put(
            path.to_string(),
            CachedBlob {
                content: content.to_vec(),
                content_type: content_type.to_string(),
            },
        );

        debug!("Uploaded blob {} ({} bytes)", path, content.len());
        Ok(())
    }

    fn download_url(&self, path: &str) -> Result<String> {
        if self.get(path)?.is_none() {
            return Err(SyncError::BlobNotFound(path.to_string()));
        }
        Ok(match &self.base_url {
            Some(base) => format!("{}/{}", base, path),
            None => format!("file://{}", self.file_path(path)?.display()),
        })
    }
}

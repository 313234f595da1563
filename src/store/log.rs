//! Append-only mutation log backing a durable [`LocalStore`](super::LocalStore).
//!
//! Frame layout: magic (4) | version (1) | payload length (4, LE) |
//! MessagePack payload | crc32 of payload (4, LE).

use crate::error::{Result, SyncError};
use crate::types::{CollectionPath, Document, DocumentId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::warn;

/// Magic bytes for each frame.
const FRAME_MAGIC: &[u8; 4] = b"MUT\0";

/// Current frame format version.
const FRAME_VERSION: u8 = 1;

/// A committed change to the store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) enum Mutation {
    Put(Document),
    Delete {
        collection: CollectionPath,
        id: DocumentId,
    },
}

struct LogFile {
    file: File,
    /// End of the last complete frame.
    end: u64,
    writes_since_sync: u64,
}

/// Append-only mutation log.
pub(crate) struct MutationLog {
    inner: Mutex<LogFile>,
    /// Sync every N writes (0 and 1 both mean every write).
    sync_interval: u64,
}

impl MutationLog {
    /// Open or create the log and return it with every intact mutation.
    ///
    /// A torn frame at the tail (crash mid-append) is dropped and will be
    /// overwritten by the next append. A checksum failure anywhere else is
    /// an error.
    pub fn open(path: impl AsRef<Path>, sync_interval: u64) -> Result<(Self, Vec<Mutation>)> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path.as_ref())?;

        let (mutations, end) = Self::replay(&mut file)?;

        let log = Self {
            inner: Mutex::new(LogFile {
                file,
                end,
                writes_since_sync: 0,
            }),
            sync_interval: sync_interval.max(1),
        };
        Ok((log, mutations))
    }

    /// Append one mutation.
    pub fn append(&self, mutation: &Mutation) -> Result<()> {
        let payload = rmp_serde::to_vec(mutation)?;
        let len = u32::try_from(payload.len())
            .map_err(|_| SyncError::Serialization("mutation too large".into()))?;

        let mut frame = Vec::with_capacity(payload.len() + 13);
        frame.extend_from_slice(FRAME_MAGIC);
        frame.push(FRAME_VERSION);
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&payload);
        frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());

        let mut log = self.inner.lock();
        let end = log.end;
        log.file.seek(SeekFrom::Start(end))?;
        log.file.write_all(&frame)?;
        log.end = end + frame.len() as u64;

        log.writes_since_sync += 1;
        if log.writes_since_sync >= self.sync_interval {
            log.file.sync_data()?;
            log.writes_since_sync = 0;
        }

        Ok(())
    }

    /// Force pending writes to disk.
    pub fn sync(&self) -> Result<()> {
        let mut log = self.inner.lock();
        log.file.sync_data()?;
        log.writes_since_sync = 0;
        Ok(())
    }

    fn replay(file: &mut File) -> Result<(Vec<Mutation>, u64)> {
        file.seek(SeekFrom::Start(0))?;
        let size = file.metadata()?.len();
        let mut mutations = Vec::new();
        let mut end = 0u64;

        loop {
            match Self::read_frame(file, size - end) {
                Ok(Some((mutation, len))) => {
                    mutations.push(mutation);
                    end += len;
                }
                Ok(None) => break,
                Err(SyncError::Io(e)) if e.kind() == ErrorKind::UnexpectedEof => {
                    warn!("Dropping torn frame at offset {} of mutation log", end);
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        file.set_len(end)?;
        Ok((mutations, end))
    }

    /// Read one frame with `remaining` bytes left in the file. `Ok(None)`
    /// at a clean end of file.
    fn read_frame(file: &mut File, remaining: u64) -> Result<Option<(Mutation, u64)>> {
        let mut magic = [0u8; 4];
        let mut filled = 0;
        while filled < magic.len() {
            let n = file.read(&mut magic[filled..])?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(SyncError::Io(ErrorKind::UnexpectedEof.into()));
            }
            filled += n;
        }
        if &magic != FRAME_MAGIC {
            return Err(SyncError::InvalidFormat("Invalid mutation frame magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != FRAME_VERSION {
            return Err(SyncError::InvalidFormat(format!(
                "Unsupported mutation log version: {}",
                version[0]
            )));
        }

        let mut len_bytes = [0u8; 4];
        file.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len as u64 + 13 > remaining {
            return Err(SyncError::Io(ErrorKind::UnexpectedEof.into()));
        }

        let mut payload = vec![0u8; len];
        file.read_exact(&mut payload)?;

        let mut checksum_bytes = [0u8; 4];
        file.read_exact(&mut checksum_bytes)?;
        let stored_checksum = u32::from_le_bytes(checksum_bytes);
        let computed_checksum = crc32fast::hash(&payload);
        if stored_checksum != computed_checksum {
            return Err(SyncError::ChecksumMismatch {
                expected: stored_checksum,
                got: computed_checksum,
            });
        }

        let mutation: Mutation = rmp_serde::from_slice(&payload)?;
        Ok(Some((mutation, (len + 13) as u64)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Fields, Timestamp};
    use tempfile::TempDir;

    fn put(id: &str) -> Mutation {
        let mut data = Fields::new();
        data.insert("text".into(), "hello".into());
        data.insert("timestamp".into(), 5.into());
        Mutation::Put(Document {
            id: DocumentId::from(id),
            collection: CollectionPath::root("posts"),
            data,
            update_time: Timestamp(5),
            has_pending_writes: false,
        })
    }

    #[test]
    fn test_append_and_replay() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mutations.log");

        {
            let (log, existing) = MutationLog::open(&path, 1).unwrap();
            assert!(existing.is_empty());
            log.append(&put("a")).unwrap();
            log.append(&Mutation::Delete {
                collection: CollectionPath::root("posts"),
                id: DocumentId::from("a"),
            })
            .unwrap();
        }

        let (_, mutations) = MutationLog::open(&path, 1).unwrap();
        assert_eq!(mutations.len(), 2);
        match &mutations[0] {
            Mutation::Put(doc) => {
                assert_eq!(doc.id.as_str(), "a");
                assert_eq!(doc.data["text"], "hello");
            }
            other => panic!("Expected put, got {:?}", other),
        }
        assert!(matches!(mutations[1], Mutation::Delete { .. }));
    }

    #[test]
    fn test_torn_tail_is_dropped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mutations.log");

        {
            let (log, _) = MutationLog::open(&path, 1).unwrap();
            log.append(&put("a")).unwrap();
            log.append(&put("b")).unwrap();
        }

        let full = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(full - 3).unwrap();
        drop(file);

        let (log, mutations) = MutationLog::open(&path, 1).unwrap();
        assert_eq!(mutations.len(), 1);

        log.append(&put("c")).unwrap();
        drop(log);

        let (_, mutations) = MutationLog::open(&path, 1).unwrap();
        assert_eq!(mutations.len(), 2);
    }

    #[test]
    fn test_length_past_end_is_torn_tail() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mutations.log");

        {
            let (log, _) = MutationLog::open(&path, 1).unwrap();
            log.append(&put("a")).unwrap();
        }
        let intact = std::fs::metadata(&path).unwrap().len();

        let mut bytes = std::fs::read(&path).unwrap();
        bytes.extend_from_slice(FRAME_MAGIC);
        bytes.push(FRAME_VERSION);
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        bytes.extend_from_slice(b"short");
        std::fs::write(&path, bytes).unwrap();

        let (_, mutations) = MutationLog::open(&path, 1).unwrap();
        assert_eq!(mutations.len(), 1);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), intact);
    }

    #[test]
    fn test_corrupt_payload_detected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mutations.log");

        {
            let (log, _) = MutationLog::open(&path, 1).unwrap();
            log.append(&put("a")).unwrap();
        }

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[12] ^= 0xff;
        std::fs::write(&path, bytes).unwrap();

        assert!(matches!(
            MutationLog::open(&path, 1),
            Err(SyncError::ChecksumMismatch { .. })
        ));
    }
}

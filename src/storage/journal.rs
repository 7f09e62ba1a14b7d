// QueueJournal - Durable backing for the offline message queue
//
// Each queued message is stored under a big-endian sequence key so that
// sled's ordered iteration restores FIFO order after a restart.

use crate::bus::Message;
use std::path::Path;
use thiserror::Error;

/// Key prefixes for organizing data
mod keys {
    pub const QUEUE_PREFIX: &[u8] = b"queue:";
}

/// Errors from storage operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Failed to open database: {0}")]
    OpenFailed(String),

    #[error("Database operation failed: {0}")]
    DatabaseError(String),

    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    #[error("Flush failed: {0}")]
    FlushFailed(String),
}

impl From<sled::Error> for StorageError {
    fn from(err: sled::Error) -> Self {
        StorageError::DatabaseError(err.to_string())
    }
}

/// Statistics about the journal
#[derive(Clone, Debug)]
pub struct JournalStats {
    /// Number of journaled messages
    pub entries: usize,
    /// Approximate disk size in bytes
    pub disk_size_bytes: u64,
}

/// What a journal held when it was reopened
#[derive(Debug, Default)]
pub struct JournalRestore {
    /// Readable messages in sequence order
    pub entries: Vec<(u64, Message)>,
    /// Entries that failed to decode; they have been removed from disk
    pub corrupt: Vec<(u64, StorageError)>,
    /// One past the highest sequence key seen, readable or not
    pub next_seq: u64,
}

/// Persistent, ordered store of undelivered messages
///
/// Uses sled for crash-safe, embedded storage.
pub struct QueueJournal {
    db: sled::Db,
}

impl QueueJournal {
    /// Open or create a journal at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path).map_err(|e| StorageError::OpenFailed(e.to_string()))?;
        Ok(Self { db })
    }

    /// Open a throwaway journal that lives only as long as the process
    pub fn temporary() -> Result<Self, StorageError> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| StorageError::OpenFailed(e.to_string()))?;
        Ok(Self { db })
    }

    fn key(seq: u64) -> Vec<u8> {
        [keys::QUEUE_PREFIX, &seq.to_be_bytes()[..]].concat()
    }

    fn seq_from_key(key: &[u8]) -> Option<u64> {
        let raw = key.strip_prefix(keys::QUEUE_PREFIX)?;
        let bytes: [u8; 8] = raw.try_into().ok()?;
        Some(u64::from_be_bytes(bytes))
    }

    /// Persist a message under its sequence number
    pub fn append(&self, seq: u64, message: &Message) -> Result<(), StorageError> {
        let bytes = postcard::to_allocvec(message)
            .map_err(|e| StorageError::SerializationFailed(e.to_string()))?;
        self.db.insert(Self::key(seq), bytes)?;
        Ok(())
    }

    /// Drop a delivered (or evicted) message
    pub fn remove(&self, seq: u64) -> Result<(), StorageError> {
        self.db.remove(Self::key(seq))?;
        Ok(())
    }

    /// Read back every journaled message in sequence order.
    ///
    /// Entries that no longer decode are deleted and reported in
    /// `corrupt`; they never hide the readable ones.
    pub fn restore(&self) -> Result<JournalRestore, StorageError> {
        let mut restore = JournalRestore::default();
        for result in self.db.scan_prefix(keys::QUEUE_PREFIX) {
            let (key, value) = result?;
            let Some(seq) = Self::seq_from_key(&key) else {
                continue;
            };
            restore.next_seq = restore.next_seq.max(seq.saturating_add(1));
            match postcard::from_bytes::<Message>(&value) {
                Ok(message) => restore.entries.push((seq, message)),
                Err(e) => {
                    self.db.remove(&key)?;
                    restore
                        .corrupt
                        .push((seq, StorageError::DeserializationFailed(e.to_string())));
                }
            }
        }
        Ok(restore)
    }

    /// Highest sequence key currently stored
    pub fn last_seq(&self) -> Result<Option<u64>, StorageError> {
        match self.db.scan_prefix(keys::QUEUE_PREFIX).next_back() {
            Some(result) => {
                let (key, _) = result?;
                Ok(Self::seq_from_key(&key))
            }
            None => Ok(None),
        }
    }

    /// Remove every journaled message
    pub fn clear(&self) -> Result<usize, StorageError> {
        let mut deleted = 0;
        for result in self.db.scan_prefix(keys::QUEUE_PREFIX) {
            let (key, _) = result?;
            self.db.remove(key)?;
            deleted += 1;
        }
        Ok(deleted)
    }

    /// Flush all pending writes to disk
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db
            .flush()
            .map_err(|e| StorageError::FlushFailed(e.to_string()))?;
        Ok(())
    }

    pub fn stats(&self) -> JournalStats {
        JournalStats {
            entries: self.db.scan_prefix(keys::QUEUE_PREFIX).count(),
            disk_size_bytes: self.db.size_on_disk().unwrap_or(0),
        }
    }
}

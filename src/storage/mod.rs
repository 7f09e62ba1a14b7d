// Storage module - PERSISTENCE
// Durable journal for the offline message queue, backed by sled

mod journal;

pub use journal::{JournalRestore, JournalStats, QueueJournal, StorageError};

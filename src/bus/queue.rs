// Offline Message Queue
// Ordered, mutex-guarded buffer of messages that could not be delivered yet

use crate::bus::Message;
use crate::storage::{JournalRestore, QueueJournal, StorageError};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

/// Default number of messages held before eviction starts
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Counters describing queue activity
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Total messages enqueued (including re-appended retries)
    pub enqueued: u64,
    /// Messages removed by `dequeue` or delivered by a retry pass
    pub delivered: u64,
    /// Messages evicted because the queue was full
    pub dropped: u64,
    /// Failed QoS 0 messages discarded by a retry pass
    pub discarded: u64,
    /// Journal operations that failed, including unreadable entries
    /// dropped on restore
    pub journal_errors: u64,
}

/// Outcome of one `retry_all` pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryReport {
    pub attempted: usize,
    pub delivered: usize,
    pub requeued: usize,
    pub discarded: usize,
}

struct QueueInner {
    entries: VecDeque<(u64, Message)>,
    next_seq: u64,
    stats: QueueStats,
}

/// FIFO buffer of undelivered messages
///
/// Safe under concurrent producers racing a single retry pass: the pass
/// works on a snapshot and re-appends its failures after it finishes.
pub struct OfflineMessageQueue {
    inner: Mutex<QueueInner>,
    capacity: usize,
    journal: Option<QueueJournal>,
    errors: broadcast::Sender<StorageError>,
    restore_errors: Mutex<Vec<StorageError>>,
}

impl OfflineMessageQueue {
    pub fn new(capacity: usize) -> Self {
        let (errors, _) = broadcast::channel(64);
        Self {
            inner: Mutex::new(QueueInner {
                entries: VecDeque::new(),
                next_seq: 0,
                stats: QueueStats::default(),
            }),
            capacity: capacity.max(1),
            journal: None,
            errors,
            restore_errors: Mutex::new(Vec::new()),
        }
    }

    /// Create a queue backed by a journal, restoring anything it still holds.
    ///
    /// Unreadable entries are dropped and kept for `take_restore_errors`.
    /// If more messages come back than `capacity` allows, the usual eviction
    /// policy trims them.
    pub fn with_journal(capacity: usize, journal: QueueJournal) -> Self {
        let mut failures = Vec::new();
        let restore = match journal.restore() {
            Ok(restore) => restore,
            Err(e) => {
                error!(error = %e, "failed to restore offline queue journal");
                let next_seq = match journal.last_seq() {
                    Ok(last) => last.map_or(0, |seq| seq.saturating_add(1)),
                    Err(last_err) => {
                        error!(error = %last_err, "failed to read last journal sequence");
                        failures.push(last_err);
                        0
                    }
                };
                failures.push(e);
                JournalRestore {
                    next_seq,
                    ..JournalRestore::default()
                }
            }
        };
        for (seq, e) in restore.corrupt {
            error!(seq, error = %e, "dropped unreadable journal entry");
            failures.push(e);
        }

        let queue = Self {
            journal: Some(journal),
            ..Self::new(capacity)
        };
        {
            let mut inner = queue.lock();
            inner.next_seq = restore.next_seq;
            inner.stats.journal_errors += failures.len() as u64;
            inner.entries.extend(restore.entries);
            while inner.entries.len() > queue.capacity {
                queue.evict_one(&mut inner);
            }
            if !inner.entries.is_empty() {
                debug!(count = inner.entries.len(), "restored journaled messages");
            }
        }
        *queue.restore_errors.lock().unwrap_or_else(|e| e.into_inner()) = failures;
        queue
    }

    /// Subscribe to journal failures raised after construction
    pub fn errors(&self) -> broadcast::Receiver<StorageError> {
        self.errors.subscribe()
    }

    /// Failures met while restoring the journal, handed out once
    pub fn take_restore_errors(&self) -> Vec<StorageError> {
        std::mem::take(&mut *self.restore_errors.lock().unwrap_or_else(|e| e.into_inner()))
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn stats(&self) -> QueueStats {
        self.lock().stats.clone()
    }

    /// Topics currently queued, oldest first
    pub fn topics(&self) -> Vec<String> {
        self.lock()
            .entries
            .iter()
            .map(|(_, m)| m.topic().to_string())
            .collect()
    }

    /// Append a message. When full, the oldest QoS 0 entry is evicted first,
    /// otherwise the oldest entry.
    pub fn enqueue(&self, mut message: Message) {
        message.touch();
        let mut inner = self.lock();

        if inner.entries.len() >= self.capacity {
            self.evict_one(&mut inner);
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.append(seq, &message) {
                error!(error = %e, "failed to journal queued message");
                self.journal_failed(&mut inner, e);
            }
        }
        inner.entries.push_back((seq, message));
        inner.stats.enqueued += 1;
    }

    /// Pop the oldest message
    pub fn dequeue(&self) -> Option<Message> {
        let mut inner = self.lock();
        let (seq, message) = inner.entries.pop_front()?;
        inner.stats.delivered += 1;
        self.forget(&mut inner, seq);
        Some(message)
    }

    /// Drain every queued message through `publish`, in FIFO order.
    ///
    /// Failed QoS >= 1 messages are re-appended after the pass completes, so
    /// they land behind anything enqueued while the pass was running. Failed
    /// QoS 0 messages are discarded.
    pub async fn retry_all<F, Fut>(&self, mut publish: F) -> RetryReport
    where
        F: FnMut(Message) -> Fut,
        Fut: Future<Output = bool>,
    {
        let batch: Vec<(u64, Message)> = {
            let mut inner = self.lock();
            inner.entries.drain(..).collect()
        };

        let mut report = RetryReport {
            attempted: batch.len(),
            ..RetryReport::default()
        };
        let mut failed = Vec::new();

        for (seq, message) in batch {
            if publish(message.clone()).await {
                report.delivered += 1;
                let mut inner = self.lock();
                inner.stats.delivered += 1;
                self.forget(&mut inner, seq);
            } else if message.qos().is_retried() {
                failed.push((seq, message));
            } else {
                debug!(topic = %message.topic(), "discarding failed QoS 0 message");
                report.discarded += 1;
                let mut inner = self.lock();
                inner.stats.discarded += 1;
                self.forget(&mut inner, seq);
            }
        }

        report.requeued = failed.len();
        for (seq, message) in failed {
            {
                let mut inner = self.lock();
                self.forget(&mut inner, seq);
            }
            self.enqueue(message);
        }

        report
    }

    /// Remove every queued message without delivering it
    pub fn clear(&self) -> usize {
        let mut inner = self.lock();
        let count = inner.entries.len();
        inner.entries.clear();
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.clear() {
                error!(error = %e, "failed to clear queue journal");
                self.journal_failed(&mut inner, e);
            }
        }
        count
    }

    /// Release spare buffer memory
    pub fn shrink(&self) {
        self.lock().entries.shrink_to_fit();
    }

    /// Drop the oldest QoS 0 entry, or the oldest entry if none is QoS 0
    fn evict_one(&self, inner: &mut QueueInner) {
        let victim = inner
            .entries
            .iter()
            .position(|(_, m)| !m.qos().is_retried())
            .unwrap_or(0);
        if let Some((seq, evicted)) = inner.entries.remove(victim) {
            warn!(topic = %evicted.topic(), "offline queue full, evicting message");
            inner.stats.dropped += 1;
            self.forget(inner, seq);
        }
    }

    fn forget(&self, inner: &mut QueueInner, seq: u64) {
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.remove(seq) {
                error!(error = %e, seq, "failed to remove journaled message");
                self.journal_failed(inner, e);
            }
        }
    }

    fn journal_failed(&self, inner: &mut QueueInner, error: StorageError) {
        inner.stats.journal_errors += 1;
        let _ = self.errors.send(error);
    }
}

impl Default for OfflineMessageQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

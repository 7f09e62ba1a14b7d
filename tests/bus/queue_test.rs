// Offline Queue Tests
// FIFO order, bounded capacity, retry passes and journal restore

use crashlink::bus::{Message, OfflineMessageQueue, QoS, DEFAULT_QUEUE_CAPACITY};
use crashlink::storage::QueueJournal;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

fn msg(topic: &str) -> Message {
    Message::new(topic, topic.as_bytes().to_vec())
}

// ============================================================================
// ORDERING AND CAPACITY
// ============================================================================

#[test]
fn test_queue_starts_empty() {
    let queue = OfflineMessageQueue::new(DEFAULT_QUEUE_CAPACITY);

    assert!(queue.is_empty());
    assert_eq!(queue.len(), 0);
    assert_eq!(queue.capacity(), 1000);
    assert!(queue.dequeue().is_none());
}

#[test]
fn test_queue_is_fifo() {
    let queue = OfflineMessageQueue::new(10);
    queue.enqueue(msg("emergency/a"));
    queue.enqueue(msg("emergency/b"));
    queue.enqueue(msg("emergency/c"));

    assert_eq!(queue.dequeue().unwrap().topic(), "emergency/a");
    assert_eq!(queue.dequeue().unwrap().topic(), "emergency/b");
    assert_eq!(queue.dequeue().unwrap().topic(), "emergency/c");
    assert!(queue.dequeue().is_none());
    assert_eq!(queue.stats().delivered, 3);
}

#[test]
fn test_full_queue_evicts_oldest_qos0_first() {
    let queue = OfflineMessageQueue::new(3);
    queue.enqueue(msg("emergency/keep1"));
    queue.enqueue(msg("emergency/drop").with_qos(QoS::AtMostOnce));
    queue.enqueue(msg("emergency/keep2"));

    queue.enqueue(msg("emergency/new"));

    assert_eq!(
        queue.topics(),
        vec!["emergency/keep1", "emergency/keep2", "emergency/new"]
    );
    assert_eq!(queue.stats().dropped, 1);
}

#[test]
fn test_full_queue_evicts_oldest_when_all_retried() {
    let queue = OfflineMessageQueue::new(2);
    queue.enqueue(msg("emergency/first"));
    queue.enqueue(msg("emergency/second"));
    queue.enqueue(msg("emergency/third"));

    assert_eq!(queue.len(), 2);
    assert_eq!(queue.topics(), vec!["emergency/second", "emergency/third"]);
}

#[test]
fn test_clear_returns_count() {
    let queue = OfflineMessageQueue::new(10);
    queue.enqueue(msg("emergency/a"));
    queue.enqueue(msg("emergency/b"));

    assert_eq!(queue.clear(), 2);
    assert!(queue.is_empty());
}

#[test]
fn test_shrink_keeps_messages() {
    let queue = OfflineMessageQueue::new(10);
    queue.enqueue(msg("emergency/a"));
    queue.shrink();

    assert_eq!(queue.len(), 1);
}

// ============================================================================
// RETRY PASSES
// ============================================================================

#[tokio::test]
async fn test_retry_all_delivers_in_order() {
    let queue = OfflineMessageQueue::new(10);
    queue.enqueue(msg("emergency/a"));
    queue.enqueue(msg("emergency/b"));

    let mut seen = Vec::new();
    let report = queue
        .retry_all(|m| {
            seen.push(m.topic().to_string());
            async { true }
        })
        .await;

    assert_eq!(seen, vec!["emergency/a", "emergency/b"]);
    assert_eq!(report.attempted, 2);
    assert_eq!(report.delivered, 2);
    assert!(queue.is_empty());
}

#[tokio::test]
async fn test_failed_message_is_requeued_not_lost() {
    let queue = OfflineMessageQueue::new(10);
    queue.enqueue(msg("emergency/ok"));
    queue.enqueue(msg("emergency/fails"));

    let report = queue
        .retry_all(|m| async move { m.topic() != "emergency/fails" })
        .await;

    assert_eq!(report.delivered, 1);
    assert_eq!(report.requeued, 1);
    assert_eq!(queue.topics(), vec!["emergency/fails"]);
}

#[tokio::test]
async fn test_failed_qos0_message_is_discarded() {
    let queue = OfflineMessageQueue::new(10);
    queue.enqueue(msg("emergency/ephemeral").with_qos(QoS::AtMostOnce));

    let report = queue.retry_all(|_| async { false }).await;

    assert_eq!(report.discarded, 1);
    assert!(queue.is_empty());
    assert_eq!(queue.stats().discarded, 1);
}

#[tokio::test]
async fn test_retry_pass_works_on_snapshot() {
    let queue = OfflineMessageQueue::new(10);
    queue.enqueue(msg("emergency/old"));

    let mut injected = false;
    let report = queue
        .retry_all(|_| {
            if !injected {
                injected = true;
                queue.enqueue(msg("emergency/late"));
            }
            async { false }
        })
        .await;

    // The late message is not part of this pass and the failure lands behind it
    assert_eq!(report.attempted, 1);
    assert_eq!(queue.topics(), vec!["emergency/late", "emergency/old"]);
}

#[tokio::test]
async fn test_retry_on_empty_queue() {
    let queue = OfflineMessageQueue::new(10);

    let report = queue.retry_all(|_| async { true }).await;

    assert_eq!(report.attempted, 0);
}

// ============================================================================
// JOURNAL
// ============================================================================

#[test]
fn test_journaled_queue_survives_restart() {
    let temp_dir = TempDir::new().unwrap();

    {
        let journal = QueueJournal::open(temp_dir.path()).unwrap();
        let queue = OfflineMessageQueue::with_journal(10, journal);
        queue.enqueue(msg("emergency/a"));
        queue.enqueue(msg("emergency/b"));
        queue.enqueue(msg("emergency/c"));
        queue.dequeue();
    }

    let journal = QueueJournal::open(temp_dir.path()).unwrap();
    let queue = OfflineMessageQueue::with_journal(10, journal);

    assert_eq!(queue.topics(), vec!["emergency/b", "emergency/c"]);
}

#[tokio::test]
async fn test_journal_tracks_delivery() {
    let temp_dir = TempDir::new().unwrap();

    {
        let journal = QueueJournal::open(temp_dir.path()).unwrap();
        let queue = OfflineMessageQueue::with_journal(10, journal);
        queue.enqueue(msg("emergency/delivered"));
        queue.enqueue(msg("emergency/pending"));
        queue
            .retry_all(|m| async move { m.topic() == "emergency/delivered" })
            .await;
    }

    let journal = QueueJournal::open(temp_dir.path()).unwrap();
    assert_eq!(journal.stats().entries, 1);
    let queue = OfflineMessageQueue::with_journal(10, journal);
    assert_eq!(queue.topics(), vec!["emergency/pending"]);
}

#[test]
fn test_restore_applies_capacity() {
    let temp_dir = TempDir::new().unwrap();

    {
        let journal = QueueJournal::open(temp_dir.path()).unwrap();
        let queue = OfflineMessageQueue::with_journal(10, journal);
        queue.enqueue(msg("emergency/1"));
        queue.enqueue(msg("emergency/2").with_qos(QoS::AtMostOnce));
        queue.enqueue(msg("emergency/3"));
        queue.enqueue(msg("emergency/4"));
        queue.enqueue(msg("emergency/5"));
    }

    {
        let journal = QueueJournal::open(temp_dir.path()).unwrap();
        let queue = OfflineMessageQueue::with_journal(3, journal);

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.topics(), vec!["emergency/3", "emergency/4", "emergency/5"]);
        assert_eq!(queue.stats().dropped, 2);
    }

    let journal = QueueJournal::open(temp_dir.path()).unwrap();
    assert_eq!(journal.stats().entries, 3);
}

// ============================================================================
// CONCURRENCY
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_producers_racing_retry_passes_lose_nothing() {
    const PRODUCERS: usize = 4;
    const PER_PRODUCER: usize = 50;

    let queue = Arc::new(OfflineMessageQueue::new(DEFAULT_QUEUE_CAPACITY));
    let delivered = Arc::new(Mutex::new(Vec::new()));

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let queue = queue.clone();
            tokio::spawn(async move {
                for n in 0..PER_PRODUCER {
                    queue.enqueue(msg(&format!("emergency/p{p}/{n}")));
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();

    // Flaky passes while producers are still running
    for _ in 0..20 {
        queue
            .retry_all(|m| {
                let delivered = delivered.clone();
                let fail = rand::random::<u8>() % 3 == 0;
                async move {
                    tokio::time::sleep(Duration::from_micros(200)).await;
                    if fail {
                        return false;
                    }
                    delivered.lock().unwrap().push(m.topic().to_string());
                    true
                }
            })
            .await;
        tokio::task::yield_now().await;
    }

    for producer in producers {
        producer.await.unwrap();
    }

    for _ in 0..10 {
        if queue.is_empty() {
            break;
        }
        let delivered = delivered.clone();
        queue
            .retry_all(move |m| {
                delivered.lock().unwrap().push(m.topic().to_string());
                async { true }
            })
            .await;
    }

    let delivered = delivered.lock().unwrap().clone();
    let unique: HashSet<&String> = delivered.iter().collect();
    let expected: HashSet<String> = (0..PRODUCERS)
        .flat_map(|p| (0..PER_PRODUCER).map(move |n| format!("emergency/p{p}/{n}")))
        .collect();

    assert!(queue.is_empty());
    assert_eq!(delivered.len(), PRODUCERS * PER_PRODUCER);
    assert_eq!(unique.len(), delivered.len());
    assert_eq!(unique.into_iter().cloned().collect::<HashSet<String>>(), expected);

    let stats = queue.stats();
    assert_eq!(stats.delivered, (PRODUCERS * PER_PRODUCER) as u64);
    assert_eq!(stats.dropped, 0);
}

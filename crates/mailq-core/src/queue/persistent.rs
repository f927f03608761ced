//! File-backed priority queue
//!
//! Every operation runs inside the sentinel locks of the stores it touches.
//! Locks are always taken in the order pending, processing, delivered,
//! failed, so two operations can never wait on each other in a cycle.
//!
//! An entry dequeued for delivery moves to the processing store with a lease
//! (`next_retry_at = now + processing_timeout`). If the consumer never
//! reports back, [`PersistentQueue::retry_failed_messages`] finds the expired
//! lease and returns the entry to pending.

use super::{FailedEntrySummary, QueueError, QueueStats};
use crate::config::QueueConfig;
use crate::io::LockManager;
use crate::io::atomic::{read_if_exists, write_durable};
use crate::schema::{EntryStatus, Message, QueueEntry, insert_ordered};
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Error recorded when a processing lease runs out
pub const LEASE_EXPIRED_ERROR: &str = "processing lease expired";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Store {
    Pending,
    Processing,
    Delivered,
    Failed,
}

impl Store {
    fn file_name(self) -> &'static str {
        match self {
            Store::Pending => "pending.json",
            Store::Processing => "processing.json",
            Store::Delivered => "delivered.json",
            Store::Failed => "failed.json",
        }
    }
}

/// Durable queue rooted at one directory
#[derive(Debug)]
pub struct PersistentQueue {
    root: PathBuf,
    config: QueueConfig,
    locks: Arc<LockManager>,
}

impl PersistentQueue {
    /// Open (creating if needed) the queue at `root`
    pub fn open(
        root: impl Into<PathBuf>,
        config: QueueConfig,
        locks: Arc<LockManager>,
    ) -> Result<Self, QueueError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| QueueError::Io {
            path: root.clone(),
            source,
        })?;
        Ok(Self {
            root,
            config,
            locks,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Enqueue `message` with the configured attempt budget
    ///
    /// `priority_score: None` uses [`QueueEntry::default_score`]. Returns the
    /// queue id.
    pub fn enqueue(
        &self,
        message: Message,
        priority_score: Option<f64>,
    ) -> Result<String, QueueError> {
        self.enqueue_with_attempts(message, priority_score, self.config.max_attempts)
    }

    /// Enqueue `message` with an explicit attempt budget
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Full` when the pending store already holds
    /// `max_queue_size` entries.
    pub fn enqueue_with_attempts(
        &self,
        message: Message,
        priority_score: Option<f64>,
        max_attempts: u32,
    ) -> Result<String, QueueError> {
        let score =
            priority_score.unwrap_or_else(|| QueueEntry::default_score(&message, Utc::now()));
        let entry = QueueEntry::new(message, score, max_attempts.max(1));
        let queue_id = entry.queue_id.clone();

        self.locked(&[Store::Pending], "enqueue", || {
            let mut pending = self.load(Store::Pending)?;
            if pending.len() >= self.config.max_queue_size {
                return Err(QueueError::Full {
                    limit: self.config.max_queue_size,
                });
            }
            debug!(
                queue_id = %entry.queue_id,
                message_id = %entry.message.id,
                score = entry.priority_score,
                "enqueued"
            );
            insert_ordered(&mut pending, entry);
            self.save(Store::Pending, &pending)
        })?;

        Ok(queue_id)
    }

    /// Take the highest-priority ready entry for delivery
    ///
    /// Pending entries whose message has expired are moved to the failed
    /// store as `expired` first. Entries still waiting out a retry delay are
    /// skipped. The returned entry is `processing` and holds a lease.
    pub fn dequeue(&self) -> Result<Option<QueueEntry>, QueueError> {
        self.locked(
            &[Store::Pending, Store::Processing, Store::Failed],
            "dequeue",
            || {
                let now = Utc::now();
                let mut pending = self.load(Store::Pending)?;

                let expired = take_expired(&mut pending, now);
                if !expired.is_empty() {
                    let mut failed = self.load(Store::Failed)?;
                    failed.extend(expired);
                    self.save(Store::Failed, &failed)?;
                }

                let Some(index) = pending.iter().position(|e| e.is_ready(now)) else {
                    self.save(Store::Pending, &pending)?;
                    return Ok(None);
                };

                let mut entry = pending.remove(index);
                entry.set_status(EntryStatus::Processing, now);
                entry.next_retry_at = Some(now + to_chrono(self.config.processing_timeout()));

                let mut processing = self.load(Store::Processing)?;
                processing.push(entry.clone());
                self.save(Store::Processing, &processing)?;
                self.save(Store::Pending, &pending)?;

                debug!(queue_id = %entry.queue_id, attempts = entry.attempts, "dequeued");
                Ok(Some(entry))
            },
        )
    }

    /// Record a successful delivery
    ///
    /// Returns `false` when `queue_id` is not in the processing store.
    pub fn mark_delivered(&self, queue_id: &str) -> Result<bool, QueueError> {
        self.locked(
            &[Store::Processing, Store::Delivered],
            "mark_delivered",
            || {
                let mut processing = self.load(Store::Processing)?;
                let Some(mut entry) = take_by_id(&mut processing, queue_id) else {
                    return Ok(false);
                };

                let now = Utc::now();
                entry.attempts += 1;
                entry.set_status(EntryStatus::Delivered, now);
                entry.next_retry_at = None;
                entry.delivered_at = Some(now);

                let mut delivered = self.load(Store::Delivered)?;
                debug!(queue_id = %entry.queue_id, attempts = entry.attempts, "delivered");
                delivered.push(entry);
                self.save(Store::Delivered, &delivered)?;
                self.save(Store::Processing, &processing)?;
                Ok(true)
            },
        )
    }

    /// Record a failed delivery
    ///
    /// With `retry` and budget left, the entry returns to pending behind an
    /// exponential backoff and `true` is returned. Otherwise it moves to the
    /// failed store and `false` is returned. An unknown id returns `false`.
    pub fn mark_failed(&self, queue_id: &str, error: &str, retry: bool) -> Result<bool, QueueError> {
        self.locked(
            &[Store::Pending, Store::Processing, Store::Failed],
            "mark_failed",
            || {
                let mut processing = self.load(Store::Processing)?;
                let Some(mut entry) = take_by_id(&mut processing, queue_id) else {
                    return Ok(false);
                };

                let now = Utc::now();
                entry.attempts += 1;
                entry.last_error = Some(error.to_string());

                let requeued = retry && !entry.attempts_exhausted();
                if requeued {
                    self.requeue_pending(entry, now)?;
                } else {
                    self.move_to_failed(entry, now)?;
                }
                self.save(Store::Processing, &processing)?;
                Ok(requeued)
            },
        )
    }

    /// Counts and recent errors across all stores
    pub fn get_queue_stats(&self) -> Result<QueueStats, QueueError> {
        let all = [
            Store::Pending,
            Store::Processing,
            Store::Delivered,
            Store::Failed,
        ];
        self.locked(&all, "stats", || {
            let now = Utc::now();
            let pending = self.load(Store::Pending)?;
            let processing = self.load(Store::Processing)?;
            let delivered = self.load(Store::Delivered)?;
            let mut failed = self.load(Store::Failed)?;

            let mut stats = QueueStats {
                pending: pending.len(),
                processing: processing.len(),
                delivered: delivered.len(),
                failed: failed.len(),
                ..Default::default()
            };

            for entry in &pending {
                *stats
                    .pending_by_priority
                    .entry(entry.message.priority)
                    .or_default() += 1;
            }
            stats.oldest_pending_age_secs = pending
                .iter()
                .map(|e| e.enqueued_at)
                .min()
                .map(|oldest| (now - oldest).num_milliseconds().max(0) as f64 / 1000.0);

            stats.expired = failed
                .iter()
                .filter(|e| e.status == EntryStatus::Expired)
                .count();

            failed.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
            stats.recent_errors = failed
                .into_iter()
                .filter(|e| e.status == EntryStatus::Failed)
                .map(|e| FailedEntrySummary {
                    queue_id: e.queue_id,
                    message_id: e.message.id,
                    recipient: e.message.recipient,
                    attempts: e.attempts,
                    last_error: e.last_error,
                })
                .collect();

            Ok(stats)
        })
    }

    /// Drop entries older than `max_age` and expire timed-out messages
    ///
    /// Entries enqueued more than `max_age` ago are purged from the pending,
    /// delivered and failed stores. Pending entries whose message expiry has
    /// passed move to the failed store as `expired`. Returns the number of
    /// entries purged or expired.
    pub fn cleanup_expired_entries(&self) -> Result<usize, QueueError> {
        self.locked(
            &[Store::Pending, Store::Delivered, Store::Failed],
            "cleanup",
            || {
                let now = Utc::now();
                let cutoff = now - to_chrono(self.config.max_age());
                let is_fresh = |e: &QueueEntry| e.enqueued_at >= cutoff;

                let mut pending = self.load(Store::Pending)?;
                let mut delivered = self.load(Store::Delivered)?;
                let mut failed = self.load(Store::Failed)?;
                let before = pending.len() + delivered.len() + failed.len();

                pending.retain(is_fresh);
                delivered.retain(is_fresh);
                failed.retain(is_fresh);
                let purged = before - (pending.len() + delivered.len() + failed.len());

                let expired = take_expired(&mut pending, now);
                let expired_count = expired.len();
                failed.extend(expired);

                if purged + expired_count > 0 {
                    self.save(Store::Pending, &pending)?;
                    self.save(Store::Delivered, &delivered)?;
                    self.save(Store::Failed, &failed)?;
                    debug!(purged, expired = expired_count, "queue cleanup");
                }
                Ok(purged + expired_count)
            },
        )
    }

    /// Recover processing entries whose lease has run out
    ///
    /// Each recovered entry is charged one attempt. Entries with budget left
    /// return to pending behind the usual backoff; the rest move to the
    /// failed store. Returns the number of entries recovered.
    pub fn retry_failed_messages(&self) -> Result<usize, QueueError> {
        self.locked(
            &[Store::Pending, Store::Processing, Store::Failed],
            "retry_failed",
            || {
                let now = Utc::now();
                let processing = self.load(Store::Processing)?;
                let (abandoned, active): (Vec<_>, Vec<_>) =
                    processing.into_iter().partition(|e| e.is_ready(now));
                if abandoned.is_empty() {
                    return Ok(0);
                }

                let recovered = abandoned.len();
                for mut entry in abandoned {
                    entry.attempts += 1;
                    entry.last_error = Some(LEASE_EXPIRED_ERROR.to_string());
                    warn!(queue_id = %entry.queue_id, attempts = entry.attempts, "recovering abandoned entry");
                    if entry.attempts_exhausted() {
                        self.move_to_failed(entry, now)?;
                    } else {
                        self.requeue_pending(entry, now)?;
                    }
                }
                self.save(Store::Processing, &active)?;
                Ok(recovered)
            },
        )
    }

    /// Snapshot of the pending store in delivery order
    pub fn pending_entries(&self) -> Result<Vec<QueueEntry>, QueueError> {
        self.locked(&[Store::Pending], "read_pending", || self.load(Store::Pending))
    }

    /// Snapshot of the failed store
    pub fn failed_entries(&self) -> Result<Vec<QueueEntry>, QueueError> {
        self.locked(&[Store::Failed], "read_failed", || self.load(Store::Failed))
    }

    /// Find an entry by queue id in any store
    pub fn get_entry(&self, queue_id: &str) -> Result<Option<QueueEntry>, QueueError> {
        let all = [
            Store::Pending,
            Store::Processing,
            Store::Delivered,
            Store::Failed,
        ];
        self.locked(&all, "get_entry", || {
            for store in all {
                if let Some(entry) = self
                    .load(store)?
                    .into_iter()
                    .find(|e| e.queue_id == queue_id)
                {
                    return Ok(Some(entry));
                }
            }
            Ok(None)
        })
    }

    /// Move a `failed` entry back to pending with a fresh attempt budget
    ///
    /// Returns `false` when `queue_id` is not a failed entry. Expired entries
    /// are never requeued.
    pub fn requeue_failed(&self, queue_id: &str) -> Result<bool, QueueError> {
        self.locked(&[Store::Pending, Store::Failed], "requeue_failed", || {
            let mut failed = self.load(Store::Failed)?;
            let Some(index) = failed
                .iter()
                .position(|e| e.queue_id == queue_id && e.status == EntryStatus::Failed)
            else {
                return Ok(false);
            };

            let mut entry = failed.remove(index);
            entry.attempts = 0;
            entry.next_retry_at = None;
            entry.set_status(EntryStatus::Pending, Utc::now());

            let mut pending = self.load(Store::Pending)?;
            insert_ordered(&mut pending, entry);
            self.save(Store::Pending, &pending)?;
            self.save(Store::Failed, &failed)?;
            Ok(true)
        })
    }

    /// Insert `entry` into pending behind its retry delay; caller holds the pending lock
    fn requeue_pending(&self, mut entry: QueueEntry, now: DateTime<Utc>) -> Result<(), QueueError> {
        entry.set_status(EntryStatus::Pending, now);
        entry.next_retry_at = Some(now + to_chrono(self.config.retry_delay(entry.attempts)));
        debug!(
            queue_id = %entry.queue_id,
            attempts = entry.attempts,
            retry_at = ?entry.next_retry_at,
            "requeued for retry"
        );

        let mut pending = self.load(Store::Pending)?;
        insert_ordered(&mut pending, entry);
        self.save(Store::Pending, &pending)
    }

    /// Append `entry` to the failed store; caller holds the failed lock
    fn move_to_failed(&self, mut entry: QueueEntry, now: DateTime<Utc>) -> Result<(), QueueError> {
        entry.set_status(EntryStatus::Failed, now);
        entry.next_retry_at = None;
        warn!(
            queue_id = %entry.queue_id,
            message_id = %entry.message.id,
            attempts = entry.attempts,
            error = entry.last_error.as_deref().unwrap_or(""),
            "message failed permanently"
        );

        let mut failed = self.load(Store::Failed)?;
        failed.push(entry);
        self.save(Store::Failed, &failed)
    }

    fn store_path(&self, store: Store) -> PathBuf {
        self.root.join(store.file_name())
    }

    fn locked<T, F>(&self, stores: &[Store], operation: &str, f: F) -> Result<T, QueueError>
    where
        F: FnOnce() -> Result<T, QueueError>,
    {
        debug_assert!(stores.windows(2).all(|w| w[0] < w[1]));
        let paths: Vec<PathBuf> = stores.iter().map(|s| self.store_path(*s)).collect();
        let paths: Vec<&Path> = paths.iter().map(PathBuf::as_path).collect();
        self.locks.with_locks(&paths, operation, f)
    }

    /// Read a store; caller holds its lock
    ///
    /// A store that does not parse is moved aside to `<store>.corrupt` and
    /// read as empty.
    fn load(&self, store: Store) -> Result<Vec<QueueEntry>, QueueError> {
        let path = self.store_path(store);
        let Some(content) = read_if_exists(&path)? else {
            return Ok(Vec::new());
        };
        if content.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }

        match serde_json::from_slice(&content) {
            Ok(entries) => Ok(entries),
            Err(e) => {
                let mut aside = path.clone().into_os_string();
                aside.push(".corrupt");
                warn!(
                    path = %path.display(),
                    error = %e,
                    "queue store is corrupt, moving it aside and starting empty"
                );
                fs::rename(&path, &aside).map_err(|source| QueueError::Io {
                    path: path.clone(),
                    source,
                })?;
                Ok(Vec::new())
            }
        }
    }

    /// Durably replace a store; caller holds its lock
    fn save(&self, store: Store, entries: &[QueueEntry]) -> Result<(), QueueError> {
        let path = self.store_path(store);
        let content = serde_json::to_vec_pretty(entries).map_err(|source| QueueError::Json {
            path: path.clone(),
            source,
        })?;
        write_durable(&path, &content)?;
        Ok(())
    }
}

fn take_by_id(entries: &mut Vec<QueueEntry>, queue_id: &str) -> Option<QueueEntry> {
    let index = entries.iter().position(|e| e.queue_id == queue_id)?;
    Some(entries.remove(index))
}

/// Remove and return entries whose message has expired, marked `expired`
fn take_expired(entries: &mut Vec<QueueEntry>, now: DateTime<Utc>) -> Vec<QueueEntry> {
    let (expired, live): (Vec<_>, Vec<_>) = std::mem::take(entries)
        .into_iter()
        .partition(|e| e.message.is_expired(now));
    *entries = live;

    expired
        .into_iter()
        .map(|mut e| {
            debug!(queue_id = %e.queue_id, message_id = %e.message.id, "message expired");
            e.set_status(EntryStatus::Expired, now);
            e.next_retry_at = None;
            e
        })
        .collect()
}

fn to_chrono(duration: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LockConfig;
    use crate::schema::{MessageType, Priority};
    use std::time::Duration;
    use tempfile::TempDir;

    fn test_locks() -> Arc<LockManager> {
        Arc::new(LockManager::new(LockConfig {
            timeout_ms: 5_000,
            retry_interval_ms: 5,
            max_retries: 2_000,
            stale_lock_age_secs: 300,
        }))
    }

    fn immediate_retry_config() -> QueueConfig {
        QueueConfig {
            retry_base_delay_ms: 0,
            retry_max_delay_ms: 0,
            ..QueueConfig::default()
        }
    }

    fn open(dir: &TempDir, config: QueueConfig) -> PersistentQueue {
        PersistentQueue::open(dir.path().join("queue"), config, test_locks()).unwrap()
    }

    fn message(to: &str) -> Message {
        Message::new("tester", to, MessageType::Direct, "hello", Priority::Normal)
    }

    #[test]
    fn test_dequeue_empty_returns_none() {
        let temp_dir = TempDir::new().unwrap();
        let queue = open(&temp_dir, QueueConfig::default());
        assert!(queue.dequeue().unwrap().is_none());
    }

    #[test]
    fn test_dequeue_follows_score_then_fifo() {
        let temp_dir = TempDir::new().unwrap();
        let queue = open(&temp_dir, QueueConfig::default());

        let ids: Vec<String> = [10.0, 50.0, 50.0, 5.0]
            .into_iter()
            .map(|score| queue.enqueue(message("b"), Some(score)).unwrap())
            .collect();

        let mut order = Vec::new();
        while let Some(entry) = queue.dequeue().unwrap() {
            assert_eq!(entry.status, EntryStatus::Processing);
            assert!(entry.next_retry_at.is_some());
            order.push(entry.queue_id);
        }
        assert_eq!(order, vec![ids[1].clone(), ids[2].clone(), ids[0].clone(), ids[3].clone()]);
    }

    #[test]
    fn test_default_score_prefers_higher_priority() {
        let temp_dir = TempDir::new().unwrap();
        let queue = open(&temp_dir, QueueConfig::default());

        let low = Message::new("a", "b", MessageType::Direct, "low", Priority::Low);
        let urgent = Message::new("a", "b", MessageType::Direct, "urgent", Priority::Urgent);
        queue.enqueue(low, None).unwrap();
        queue.enqueue(urgent, None).unwrap();

        assert_eq!(queue.dequeue().unwrap().unwrap().message.content, "urgent");
        assert_eq!(queue.dequeue().unwrap().unwrap().message.content, "low");
    }

    #[test]
    fn test_mark_delivered_moves_entry() {
        let temp_dir = TempDir::new().unwrap();
        let queue = open(&temp_dir, QueueConfig::default());
        let id = queue.enqueue(message("b"), None).unwrap();

        queue.dequeue().unwrap().unwrap();
        assert!(queue.mark_delivered(&id).unwrap());
        assert!(!queue.mark_delivered(&id).unwrap());

        let entry = queue.get_entry(&id).unwrap().unwrap();
        assert_eq!(entry.status, EntryStatus::Delivered);
        assert_eq!(entry.attempts, 1);
        assert!(entry.delivered_at.is_some());
        assert!(entry.next_retry_at.is_none());

        let stats = queue.get_queue_stats().unwrap();
        assert_eq!((stats.pending, stats.processing, stats.delivered), (0, 0, 1));
    }

    #[test]
    fn test_mark_failed_requeues_with_backoff() {
        let temp_dir = TempDir::new().unwrap();
        let queue = open(&temp_dir, QueueConfig::default());
        let id = queue.enqueue(message("b"), None).unwrap();

        queue.dequeue().unwrap().unwrap();
        assert!(queue.mark_failed(&id, "inbox busy", true).unwrap());

        let entry = queue.get_entry(&id).unwrap().unwrap();
        assert_eq!(entry.status, EntryStatus::Pending);
        assert_eq!(entry.attempts, 1);
        assert_eq!(entry.last_error.as_deref(), Some("inbox busy"));
        let wait = entry.next_retry_at.unwrap() - Utc::now();
        assert!(wait > chrono::Duration::milliseconds(500));
        assert!(wait <= chrono::Duration::milliseconds(1_000));

        // Still inside its backoff window.
        assert!(queue.dequeue().unwrap().is_none());
    }

    #[test]
    fn test_mark_failed_without_retry_is_terminal() {
        let temp_dir = TempDir::new().unwrap();
        let queue = open(&temp_dir, QueueConfig::default());
        let id = queue.enqueue(message("b"), None).unwrap();

        queue.dequeue().unwrap().unwrap();
        assert!(!queue.mark_failed(&id, "unknown agent", false).unwrap());

        let failed = queue.failed_entries().unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].status, EntryStatus::Failed);
        assert_eq!(failed[0].attempts, 1);
    }

    #[test]
    fn test_exhaustion_after_max_attempts() {
        let temp_dir = TempDir::new().unwrap();
        let queue = open(&temp_dir, immediate_retry_config());
        let id = queue.enqueue(message("b"), None).unwrap();

        let mut outcomes = Vec::new();
        while let Some(entry) = queue.dequeue().unwrap() {
            outcomes.push(queue.mark_failed(&entry.queue_id, "refused", true).unwrap());
        }
        assert_eq!(outcomes, vec![true, true, false]);

        let entry = queue.get_entry(&id).unwrap().unwrap();
        assert_eq!(entry.status, EntryStatus::Failed);
        assert_eq!(entry.attempts, 3);
    }

    #[test]
    fn test_mark_unknown_id_returns_false() {
        let temp_dir = TempDir::new().unwrap();
        let queue = open(&temp_dir, QueueConfig::default());
        assert!(!queue.mark_failed("missing", "x", true).unwrap());
        assert!(!queue.mark_delivered("missing").unwrap());
    }

    #[test]
    fn test_full_queue_rejects_enqueue() {
        let temp_dir = TempDir::new().unwrap();
        let config = QueueConfig {
            max_queue_size: 2,
            ..QueueConfig::default()
        };
        let queue = open(&temp_dir, config);

        queue.enqueue(message("b"), None).unwrap();
        queue.enqueue(message("b"), None).unwrap();
        let err = queue.enqueue(message("b"), None).unwrap_err();
        assert!(matches!(err, QueueError::Full { limit: 2 }));
    }

    #[test]
    fn test_expired_message_never_dequeued() {
        let temp_dir = TempDir::new().unwrap();
        let queue = open(&temp_dir, QueueConfig::default());
        let expiring = message("b").with_expires_in(Duration::ZERO);
        let id = queue.enqueue(expiring, Some(1_000.0)).unwrap();
        let live = queue.enqueue(message("b"), Some(1.0)).unwrap();

        let entry = queue.dequeue().unwrap().unwrap();
        assert_eq!(entry.queue_id, live);

        let expired = queue.get_entry(&id).unwrap().unwrap();
        assert_eq!(expired.status, EntryStatus::Expired);
        assert_eq!(queue.get_queue_stats().unwrap().expired, 1);
    }

    #[test]
    fn test_cleanup_purges_old_and_expires_timed_out() {
        let temp_dir = TempDir::new().unwrap();
        let queue = open(&temp_dir, QueueConfig::default());
        let old = queue.enqueue(message("b"), None).unwrap();
        let timed_out = queue
            .enqueue(message("b").with_expires_in(Duration::ZERO), None)
            .unwrap();
        let fresh = queue.enqueue(message("b"), None).unwrap();

        let mut pending = queue.pending_entries().unwrap();
        for entry in &mut pending {
            if entry.queue_id == old {
                entry.enqueued_at = Utc::now() - chrono::Duration::days(30);
            }
        }
        queue.save(Store::Pending, &pending).unwrap();

        assert_eq!(queue.cleanup_expired_entries().unwrap(), 2);
        assert!(queue.get_entry(&old).unwrap().is_none());
        assert_eq!(
            queue.get_entry(&timed_out).unwrap().unwrap().status,
            EntryStatus::Expired
        );
        assert_eq!(
            queue.get_entry(&fresh).unwrap().unwrap().status,
            EntryStatus::Pending
        );
        assert_eq!(queue.cleanup_expired_entries().unwrap(), 0);
    }

    #[test]
    fn test_retry_failed_messages_recovers_expired_lease() {
        let temp_dir = TempDir::new().unwrap();
        let queue = open(&temp_dir, immediate_retry_config());
        let id = queue.enqueue(message("b"), None).unwrap();
        queue.dequeue().unwrap().unwrap();

        // Lease still valid: nothing to recover.
        assert_eq!(queue.retry_failed_messages().unwrap(), 0);

        let mut processing = queue.load(Store::Processing).unwrap();
        processing[0].next_retry_at = Some(Utc::now() - chrono::Duration::seconds(1));
        queue.save(Store::Processing, &processing).unwrap();

        assert_eq!(queue.retry_failed_messages().unwrap(), 1);
        let entry = queue.get_entry(&id).unwrap().unwrap();
        assert_eq!(entry.status, EntryStatus::Pending);
        assert_eq!(entry.attempts, 1);
        assert_eq!(entry.last_error.as_deref(), Some(LEASE_EXPIRED_ERROR));

        let again = queue.dequeue().unwrap().unwrap();
        assert_eq!(again.queue_id, id);
    }

    #[test]
    fn test_corrupt_store_is_moved_aside() {
        let temp_dir = TempDir::new().unwrap();
        let queue = open(&temp_dir, QueueConfig::default());
        let pending_path = queue.root().join("pending.json");
        fs::write(&pending_path, "{not json").unwrap();

        assert!(queue.dequeue().unwrap().is_none());
        assert!(queue.root().join("pending.json.corrupt").exists());

        queue.enqueue(message("b"), None).unwrap();
        assert_eq!(queue.pending_entries().unwrap().len(), 1);
    }

    #[test]
    fn test_requeue_failed_resets_budget() {
        let temp_dir = TempDir::new().unwrap();
        let queue = open(&temp_dir, QueueConfig::default());
        let id = queue.enqueue(message("b"), None).unwrap();
        queue.dequeue().unwrap().unwrap();
        queue.mark_failed(&id, "down", false).unwrap();

        assert!(queue.requeue_failed(&id).unwrap());
        assert!(!queue.requeue_failed(&id).unwrap());

        let entry = queue.dequeue().unwrap().unwrap();
        assert_eq!(entry.queue_id, id);
        assert_eq!(entry.attempts, 0);
        assert_eq!(entry.last_error.as_deref(), Some("down"));
    }

    #[test]
    fn test_stats_report_levels_and_errors() {
        let temp_dir = TempDir::new().unwrap();
        let queue = open(&temp_dir, QueueConfig::default());
        let high = Message::new("a", "b", MessageType::Direct, "x", Priority::High);
        queue.enqueue(high, None).unwrap();
        queue.enqueue(message("b"), None).unwrap();
        queue.enqueue(message("c"), None).unwrap();

        let first = queue.dequeue().unwrap().unwrap();
        queue.mark_failed(&first.queue_id, "c is offline", false).unwrap();

        let stats = queue.get_queue_stats().unwrap();
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.pending_by_priority.get(&Priority::Normal), Some(&2));
        assert_eq!(stats.pending_by_priority.get(&Priority::High), None);
        assert!(stats.oldest_pending_age_secs.is_some());
        assert_eq!(stats.recent_errors.len(), 1);
        assert_eq!(stats.recent_errors[0].queue_id, first.queue_id);
        assert_eq!(stats.recent_errors[0].last_error.as_deref(), Some("c is offline"));
    }

    #[test]
    fn test_concurrent_enqueue_from_independent_managers() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("queue");

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let root = root.clone();
                std::thread::spawn(move || {
                    let queue =
                        PersistentQueue::open(root, QueueConfig::default(), test_locks()).unwrap();
                    for _ in 0..10 {
                        queue.enqueue(message("b"), None).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let queue = PersistentQueue::open(root, QueueConfig::default(), test_locks()).unwrap();
        assert_eq!(queue.pending_entries().unwrap().len(), 40);
    }
}

//! Queue entry schema: a message plus its delivery bookkeeping

use super::message::Message;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::fmt;

/// Delivery status of a queued message
///
/// `Delivered`, `Failed` and `Expired` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Pending,
    Processing,
    Delivered,
    Failed,
    Expired,
}

impl EntryStatus {
    /// Whether no further transitions can occur
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            EntryStatus::Delivered | EntryStatus::Failed | EntryStatus::Expired
        )
    }

    /// String label used on disk
    pub fn as_str(self) -> &'static str {
        match self {
            EntryStatus::Pending => "pending",
            EntryStatus::Processing => "processing",
            EntryStatus::Delivered => "delivered",
            EntryStatus::Failed => "failed",
            EntryStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message in one of the queue stores
///
/// Serialized with the message fields inlined, so each store is a flat array
/// of records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Queue-level id, distinct from the message id
    pub queue_id: String,

    /// The wrapped message
    #[serde(flatten)]
    pub message: Message,

    /// Ordering score; higher is delivered first
    pub priority_score: f64,

    /// Current status
    pub status: EntryStatus,

    /// Completed delivery attempts
    #[serde(default)]
    pub attempts: u32,

    /// Attempt budget before the entry becomes terminally failed
    pub max_attempts: u32,

    /// Earliest time the entry may be dequeued again (pending), or the end
    /// of its processing lease (processing)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,

    /// Most recent delivery error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    /// When the entry was first enqueued
    pub enqueued_at: DateTime<Utc>,

    /// Last status change
    pub updated_at: DateTime<Utc>,

    /// When delivery succeeded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,

    /// Queue-level metadata
    #[serde(default, rename = "queue_metadata", skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl QueueEntry {
    /// Wrap `message` as a new pending entry
    pub fn new(message: Message, priority_score: f64, max_attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            queue_id: uuid::Uuid::new_v4().to_string(),
            message,
            priority_score,
            status: EntryStatus::Pending,
            attempts: 0,
            max_attempts,
            next_retry_at: None,
            last_error: None,
            enqueued_at: now,
            updated_at: now,
            delivered_at: None,
            metadata: Map::new(),
        }
    }

    /// Default score for `message` at `now`
    ///
    /// Priority level base plus message type weight plus a recency bonus in
    /// `0.0..=1.0` that decays in whole-second steps over the message's first
    /// minute. The bonus never outweighs a level or type difference, and
    /// messages enqueued within a second of creation tie and stay FIFO.
    pub fn default_score(message: &Message, now: DateTime<Utc>) -> f64 {
        let age_secs = (now - message.created_at).num_seconds().clamp(0, 60) as f64;
        let recency_bonus = 1.0 - age_secs / 60.0;
        message.priority.base_score() + message.message_type.type_weight() + recency_bonus
    }

    /// Whether the entry may be dequeued at `now`
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.next_retry_at.is_none_or(|at| at <= now)
    }

    /// Whether the attempt budget is spent
    pub fn attempts_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// Delivery order: score descending, then enqueue time ascending
    pub fn delivery_order(&self, other: &Self) -> Ordering {
        other
            .priority_score
            .total_cmp(&self.priority_score)
            .then_with(|| self.enqueued_at.cmp(&other.enqueued_at))
    }

    pub(crate) fn set_status(&mut self, status: EntryStatus, now: DateTime<Utc>) {
        self.status = status;
        self.updated_at = now;
    }
}

/// Insert `entry` into `entries` (already in delivery order) after every
/// entry that sorts before or equal to it
pub fn insert_ordered(entries: &mut Vec<QueueEntry>, entry: QueueEntry) {
    let index = entries.partition_point(|e| e.delivery_order(&entry) != Ordering::Greater);
    entries.insert(index, entry);
}

//! In-memory routing state: the pending heap, history and counters

use crate::schema::{EntryStatus, Message};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, HashMap};

/// Routing status of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Delivered,
    Failed,
    Expired,
}

impl MessageStatus {
    pub fn is_terminal(self) -> bool {
        self != MessageStatus::Pending
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Failed => "failed",
            MessageStatus::Expired => "expired",
        }
    }
}

impl From<EntryStatus> for MessageStatus {
    fn from(status: EntryStatus) -> Self {
        match status {
            EntryStatus::Pending | EntryStatus::Processing => MessageStatus::Pending,
            EntryStatus::Delivered => MessageStatus::Delivered,
            EntryStatus::Failed => MessageStatus::Failed,
            EntryStatus::Expired => MessageStatus::Expired,
        }
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// History record kept for every routed message
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageRecord {
    pub message_id: String,
    pub sender: String,
    pub recipient: String,
    pub status: MessageStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Queue id when the router is backed by a persistent queue
    pub queue_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl MessageRecord {
    pub(crate) fn pending(message: &Message, queue_id: Option<String>) -> Self {
        Self {
            message_id: message.id.clone(),
            sender: message.sender.clone(),
            recipient: message.recipient.clone(),
            status: MessageStatus::Pending,
            attempts: 0,
            last_error: None,
            queue_id,
            updated_at: Utc::now(),
        }
    }
}

/// Router counters and pending totals
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RoutingStats {
    pub sent: u64,
    pub delivered: u64,
    pub failed: u64,
    pub expired: u64,
    pub retried: u64,
    pub pending: usize,
    pub pending_by_target: BTreeMap<String, usize>,
}

/// A message waiting in the in-memory heap
#[derive(Debug, Clone)]
pub(crate) struct Queued {
    /// Effective priority; lowered on every failed attempt
    pub score: f64,
    /// Insertion sequence; lower is older
    pub seq: u64,
    pub attempts: u32,
    pub not_before: Option<DateTime<Utc>>,
    pub message: Message,
}

impl Queued {
    fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.not_before.is_none_or(|at| at <= now)
    }
}

// Max-heap: higher score first, then lower sequence (FIFO).
impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Queued {}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub sent: u64,
    pub delivered: u64,
    pub failed: u64,
    pub expired: u64,
    pub retried: u64,
}

#[derive(Debug, Default)]
pub(crate) struct RouterState {
    heap: BinaryHeap<Queued>,
    next_seq: u64,
    pub history: HashMap<String, MessageRecord>,
    /// Fan-out group id to member message ids
    pub groups: HashMap<String, Vec<String>>,
    pub agents: Vec<String>,
    pub round_robin_next: usize,
    pub counters: Counters,
}

impl RouterState {
    pub fn push(&mut self, message: Message, score: f64) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Queued {
            score,
            seq,
            attempts: 0,
            not_before: None,
            message,
        });
    }

    pub fn requeue(&mut self, queued: Queued) {
        self.heap.push(queued);
    }

    /// Pop the best entry that is ready at `now`
    pub fn pop_ready(&mut self, now: DateTime<Utc>) -> Option<Queued> {
        let mut waiting = Vec::new();
        let mut found = None;
        while let Some(top) = self.heap.pop() {
            if top.is_ready(now) {
                found = Some(top);
                break;
            }
            waiting.push(top);
        }
        self.heap.extend(waiting);
        found
    }

    pub fn queued(&self) -> impl Iterator<Item = &Queued> {
        self.heap.iter()
    }

    pub fn pending_by_target(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for queued in &self.heap {
            *counts.entry(queued.message.recipient.clone()).or_default() += 1;
        }
        counts
    }

    /// Next agent in rotation
    pub fn next_agent(&mut self) -> Option<String> {
        if self.agents.is_empty() {
            return None;
        }
        let agent = self.agents[self.round_robin_next % self.agents.len()].clone();
        self.round_robin_next = (self.round_robin_next + 1) % self.agents.len();
        Some(agent)
    }

    pub fn record(&mut self, message_id: &str) -> Option<&mut MessageRecord> {
        self.history.get_mut(message_id)
    }
}

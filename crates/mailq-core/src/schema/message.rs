//! Message schema shared by the queue and the router

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Priority level of a message
///
/// Ordered `Low < Normal < High < Urgent`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl Priority {
    /// All levels, lowest first
    pub const ALL: [Priority; 4] = [
        Priority::Low,
        Priority::Normal,
        Priority::High,
        Priority::Urgent,
    ];

    /// String label used on disk and on the command line
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }

    /// Base contribution of this level to a queue priority score
    pub fn base_score(self) -> f64 {
        match self {
            Priority::Low => 10.0,
            Priority::Normal => 50.0,
            Priority::High => 100.0,
            Priority::Urgent => 200.0,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "urgent" => Ok(Priority::Urgent),
            other => Err(format!(
                "unknown priority '{other}' (expected low, normal, high or urgent)"
            )),
        }
    }
}

/// Kind of message, used to select routing rules and delivery callbacks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Coordination,
    Status,
    Broadcast,
    Emergency,
    Heartbeat,
    Task,
    Direct,
}

impl MessageType {
    /// All message types
    pub const ALL: [MessageType; 7] = [
        MessageType::Coordination,
        MessageType::Status,
        MessageType::Broadcast,
        MessageType::Emergency,
        MessageType::Heartbeat,
        MessageType::Task,
        MessageType::Direct,
    ];

    /// String label used on disk and in configuration
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Coordination => "coordination",
            MessageType::Status => "status",
            MessageType::Broadcast => "broadcast",
            MessageType::Emergency => "emergency",
            MessageType::Heartbeat => "heartbeat",
            MessageType::Task => "task",
            MessageType::Direct => "direct",
        }
    }

    /// Score adjustment applied on top of the priority level
    pub fn type_weight(self) -> f64 {
        match self {
            MessageType::Emergency => 100.0,
            MessageType::Broadcast => 25.0,
            MessageType::Coordination => 10.0,
            MessageType::Task => 5.0,
            MessageType::Status | MessageType::Direct => 0.0,
            MessageType::Heartbeat => -5.0,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        MessageType::ALL
            .into_iter()
            .find(|t| t.as_str() == wanted)
            .ok_or_else(|| format!("unknown message type '{}'", s.trim()))
    }
}

/// A message exchanged between agents
///
/// Messages are immutable once created; delivery bookkeeping lives in
/// [`QueueEntry`](crate::schema::QueueEntry) or the router's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message id (UUID v4)
    pub id: String,

    /// Sending agent
    pub sender: String,

    /// Receiving agent
    pub recipient: String,

    /// Message kind
    pub message_type: MessageType,

    /// Priority level
    pub priority: Priority,

    /// Raw message content
    pub content: String,

    /// Creation time
    pub created_at: DateTime<Utc>,

    /// Optional expiry; an expired message is never delivered
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,

    /// Caller-supplied metadata
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl Message {
    /// Create a message stamped with a fresh id and the current time
    pub fn new(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        message_type: MessageType,
        content: impl Into<String>,
        priority: Priority,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            sender: sender.into(),
            recipient: recipient.into(),
            message_type,
            priority,
            content: content.into(),
            created_at: Utc::now(),
            expires_at: None,
            metadata: Map::new(),
        }
    }

    /// Set the expiry relative to the creation time
    pub fn with_expires_in(mut self, ttl: Duration) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        self.expires_at = self.created_at.checked_add_signed(ttl);
        self
    }

    /// Attach a metadata value
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Copy of this message addressed to `recipient` under a new id
    pub fn readdressed(&self, recipient: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            recipient: recipient.into(),
            ..self.clone()
        }
    }

    /// Whether the expiry has passed at `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

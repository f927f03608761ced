//! Durable message queue and its background processor
//!
//! [`PersistentQueue`] keeps four JSON stores under one root directory
//! (`pending.json`, `processing.json`, `delivered.json`, `failed.json`), each
//! mutated only under its sentinel lock. [`QueueProcessor`] drains the queue
//! through a [`Deliver`](crate::delivery::Deliver) implementation.

pub mod persistent;
pub mod processor;

use crate::io::LockError;
use crate::schema::Priority;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

pub use persistent::PersistentQueue;
pub use processor::QueueProcessor;

/// Queue operation error
#[derive(Debug, Error)]
pub enum QueueError {
    /// A store lock could not be obtained
    #[error(transparent)]
    Lock(#[from] LockError),

    /// Filesystem error outside a locked write
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A store could not be serialized
    #[error("JSON error for {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// The pending store is at capacity
    #[error("queue is full ({limit} pending entries)")]
    Full { limit: usize },
}

/// Failed entry summary reported by [`QueueStats`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedEntrySummary {
    pub queue_id: String,
    pub message_id: String,
    pub recipient: String,
    pub attempts: u32,
    pub last_error: Option<String>,
}

/// Snapshot of queue health
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub processing: usize,
    pub delivered: usize,
    /// Entries in the failed store, expired ones included
    pub failed: usize,
    /// Failed-store entries whose status is `expired`
    pub expired: usize,
    /// Pending entries per priority level
    pub pending_by_priority: BTreeMap<Priority, usize>,
    /// Age of the oldest pending entry in seconds
    pub oldest_pending_age_secs: Option<f64>,
    /// Failed entries with their last error, most recently updated first
    pub recent_errors: Vec<FailedEntrySummary>,
}

//! Schema types persisted in queue stores and exchanged with callbacks
//!
//! All enums serialize as snake_case string labels and all timestamps as
//! RFC 3339 text, so store files stay readable by other tooling.

mod entry;
mod message;

pub use entry::{EntryStatus, QueueEntry, insert_ordered};
pub use message::{Message, MessageType, Priority};

//! Core library for mailq, a filesystem mailbox for cooperating agents
//!
//! Agents that share nothing but a directory exchange messages through:
//!
//! - [`io`]: per-path sentinel locks and atomic file replacement
//! - [`queue`]: a durable priority queue with retry, backoff and expiry,
//!   plus a background processor
//! - [`router`]: per-type routing rules and priority dispatch
//! - [`delivery`]: delivery callbacks, including the inbox text artifact
//!
//! All shared state lives in files guarded by [`io::LockManager`]; there is
//! no daemon and no global lock table.

pub mod config;
pub mod delivery;
pub mod home;
pub mod io;
pub mod logging;
pub mod queue;
pub mod router;
pub mod schema;

pub use config::Config;
pub use delivery::{Deliver, DeliveryError};
pub use io::{LockError, LockManager};
pub use queue::{PersistentQueue, QueueError, QueueProcessor, QueueStats};
pub use router::{MessageStatus, Router, RouterError};
pub use schema::{EntryStatus, Message, MessageType, Priority, QueueEntry};

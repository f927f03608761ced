//! Lock-guarded file I/O for shared queue stores
//!
//! This module provides the only way mailq mutates shared files:
//!
//! - **Sentinel locks**: `F.lock` created atomically and held with an advisory
//!   lock, with stale-holder reclaim (age or dead pid)
//! - **Atomic replacement**: temp file + fsync + rename under the lock
//!
//! # Example
//!
//! ```rust,no_run
//! use mailq_core::config::LockConfig;
//! use mailq_core::io::{atomic_update, LockManager};
//! use std::path::Path;
//!
//! let locks = LockManager::new(LockConfig::default());
//! let path = Path::new("/tmp/mailq/counter");
//!
//! atomic_update(&locks, path, |current| {
//!     let n: u64 = current
//!         .and_then(|c| std::str::from_utf8(c).ok())
//!         .and_then(|s| s.parse().ok())
//!         .unwrap_or(0);
//!     (n + 1).to_string().into_bytes()
//! })
//! .unwrap();
//! ```

pub mod atomic;
pub mod error;
pub mod lock;

// Re-export primary API
pub use atomic::{atomic_read, atomic_update, atomic_write};
pub use error::LockError;
pub use lock::{LockGuard, LockHandle, LockManager, sentinel_path};

//! Canonical home directory resolution for mailq
//!
//! Every default path (queue root, inbox root, global config) hangs off one
//! home directory so tests and custom deployments can relocate everything with
//! a single environment variable.
//!
//! # Precedence
//!
//! 1. `MAILQ_HOME` environment variable (if set and non-empty)
//! 2. `dirs::home_dir()` platform default
//!
//! # Layout
//!
//! ```text
//! <home>/.mailq/queue/       pending.json, processing.json, delivered.json, failed.json
//! <home>/.mailq/inboxes/     <agent>/<timestamp>_<message-id>.txt
//! <home>/.config/mailq/config.toml
//! ```

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Environment variable overriding the home directory.
pub const HOME_ENV: &str = "MAILQ_HOME";

/// Get the home directory for mailq operations
///
/// # Errors
///
/// Returns an error if `MAILQ_HOME` is not set and the platform home directory
/// cannot be determined.
pub fn get_home_dir() -> Result<PathBuf> {
    if let Ok(home) = std::env::var(HOME_ENV) {
        let trimmed = home.trim();
        if !trimmed.is_empty() {
            return Ok(PathBuf::from(trimmed));
        }
    }

    dirs::home_dir().context("Could not determine home directory")
}

/// Default queue root under `home`.
pub fn default_queue_root(home: &Path) -> PathBuf {
    home.join(".mailq").join("queue")
}

/// Default inbox root under `home`.
pub fn default_inbox_root(home: &Path) -> PathBuf {
    home.join(".mailq").join("inboxes")
}

/// Global configuration file under `home`.
pub fn global_config_path(home: &Path) -> PathBuf {
    home.join(".config").join("mailq").join("config.toml")
}

//! Shared logging initialization for mailq binaries and long-running workers.

use std::sync::OnceLock;

static INIT: OnceLock<()> = OnceLock::new();

/// Environment variable that selects the log level.
pub const LOG_ENV: &str = "MAILQ_LOG";

fn parse_level(raw: Option<&str>) -> tracing::Level {
    match raw.unwrap_or("info").trim().to_ascii_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "warn" | "warning" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    }
}

/// Initialize process-level tracing output from `MAILQ_LOG`.
///
/// Safe to call multiple times; only the first call installs the subscriber.
/// Logs go to stderr so command output on stdout stays machine-readable.
pub fn init() {
    if INIT.get().is_some() {
        return;
    }
    let level = parse_level(std::env::var(LOG_ENV).ok().as_deref());
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
    let _ = INIT.set(());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level_variants() {
        assert_eq!(parse_level(Some("trace")), tracing::Level::TRACE);
        assert_eq!(parse_level(Some("DEBUG")), tracing::Level::DEBUG);
        assert_eq!(parse_level(Some("warning")), tracing::Level::WARN);
        assert_eq!(parse_level(Some(" error ")), tracing::Level::ERROR);
        assert_eq!(parse_level(Some("nonsense")), tracing::Level::INFO);
        assert_eq!(parse_level(None), tracing::Level::INFO);
    }

    #[test]
    fn test_init_is_idempotent() {
        init();
        init();
    }
}

//! Configuration discovery and resolution

use super::types::Config;
use crate::home::global_config_path;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

/// Configuration error
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// A value failed validation
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Command-line overrides for configuration
#[derive(Debug, Default, Clone)]
pub struct ConfigOverrides {
    /// Override identity
    pub identity: Option<String>,
    /// Override queue root
    pub queue_root: Option<PathBuf>,
    /// Override inbox root
    pub inbox_root: Option<PathBuf>,
    /// Extra config file applied above all discovered files
    pub config_path: Option<PathBuf>,
}

/// Name of the repo-local config file
pub const REPO_CONFIG_FILE: &str = ".mailq.toml";

/// Resolve configuration from all sources
///
/// Priority (highest to lowest):
/// 1. Command-line overrides (including `config_path`)
/// 2. Environment variables (`MAILQ_IDENTITY`, `MAILQ_QUEUE_ROOT`, `MAILQ_INBOX_ROOT`)
/// 3. Repo-local config (`.mailq.toml` in current dir or a parent, up to the git root)
/// 4. Global config (`~/.config/mailq/config.toml`)
/// 5. Defaults
///
/// Files are merged key by key, so a repo file that sets only
/// `queue.batch_size` keeps every other value from the global file.
/// Unparseable discovered files are logged and skipped; an unparseable
/// explicit `config_path` is an error. The result is validated.
pub fn resolve_config(
    overrides: &ConfigOverrides,
    current_dir: &Path,
    home_dir: &Path,
) -> Result<Config, ConfigError> {
    let mut merged = toml::Table::new();

    // 4. Global config
    let global = global_config_path(home_dir);
    if global.exists() {
        match load_table(&global) {
            Ok(table) => merge_tables(&mut merged, table),
            Err(e) => warn!("Failed to parse global config at {global:?}: {e}"),
        }
    }

    // 3. Repo-local config
    if let Some(repo_config) = find_repo_local_config(current_dir)
        && repo_config != global
    {
        match load_table(&repo_config) {
            Ok(table) => merge_tables(&mut merged, table),
            Err(e) => warn!("Failed to parse repo config at {repo_config:?}: {e}"),
        }
    }

    // Explicit file from the command line
    if let Some(ref path) = overrides.config_path {
        merge_tables(&mut merged, load_table(path)?);
    }

    let mut config: Config = toml::Value::Table(merged).try_into()?;

    // 2. Environment
    apply_env_overrides(&mut config);

    // 1. Command line
    apply_cli_overrides(&mut config, overrides);

    config.validate()?;
    Ok(config)
}

/// Find repo-local config file
///
/// Searches current directory and parent directories up to git root
fn find_repo_local_config(current_dir: &Path) -> Option<PathBuf> {
    let mut dir = current_dir;

    loop {
        let config_path = dir.join(REPO_CONFIG_FILE);
        if config_path.exists() {
            return Some(config_path);
        }

        if dir.join(".git").exists() {
            break;
        }

        dir = dir.parent()?;
    }

    None
}

/// Load a config file into a `Config`, filling defaults
pub fn load_config_file(path: &Path) -> Result<Config, ConfigError> {
    let config: Config = toml::Value::Table(load_table(path)?).try_into()?;
    Ok(config)
}

fn load_table(path: &Path) -> Result<toml::Table, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    let table: toml::Table = toml::from_str(&contents)?;
    Ok(table)
}

/// Deep-merge `overlay` into `base`; overlay wins on scalar conflicts
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Apply environment variable overrides
fn apply_env_overrides(config: &mut Config) {
    if let Ok(identity) = std::env::var("MAILQ_IDENTITY")
        && !identity.trim().is_empty()
    {
        config.core.identity = identity.trim().to_string();
    }

    if let Ok(root) = std::env::var("MAILQ_QUEUE_ROOT")
        && !root.trim().is_empty()
    {
        config.core.queue_root = Some(PathBuf::from(root.trim()));
    }

    if let Ok(root) = std::env::var("MAILQ_INBOX_ROOT")
        && !root.trim().is_empty()
    {
        config.core.inbox_root = Some(PathBuf::from(root.trim()));
    }
}

/// Apply command-line overrides
fn apply_cli_overrides(config: &mut Config, overrides: &ConfigOverrides) {
    if let Some(ref identity) = overrides.identity {
        config.core.identity = identity.clone();
    }

    if let Some(ref root) = overrides.queue_root {
        config.core.queue_root = Some(root.clone());
    }

    if let Some(ref root) = overrides.inbox_root {
        config.core.inbox_root = Some(root.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;
    use tempfile::TempDir;

    fn clear_env() {
        unsafe {
            env::remove_var("MAILQ_IDENTITY");
            env::remove_var("MAILQ_QUEUE_ROOT");
            env::remove_var("MAILQ_INBOX_ROOT");
        }
    }

    #[test]
    #[serial]
    fn test_config_defaults() {
        clear_env();
        let temp_dir = TempDir::new().unwrap();

        let config =
            resolve_config(&ConfigOverrides::default(), temp_dir.path(), temp_dir.path()).unwrap();

        assert_eq!(config, Config::default());
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        clear_env();
        let temp_dir = TempDir::new().unwrap();

        unsafe {
            env::set_var("MAILQ_IDENTITY", "env-agent");
            env::set_var("MAILQ_QUEUE_ROOT", "/var/mailq/queue");
        }

        let config =
            resolve_config(&ConfigOverrides::default(), temp_dir.path(), temp_dir.path()).unwrap();

        assert_eq!(config.core.identity, "env-agent");
        assert_eq!(config.core.queue_root, Some(PathBuf::from("/var/mailq/queue")));
        assert_eq!(config.core.inbox_root, None);

        clear_env();
    }

    #[test]
    #[serial]
    fn test_cli_overrides_beat_env() {
        clear_env();
        let temp_dir = TempDir::new().unwrap();
        unsafe { env::set_var("MAILQ_IDENTITY", "env-agent") };

        let overrides = ConfigOverrides {
            identity: Some("cli-agent".to_string()),
            inbox_root: Some(PathBuf::from("/tmp/inboxes")),
            ..Default::default()
        };
        let config = resolve_config(&overrides, temp_dir.path(), temp_dir.path()).unwrap();

        assert_eq!(config.core.identity, "cli-agent");
        assert_eq!(config.core.inbox_root, Some(PathBuf::from("/tmp/inboxes")));

        clear_env();
    }

    #[test]
    #[serial]
    fn test_repo_config_merges_over_global() {
        clear_env();
        let temp_dir = TempDir::new().unwrap();
        let home_dir = temp_dir.path();
        let repo_dir = temp_dir.path().join("repo");
        let sub_dir = repo_dir.join("src");
        std::fs::create_dir_all(&sub_dir).unwrap();
        std::fs::create_dir_all(repo_dir.join(".git")).unwrap();

        let global = global_config_path(home_dir);
        std::fs::create_dir_all(global.parent().unwrap()).unwrap();
        std::fs::write(
            &global,
            "[queue]\nbatch_size = 4\nmax_attempts = 6\n\n[lock]\ntimeout_ms = 900\n",
        )
        .unwrap();
        std::fs::write(repo_dir.join(REPO_CONFIG_FILE), "[queue]\nbatch_size = 2\n").unwrap();

        let config = resolve_config(&ConfigOverrides::default(), &sub_dir, home_dir).unwrap();

        assert_eq!(config.queue.batch_size, 2);
        assert_eq!(config.queue.max_attempts, 6);
        assert_eq!(config.lock.timeout_ms, 900);
    }

    #[test]
    #[serial]
    fn test_malformed_discovered_config_is_skipped() {
        clear_env();
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join(REPO_CONFIG_FILE), "invalid toml [[[").unwrap();

        let config =
            resolve_config(&ConfigOverrides::default(), temp_dir.path(), temp_dir.path()).unwrap();
        assert_eq!(config.queue, Config::default().queue);
    }

    #[test]
    #[serial]
    fn test_explicit_config_path_errors_propagate() {
        clear_env();
        let temp_dir = TempDir::new().unwrap();
        let bad = temp_dir.path().join("bad.toml");
        std::fs::write(&bad, "invalid toml [[[").unwrap();

        let overrides = ConfigOverrides {
            config_path: Some(bad),
            ..Default::default()
        };
        let result = resolve_config(&overrides, temp_dir.path(), temp_dir.path());
        assert!(matches!(result, Err(ConfigError::TomlParse(_))));
    }

    #[test]
    #[serial]
    fn test_invalid_values_are_rejected() {
        clear_env();
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("zero.toml");
        std::fs::write(&path, "[queue]\nbatch_size = 0\n").unwrap();

        let overrides = ConfigOverrides {
            config_path: Some(path),
            ..Default::default()
        };
        let result = resolve_config(&overrides, temp_dir.path(), temp_dir.path());
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_load_config_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[core]
identity = "file-agent"

[router.rules.heartbeat]
priority = "low"
strategy = "specific"
max_attempts = 2
"#,
        )
        .unwrap();

        let config = load_config_file(&path).unwrap();
        assert_eq!(config.core.identity, "file-agent");
        assert_eq!(config.router.rules["heartbeat"].retry.max_attempts, 2);
        assert_eq!(config.router.rules["heartbeat"].retry.retry_delay_ms, 0);
    }
}

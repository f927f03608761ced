//! Configuration types

use crate::schema::{MessageType, Priority};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use super::discovery::ConfigError;

/// Complete configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Core configuration
    #[serde(default)]
    pub core: CoreConfig,
    /// Resource lock timing
    #[serde(default)]
    pub lock: LockConfig,
    /// Persistent queue and processor settings
    #[serde(default)]
    pub queue: QueueConfig,
    /// Router settings and per-type rules
    #[serde(default)]
    pub router: RouterConfig,
}

impl Config {
    /// Check every section for values that would make the system misbehave
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.lock.validate()?;
        self.queue.validate()?;
        self.router.validate()?;
        Ok(())
    }
}

/// Core configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Sender identity used by the CLI
    #[serde(default = "default_identity")]
    pub identity: String,
    /// Queue root directory (default: `<home>/.mailq/queue`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_root: Option<PathBuf>,
    /// Inbox root directory (default: `<home>/.mailq/inboxes`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inbox_root: Option<PathBuf>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            identity: default_identity(),
            queue_root: None,
            inbox_root: None,
        }
    }
}

fn default_identity() -> String {
    "human".to_string()
}

/// Resource lock timing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Maximum time to wait for a lock
    pub timeout_ms: u64,
    /// Poll interval while waiting
    pub retry_interval_ms: u64,
    /// Maximum failed attempts before giving up
    pub max_retries: u32,
    /// Age after which a sentinel is considered abandoned
    pub stale_lock_age_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            retry_interval_ms: 100,
            max_retries: 100,
            stale_lock_age_secs: 300,
        }
    }
}

impl LockConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn stale_lock_age(&self) -> Duration {
        Duration::from_secs(self.stale_lock_age_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_ms == 0 {
            return Err(invalid("lock.timeout_ms must be greater than 0"));
        }
        if self.retry_interval_ms == 0 {
            return Err(invalid("lock.retry_interval_ms must be greater than 0"));
        }
        if self.stale_lock_age_secs == 0 {
            return Err(invalid("lock.stale_lock_age_secs must be greater than 0"));
        }
        Ok(())
    }
}

/// Persistent queue and processor settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum number of pending entries
    pub max_queue_size: usize,
    /// Entries older than this are purged by cleanup
    pub max_age_secs: u64,
    /// First retry delay; doubles per failed attempt
    pub retry_base_delay_ms: u64,
    /// Upper bound on the retry delay
    pub retry_max_delay_ms: u64,
    /// Entries handled per processor batch
    pub batch_size: usize,
    /// Default attempt budget per entry
    pub max_attempts: u32,
    /// Lease after which an in-flight entry is considered abandoned
    pub processing_timeout_secs: u64,
    /// Processor sleep between batches
    pub poll_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 10_000,
            max_age_secs: 7 * 24 * 60 * 60,
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 300_000,
            batch_size: 10,
            max_attempts: 3,
            processing_timeout_secs: 300,
            poll_interval_ms: 1_000,
        }
    }
}

impl QueueConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    pub fn processing_timeout(&self) -> Duration {
        Duration::from_secs(self.processing_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Backoff before the retry that follows `attempts` failed attempts
    ///
    /// `min(base * 2^(attempts - 1), max)`
    pub fn retry_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(32);
        let delay = self.retry_base_delay_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.retry_max_delay_ms))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_queue_size == 0 {
            return Err(invalid("queue.max_queue_size must be greater than 0"));
        }
        if self.batch_size == 0 {
            return Err(invalid("queue.batch_size must be greater than 0"));
        }
        if self.max_attempts == 0 {
            return Err(invalid("queue.max_attempts must be at least 1"));
        }
        if self.retry_max_delay_ms < self.retry_base_delay_ms {
            return Err(invalid(
                "queue.retry_max_delay_ms must not be smaller than queue.retry_base_delay_ms",
            ));
        }
        if self.processing_timeout_secs == 0 {
            return Err(invalid("queue.processing_timeout_secs must be greater than 0"));
        }
        Ok(())
    }
}

/// How a message type is addressed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStrategy {
    /// One copy per known agent, sender excluded
    Broadcast,
    /// Exactly the named recipient
    Specific,
    /// The next known agent in rotation when no recipient is named
    RoundRobin,
}

/// Retry policy of a routing rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempt budget
    pub max_attempts: u32,
    /// Delay before a failed message becomes eligible again
    #[serde(default)]
    pub retry_delay_ms: u64,
}

impl RetryPolicy {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Static per-message-type delivery policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingRule {
    /// Priority used when the sender does not give one
    pub priority: Priority,
    /// Addressing strategy
    pub strategy: DeliveryStrategy,
    /// Retry policy
    #[serde(flatten)]
    pub retry: RetryPolicy,
}

impl RoutingRule {
    pub const fn new(
        priority: Priority,
        strategy: DeliveryStrategy,
        max_attempts: u32,
        retry_delay_ms: u64,
    ) -> Self {
        Self {
            priority,
            strategy,
            retry: RetryPolicy {
                max_attempts,
                retry_delay_ms,
            },
        }
    }

    /// Built-in rule for `message_type`
    pub fn builtin(message_type: MessageType) -> Self {
        use DeliveryStrategy::{Broadcast, RoundRobin, Specific};
        match message_type {
            MessageType::Emergency => Self::new(Priority::Urgent, Broadcast, 5, 500),
            MessageType::Broadcast => Self::new(Priority::High, Broadcast, 3, 1_000),
            MessageType::Coordination => Self::new(Priority::High, Specific, 3, 1_000),
            MessageType::Status => Self::new(Priority::Normal, Specific, 3, 1_000),
            MessageType::Task => Self::new(Priority::Normal, RoundRobin, 3, 1_000),
            MessageType::Direct => Self::new(Priority::Normal, Specific, 3, 1_000),
            MessageType::Heartbeat => Self::new(Priority::Low, Specific, 1, 0),
        }
    }
}

/// Router settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Routing loop sleep when idle
    pub routing_interval_ms: u64,
    /// Effective priority lost per failed attempt
    pub retry_demotion: i64,
    /// Rule overrides keyed by message type label
    pub rules: BTreeMap<String, RoutingRule>,
    /// Agents registered at startup, targets for `"*"` under broadcast and
    /// round-robin rules
    pub agents: Vec<String>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            routing_interval_ms: 100,
            retry_demotion: 25,
            rules: BTreeMap::new(),
            agents: Vec::new(),
        }
    }
}

impl RouterConfig {
    pub fn routing_interval(&self) -> Duration {
        Duration::from_millis(self.routing_interval_ms)
    }

    /// Built-in rules with configured overrides applied
    pub fn resolved_rules(&self) -> Result<BTreeMap<MessageType, RoutingRule>, ConfigError> {
        let mut rules: BTreeMap<MessageType, RoutingRule> = MessageType::ALL
            .into_iter()
            .map(|t| (t, RoutingRule::builtin(t)))
            .collect();
        for (label, rule) in &self.rules {
            let message_type = MessageType::from_str(label).map_err(ConfigError::Invalid)?;
            rules.insert(message_type, *rule);
        }
        Ok(rules)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.routing_interval_ms == 0 {
            return Err(invalid("router.routing_interval_ms must be greater than 0"));
        }
        if self.retry_demotion < 0 {
            return Err(invalid("router.retry_demotion must not be negative"));
        }
        if self.agents.iter().any(|a| a.trim().is_empty() || a == "*") {
            return Err(invalid("router.agents entries must be agent names"));
        }
        for (label, rule) in self.resolved_rules()? {
            if rule.retry.max_attempts == 0 {
                return Err(invalid(&format!(
                    "router.rules.{label}.max_attempts must be at least 1"
                )));
            }
        }
        Ok(())
    }
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::Invalid(message.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = Config::default();
        assert_eq!(config.core.identity, "human");
        assert_eq!(config.lock.timeout(), Duration::from_secs(10));
        assert_eq!(config.lock.stale_lock_age(), Duration::from_secs(300));
        assert_eq!(config.queue.batch_size, 10);
        assert_eq!(config.queue.max_attempts, 3);
        assert_eq!(config.router.routing_interval(), Duration::from_millis(100));
        config.validate().unwrap();
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let deserialized: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(config, deserialized);
    }

    #[test]
    fn test_partial_sections_use_defaults() {
        let toml_str = r#"
[lock]
timeout_ms = 250

[queue]
batch_size = 3
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.lock.timeout_ms, 250);
        assert_eq!(config.lock.retry_interval_ms, 100);
        assert_eq!(config.queue.batch_size, 3);
        assert_eq!(config.queue.max_queue_size, 10_000);
        assert_eq!(config.core.identity, "human");
    }

    #[test]
    fn test_retry_delay_doubles_and_caps() {
        let queue = QueueConfig {
            retry_base_delay_ms: 100,
            retry_max_delay_ms: 500,
            ..QueueConfig::default()
        };
        assert_eq!(queue.retry_delay(1), Duration::from_millis(100));
        assert_eq!(queue.retry_delay(2), Duration::from_millis(200));
        assert_eq!(queue.retry_delay(3), Duration::from_millis(400));
        assert_eq!(queue.retry_delay(4), Duration::from_millis(500));
        assert_eq!(queue.retry_delay(60), Duration::from_millis(500));
        assert_eq!(queue.retry_delay(0), Duration::from_millis(100));
    }

    #[test]
    fn test_rule_overrides_from_toml() {
        let toml_str = r#"
[router.rules.status]
priority = "high"
strategy = "broadcast"
max_attempts = 7
retry_delay_ms = 20
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        let rules = config.router.resolved_rules().unwrap();

        let status = rules[&MessageType::Status];
        assert_eq!(status.priority, Priority::High);
        assert_eq!(status.strategy, DeliveryStrategy::Broadcast);
        assert_eq!(status.retry.max_attempts, 7);
        assert_eq!(status.retry.delay(), Duration::from_millis(20));
        assert_eq!(rules[&MessageType::Task], RoutingRule::builtin(MessageType::Task));
        assert_eq!(rules.len(), MessageType::ALL.len());
    }

    #[test]
    fn test_unknown_rule_type_is_invalid() {
        let toml_str = r#"
[router.rules.gossip]
priority = "low"
strategy = "specific"
max_attempts = 1
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.queue.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.queue.retry_base_delay_ms = 1_000;
        config.queue.retry_max_delay_ms = 10;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.lock.retry_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.router.rules.insert(
            "direct".to_string(),
            RoutingRule::new(Priority::Normal, DeliveryStrategy::Specific, 0, 0),
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_router_agents_from_toml() {
        let config: Config = toml::from_str("[router]\nagents = [\"alice\", \"bob\"]\n").unwrap();
        assert_eq!(config.router.agents, vec!["alice", "bob"]);
        assert!(config.validate().is_ok());

        let config: Config = toml::from_str("[router]\nagents = [\"alice\", \"*\"]\n").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}

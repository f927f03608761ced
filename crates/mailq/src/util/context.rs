//! Configuration and queue resolution shared by every command

use anyhow::{Context, Result};
use clap::Args;
use mailq_core::config::{Config, ConfigOverrides, resolve_config};
use mailq_core::home::{default_inbox_root, default_queue_root, get_home_dir};
use mailq_core::{LockManager, PersistentQueue, Router};
use std::path::PathBuf;
use std::sync::Arc;

/// Options accepted by every command
#[derive(Args, Debug, Default)]
pub struct GlobalArgs {
    /// Queue directory (default: MAILQ_QUEUE_ROOT, config, or ~/.mailq/queue)
    #[arg(long, global = true)]
    queue_root: Option<PathBuf>,

    /// Inbox directory (default: MAILQ_INBOX_ROOT, config, or ~/.mailq/inboxes)
    #[arg(long, global = true)]
    inbox_root: Option<PathBuf>,

    /// Extra config file applied over discovered ones
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

/// Resolved configuration and directories for one invocation
pub struct QueueContext {
    pub config: Config,
    pub queue_root: PathBuf,
    pub inbox_root: PathBuf,
}

impl QueueContext {
    /// Resolve configuration, with `identity` overriding the configured sender
    pub fn resolve(global: &GlobalArgs, identity: Option<String>) -> Result<Self> {
        let home_dir = get_home_dir()?;
        let current_dir = std::env::current_dir()?;

        let overrides = ConfigOverrides {
            identity,
            queue_root: global.queue_root.clone(),
            inbox_root: global.inbox_root.clone(),
            config_path: global.config.clone(),
        };
        let config = resolve_config(&overrides, &current_dir, &home_dir)
            .context("Failed to resolve configuration")?;

        let queue_root = config
            .core
            .queue_root
            .clone()
            .unwrap_or_else(|| default_queue_root(&home_dir));
        let inbox_root = config
            .core
            .inbox_root
            .clone()
            .unwrap_or_else(|| default_inbox_root(&home_dir));

        Ok(Self {
            config,
            queue_root,
            inbox_root,
        })
    }

    /// Open the persistent queue
    pub fn open_queue(&self) -> Result<Arc<PersistentQueue>> {
        let locks = Arc::new(LockManager::new(self.config.lock.clone()));
        let queue = PersistentQueue::open(&self.queue_root, self.config.queue.clone(), locks)
            .with_context(|| format!("Failed to open queue at {}", self.queue_root.display()))?;
        Ok(Arc::new(queue))
    }

    /// Router that enqueues into the persistent queue
    pub fn router(&self) -> Result<Router> {
        let router = Router::with_queue(self.config.router.clone(), self.open_queue()?)?;
        Ok(router)
    }

    /// Sender identity
    pub fn identity(&self) -> &str {
        &self.config.core.identity
    }
}

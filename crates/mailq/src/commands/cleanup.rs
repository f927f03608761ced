//! Cleanup command implementation - expire, purge and recover queue entries

use anyhow::Result;
use clap::Args;
use serde_json::json;

use crate::util::context::{GlobalArgs, QueueContext};

/// Expire and purge old entries, recover abandoned ones
#[derive(Args, Debug)]
pub struct CleanupArgs {
    /// Output as JSON
    #[arg(long)]
    json: bool,
}

/// Execute the cleanup command
pub fn execute(global: &GlobalArgs, args: CleanupArgs) -> Result<()> {
    let ctx = QueueContext::resolve(global, None)?;
    let queue = ctx.open_queue()?;

    let removed = queue.cleanup_expired_entries()?;
    let recovered = queue.retry_failed_messages()?;

    if args.json {
        let output = json!({
            "expired_or_purged": removed,
            "recovered": recovered,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("Cleanup complete: {removed} expired or purged, {recovered} recovered");
    }

    Ok(())
}

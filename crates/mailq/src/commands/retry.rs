//! Retry command implementation

use anyhow::Result;
use clap::Args;

use crate::util::context::{GlobalArgs, QueueContext};

/// Requeue a failed entry with a fresh attempt budget
#[derive(Args, Debug)]
pub struct RetryArgs {
    /// Queue id of the failed entry (see `mailq status`)
    queue_id: String,
}

/// Execute the retry command
pub fn execute(global: &GlobalArgs, args: RetryArgs) -> Result<()> {
    let ctx = QueueContext::resolve(global, None)?;
    let queue = ctx.open_queue()?;

    if !queue.requeue_failed(&args.queue_id)? {
        anyhow::bail!("No failed entry with queue id '{}'", args.queue_id);
    }

    println!("Requeued {}", args.queue_id);
    Ok(())
}

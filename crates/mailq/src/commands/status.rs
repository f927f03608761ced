//! Status command implementation

use anyhow::Result;
use clap::Args;
use serde_json::json;

use crate::util::context::{GlobalArgs, QueueContext};

/// Show queue counts and recent failures
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Output as JSON
    #[arg(long)]
    json: bool,
}

/// Execute the status command
pub fn execute(global: &GlobalArgs, args: StatusArgs) -> Result<()> {
    let ctx = QueueContext::resolve(global, None)?;
    let queue = ctx.open_queue()?;
    let stats = queue.get_queue_stats()?;

    if args.json {
        let output = json!({
            "queue": ctx.queue_root,
            "stats": stats,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("Queue: {}", ctx.queue_root.display());
    println!("  pending:    {}", stats.pending);
    println!("  processing: {}", stats.processing);
    println!("  delivered:  {}", stats.delivered);
    println!("  failed:     {} ({} expired)", stats.failed, stats.expired);

    if !stats.pending_by_priority.is_empty() {
        let levels: Vec<String> = stats
            .pending_by_priority
            .iter()
            .rev()
            .map(|(level, count)| format!("{level}={count}"))
            .collect();
        println!("Pending by priority: {}", levels.join(", "));
    }

    if let Some(age) = stats.oldest_pending_age_secs {
        println!("Oldest pending: {}", format_age(age));
    }

    if !stats.recent_errors.is_empty() {
        println!("\nFailed messages:");
        for failed in &stats.recent_errors {
            println!(
                "  {} to {} after {} attempt(s): {}",
                failed.queue_id,
                failed.recipient,
                failed.attempts,
                failed.last_error.as_deref().unwrap_or("unknown error")
            );
        }
    }

    Ok(())
}

fn format_age(secs: f64) -> String {
    let secs = secs as u64;
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m", secs / 60)
    } else if secs < 86400 {
        format!("{}h", secs / 3600)
    } else {
        format!("{}d", secs / 86400)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_age() {
        assert_eq!(format_age(4.7), "4s");
        assert_eq!(format_age(125.0), "2m");
        assert_eq!(format_age(7_300.0), "2h");
        assert_eq!(format_age(200_000.0), "2d");
    }
}

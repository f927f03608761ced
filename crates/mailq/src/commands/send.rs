//! Send command implementation

use anyhow::Result;
use clap::Args;
use mailq_core::{MessageType, Priority};
use serde_json::json;
use std::time::Duration;

use crate::util::context::{GlobalArgs, QueueContext};

/// Queue a message for one agent
#[derive(Args, Debug)]
pub struct SendArgs {
    /// Target agent (`*` resolves against `router.agents` for broadcast and round-robin types)
    to: String,

    /// Message text
    message: String,

    /// Override sender identity (default: MAILQ_IDENTITY env or config identity)
    #[arg(long)]
    from: Option<String>,

    /// Message type
    #[arg(long = "type", default_value = "direct")]
    message_type: MessageType,

    /// Priority level (default: the routing rule's priority for the type)
    #[arg(long)]
    priority: Option<Priority>,

    /// Discard the message if it is not delivered within this many seconds
    #[arg(long, value_name = "SECS")]
    expires_in: Option<u64>,

    /// Output as JSON
    #[arg(long)]
    json: bool,
}

/// Execute the send command
pub fn execute(global: &GlobalArgs, args: SendArgs) -> Result<()> {
    let ctx = QueueContext::resolve(global, args.from.clone())?;
    let router = ctx.router()?;

    if args.message.trim().is_empty() {
        anyhow::bail!("Message text must not be empty");
    }

    let message_id = router.send_message(
        ctx.identity(),
        &args.to,
        args.message_type,
        &args.message,
        args.priority,
        args.expires_in.map(Duration::from_secs),
    )?;
    let priority = args
        .priority
        .unwrap_or_else(|| router.rule(args.message_type).priority);
    let to = router
        .get_message_record(&message_id)
        .map(|record| record.recipient)
        .unwrap_or(args.to);

    if args.json {
        let output = json!({
            "message_id": message_id,
            "from": ctx.identity(),
            "to": to,
            "type": args.message_type,
            "priority": priority,
            "queue": ctx.queue_root,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!(
            "Queued {} message {} for {} ({} priority)",
            args.message_type, message_id, to, priority
        );
    }

    Ok(())
}

//! Broadcast command implementation

use anyhow::Result;
use clap::Args;
use mailq_core::{MessageType, Priority};
use serde_json::json;

use crate::util::context::{GlobalArgs, QueueContext};

/// Queue one copy of a message for each listed agent
#[derive(Args, Debug)]
pub struct BroadcastArgs {
    /// Message text
    message: String,

    /// Recipients, comma separated (the sender is skipped)
    #[arg(long, value_delimiter = ',', required = true)]
    to: Vec<String>,

    /// Override sender identity (default: MAILQ_IDENTITY env or config identity)
    #[arg(long)]
    from: Option<String>,

    /// Message type
    #[arg(long = "type", default_value = "broadcast")]
    message_type: MessageType,

    /// Priority level (default: the routing rule's priority for the type)
    #[arg(long)]
    priority: Option<Priority>,

    /// Output as JSON
    #[arg(long)]
    json: bool,
}

/// Execute the broadcast command
pub fn execute(global: &GlobalArgs, args: BroadcastArgs) -> Result<()> {
    let ctx = QueueContext::resolve(global, args.from.clone())?;
    let router = ctx.router()?;

    let message_ids = router.broadcast_message(
        ctx.identity(),
        args.message_type,
        &args.message,
        args.priority,
        Some(args.to.as_slice()),
    )?;

    let sent: Vec<(String, String)> = message_ids
        .into_iter()
        .map(|id| {
            let to = router
                .get_message_record(&id)
                .map(|r| r.recipient)
                .unwrap_or_default();
            (to, id)
        })
        .collect();

    if args.json {
        let output = json!({
            "from": ctx.identity(),
            "type": args.message_type,
            "messages": sent
                .iter()
                .map(|(to, id)| json!({ "to": to, "message_id": id }))
                .collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!(
            "Queued {} message for {} recipient(s):",
            args.message_type,
            sent.len()
        );
        for (to, id) in &sent {
            println!("  {to}: {id}");
        }
    }

    Ok(())
}

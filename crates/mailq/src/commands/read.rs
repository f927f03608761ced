//! Read command implementation

use anyhow::Result;
use clap::Args;
use mailq_core::delivery::read_inbox;
use serde_json::json;

use crate::util::context::{GlobalArgs, QueueContext};

/// List messages delivered to an agent's inbox
#[derive(Args, Debug)]
pub struct ReadArgs {
    /// Agent whose inbox to read
    agent: String,

    /// Show only the most recent N messages
    #[arg(long)]
    limit: Option<usize>,

    /// Output as JSON
    #[arg(long)]
    json: bool,
}

/// Execute the read command
pub fn execute(global: &GlobalArgs, args: ReadArgs) -> Result<()> {
    let ctx = QueueContext::resolve(global, None)?;
    let mut items = read_inbox(&ctx.inbox_root, &args.agent)?;

    if let Some(limit) = args.limit
        && items.len() > limit
    {
        items.drain(..items.len() - limit);
    }

    if args.json {
        let output = json!({
            "agent": args.agent,
            "count": items.len(),
            "messages": items.iter().map(|item| json!({
                "message_id": item.message_id,
                "from": item.from,
                "priority": item.priority,
                "type": item.message_type,
                "timestamp": item.timestamp,
                "content": item.content,
            })).collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else if items.is_empty() {
        println!("No messages found for {}", args.agent);
    } else {
        println!("Messages for {}:\n", args.agent);
        for item in &items {
            println!(
                "From: {} | {} | {} | {}",
                item.from,
                item.priority,
                item.message_type,
                item.timestamp.format("%Y-%m-%d %H:%M:%S UTC")
            );
            println!("{}\n", item.content);
        }
        println!("Total: {} message(s)", items.len());
    }

    Ok(())
}

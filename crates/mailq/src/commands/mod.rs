//! CLI command dispatch and execution

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::util::context::GlobalArgs;

mod broadcast;
mod cleanup;
mod read;
mod retry;
mod run;
mod send;
mod status;

/// mailq - durable priority messaging between agents
#[derive(Parser, Debug)]
#[command(
    name = "mailq",
    version,
    about = "Durable priority messaging between agents sharing a filesystem",
    long_about = "Queue messages for other agents, drain the queue into per-agent inboxes, and inspect delivery state"
)]
pub struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Queue a message for one agent
    Send(send::SendArgs),

    /// Queue one copy of a message for each listed agent
    Broadcast(broadcast::BroadcastArgs),

    /// Show queue counts and recent failures
    Status(status::StatusArgs),

    /// Deliver queued messages into inboxes
    Run(run::RunArgs),

    /// Expire and purge old entries, recover abandoned ones
    Cleanup(cleanup::CleanupArgs),

    /// List messages delivered to an agent's inbox
    Read(read::ReadArgs),

    /// Requeue a failed entry with a fresh attempt budget
    Retry(retry::RetryArgs),
}

impl Cli {
    /// Execute the CLI command
    pub fn execute(self) -> Result<()> {
        let global = self.global;
        match self.command {
            Commands::Send(args) => send::execute(&global, args),
            Commands::Broadcast(args) => broadcast::execute(&global, args),
            Commands::Status(args) => status::execute(&global, args),
            Commands::Run(args) => run::execute(&global, args),
            Commands::Cleanup(args) => cleanup::execute(&global, args),
            Commands::Read(args) => read::execute(&global, args),
            Commands::Retry(args) => retry::execute(&global, args),
        }
    }
}

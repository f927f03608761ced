//! mailq - durable priority messaging between agents sharing a filesystem
//!
//! A thin CLI over the mailq queue directory, providing send, broadcast,
//! status, run, cleanup, read and retry commands.

use clap::Parser;

mod commands;
mod util;

use commands::Cli;

fn main() {
    mailq_core::logging::init();

    let cli = Cli::parse();

    if let Err(e) = cli.execute() {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

//! Run command implementation - drain the queue into inboxes

use anyhow::{Context, Result};
use clap::Args;
use mailq_core::QueueProcessor;
use mailq_core::delivery::InboxDelivery;
use std::sync::Arc;
use tracing::info;

use crate::util::context::{GlobalArgs, QueueContext};

/// Deliver queued messages into inboxes
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Process a single batch and exit
    #[arg(long)]
    once: bool,
}

/// Execute the run command
pub fn execute(global: &GlobalArgs, args: RunArgs) -> Result<()> {
    let ctx = QueueContext::resolve(global, None)?;
    let queue = ctx.open_queue()?;
    let processor = QueueProcessor::new(
        queue,
        Arc::new(InboxDelivery::new(&ctx.inbox_root)),
        ctx.config.queue.clone(),
    );

    if args.once {
        let processed = processor.process_batch()?;
        println!("Processed {processed} message(s)");
        return Ok(());
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    runtime.block_on(async {
        println!(
            "Delivering from {} into {} (Ctrl+C to stop)",
            ctx.queue_root.display(),
            ctx.inbox_root.display()
        );
        let handle = processor.start_processing();

        wait_for_shutdown().await;

        processor.stop_processing();
        handle.await.context("Queue processor task failed")?;
        Ok::<(), anyhow::Error>(())
    })
}

async fn wait_for_shutdown() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT (Ctrl+C)"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(_) => {
                let _ = ctrl_c.await;
                info!("Received SIGINT (Ctrl+C)");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        info!("Received Ctrl+C");
    }
}

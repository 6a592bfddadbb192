// CLI batch command: run a command template over many items

use std::time::Duration;

use anyhow::Context;

use super::run::command_from_args;
use super::BatchArgs;
use crate::batch::BatchExecutor;
use crate::models::{BatchItem, RunnerConfig};
use crate::process::cancel_pair;

/// pjobs batch
pub async fn cmd_batch(config: RunnerConfig, args: &BatchArgs) -> anyhow::Result<i32> {
    let template = command_from_args(&args.command, args.cwd.as_deref(), &[])?;
    let items: Vec<BatchItem> = args
        .items
        .iter()
        .map(|item| BatchItem::from_template(item.as_str(), &template))
        .collect();

    let workers = args.workers.unwrap_or(config.batch_concurrency);
    let timeout = match args.timeout {
        Some(0) => None,
        Some(secs) => Some(Duration::from_secs(secs)),
        None => config.batch_item_timeout(),
    };

    let executor = BatchExecutor::new(&config);
    let (cancel, signal) = cancel_pair();
    let run = executor.run_until_cancelled(items, workers, timeout, signal);
    tokio::pin!(run);

    let mut interrupted = false;
    let report = tokio::select! {
        report = &mut run => report,
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl+C")?;
            eprintln!("Interrupted; cancelling batch...");
            cancel.cancel();
            interrupted = true;
            // Wait for every in-flight item to be terminated and reaped.
            run.await
        }
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", report.render_text());
    }

    if let Some(ref path) = args.report {
        report
            .write_text(path)
            .with_context(|| format!("Failed to write report to {}", path.display()))?;
        eprintln!("Report written to {}", path.display());
    }

    Ok(if interrupted {
        130
    } else if args.fail_on_error && report.failed > 0 {
        1
    } else {
        0
    })
}

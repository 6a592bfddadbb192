pub mod batch;
pub mod run;

use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::models::{load_config, RunnerConfig};

/// Pipeline Jobs - run external pipeline commands as tracked jobs or batches
#[derive(Parser, Debug)]
#[command(
    name = "pjobs",
    version,
    about = "Pipeline Jobs - run external pipeline commands as tracked jobs or batches"
)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one command as a tracked job and stream its output
    Run(RunArgs),

    /// Run a command template once per item with bounded concurrency
    Batch(BatchArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Job name (default: program name plus a short id)
    #[arg(short = 'n', long)]
    pub name: Option<String>,

    /// Timeout in seconds (0 = no limit, default from config)
    #[arg(short = 't', long)]
    pub timeout: Option<u64>,

    /// Working directory for the command
    #[arg(long = "cwd")]
    pub cwd: Option<PathBuf>,

    /// Environment variables (KEY=VALUE)
    #[arg(short = 'e', long = "env", value_name = "KEY=VALUE")]
    pub env: Vec<String>,

    /// JSON result file the command writes on success
    #[arg(long = "result-file")]
    pub result_file: Option<PathBuf>,

    /// Print only the last N output lines once finished instead of streaming (0 = all)
    #[arg(long)]
    pub tail: Option<usize>,

    /// Output the final job record as JSON
    #[arg(long)]
    pub json: bool,

    /// Program and arguments, after `--`
    #[arg(last = true, required = true, value_name = "PROGRAM")]
    pub command: Vec<String>,
}

#[derive(Args, Debug)]
pub struct BatchArgs {
    /// Item to process; repeat for each item
    #[arg(short = 'i', long = "item", required = true, value_name = "ITEM")]
    pub items: Vec<String>,

    /// Items to run at once (default from config)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Per-item timeout in seconds (0 = no limit, default from config)
    #[arg(short = 't', long)]
    pub timeout: Option<u64>,

    /// Working directory for every item
    #[arg(long = "cwd")]
    pub cwd: Option<PathBuf>,

    /// Also write the text report to this file
    #[arg(long)]
    pub report: Option<PathBuf>,

    /// Output the report as JSON
    #[arg(long)]
    pub json: bool,

    /// Exit non-zero if any item failed
    #[arg(long = "fail-on-error")]
    pub fail_on_error: bool,

    /// Program and arguments after `--`; `{}` is replaced by the item
    #[arg(last = true, required = true, value_name = "PROGRAM")]
    pub command: Vec<String>,
}

/// Parse environment variable arguments from "KEY=VALUE" format.
pub fn parse_env_vars(env_args: &[String]) -> Result<BTreeMap<String, String>, String> {
    let mut map = BTreeMap::new();
    for arg in env_args {
        if let Some((key, value)) = arg.split_once('=') {
            if key.is_empty() {
                return Err(format!("Invalid environment variable: '{}'", arg));
            }
            map.insert(key.to_string(), value.to_string());
        } else {
            return Err(format!(
                "Invalid environment variable format: '{}'. Expected KEY=VALUE",
                arg
            ));
        }
    }
    Ok(map)
}

/// Dispatch the CLI command to the appropriate handler.
/// Returns the process exit code.
pub async fn dispatch(cli: &Cli) -> anyhow::Result<i32> {
    match &cli.command {
        Some(Commands::Run(args)) => {
            let config = resolve_config(cli)?;
            run::cmd_run(config, args).await
        }
        Some(Commands::Batch(args)) => {
            let config = resolve_config(cli)?;
            batch::cmd_batch(config, args).await
        }
        None => {
            // No subcommand provided -- print help
            use clap::CommandFactory;
            Cli::command().print_help()?;
            println!();
            Ok(0)
        }
    }
}

fn resolve_config(cli: &Cli) -> anyhow::Result<RunnerConfig> {
    load_config(cli.config.as_deref())
}

use clap::Parser;
use tracing_subscriber::EnvFilter;

use pipeline_jobs::cli::{self, Cli};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Set up tracing based on verbose flag, falling back to RUST_LOG
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli::dispatch(&cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

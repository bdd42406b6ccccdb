use cf_inventory::cli::{run, Cli};
use clap::Parser;
use tracing::Level;

#[tokio::main]
async fn main() {
    // Load environment
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let level = if cli.trace {
        Level::TRACE
    } else if cli.debug {
        Level::DEBUG
    } else {
        Level::INFO
    };
    // stdout carries the status table; logs go to stderr.
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
    tracing::info!("CLI application startup: tracing initialised, environment loaded");

    let code = match run(cli).await {
        Ok(code) => {
            tracing::info!(exit_code = code, "CLI completed");
            code
        }
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "CLI exited with error");
            eprintln!("error: {e:#}");
            1
        }
    };
    std::process::exit(code);
}

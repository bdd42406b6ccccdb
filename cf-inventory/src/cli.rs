/// Command line surface of cf-inventory.
///
/// Argument parsing and wiring only: every subcommand resolves its settings,
/// builds the concrete clients and calls into [`cf_inventory_core`].
///
/// ## Subcommands
/// - `fleet`: launch the collector on every configured environment over ssh,
///   watch the jobs and pull their outputs back.
/// - `collect`: run the Cloud Foundry inventory collector against one foundation.
/// - `opsman`: collect product and stemcell data from an Ops Manager.
///
/// [`run`] returns the process exit code so integration tests can drive it
/// without spawning the binary.
use crate::load_config::load_config;
use anyhow::{Context, Result};
use cf_inventory_core::api::{ApiSettings, HttpApiClient};
use cf_inventory_core::config::{CollectorSettings, FleetOptions, OutputMode};
use cf_inventory_core::contract::SystemClock;
use cf_inventory_core::fleet::run_fleet;
use cf_inventory_core::inventory::collect_inventory;
use cf_inventory_core::opsman::collect_opsman;
use cf_inventory_core::remote::{SshShell, Transport};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[clap(
    name = "cf-inventory",
    version,
    about = "Collect Cloud Foundry and Ops Manager inventory, locally or across a fleet of jump hosts"
)]
pub struct Cli {
    /// Log at debug level
    #[clap(long, global = true)]
    pub debug: bool,
    /// Log at trace level (overrides --debug)
    #[clap(long, global = true)]
    pub trace: bool,
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the collector on every environment of a fleet config
    Fleet(FleetArgs),
    /// Collect the inventory of one Cloud Foundry foundation into CSV files
    Collect(CollectArgs),
    /// Collect products and stemcells from an Ops Manager
    Opsman(OpsmanArgs),
}

#[derive(Args, Debug)]
pub struct FleetArgs {
    /// Path to the YAML fleet config
    #[clap(long)]
    pub config: PathBuf,
    /// Run tag naming the remote workspace (`_run_<tag>`); defaults to a timestamp
    #[clap(long)]
    pub tag: Option<String>,
    /// Environments launched per batch
    #[clap(long)]
    pub batch_size: Option<usize>,
    /// Status checks right after each batch is launched
    #[clap(long)]
    pub quick_checks: Option<u32>,
    /// Seconds between quick checks
    #[clap(long)]
    pub quick_delay: Option<u64>,
    /// Seconds between poll rounds
    #[clap(long)]
    pub poll_interval: Option<u64>,
    /// Overall watch deadline in seconds
    #[clap(long)]
    pub timeout: Option<u64>,
    /// Reattach to the jobs of an earlier run instead of launching
    #[clap(long, requires = "tag")]
    pub resume: bool,
    /// Leave remote workspaces in place
    #[clap(long)]
    pub keep_remote: bool,
    /// Limit in seconds for each remote call
    #[clap(long)]
    pub call_timeout: Option<u64>,
    /// Limit in seconds for each upload or download
    #[clap(long)]
    pub transfer_timeout: Option<u64>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum ModeArg {
    Single,
    Multi,
}

impl From<ModeArg> for OutputMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Single => OutputMode::Single,
            ModeArg::Multi => OutputMode::Multi,
        }
    }
}

#[derive(Args, Debug)]
pub struct CollectArgs {
    /// Directory receiving the CSV files (overrides OUTPUT_DIR)
    #[clap(long)]
    pub output_dir: Option<PathBuf>,
    /// Output layout (overrides OUTPUT_MODE)
    #[clap(long, value_enum)]
    pub mode: Option<ModeArg>,
    /// Concurrent per-app API calls (overrides WORKERS)
    #[clap(long)]
    pub workers: Option<usize>,
    /// Foundation label stamped on every row (overrides FOUNDATION)
    #[clap(long)]
    pub foundation: Option<String>,
}

#[derive(Args, Debug)]
pub struct OpsmanArgs {
    #[clap(long, default_value = "./inventory")]
    pub output_dir: PathBuf,
    /// Foundation label; defaults to FOUNDATION or "default"
    #[clap(long)]
    pub foundation: Option<String>,
}

impl FleetArgs {
    fn options(&self) -> FleetOptions {
        let tag = self
            .tag
            .clone()
            .unwrap_or_else(|| chrono::Local::now().format("%Y%m%d-%H%M%S").to_string());
        let mut options = FleetOptions::new(tag);
        if let Some(n) = self.batch_size {
            options.batch_size = n.max(1);
        }
        if let Some(n) = self.quick_checks {
            options.quick_checks = n;
        }
        if let Some(s) = self.quick_delay {
            options.quick_delay = Duration::from_secs(s);
        }
        if let Some(s) = self.poll_interval {
            options.poll_interval = Duration::from_secs(s);
        }
        if let Some(s) = self.timeout {
            options.watch_timeout = Duration::from_secs(s);
        }
        if let Some(s) = self.call_timeout {
            options.call_timeout = Duration::from_secs(s.max(1));
        }
        if let Some(s) = self.transfer_timeout {
            options.transfer_timeout = Duration::from_secs(s.max(1));
        }
        options.resume = self.resume;
        options.keep_remote = self.keep_remote;
        options
    }
}

impl CollectArgs {
    fn settings(&self) -> CollectorSettings {
        let mut settings = CollectorSettings::from_env();
        if let Some(dir) = &self.output_dir {
            settings.output_dir = dir.clone();
        }
        if let Some(mode) = self.mode {
            settings.mode = mode.into();
        }
        if let Some(n) = self.workers {
            settings.workers = n.max(1);
        }
        if let Some(f) = &self.foundation {
            settings.foundation = f.clone();
        }
        settings
    }
}

async fn run_fleet_command(args: FleetArgs) -> Result<i32> {
    let config = load_config(&args.config)?;
    let options = args.options();
    tracing::info!(
        command = "fleet",
        run_tag = %options.run_tag,
        resume = options.resume,
        "Starting fleet run"
    );

    let shell = Transport::new(SshShell {
        transfer_timeout: options.transfer_timeout,
        ..SshShell::default()
    });
    let report = run_fleet(&shell, &SystemClock, &config, &options).await;

    println!("{}", report.render_table());

    fs::create_dir_all(&config.output_dir)
        .with_context(|| format!("creating output directory {:?}", config.output_dir))?;
    let summary_path = config
        .output_dir
        .join(format!("fleet-{}.json", report.run_tag));
    let summary = serde_json::to_string_pretty(&report).context("serialising fleet summary")?;
    fs::write(&summary_path, summary)
        .with_context(|| format!("writing fleet summary {summary_path:?}"))?;
    tracing::info!(summary = %summary_path.display(), "Wrote fleet summary");

    let resumable = report.resumable();
    if resumable > 0 {
        println!(
            "{resumable} job(s) still running or unreachable; rerun with --resume --tag {} to pick them up",
            report.run_tag
        );
    }
    Ok(report.exit_code())
}

async fn run_collect_command(args: CollectArgs) -> Result<i32> {
    let settings = args.settings();
    settings.trace_loaded();
    let api = ApiSettings::cf_from_env().context("reading Cloud Foundry API settings")?;
    let client = HttpApiClient::connect(&api)
        .await
        .context("connecting to the Cloud Foundry API")?;

    let report = collect_inventory(&client, &settings)
        .await
        .context("inventory collection failed")?;
    tracing::info!(command = "collect", ?report, "Inventory collection complete");
    for (file, rows) in &report.files {
        println!("{file}: {rows} rows");
    }
    Ok(0)
}

async fn run_opsman_command(args: OpsmanArgs) -> Result<i32> {
    let foundation = args
        .foundation
        .unwrap_or_else(|| CollectorSettings::from_env().foundation);
    let api = ApiSettings::opsman_from_env().context("reading Ops Manager settings")?;
    let client = HttpApiClient::connect(&api)
        .await
        .context("connecting to Ops Manager")?;

    let report = collect_opsman(&client, &foundation, &args.output_dir)
        .await
        .context("Ops Manager collection failed")?;
    tracing::info!(command = "opsman", ?report, "Ops Manager collection complete");
    for (file, rows) in &report.files {
        println!("{file}: {rows} rows");
    }
    Ok(0)
}

/// Runs one CLI invocation and returns the process exit code.
pub async fn run(cli: Cli) -> Result<i32> {
    tracing::info!("trace_initialised");
    match cli.command {
        Commands::Fleet(args) => run_fleet_command(args).await,
        Commands::Collect(args) => run_collect_command(args).await,
        Commands::Opsman(args) => run_opsman_command(args).await,
    }
}

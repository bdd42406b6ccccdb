//! Configuration types shared by the collector and the fleet orchestrator.
//!
//! Fleet configuration is deserialized from YAML by the CLI crate; collector
//! settings come from environment variables (see [`CollectorSettings::from_env`])
//! and may be overridden by command line flags.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Everything the orchestrator needs to know about the fleet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Local directory receiving `<environment>/<platform>/` outputs.
    pub output_dir: PathBuf,
    pub artifacts: ArtifactConfig,
    #[serde(default)]
    pub environments: Vec<EnvironmentConfig>,
}

impl FleetConfig {
    pub fn trace_loaded(&self) {
        info!(
            output_dir = %self.output_dir.display(),
            environments = self.environments.len(),
            jobs = self.job_count(),
            "Loaded fleet config"
        );
        for env in &self.environments {
            env.trace_loaded();
        }
        debug!(?self, "Fleet config loaded (full debug)");
    }

    pub fn job_count(&self) -> usize {
        self.environments.iter().map(|e| e.platforms.len()).sum()
    }
}

/// Files uploaded into every environment's workspace before launching jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactConfig {
    /// CLI binary the driver script calls.
    pub binary: PathBuf,
    /// Driver script run as the job body by default.
    pub driver: PathBuf,
    /// Arguments for the smoke invocation of the binary after upload.
    #[serde(default = "default_verify_args")]
    pub verify_args: Vec<String>,
}

fn default_verify_args() -> Vec<String> {
    vec!["--version".to_string()]
}

/// How commands reach an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Ssh,
    /// Run through the local shell; the host fields are ignored.
    Local,
}

/// SSH authentication method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AuthMethod {
    /// Whatever the local ssh agent/config offers.
    #[default]
    Agent,
    Key { path: PathBuf },
    /// Password read from the named environment variable and fed to `sshpass -e`.
    Password { env: String },
}

/// A named remote host plus the platforms it runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    pub name: String,
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub auth: AuthMethod,
    #[serde(default)]
    pub transport: TransportKind,
    /// Preferred base directory for the run workspace.
    #[serde(default)]
    pub workdir: Option<String>,
    #[serde(default)]
    pub platforms: Vec<PlatformConfig>,
}

fn default_port() -> u16 {
    22
}

impl EnvironmentConfig {
    pub fn trace_loaded(&self) {
        info!(
            environment = %self.name,
            host = %self.host,
            port = self.port,
            transport = ?self.transport,
            platforms = self.platforms.len(),
            "Loaded environment"
        );
    }

    pub fn target(&self) -> RemoteTarget {
        RemoteTarget {
            environment: self.name.clone(),
            host: self.host.clone(),
            port: self.port,
            user: self.user.clone(),
            auth: self.auth.clone(),
            transport: self.transport,
        }
    }
}

/// One job target inside an environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    pub name: String,
    /// API endpoint handed to the job as `CF_API`.
    #[serde(default)]
    pub api: Option<String>,
    /// Job body; defaults to running the uploaded driver script.
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Local file uploaded next to the artifacts and sourced before the job starts.
    #[serde(default)]
    pub env_file: Option<PathBuf>,
}

/// Connection details for one environment, as seen by a [`crate::contract::RemoteShell`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTarget {
    pub environment: String,
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub auth: AuthMethod,
    pub transport: TransportKind,
}

impl RemoteTarget {
    /// `user@host` or just `host`.
    pub fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{user}@{}", self.host),
            None => self.host.clone(),
        }
    }
}

/// Knobs of one orchestrator run.
#[derive(Debug, Clone)]
pub struct FleetOptions {
    pub run_tag: String,
    /// Number of environments touched per launch iteration.
    pub batch_size: usize,
    pub quick_checks: u32,
    pub quick_delay: Duration,
    pub poll_interval: Duration,
    /// Overall deadline for the watch phase.
    pub watch_timeout: Duration,
    /// Hard limit for each remote call.
    pub call_timeout: Duration,
    /// Hard limit for one upload or download.
    pub transfer_timeout: Duration,
    /// Probe timeouts in a row after which a job is given up as `Timeout`.
    pub max_probe_timeouts: u32,
    pub resume: bool,
    pub keep_remote: bool,
}

impl FleetOptions {
    pub fn new(run_tag: impl Into<String>) -> Self {
        Self {
            run_tag: run_tag.into(),
            batch_size: 5,
            quick_checks: 2,
            quick_delay: Duration::from_secs(3),
            poll_interval: Duration::from_secs(30),
            watch_timeout: Duration::from_secs(4 * 60 * 60),
            call_timeout: Duration::from_secs(60),
            transfer_timeout: Duration::from_secs(600),
            max_probe_timeouts: 3,
            resume: false,
            keep_remote: false,
        }
    }
}

/// How collected CSV output is laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// One `inventory.csv` with a row per app and joined service/developer columns.
    Single,
    /// One CSV per table (apps, services, bindings, developers, ...).
    Multi,
}

impl From<&str> for OutputMode {
    fn from(s: &str) -> Self {
        match s {
            "single" | "single-file" | "file" => OutputMode::Single,
            "multi" | "multi-table" | "dir" | "directory" => OutputMode::Multi,
            other => {
                warn!(mode = other, "Unknown output mode, defaulting to multi");
                OutputMode::Multi
            }
        }
    }
}

/// Longest audit-event window accepted from the environment (about a century).
pub const MAX_AUDIT_SINCE_DAYS: i64 = 36_500;

/// Settings of one collector run.
#[derive(Debug, Clone)]
pub struct CollectorSettings {
    /// Label stamped on every row.
    pub foundation: String,
    pub output_dir: PathBuf,
    pub mode: OutputMode,
    /// Bound on concurrent per-app API calls.
    pub workers: usize,
    pub audit_events: bool,
    /// Empty means every event type.
    pub audit_event_types: Vec<String>,
    pub audit_since_days: i64,
    pub redact_credentials: bool,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            foundation: "default".to_string(),
            output_dir: PathBuf::from("./inventory"),
            mode: OutputMode::Multi,
            workers: 8,
            audit_events: true,
            audit_event_types: Vec::new(),
            audit_since_days: 30,
            redact_credentials: true,
        }
    }
}

impl CollectorSettings {
    /// Reads `FOUNDATION`, `OUTPUT_DIR`, `OUTPUT_MODE`, `WORKERS`, `AUDIT_EVENTS`,
    /// `AUDIT_EVENT_TYPES`, `AUDIT_SINCE_DAYS` and `REDACT_CREDENTIALS`.
    /// Unset or unparsable variables keep their defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::default();
        if let Some(v) = lookup("FOUNDATION").filter(|v| !v.is_empty()) {
            settings.foundation = v;
        }
        if let Some(v) = lookup("OUTPUT_DIR").filter(|v| !v.is_empty()) {
            settings.output_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("OUTPUT_MODE") {
            settings.mode = OutputMode::from(v.trim().to_ascii_lowercase().as_str());
        }
        if let Some(v) = lookup("WORKERS") {
            match v.trim().parse::<usize>() {
                Ok(n) if n > 0 => settings.workers = n,
                _ => warn!(value = %v, "WORKERS must be a positive integer, keeping default"),
            }
        }
        if let Some(v) = lookup("AUDIT_EVENTS") {
            settings.audit_events = parse_flag(&v, settings.audit_events);
        }
        if let Some(v) = lookup("AUDIT_EVENT_TYPES") {
            settings.audit_event_types = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(v) = lookup("AUDIT_SINCE_DAYS") {
            match v.trim().parse::<i64>() {
                Ok(n) if n > MAX_AUDIT_SINCE_DAYS => {
                    warn!(value = n, max = MAX_AUDIT_SINCE_DAYS, "AUDIT_SINCE_DAYS too large, clamping");
                    settings.audit_since_days = MAX_AUDIT_SINCE_DAYS;
                }
                Ok(n) if n >= 0 => settings.audit_since_days = n,
                _ => warn!(value = %v, "AUDIT_SINCE_DAYS must be a non-negative integer"),
            }
        }
        if let Some(v) = lookup("REDACT_CREDENTIALS") {
            settings.redact_credentials = parse_flag(&v, settings.redact_credentials);
        }
        settings
    }

    pub fn trace_loaded(&self) {
        info!(
            foundation = %self.foundation,
            output_dir = %self.output_dir.display(),
            mode = ?self.mode,
            workers = self.workers,
            audit_events = self.audit_events,
            redact_credentials = self.redact_credentials,
            "Loaded collector settings"
        );
    }
}

pub(crate) fn parse_flag(raw: &str, default: bool) -> bool {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        other => {
            warn!(value = other, "Unrecognised boolean, keeping default");
            default
        }
    }
}

//! Fleet orchestration: launch → watch → collect → clean up.
//!
//! Runs one job per (environment, platform) pair on remote hosts:
//!   - Launch phase, batched by environment: resolve the run workspace, upload
//!     and verify artifacts, start each job as a detached process, then a few
//!     quick probe rounds to surface immediate failures.
//!   - Watch phase: probe every unfinished job each round, download outputs of
//!     jobs that finish, sleep, repeat until all jobs are terminal or the
//!     deadline passes.
//!   - Cleanup: remove workspaces whose jobs are all terminal, unless kept.
//!
//! # Error Handling
//! Nothing here aborts the run. Setup errors mark the environment's jobs
//! `LaunchFailed`; probe failures count toward `Timeout`. The outcome is the
//! [`FleetReport`].
//!
//! # Resume
//! With `resume` set, nothing is launched: workspaces are looked up by run tag
//! and job state is rebuilt from the marker files on the first probe round.

pub mod collect;
pub mod job;
pub mod launch;
pub mod poll;
pub mod workspace;

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{error, info, info_span, warn, Instrument};

use crate::config::{EnvironmentConfig, FleetConfig, FleetOptions};
use crate::contract::{Clock, RemoteShell};
use crate::remote::transfer::remote_file_name;
use collect::{cleanup_workspace, collect_outputs};
pub use job::{Job, JobState, Probe};
use launch::{launch_job, prepare_environment};
use poll::probe_job;
use workspace::find_existing;

/// Final state of one job.
#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub environment: String,
    pub platform: String,
    #[serde(flatten)]
    pub state: JobState,
    pub done: bool,
    pub workspace: Option<String>,
    pub outputs: Option<PathBuf>,
}

impl JobSummary {
    pub fn succeeded(&self) -> bool {
        self.done && self.state == JobState::Finished { exit_code: 0 }
    }

    /// Human-readable status; unfinished jobs read "still running".
    pub fn status(&self) -> String {
        if !self.done {
            return "still running".to_string();
        }
        match &self.state {
            JobState::Finished { exit_code } => format!("finished (exit {exit_code})"),
            JobState::LaunchFailed { reason } => {
                format!("launch failed: {}", reason.lines().next().unwrap_or(""))
            }
            other => other.label().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FleetReport {
    pub run_tag: String,
    pub jobs: Vec<JobSummary>,
}

impl FleetReport {
    /// 0 when every job finished with exit code 0, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.jobs.iter().all(JobSummary::succeeded) {
            0
        } else {
            1
        }
    }

    pub fn still_running(&self) -> usize {
        self.jobs.iter().filter(|j| !j.done).count()
    }

    /// Jobs a later `--resume` may still pick up: unfinished or given up after probe timeouts.
    pub fn resumable(&self) -> usize {
        self.jobs
            .iter()
            .filter(|j| !j.done || j.state == JobState::Timeout)
            .count()
    }

    pub fn render_table(&self) -> String {
        let headers = ["ENVIRONMENT", "PLATFORM", "STATUS"];
        let rows: Vec<[String; 3]> = self
            .jobs
            .iter()
            .map(|j| [j.environment.clone(), j.platform.clone(), j.status()])
            .collect();
        let mut widths = headers.map(str::len);
        for row in &rows {
            for (w, cell) in widths.iter_mut().zip(row.iter()) {
                *w = (*w).max(cell.len());
            }
        }
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{:<w0$}  {:<w1$}  {}",
            headers[0],
            headers[1],
            headers[2],
            w0 = widths[0],
            w1 = widths[1]
        );
        for row in &rows {
            let _ = writeln!(
                out,
                "{:<w0$}  {:<w1$}  {}",
                row[0],
                row[1],
                row[2],
                w0 = widths[0],
                w1 = widths[1]
            );
        }
        out
    }
}

/// Build one job per (environment, platform) pair.
pub fn build_jobs(config: &FleetConfig, now: Instant) -> Vec<Job> {
    let default_command = format!("./{}", remote_file_name(&config.artifacts.driver));
    config
        .environments
        .iter()
        .flat_map(|env| {
            let default_command = default_command.clone();
            env.platforms
                .iter()
                .map(move |p| Job::new(env, p, &default_command, now))
        })
        .collect()
}

struct Orchestrator<'a, S: ?Sized, C: ?Sized> {
    shell: &'a S,
    clock: &'a C,
    config: &'a FleetConfig,
    options: &'a FleetOptions,
    jobs: Vec<Job>,
    outputs: BTreeMap<(String, String), PathBuf>,
}

impl<'a, S, C> Orchestrator<'a, S, C>
where
    S: RemoteShell + ?Sized,
    C: Clock + ?Sized,
{
    fn env_jobs(&mut self, env: &str) -> impl Iterator<Item = &mut Job> {
        let env = env.to_string();
        self.jobs.iter_mut().filter(move |j| j.environment == env)
    }

    async fn launch_phase(&mut self) {
        let batch_size = self.options.batch_size.max(1);
        let config = self.config;
        let envs: Vec<&EnvironmentConfig> = config.environments.iter().collect();
        for (index, batch) in envs.chunks(batch_size).enumerate() {
            info!(batch = index + 1, environments = batch.len(), "Launching batch");
            let mut batch_names = Vec::new();
            for env in batch {
                batch_names.push(env.name.clone());
                self.launch_environment(env).await;
            }
            for round in 0..self.options.quick_checks {
                self.clock.sleep(self.options.quick_delay).await;
                info!(batch = index + 1, round = round + 1, "Quick check");
                self.poll_round(Some(batch_names.as_slice())).await;
            }
        }
    }

    async fn launch_environment(&mut self, env: &EnvironmentConfig) {
        let now = self.clock.now();
        let workspace = match prepare_environment(
            self.shell,
            env,
            &self.config.artifacts,
            &self.options.run_tag,
            self.options.call_timeout,
            self.options.transfer_timeout,
        )
        .await
        {
            Ok(ws) => ws,
            Err(e) => {
                error!(environment = %env.name, error = %e, "Environment setup failed; its jobs are skipped");
                let reason = e.to_string();
                for job in self.env_jobs(&env.name) {
                    job.fail_launch(reason.clone(), now);
                }
                return;
            }
        };

        for platform in &env.platforms {
            let Some(idx) = self
                .jobs
                .iter()
                .position(|j| j.environment == env.name && j.platform == platform.name)
            else {
                continue;
            };
            self.jobs[idx].workspace = Some(workspace.clone());
            let result = launch_job(
                self.shell,
                &self.jobs[idx],
                platform,
                &self.options.run_tag,
                self.options.call_timeout,
            )
            .await;
            if let Err(e) = result {
                let now = self.clock.now();
                self.jobs[idx].fail_launch(e.to_string(), now);
            }
        }
    }

    async fn attach_existing(&mut self) {
        let config = self.config;
        for env in &config.environments {
            match find_existing(self.shell, env, &self.options.run_tag, self.options.call_timeout).await {
                Ok(Some(ws)) => {
                    for job in self.env_jobs(&env.name) {
                        job.workspace = Some(ws.clone());
                    }
                }
                Ok(None) => {
                    warn!(environment = %env.name, run_tag = %self.options.run_tag, "No workspace to resume; jobs are missing");
                    let now = self.clock.now();
                    for job in self.env_jobs(&env.name) {
                        job.mark_missing(now);
                    }
                }
                Err(e) => {
                    // Unknown, not missing: let the watch loop keep trying.
                    warn!(environment = %env.name, error = %e, "Could not look up workspace to resume");
                }
            }
        }
    }

    /// Probe every unfinished job (optionally only those of `only` environments).
    async fn poll_round(&mut self, only: Option<&[String]>) {
        let output_root = self.config.output_dir.clone();
        for idx in 0..self.jobs.len() {
            if self.jobs[idx].done {
                continue;
            }
            if let Some(names) = only {
                if !names.contains(&self.jobs[idx].environment) {
                    continue;
                }
            }
            if self.jobs[idx].workspace.is_none() {
                if let Some(ws) = self.lookup_workspace(idx).await {
                    self.jobs[idx].workspace = Some(ws);
                } else {
                    continue;
                }
            }
            let probe = probe_job(self.shell, &self.jobs[idx], self.options.call_timeout).await;
            let now = self.clock.now();
            let job = &mut self.jobs[idx];
            job.observe(probe, now, self.options.max_probe_timeouts);
            if let Some(local) = collect_outputs(self.shell, job, &output_root, self.options.transfer_timeout).await {
                self.outputs
                    .insert((job.environment.clone(), job.platform.clone()), local);
            }
        }
    }

    /// Retry a workspace lookup that failed during resume.
    async fn lookup_workspace(&mut self, idx: usize) -> Option<String> {
        let config = self.config;
        let env = config
            .environments
            .iter()
            .find(|e| e.name == self.jobs[idx].environment)?;
        match find_existing(self.shell, env, &self.options.run_tag, self.options.call_timeout).await {
            Ok(Some(ws)) => Some(ws),
            Ok(None) => {
                let now = self.clock.now();
                self.jobs[idx].mark_missing(now);
                None
            }
            Err(_) => {
                let now = self.clock.now();
                let max = self.options.max_probe_timeouts;
                self.jobs[idx].observe(Probe::Unknown, now, max);
                None
            }
        }
    }

    async fn watch_phase(&mut self) {
        let deadline = self.clock.now() + self.options.watch_timeout;
        loop {
            self.poll_round(None).await;
            let pending = self.jobs.iter().filter(|j| !j.done).count();
            if pending == 0 {
                info!("All jobs reached a terminal state");
                break;
            }
            if self.clock.now() >= deadline {
                warn!(
                    still_running = pending,
                    timeout_secs = self.options.watch_timeout.as_secs(),
                    "Watch timeout elapsed with jobs still running"
                );
                break;
            }
            info!(still_running = pending, "Waiting for jobs");
            self.clock.sleep(self.options.poll_interval).await;
        }
    }

    async fn cleanup_phase(&self) {
        if self.options.keep_remote {
            info!("Keeping remote workspaces");
            return;
        }
        let mut seen = Vec::new();
        for job in &self.jobs {
            let Some(ws) = job.workspace.as_deref() else { continue };
            if seen.contains(&(job.environment.as_str(), ws)) {
                continue;
            }
            seen.push((job.environment.as_str(), ws));
            let unfinished = self
                .jobs
                .iter()
                .any(|j| j.environment == job.environment && j.may_still_run());
            if unfinished {
                warn!(environment = %job.environment, workspace = ws, "Keeping workspace of unfinished or unreachable jobs for a later --resume");
                continue;
            }
            cleanup_workspace(self.shell, &job.target, ws, self.options.call_timeout).await;
        }
    }

    fn report(&self) -> FleetReport {
        FleetReport {
            run_tag: self.options.run_tag.clone(),
            jobs: self
                .jobs
                .iter()
                .map(|j| JobSummary {
                    environment: j.environment.clone(),
                    platform: j.platform.clone(),
                    state: j.state.clone(),
                    done: j.done,
                    workspace: j.workspace.clone(),
                    outputs: self
                        .outputs
                        .get(&(j.environment.clone(), j.platform.clone()))
                        .cloned(),
                })
                .collect(),
        }
    }
}

/// Run the whole fleet and report per-job outcomes.
pub async fn run_fleet<S, C>(
    shell: &S,
    clock: &C,
    config: &FleetConfig,
    options: &FleetOptions,
) -> FleetReport
where
    S: RemoteShell + ?Sized,
    C: Clock + ?Sized,
{
    let span = info_span!("fleet", run_tag = %options.run_tag, resume = options.resume);
    async move {
        let mut orch = Orchestrator {
            shell,
            clock,
            config,
            options,
            jobs: build_jobs(config, clock.now()),
            outputs: BTreeMap::new(),
        };
        info!(jobs = orch.jobs.len(), "Fleet run starting");

        if options.resume {
            orch.attach_existing().await;
        } else {
            orch.launch_phase().await;
        }
        orch.watch_phase().await;
        orch.cleanup_phase().await;

        let report = orch.report();
        info!(
            exit_code = report.exit_code(),
            still_running = report.still_running(),
            resumable = report.resumable(),
            "Fleet run complete"
        );
        report
    }
    .instrument(span)
    .await
}

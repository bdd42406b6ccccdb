//! Job data model and its state machine.
//!
//! ```text
//! Pending ──► Running ──► Finished(code)
//!    │           │
//!    │           └──────► Missing
//!    └──────────────────► Timeout        (terminal once probes keep timing out)
//! LaunchFailed                            (setup of the environment failed)
//! ```
//!
//! Terminal states freeze the job: once `done` is set no observation changes it.

use serde::Serialize;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{EnvironmentConfig, PlatformConfig, RemoteTarget};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Finished { exit_code: i32 },
    Missing,
    Timeout,
    LaunchFailed { reason: String },
}

impl JobState {
    pub fn label(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Finished { .. } => "finished",
            JobState::Missing => "missing",
            JobState::Timeout => "timeout",
            JobState::LaunchFailed { .. } => "launch-failed",
        }
    }
}

/// What one status probe saw on the remote filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe {
    Pending,
    Running { pid: u32 },
    Finished { exit_code: i32 },
    Missing,
    /// The probe itself timed out or could not reach the host.
    Unknown,
}

#[derive(Debug, Clone)]
pub struct Job {
    pub environment: String,
    pub platform: String,
    pub target: RemoteTarget,
    pub api: Option<String>,
    pub command: String,
    pub workspace: Option<String>,
    pub state: JobState,
    pub done: bool,
    pub changed_at: Instant,
    pub consecutive_timeouts: u32,
    pub seen_running: bool,
    pub outputs_collected: bool,
}

impl Job {
    pub fn new(
        env: &EnvironmentConfig,
        platform: &PlatformConfig,
        default_command: &str,
        now: Instant,
    ) -> Self {
        Self {
            environment: env.name.clone(),
            platform: platform.name.clone(),
            target: env.target(),
            api: platform.api.clone(),
            command: platform
                .command
                .clone()
                .unwrap_or_else(|| default_command.to_string()),
            workspace: None,
            state: JobState::Pending,
            done: false,
            changed_at: now,
            consecutive_timeouts: 0,
            seen_running: false,
            outputs_collected: false,
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self.state {
            JobState::Finished { exit_code } => Some(exit_code),
            _ => None,
        }
    }

    /// True while the detached process may still be alive on the host: the job
    /// is unfinished, or probes gave up on it without ever seeing it end.
    pub fn may_still_run(&self) -> bool {
        !self.done || self.state == JobState::Timeout
    }

    /// Mark the job terminal with a setup failure.
    pub fn fail_launch(&mut self, reason: impl Into<String>, now: Instant) {
        if self.done {
            return;
        }
        let reason = reason.into();
        warn!(environment = %self.environment, platform = %self.platform, %reason, "Job launch failed");
        self.set_state(JobState::LaunchFailed { reason }, now);
        self.done = true;
    }

    /// Mark the job terminal because its workspace no longer exists.
    pub fn mark_missing(&mut self, now: Instant) {
        if self.done {
            return;
        }
        self.set_state(JobState::Missing, now);
        self.done = true;
    }

    /// Fold one probe result into the job. Returns whether the state changed.
    ///
    /// `max_timeouts` consecutive [`Probe::Unknown`] results make `Timeout` terminal.
    pub fn observe(&mut self, probe: Probe, now: Instant, max_timeouts: u32) -> bool {
        if self.done {
            debug!(environment = %self.environment, platform = %self.platform, ?probe, "Ignoring probe for finished job");
            return false;
        }
        let before = self.state.clone();
        match probe {
            Probe::Missing => {
                self.set_state(JobState::Missing, now);
                self.done = true;
            }
            Probe::Finished { exit_code } => {
                self.set_state(JobState::Finished { exit_code }, now);
                self.done = true;
            }
            Probe::Running { .. } => {
                self.consecutive_timeouts = 0;
                self.seen_running = true;
                self.set_state(JobState::Running, now);
            }
            Probe::Pending => {
                self.consecutive_timeouts = 0;
                // A job seen running whose pid is gone without an exit code stays Running.
                let next = if self.seen_running {
                    JobState::Running
                } else {
                    JobState::Pending
                };
                self.set_state(next, now);
            }
            Probe::Unknown => {
                self.consecutive_timeouts += 1;
                self.set_state(JobState::Timeout, now);
                if self.consecutive_timeouts >= max_timeouts.max(1) {
                    warn!(
                        environment = %self.environment,
                        platform = %self.platform,
                        timeouts = self.consecutive_timeouts,
                        "Giving up on job after repeated probe timeouts"
                    );
                    self.done = true;
                }
            }
        }
        before != self.state
    }

    fn set_state(&mut self, next: JobState, now: Instant) {
        if self.state != next {
            info!(
                environment = %self.environment,
                platform = %self.platform,
                from = self.state.label(),
                to = next.label(),
                "Job state changed"
            );
            self.state = next;
            self.changed_at = now;
        }
    }
}

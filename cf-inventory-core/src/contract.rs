#![allow(unused)]

//! # contract: the seams between cf-inventory and the outside world
//!
//! Three traits carry every side effect the core performs:
//!
//! - [`ApiClient`] fetches JSON documents from a Cloud Foundry or Ops Manager API.
//! - [`RemoteShell`] runs shell payloads on, and copies files to and from, a remote host.
//! - [`Clock`] tells time and sleeps, so polling loops can run on virtual time.
//!
//! ## Mocking & Testing
//! - `ApiClient` and `RemoteShell` are annotated for `mockall`; the generated
//!   `MockApiClient`/`MockRemoteShell` are exported under the `test-export-mocks` feature.
//! - `LocalShell` (see [`crate::remote::local`]) is a real `RemoteShell` that runs payloads
//!   through the local `/bin/sh`, which integration tests use to exercise real scripts.

use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use mockall::{automock, predicate::*};

use crate::config::RemoteTarget;

/// Error returned by an [`ApiClient`].
#[derive(Debug)]
pub enum ApiError {
    /// The request never produced a response (DNS, TLS, connection reset...).
    Transport { url: String, detail: String },
    /// The server answered with a non-success status.
    Status { url: String, status: u16, body: String },
    /// Token acquisition failed.
    Auth(String),
    /// The configured endpoint is unusable.
    Config(String),
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiError::Transport { url, detail } => write!(f, "request to {url} failed: {detail}"),
            ApiError::Status { url, status, body } => {
                write!(f, "{url} returned HTTP {status}: {body}")
            }
            ApiError::Auth(msg) => write!(f, "authentication failed: {msg}"),
            ApiError::Config(msg) => write!(f, "invalid API configuration: {msg}"),
        }
    }
}

impl std::error::Error for ApiError {}

/// Read-only access to a JSON REST API.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait ApiClient: Send + Sync {
    /// GET a path (relative to the API root) or an absolute URL.
    ///
    /// `Ok(None)` means the server answered but the body was not JSON; callers
    /// treat that as an empty result rather than an error.
    async fn get_json(&self, path: &str) -> Result<Option<serde_json::Value>, ApiError>;
}

/// Captured result of one remote command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// Set when the hard timeout fired; the exit code is then synthetic.
    pub timed_out: bool,
}

/// Exit code reported for a call killed by its hard timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 255;
/// Prefix of the stderr line reported for a call killed by its hard timeout.
pub const TIMEOUT_MARKER: &str = "[timeout]";

impl ExecOutput {
    pub fn timeout(limit: Duration) -> Self {
        Self {
            exit_code: TIMEOUT_EXIT_CODE,
            stdout: String::new(),
            stderr: format!("{TIMEOUT_MARKER} no result after {}s", limit.as_secs_f64()),
            timed_out: true,
        }
    }

    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == 0
    }
}

/// Error returned by a [`RemoteShell`].
#[derive(Debug)]
pub enum RemoteError {
    /// The transport process (ssh, scp, sh) could not be started.
    Spawn { program: String, detail: String },
    /// The host could not be reached.
    Connect { environment: String, detail: String },
    /// The host refused our credentials.
    Auth { environment: String, detail: String },
    /// A copy to or from the host failed.
    Transfer { environment: String, detail: String },
    /// The remote command ran and exited non-zero (or timed out) where success was required.
    Failed { environment: String, output: ExecOutput },
    Io(std::io::Error),
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteError::Spawn { program, detail } => write!(f, "could not start {program}: {detail}"),
            RemoteError::Connect { environment, detail } => {
                write!(f, "cannot connect to environment '{environment}': {detail}")
            }
            RemoteError::Auth { environment, detail } => {
                write!(f, "authentication to environment '{environment}' failed: {detail}")
            }
            RemoteError::Transfer { environment, detail } => {
                write!(f, "file transfer with environment '{environment}' failed: {detail}")
            }
            RemoteError::Failed { environment, output } if output.timed_out => {
                write!(f, "remote command on '{environment}' timed out: {}", output.stderr.trim())
            }
            RemoteError::Failed { environment, output } => write!(
                f,
                "remote command on '{environment}' exited with {}: {}",
                output.exit_code,
                output.stderr.trim()
            ),
            RemoteError::Io(e) => write!(f, "local I/O error: {e}"),
        }
    }
}

impl std::error::Error for RemoteError {}

impl From<std::io::Error> for RemoteError {
    fn from(e: std::io::Error) -> Self {
        RemoteError::Io(e)
    }
}

/// Command execution and file transfer against one remote host.
///
/// Implementations receive a plain shell script; encoding it for transport is
/// their job (see [`crate::remote::payload`]).
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Run `script` non-interactively. A non-zero exit is `Ok`; only transport
    /// problems are `Err`. When `timeout` fires the result has `timed_out` set.
    async fn exec(
        &self,
        target: &RemoteTarget,
        script: &str,
        timeout: Option<Duration>,
    ) -> Result<ExecOutput, RemoteError>;

    /// Copy local files into `remote_dir` (created if needed).
    async fn upload(
        &self,
        target: &RemoteTarget,
        local_paths: &[PathBuf],
        remote_dir: &str,
    ) -> Result<(), RemoteError>;

    /// Copy whatever `remote_glob` matches into `local_dir`.
    async fn download(
        &self,
        target: &RemoteTarget,
        remote_glob: &str,
        local_dir: &Path,
    ) -> Result<(), RemoteError>;
}

/// Time source for polling loops.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    async fn sleep(&self, duration: Duration);
}

/// Wall clock backed by tokio timers.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

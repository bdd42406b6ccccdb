//! Remote command execution and file transfer.
//!
//! - [`payload`]: base64 wire encoding of scripts.
//! - [`transfer`]: staging of files before upload.
//! - [`ssh`]: `RemoteShell` over ssh/scp subprocesses.
//! - [`local`]: `RemoteShell` over the local `/bin/sh`.
//!
//! [`Transport`] picks the implementation per target.

pub mod local;
pub mod payload;
pub mod ssh;
pub mod transfer;

use async_trait::async_trait;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::{RemoteTarget, TransportKind};
use crate::contract::{ExecOutput, RemoteError, RemoteShell, TIMEOUT_MARKER};

pub use local::LocalShell;
pub use ssh::SshShell;

/// Routes each call to the ssh or local implementation based on the target.
#[derive(Debug, Default, Clone)]
pub struct Transport {
    ssh: SshShell,
    local: LocalShell,
}

impl Transport {
    pub fn new(ssh: SshShell) -> Self {
        Self {
            ssh,
            local: LocalShell,
        }
    }

    fn pick(&self, target: &RemoteTarget) -> &dyn RemoteShell {
        match target.transport {
            TransportKind::Ssh => &self.ssh,
            TransportKind::Local => &self.local,
        }
    }
}

#[async_trait]
impl RemoteShell for Transport {
    async fn exec(
        &self,
        target: &RemoteTarget,
        script: &str,
        timeout: Option<Duration>,
    ) -> Result<ExecOutput, RemoteError> {
        self.pick(target).exec(target, script, timeout).await
    }

    async fn upload(
        &self,
        target: &RemoteTarget,
        local_paths: &[PathBuf],
        remote_dir: &str,
    ) -> Result<(), RemoteError> {
        self.pick(target).upload(target, local_paths, remote_dir).await
    }

    async fn download(
        &self,
        target: &RemoteTarget,
        remote_glob: &str,
        local_dir: &Path,
    ) -> Result<(), RemoteError> {
        self.pick(target).download(target, remote_glob, local_dir).await
    }
}

/// Run a prepared subprocess and capture its output, killing it when `timeout` fires.
pub(crate) async fn run_captured(
    mut cmd: Command,
    program: &str,
    timeout: Option<Duration>,
) -> Result<ExecOutput, RemoteError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd.spawn().map_err(|e| RemoteError::Spawn {
        program: program.to_string(),
        detail: e.to_string(),
    })?;

    let waited = match timeout {
        Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
            Ok(res) => res,
            Err(_) => {
                // Dropping the future drops the child, which kill_on_drop terminates.
                warn!(program, timeout_secs = limit.as_secs_f64(), "Remote call hit its hard timeout");
                return Ok(ExecOutput::timeout(limit));
            }
        },
        None => child.wait_with_output().await,
    };

    let output = waited.map_err(RemoteError::Io)?;
    let exit_code = output.status.code().unwrap_or(-1);
    let result = ExecOutput {
        exit_code,
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        timed_out: false,
    };
    debug!(
        program,
        exit_code,
        stdout_len = result.stdout.len(),
        stderr_len = result.stderr.len(),
        "Subprocess finished"
    );
    Ok(result)
}

/// Await an upload or download, giving up after `limit`.
///
/// Expiry drops the transfer (and with it any `scp` child) and surfaces as
/// [`RemoteError::Transfer`] carrying the timeout marker.
pub async fn bounded_transfer<F>(target: &RemoteTarget, limit: Duration, transfer: F) -> Result<(), RemoteError>
where
    F: Future<Output = Result<(), RemoteError>>,
{
    match tokio::time::timeout(limit, transfer).await {
        Ok(result) => result,
        Err(_) => {
            warn!(
                environment = %target.environment,
                timeout_secs = limit.as_secs_f64(),
                "File transfer hit its hard timeout"
            );
            Err(RemoteError::Transfer {
                environment: target.environment.clone(),
                detail: format!("{TIMEOUT_MARKER} no result after {}s", limit.as_secs_f64()),
            })
        }
    }
}

/// Run `script` and turn a non-zero exit or a timeout into [`RemoteError::Failed`].
pub async fn exec_checked<S>(
    shell: &S,
    target: &RemoteTarget,
    script: &str,
    timeout: Option<Duration>,
) -> Result<ExecOutput, RemoteError>
where
    S: RemoteShell + ?Sized,
{
    let output = shell.exec(target, script, timeout).await?;
    if output.success() {
        Ok(output)
    } else {
        Err(RemoteError::Failed {
            environment: target.environment.clone(),
            output,
        })
    }
}

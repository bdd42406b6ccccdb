//! Output retrieval for finished jobs and removal of remote workspaces.

use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use super::job::{Job, JobState};
use super::launch::job_dir;
use crate::config::RemoteTarget;
use crate::contract::RemoteShell;
use crate::remote::bounded_transfer;
use crate::remote::payload::shell_quote;

/// `<root>/<environment>/<platform>`
pub fn local_output_dir(root: &Path, job: &Job) -> PathBuf {
    root.join(&job.environment).join(&job.platform)
}

/// Download `outputs/<platform>/*` of a finished job, waiting at most `limit`.
/// Failures are only logged.
///
/// Returns the local directory when the download succeeded.
pub async fn collect_outputs<S>(
    shell: &S,
    job: &mut Job,
    root: &Path,
    limit: Duration,
) -> Option<PathBuf>
where
    S: RemoteShell + ?Sized,
{
    if job.outputs_collected || !matches!(job.state, JobState::Finished { .. }) {
        return None;
    }
    let workspace = job.workspace.as_deref()?;
    let local = local_output_dir(root, job);
    let remote = format!("{}/*", job_dir(workspace, &job.platform));
    // One attempt only; a job may legitimately produce nothing.
    job.outputs_collected = true;
    match bounded_transfer(&job.target, limit, shell.download(&job.target, &remote, &local)).await {
        Ok(()) => {
            info!(
                environment = %job.environment,
                platform = %job.platform,
                local = %local.display(),
                "Collected job outputs"
            );
            Some(local)
        }
        Err(e) => {
            warn!(
                environment = %job.environment,
                platform = %job.platform,
                error = %e,
                "Could not collect job outputs"
            );
            None
        }
    }
}

/// Remove a run workspace if it still exists. Never fails.
pub async fn cleanup_workspace<S>(shell: &S, target: &RemoteTarget, workspace: &str, timeout: Duration)
where
    S: RemoteShell + ?Sized,
{
    let ws = shell_quote(workspace);
    let script = format!("if [ -d {ws} ]; then rm -rf {ws}; fi\n");
    match shell.exec(target, &script, Some(timeout)).await {
        Ok(out) if out.success() => {
            info!(environment = %target.environment, workspace, "Removed remote workspace")
        }
        Ok(out) => warn!(
            environment = %target.environment,
            workspace,
            exit_code = out.exit_code,
            timed_out = out.timed_out,
            stderr = %out.stderr.trim(),
            "Remote workspace cleanup did not succeed"
        ),
        Err(e) => warn!(environment = %target.environment, workspace, error = %e, "Remote workspace cleanup failed"),
    }
}

//! Status probes: one remote call per job, answered purely from marker files.

use std::time::Duration;
use tracing::{debug, warn};

use super::job::{Job, Probe};
use super::launch::{job_dir, EXIT_CODE_FILE, PID_FILE};
use crate::contract::RemoteShell;
use crate::remote::payload::shell_quote;

pub fn probe_script(workspace: &str, platform: &str) -> String {
    format!(
        "st={dir}\n\
         if [ ! -d \"$st\" ]; then echo 'STATE MISSING'; exit 0; fi\n\
         if [ -f \"$st/{EXIT_CODE_FILE}\" ]; then printf 'STATE FINISHED %s\\n' \"$(head -n 1 \"$st/{EXIT_CODE_FILE}\")\"; exit 0; fi\n\
         if [ -f \"$st/{PID_FILE}\" ]; then\n\
         \x20 pid=$(head -n 1 \"$st/{PID_FILE}\")\n\
         \x20 if [ -n \"$pid\" ] && kill -0 \"$pid\" 2>/dev/null; then echo \"STATE RUNNING $pid\"; exit 0; fi\n\
         fi\n\
         echo 'STATE PENDING'\n",
        dir = shell_quote(&job_dir(workspace, platform)),
    )
}

/// Parse the `STATE ...` line printed by [`probe_script`].
pub fn parse_probe(stdout: &str) -> Option<Probe> {
    let line = stdout.lines().rev().find(|l| l.starts_with("STATE "))?;
    let mut parts = line.split_whitespace().skip(1);
    match parts.next()? {
        "MISSING" => Some(Probe::Missing),
        "PENDING" => Some(Probe::Pending),
        "RUNNING" => Some(Probe::Running {
            pid: parts.next().and_then(|p| p.parse().ok()).unwrap_or(0),
        }),
        // An empty or garbled exit.code still means the job ended.
        "FINISHED" => Some(Probe::Finished {
            exit_code: parts.next().and_then(|c| c.parse().ok()).unwrap_or(-1),
        }),
        _ => None,
    }
}

/// Ask the remote side where `job` stands. Transport trouble and timeouts are [`Probe::Unknown`].
pub async fn probe_job<S>(shell: &S, job: &Job, timeout: Duration) -> Probe
where
    S: RemoteShell + ?Sized,
{
    let Some(workspace) = job.workspace.as_deref() else {
        return Probe::Missing;
    };
    match shell
        .exec(&job.target, &probe_script(workspace, &job.platform), Some(timeout))
        .await
    {
        Ok(out) if out.timed_out => {
            warn!(environment = %job.environment, platform = %job.platform, "Status probe timed out");
            Probe::Unknown
        }
        Ok(out) => match parse_probe(&out.stdout) {
            Some(probe) => {
                debug!(environment = %job.environment, platform = %job.platform, ?probe, "Probed job");
                probe
            }
            None => {
                warn!(
                    environment = %job.environment,
                    platform = %job.platform,
                    exit_code = out.exit_code,
                    stderr = %out.stderr.trim(),
                    "Unreadable status probe output"
                );
                Probe::Unknown
            }
        },
        Err(e) => {
            warn!(environment = %job.environment, platform = %job.platform, error = %e, "Status probe failed");
            Probe::Unknown
        }
    }
}

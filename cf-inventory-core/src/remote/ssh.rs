//! `RemoteShell` over OpenSSH.
//!
//! Every call spawns one `ssh` or `scp` process. Password authentication goes
//! through `sshpass -e`, with the password passed in the child's environment
//! only. Host keys are accepted on first contact and checked afterwards.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, error, info};

use super::payload::{shell_quote, wire_command};
use super::run_captured;
use crate::config::{AuthMethod, RemoteTarget};
use crate::contract::{ExecOutput, RemoteError, RemoteShell};

/// ssh exits with 255 for its own failures; these stderr fragments tell us it was ssh talking.
const CONNECT_ERRORS: &[&str] = &[
    "Could not resolve hostname",
    "Connection refused",
    "Connection timed out",
    "No route to host",
    "Connection closed by",
    "Connection reset by",
    "Network is unreachable",
    "kex_exchange_identification",
];
const AUTH_ERRORS: &[&str] = &[
    "Permission denied",
    "Authentication failed",
    "Too many authentication failures",
    "Host key verification failed",
];

#[derive(Debug, Clone)]
pub struct SshShell {
    pub connect_timeout: Duration,
    /// Hard limit for one `scp` (and the `mkdir` before an upload).
    pub transfer_timeout: Duration,
    /// Extra `-o` options appended to every call.
    pub extra_options: Vec<String>,
}

impl Default for SshShell {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            transfer_timeout: Duration::from_secs(600),
            extra_options: Vec::new(),
        }
    }
}

impl SshShell {
    /// Build an `ssh` or `scp` invocation with auth and connection options applied.
    fn command(&self, target: &RemoteTarget, program: &str) -> Result<Command, RemoteError> {
        let mut cmd = match &target.auth {
            AuthMethod::Password { env } => {
                let password = std::env::var(env).map_err(|_| RemoteError::Auth {
                    environment: target.environment.clone(),
                    detail: format!("password variable {env} is not set"),
                })?;
                let mut cmd = Command::new("sshpass");
                cmd.env("SSHPASS", password).arg("-e").arg(program);
                cmd
            }
            _ => Command::new(program),
        };

        let port_flag = if program == "scp" { "-P" } else { "-p" };
        cmd.arg(port_flag).arg(target.port.to_string());
        if !matches!(target.auth, AuthMethod::Password { .. }) {
            cmd.arg("-o").arg("BatchMode=yes");
        }
        cmd.arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)))
            .arg("-o")
            .arg("StrictHostKeyChecking=accept-new")
            .arg("-o")
            .arg("LogLevel=ERROR");
        if let AuthMethod::Key { path } = &target.auth {
            cmd.arg("-i").arg(path);
        }
        for opt in &self.extra_options {
            cmd.arg("-o").arg(opt);
        }
        Ok(cmd)
    }

    fn program_name(target: &RemoteTarget, program: &str) -> String {
        match target.auth {
            AuthMethod::Password { .. } => format!("sshpass {program}"),
            _ => program.to_string(),
        }
    }
}

/// Map ssh's own failures (exit 255 plus a recognisable message) to typed errors.
fn classify(target: &RemoteTarget, output: &ExecOutput) -> Option<RemoteError> {
    if output.timed_out || output.exit_code != 255 {
        return None;
    }
    let detail = output.stderr.trim().to_string();
    if AUTH_ERRORS.iter().any(|m| detail.contains(m)) {
        return Some(RemoteError::Auth {
            environment: target.environment.clone(),
            detail,
        });
    }
    if CONNECT_ERRORS.iter().any(|m| detail.contains(m)) || detail.starts_with("ssh:") {
        return Some(RemoteError::Connect {
            environment: target.environment.clone(),
            detail,
        });
    }
    None
}

#[async_trait]
impl RemoteShell for SshShell {
    async fn exec(
        &self,
        target: &RemoteTarget,
        script: &str,
        timeout: Option<Duration>,
    ) -> Result<ExecOutput, RemoteError> {
        let mut cmd = self.command(target, "ssh")?;
        cmd.arg(target.destination()).arg(wire_command(script));
        debug!(
            environment = %target.environment,
            destination = %target.destination(),
            script_len = script.len(),
            "ssh exec"
        );
        let output = run_captured(cmd, &Self::program_name(target, "ssh"), timeout).await?;
        if let Some(err) = classify(target, &output) {
            error!(environment = %target.environment, error = %err, "ssh failed");
            return Err(err);
        }
        Ok(output)
    }

    async fn upload(
        &self,
        target: &RemoteTarget,
        local_paths: &[PathBuf],
        remote_dir: &str,
    ) -> Result<(), RemoteError> {
        if local_paths.is_empty() {
            return Ok(());
        }
        let mkdir = format!("mkdir -p {}", shell_quote(remote_dir));
        super::exec_checked(self, target, &mkdir, Some(self.transfer_timeout)).await?;

        let mut cmd = self.command(target, "scp")?;
        cmd.arg("-p");
        for path in local_paths {
            cmd.arg(path);
        }
        cmd.arg(format!("{}:{}/", target.destination(), remote_dir));
        let output = run_captured(cmd, &Self::program_name(target, "scp"), Some(self.transfer_timeout)).await?;
        if let Some(err) = classify(target, &output) {
            return Err(err);
        }
        if output.exit_code != 0 {
            error!(environment = %target.environment, stderr = %output.stderr.trim(), "scp upload failed");
            return Err(RemoteError::Transfer {
                environment: target.environment.clone(),
                detail: output.stderr.trim().to_string(),
            });
        }
        info!(
            environment = %target.environment,
            files = local_paths.len(),
            remote_dir,
            "Uploaded files"
        );
        Ok(())
    }

    async fn download(
        &self,
        target: &RemoteTarget,
        remote_glob: &str,
        local_dir: &Path,
    ) -> Result<(), RemoteError> {
        tokio::fs::create_dir_all(local_dir).await?;
        let mut cmd = self.command(target, "scp")?;
        cmd.arg("-r")
            .arg("-p")
            .arg(format!("{}:{}", target.destination(), remote_glob))
            .arg(local_dir);
        let output = run_captured(cmd, &Self::program_name(target, "scp"), Some(self.transfer_timeout)).await?;
        if let Some(err) = classify(target, &output) {
            return Err(err);
        }
        if output.exit_code != 0 {
            return Err(RemoteError::Transfer {
                environment: target.environment.clone(),
                detail: output.stderr.trim().to_string(),
            });
        }
        info!(
            environment = %target.environment,
            remote_glob,
            local_dir = %local_dir.display(),
            "Downloaded files"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportKind;

    fn target() -> RemoteTarget {
        RemoteTarget {
            environment: "east".into(),
            host: "jump.example.com".into(),
            port: 2222,
            user: Some("ops".into()),
            auth: AuthMethod::Agent,
            transport: TransportKind::Ssh,
        }
    }

    fn out(code: i32, stderr: &str) -> ExecOutput {
        ExecOutput {
            exit_code: code,
            stdout: String::new(),
            stderr: stderr.into(),
            timed_out: false,
        }
    }

    #[test]
    fn ssh_failures_are_classified() {
        let t = target();
        assert!(matches!(
            classify(&t, &out(255, "ops@jump.example.com: Permission denied (publickey).")),
            Some(RemoteError::Auth { .. })
        ));
        assert!(matches!(
            classify(&t, &out(255, "ssh: connect to host jump.example.com port 2222: Connection refused")),
            Some(RemoteError::Connect { .. })
        ));
        // A remote command that itself exits 255 stays an ordinary result.
        assert!(classify(&t, &out(255, "job said no")).is_none());
        assert!(classify(&t, &out(1, "Permission denied")).is_none());
        assert!(classify(&t, &ExecOutput::timeout(Duration::from_secs(1))).is_none());
    }

    #[test]
    fn destination_includes_user_when_set() {
        let mut t = target();
        assert_eq!(t.destination(), "ops@jump.example.com");
        t.user = None;
        assert_eq!(t.destination(), "jump.example.com");
    }
}

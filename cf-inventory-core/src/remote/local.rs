//! `RemoteShell` that treats the local machine as the remote host.
//!
//! The same wire command an ssh session would receive is handed to the local
//! `/bin/sh -c`, so scripts behave identically. Transfers are plain copies.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::payload::{wire_command, REMOTE_SHELL};
use super::run_captured;
use crate::config::RemoteTarget;
use crate::contract::{ExecOutput, RemoteError, RemoteShell};

#[derive(Debug, Default, Clone, Copy)]
pub struct LocalShell;

/// Expand `$HOME` so local callers can pass the same paths a remote shell would expand.
fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("$HOME"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => PathBuf::from(format!("{home}{rest}")),
        _ => PathBuf::from(path),
    }
}

/// Files matched by `remote_glob`. Only a trailing `/*` wildcard is understood.
fn matches(remote_glob: &str) -> std::io::Result<Vec<PathBuf>> {
    if let Some(dir) = remote_glob.strip_suffix("/*") {
        let mut found = Vec::new();
        for entry in std::fs::read_dir(expand_home(dir))? {
            found.push(entry?.path());
        }
        found.sort();
        return Ok(found);
    }
    let path = expand_home(remote_glob);
    if path.exists() {
        Ok(vec![path])
    } else {
        Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("{remote_glob}: no such file or directory"),
        ))
    }
}

fn copy_recursive(from: &Path, to_dir: &Path) -> std::io::Result<()> {
    let name = from.file_name().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no file name")
    })?;
    let dest = to_dir.join(name);
    if from.is_dir() {
        std::fs::create_dir_all(&dest)?;
        for entry in std::fs::read_dir(from)? {
            copy_recursive(&entry?.path(), &dest)?;
        }
    } else {
        std::fs::copy(from, &dest)?;
    }
    Ok(())
}

#[async_trait]
impl RemoteShell for LocalShell {
    async fn exec(
        &self,
        target: &RemoteTarget,
        script: &str,
        timeout: Option<Duration>,
    ) -> Result<ExecOutput, RemoteError> {
        let mut cmd = Command::new(REMOTE_SHELL);
        cmd.arg("-c").arg(wire_command(script));
        debug!(environment = %target.environment, script_len = script.len(), "local exec");
        run_captured(cmd, REMOTE_SHELL, timeout).await
    }

    async fn upload(
        &self,
        target: &RemoteTarget,
        local_paths: &[PathBuf],
        remote_dir: &str,
    ) -> Result<(), RemoteError> {
        let dir = expand_home(remote_dir);
        let paths = local_paths.to_vec();
        let environment = target.environment.clone();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            std::fs::create_dir_all(&dir)?;
            for path in &paths {
                copy_recursive(path, &dir)?;
            }
            Ok(())
        })
        .await
        .map_err(|e| RemoteError::Transfer {
            environment: environment.clone(),
            detail: e.to_string(),
        })?
        .map_err(|e| RemoteError::Transfer {
            environment,
            detail: e.to_string(),
        })?;
        info!(environment = %target.environment, files = local_paths.len(), remote_dir, "Copied files into local workspace");
        Ok(())
    }

    async fn download(
        &self,
        target: &RemoteTarget,
        remote_glob: &str,
        local_dir: &Path,
    ) -> Result<(), RemoteError> {
        let glob = remote_glob.to_string();
        let dest = local_dir.to_path_buf();
        let environment = target.environment.clone();
        let copied = tokio::task::spawn_blocking(move || -> std::io::Result<usize> {
            std::fs::create_dir_all(&dest)?;
            let found = matches(&glob)?;
            for path in &found {
                copy_recursive(path, &dest)?;
            }
            Ok(found.len())
        })
        .await
        .map_err(|e| RemoteError::Transfer {
            environment: environment.clone(),
            detail: e.to_string(),
        })?;
        match copied {
            Ok(count) => {
                info!(environment = %target.environment, remote_glob, files = count, "Copied files out of local workspace");
                Ok(())
            }
            Err(e) => {
                warn!(environment = %target.environment, remote_glob, error = %e, "Local download failed");
                Err(RemoteError::Transfer {
                    environment,
                    detail: e.to_string(),
                })
            }
        }
    }
}

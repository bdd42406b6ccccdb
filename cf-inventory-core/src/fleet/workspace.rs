//! Remote workspace resolution.
//!
//! A run workspace is `<base>/_run_<tag>`. Bases are tried in order: the
//! environment's `workdir`, `$HOME/.cache/cf-inventory`, `/var/tmp`, `/tmp`.
//! An existing `_run_<tag>` under any base wins, which makes resolution
//! idempotent across launch and `--resume`. Otherwise each base is probed for
//! being creatable, writable and able to execute a freshly written script;
//! `noexec` mounts are skipped.

use std::fmt;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::remote::payload::shell_quote;
use crate::config::EnvironmentConfig;
use crate::contract::{RemoteError, RemoteShell};

/// Directory under `$HOME` used as a fallback base.
pub const HOME_CACHE_DIR: &str = ".cache/cf-inventory";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BaseDir {
    Absolute(String),
    /// Relative to the remote user's `$HOME`.
    Home(String),
}

impl BaseDir {
    /// Shell word that expands to this directory on the remote side.
    pub fn shell_word(&self) -> String {
        match self {
            BaseDir::Absolute(p) => shell_quote(p),
            BaseDir::Home(rel) if rel.is_empty() => "\"$HOME\"".to_string(),
            BaseDir::Home(rel) => format!("\"$HOME\"/{}", shell_quote(rel)),
        }
    }
}

impl fmt::Display for BaseDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BaseDir::Absolute(p) => write!(f, "{p}"),
            BaseDir::Home(rel) => write!(f, "$HOME/{rel}"),
        }
    }
}

impl From<&str> for BaseDir {
    fn from(raw: &str) -> Self {
        let trimmed = raw.trim_end_matches('/');
        for prefix in ["$HOME/", "~/"] {
            if let Some(rel) = trimmed.strip_prefix(prefix) {
                return BaseDir::Home(rel.to_string());
            }
        }
        if trimmed == "$HOME" || trimmed == "~" {
            return BaseDir::Home(String::new());
        }
        BaseDir::Absolute(if trimmed.is_empty() { "/".to_string() } else { trimmed.to_string() })
    }
}

pub fn run_dir_name(run_tag: &str) -> String {
    format!("_run_{run_tag}")
}

pub fn candidates(env: &EnvironmentConfig) -> Vec<BaseDir> {
    let mut list = Vec::new();
    if let Some(preferred) = env.workdir.as_deref().filter(|w| !w.trim().is_empty()) {
        list.push(BaseDir::from(preferred));
    }
    for fallback in [
        BaseDir::Home(HOME_CACHE_DIR.to_string()),
        BaseDir::Absolute("/var/tmp".to_string()),
        BaseDir::Absolute("/tmp".to_string()),
    ] {
        if !list.contains(&fallback) {
            list.push(fallback);
        }
    }
    list
}

/// Why a base directory was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeFailure {
    NotCreatable,
    NotWritable,
    NoExecMount,
    CannotExecute,
    TimedOut,
    Other(i32),
}

impl ProbeFailure {
    fn from_exit(code: i32) -> Self {
        match code {
            10 => ProbeFailure::NotCreatable,
            11 => ProbeFailure::NotWritable,
            12 => ProbeFailure::NoExecMount,
            13 => ProbeFailure::CannotExecute,
            other => ProbeFailure::Other(other),
        }
    }
}

impl fmt::Display for ProbeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeFailure::NotCreatable => write!(f, "cannot be created"),
            ProbeFailure::NotWritable => write!(f, "not writable"),
            ProbeFailure::NoExecMount => write!(f, "mounted noexec"),
            ProbeFailure::CannotExecute => write!(f, "scripts cannot be executed there"),
            ProbeFailure::TimedOut => write!(f, "probe timed out"),
            ProbeFailure::Other(code) => write!(f, "probe exited with {code}"),
        }
    }
}

#[derive(Debug)]
pub enum WorkspaceError {
    NoUsableBase {
        environment: String,
        tried: Vec<(BaseDir, ProbeFailure)>,
    },
    Remote(RemoteError),
}

impl fmt::Display for WorkspaceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkspaceError::NoUsableBase { environment, tried } => {
                let detail = tried
                    .iter()
                    .map(|(base, why)| format!("{base}: {why}"))
                    .collect::<Vec<_>>()
                    .join("; ");
                write!(
                    f,
                    "no writable, exec-capable workspace directory on environment '{environment}' ({detail}); \
                     set `workdir` for this environment to a directory that allows executing scripts"
                )
            }
            WorkspaceError::Remote(e) => write!(f, "workspace resolution failed: {e}"),
        }
    }
}

impl std::error::Error for WorkspaceError {}

impl From<RemoteError> for WorkspaceError {
    fn from(e: RemoteError) -> Self {
        WorkspaceError::Remote(e)
    }
}

fn existing_script(bases: &[BaseDir], run_dir: &str) -> String {
    let words = bases
        .iter()
        .map(BaseDir::shell_word)
        .collect::<Vec<_>>()
        .join(" ");
    format!(
        "for base in {words}; do\n\
         \x20 if [ -d \"$base\"/{run} ]; then cd \"$base\"/{run} && pwd -P; exit 0; fi\n\
         done\n\
         exit 1\n",
        run = shell_quote(run_dir)
    )
}

fn probe_script(base: &BaseDir, nonce: &str) -> String {
    format!(
        "base={word}\n\
         mkdir -p \"$base\" 2>/dev/null || exit 10\n\
         [ -d \"$base\" ] && [ -w \"$base\" ] || exit 11\n\
         opts=$(findmnt -no OPTIONS --target \"$base\" 2>/dev/null || true)\n\
         case \",$opts,\" in *,noexec,*) exit 12 ;; esac\n\
         probe=\"$base/.cfi_probe_{nonce}\"\n\
         printf '#!/bin/sh\\nexit 0\\n' > \"$probe\" 2>/dev/null || exit 11\n\
         chmod 700 \"$probe\" && \"$probe\"\n\
         rc=$?\n\
         rm -f \"$probe\"\n\
         [ \"$rc\" -eq 0 ] || exit 13\n\
         cd \"$base\" && pwd -P\n",
        word = base.shell_word(),
    )
}

fn create_script(workspace: &str) -> String {
    let ws = shell_quote(workspace);
    format!("mkdir -p {ws} && cd {ws} && pwd -P\n")
}

fn last_line(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| l.starts_with('/'))
        .last()
        .map(str::to_string)
}

/// Absolute path of an existing `_run_<tag>` directory, if any base has one.
pub async fn find_existing<S>(
    shell: &S,
    env: &EnvironmentConfig,
    run_tag: &str,
    timeout: Duration,
) -> Result<Option<String>, WorkspaceError>
where
    S: RemoteShell + ?Sized,
{
    let target = env.target();
    let script = existing_script(&candidates(env), &run_dir_name(run_tag));
    let out = shell.exec(&target, &script, Some(timeout)).await?;
    if out.timed_out {
        return Err(WorkspaceError::Remote(RemoteError::Failed {
            environment: env.name.clone(),
            output: out,
        }));
    }
    if out.exit_code == 0 {
        if let Some(path) = last_line(&out.stdout) {
            info!(environment = %env.name, workspace = %path, "Reusing existing run workspace");
            return Ok(Some(path));
        }
    }
    debug!(environment = %env.name, run_tag, "No existing run workspace");
    Ok(None)
}

/// Resolve (and create) the run workspace for `env`.
pub async fn resolve_workspace<S>(
    shell: &S,
    env: &EnvironmentConfig,
    run_tag: &str,
    timeout: Duration,
) -> Result<String, WorkspaceError>
where
    S: RemoteShell + ?Sized,
{
    if let Some(existing) = find_existing(shell, env, run_tag, timeout).await? {
        return Ok(existing);
    }

    let target = env.target();
    let nonce = uuid::Uuid::new_v4().simple().to_string();
    let mut tried = Vec::new();
    for base in candidates(env) {
        let out = shell.exec(&target, &probe_script(&base, &nonce), Some(timeout)).await?;
        let failure = if out.timed_out {
            ProbeFailure::TimedOut
        } else if out.exit_code != 0 {
            ProbeFailure::from_exit(out.exit_code)
        } else {
            match last_line(&out.stdout) {
                Some(abs_base) => {
                    let workspace = format!("{}/{}", abs_base.trim_end_matches('/'), run_dir_name(run_tag));
                    let created = crate::remote::exec_checked(
                        shell,
                        &target,
                        &create_script(&workspace),
                        Some(timeout),
                    )
                    .await?;
                    let workspace = last_line(&created.stdout).unwrap_or(workspace);
                    info!(environment = %env.name, base = %base, workspace = %workspace, "Resolved run workspace");
                    return Ok(workspace);
                }
                None => ProbeFailure::Other(0),
            }
        };
        warn!(environment = %env.name, base = %base, reason = %failure, "Workspace base rejected");
        tried.push((base, failure));
    }

    let err = WorkspaceError::NoUsableBase {
        environment: env.name.clone(),
        tried,
    };
    error!(environment = %env.name, error = %err, "Workspace resolution failed");
    Err(err)
}

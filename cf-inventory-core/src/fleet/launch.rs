//! Job launch: artifact upload and verification, then detached start of each job.
//!
//! Each job lives in `<workspace>/outputs/<platform>/` with these files:
//!
//! | file        | written by                     |
//! |-------------|--------------------------------|
//! | `job.sh`    | launcher (decoded job body)    |
//! | `pid`       | launcher, right after `&`      |
//! | `run.out`   | job stdout                     |
//! | `run.err`   | job stderr                     |
//! | `exit.code` | job EXIT trap, via rename      |

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, error, info};

use super::job::Job;
use super::workspace::{resolve_workspace, WorkspaceError};
use crate::config::{ArtifactConfig, EnvironmentConfig, PlatformConfig};
use crate::contract::{ExecOutput, RemoteError, RemoteShell};
use crate::remote::{bounded_transfer, exec_checked};
use crate::remote::payload::{encode_payload, shell_quote, REMOTE_SHELL};
use crate::remote::transfer::{remote_file_name, stage_uploads};

pub const OUTPUTS_DIR: &str = "outputs";
pub const PID_FILE: &str = "pid";
pub const EXIT_CODE_FILE: &str = "exit.code";
pub const STDOUT_FILE: &str = "run.out";
pub const STDERR_FILE: &str = "run.err";
pub const JOB_SCRIPT: &str = "job.sh";

/// `<workspace>/outputs/<platform>`
pub fn job_dir(workspace: &str, platform: &str) -> String {
    format!("{}/{OUTPUTS_DIR}/{platform}", workspace.trim_end_matches('/'))
}

/// Remote directory holding the uploaded env-file of a platform.
pub fn env_file_dir(workspace: &str, platform: &str) -> String {
    format!("{}/env/{platform}", workspace.trim_end_matches('/'))
}

#[derive(Debug)]
pub enum LaunchError {
    Workspace(WorkspaceError),
    Stage { path: PathBuf, detail: String },
    Upload(RemoteError),
    /// The uploaded binary could not be run; `diagnostics` holds what the host says about it.
    Artifact {
        environment: String,
        binary: String,
        output: ExecOutput,
        diagnostics: String,
    },
    Launch { platform: String, source: RemoteError },
    NoWorkspace { environment: String },
}

impl fmt::Display for LaunchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LaunchError::Workspace(e) => write!(f, "{e}"),
            LaunchError::Stage { path, detail } => {
                write!(f, "cannot stage {} for upload: {detail}", path.display())
            }
            LaunchError::Upload(e) => write!(f, "artifact upload failed: {e}"),
            LaunchError::Artifact {
                environment,
                binary,
                output,
                diagnostics,
            } => write!(
                f,
                "uploaded binary '{binary}' does not run on environment '{environment}' (exit {}): {}\n--- remote diagnostics ---\n{}",
                output.exit_code,
                output.stderr.trim(),
                diagnostics.trim_end()
            ),
            LaunchError::Launch { platform, source } => {
                write!(f, "launching platform '{platform}' failed: {source}")
            }
            LaunchError::NoWorkspace { environment } => {
                write!(f, "no workspace resolved for environment '{environment}'")
            }
        }
    }
}

impl std::error::Error for LaunchError {}

impl From<WorkspaceError> for LaunchError {
    fn from(e: WorkspaceError) -> Self {
        LaunchError::Workspace(e)
    }
}

fn is_env_key(k: &str) -> bool {
    !k.is_empty()
        && !k.starts_with(|c: char| c.is_ascii_digit())
        && k.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Renders the remote script that starts one job as a detached process.
#[derive(Debug, Clone)]
pub struct DetachedLaunch<'a> {
    pub workspace: &'a str,
    pub platform: &'a str,
    pub env: Vec<(String, String)>,
    /// Remote path of an env-file to source (with auto-export) before launching.
    pub env_file: Option<String>,
    pub command: &'a str,
}

impl<'a> DetachedLaunch<'a> {
    pub fn for_job(job: &'a Job, workspace: &'a str, run_tag: &str, extra_env: &[(String, String)]) -> Self {
        let dir = job_dir(workspace, &job.platform);
        let mut env = vec![
            ("PLATFORM".to_string(), job.platform.clone()),
            ("ENVIRONMENT".to_string(), job.environment.clone()),
            ("RUN_TAG".to_string(), run_tag.to_string()),
            ("OUTPUT_DIR".to_string(), dir),
        ];
        if let Some(api) = &job.api {
            env.push(("CF_API".to_string(), api.clone()));
        }
        env.extend(extra_env.iter().cloned());
        Self {
            workspace,
            platform: &job.platform,
            env,
            env_file: None,
            command: &job.command,
        }
    }

    pub fn with_env_file(mut self, remote_path: impl Into<String>) -> Self {
        self.env_file = Some(remote_path.into());
        self
    }

    /// The detached process body: traps that always leave `exit.code`, then the command.
    pub fn job_body(&self) -> String {
        let dir = shell_quote(&job_dir(self.workspace, self.platform));
        let ws = shell_quote(self.workspace);
        format!(
            "st={dir}\n\
             finish() {{\n\
             \x20 rc=$?\n\
             \x20 if [ ! -f \"$st/{EXIT_CODE_FILE}\" ]; then\n\
             \x20   printf '%s\\n' \"$rc\" > \"$st/{EXIT_CODE_FILE}.tmp\" 2>/dev/null && mv -f \"$st/{EXIT_CODE_FILE}.tmp\" \"$st/{EXIT_CODE_FILE}\" 2>/dev/null\n\
             \x20 fi\n\
             }}\n\
             trap finish EXIT\n\
             trap 'exit 129' HUP\n\
             trap 'exit 130' INT\n\
             trap 'exit 143' TERM\n\
             cd {ws} || exit 1\n\
             {command}\n",
            command = self.command,
        )
    }

    /// The launcher script run over the remote shell.
    pub fn render(&self) -> String {
        let dir_raw = job_dir(self.workspace, self.platform);
        let dir = shell_quote(&dir_raw);
        let file = |name: &str| shell_quote(&format!("{dir_raw}/{name}"));
        let mut lines = Vec::new();
        for (k, v) in &self.env {
            if is_env_key(k) {
                lines.push(format!("export {k}={}", shell_quote(v)));
            } else {
                debug!(key = %k, "Skipping invalid environment variable name");
            }
        }
        if let Some(env_file) = &self.env_file {
            let f = shell_quote(env_file);
            lines.push(format!("if [ -f {f} ]; then set -a; . {f}; set +a; fi"));
        }
        lines.push(format!(
            "cd {} || {{ echo 'workspace missing' >&2; exit 3; }}",
            shell_quote(self.workspace)
        ));
        lines.push(format!("mkdir -p {dir} || exit 4"));
        lines.push(format!(
            "rm -f {} {} {}",
            file(PID_FILE),
            file(EXIT_CODE_FILE),
            file(&format!("{EXIT_CODE_FILE}.tmp"))
        ));
        lines.push(format!(
            "printf '%s' '{}' | base64 -d > {} || exit 5",
            encode_payload(&self.job_body()),
            file(JOB_SCRIPT)
        ));
        lines.push(format!(
            "nohup {REMOTE_SHELL} {} > {} 2> {} < /dev/null &",
            file(JOB_SCRIPT),
            file(STDOUT_FILE),
            file(STDERR_FILE)
        ));
        lines.push(format!("echo $! > {}", file(PID_FILE)));
        lines.push("echo \"LAUNCHED $!\"".to_string());
        lines.join("\n") + "\n"
    }
}

fn verify_script(workspace: &str, binary: &str, driver: &str, args: &[String]) -> String {
    let args = args.iter().map(|a| shell_quote(a)).collect::<Vec<_>>().join(" ");
    format!(
        "cd {ws} || exit 1\n\
         chmod 755 {bin} {drv} || exit 2\n\
         ./{bin} {args}\n",
        ws = shell_quote(workspace),
        bin = shell_quote(binary),
        drv = shell_quote(driver),
    )
}

fn diagnostics_script(workspace: &str, binary: &str) -> String {
    let bin = shell_quote(binary);
    format!(
        "cd {ws} 2>/dev/null\n\
         echo '== id'; id\n\
         echo '== listing'; ls -la\n\
         echo '== mount'; findmnt -no TARGET,FSTYPE,OPTIONS --target . 2>/dev/null || mount 2>/dev/null | head -n 50\n\
         echo '== acl'; getfacl -p {bin} 2>/dev/null || echo 'getfacl unavailable'\n\
         echo '== file'; file {bin} 2>/dev/null || echo 'file unavailable'\n\
         echo '== uname'; uname -a\n",
        ws = shell_quote(workspace),
    )
}

/// Resolve the workspace, upload artifacts and env-files, and prove the binary runs.
/// Returns the workspace path.
pub async fn prepare_environment<S>(
    shell: &S,
    env: &EnvironmentConfig,
    artifacts: &ArtifactConfig,
    run_tag: &str,
    timeout: Duration,
    transfer_timeout: Duration,
) -> Result<String, LaunchError>
where
    S: RemoteShell + ?Sized,
{
    let target = env.target();
    let workspace = resolve_workspace(shell, env, run_tag, timeout).await?;

    let locals = vec![artifacts.binary.clone(), artifacts.driver.clone()];
    let staged = stage_uploads(&locals).map_err(|e| LaunchError::Stage {
        path: locals[0].clone(),
        detail: e.to_string(),
    })?;
    bounded_transfer(
        &target,
        transfer_timeout,
        shell.upload(&target, &staged.paths, &workspace),
    )
    .await
    .map_err(LaunchError::Upload)?;

    for platform in &env.platforms {
        if let Some(env_file) = &platform.env_file {
            let staged = stage_uploads(std::slice::from_ref(env_file)).map_err(|e| LaunchError::Stage {
                path: env_file.clone(),
                detail: e.to_string(),
            })?;
            let env_dir = env_file_dir(&workspace, &platform.name);
            bounded_transfer(
                &target,
                transfer_timeout,
                shell.upload(&target, &staged.paths, &env_dir),
            )
            .await
            .map_err(LaunchError::Upload)?;
        }
    }

    let binary = remote_file_name(&artifacts.binary);
    let driver = remote_file_name(&artifacts.driver);
    let out = shell
        .exec(
            &target,
            &verify_script(&workspace, &binary, &driver, &artifacts.verify_args),
            Some(timeout),
        )
        .await
        .map_err(LaunchError::Upload)?;
    if !out.success() {
        let diagnostics = match shell
            .exec(&target, &diagnostics_script(&workspace, &binary), Some(timeout))
            .await
        {
            Ok(d) => format!("{}{}", d.stdout, d.stderr),
            Err(e) => format!("diagnostics unavailable: {e}"),
        };
        let err = LaunchError::Artifact {
            environment: env.name.clone(),
            binary,
            output: out,
            diagnostics,
        };
        error!(environment = %env.name, error = %err, "Artifact verification failed");
        return Err(err);
    }
    info!(
        environment = %env.name,
        workspace = %workspace,
        binary = %binary,
        version = %out.stdout.lines().next().unwrap_or("").trim(),
        "Artifacts uploaded and verified"
    );
    Ok(workspace)
}

/// Start one job detached. The job's workspace must already be set.
pub async fn launch_job<S>(
    shell: &S,
    job: &Job,
    platform: &PlatformConfig,
    run_tag: &str,
    timeout: Duration,
) -> Result<(), LaunchError>
where
    S: RemoteShell + ?Sized,
{
    let workspace = job.workspace.as_deref().ok_or_else(|| LaunchError::NoWorkspace {
        environment: job.environment.clone(),
    })?;
    let extra_env: Vec<(String, String)> = platform
        .env
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let mut launch = DetachedLaunch::for_job(job, workspace, run_tag, &extra_env);
    if let Some(local) = &platform.env_file {
        launch = launch.with_env_file(format!(
            "{}/{}",
            env_file_dir(workspace, &job.platform),
            remote_file_name(local)
        ));
    }
    let out = exec_checked(shell, &job.target, &launch.render(), Some(timeout))
        .await
        .map_err(|source| LaunchError::Launch {
            platform: job.platform.clone(),
            source,
        })?;
    info!(
        environment = %job.environment,
        platform = %job.platform,
        launched = %out.stdout.trim(),
        "Job launched"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::payload::decode_payload;

    fn launch<'a>(command: &'a str) -> DetachedLaunch<'a> {
        DetachedLaunch {
            workspace: "/var/tmp/_run_20260101",
            platform: "cf-prod",
            env: vec![
                ("FOUNDATION".into(), "it's prod".into()),
                ("1BAD".into(), "x".into()),
            ],
            env_file: Some("/var/tmp/_run_20260101/env/cf-prod/prod.env".into()),
            command,
        }
    }

    #[test]
    fn launcher_script_follows_the_launch_order() {
        let script = launch("./driver.sh").render();
        let export = script.find("export FOUNDATION='it'\\''s prod'").unwrap();
        let source = script.find("set -a; .").unwrap();
        let cd = script.find("cd /var/tmp/_run_20260101 ||").unwrap();
        let mkdir = script.find("mkdir -p /var/tmp/_run_20260101/outputs/cf-prod").unwrap();
        let clear = script.find("rm -f /var/tmp/_run_20260101/outputs/cf-prod/pid").unwrap();
        let start = script.find("nohup /bin/sh").unwrap();
        let pid = script.find("echo $! > /var/tmp/_run_20260101/outputs/cf-prod/pid").unwrap();
        assert!(export < source && source < cd && cd < mkdir && mkdir < clear && clear < start && start < pid);
        assert!(!script.contains("1BAD"));
    }

    #[test]
    fn job_body_travels_encoded_and_intact() {
        let command = "echo 'quoted' \"$HOME\" `uname`\nprintf '%s\\n' done";
        let l = launch(command);
        let script = l.render();
        let line = script.lines().find(|s| s.starts_with("printf '%s' '")).unwrap();
        let encoded = crate::remote::payload::extract_payload(line).unwrap();
        let body = decode_payload(encoded).unwrap();
        assert_eq!(body, l.job_body());
        assert!(body.ends_with(&format!("{command}\n")));
        assert!(body.contains("trap finish EXIT"));
        assert!(!script.contains("uname"));
    }
}

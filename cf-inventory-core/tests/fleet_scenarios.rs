use async_trait::async_trait;
use cf_inventory_core::config::{
    ArtifactConfig, AuthMethod, EnvironmentConfig, FleetConfig, FleetOptions, PlatformConfig,
    RemoteTarget, TransportKind,
};
use cf_inventory_core::contract::{
    Clock, ExecOutput, MockRemoteShell, RemoteError, RemoteShell, SystemClock, TIMEOUT_EXIT_CODE,
    TIMEOUT_MARKER,
};
use cf_inventory_core::fleet::workspace::{
    find_existing, resolve_workspace, BaseDir, ProbeFailure, WorkspaceError,
};
use cf_inventory_core::fleet::{run_fleet, JobState};
use cf_inventory_core::remote::LocalShell;
use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Scratch area under the cargo target dir, which (unlike some /tmp mounts) allows exec.
fn scratch() -> TempDir {
    tempfile::Builder::new()
        .prefix("fleet")
        .tempdir_in(env!("CARGO_TARGET_TMPDIR"))
        .expect("scratch dir")
}

fn write_exec(path: &Path, body: &str) {
    std::fs::write(path, body).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

fn artifacts(root: &Path) -> ArtifactConfig {
    let dir = root.join("artifacts");
    std::fs::create_dir_all(&dir).unwrap();
    write_exec(&dir.join("cf"), "#!/bin/sh\necho 'cf version 8.7.0'\n");
    write_exec(&dir.join("driver.sh"), "#!/bin/sh\r\necho driver\r\n");
    ArtifactConfig {
        binary: dir.join("cf"),
        driver: dir.join("driver.sh"),
        verify_args: vec!["--version".into()],
    }
}

fn platform(name: &str, command: &str) -> PlatformConfig {
    PlatformConfig {
        name: name.into(),
        api: Some(format!("https://api.{name}.example.com")),
        command: Some(command.into()),
        env: BTreeMap::new(),
        env_file: None,
    }
}

fn local_env(name: &str, workdir: &Path, platforms: Vec<PlatformConfig>) -> EnvironmentConfig {
    EnvironmentConfig {
        name: name.into(),
        host: "localhost".into(),
        port: 22,
        user: None,
        auth: AuthMethod::Agent,
        transport: TransportKind::Local,
        workdir: Some(workdir.display().to_string()),
        platforms,
    }
}

fn fast_options(tag: &str) -> FleetOptions {
    let mut options = FleetOptions::new(tag);
    options.quick_checks = 1;
    options.quick_delay = Duration::from_millis(300);
    options.poll_interval = Duration::from_millis(200);
    options.watch_timeout = Duration::from_secs(30);
    options.call_timeout = Duration::from_secs(10);
    options
}

/// LocalShell with failure injection and call accounting.
#[derive(Default)]
struct Harness {
    inner: LocalShell,
    /// Every command on this environment fails like an unwritable host.
    broken_env: Option<String>,
    /// Removed as soon as a probe reports a running job.
    delete_on_running: Option<PathBuf>,
    /// Transfers that never complete, like an `scp` stuck on a dead link.
    stall_uploads: bool,
    stall_downloads: bool,
    probes: Mutex<Vec<String>>,
    execs: AtomicUsize,
    launches: AtomicUsize,
    downloads: AtomicUsize,
}

#[async_trait]
impl RemoteShell for Harness {
    async fn exec(
        &self,
        target: &RemoteTarget,
        script: &str,
        timeout: Option<Duration>,
    ) -> Result<ExecOutput, RemoteError> {
        self.execs.fetch_add(1, Ordering::SeqCst);
        if self.broken_env.as_deref() == Some(target.environment.as_str()) {
            return Ok(ExecOutput {
                exit_code: 10,
                stdout: String::new(),
                stderr: "mkdir: cannot create directory: Permission denied".into(),
                timed_out: false,
            });
        }
        if script.contains("LAUNCHED") {
            self.launches.fetch_add(1, Ordering::SeqCst);
        }
        let out = self.inner.exec(target, script, timeout).await?;
        if let Some(line) = out.stdout.lines().find(|l| l.starts_with("STATE ")) {
            self.probes.lock().unwrap().push(line.to_string());
            if line.starts_with("STATE RUNNING") {
                if let Some(ws) = &self.delete_on_running {
                    let _ = std::fs::remove_dir_all(ws);
                }
            }
        }
        Ok(out)
    }

    async fn upload(
        &self,
        target: &RemoteTarget,
        local_paths: &[PathBuf],
        remote_dir: &str,
    ) -> Result<(), RemoteError> {
        if self.stall_uploads {
            std::future::pending::<()>().await;
        }
        self.inner.upload(target, local_paths, remote_dir).await
    }

    async fn download(
        &self,
        target: &RemoteTarget,
        remote_glob: &str,
        local_dir: &Path,
    ) -> Result<(), RemoteError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        if self.stall_downloads {
            std::future::pending::<()>().await;
        }
        self.inner.download(target, remote_glob, local_dir).await
    }
}

#[tokio::test]
async fn exit_zero_job_finishes_without_waiting_a_poll_interval() {
    let tmp = scratch();
    let config = FleetConfig {
        output_dir: tmp.path().join("out"),
        artifacts: artifacts(tmp.path()),
        environments: vec![local_env("env-a", &tmp.path().join("remote-a"), vec![platform("p1", "exit 0")])],
    };
    let mut options = fast_options("t1");
    options.poll_interval = Duration::from_secs(30);
    let shell = Harness::default();

    let started = Instant::now();
    let report = run_fleet(&shell, &SystemClock, &config, &options).await;

    assert!(started.elapsed() < options.poll_interval);
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.jobs[0].state, JobState::Finished { exit_code: 0 });

    let probes = shell.probes.lock().unwrap().clone();
    assert_eq!(probes.last().map(String::as_str), Some("STATE FINISHED 0"));
    let first_running = probes.iter().position(|p| p.starts_with("STATE RUNNING"));
    let last_pending = probes.iter().rposition(|p| p == "STATE PENDING");
    if let (Some(r), Some(p)) = (first_running, last_pending) {
        assert!(p < r, "pending observed after running: {probes:?}");
    }

    let collected = config.output_dir.join("env-a").join("p1");
    assert_eq!(std::fs::read_to_string(collected.join("exit.code")).unwrap().trim(), "0");
    assert!(!tmp.path().join("remote-a").join("_run_t1").exists(), "workspace cleaned up");
}

#[tokio::test]
async fn deleted_workspace_marks_job_missing_without_download() {
    let tmp = scratch();
    let workdir = tmp.path().join("remote-a");
    let config = FleetConfig {
        output_dir: tmp.path().join("out"),
        artifacts: artifacts(tmp.path()),
        environments: vec![local_env("env-a", &workdir, vec![platform("p1", "sleep 3")])],
    };
    let shell = Harness {
        delete_on_running: Some(workdir.join("_run_t2")),
        ..Default::default()
    };

    let report = run_fleet(&shell, &SystemClock, &config, &fast_options("t2")).await;

    assert_eq!(report.jobs[0].state, JobState::Missing);
    assert!(report.jobs[0].done);
    assert_eq!(shell.downloads.load(Ordering::SeqCst), 0);
    assert_eq!(report.exit_code(), 1);
}

#[tokio::test]
async fn broken_environment_does_not_stop_its_batch_neighbour() {
    let tmp = scratch();
    let config = FleetConfig {
        output_dir: tmp.path().join("out"),
        artifacts: artifacts(tmp.path()),
        environments: vec![
            local_env("env-a", &tmp.path().join("remote-a"), vec![platform("p1", "exit 0")]),
            local_env("env-b", &tmp.path().join("remote-b"), vec![platform("p2", "echo hello; exit 0")]),
        ],
    };
    let mut options = fast_options("t3");
    options.batch_size = 2;
    let shell = Harness {
        broken_env: Some("env-a".into()),
        ..Default::default()
    };

    let report = run_fleet(&shell, &SystemClock, &config, &options).await;

    let a = &report.jobs[0];
    assert!(matches!(&a.state, JobState::LaunchFailed { reason } if reason.contains("env-a") && reason.contains("workdir")));
    assert!(a.done);
    let b = &report.jobs[1];
    assert_eq!(b.state, JobState::Finished { exit_code: 0 });
    let out = std::fs::read_to_string(config.output_dir.join("env-b/p2/run.out")).unwrap();
    assert_eq!(out.trim(), "hello");
    assert_eq!(shell.launches.load(Ordering::SeqCst), 1);
    assert_eq!(report.exit_code(), 1);
    assert!(report.render_table().contains("launch failed"));
}

#[tokio::test]
async fn resume_rebuilds_state_without_relaunching() {
    let tmp = scratch();
    let config = FleetConfig {
        output_dir: tmp.path().join("out"),
        artifacts: artifacts(tmp.path()),
        environments: vec![local_env("env-a", &tmp.path().join("remote-a"), vec![platform("p1", "exit 3")])],
    };
    let mut options = fast_options("t5");
    options.keep_remote = true;
    let first = run_fleet(&Harness::default(), &SystemClock, &config, &options).await;
    assert_eq!(first.jobs[0].state, JobState::Finished { exit_code: 3 });

    options.resume = true;
    options.keep_remote = false;
    let shell = Harness::default();
    let resumed = run_fleet(&shell, &SystemClock, &config, &options).await;

    assert_eq!(resumed.jobs[0].state, JobState::Finished { exit_code: 3 });
    assert_eq!(shell.launches.load(Ordering::SeqCst), 0);
    assert_eq!(resumed.exit_code(), 1);
    assert!(!tmp.path().join("remote-a/_run_t5").exists());
}

#[tokio::test]
async fn resolver_reuses_existing_run_directory() {
    let tmp = scratch();
    let env = local_env("env-a", &tmp.path().join("remote-a"), vec![]);
    let shell = Harness::default();
    let timeout = Duration::from_secs(10);

    let first = resolve_workspace(&shell, &env, "idem", timeout).await.unwrap();
    let calls_after_first = shell.execs.load(Ordering::SeqCst);
    let second = resolve_workspace(&shell, &env, "idem", timeout).await.unwrap();

    assert_eq!(first, second);
    assert!(first.ends_with("/_run_idem"));
    assert_eq!(shell.execs.load(Ordering::SeqCst) - calls_after_first, 1, "no re-probe");
    assert_eq!(find_existing(&shell, &env, "idem", timeout).await.unwrap(), Some(first));
    assert_eq!(find_existing(&shell, &env, "other", timeout).await.unwrap(), None);
}

#[tokio::test]
async fn hard_timeout_is_distinct_from_remote_failure() {
    let target = local_env("env-a", Path::new("/tmp"), vec![]).target();
    let shell = LocalShell;

    let timed_out = shell
        .exec(&target, "sleep 5", Some(Duration::from_millis(200)))
        .await
        .unwrap();
    assert!(timed_out.timed_out);
    assert_eq!(timed_out.exit_code, TIMEOUT_EXIT_CODE);
    assert!(timed_out.stderr.starts_with(TIMEOUT_MARKER));

    let failed = shell
        .exec(&target, "echo boom >&2; exit 255", Some(Duration::from_secs(10)))
        .await
        .unwrap();
    assert!(!failed.timed_out);
    assert_eq!(failed.exit_code, 255);
    assert!(!failed.stderr.contains(TIMEOUT_MARKER));
}

#[tokio::test]
async fn hostile_script_reaches_the_shell_verbatim() {
    let target = local_env("env-a", Path::new("/tmp"), vec![]).target();
    let text = "it's `uname` and \"$HOME\" and $(id)\nsecond line";
    let script = format!("cat <<'EOF'\n{text}\nEOF\n");
    let out = LocalShell.exec(&target, &script, None).await.unwrap();
    assert_eq!(out.exit_code, 0);
    assert_eq!(out.stdout, format!("{text}\n"));
}

struct FakeClock {
    start: Instant,
    elapsed: Mutex<Duration>,
}

impl FakeClock {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            elapsed: Mutex::new(Duration::ZERO),
        }
    }

    fn elapsed(&self) -> Duration {
        *self.elapsed.lock().unwrap()
    }
}

#[async_trait]
impl Clock for FakeClock {
    fn now(&self) -> Instant {
        self.start + self.elapsed()
    }

    async fn sleep(&self, duration: Duration) {
        *self.elapsed.lock().unwrap() += duration;
    }
}

fn ok(stdout: &str) -> ExecOutput {
    ExecOutput {
        exit_code: 0,
        stdout: stdout.into(),
        stderr: String::new(),
        timed_out: false,
    }
}

#[tokio::test]
async fn watch_timeout_leaves_running_job_reported_as_still_running() {
    let tmp = scratch();
    let config = FleetConfig {
        output_dir: tmp.path().join("out"),
        artifacts: artifacts(tmp.path()),
        environments: vec![EnvironmentConfig {
            transport: TransportKind::Ssh,
            host: "env-a.example.com".into(),
            ..local_env("env-a", Path::new("/data"), vec![platform("p1", "./collect.sh")])
        }],
    };

    let mut shell = MockRemoteShell::new();
    shell.expect_exec().returning(|_, script, _| {
        Ok(if script.contains("for base in") {
            ExecOutput { exit_code: 1, ..ok("") }
        } else if script.contains(".cfi_probe_") {
            ok("/data\n")
        } else if script.contains("--version") {
            ok("cf version 8.7.0\n")
        } else if script.contains("LAUNCHED") {
            ok("LAUNCHED 4242\n")
        } else if script.contains("STATE PENDING") {
            ok("STATE RUNNING 4242\n")
        } else if script.contains("rm -rf") {
            panic!("workspace of a running job must be kept");
        } else {
            ok("/data/_run_t4\n")
        })
    });
    shell.expect_upload().returning(|_, _, _| Ok(()));
    shell.expect_download().never();

    let clock = FakeClock::new();
    let mut options = FleetOptions::new("t4");
    options.watch_timeout = Duration::from_secs(600);
    options.poll_interval = Duration::from_secs(60);

    let report = run_fleet(&shell, &clock, &config, &options).await;

    assert!(clock.elapsed() >= options.watch_timeout);
    assert_eq!(report.jobs[0].state, JobState::Running);
    assert_eq!(report.still_running(), 1);
    assert_eq!(report.jobs[0].status(), "still running");
    assert!(report.render_table().contains("still running"));
    assert_eq!(report.exit_code(), 1);
}

#[tokio::test]
async fn stalled_download_does_not_outlive_the_watch_deadline() {
    let tmp = scratch();
    let config = FleetConfig {
        output_dir: tmp.path().join("out"),
        artifacts: artifacts(tmp.path()),
        environments: vec![local_env("env-a", &tmp.path().join("remote-a"), vec![platform("p1", "exit 0")])],
    };
    let mut options = fast_options("t6");
    options.watch_timeout = Duration::from_secs(1);
    options.transfer_timeout = Duration::from_millis(500);
    let shell = Harness {
        stall_downloads: true,
        ..Default::default()
    };

    let report = tokio::time::timeout(
        Duration::from_secs(15),
        run_fleet(&shell, &SystemClock, &config, &options),
    )
    .await
    .expect("fleet run returns despite a stuck download");

    assert_eq!(report.jobs[0].state, JobState::Finished { exit_code: 0 });
    assert_eq!(report.jobs[0].outputs, None);
    assert_eq!(shell.downloads.load(Ordering::SeqCst), 1);
    assert_eq!(report.exit_code(), 0);
}

#[tokio::test]
async fn stalled_upload_fails_the_launch_with_a_timeout() {
    let tmp = scratch();
    let config = FleetConfig {
        output_dir: tmp.path().join("out"),
        artifacts: artifacts(tmp.path()),
        environments: vec![local_env("env-a", &tmp.path().join("remote-a"), vec![platform("p1", "exit 0")])],
    };
    let mut options = fast_options("t7");
    options.transfer_timeout = Duration::from_millis(300);
    let shell = Harness {
        stall_uploads: true,
        ..Default::default()
    };

    let report = tokio::time::timeout(
        Duration::from_secs(15),
        run_fleet(&shell, &SystemClock, &config, &options),
    )
    .await
    .expect("fleet run returns despite a stuck upload");

    assert!(
        matches!(&report.jobs[0].state, JobState::LaunchFailed { reason } if reason.contains(TIMEOUT_MARKER)),
        "{:?}",
        report.jobs[0].state
    );
    assert_eq!(shell.launches.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn binary_that_will_not_run_fails_with_remote_diagnostics() {
    let tmp = scratch();
    let artifacts = artifacts(tmp.path());
    write_exec(&artifacts.binary, "#!/bin/sh\necho 'cannot execute binary file' >&2\nexit 126\n");
    let config = FleetConfig {
        output_dir: tmp.path().join("out"),
        artifacts,
        environments: vec![local_env("env-a", &tmp.path().join("remote-a"), vec![platform("p1", "exit 0")])],
    };
    let shell = Harness::default();

    let report = run_fleet(&shell, &SystemClock, &config, &fast_options("t8")).await;

    let job = &report.jobs[0];
    assert!(job.done);
    let JobState::LaunchFailed { reason } = &job.state else {
        panic!("expected a launch failure, got {:?}", job.state);
    };
    assert!(reason.contains("exit 126"), "{reason}");
    assert!(reason.contains("cannot execute binary file"), "{reason}");
    assert!(reason.contains("--- remote diagnostics ---"), "{reason}");
    assert!(reason.contains("== id"), "{reason}");
    assert!(reason.contains("== mount"), "{reason}");
    assert_eq!(shell.launches.load(Ordering::SeqCst), 0);
    assert_eq!(report.exit_code(), 1);
}

fn exited(code: i32) -> ExecOutput {
    ExecOutput {
        exit_code: code,
        ..ok("")
    }
}

#[tokio::test]
async fn noexec_workdir_falls_back_to_the_home_cache() {
    let env = EnvironmentConfig {
        transport: TransportKind::Ssh,
        ..local_env("env-a", Path::new("/data/noexec"), vec![])
    };
    let probed = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&probed);
    let mut shell = MockRemoteShell::new();
    shell.expect_exec().returning(move |_, script, _| {
        Ok(if script.contains("for base in") {
            exited(1)
        } else if script.contains(".cfi_probe_") {
            let base = script.lines().next().unwrap_or("").to_string();
            seen.lock().unwrap().push(base.clone());
            if base.contains("/data/noexec") {
                exited(12)
            } else {
                ok("/home/ops/.cache/cf-inventory\n")
            }
        } else if script.starts_with("mkdir -p /home/ops/.cache/cf-inventory/_run_nx") {
            ok("/home/ops/.cache/cf-inventory/_run_nx\n")
        } else {
            panic!("unexpected script {script}")
        })
    });

    let ws = resolve_workspace(&shell, &env, "nx", Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(ws, "/home/ops/.cache/cf-inventory/_run_nx");
    let probed = probed.lock().unwrap().clone();
    assert_eq!(probed.len(), 2, "{probed:?}");
    assert!(probed[0].contains("/data/noexec"));
    assert!(probed[1].contains("$HOME"));
}

#[tokio::test]
async fn every_rejected_base_is_reported_with_its_reason() {
    let env = EnvironmentConfig {
        transport: TransportKind::Ssh,
        ..local_env("env-a", Path::new("/data/noexec"), vec![])
    };
    let mut shell = MockRemoteShell::new();
    shell.expect_exec().returning(|_, script, _| {
        Ok(if script.contains("for base in") {
            exited(1)
        } else if script.starts_with("base=/data/noexec") {
            exited(12)
        } else {
            exited(11)
        })
    });

    let err = resolve_workspace(&shell, &env, "nx", Duration::from_secs(5))
        .await
        .unwrap_err();

    let WorkspaceError::NoUsableBase { environment, tried } = &err else {
        panic!("unexpected error {err}");
    };
    assert_eq!(environment, "env-a");
    assert_eq!(
        tried[0],
        (BaseDir::Absolute("/data/noexec".into()), ProbeFailure::NoExecMount)
    );
    assert_eq!(tried.len(), 4);
    assert!(tried[1..].iter().all(|(_, why)| *why == ProbeFailure::NotWritable));
    assert!(err.to_string().contains("mounted noexec"));
    assert!(err.to_string().contains("set `workdir`"));
}

#[tokio::test]
async fn workspace_of_unreachable_job_survives_cleanup() {
    let tmp = scratch();
    let config = FleetConfig {
        output_dir: tmp.path().join("out"),
        artifacts: artifacts(tmp.path()),
        environments: vec![EnvironmentConfig {
            transport: TransportKind::Ssh,
            host: "env-a.example.com".into(),
            ..local_env("env-a", Path::new("/data"), vec![platform("p1", "./collect.sh")])
        }],
    };

    let removals = Arc::new(AtomicUsize::new(0));
    let removed = Arc::clone(&removals);
    let mut shell = MockRemoteShell::new();
    shell.expect_exec().returning(move |_, script, _| {
        Ok(if script.contains("for base in") {
            exited(1)
        } else if script.contains(".cfi_probe_") {
            ok("/data\n")
        } else if script.contains("--version") {
            ok("cf version 8.7.0\n")
        } else if script.contains("LAUNCHED") {
            ok("LAUNCHED 4242\n")
        } else if script.contains("STATE PENDING") {
            ExecOutput::timeout(Duration::from_secs(60))
        } else if script.contains("rm -rf") {
            removed.fetch_add(1, Ordering::SeqCst);
            ok("")
        } else {
            ok("/data/_run_t9\n")
        })
    });
    shell.expect_upload().returning(|_, _, _| Ok(()));
    shell.expect_download().never();

    let clock = FakeClock::new();
    let mut options = FleetOptions::new("t9");
    options.poll_interval = Duration::from_secs(60);

    let report = run_fleet(&shell, &clock, &config, &options).await;

    assert_eq!(report.jobs[0].state, JobState::Timeout);
    assert!(report.jobs[0].done);
    assert_eq!(removals.load(Ordering::SeqCst), 0, "workspace must be kept for --resume");
    assert_eq!(report.resumable(), 1);
    assert_eq!(report.exit_code(), 1);
}


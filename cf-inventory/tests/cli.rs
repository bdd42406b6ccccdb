use assert_cmd::Command;
use predicates::prelude::*;
use std::fs::{create_dir_all, write};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tempfile::TempDir;

/// Scratch area under the cargo target dir so uploaded artifacts stay executable.
fn scratch() -> TempDir {
    tempfile::Builder::new()
        .prefix("cli")
        .tempdir_in(env!("CARGO_TARGET_TMPDIR"))
        .expect("scratch dir")
}

/// A one-environment fleet run through the local shell.
fn local_fleet_config(root: &Path, command: &str) -> std::path::PathBuf {
    let artifacts = root.join("artifacts");
    create_dir_all(&artifacts).unwrap();
    for (name, body) in [
        ("cf", "#!/bin/sh\necho 'cf version 8.7.0'\n"),
        ("collect.sh", "#!/bin/sh\necho collected\n"),
    ] {
        let path = artifacts.join(name);
        write(&path, body).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    let workdir = root.join("remote");
    create_dir_all(&workdir).unwrap();

    let config = format!(
        r#"
output_dir: {out}
artifacts:
  binary: artifacts/cf
  driver: artifacts/collect.sh
environments:
  - name: lab
    transport: local
    workdir: {workdir}
    platforms:
      - name: sandbox
        command: "{command}"
"#,
        out = root.join("out").display(),
        workdir = workdir.display(),
    );
    let path = root.join("fleet.yaml");
    write(&path, config).unwrap();
    path
}

fn fleet_cmd(config: &Path, tag: &str) -> Command {
    let mut cmd = Command::cargo_bin("cf-inventory").expect("Binary exists");
    cmd.args(["fleet", "--config"])
        .arg(config)
        .args([
            "--tag",
            tag,
            "--quick-checks",
            "1",
            "--quick-delay",
            "1",
            "--poll-interval",
            "1",
            "--timeout",
            "60",
        ]);
    cmd
}

#[test]
fn help_lists_subcommands() {
    Command::cargo_bin("cf-inventory")
        .expect("Binary exists")
        .arg("--help")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("fleet")
                .and(predicate::str::contains("collect"))
                .and(predicate::str::contains("opsman")),
        );
}

#[test]
fn fleet_with_missing_config_fails() {
    Command::cargo_bin("cf-inventory")
        .expect("Binary exists")
        .args(["fleet", "--config", "/no/such/fleet.yaml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read config file"));
}

#[test]
fn resume_without_tag_is_rejected() {
    Command::cargo_bin("cf-inventory")
        .expect("Binary exists")
        .args(["fleet", "--config", "fleet.yaml", "--resume"])
        .assert()
        .failure();
}

#[test]
fn local_fleet_run_succeeds_and_writes_summary() {
    let root = scratch();
    let config = local_fleet_config(root.path(), "echo hello");

    fleet_cmd(&config, "clitest")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("sandbox").and(predicate::str::contains("finished (exit 0)")),
        );

    let summary = root.path().join("out").join("fleet-clitest.json");
    let report: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(summary).unwrap()).unwrap();
    assert_eq!(report["run_tag"], "clitest");
    assert_eq!(report["jobs"][0]["platform"], "sandbox");
    assert_eq!(report["jobs"][0]["done"], true);
}

#[test]
fn local_fleet_run_with_failing_job_exits_nonzero() {
    let root = scratch();
    let config = local_fleet_config(root.path(), "exit 3");

    fleet_cmd(&config, "clifail")
        .assert()
        .code(1)
        .stdout(predicate::str::contains("finished (exit 3)"));
}

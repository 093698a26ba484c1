//! CLI subprocess integration tests.
//!
//! These tests invoke the `berth` binary as a subprocess and verify exit
//! codes, stdout content, and JSON output.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

fn berth_bin() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_berth"));
    cmd.env_remove("BERTH_LOG");
    cmd
}

fn write_definition(dir: &Path, file: &str, replicas: u32, tag: &str) -> PathBuf {
    let path = dir.join(file);
    std::fs::write(
        &path,
        format!(
            r#"[meta]
group = "web"
name = "nginx"

[spec]
image = "nginx"
tag = "{tag}"
replicas = {replicas}
"#
        ),
    )
    .unwrap();
    path
}

fn run(args: &[&str]) -> Output {
    berth_bin().args(args).output().unwrap()
}

fn stdout_json(output: &Output) -> serde_json::Value {
    serde_json::from_slice(&output.stdout).unwrap_or_else(|e| {
        panic!(
            "stdout must be JSON ({e}): {}",
            String::from_utf8_lossy(&output.stdout)
        )
    })
}

#[test]
fn cli_version_exits_zero() {
    let output = run(&["--version"]);
    assert!(output.status.success(), "berth --version must exit 0");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("berth"), "version output: {stdout}");
}

#[test]
fn cli_help_lists_commands() {
    let output = run(&["--help"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for command in ["validate", "plan", "simulate"] {
        assert!(stdout.contains(command), "help must list '{command}'");
    }
}

#[test]
fn cli_validate_accepts_good_definition() {
    let dir = tempfile::tempdir().unwrap();
    let def = write_definition(dir.path(), "nginx.toml", 2, "1.25");

    let output = run(&["validate", &def.to_string_lossy()]);
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("web/nginx"));
    assert!(stdout.contains("replicas=2"));
}

#[test]
fn cli_validate_json_reports_digest() {
    let dir = tempfile::tempdir().unwrap();
    let def = write_definition(dir.path(), "nginx.toml", 1, "1.25");

    let output = run(&["--json", "validate", &def.to_string_lossy()]);
    assert!(output.status.success());
    let json = stdout_json(&output);
    assert_eq!(json[0]["group"], "web");
    assert_eq!(json[0]["name"], "nginx");
    assert_eq!(json[0]["digest"].as_str().unwrap().len(), 64);
}

#[test]
fn cli_validate_rejects_invalid_definition_with_exit_2() {
    let dir = tempfile::tempdir().unwrap();
    let def = write_definition(dir.path(), "nginx.toml", 0, "1.25");

    let output = run(&["validate", &def.to_string_lossy()]);
    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("definition error"), "stderr: {stderr}");
}

#[test]
fn cli_validate_missing_file_exits_2() {
    let output = run(&["validate", "/nonexistent/berth/def.toml"]);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn cli_plan_first_apply_creates_all_replicas() {
    let dir = tempfile::tempdir().unwrap();
    let def = write_definition(dir.path(), "nginx.toml", 2, "1.25");

    let output = run(&["--json", "plan", &def.to_string_lossy()]);
    assert!(output.status.success());
    let json = stdout_json(&output);
    let created: Vec<&str> = json["create"]
        .as_array()
        .unwrap()
        .iter()
        .map(|k| k["container"].as_str().unwrap())
        .collect();
    assert_eq!(created, ["web-nginx-2", "web-nginx-1"]);
    assert!(json["update"].as_array().unwrap().is_empty());
}

#[test]
fn cli_plan_scale_up_does_not_touch_survivors() {
    let dir = tempfile::tempdir().unwrap();
    let previous = write_definition(dir.path(), "old.toml", 2, "1.25");
    let next = write_definition(dir.path(), "new.toml", 3, "1.25");

    let output = run(&[
        "--json",
        "plan",
        &next.to_string_lossy(),
        "--previous",
        &previous.to_string_lossy(),
    ]);
    assert!(output.status.success());
    let json = stdout_json(&output);
    assert_eq!(json["replica_only"], true);
    assert_eq!(json["create"].as_array().unwrap().len(), 1);
    assert_eq!(json["create"][0]["container"], "web-nginx-3");
    assert!(json["update"].as_array().unwrap().is_empty());
}

#[test]
fn cli_plan_spec_change_updates_survivors_and_destroys_extras() {
    let dir = tempfile::tempdir().unwrap();
    let previous = write_definition(dir.path(), "old.toml", 3, "1.25");
    let next = write_definition(dir.path(), "new.toml", 2, "1.27");

    let output = run(&[
        "plan",
        &next.to_string_lossy(),
        "--previous",
        &previous.to_string_lossy(),
    ]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("spec.tag"), "stdout: {stdout}");
    assert!(stdout.contains("update   web/web-nginx-1"), "stdout: {stdout}");
    assert!(stdout.contains("destroy  web/web-nginx-3"), "stdout: {stdout}");
}

#[test]
fn cli_plan_rejects_previous_of_another_family() {
    let dir = tempfile::tempdir().unwrap();
    let next = write_definition(dir.path(), "new.toml", 1, "1.25");
    let other = dir.path().join("other.toml");
    std::fs::write(
        &other,
        "[meta]\ngroup = \"db\"\nname = \"pg\"\n[spec]\nimage = \"postgres\"\n",
    )
    .unwrap();

    let output = run(&[
        "plan",
        &next.to_string_lossy(),
        "--previous",
        &other.to_string_lossy(),
    ]);
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn cli_simulate_converges_with_mock_engine() {
    let dir = tempfile::tempdir().unwrap();
    let def = write_definition(dir.path(), "nginx.toml", 2, "1.25");

    let output = run(&[
        "--json",
        "simulate",
        &def.to_string_lossy(),
        "--assume-ready",
        "--timeout",
        "10",
    ]);
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let json = stdout_json(&output);
    assert_eq!(json["converged"], true);
    assert_eq!(json["containers"].as_array().unwrap().len(), 2);
    assert_eq!(json["containers"][0]["state"], "running");
    assert_eq!(json["runs"]["web-nginx-1"], 1);
}

#[test]
fn cli_simulate_reports_crash_loop_as_backoff() {
    let dir = tempfile::tempdir().unwrap();
    let def = write_definition(dir.path(), "nginx.toml", 1, "1.25");

    let output = run(&[
        "--json",
        "simulate",
        &def.to_string_lossy(),
        "--assume-ready",
        "--crash",
        "web-nginx-1",
        "--timeout",
        "10",
    ]);
    assert_eq!(output.status.code(), Some(1));
    let json = stdout_json(&output);
    assert_eq!(json["converged"], false);
    assert_eq!(json["containers"][0]["state"], "backoff");
    assert_eq!(json["runs"]["web-nginx-1"], 6);
}

#[test]
fn cli_simulate_resolves_template_values() {
    let dir = tempfile::tempdir().unwrap();
    let def = dir.path().join("api.toml");
    std::fs::write(
        &def,
        r#"[meta]
group = "app"
name = "api"

[spec]
image = "api"

[spec.configuration]
dsn = "postgres://app:{{ secret.db.pg.password }}@db"
"#,
    )
    .unwrap();
    let def = def.to_string_lossy();

    let output = run(&["--json", "simulate", &def, "--assume-ready"]);
    assert_eq!(output.status.code(), Some(1));
    let json = stdout_json(&output);
    assert_eq!(json["containers"][0]["state"], "invalid_configuration");

    let output = run(&[
        "--json",
        "simulate",
        &def,
        "--assume-ready",
        "--value",
        "secret.db.pg.password=hunter2",
    ]);
    assert!(output.status.success());
    let json = stdout_json(&output);
    assert_eq!(
        json["containers"][0]["configuration"]["dsn"],
        "postgres://app:hunter2@db"
    );
}

#[test]
fn cli_simulate_invalid_definition_exits_2() {
    let dir = tempfile::tempdir().unwrap();
    let def = write_definition(dir.path(), "nginx.toml", 0, "1.25");

    let output = run(&["simulate", &def.to_string_lossy()]);
    assert_eq!(output.status.code(), Some(2));
}

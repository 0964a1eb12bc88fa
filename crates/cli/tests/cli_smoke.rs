//! CLI smoke tests for strata.
//!
//! These run the binary against small ensembles in a temp directory and check
//! exit codes and the key lines of output.

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use tempfile::TempDir;

fn strata_cmd(state_dir: &Path) -> Command {
  let mut cmd = cargo_bin_cmd!("strata");
  cmd.env("STRATA_STATE_DIR", state_dir).env_remove("STRATA_LOG");
  cmd
}

fn write(dir: &TempDir, name: &str, content: &str) -> PathBuf {
  let path = dir.path().join(name);
  std::fs::write(&path, content).unwrap();
  path
}

const PROJECT: &str = r#"
engine:
  parallelism: 2
environment:
  GREETING: hello
"#;

const ENSEMBLE: &str = r#"
types:
  Org:
    properties:
      organization_id: {type: integer}
  Server:
    properties:
      port: {default: 8080}
    attributes:
      organization_id: {default: {eval: ".parent::.ancestors::organization_id"}}
    interfaces:
      Standard:
        configure:
          implementation: shell
          inputs:
            command: 'echo "$GREETING {{ .name }}"'
node_templates:
  org:
    type: Org
    properties: {organization_id: 42}
  web:
    type: Server
    parent: org
"#;

// =============================================================================
// Help & Version
// =============================================================================

#[test]
fn help_flag_works() {
  let temp = TempDir::new().unwrap();
  strata_cmd(temp.path())
    .arg("--help")
    .assert()
    .success()
    .stdout(predicate::str::contains("Usage"));
}

#[test]
fn version_flag_works() {
  let temp = TempDir::new().unwrap();
  strata_cmd(temp.path())
    .arg("--version")
    .assert()
    .success()
    .stdout(predicate::str::contains("strata"));
}

#[test]
fn subcommand_help_works() {
  let temp = TempDir::new().unwrap();
  for cmd in &["merge", "eval", "plan", "deploy", "undeploy", "check", "discover", "state"] {
    strata_cmd(temp.path())
      .arg(cmd)
      .arg("--help")
      .assert()
      .success()
      .stdout(predicate::str::contains("Usage"));
  }
}

// =============================================================================
// Commands
// =============================================================================

#[test]
fn merge_prints_layered_document() {
  let temp = TempDir::new().unwrap();
  let project = write(&temp, "project.yaml", PROJECT);
  let ensemble = write(&temp, "ensemble.yaml", ENSEMBLE);
  strata_cmd(&temp.path().join("state"))
    .arg("merge")
    .arg(&project)
    .arg(&ensemble)
    .assert()
    .success()
    .stdout(predicate::str::contains("parallelism: 2"))
    .stdout(predicate::str::contains("node_templates:"));
}

#[test]
fn eval_resolves_defaults_through_ancestors() {
  let temp = TempDir::new().unwrap();
  let ensemble = write(&temp, "ensemble.yaml", ENSEMBLE);
  strata_cmd(&temp.path().join("state"))
    .args(["eval", "--instance", "web", "--expr", "organization_id", "-o", "text"])
    .arg(&ensemble)
    .assert()
    .success()
    .stdout(predicate::str::diff("42\n"));
}

#[test]
fn eval_unknown_instance_fails() {
  let temp = TempDir::new().unwrap();
  let ensemble = write(&temp, "ensemble.yaml", ENSEMBLE);
  strata_cmd(&temp.path().join("state"))
    .args(["eval", "--instance", "nope", "--expr", ".name"])
    .arg(&ensemble)
    .assert()
    .failure()
    .stderr(predicate::str::contains("Unknown instance"));
}

#[test]
fn plan_lists_operations() {
  let temp = TempDir::new().unwrap();
  let ensemble = write(&temp, "ensemble.yaml", ENSEMBLE);
  strata_cmd(&temp.path().join("state"))
    .arg("plan")
    .arg(&ensemble)
    .assert()
    .success()
    .stdout(predicate::str::contains("web configure"));
}

#[cfg(unix)]
#[test]
fn deploy_runs_shell_and_saves_state() {
  let temp = TempDir::new().unwrap();
  let state_dir = temp.path().join("state");
  let project = write(&temp, "project.yaml", PROJECT);
  let ensemble = write(&temp, "ensemble.yaml", ENSEMBLE);

  strata_cmd(&state_dir)
    .arg("deploy")
    .arg(&project)
    .arg(&ensemble)
    .assert()
    .success()
    .stdout(predicate::str::contains("web started"));

  assert!(state_dir.join("index.json").exists());

  strata_cmd(&state_dir)
    .args(["state", "list"])
    .assert()
    .success()
    .stdout(predicate::str::contains("deploy"));

  strata_cmd(&state_dir)
    .args(["state", "show"])
    .assert()
    .success()
    .stdout(predicate::str::contains("readyState: started"));
}

#[cfg(unix)]
#[test]
fn failing_command_fails_the_run() {
  let temp = TempDir::new().unwrap();
  let ensemble = write(
    &temp,
    "ensemble.yaml",
    r#"
types:
  Broken:
    interfaces:
      Standard:
        configure: {implementation: shell, inputs: {command: 'exit 7'}}
node_templates:
  broken: {type: Broken}
"#,
  );
  strata_cmd(&temp.path().join("state"))
    .args(["deploy", "--no-save"])
    .arg(&ensemble)
    .assert()
    .failure()
    .stderr(predicate::str::contains("failed"));
}

#[cfg(unix)]
#[test]
fn state_diff_shows_changes_between_passes() {
  let temp = TempDir::new().unwrap();
  let state_dir = temp.path().join("state");
  let project = write(&temp, "project.yaml", PROJECT);
  let ensemble = write(&temp, "ensemble.yaml", ENSEMBLE);

  for _ in 0..2 {
    strata_cmd(&state_dir)
      .arg("deploy")
      .arg(&project)
      .arg(&ensemble)
      .assert()
      .success();
  }

  let index: serde_json::Value =
    serde_json::from_str(&std::fs::read_to_string(state_dir.join("index.json")).unwrap()).unwrap();
  let current = index["current"].as_str().unwrap();
  let previous = index["snapshots"]
    .as_array()
    .unwrap()
    .iter()
    .filter_map(|s| s["id"].as_str())
    .find(|id| *id != current)
    .unwrap()
    .to_string();

  strata_cmd(&state_dir)
    .args(["state", "diff", &previous])
    .assert()
    .success()
    .stdout(predicate::str::contains("last_change").and(predicate::str::contains("2:1")));
}

#[test]
fn state_show_without_state_fails() {
  let temp = TempDir::new().unwrap();
  strata_cmd(&temp.path().join("state"))
    .args(["state", "show"])
    .assert()
    .failure()
    .stderr(predicate::str::contains("No current state"));
}

#[test]
fn missing_file_reports_error() {
  let temp = TempDir::new().unwrap();
  strata_cmd(&temp.path().join("state"))
    .args(["merge", "/nonexistent/ensemble.yaml"])
    .assert()
    .failure()
    .stderr(predicate::str::contains("Failed to load ensemble"));
}

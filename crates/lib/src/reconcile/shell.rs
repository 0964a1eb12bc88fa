//! Shell configurator.
//!
//! Runs the `command` input through `/bin/sh -c` with an environment made of
//! exactly the invocation's environment plus the `env` input. Recognised
//! inputs:
//!
//! - `command` (required): the command line.
//! - `env`: extra environment variables.
//! - `cwd`: working directory.
//! - `shell`: alternative shell binary.
//! - `result`: `yaml` or `json` to read stdout as a result document.
//! - `readyState`: state to report on success when stdout is not a result.
//!
//! A non-zero exit is an execution failure carrying stdout, stderr and the
//! exit code.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use super::configurator::Configurator;
use super::types::{ExecutionError, Invocation, ResultDocument};
use crate::graph::ReadyState;
use crate::value::{Mapping, Value};

/// Runs an operation's `command` input through a shell; stdout is read as a
/// result document when the `result` input asks for it.
#[derive(Debug, Clone, Default)]
pub struct ShellConfigurator {
  /// Shell used when the invocation does not name one.
  pub shell: Option<String>,
}

#[async_trait]
impl Configurator for ShellConfigurator {
  async fn run(&self, invocation: &Invocation) -> Result<ResultDocument, ExecutionError> {
    let inputs = &invocation.inputs;
    let command_line = inputs
      .get("command")
      .map(Value::to_text)
      .filter(|c| !c.is_empty())
      .ok_or_else(|| ExecutionError::new("shell: missing 'command' input"))?;

    let override_shell = inputs.get("shell").and_then(Value::as_str).or(self.shell.as_deref());
    let (shell, shell_args) = get_shell(override_shell);

    info!(instance = %invocation.instance, operation = %invocation.operation, cmd = %command_line, "executing command");

    let mut command = Command::new(&shell);
    command
      .args(&shell_args)
      .arg(&command_line)
      .env_clear()
      .envs(&invocation.environment)
      .kill_on_drop(true);
    if let Some(Value::Map(extra)) = inputs.get("env") {
      for (key, value) in extra {
        if !value.is_null() {
          command.env(key, value.to_text());
        }
      }
    }
    if let Some(cwd) = inputs.get("cwd").and_then(Value::as_str) {
      command.current_dir(cwd);
    }

    debug!(shell = %shell, "spawning process");
    let output = command
      .output()
      .await
      .map_err(|e| ExecutionError::new(format!("failed to spawn {shell}: {e}")))?;

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let code = output.status.code();

    if !output.status.success() {
      if !stderr.is_empty() {
        debug!(stderr = %stderr, "command stderr");
      }
      return Err(ExecutionError {
        message: match code {
          Some(code) => format!("command exited with status {code}"),
          None => "command terminated by signal".to_string(),
        },
        stdout,
        stderr,
        exit_code: code,
      });
    }

    let mut raw = Mapping::new();
    raw.insert("stdout".to_string(), Value::from(stdout.clone()));
    raw.insert("stderr".to_string(), Value::from(stderr));
    raw.insert("returncode".to_string(), code.map(Value::from).unwrap_or_default());

    let mut result = match inputs.get("result").and_then(Value::as_str) {
      Some("yaml") => parse_result(Value::parse_yaml(&stdout).map_err(|e| e.to_string()), &stdout)?,
      Some("json") => parse_result(
        serde_json::from_str::<Value>(&stdout).map_err(|e| e.to_string()),
        &stdout,
      )?,
      Some(other) if other != "none" => {
        return Err(ExecutionError::new(format!("shell: unknown result format '{other}'")));
      }
      _ => ResultDocument::ok(),
    };
    if result.ready_state.is_none()
      && let Some(state) = inputs.get("readyState").and_then(Value::as_str)
    {
      result.ready_state = ReadyState::parse(state);
    }
    if let Value::Map(parsed) = std::mem::take(&mut result.raw) {
      raw.insert("result".to_string(), Value::Map(parsed));
    }
    result.raw = Value::Map(raw);
    Ok(result)
  }
}

fn parse_result(parsed: Result<Value, String>, stdout: &str) -> Result<ResultDocument, ExecutionError> {
  let bad = |message: String| ExecutionError {
    message: format!("shell: unreadable result: {message}"),
    stdout: stdout.to_string(),
    stderr: String::new(),
    exit_code: Some(0),
  };
  let value = parsed.map_err(bad)?;
  ResultDocument::from_value(&value).map_err(bad)
}

fn get_shell(override_shell: Option<&str>) -> (String, Vec<String>) {
  match override_shell {
    Some(shell) => (shell.to_string(), vec!["-c".to_string()]),
    None => ("/bin/sh".to_string(), vec!["-c".to_string()]),
  }
}

#[cfg(all(test, unix))]
mod tests {
  use std::collections::BTreeMap;

  use super::*;
  use crate::graph::InstanceId;
  use crate::reconcile::types::Operation;

  fn invocation(inputs: &str) -> Invocation {
    let inputs = match Value::parse_yaml(inputs).unwrap() {
      Value::Map(m) => m,
      _ => panic!("mapping"),
    };
    Invocation {
      instance: InstanceId::new("web"),
      instance_name: "web".to_string(),
      type_name: "App".to_string(),
      operation: Operation::Configure,
      implementation: "shell".to_string(),
      inputs,
      environment: BTreeMap::from([
        ("PATH".to_string(), "/usr/bin:/bin".to_string()),
        ("MODE".to_string(), "prod".to_string()),
      ]),
      timeout: None,
    }
  }

  #[tokio::test]
  async fn execute_simple_command() {
    let result = ShellConfigurator::default()
      .run(&invocation("command: echo hello"))
      .await
      .unwrap();
    assert!(result.success);
    assert_eq!(result.raw.get("stdout"), Some(&Value::from("hello")));
    assert_eq!(result.raw.get("returncode"), Some(&Value::Int(0)));
  }

  #[test]
  #[serial_test::serial]
  fn environment_is_exactly_the_invocation_environment() {
    temp_env::with_var("STRATA_LEAK", Some("1"), || {
      let runtime = tokio::runtime::Runtime::new().unwrap();
      let result = runtime
        .block_on(
          ShellConfigurator::default().run(&invocation("command: echo \"$MODE-$EXTRA-${STRATA_LEAK:-none}\"\nenv: {EXTRA: x}")),
        )
        .unwrap();
      assert_eq!(result.raw.get("stdout"), Some(&Value::from("prod-x-none")));
    });
  }

  #[tokio::test]
  async fn nonzero_exit_is_execution_error() {
    let err = ShellConfigurator::default()
      .run(&invocation("command: echo oops >&2; exit 3"))
      .await
      .unwrap_err();
    assert_eq!(err.exit_code, Some(3));
    assert_eq!(err.stderr, "oops");
  }

  #[tokio::test]
  async fn stdout_as_result_document() {
    let result = ShellConfigurator::default()
      .run(&invocation(
        "command: 'printf \"readyState: degraded\\nattributes: {ip: 10.0.0.5}\\n\"'\nresult: yaml",
      ))
      .await
      .unwrap();
    assert_eq!(result.ready_state, Some(ReadyState::Degraded));
    assert_eq!(result.attributes["ip"], Value::from("10.0.0.5"));
  }

  #[tokio::test]
  async fn ready_state_input_applies_on_success() {
    let result = ShellConfigurator::default()
      .run(&invocation("command: 'true'\nreadyState: stopped"))
      .await
      .unwrap();
    assert_eq!(result.ready_state, Some(ReadyState::Stopped));
  }

  #[tokio::test]
  async fn missing_command_fails() {
    assert!(ShellConfigurator::default().run(&invocation("env: {}")).await.is_err());
  }
}

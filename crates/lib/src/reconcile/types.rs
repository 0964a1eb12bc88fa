//! Types shared by the reconciliation driver and configurators.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::eval::EvalError;
use crate::graph::{GraphError, InstanceId, ReadyState, Status};
use crate::value::{Mapping, Value};

/// A lifecycle operation declared by a type's interfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
  /// Read the instance's current state without changing it.
  Check,
  /// Report the instance's state and the child instances it can see.
  Discover,
  Create,
  Configure,
  Start,
  Stop,
  /// Tear the instance down. A successful delete leaves a tombstone.
  Delete,
}

impl Operation {
  pub fn as_str(self) -> &'static str {
    match self {
      Operation::Check => "check",
      Operation::Discover => "discover",
      Operation::Create => "create",
      Operation::Configure => "configure",
      Operation::Start => "start",
      Operation::Stop => "stop",
      Operation::Delete => "delete",
    }
  }

  /// Operations with side effects on the target system.
  pub fn is_mutating(self) -> bool {
    !matches!(self, Operation::Check | Operation::Discover)
  }
}

impl fmt::Display for Operation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// What a reconciliation pass is trying to achieve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Workflow {
  /// `create`, `configure` and `start` in dependency order. Instances in the
  /// `unknown` state are checked first.
  Deploy,
  /// `stop` and `delete`, dependents first.
  Undeploy,
  /// `check` every instance that declares it.
  Check,
  /// `discover` every instance that declares it.
  Discover,
}

impl Workflow {
  /// Candidate operations per instance, in invocation order.
  pub fn operations(self) -> &'static [Operation] {
    match self {
      Workflow::Deploy => &[Operation::Check, Operation::Create, Operation::Configure, Operation::Start],
      Workflow::Undeploy => &[Operation::Stop, Operation::Delete],
      Workflow::Check => &[Operation::Check],
      Workflow::Discover => &[Operation::Discover],
    }
  }

  /// Dependents go first when tearing down.
  pub fn is_reverse(self) -> bool {
    self == Workflow::Undeploy
  }
}

impl fmt::Display for Workflow {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Workflow::Deploy => "deploy",
      Workflow::Undeploy => "undeploy",
      Workflow::Check => "check",
      Workflow::Discover => "discover",
    };
    f.write_str(name)
  }
}

/// Everything a configurator gets to run one operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
  pub instance: InstanceId,
  pub instance_name: String,
  /// Declared type of the instance, not the type the operation came from.
  pub type_name: String,
  pub operation: Operation,
  /// Configurator name from the operation's `implementation`.
  pub implementation: String,
  /// Operation inputs with every expression resolved.
  pub inputs: Mapping,
  /// Environment after the `environment:` rules were applied.
  pub environment: BTreeMap<String, String>,
  /// Deadline for one attempt; `None` waits forever.
  pub timeout: Option<Duration>,
}

/// An instance reported by a configurator, usually during `discover`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewInstance {
  pub name: String,
  /// Defaults to the instance whose operation reported it.
  pub parent: Option<String>,
  /// A `node_templates` entry body (`type`, `properties`, `attributes`, ...).
  #[serde(default)]
  pub template: Mapping,
  #[serde(default, rename = "readyState")]
  pub ready_state: Option<ReadyState>,
}

/// What a configurator reports back.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResultDocument {
  /// `false` fails the operation even though the configurator ran.
  pub success: bool,
  /// Takes precedence over `upstream_status`.
  pub ready_state: Option<ReadyState>,
  /// Tool-specific status string, translated through the operation's status map.
  pub upstream_status: Option<String>,
  /// Patch merged onto the instance's attributes; merge directives apply.
  pub attributes: Mapping,
  /// `None` when the configurator did not report instances at all.
  pub new_instances: Option<Vec<NewInstance>>,
  /// Opaque diagnostics.
  pub raw: Value,
}

impl ResultDocument {
  /// A successful result that reports nothing else.
  pub fn ok() -> Self {
    Self {
      success: true,
      ..Default::default()
    }
  }

  pub fn failed() -> Self {
    Self::default()
  }

  pub fn with_ready_state(mut self, state: ReadyState) -> Self {
    self.ready_state = Some(state);
    self
  }

  pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
    self.attributes.insert(name.into(), value.into());
    self
  }

  pub fn with_instance(mut self, instance: NewInstance) -> Self {
    self.new_instances.get_or_insert_with(Vec::new).push(instance);
    self
  }

  /// Read a result written as a mapping:
  ///
  /// ```yaml
  /// success: true          # optional, defaults to true
  /// readyState: started    # or `status: <upstream status>`
  /// attributes: {...}
  /// instances:
  ///   - {name: db, parent: cluster, template: {type: Database}}
  /// ```
  pub fn from_value(value: &Value) -> Result<Self, String> {
    let Value::Map(map) = value else {
      return Err(format!("result must be a mapping, found {}", value.type_name()));
    };
    let ready_state = match map.get("readyState") {
      Some(Value::String(s)) => Some(ReadyState::parse(s).ok_or_else(|| format!("unknown readyState '{s}'"))?),
      Some(Value::Null) | None => None,
      Some(other) => return Err(format!("readyState must be a string, found {}", other.type_name())),
    };
    let new_instances = match map.get("instances") {
      Some(list) => {
        let json = serde_json::to_value(list).map_err(|e| e.to_string())?;
        Some(serde_json::from_value(json).map_err(|e| format!("invalid instances: {e}"))?)
      }
      None => None,
    };
    Ok(Self {
      success: map.get("success").and_then(Value::as_bool).unwrap_or(true),
      ready_state,
      upstream_status: map.get("status").map(Value::to_text),
      attributes: map.get("attributes").and_then(Value::as_map).cloned().unwrap_or_default(),
      new_instances,
      raw: value.clone(),
    })
  }
}

/// A configurator could not run the operation: the process failed to start,
/// exited non-zero, or the transport broke.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct ExecutionError {
  pub message: String,
  /// Captured output, empty for configurators that do not run a process.
  pub stdout: String,
  pub stderr: String,
  /// `None` when the process was killed or never started.
  pub exit_code: Option<i32>,
}

impl ExecutionError {
  pub fn new(message: impl Into<String>) -> Self {
    Self {
      message: message.into(),
      stdout: String::new(),
      stderr: String::new(),
      exit_code: None,
    }
  }
}

/// A problem running an instance, or one that stops a whole pass.
///
/// Only [`ReconcileError::Graph`] is ever returned from a pass; the rest end up
/// as strings in an [`InstanceReport`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReconcileError {
  /// Requirement cycle or an inconsistent graph.
  #[error(transparent)]
  Graph(#[from] GraphError),

  /// An input expression could not be resolved.
  #[error("{instance}: {source}")]
  Evaluation {
    instance: String,
    #[source]
    source: EvalError,
  },

  /// The configurator failed on every attempt.
  #[error("{instance}: {operation} failed: {source}")]
  Execution {
    instance: String,
    operation: Operation,
    #[source]
    source: ExecutionError,
  },

  #[error("{instance}: {operation} timed out after {secs}s")]
  Timeout {
    instance: String,
    operation: Operation,
    secs: u64,
  },

  /// The configurator ran but reported `error`; the instance is degraded.
  #[error("{instance}: {operation} reported an error state")]
  ReportedDegradedState {
    instance: String,
    operation: Operation,
    upstream: Option<String>,
  },

  #[error("{instance}: {operation} reported failure")]
  OperationFailed { instance: String, operation: Operation },

  #[error("{instance}: cannot {operation} while {state}")]
  InvalidTransition {
    instance: String,
    operation: Operation,
    state: ReadyState,
  },

  #[error("{instance}: no configurator named '{name}'")]
  UnknownConfigurator { instance: String, name: String },

  /// A dependency failed or was blocked itself.
  #[error("{instance}: blocked by '{dependency}'")]
  Blocked { instance: String, dependency: String },

  #[error("pass cancelled")]
  Cancelled,
}

/// Pass-level cancellation, checked between instance operations.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn cancel(&self) {
    self.0.store(true, Ordering::SeqCst);
  }

  pub fn is_cancelled(&self) -> bool {
    self.0.load(Ordering::SeqCst)
  }
}

/// How an instance fared in a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
  /// Every operation ran and reported success.
  Ok,
  /// Ran, but reported an error state.
  Degraded,
  /// An operation failed, timed out, or could not be prepared.
  Failed,
  /// A dependency failed or a requirement could not be satisfied.
  Blocked,
  /// Nothing to do, or its result was superseded by a discover that removed
  /// or tombstoned it earlier in the same wave.
  Skipped,
  /// Never started because the pass was cancelled.
  Cancelled,
}

/// How one instance fared, with its state after the commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceReport {
  pub instance: InstanceId,
  /// Operations that were attempted, in order.
  pub operations: Vec<Operation>,
  pub outcome: Outcome,
  #[serde(rename = "readyState")]
  pub ready_state: ReadyState,
  /// Own state combined with the state of everything it requires.
  pub status: Status,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub errors: Vec<String>,
  #[serde(default)]
  pub discovered: bool,
  /// Deleted but kept as a tombstone.
  #[serde(default)]
  pub deleted: bool,
  /// `<pass>:<n>` of the last committed change.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub last_change: Option<String>,
}

/// Per-instance results of one pass, in reconciliation order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassReport {
  /// Number used in this pass's change ids.
  pub pass: u64,
  pub workflow: Workflow,
  pub cancelled: bool,
  pub instances: Vec<InstanceReport>,
}

impl PassReport {
  /// Report for the instance named `name`.
  pub fn get(&self, name: &str) -> Option<&InstanceReport> {
    self.instances.iter().find(|r| r.instance.as_str() == name)
  }

  pub fn count(&self, outcome: Outcome) -> usize {
    self.instances.iter().filter(|r| r.outcome == outcome).count()
  }

  /// No instance failed, was blocked or was cancelled.
  pub fn is_success(&self) -> bool {
    !self.cancelled
      && self
        .instances
        .iter()
        .all(|r| matches!(r.outcome, Outcome::Ok | Outcome::Skipped | Outcome::Degraded))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn result_document_from_mapping() {
    let value = Value::parse_yaml(
      "readyState: started\nattributes: {ip: 10.0.0.1}\ninstances:\n  - {name: db, parent: vm, template: {type: Database}}\n",
    )
    .unwrap();
    let doc = ResultDocument::from_value(&value).unwrap();
    assert!(doc.success);
    assert_eq!(doc.ready_state, Some(ReadyState::Started));
    assert_eq!(doc.attributes["ip"], Value::from("10.0.0.1"));
    let instances = doc.new_instances.unwrap();
    assert_eq!(instances[0].name, "db");
    assert_eq!(instances[0].parent.as_deref(), Some("vm"));
  }

  #[test]
  fn result_document_rejects_garbage() {
    assert!(ResultDocument::from_value(&Value::from("nope")).is_err());
    assert!(ResultDocument::from_value(&Value::parse_yaml("readyState: sideways").unwrap()).is_err());
  }

  #[test]
  fn workflows_order_operations() {
    assert_eq!(
      Workflow::Deploy.operations(),
      &[Operation::Check, Operation::Create, Operation::Configure, Operation::Start]
    );
    assert!(Workflow::Undeploy.is_reverse());
    assert!(!Operation::Check.is_mutating());
    assert!(Operation::Delete.is_mutating());
  }

  #[test]
  fn cancel_token_is_shared() {
    let token = CancelToken::new();
    let clone = token.clone();
    clone.cancel();
    assert!(token.is_cancelled());
  }
}

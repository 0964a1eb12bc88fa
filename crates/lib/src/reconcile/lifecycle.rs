//! Per-instance lifecycle rules.
//!
//! ```text
//! absent -> pending -> creating|configuring -> started|stopped|degraded|error
//!        -> deleting -> deleted
//! ```
//!
//! Which operations run for a workflow depends on what the type declares
//! and where the instance currently is. Deploy checks an instance first only
//! when its state is unknown; whatever the check reports decides which of the
//! remaining operations still run.

use super::types::{Operation, Workflow};
use crate::graph::{ReadyState, TypeSchema};

/// Whether an operation may run from a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
  Run,
  /// Already where the operation would take it.
  Skip,
  Invalid,
}

/// Declared operations to run for `workflow`, in order.
pub fn plan(workflow: Workflow, schema: &TypeSchema, state: ReadyState) -> Vec<Operation> {
  workflow
    .operations()
    .iter()
    .copied()
    .filter(|op| schema.operations.contains_key(op.as_str()))
    .filter(|op| transition(*op, state) == Transition::Run)
    .filter(|op| needed(workflow, *op, state))
    .collect()
}

fn needed(workflow: Workflow, op: Operation, state: ReadyState) -> bool {
  match (workflow, op) {
    (Workflow::Deploy, Operation::Check) => state == ReadyState::Unknown,
    _ => true,
  }
}

pub fn transition(op: Operation, state: ReadyState) -> Transition {
  use ReadyState::*;
  match (op, state) {
    (Operation::Check | Operation::Discover, _) => Transition::Run,
    (Operation::Delete, Deleted | Absent) => Transition::Skip,
    (Operation::Delete, Deleting) => Transition::Invalid,
    (Operation::Delete, _) => Transition::Run,
    (Operation::Stop, Stopped | Deleted | Absent | Initial) => Transition::Skip,
    (_, Deleting) => Transition::Invalid,
    // Already exists: nothing to create.
    (Operation::Create, s) if s.is_present() && s != Pending => Transition::Skip,
    _ => Transition::Run,
  }
}

/// State while `op` is in flight, if it has one.
pub fn in_progress(op: Operation) -> Option<ReadyState> {
  match op {
    Operation::Create => Some(ReadyState::Creating),
    Operation::Configure => Some(ReadyState::Configuring),
    Operation::Delete => Some(ReadyState::Deleting),
    _ => None,
  }
}

/// State after `op` succeeded without reporting one.
pub fn settled(op: Operation, current: ReadyState) -> ReadyState {
  match op {
    Operation::Create | Operation::Configure | Operation::Start => ReadyState::Started,
    Operation::Stop => ReadyState::Stopped,
    Operation::Delete => ReadyState::Deleted,
    Operation::Check | Operation::Discover => current,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::graph::schema::OperationDef;

  fn schema(ops: &[&str]) -> TypeSchema {
    let mut schema = TypeSchema::default();
    for op in ops {
      schema.operations.insert(op.to_string(), OperationDef::default());
    }
    schema
  }

  #[test]
  fn deploy_runs_declared_operations_only() {
    let s = schema(&["configure", "delete"]);
    assert_eq!(plan(Workflow::Deploy, &s, ReadyState::Initial), vec![Operation::Configure]);
    assert_eq!(plan(Workflow::Undeploy, &s, ReadyState::Started), vec![Operation::Delete]);
  }

  #[test]
  fn create_skipped_once_present() {
    let s = schema(&["create", "configure"]);
    assert_eq!(
      plan(Workflow::Deploy, &s, ReadyState::Started),
      vec![Operation::Configure]
    );
    assert_eq!(
      plan(Workflow::Deploy, &s, ReadyState::Absent),
      vec![Operation::Create, Operation::Configure]
    );
  }

  #[test]
  fn deploy_checks_unknown_instances_first() {
    let s = schema(&["check", "create", "configure"]);
    assert_eq!(
      plan(Workflow::Deploy, &s, ReadyState::Unknown),
      vec![Operation::Check, Operation::Create, Operation::Configure]
    );
    assert_eq!(
      plan(Workflow::Deploy, &s, ReadyState::Initial),
      vec![Operation::Create, Operation::Configure]
    );
    assert_eq!(plan(Workflow::Check, &s, ReadyState::Started), vec![Operation::Check]);
  }

  #[test]
  fn delete_transitions() {
    assert_eq!(transition(Operation::Delete, ReadyState::Deleted), Transition::Skip);
    assert_eq!(transition(Operation::Delete, ReadyState::Deleting), Transition::Invalid);
    assert_eq!(transition(Operation::Configure, ReadyState::Deleting), Transition::Invalid);
    assert_eq!(transition(Operation::Delete, ReadyState::Error), Transition::Run);
  }

  #[test]
  fn settled_states() {
    assert_eq!(settled(Operation::Create, ReadyState::Creating), ReadyState::Started);
    assert_eq!(settled(Operation::Stop, ReadyState::Started), ReadyState::Stopped);
    assert_eq!(settled(Operation::Check, ReadyState::Degraded), ReadyState::Degraded);
  }
}

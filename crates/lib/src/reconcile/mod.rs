//! Reconciliation: running configurators against the instance graph.
//!
//! The [`Reconciler`] walks the graph in dependency waves and asks a
//! [`Configurator`] to carry out each operation a workflow calls for, then
//! records what the configurator reported back onto the graph.

pub mod configurator;
pub mod driver;
pub mod lifecycle;
pub mod shell;
pub mod status;
pub mod types;

pub use configurator::{Configurator, Configurators};
pub use driver::{Reconciler, resolve_inputs};
pub use shell::ShellConfigurator;
pub use status::StatusMap;
pub use types::{
  CancelToken, ExecutionError, InstanceReport, Invocation, NewInstance, Operation, Outcome, PassReport, ReconcileError,
  ResultDocument, Workflow,
};

//! Instance graph: typed instances, parent/child links and requirement
//! relationships.

pub mod dag;
pub mod instance;
pub mod schema;
pub mod store;
pub mod topology;

use thiserror::Error;

pub use dag::DependencyDag;
pub use instance::{Instance, InstanceId, InstanceKind, Occurrences, ReadyState, RequirementAssignment, Status};
pub use schema::{SchemaLookup, StaticSchema, TypeSchema};
pub use store::{GraphStore, NodeTemplate};
pub use topology::{from_document, parse_template, to_state_document};

/// Problems building, linking or querying the instance graph.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum GraphError {
  #[error("unknown type '{0}'")]
  UnknownType(String),

  #[error("type '{0}' derives from itself")]
  CyclicType(String),

  #[error("instance '{0}' already exists")]
  DuplicateInstance(String),

  #[error("unknown instance '{0}'")]
  UnknownInstance(String),

  #[error("'{0}' is not a node instance")]
  NotANode(String),

  #[error("requirement '{requirement}' of '{instance}' could not be satisfied")]
  UnsatisfiedRequirement { instance: String, requirement: String },

  #[error("capability '{capability}' of type '{capability_type}' does not satisfy '{required}'")]
  IncompatibleCapability {
    capability: String,
    capability_type: String,
    required: String,
  },

  #[error("dependency cycle between: {}", instances.join(", "))]
  CyclicDependency { instances: Vec<String> },

  #[error("invalid template '{name}': {message}")]
  InvalidTemplate { name: String, message: String },
}

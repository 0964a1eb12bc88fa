//! Instance records held by the graph store.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::value::{Mapping, Value};

/// Stable identifier of an instance.
///
/// Nodes use their template name. Capabilities are `node:capability` and
/// relationships are `node:requirement->target`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub String);

impl InstanceId {
  pub fn new(id: impl Into<String>) -> Self {
    Self(id.into())
  }

  /// Id of the capability `name` on `node`.
  pub fn capability(node: &InstanceId, name: &str) -> Self {
    Self(format!("{}:{}", node.0, name))
  }

  /// Id of the relationship that `node`'s `requirement` forms with `target`.
  pub fn relationship(node: &InstanceId, requirement: &str, target: &InstanceId) -> Self {
    Self(format!("{}:{}->{}", node.0, requirement, target.0))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for InstanceId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&str> for InstanceId {
  fn from(value: &str) -> Self {
    Self(value.to_string())
  }
}

/// What an instance was created from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceKind {
  /// A `node_templates` entry or a discovered instance.
  Node,
  /// A capability declared by a node's type.
  Capability,
  /// A satisfied requirement, connecting a node to a capability.
  Relationship,
}

/// Lifecycle position of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadyState {
  /// Declared but never operated on.
  #[default]
  Initial,
  /// Accepted by the target system, not yet usable.
  Pending,
  Creating,
  Configuring,
  Started,
  Stopped,
  /// Running, but the last operation reported an error state.
  Degraded,
  /// The last operation failed.
  Error,
  Deleting,
  /// Torn down; the instance is kept as a tombstone.
  Deleted,
  /// Known not to exist.
  Absent,
  /// Never observed. Deploy checks these before changing anything.
  Unknown,
}

impl ReadyState {
  /// Case-insensitive; `ok` is accepted for `started`.
  pub fn parse(text: &str) -> Option<Self> {
    let state = match text.to_ascii_lowercase().as_str() {
      "initial" => ReadyState::Initial,
      "pending" => ReadyState::Pending,
      "creating" => ReadyState::Creating,
      "configuring" => ReadyState::Configuring,
      "started" | "ok" => ReadyState::Started,
      "stopped" => ReadyState::Stopped,
      "degraded" => ReadyState::Degraded,
      "error" => ReadyState::Error,
      "deleting" => ReadyState::Deleting,
      "deleted" => ReadyState::Deleted,
      "absent" => ReadyState::Absent,
      "unknown" => ReadyState::Unknown,
      _ => return None,
    };
    Some(state)
  }

  pub fn as_str(self) -> &'static str {
    match self {
      ReadyState::Initial => "initial",
      ReadyState::Pending => "pending",
      ReadyState::Creating => "creating",
      ReadyState::Configuring => "configuring",
      ReadyState::Started => "started",
      ReadyState::Stopped => "stopped",
      ReadyState::Degraded => "degraded",
      ReadyState::Error => "error",
      ReadyState::Deleting => "deleting",
      ReadyState::Deleted => "deleted",
      ReadyState::Absent => "absent",
      ReadyState::Unknown => "unknown",
    }
  }

  /// True once the instance exists in the target system.
  pub fn is_present(self) -> bool {
    matches!(
      self,
      ReadyState::Pending
        | ReadyState::Configuring
        | ReadyState::Started
        | ReadyState::Stopped
        | ReadyState::Degraded
        | ReadyState::Error
        | ReadyState::Deleting
    )
  }

  /// Collapse to the coarse health used for aggregation.
  pub fn status(self) -> Status {
    match self {
      ReadyState::Started | ReadyState::Stopped => Status::Ok,
      ReadyState::Degraded => Status::Degraded,
      ReadyState::Error => Status::Error,
      ReadyState::Initial | ReadyState::Pending | ReadyState::Creating | ReadyState::Configuring => Status::Pending,
      ReadyState::Deleting | ReadyState::Deleted | ReadyState::Absent => Status::Absent,
      ReadyState::Unknown => Status::Unknown,
    }
  }
}

impl fmt::Display for ReadyState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Coarse health of an instance or of a group of instances.
///
/// Declaration order is severity order: aggregating takes the maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
  Ok,
  Absent,
  Pending,
  Unknown,
  Degraded,
  Error,
}

impl Status {
  /// Worst status of the given statuses; `Ok` when empty.
  pub fn aggregate(statuses: impl IntoIterator<Item = Status>) -> Status {
    statuses.into_iter().max().unwrap_or(Status::Ok)
  }
}

impl fmt::Display for Status {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      Status::Ok => "ok",
      Status::Absent => "absent",
      Status::Pending => "pending",
      Status::Unknown => "unknown",
      Status::Degraded => "degraded",
      Status::Error => "error",
    };
    f.write_str(s)
  }
}

/// Min/max bound on how many relationships may use a requirement or capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Occurrences {
  pub min: u32,
  /// `None` is unbounded.
  pub max: Option<u32>,
}

impl Occurrences {
  pub const EXACTLY_ONE: Occurrences = Occurrences { min: 1, max: Some(1) };
  pub const UNBOUNDED: Occurrences = Occurrences { min: 0, max: None };

  /// Parse `[min, max]` where max may be `UNBOUNDED`.
  pub fn from_value(value: &Value) -> Option<Self> {
    let items = value.as_list()?;
    let [min, max] = items.as_slice() else {
      return None;
    };
    let min = u32::try_from(min.as_i64()?).ok()?;
    let max = match max {
      Value::String(s) if s.eq_ignore_ascii_case("unbounded") => None,
      other => Some(u32::try_from(other.as_i64()?).ok()?),
    };
    Some(Self { min, max })
  }

  /// Whether one more relationship fits when `count` already exist.
  pub fn allows(&self, count: usize) -> bool {
    self.max.is_none_or(|max| count < max as usize)
  }
}

impl Default for Occurrences {
  fn default() -> Self {
    Self::EXACTLY_ONE
  }
}

/// A requirement as written on a node template.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RequirementAssignment {
  pub name: String,
  /// Explicit target node.
  pub node: Option<String>,
  /// Capability name or type on the target.
  pub capability: Option<String>,
  /// Relationship type to create.
  pub relationship: Option<String>,
  /// Properties of the relationship instance.
  #[serde(default)]
  pub properties: Mapping,
}

/// A configured entity in the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
  pub id: InstanceId,
  pub name: String,
  pub kind: InstanceKind,
  pub type_name: String,
  #[serde(default)]
  pub properties: Mapping,
  #[serde(default)]
  pub attributes: Mapping,
  #[serde(default)]
  pub ready_state: ReadyState,
  pub parent: Option<InstanceId>,
  /// Node a capability or relationship belongs to.
  pub owner: Option<InstanceId>,
  /// For relationships: the capability instance it connects to.
  pub target: Option<InstanceId>,
  #[serde(default)]
  pub requirements: Vec<RequirementAssignment>,
  /// For nodes: relationship instances created from `requirements`.
  #[serde(default)]
  pub relationships: Vec<InstanceId>,
  /// Deleted, or no longer reported by discovery; kept until a discover
  /// confirms it is gone.
  #[serde(default)]
  pub tombstone: bool,
  /// Added by a configurator rather than declared in the topology.
  #[serde(default)]
  pub discovered: bool,
  /// Pass that last changed this instance.
  pub last_change: Option<String>,
  /// Store revision at which each attribute was last written.
  #[serde(skip)]
  pub(crate) revisions: BTreeMap<String, u64>,
}

impl Instance {
  pub fn new(id: InstanceId, name: impl Into<String>, kind: InstanceKind, type_name: impl Into<String>) -> Self {
    Self {
      id,
      name: name.into(),
      kind,
      type_name: type_name.into(),
      properties: Mapping::new(),
      attributes: Mapping::new(),
      ready_state: ReadyState::Initial,
      parent: None,
      owner: None,
      target: None,
      requirements: Vec::new(),
      relationships: Vec::new(),
      tombstone: false,
      discovered: false,
      last_change: None,
      revisions: BTreeMap::new(),
    }
  }

  /// Explicit value of `name`: attributes shadow properties.
  pub fn explicit_value(&self, name: &str) -> Option<&Value> {
    self.attributes.get(name).or_else(|| self.properties.get(name))
  }

  /// Store revision of the last write to `name`; 0 if never written.
  pub fn revision_of(&self, name: &str) -> u64 {
    self.revisions.get(name).copied().unwrap_or(0)
  }

  pub fn status(&self) -> Status {
    self.ready_state.status()
  }
}

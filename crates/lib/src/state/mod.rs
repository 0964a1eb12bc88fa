//! Persisted graph state.
//!
//! After a pass the graph is written out as a state document (see
//! [`crate::graph::to_state_document`]) and recorded in an index. The next
//! run stacks the current state document on top of the ensemble as a
//! [`crate::document::LayerKind::State`] layer.
//!
//! # Storage Layout
//!
//! ```text
//! {state_dir}/
//! ├── index.json          # StateIndex: list + current pointer
//! └── <id>.yaml           # State documents
//! ```

mod storage;

pub use storage::StateStore;

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::document::DocumentError;
use crate::util::hash::HashError;

/// Current version of the index file format.
pub const STATE_INDEX_VERSION: u32 = 1;

/// Errors from saving, loading or indexing state documents.
#[derive(Debug, Error)]
pub enum StateError {
  #[error("failed to create state directory: {0}")]
  CreateDir(#[source] std::io::Error),

  #[error("failed to read state: {0}")]
  Read(#[source] std::io::Error),

  #[error("failed to write state: {0}")]
  Write(#[source] std::io::Error),

  #[error("failed to parse state index: {0}")]
  Parse(#[source] serde_json::Error),

  #[error("failed to serialize state: {0}")]
  Serialize(String),

  #[error(transparent)]
  Document(#[from] DocumentError),

  #[error("failed to hash state: {0}")]
  Hash(#[source] HashError),

  /// No snapshot with this id is in the index.
  #[error("state snapshot '{0}' not found")]
  NotFound(String),

  #[error("unsupported state index version {0}")]
  UnsupportedVersion(u32),
}

/// Index entry for one saved state document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
  pub id: String,
  /// Seconds since the Unix epoch.
  pub created_at: u64,
  /// Pass number the document was written after.
  pub pass: u64,
  /// `None` for documents saved outside a pass.
  pub workflow: Option<String>,
  /// Number of node instances in the document.
  pub instances: usize,
}

/// Contents of `index.json`: every saved snapshot and which one is current.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateIndex {
  pub version: u32,
  /// Id of the snapshot loaded as the state layer.
  pub current: Option<String>,
  /// Oldest first.
  pub snapshots: Vec<SnapshotMeta>,
}

impl Default for StateIndex {
  fn default() -> Self {
    Self::new()
  }
}

impl StateIndex {
  pub fn new() -> Self {
    Self {
      version: STATE_INDEX_VERSION,
      current: None,
      snapshots: Vec::new(),
    }
  }

  /// Add or refresh an entry, keeping the list ordered by creation time.
  pub fn add(&mut self, meta: SnapshotMeta) {
    self.snapshots.retain(|s| s.id != meta.id);
    self.snapshots.push(meta);
    self.snapshots.sort_by_key(|s| s.created_at);
  }

  pub fn remove(&mut self, id: &str) {
    self.snapshots.retain(|s| s.id != id);
    if self.current.as_deref() == Some(id) {
      self.current = None;
    }
  }

  pub fn get(&self, id: &str) -> Option<&SnapshotMeta> {
    self.snapshots.iter().find(|s| s.id == id)
  }

  /// Highest pass number recorded, 0 if none.
  pub fn last_pass(&self) -> u64 {
    self.snapshots.iter().map(|s| s.pass).max().unwrap_or(0)
  }

  pub fn len(&self) -> usize {
    self.snapshots.len()
  }

  pub fn is_empty(&self) -> bool {
    self.snapshots.is_empty()
  }
}

pub(crate) fn now_secs() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_secs())
    .unwrap_or(0)
}

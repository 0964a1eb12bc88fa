//! Reading and writing state documents on disk.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::{debug, info};

use super::{STATE_INDEX_VERSION, SnapshotMeta, StateError, StateIndex, now_secs};
use crate::document::{Document, LayerKind};
use crate::graph::topology::NODE_TEMPLATES_KEY;
use crate::merge::STRATEGY_KEY;
use crate::util::hash::Hashable;
use crate::value::{Mapping, Value};

const INDEX_FILENAME: &str = "index.json";

/// What a snapshot id is derived from.
#[derive(Serialize)]
struct StateContent<'a> {
  pass: u64,
  document: &'a Mapping,
}

impl Hashable for StateContent<'_> {}

/// State documents under one directory.
///
/// Writes go to a temporary file first and are renamed into place.
#[derive(Debug, Clone)]
pub struct StateStore {
  base_path: PathBuf,
}

impl StateStore {
  pub fn new(base_path: impl Into<PathBuf>) -> Self {
    Self {
      base_path: base_path.into(),
    }
  }

  pub fn base_path(&self) -> &Path {
    &self.base_path
  }

  fn index_path(&self) -> PathBuf {
    self.base_path.join(INDEX_FILENAME)
  }

  fn document_path(&self, id: &str) -> PathBuf {
    self.base_path.join(format!("{id}.yaml"))
  }

  fn ensure_dir(&self) -> Result<(), StateError> {
    fs::create_dir_all(&self.base_path).map_err(StateError::CreateDir)
  }

  fn write_atomic(&self, path: &Path, content: &str) -> Result<(), StateError> {
    let mut temp = NamedTempFile::new_in(&self.base_path).map_err(StateError::Write)?;
    temp.write_all(content.as_bytes()).map_err(StateError::Write)?;
    temp.persist(path).map_err(|e| StateError::Write(e.error))?;
    Ok(())
  }

  /// Load the index. A missing index is an empty one.
  pub fn load_index(&self) -> Result<StateIndex, StateError> {
    let content = match fs::read_to_string(self.index_path()) {
      Ok(content) => content,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(StateIndex::new()),
      Err(e) => return Err(StateError::Read(e)),
    };
    let index: StateIndex = serde_json::from_str(&content).map_err(StateError::Parse)?;
    if index.version != STATE_INDEX_VERSION {
      return Err(StateError::UnsupportedVersion(index.version));
    }
    Ok(index)
  }

  fn save_index(&self, index: &StateIndex) -> Result<(), StateError> {
    self.ensure_dir()?;
    let content = serde_json::to_string_pretty(index).map_err(|e| StateError::Serialize(e.to_string()))?;
    self.write_atomic(&self.index_path(), &content)
  }

  /// Write `document` and make it current.
  pub fn save(&self, document: &Mapping, pass: u64, workflow: Option<&str>) -> Result<SnapshotMeta, StateError> {
    self.ensure_dir()?;
    let id = StateContent { pass, document }
      .compute_hash()
      .map_err(StateError::Hash)?
      .0;

    let content = serde_yaml::to_string(document).map_err(|e| StateError::Serialize(e.to_string()))?;
    self.write_atomic(&self.document_path(&id), &content)?;

    let meta = SnapshotMeta {
      id: id.clone(),
      created_at: now_secs(),
      pass,
      workflow: workflow.map(str::to_string),
      instances: count_instances(document),
    };
    let mut index = self.load_index()?;
    index.add(meta.clone());
    index.current = Some(id.clone());
    self.save_index(&index)?;

    info!(id = %id, pass, path = %self.document_path(&id).display(), "saved state");
    Ok(meta)
  }

  /// Load a state document as a state layer.
  pub fn load(&self, id: &str) -> Result<Document, StateError> {
    let path = self.document_path(id);
    if !path.exists() {
      return Err(StateError::NotFound(id.to_string()));
    }
    debug!(id, path = %path.display(), "loading state");
    Ok(Document::load_file(LayerKind::State, &path)?)
  }

  pub fn current_id(&self) -> Result<Option<String>, StateError> {
    Ok(self.load_index()?.current)
  }

  /// The current state layer, if any pass has been saved.
  pub fn load_current(&self) -> Result<Option<Document>, StateError> {
    match self.current_id()? {
      Some(id) => self.load(&id).map(Some),
      None => Ok(None),
    }
  }

  pub fn set_current(&self, id: &str) -> Result<(), StateError> {
    if !self.document_path(id).exists() {
      return Err(StateError::NotFound(id.to_string()));
    }
    let mut index = self.load_index()?;
    if index.get(id).is_none() {
      return Err(StateError::NotFound(id.to_string()));
    }
    index.current = Some(id.to_string());
    self.save_index(&index)
  }

  /// Saved snapshots, oldest first.
  pub fn list(&self) -> Result<Vec<SnapshotMeta>, StateError> {
    Ok(self.load_index()?.snapshots)
  }

  /// Remove a snapshot. Removing the current one clears the pointer.
  pub fn delete(&self, id: &str) -> Result<(), StateError> {
    match fs::remove_file(self.document_path(id)) {
      Ok(()) => {}
      Err(e) if e.kind() == io::ErrorKind::NotFound => {}
      Err(e) => return Err(StateError::Write(e)),
    }
    let mut index = self.load_index()?;
    index.remove(id);
    self.save_index(&index)
  }

  /// Pass number to use for the next run.
  pub fn next_pass(&self) -> Result<u64, StateError> {
    Ok(self.load_index()?.last_pass() + 1)
  }
}

fn count_instances(document: &Mapping) -> usize {
  document
    .get(NODE_TEMPLATES_KEY)
    .and_then(Value::as_map)
    .map(|templates| templates.keys().filter(|k| k.as_str() != STRATEGY_KEY).count())
    .unwrap_or(0)
}

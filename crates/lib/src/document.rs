//! Configuration documents and layer provenance.
//!
//! A [`Document`] is a YAML mapping tagged with where it came from. Layers are
//! collected into a [`LayerStack`] in precedence order (lowest first) and
//! folded by [`crate::merge`].

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::merge::{MergeOptions, merge_layers};
use crate::value::{Mapping, Value};

/// The role a layer plays. Precedence is given by position in the stack, not
/// by kind; the kind is carried for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerKind {
  Home,
  Project,
  Environment,
  Ensemble,
  State,
  Result,
}

impl fmt::Display for LayerKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      LayerKind::Home => "home",
      LayerKind::Project => "project",
      LayerKind::Environment => "environment",
      LayerKind::Ensemble => "ensemble",
      LayerKind::State => "state",
      LayerKind::Result => "result",
    };
    f.write_str(s)
  }
}

/// Where a document came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
  pub kind: LayerKind,
  /// Position in the stack. Unset until the document is pushed.
  pub layer: Option<usize>,
  pub source: Option<PathBuf>,
}

/// Errors reading, parsing or writing a layer document.
#[derive(Debug, Error)]
pub enum DocumentError {
  #[error("failed to read {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to parse {origin}: {message}")]
  Parse { origin: String, message: String },

  #[error("{origin}: top level of a document must be a mapping, found {found}")]
  NotAMapping { origin: String, found: &'static str },

  #[error("failed to serialize document: {0}")]
  Serialize(String),
}

/// A parsed configuration document.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
  provenance: Provenance,
  root: Mapping,
}

impl Document {
  pub fn new(kind: LayerKind, root: Mapping) -> Self {
    Self {
      provenance: Provenance {
        kind,
        layer: None,
        source: None,
      },
      root,
    }
  }

  /// Parse a document from YAML text. An empty document is an empty mapping.
  pub fn from_yaml_str(kind: LayerKind, text: &str) -> Result<Self, DocumentError> {
    Self::parse(kind, text, None)
  }

  /// Read and parse a YAML file.
  pub fn load_file(kind: LayerKind, path: &Path) -> Result<Self, DocumentError> {
    let text = fs::read_to_string(path).map_err(|source| DocumentError::Io {
      path: path.to_path_buf(),
      source,
    })?;
    Self::parse(kind, &text, Some(path.to_path_buf()))
  }

  fn parse(kind: LayerKind, text: &str, source: Option<PathBuf>) -> Result<Self, DocumentError> {
    let origin = source
      .as_ref()
      .map(|p| p.display().to_string())
      .unwrap_or_else(|| format!("<{kind} layer>"));

    let value = Value::parse_yaml(text).map_err(|e| DocumentError::Parse {
      origin: origin.clone(),
      message: e.to_string(),
    })?;

    let root = match value {
      Value::Map(map) => map,
      Value::Null => Mapping::new(),
      other => {
        return Err(DocumentError::NotAMapping {
          origin,
          found: other.type_name(),
        });
      }
    };

    Ok(Self {
      provenance: Provenance {
        kind,
        layer: None,
        source,
      },
      root,
    })
  }

  pub fn provenance(&self) -> &Provenance {
    &self.provenance
  }

  pub fn kind(&self) -> LayerKind {
    self.provenance.kind
  }

  pub fn root(&self) -> &Mapping {
    &self.root
  }

  pub fn root_mut(&mut self) -> &mut Mapping {
    &mut self.root
  }

  pub fn into_root(self) -> Mapping {
    self.root
  }

  pub fn get(&self, key: &str) -> Option<&Value> {
    self.root.get(key)
  }

  /// The mapping stored under `key`, or an empty mapping.
  pub fn section(&self, key: &str) -> Mapping {
    self.root.get(key).and_then(Value::as_map).cloned().unwrap_or_default()
  }

  pub fn to_yaml_string(&self) -> Result<String, DocumentError> {
    serde_yaml::to_string(&self.root).map_err(|e| DocumentError::Serialize(e.to_string()))
  }
}

/// An ordered stack of documents, lowest precedence first.
#[derive(Debug, Clone, Default)]
pub struct LayerStack {
  layers: Vec<Document>,
}

impl LayerStack {
  pub fn new() -> Self {
    Self::default()
  }

  /// Append a layer on top of the stack.
  pub fn push(&mut self, mut document: Document) {
    document.provenance.layer = Some(self.layers.len());
    self.layers.push(document);
  }

  pub fn with(mut self, document: Document) -> Self {
    self.push(document);
    self
  }

  pub fn layers(&self) -> &[Document] {
    &self.layers
  }

  pub fn len(&self) -> usize {
    self.layers.len()
  }

  pub fn is_empty(&self) -> bool {
    self.layers.is_empty()
  }

  /// Fold every layer into a single document.
  ///
  /// The result carries the kind of the top-most layer.
  pub fn merge(&self, options: &MergeOptions) -> Document {
    let kind = self.layers.last().map(Document::kind).unwrap_or(LayerKind::Ensemble);
    let roots: Vec<&Mapping> = self.layers.iter().map(Document::root).collect();
    Document::new(kind, merge_layers(&roots, options))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  #[test]
  fn empty_text_is_empty_mapping() {
    let doc = Document::from_yaml_str(LayerKind::Project, "").unwrap();
    assert!(doc.root().is_empty());
  }

  #[test]
  fn scalar_document_is_rejected() {
    let err = Document::from_yaml_str(LayerKind::Project, "- a\n- b\n").unwrap_err();
    assert!(matches!(err, DocumentError::NotAMapping { found: "list", .. }));
  }

  #[test]
  fn invalid_yaml_reports_origin() {
    let err = Document::from_yaml_str(LayerKind::Home, "a: [unclosed").unwrap_err();
    assert!(err.to_string().contains("<home layer>"));
  }

  #[test]
  fn load_file_records_source() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("ensemble.yaml");
    fs::write(&path, "name: demo\n").unwrap();

    let doc = Document::load_file(LayerKind::Ensemble, &path).unwrap();
    assert_eq!(doc.provenance().source.as_deref(), Some(path.as_path()));
    assert_eq!(doc.get("name"), Some(&Value::from("demo")));
  }

  #[test]
  fn missing_file_is_io_error() {
    let err = Document::load_file(LayerKind::Ensemble, Path::new("/nonexistent/strata.yaml")).unwrap_err();
    assert!(matches!(err, DocumentError::Io { .. }));
  }

  #[test]
  fn push_assigns_layer_positions() {
    let stack = LayerStack::new()
      .with(Document::new(LayerKind::Home, Mapping::new()))
      .with(Document::new(LayerKind::Project, Mapping::new()));
    let positions: Vec<_> = stack.layers().iter().map(|d| d.provenance().layer).collect();
    assert_eq!(positions, vec![Some(0), Some(1)]);
  }
}

//! Loading an ensemble: a stack of documents turned into a runnable graph.
//!
//! ```yaml
//! engine: {parallelism: 4}
//! environment: {-*: true, +PATH: true}
//! types:
//!   Cluster: {...}
//! inputs: {region: eu-west-1}
//! node_templates:
//!   cluster: {type: Cluster}
//! ```
//!
//! Every section takes part in layering, including `engine:`. Layers merge
//! once with the default strategy to read `engine.default_merge`; if that
//! names a different strategy the stack is merged again with it.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, EngineConfig};
use crate::document::{Document, DocumentError, LayerKind, LayerStack};
use crate::environment::{ENVIRONMENT_KEY, Environment};
use crate::graph::{GraphError, GraphStore, StaticSchema, from_document};
use crate::merge::{MergeOptions, Strategy};
use crate::reconcile::{Configurators, Reconciler};
use crate::value::{Mapping, Value};

pub const TYPES_KEY: &str = "types";
/// Alternative spelling of [`TYPES_KEY`]; both are read.
pub const NODE_TYPES_KEY: &str = "node_types";

/// Errors assembling an ensemble from a layer stack.
#[derive(Debug, Error)]
pub enum EnsembleError {
  #[error(transparent)]
  Document(#[from] DocumentError),

  #[error(transparent)]
  Config(#[from] ConfigError),

  #[error(transparent)]
  Graph(#[from] GraphError),

  #[error("no documents to load")]
  Empty,
}

/// A merged ensemble and everything derived from it.
#[derive(Debug, Clone)]
pub struct Ensemble {
  merged: Document,
  config: EngineConfig,
  environment: Environment,
  schema: Arc<StaticSchema>,
}

impl Ensemble {
  /// Load `paths` in precedence order (lowest first), then `state` on top.
  ///
  /// The last path is the ensemble; earlier ones are project configuration.
  pub fn load(paths: &[PathBuf], state: Option<Document>, base_env: &Environment) -> Result<Self, EnsembleError> {
    let mut stack = LayerStack::new();
    for (idx, path) in paths.iter().enumerate() {
      let kind = if idx + 1 == paths.len() {
        LayerKind::Ensemble
      } else {
        LayerKind::Project
      };
      debug!(path = %path.display(), %kind, "loading layer");
      stack.push(Document::load_file(kind, path)?);
    }
    if let Some(state) = state {
      stack.push(state);
    }
    Self::from_stack(&stack, base_env)
  }

  pub fn from_stack(stack: &LayerStack, base_env: &Environment) -> Result<Self, EnsembleError> {
    if stack.is_empty() {
      return Err(EnsembleError::Empty);
    }
    let mut merged = stack.merge(&MergeOptions::default());
    let config = EngineConfig::from_document(merged.root())?;
    if config.default_merge != Strategy::Replace {
      let options = MergeOptions {
        default_strategy: config.default_merge,
        ..Default::default()
      };
      merged = stack.merge(&options);
    }

    // Environment directives act on the process environment, so each
    // layer's rules are applied in turn rather than read from `merged`.
    let mut environment = base_env.clone();
    for layer in stack.layers() {
      let rules = layer.section(ENVIRONMENT_KEY);
      if !rules.is_empty() {
        environment = environment.apply(&rules, base_env);
      }
    }

    let mut types = merged.section(NODE_TYPES_KEY);
    for (name, def) in merged.section(TYPES_KEY) {
      if types.insert(name.clone(), def).is_some() {
        warn!(type_name = %name, "type declared under both 'types' and 'node_types'");
      }
    }

    info!(
      layers = stack.len(),
      types = types.len(),
      env_vars = environment.vars().len(),
      parallelism = config.parallelism,
      "loaded ensemble"
    );
    Ok(Self {
      merged,
      config,
      environment,
      schema: Arc::new(StaticSchema::new(types)),
    })
  }

  pub fn document(&self) -> &Document {
    &self.merged
  }

  pub fn root(&self) -> &Mapping {
    self.merged.root()
  }

  pub fn config(&self) -> &EngineConfig {
    &self.config
  }

  pub fn environment(&self) -> &Environment {
    &self.environment
  }

  /// Build the instance graph. Unsatisfied requirements are returned next to
  /// the graph rather than failing the load.
  pub fn graph(&self) -> Result<(GraphStore, Vec<GraphError>), EnsembleError> {
    Ok(from_document(self.merged.root(), self.schema.clone())?)
  }

  pub fn reconciler(&self, configurators: Configurators) -> Reconciler {
    Reconciler::new(self.config.clone(), configurators, self.environment.clone())
  }

  /// The value at `key` of the merged document.
  pub fn get(&self, key: &str) -> Option<&Value> {
    self.merged.get(key)
  }
}

#[cfg(test)]
mod tests {
  use std::fs;

  use pretty_assertions::assert_eq;
  use tempfile::TempDir;

  use super::*;
  use crate::graph::InstanceId;

  fn layer(kind: LayerKind, text: &str) -> Document {
    Document::from_yaml_str(kind, text).unwrap()
  }

  fn base_env() -> Environment {
    let mut env = Environment::default();
    env.set("HOME", "/home/me");
    env.set("SECRET", "x");
    env
  }

  #[test]
  fn empty_stack_is_rejected() {
    assert!(matches!(
      Ensemble::from_stack(&LayerStack::new(), &base_env()),
      Err(EnsembleError::Empty)
    ));
  }

  #[test]
  fn sections_layer_together() {
    let stack = LayerStack::new()
      .with(layer(
        LayerKind::Home,
        "engine: {parallelism: 2}\nenvironment: {-*: true, +HOME: true}\n",
      ))
      .with(layer(
        LayerKind::Ensemble,
        "engine: {+%: merge, timeout_secs: 30}\ntypes: {App: {}}\nnode_templates: {web: {type: App}}\n",
      ));
    let ensemble = Ensemble::from_stack(&stack, &base_env()).unwrap();

    assert_eq!(ensemble.config().parallelism, 2);
    assert_eq!(ensemble.config().timeout_secs, Some(30));
    assert_eq!(ensemble.environment().get("HOME"), Some("/home/me"));
    assert!(!ensemble.environment().contains("SECRET"));

    let (graph, errors) = ensemble.graph().unwrap();
    assert!(errors.is_empty());
    assert!(graph.contains(&InstanceId::new("web")));
  }

  #[test]
  fn default_merge_strategy_applies_to_all_layers() {
    let stack = LayerStack::new()
      .with(layer(LayerKind::Project, "engine: {default_merge: merge}\nsettings: {a: 1}\n"))
      .with(layer(LayerKind::Ensemble, "settings: {b: 2}\n"));
    let ensemble = Ensemble::from_stack(&stack, &Environment::default()).unwrap();
    let settings = ensemble.get("settings").and_then(Value::as_map).unwrap();
    assert_eq!(settings.len(), 2);
  }

  #[test]
  fn load_files_with_state_on_top() {
    let temp = TempDir::new().unwrap();
    let project = temp.path().join("project.yaml");
    let ensemble_path = temp.path().join("ensemble.yaml");
    fs::write(&project, "node_types: {Db: {}}\n").unwrap();
    fs::write(&ensemble_path, "node_templates: {db: {type: Db}}\n").unwrap();
    let state = layer(
      LayerKind::State,
      "node_templates: {+%: merge, db: {+%: merge, readyState: started}}\n",
    );

    let ensemble = Ensemble::load(&[project, ensemble_path], Some(state), &Environment::default()).unwrap();
    assert_eq!(ensemble.document().kind(), LayerKind::State);
    let (graph, _) = ensemble.graph().unwrap();
    let db = graph.find("db").unwrap();
    assert_eq!(db.ready_state, crate::graph::ReadyState::Started);
    assert_eq!(db.type_name, "Db");
  }
}

//! Building a graph from a merged document and writing it back as state.
//!
//! A topology document has an `inputs:` mapping and a `node_templates:`
//! mapping of template name to:
//!
//! ```yaml
//! cluster:
//!   type: acme.nodes.Cluster
//!   parent: org
//!   properties: {region: us-east-1}
//!   attributes: {}
//!   readyState: started
//!   capabilities:
//!     host: {properties: {max_pods: 10}}
//!   requirements:
//!     - network: vpc
//!     - host: {node: vm, capability: Container, relationship: HostedOn}
//! ```
//!
//! The state document produced by [`to_state_document`] uses merge
//! directives so it can be stacked on top of the templates as a
//! `LayerKind::State` layer.

use std::sync::Arc;

use indexmap::IndexMap;
use tracing::warn;

use super::GraphError;
use super::instance::{Instance, ReadyState, RequirementAssignment};
use super::schema::SchemaLookup;
use super::store::{GraphStore, NodeTemplate};
use crate::merge::STRATEGY_KEY;
use crate::value::{Mapping, Value};

pub const NODE_TEMPLATES_KEY: &str = "node_templates";
pub const INPUTS_KEY: &str = "inputs";

/// Build a graph from `document` and link requirements.
///
/// Requirement failures do not abort loading; they are returned alongside
/// the graph so the reconciler can block the affected instances.
pub fn from_document(
  document: &Mapping,
  schema: Arc<dyn SchemaLookup>,
) -> Result<(GraphStore, Vec<GraphError>), GraphError> {
  let inputs = document.get(INPUTS_KEY).and_then(Value::as_map).cloned().unwrap_or_default();
  let mut store = GraphStore::new(schema).with_inputs(inputs);

  let templates = document
    .get(NODE_TEMPLATES_KEY)
    .and_then(Value::as_map)
    .cloned()
    .unwrap_or_default();
  let mut pending: Vec<NodeTemplate> = templates
    .iter()
    .map(|(name, body)| parse_template(name, body))
    .collect::<Result<_, _>>()?;

  // Parents may be declared after their children.
  while !pending.is_empty() {
    let before = pending.len();
    let mut deferred = Vec::new();
    for template in pending {
      let parent_ready = template
        .parent
        .as_ref()
        .is_none_or(|p| store.find(p).is_some());
      if parent_ready {
        store.create_instance(template)?;
      } else {
        deferred.push(template);
      }
    }
    if deferred.len() == before {
      let missing = deferred[0].parent.clone().unwrap_or_default();
      return Err(GraphError::UnknownInstance(missing));
    }
    pending = deferred;
  }

  let errors: Vec<GraphError> = store
    .resolve_all_requirements()
    .into_iter()
    .map(|(instance, error)| {
      warn!(instance = %instance, %error, "requirement not satisfied");
      error
    })
    .collect();
  Ok((store, errors))
}

/// Parse one `node_templates` entry.
pub fn parse_template(name: &str, body: &Value) -> Result<NodeTemplate, GraphError> {
  let invalid = |message: &str| GraphError::InvalidTemplate {
    name: name.to_string(),
    message: message.to_string(),
  };
  let body = body.as_map().ok_or_else(|| invalid("template must be a mapping"))?;
  let text = |key: &str| body.get(key).and_then(Value::as_str).map(str::to_string);
  let map = |key: &str| body.get(key).and_then(Value::as_map).cloned().unwrap_or_default();

  let ready_state = match body.get("readyState") {
    Some(Value::String(s)) => Some(ReadyState::parse(s).ok_or_else(|| invalid("unknown readyState"))?),
    Some(_) => return Err(invalid("readyState must be a string")),
    None => None,
  };

  let capabilities: IndexMap<String, Mapping> = map("capabilities")
    .into_iter()
    .map(|(cap, def)| {
      let props = def.get("properties").and_then(Value::as_map).cloned().unwrap_or_default();
      (cap, props)
    })
    .collect();

  Ok(NodeTemplate {
    name: name.to_string(),
    type_name: text("type").ok_or_else(|| invalid("missing type"))?,
    parent: text("parent"),
    properties: map("properties"),
    attributes: map("attributes"),
    capabilities,
    requirements: parse_requirements(body.get("requirements")),
    ready_state,
    tombstone: body.get("tombstone").and_then(Value::as_bool).unwrap_or(false),
    discovered: body.get("discovered").and_then(Value::as_bool).unwrap_or(false),
    last_change: text("last_change"),
  })
}

fn parse_requirements(value: Option<&Value>) -> Vec<RequirementAssignment> {
  let entries: Vec<(String, Value)> = match value {
    Some(Value::List(items)) => items
      .iter()
      .filter_map(Value::as_map)
      .flat_map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())))
      .collect(),
    Some(Value::Map(m)) => m.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
    _ => Vec::new(),
  };

  entries
    .into_iter()
    .map(|(name, body)| match body {
      Value::String(node) => RequirementAssignment {
        name,
        node: Some(node),
        ..Default::default()
      },
      other => {
        let text = |key: &str| other.get(key).and_then(Value::as_str).map(str::to_string);
        RequirementAssignment {
          node: text("node"),
          capability: text("capability"),
          relationship: text("relationship"),
          properties: other.get("properties").and_then(Value::as_map).cloned().unwrap_or_default(),
          name,
        }
      }
    })
    .collect()
}

/// Serialize instance state as a mergeable layer.
///
/// Template-declared instances contribute their live state only. Discovered
/// instances carry their full definition so they survive a reload.
pub fn to_state_document(store: &GraphStore) -> Mapping {
  let mut templates = Mapping::new();
  templates.insert(STRATEGY_KEY.to_string(), Value::from("merge"));

  for node in store.nodes() {
    templates.insert(node.name.clone(), Value::Map(state_entry(store, node)));
  }

  let mut root = Mapping::new();
  root.insert(NODE_TEMPLATES_KEY.to_string(), Value::Map(templates));
  root
}

fn state_entry(store: &GraphStore, node: &Instance) -> Mapping {
  let mut entry = Mapping::new();
  entry.insert(STRATEGY_KEY.to_string(), Value::from("merge"));
  if node.discovered {
    entry.insert("type".into(), Value::from(node.type_name.clone()));
    if let Some(parent) = &node.parent {
      entry.insert("parent".into(), Value::from(parent.to_string()));
    }
    entry.insert("properties".into(), Value::Map(node.properties.clone()));
    entry.insert("discovered".into(), Value::Bool(true));
    let requirements: Vec<Value> = store
      .requirements_of(&node.id)
      .into_iter()
      .filter_map(|rel| {
        let target = store.target_node(&rel.id)?;
        let mut req = Mapping::new();
        req.insert(rel.name.clone(), Value::from(target.name.clone()));
        Some(Value::Map(req))
      })
      .collect();
    if !requirements.is_empty() {
      entry.insert("requirements".into(), Value::List(requirements));
    }
  }
  entry.insert("readyState".into(), Value::from(node.ready_state.as_str()));
  entry.insert("attributes".into(), Value::Map(node.attributes.clone()));
  if node.tombstone {
    entry.insert("tombstone".into(), Value::Bool(true));
  }
  if let Some(change) = &node.last_change {
    entry.insert("last_change".into(), Value::from(change.clone()));
  }
  entry
}

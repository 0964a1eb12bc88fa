//! Type definitions and the schema lookup seam.
//!
//! The graph store and the evaluator only need two things from a type system:
//! the flattened definition of a type (with inherited properties, defaults,
//! capabilities, requirements and operations) and a compatibility check
//! between a capability type and a required type. [`SchemaLookup`] captures
//! exactly that; [`StaticSchema`] implements it over the `types:` section of a
//! merged document.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use indexmap::IndexMap;

use super::GraphError;
use super::instance::Occurrences;
use crate::value::{Mapping, Value};

/// A property or attribute declaration.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PropertyDef {
  pub type_name: Option<String>,
  /// Literal or expression evaluated when the value is unset.
  pub default: Option<Value>,
  pub required: bool,
}

/// A capability a type offers to requirements of other nodes.
#[derive(Debug, Clone, PartialEq)]
pub struct CapabilityDef {
  pub type_name: String,
  pub occurrences: Occurrences,
}

/// A requirement a type declares; linked to a capability before each pass.
#[derive(Debug, Clone, PartialEq)]
pub struct RequirementDef {
  /// Required capability type.
  pub capability: String,
  /// Required node type, if constrained.
  pub node: Option<String>,
  pub relationship: Option<String>,
  pub occurrences: Occurrences,
}

/// An operation an instance of the type supports.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OperationDef {
  /// Name of the configurator that implements it.
  pub implementation: String,
  /// Input expressions, resolved against the instance before invocation.
  pub inputs: Mapping,
  pub timeout_secs: Option<u64>,
  /// Upstream status string to readyState table.
  pub status_map: IndexMap<String, String>,
}

/// A type with its inheritance chain flattened.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TypeSchema {
  pub name: String,
  /// This type followed by its ancestors, nearest first.
  pub lineage: Vec<String>,
  pub properties: IndexMap<String, PropertyDef>,
  pub attributes: IndexMap<String, PropertyDef>,
  pub capabilities: IndexMap<String, CapabilityDef>,
  pub requirements: IndexMap<String, RequirementDef>,
  pub operations: IndexMap<String, OperationDef>,
}

impl TypeSchema {
  pub fn is_a(&self, type_name: &str) -> bool {
    self.lineage.iter().any(|t| t == type_name)
  }

  /// Default for `name`, attribute declarations first.
  pub fn default_for(&self, name: &str) -> Option<&Value> {
    self
      .attributes
      .get(name)
      .and_then(|d| d.default.as_ref())
      .or_else(|| self.properties.get(name).and_then(|d| d.default.as_ref()))
  }

  /// Names with a default, in declaration order.
  pub fn defaulted_names(&self) -> impl Iterator<Item = &str> {
    self
      .properties
      .iter()
      .chain(self.attributes.iter())
      .filter(|(_, def)| def.default.is_some())
      .map(|(name, _)| name.as_str())
  }
}

/// Type-resolution and compatibility queries.
pub trait SchemaLookup: Send + Sync + std::fmt::Debug {
  fn resolve_type(&self, name: &str) -> Result<Arc<TypeSchema>, GraphError>;

  /// Whether a capability of `capability_type` satisfies `required_type`.
  fn is_compatible(&self, capability_type: &str, required_type: &str) -> bool;
}

/// Schema built from a `types:` mapping.
///
/// Types not declared in the mapping resolve to an empty root type so that
/// well-known base names such as `tosca.nodes.Root` need no declaration.
#[derive(Debug, Default)]
pub struct StaticSchema {
  raw: Mapping,
  cache: RwLock<HashMap<String, Arc<TypeSchema>>>,
}

impl StaticSchema {
  pub fn new(types: Mapping) -> Self {
    Self {
      raw: types,
      cache: RwLock::new(HashMap::new()),
    }
  }

  fn parent_of(&self, name: &str) -> Option<&str> {
    self.raw.get(name)?.get("derived_from")?.as_str()
  }

  fn lineage(&self, name: &str) -> Result<Vec<String>, GraphError> {
    let mut chain = vec![name.to_string()];
    let mut seen: HashSet<&str> = HashSet::from([name]);
    let mut current = name;
    while let Some(parent) = self.parent_of(current) {
      if !seen.insert(parent) {
        return Err(GraphError::CyclicType(name.to_string()));
      }
      chain.push(parent.to_string());
      current = parent;
    }
    Ok(chain)
  }

  fn build(&self, name: &str) -> Result<TypeSchema, GraphError> {
    let lineage = self.lineage(name)?;
    let mut schema = TypeSchema {
      name: name.to_string(),
      lineage: lineage.clone(),
      ..Default::default()
    };

    // Apply root-most first so that derived declarations win.
    for type_name in lineage.iter().rev() {
      let Some(def) = self.raw.get(type_name).and_then(Value::as_map) else {
        continue;
      };
      merge_properties(&mut schema.properties, def.get("properties"));
      merge_properties(&mut schema.attributes, def.get("attributes"));
      if let Some(caps) = def.get("capabilities").and_then(Value::as_map) {
        for (cap_name, cap) in caps {
          schema.capabilities.insert(cap_name.clone(), parse_capability(cap));
        }
      }
      for (req_name, req) in requirement_entries(def.get("requirements")) {
        schema.requirements.insert(req_name, parse_requirement(&req));
      }
      if let Some(interfaces) = def.get("interfaces").and_then(Value::as_map) {
        for interface in interfaces.values() {
          let Some(ops) = interface.as_map() else { continue };
          for (op_name, op) in ops {
            schema.operations.insert(op_name.clone(), parse_operation(op));
          }
        }
      }
    }
    Ok(schema)
  }
}

impl SchemaLookup for StaticSchema {
  fn resolve_type(&self, name: &str) -> Result<Arc<TypeSchema>, GraphError> {
    if name.is_empty() {
      return Err(GraphError::UnknownType(name.to_string()));
    }
    if let Ok(cache) = self.cache.read()
      && let Some(hit) = cache.get(name)
    {
      return Ok(hit.clone());
    }
    let schema = Arc::new(self.build(name)?);
    if let Ok(mut cache) = self.cache.write() {
      cache.insert(name.to_string(), schema.clone());
    }
    Ok(schema)
  }

  fn is_compatible(&self, capability_type: &str, required_type: &str) -> bool {
    self
      .lineage(capability_type)
      .map(|chain| chain.iter().any(|t| t == required_type))
      .unwrap_or(false)
  }
}

fn merge_properties(into: &mut IndexMap<String, PropertyDef>, defs: Option<&Value>) {
  let Some(defs) = defs.and_then(Value::as_map) else {
    return;
  };
  for (name, def) in defs {
    let parsed = match def {
      Value::Map(m) => PropertyDef {
        type_name: m.get("type").and_then(Value::as_str).map(str::to_string),
        default: m.get("default").cloned(),
        required: m.get("required").and_then(Value::as_bool).unwrap_or(false),
      },
      // Shorthand: `name: <default>`.
      other => PropertyDef {
        default: Some(other.clone()),
        ..Default::default()
      },
    };
    into.insert(name.clone(), parsed);
  }
}

fn parse_capability(value: &Value) -> CapabilityDef {
  match value {
    Value::String(type_name) => CapabilityDef {
      type_name: type_name.clone(),
      occurrences: Occurrences::UNBOUNDED,
    },
    other => CapabilityDef {
      type_name: other.get("type").and_then(Value::as_str).unwrap_or_default().to_string(),
      occurrences: other
        .get("occurrences")
        .and_then(Occurrences::from_value)
        .unwrap_or(Occurrences::UNBOUNDED),
    },
  }
}

/// Requirements may be written as a list of single-key maps or as a map.
fn requirement_entries(value: Option<&Value>) -> Vec<(String, Value)> {
  match value {
    Some(Value::List(items)) => items
      .iter()
      .filter_map(Value::as_map)
      .flat_map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())))
      .collect(),
    Some(Value::Map(m)) => m.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
    _ => Vec::new(),
  }
}

fn parse_requirement(value: &Value) -> RequirementDef {
  match value {
    Value::String(capability) => RequirementDef {
      capability: capability.clone(),
      node: None,
      relationship: None,
      occurrences: Occurrences::EXACTLY_ONE,
    },
    other => {
      let text = |key: &str| other.get(key).and_then(Value::as_str).map(str::to_string);
      RequirementDef {
        capability: text("capability").unwrap_or_default(),
        node: text("node"),
        relationship: text("relationship"),
        occurrences: other
          .get("occurrences")
          .and_then(Occurrences::from_value)
          .unwrap_or(Occurrences::EXACTLY_ONE),
      }
    }
  }
}

fn parse_operation(value: &Value) -> OperationDef {
  match value {
    Value::String(implementation) => OperationDef {
      implementation: implementation.clone(),
      ..Default::default()
    },
    other => OperationDef {
      implementation: other
        .get("implementation")
        .and_then(Value::as_str)
        .unwrap_or("shell")
        .to_string(),
      inputs: other.get("inputs").and_then(Value::as_map).cloned().unwrap_or_default(),
      timeout_secs: other.get("timeout").and_then(Value::as_i64).and_then(|t| u64::try_from(t).ok()),
      status_map: other
        .get("status_map")
        .and_then(Value::as_map)
        .map(|m| m.iter().map(|(k, v)| (k.clone(), v.to_text())).collect())
        .unwrap_or_default(),
    },
  }
}

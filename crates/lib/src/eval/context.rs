//! Evaluation context: the graph, environment, cache, current instance and
//! variable scopes an expression is evaluated against.

use std::collections::HashMap;

use super::cache::{Dep, EvalCache};
use super::{EvalError, Item, contains_expression, eval_path, map_value, parse_path, ready_state_value};
use crate::environment::Environment;
use crate::graph::store::READY_STATE_KEY;
use crate::graph::{GraphStore, Instance, InstanceId, InstanceKind};
use crate::value::{Mapping, Value};

/// Which declarations an instance lookup may consult.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Scope {
  /// Attributes, then properties, then declared defaults.
  Any,
  /// Properties and property defaults only.
  Properties,
}

#[derive(Debug, Default)]
struct Frame {
  exprs: Mapping,
  resolved: HashMap<String, Item>,
}

/// State for evaluating expressions against one graph snapshot.
///
/// `SELF` is the instance the context was created for; the current instance
/// moves as paths navigate.
pub struct EvalContext<'a> {
  graph: &'a GraphStore,
  env: &'a Environment,
  cache: &'a EvalCache,
  self_id: Option<InstanceId>,
  current: Option<InstanceId>,
  frames: Vec<Frame>,
  /// Instance values being computed, for cycle detection.
  resolving: Vec<Dep>,
  resolving_vars: Vec<String>,
  /// Reads made by each value being computed, innermost last.
  reads: Vec<Vec<Dep>>,
}

impl<'a> EvalContext<'a> {
  pub fn new(graph: &'a GraphStore, env: &'a Environment, cache: &'a EvalCache) -> Self {
    Self {
      graph,
      env,
      cache,
      self_id: None,
      current: None,
      frames: Vec::new(),
      resolving: Vec::new(),
      resolving_vars: Vec::new(),
      reads: Vec::new(),
    }
  }

  /// Evaluate relative to `id` (which is also `SELF`).
  pub fn for_instance(mut self, id: InstanceId) -> Self {
    self.self_id = Some(id.clone());
    self.current = Some(id);
    self
  }

  /// Bind lazily evaluated variables.
  pub fn with_vars(mut self, vars: Mapping) -> Self {
    self.push_vars(vars);
    self
  }

  pub fn graph(&self) -> &'a GraphStore {
    self.graph
  }

  pub fn env(&self) -> &'a Environment {
    self.env
  }

  pub fn current(&self) -> Option<&InstanceId> {
    self.current.as_ref()
  }

  // -- variables -------------------------------------------------------------

  pub(crate) fn push_vars(&mut self, vars: Mapping) {
    self.frames.push(Frame {
      exprs: vars,
      resolved: HashMap::new(),
    });
  }

  pub(crate) fn pop_vars(&mut self) {
    self.frames.pop();
  }

  /// Bind an already resolved variable in a fresh scope.
  pub(crate) fn push_bound(&mut self, bindings: Vec<(&str, Item)>) {
    let mut frame = Frame::default();
    for (name, item) in bindings {
      frame.resolved.insert(name.to_string(), item);
    }
    self.frames.push(frame);
  }

  pub(crate) fn var(&mut self, name: &str) -> Result<Value, EvalError> {
    let item = self.var_item(name)?;
    Ok(self.item_value(&item))
  }

  /// Resolve a variable, evaluating its expression on first use.
  pub(crate) fn var_item(&mut self, name: &str) -> Result<Item, EvalError> {
    for idx in (0..self.frames.len()).rev() {
      if let Some(item) = self.frames[idx].resolved.get(name) {
        return Ok(item.clone());
      }
      let Some(expr) = self.frames[idx].exprs.get(name).cloned() else {
        continue;
      };
      if self.resolving_vars.iter().any(|v| v == name) {
        return Err(EvalError::Malformed(format!("variable '{name}' refers to itself")));
      }
      self.resolving_vars.push(name.to_string());
      let item = self.bind_item(&expr);
      self.resolving_vars.pop();
      let item = item?;
      if let Some(frame) = self.frames.get_mut(idx) {
        frame.resolved.insert(name.to_string(), item.clone());
      }
      return Ok(item);
    }
    Err(EvalError::MissingVariable(name.to_string()))
  }

  /// A single instance found by a plain `{eval: path}` stays an instance so
  /// `$var::name` can keep walking from it.
  fn bind_item(&mut self, expr: &Value) -> Result<Item, EvalError> {
    if let Value::Map(map) = expr
      && map.len() == 1
      && let Some(Value::String(path)) = map.get("eval")
    {
      let mut items = eval_path(&parse_path(path)?, self)?;
      if items.len() == 1
        && let Some(item) = items.pop()
      {
        return Ok(item);
      }
      return Ok(Item::Value(match items.len() {
        0 => Value::Null,
        _ => Value::List(items.iter().map(|i| self.item_value(i)).collect()),
      }));
    }
    map_value(expr, self).map(Item::Value)
  }

  /// Evaluate `f` with `id` as the current instance.
  pub(crate) fn with_current<T>(&mut self, id: Option<InstanceId>, f: impl FnOnce(&mut Self) -> T) -> T {
    let saved = std::mem::replace(&mut self.current, id);
    let result = f(self);
    self.current = saved;
    result
  }

  // -- starting points -------------------------------------------------------

  pub(crate) fn start_item(&self) -> Item {
    match &self.current {
      Some(id) => Item::Instance(id.clone()),
      None => Item::Root,
    }
  }

  /// Resolve `SELF`, `HOST`, `ROOT`, `SOURCE` or `TARGET`.
  pub(crate) fn alias(&self, name: &str) -> Option<InstanceId> {
    let this = self.self_id.as_ref()?;
    let instance = self.graph.get(this)?;
    let found = match name {
      "SELF" => Some(instance),
      "HOST" => self.graph.host_of(this),
      "ROOT" => self.graph.root(this),
      "SOURCE" if instance.kind == InstanceKind::Relationship => self.graph.source_node(this),
      "TARGET" if instance.kind == InstanceKind::Relationship => self.graph.target_node(this),
      _ => None,
    };
    found.map(|i| i.id.clone())
  }

  /// Resolve an entity name as used by `get_property`: an alias or a node name.
  pub(crate) fn entity(&self, name: &str) -> Option<InstanceId> {
    if super::ALIASES.contains(&name) {
      return self.alias(name);
    }
    self.graph.find(name).map(|i| i.id.clone())
  }

  pub(crate) fn all_nodes(&self) -> Vec<Item> {
    self.graph.nodes().map(|n| Item::Instance(n.id.clone())).collect()
  }

  pub(crate) fn node_named(&self, name: &str) -> Option<Item> {
    self.graph.find(name).map(|n| Item::Instance(n.id.clone()))
  }

  /// Plain value of a result item. Instances are represented by their name.
  pub(crate) fn item_value(&self, item: &Item) -> Value {
    match item {
      Item::Root => Value::Null,
      Item::Instance(id) => self
        .graph
        .get(id)
        .map(|i| Value::from(i.name.clone()))
        .unwrap_or_default(),
      Item::Value(v) => v.clone(),
    }
  }

  // -- instance lookups ------------------------------------------------------

  fn record(&mut self, id: &InstanceId, name: &str) {
    if let Some(reads) = self.reads.last_mut() {
      reads.push((id.clone(), name.to_string()));
    }
  }

  pub(crate) fn instance_value(&mut self, id: &InstanceId, name: &str) -> Result<Option<Value>, EvalError> {
    self.lookup(id, name, Scope::Any)
  }

  pub(crate) fn property_value(&mut self, id: &InstanceId, name: &str) -> Result<Option<Value>, EvalError> {
    self.lookup(id, name, Scope::Properties)
  }

  fn lookup(&mut self, id: &InstanceId, name: &str, scope: Scope) -> Result<Option<Value>, EvalError> {
    self.record(id, name);
    let graph = self.graph;
    let Some(instance) = graph.get(id) else {
      return Ok(None);
    };

    let explicit = match scope {
      Scope::Any => instance.explicit_value(name),
      Scope::Properties => instance.properties.get(name),
    };
    if let Some(value) = explicit {
      if !contains_expression(value) {
        return Ok(Some(value.clone()));
      }
      return self.resolve_stored(instance, name, scope, value);
    }

    let Ok(schema) = graph.resolve_type(instance) else {
      return Ok(None);
    };
    let default = match scope {
      Scope::Any => schema.default_for(name),
      Scope::Properties => schema.properties.get(name).and_then(|d| d.default.as_ref()),
    };
    match default {
      Some(value) if contains_expression(value) => self.resolve_stored(instance, name, scope, value),
      Some(value) => Ok(Some(value.clone())),
      None => Ok(None),
    }
  }

  /// Evaluate an expression stored on `instance`, at most once per pass.
  fn resolve_stored(
    &mut self,
    instance: &Instance,
    name: &str,
    scope: Scope,
    expr: &Value,
  ) -> Result<Option<Value>, EvalError> {
    let id = instance.id.clone();
    let key = match scope {
      Scope::Any => name.to_string(),
      Scope::Properties => format!("properties:{name}"),
    };

    if let Some((value, deps)) = self.cache.get(self.graph, &id, &key) {
      if let Some(reads) = self.reads.last_mut() {
        reads.extend(deps);
      }
      return Ok(value);
    }

    let marker = (id.clone(), key.clone());
    if self.resolving.contains(&marker) {
      return Err(EvalError::CyclicDefault {
        instance: id.to_string(),
        attribute: name.to_string(),
      });
    }

    self.resolving.push(marker);
    self.reads.push(vec![(id.clone(), name.to_string())]);
    let saved_self = self.self_id.replace(id.clone());
    let saved_current = self.current.replace(id.clone());
    let saved_frames = std::mem::take(&mut self.frames);

    let result = map_value(expr, self);

    self.frames = saved_frames;
    self.current = saved_current;
    self.self_id = saved_self;
    let reads = self.reads.pop().unwrap_or_default();
    self.resolving.pop();
    if let Some(outer) = self.reads.last_mut() {
      outer.extend(reads.iter().cloned());
    }

    let value = result?;
    let value = (!value.is_null()).then_some(value);
    self.cache.insert(self.graph, &id, &key, value.clone(), reads);
    Ok(value)
  }

  /// Every explicit value of an instance, for `*`.
  pub(crate) fn instance_values(&mut self, id: &InstanceId) -> Result<Vec<Item>, EvalError> {
    let Some(instance) = self.graph.get(id) else {
      return Ok(Vec::new());
    };
    let mut names: Vec<String> = instance.properties.keys().cloned().collect();
    for name in instance.attributes.keys() {
      if !names.contains(name) {
        names.push(name.clone());
      }
    }
    let mut out = Vec::new();
    for name in names {
      if let Some(value) = self.instance_value(id, &name)? {
        out.push(Item::Value(value));
      }
    }
    Ok(out)
  }

  /// Built-in navigation and metadata keys.
  pub(crate) fn intrinsic(&mut self, id: &InstanceId, name: &str) -> Result<Vec<Item>, EvalError> {
    let graph = self.graph;
    let Some(instance) = graph.get(id) else {
      return Ok(Vec::new());
    };
    let items = |instances: Vec<&Instance>| -> Vec<Item> {
      instances.into_iter().map(|i| Item::Instance(i.id.clone())).collect()
    };
    let one = |instance: Option<&Instance>| -> Vec<Item> {
      instance.map(|i| Item::Instance(i.id.clone())).into_iter().collect()
    };
    let value = |v: Value| vec![Item::Value(v)];

    let result = match name {
      "." | ".self" => one(Some(instance)),
      ".." | ".parent" => one(graph.parent(id)),
      ".name" => value(Value::from(instance.name.clone())),
      ".type" => value(Value::from(instance.type_name.clone())),
      ".id" => value(Value::from(instance.id.to_string())),
      ".readyState" | ".status" => {
        self.record(id, READY_STATE_KEY);
        if name == ".status" {
          value(Value::from(instance.status().to_string()))
        } else {
          value(ready_state_value(instance.ready_state))
        }
      }
      ".tombstone" => value(Value::Bool(instance.tombstone)),
      ".discovered" => value(Value::Bool(instance.discovered)),
      ".ancestors" => items(graph.ancestors(id)),
      ".root" => one(graph.root(id)),
      ".all" | ".instances" => items(graph.nodes().collect()),
      ".children" => items(graph.children(id)),
      ".descendants" => items(graph.descendants(id)),
      ".capabilities" => items(graph.capabilities(id)),
      ".requirements" => items(graph.requirements_of(id)),
      ".relationships" => items(graph.relationships_to(id)),
      ".targets" => items(graph.targets(id)),
      ".sources" => items(graph.sources(id)),
      ".hosted_on" => one(graph.host_of(id)),
      ".owner" => one(instance.owner.as_ref().and_then(|o| graph.get(o))),
      ".source" => one(graph.source_node(id)),
      ".target" => one(graph.target_node(id)),
      ".properties" => value(Value::Map(instance.properties.clone())),
      ".attributes" => value(Value::Map(instance.attributes.clone())),
      other => return Err(EvalError::Malformed(format!("unknown intrinsic '{other}'"))),
    };
    Ok(result)
  }
}

//! Path expression evaluation over the instance graph.
//!
//! An expression is either a path string evaluated with `{eval: "..."}` or a
//! function mapping such as `{concat: [...]}` or `{if: ..., then: ..., else: ...}`.
//! Paths walk from an instance through intrinsics (`.parent`, `.ancestors`),
//! attribute and property names, map keys and list indexes:
//!
//! ```text
//! .parent::.ancestors::organization_id
//! ::ns::.capabilities[.name=host]
//! .ancestors[.type=acme.nodes.GoogleCloudFolder]?::billing_account
//! ```
//!
//! A path that starts with a bare name searches the current instance and
//! then its ancestors, taking the first one that has the name.
//!
//! Everything an evaluation reads comes from an explicit [`EvalContext`];
//! there is no ambient state.

pub mod cache;
pub mod context;
pub mod functions;
pub mod parse;
pub mod template;

use thiserror::Error;

pub use cache::EvalCache;
pub use context::EvalContext;
pub use parse::{Key, Path, Segment, Test, parse_path};

use crate::graph::{InstanceId, ReadyState};
use crate::value::{Value, values_equal};

/// Why an expression could not be evaluated.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EvalError {
  /// A path that had to produce a value found nothing.
  #[error("'{0}' did not resolve to a value")]
  UnresolvablePath(String),

  #[error("{context}: expected {expected}, found {found}")]
  TypeMismatch {
    context: String,
    expected: &'static str,
    found: &'static str,
  },

  #[error("variable '${0}' is not bound")]
  MissingVariable(String),

  #[error("unknown function '{0}'")]
  UnknownFunction(String),

  #[error("malformed expression: {0}")]
  Malformed(String),

  /// Evaluating a default reached the same default again.
  #[error("default for '{attribute}' on '{instance}' depends on itself")]
  CyclicDefault { instance: String, attribute: String },
}

/// A single result of walking a path.
#[derive(Debug, Clone, PartialEq)]
pub enum Item {
  /// The collection of every node instance.
  Root,
  /// A node, capability or relationship instance.
  Instance(InstanceId),
  /// A plain value: a property, an attribute or something inside one.
  Value(Value),
}

/// Context-relative instance aliases usable at the start of a path.
const ALIASES: &[&str] = &["SELF", "HOST", "ROOT", "SOURCE", "TARGET"];

/// Evaluate an expression. Fails if a path finds nothing.
pub fn evaluate(expr: &Value, ctx: &mut EvalContext<'_>) -> Result<Value, EvalError> {
  match eval_expression(expr, ctx)? {
    Some(value) => Ok(value),
    None => Err(EvalError::UnresolvablePath(describe(expr))),
  }
}

/// Every result of a path, in order.
pub fn query(path: &str, ctx: &mut EvalContext<'_>) -> Result<Vec<Value>, EvalError> {
  let parsed = parse_path(path)?;
  let items = eval_path(&parsed, ctx)?;
  Ok(items.into_iter().map(|item| ctx.item_value(&item)).collect())
}

/// Resolve any expressions nested inside `value`.
///
/// Expressions that find nothing become null. Strings containing `{{` are
/// rendered as templates.
pub fn map_value(value: &Value, ctx: &mut EvalContext<'_>) -> Result<Value, EvalError> {
  if is_expression(value) {
    return Ok(eval_expression(value, ctx)?.unwrap_or(Value::Null));
  }
  match value {
    Value::Map(map) => {
      let mut out = crate::value::Mapping::new();
      for (k, v) in map {
        out.insert(k.clone(), map_value(v, ctx)?);
      }
      Ok(Value::Map(out))
    }
    Value::List(items) => items.iter().map(|v| map_value(v, ctx)).collect::<Result<_, _>>().map(Value::List),
    Value::String(s) if template::has_template(s) => template::render(s, ctx).map(Value::String),
    other => Ok(other.clone()),
  }
}

/// True for `{eval: ...}` / `{ref: ...}` mappings and function calls.
pub fn is_expression(value: &Value) -> bool {
  let Value::Map(map) = value else {
    return false;
  };
  if map.contains_key("eval") || map.contains_key("ref") {
    return map
      .keys()
      .all(|k| matches!(k.as_str(), "eval" | "ref" | "vars" | "foreach" | "trace"));
  }
  functions::call_name(map).is_some()
}

/// True if resolving `value` could produce something different from `value`.
pub fn contains_expression(value: &Value) -> bool {
  if is_expression(value) {
    return true;
  }
  match value {
    Value::Map(map) => map.values().any(contains_expression),
    Value::List(items) => items.iter().any(contains_expression),
    Value::String(s) => template::has_template(s),
    _ => false,
  }
}

/// Evaluate one expression; `None` when a path found nothing.
pub(crate) fn eval_expression(expr: &Value, ctx: &mut EvalContext<'_>) -> Result<Option<Value>, EvalError> {
  match expr {
    Value::String(path) => eval_path_value(path, ctx),
    Value::Map(map) if map.contains_key("eval") || map.contains_key("ref") => {
      let inner = map.get("eval").or_else(|| map.get("ref")).cloned().unwrap_or_default();
      let vars = map.get("vars").and_then(Value::as_map).cloned();
      if let Some(vars) = &vars {
        ctx.push_vars(vars.clone());
      }
      let result = eval_reference(&inner, map.get("foreach"), ctx);
      if vars.is_some() {
        ctx.pop_vars();
      }
      if map.get("trace").is_some_and(Value::is_truthy) {
        tracing::debug!(expr = %describe(expr), result = ?result, "trace");
      }
      result
    }
    Value::Map(map) => match functions::call_name(map) {
      Some(name) => functions::call(name, map, ctx).map(Some),
      None => map_value(expr, ctx).map(Some),
    },
    other => Ok(Some(other.clone())),
  }
}

fn eval_reference(
  inner: &Value,
  foreach: Option<&Value>,
  ctx: &mut EvalContext<'_>,
) -> Result<Option<Value>, EvalError> {
  let Some(foreach) = foreach else {
    return match inner {
      Value::String(path) => eval_path_value(path, ctx),
      other => eval_expression(other, ctx),
    };
  };

  let items = match inner {
    Value::String(path) => eval_path(&parse_path(path)?, ctx)?,
    other => match eval_expression(other, ctx)? {
      Some(Value::List(values)) => values.into_iter().map(Item::Value).collect(),
      Some(value) => vec![Item::Value(value)],
      None => Vec::new(),
    },
  };
  functions::foreach(items, foreach, ctx).map(Some)
}

fn eval_path_value(path: &str, ctx: &mut EvalContext<'_>) -> Result<Option<Value>, EvalError> {
  let parsed = parse_path(path)?;
  let items = eval_path(&parsed, ctx)?;
  Ok(match items.len() {
    0 => None,
    1 => Some(ctx.item_value(&items[0])),
    _ if parsed.ends_with_filter() => Some(ctx.item_value(&items[0])),
    _ => Some(Value::List(items.iter().map(|i| ctx.item_value(i)).collect())),
  })
}

/// Walk `path` from the context's starting point.
pub(crate) fn eval_path(path: &Path, ctx: &mut EvalContext<'_>) -> Result<Vec<Item>, EvalError> {
  let Some(first) = path.segments.first() else {
    return Ok(Vec::new());
  };

  if path.absolute {
    return walk(vec![Item::Root], &path.segments, ctx);
  }

  match &first.key {
    Key::Var(name) => {
      let start = ctx.var_item(name)?;
      let head = Segment {
        key: Key::Empty,
        ..first.clone()
      };
      let mut segments = vec![head];
      segments.extend_from_slice(&path.segments[1..]);
      walk(vec![start], &segments, ctx)
    }
    Key::Name(name) if ALIASES.contains(&name.as_str()) => {
      let start: Vec<Item> = ctx.alias(name).map(Item::Instance).into_iter().collect();
      let head = Segment {
        key: Key::Empty,
        ..first.clone()
      };
      let mut segments = vec![head];
      segments.extend_from_slice(&path.segments[1..]);
      walk(start, &segments, ctx)
    }
    Key::Name(name) if !name.starts_with('.') => {
      // Bare name: nearest ancestor (self first) that has it.
      let mut segments = vec![Segment::key(Key::Name(".ancestors".to_string()))];
      let mut head = first.clone();
      head.first = true;
      segments.push(head);
      segments.extend_from_slice(&path.segments[1..]);
      walk(vec![ctx.start_item()], &segments, ctx)
    }
    _ => walk(vec![ctx.start_item()], &path.segments, ctx),
  }
}

/// Apply `segments` to `items` in turn.
pub(crate) fn walk(mut items: Vec<Item>, segments: &[Segment], ctx: &mut EvalContext<'_>) -> Result<Vec<Item>, EvalError> {
  for segment in segments {
    items = apply_segment(items, segment, ctx)?;
    if items.is_empty() {
      break;
    }
  }
  Ok(items)
}

fn apply_segment(items: Vec<Item>, segment: &Segment, ctx: &mut EvalContext<'_>) -> Result<Vec<Item>, EvalError> {
  let mut out = Vec::new();
  'items: for item in items {
    for candidate in lookup(&item, &segment.key, ctx)? {
      if let Some(test) = &segment.test
        && !test_matches(&candidate, test, ctx)?
      {
        continue;
      }
      if !filters_pass(&candidate, &segment.filters, ctx)? {
        continue;
      }
      out.push(candidate);
      if segment.first {
        break 'items;
      }
    }
  }
  Ok(out)
}

fn filters_pass(candidate: &Item, filters: &[Path], ctx: &mut EvalContext<'_>) -> Result<bool, EvalError> {
  for filter in filters {
    let negate = filter.segments.first().is_some_and(|s| s.negate);
    let found = !walk(vec![candidate.clone()], &filter.segments, ctx)?.is_empty();
    if found == negate {
      return Ok(false);
    }
  }
  Ok(true)
}

fn test_matches(candidate: &Item, test: &Test, ctx: &mut EvalContext<'_>) -> Result<bool, EvalError> {
  let actual = ctx.item_value(candidate);
  let (expected, want_equal) = match test {
    Test::Eq(text) => (text, true),
    Test::Ne(text) => (text, false),
  };
  let expected = match expected.strip_prefix('$') {
    Some(var) => ctx.var(var)?,
    None => Value::coerce_like(expected, &actual),
  };
  Ok(values_equal(&actual, &expected) == want_equal)
}

fn lookup(item: &Item, key: &Key, ctx: &mut EvalContext<'_>) -> Result<Vec<Item>, EvalError> {
  if let Key::Var(var) = key {
    let resolved = match ctx.var(var)? {
      Value::Int(i) => Key::Index(i),
      Value::String(s) => Key::Name(s),
      other => {
        return Err(EvalError::TypeMismatch {
          context: format!("key ${var}"),
          expected: "string or integer",
          found: other.type_name(),
        });
      }
    };
    return lookup(item, &resolved, ctx);
  }
  if *key == Key::Empty {
    return Ok(vec![item.clone()]);
  }

  match item {
    Item::Root => Ok(match key {
      Key::Name(name) if name == ".all" || name == ".instances" => ctx.all_nodes(),
      Key::Wildcard => ctx.all_nodes(),
      Key::Name(name) if !name.starts_with('.') => ctx.node_named(name).into_iter().collect(),
      _ => Vec::new(),
    }),
    Item::Instance(id) => match key {
      Key::Name(name) if name.starts_with('.') => ctx.intrinsic(id, name),
      Key::Name(name) => Ok(ctx.instance_value(id, name)?.map(Item::Value).into_iter().collect()),
      Key::Wildcard => ctx.instance_values(id),
      _ => Ok(Vec::new()),
    },
    Item::Value(value) => Ok(lookup_value(value, key)),
  }
}

fn lookup_value(value: &Value, key: &Key) -> Vec<Item> {
  match (value, key) {
    (Value::Map(map), Key::Name(name)) => map.get(name).cloned().map(Item::Value).into_iter().collect(),
    (Value::Map(map), Key::Wildcard) => map.values().cloned().map(Item::Value).collect(),
    (Value::List(list), Key::Index(index)) => {
      let len = list.len() as i64;
      let idx = if *index < 0 { len + index } else { *index };
      usize::try_from(idx)
        .ok()
        .and_then(|i| list.get(i))
        .cloned()
        .map(Item::Value)
        .into_iter()
        .collect()
    }
    (Value::List(list), Key::Wildcard) => list.iter().cloned().map(Item::Value).collect(),
    (Value::List(list), Key::Name(_)) => list.iter().flat_map(|v| lookup_value(v, key)).collect(),
    _ => Vec::new(),
  }
}

/// Short human description of an expression for error messages.
pub(crate) fn describe(expr: &Value) -> String {
  match expr {
    Value::String(s) => s.clone(),
    Value::Map(map) => match map.get("eval").or_else(|| map.get("ref")) {
      Some(Value::String(s)) => s.clone(),
      _ => expr.to_text(),
    },
    other => other.to_text(),
  }
}

/// `.readyState`-style text for a state.
pub(crate) fn ready_state_value(state: ReadyState) -> Value {
  Value::from(state.as_str())
}

//! Function-call expressions: `{get_property: [...]}`, `{concat: [...]}`,
//! `{if: ..., then: ..., else: ...}` and friends.
//!
//! Arguments are evaluated lazily. `if` only evaluates the branch it takes,
//! and `q` does not evaluate its argument at all.

use super::{EvalContext, EvalError, Item, map_value, template};
use crate::value::{Mapping, Value, values_equal};

/// Function names and the extra keys each one accepts beside its own.
const FUNCTIONS: &[(&str, &[&str])] = &[
  ("get_property", &[]),
  ("get_attribute", &[]),
  ("concat", &["sep"]),
  ("template", &["vars"]),
  ("get_env", &[]),
  ("has_env", &[]),
  ("if", &["then", "else"]),
  ("and", &[]),
  ("or", &[]),
  ("not", &[]),
  ("eq", &[]),
  ("q", &[]),
  ("token", &[]),
  ("get_input", &[]),
  ("to_env", &[]),
];

/// The function a mapping invokes, if it is a call.
///
/// Key order does not matter: `{vars: ..., template: ...}` is a call as long
/// as every other key is one the function accepts.
pub(crate) fn call_name(map: &Mapping) -> Option<&'static str> {
  FUNCTIONS
    .iter()
    .filter(|(name, _)| map.contains_key(*name))
    .find(|(name, extras)| map.keys().all(|k| k == name || extras.contains(&k.as_str())))
    .map(|(name, _)| *name)
}

pub(crate) fn call(name: &str, map: &Mapping, ctx: &mut EvalContext<'_>) -> Result<Value, EvalError> {
  let arg = map.get(name).cloned().unwrap_or_default();
  tracing::trace!(function = name, "call");
  match name {
    "get_property" => get_entity_value(name, &arg, ctx, true),
    "get_attribute" => get_entity_value(name, &arg, ctx, false),
    "concat" => concat(&arg, map.get("sep"), ctx),
    "template" => render_template(&arg, map.get("vars"), ctx),
    "get_env" => get_env(&arg, ctx),
    "has_env" => {
      let name = text_arg("has_env", &map_value(&arg, ctx)?)?;
      Ok(Value::Bool(ctx.env().contains(&name)))
    }
    "if" => {
      let condition = map_value(&arg, ctx)?;
      let branch = if condition.is_truthy() { "then" } else { "else" };
      match map.get(branch) {
        Some(expr) => map_value(expr, ctx),
        None => Ok(Value::Null),
      }
    }
    "and" => {
      let mut last = Value::Bool(true);
      for expr in list_arg("and", &arg)? {
        last = map_value(expr, ctx)?;
        if !last.is_truthy() {
          break;
        }
      }
      Ok(last)
    }
    "or" => {
      let mut last = Value::Bool(false);
      for expr in list_arg("or", &arg)? {
        last = map_value(expr, ctx)?;
        if last.is_truthy() {
          break;
        }
      }
      Ok(last)
    }
    "not" => Ok(Value::Bool(!map_value(&arg, ctx)?.is_truthy())),
    "eq" => {
      let args = list_arg("eq", &arg)?;
      let [left, right] = args else {
        return Err(arity("eq", 2, args.len()));
      };
      let left = map_value(left, ctx)?;
      let right = map_value(right, ctx)?;
      Ok(Value::Bool(values_equal(&left, &right)))
    }
    "q" => Ok(arg),
    "token" => token(&arg, ctx),
    "get_input" => get_input(&arg, ctx),
    "to_env" => to_env(&arg, ctx),
    other => Err(EvalError::UnknownFunction(other.to_string())),
  }
}

fn list_arg<'v>(function: &str, arg: &'v Value) -> Result<&'v [Value], EvalError> {
  arg.as_list().map(Vec::as_slice).ok_or_else(|| EvalError::TypeMismatch {
    context: function.to_string(),
    expected: "list",
    found: arg.type_name(),
  })
}

fn text_arg(function: &str, value: &Value) -> Result<String, EvalError> {
  match value {
    Value::String(s) => Ok(s.clone()),
    Value::Int(_) | Value::Float(_) | Value::Bool(_) => Ok(value.to_text()),
    other => Err(EvalError::TypeMismatch {
      context: function.to_string(),
      expected: "string",
      found: other.type_name(),
    }),
  }
}

fn arity(function: &str, expected: usize, found: usize) -> EvalError {
  EvalError::Malformed(format!("{function} takes {expected} arguments, got {found}"))
}

/// `[entity, name, key...]` or `[entity, capability_or_requirement, name, key...]`.
fn get_entity_value(function: &str, arg: &Value, ctx: &mut EvalContext<'_>, properties: bool) -> Result<Value, EvalError> {
  let args = list_arg(function, arg)?;
  if args.len() < 2 {
    return Err(arity(function, 2, args.len()));
  }
  let args: Vec<Value> = args.iter().map(|a| map_value(a, ctx)).collect::<Result<_, _>>()?;
  let entity = text_arg(function, &args[0])?;
  let missing = || EvalError::UnresolvablePath(format!("{function}: {}", describe_args(&args)));

  let Some(mut id) = ctx.entity(&entity) else {
    return Err(missing());
  };
  let mut rest = &args[1..];

  // A capability or requirement name narrows the entity when more arguments follow.
  if rest.len() > 1 {
    let hop = text_arg(function, &rest[0])?;
    let graph = ctx.graph();
    let narrowed = graph.capability(&id, &hop).map(|c| c.id.clone()).or_else(|| {
      graph
        .requirements_of(&id)
        .into_iter()
        .find(|r| r.name == hop)
        .and_then(|r| graph.target_node(&r.id))
        .map(|t| t.id.clone())
    });
    if let Some(narrowed) = narrowed {
      id = narrowed;
      rest = &rest[1..];
    }
  }

  let name = text_arg(function, &rest[0])?;
  let found = if properties {
    ctx.property_value(&id, &name)?
  } else {
    ctx.instance_value(&id, &name)?
  };
  let mut value = found.ok_or_else(missing)?;
  for key in &rest[1..] {
    value = match (value, key) {
      (Value::Map(mut map), key) => map.shift_remove(&key.to_text()),
      (Value::List(mut list), Value::Int(i)) => usize::try_from(*i)
        .ok()
        .filter(|i| *i < list.len())
        .map(|i| list.swap_remove(i)),
      _ => None,
    }
    .ok_or_else(missing)?;
  }
  Ok(value)
}

fn describe_args(args: &[Value]) -> String {
  args.iter().map(Value::to_text).collect::<Vec<_>>().join(", ")
}

fn concat(arg: &Value, sep: Option<&Value>, ctx: &mut EvalContext<'_>) -> Result<Value, EvalError> {
  let sep = match sep {
    Some(sep) => map_value(sep, ctx)?.to_text(),
    None => String::new(),
  };
  let mut parts = Vec::new();
  for expr in list_arg("concat", arg)? {
    parts.push(map_value(expr, ctx)?.to_text());
  }
  Ok(Value::String(parts.join(&sep)))
}

fn render_template(arg: &Value, vars: Option<&Value>, ctx: &mut EvalContext<'_>) -> Result<Value, EvalError> {
  let text = match arg {
    Value::String(text) => text.clone(),
    other => text_arg("template", &map_value(other, ctx)?)?,
  };
  let vars = match vars {
    Some(Value::Map(vars)) => Some(vars.clone()),
    Some(other) => {
      return Err(EvalError::TypeMismatch {
        context: "template vars".to_string(),
        expected: "map",
        found: other.type_name(),
      });
    }
    None => None,
  };
  let scoped = vars.is_some();
  if let Some(vars) = vars {
    ctx.push_vars(vars);
  }
  let rendered = template::render(&text, ctx);
  if scoped {
    ctx.pop_vars();
  }
  rendered.map(Value::String)
}

/// `name` or `[name, default]`. Absent without a default is null.
fn get_env(arg: &Value, ctx: &mut EvalContext<'_>) -> Result<Value, EvalError> {
  let (name, default) = match arg {
    Value::List(args) => match args.as_slice() {
      [name] => (name, None),
      [name, default] => (name, Some(default)),
      _ => return Err(arity("get_env", 2, args.len())),
    },
    name => (name, None),
  };
  let name = text_arg("get_env", &map_value(name, ctx)?)?;
  match ctx.env().get(&name) {
    Some(value) => Ok(Value::from(value)),
    None => match default {
      Some(default) => map_value(default, ctx),
      None => Ok(Value::Null),
    },
  }
}

/// `[string, separator, index]`; negative indexes count from the end.
fn token(arg: &Value, ctx: &mut EvalContext<'_>) -> Result<Value, EvalError> {
  let args = list_arg("token", arg)?;
  let [text, sep, index] = args else {
    return Err(arity("token", 3, args.len()));
  };
  let text = map_value(text, ctx)?.to_text();
  let sep = map_value(sep, ctx)?.to_text();
  let index = map_value(index, ctx)?;
  let Some(index) = index.as_i64() else {
    return Err(EvalError::TypeMismatch {
      context: "token index".to_string(),
      expected: "integer",
      found: index.type_name(),
    });
  };
  let pieces: Vec<&str> = if sep.is_empty() {
    vec![text.as_str()]
  } else {
    text.split(sep.as_str()).collect()
  };
  let idx = if index < 0 { pieces.len() as i64 + index } else { index };
  Ok(
    usize::try_from(idx)
      .ok()
      .and_then(|i| pieces.get(i))
      .map(|s| Value::from(*s))
      .unwrap_or_default(),
  )
}

fn get_input(arg: &Value, ctx: &mut EvalContext<'_>) -> Result<Value, EvalError> {
  let (name, default) = match arg {
    Value::List(args) => match args.as_slice() {
      [name] => (name, None),
      [name, default] => (name, Some(default)),
      _ => return Err(arity("get_input", 2, args.len())),
    },
    name => (name, None),
  };
  let name = text_arg("get_input", &map_value(name, ctx)?)?;
  match ctx.graph().inputs().get(&name).cloned() {
    Some(value) => map_value(&value, ctx),
    None => match default {
      Some(default) => map_value(default, ctx),
      None => Err(EvalError::UnresolvablePath(format!("inputs::{name}"))),
    },
  }
}

/// Render a mapping as environment variables: upper-cased names, text values.
fn to_env(arg: &Value, ctx: &mut EvalContext<'_>) -> Result<Value, EvalError> {
  let resolved = map_value(arg, ctx)?;
  let Value::Map(map) = resolved else {
    return Err(EvalError::TypeMismatch {
      context: "to_env".to_string(),
      expected: "map",
      found: resolved.type_name(),
    });
  };
  let mut out = Mapping::new();
  for (key, value) in map {
    if value.is_null() {
      continue;
    }
    let name: String = key
      .chars()
      .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
      .collect();
    out.insert(name, Value::String(value.to_text()));
  }
  Ok(Value::Map(out))
}

/// Evaluate `spec` once per item.
///
/// `spec` is either a value expression or `{key: ..., value: ...}`, which
/// produces a mapping. Each item is bound to `$item` (and becomes the current
/// instance when it is one) and its position to `$index`.
pub(crate) fn foreach(items: Vec<Item>, spec: &Value, ctx: &mut EvalContext<'_>) -> Result<Value, EvalError> {
  let (key_expr, value_expr) = match spec {
    Value::Map(map) if map.contains_key("value") || map.contains_key("key") => {
      (map.get("key").cloned(), map.get("value").cloned().unwrap_or_else(|| Value::from("$item")))
    }
    other => (None, other.clone()),
  };

  let mut list = Vec::new();
  let mut map = Mapping::new();
  for (index, item) in items.into_iter().enumerate() {
    let current = match &item {
      Item::Instance(id) => Some(id.clone()),
      _ => ctx.current().cloned(),
    };
    ctx.push_bound(vec![("item", item), ("index", Item::Value(Value::Int(index as i64)))]);
    let result = ctx.with_current(current, |ctx| {
      let key = key_expr.as_ref().map(|k| resolve_item_expr(k, ctx)).transpose()?;
      let value = resolve_item_expr(&value_expr, ctx)?;
      Ok::<_, EvalError>((key, value))
    });
    ctx.pop_vars();
    let (key, value) = result?;
    match key {
      Some(key) => {
        map.insert(key.to_text(), value);
      }
      None => list.push(value),
    }
  }
  Ok(if key_expr.is_some() { Value::Map(map) } else { Value::List(list) })
}

/// Strings in a `foreach` spec are paths; anything else is a value expression.
fn resolve_item_expr(expr: &Value, ctx: &mut EvalContext<'_>) -> Result<Value, EvalError> {
  match expr {
    Value::String(path) if !template::has_template(path) => {
      Ok(super::eval_expression(expr, ctx)?.unwrap_or_else(|| {
        tracing::trace!(path = %path, "foreach path found nothing");
        Value::Null
      }))
    }
    other => map_value(other, ctx),
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use super::*;
  use crate::environment::Environment;
  use crate::eval::{EvalCache, evaluate};
  use crate::graph::{GraphStore, NodeTemplate, StaticSchema};
  use crate::mapping;

  fn graph() -> GraphStore {
    let mut g = GraphStore::new(Arc::new(StaticSchema::default())).with_inputs(mapping! { "region" => "eu-west-1" });
    g.create_instance(NodeTemplate::new("app", "App").with_property("port", 8080i64))
      .unwrap();
    g
  }

  fn eval(g: &GraphStore, env: &Environment, yaml: &str) -> Result<Value, EvalError> {
    let cache = EvalCache::new();
    let id = g.find("app").unwrap().id.clone();
    let mut ctx = EvalContext::new(g, env, &cache).for_instance(id);
    evaluate(&Value::parse_yaml(yaml).unwrap(), &mut ctx)
  }

  #[test]
  fn call_name_requires_known_keys() {
    let call = mapping! { "if" => true, "then" => 1i64 };
    assert_eq!(call_name(&call), Some("if"));
    let data = mapping! { "concat" => "x", "other" => 1i64 };
    assert_eq!(call_name(&data), None);
    assert_eq!(call_name(&mapping! { "port" => 1i64 }), None);
    assert_eq!(call_name(&mapping! { "not" => true, "and" => true }), None);
  }

  #[test]
  fn call_keys_match_in_any_order() {
    let swapped = mapping! { "vars" => mapping! { "who" => "world" }, "template" => "hi {{ $who }}" };
    assert_eq!(call_name(&swapped), Some("template"));
    assert_eq!(call_name(&mapping! { "then" => 1i64, "if" => true }), Some("if"));

    let g = graph();
    let env = Environment::default();
    let value = eval(&g, &env, "{vars: {who: world}, template: \"hi {{ $who }}\"}").unwrap();
    assert_eq!(value, Value::from("hi world"));
  }

  #[test]
  fn if_skips_untaken_branch() {
    let g = graph();
    let env = Environment::default();
    let value = eval(&g, &env, "{if: false, then: {get_property: [SELF, missing_required_prop]}, else: ok}").unwrap();
    assert_eq!(value, Value::from("ok"));

    let err = eval(&g, &env, "{if: true, then: {get_property: [SELF, missing_required_prop]}, else: ok}");
    assert!(matches!(err, Err(EvalError::UnresolvablePath(_))));
  }

  #[test]
  fn concat_with_separator() {
    let g = graph();
    let env = Environment::default();
    let value = eval(&g, &env, "{concat: [a, {get_property: [SELF, port]}, c], sep: '-'}").unwrap();
    assert_eq!(value, Value::from("a-8080-c"));
  }

  #[test]
  fn env_lookups() {
    let g = graph();
    let mut env = Environment::default();
    env.set("MODE", "prod");
    assert_eq!(eval(&g, &env, "{get_env: MODE}").unwrap(), Value::from("prod"));
    assert_eq!(eval(&g, &env, "{get_env: [MISSING, dflt]}").unwrap(), Value::from("dflt"));
    assert_eq!(eval(&g, &env, "{has_env: MISSING}").unwrap(), Value::Bool(false));
  }

  #[test]
  fn logic_and_quoting() {
    let g = graph();
    let env = Environment::default();
    assert_eq!(eval(&g, &env, "{and: [1, '', 3]}").unwrap(), Value::from(""));
    assert_eq!(eval(&g, &env, "{or: [0, null, b]}").unwrap(), Value::from("b"));
    assert_eq!(eval(&g, &env, "{not: []}").unwrap(), Value::Bool(true));
    assert_eq!(eval(&g, &env, "{eq: [1, 1.0]}").unwrap(), Value::Bool(true));
    assert_eq!(
      eval(&g, &env, "{q: {eval: .name}}").unwrap(),
      Value::parse_yaml("{eval: .name}").unwrap()
    );
  }

  #[test]
  fn token_and_inputs() {
    let g = graph();
    let env = Environment::default();
    assert_eq!(eval(&g, &env, "{token: ['a:b:c', ':', -1]}").unwrap(), Value::from("c"));
    assert_eq!(eval(&g, &env, "{get_input: region}").unwrap(), Value::from("eu-west-1"));
    assert_eq!(eval(&g, &env, "{get_input: [zone, a]}").unwrap(), Value::from("a"));
    assert!(eval(&g, &env, "{get_input: zone}").is_err());
  }

  #[test]
  fn to_env_normalizes_names() {
    let g = graph();
    let env = Environment::default();
    let value = eval(&g, &env, "{to_env: {db-host: x, port: 5432, skip: null}}").unwrap();
    assert_eq!(value, Value::parse_yaml("{DB_HOST: x, PORT: '5432'}").unwrap());
  }

  #[test]
  fn template_with_lazy_vars() {
    let g = graph();
    let env = Environment::default();
    let value = eval(
      &g,
      &env,
      "{eval: {template: 'port={{ port }} name={{ $n }}', vars: {n: {eval: .name}, unused: {eval: nowhere}}}}",
    )
    .unwrap();
    assert_eq!(value, Value::from("port=8080 name=app"));
  }
}

//! Tagged value tree shared by documents, instances and expressions.
//!
//! Configuration documents are loaded from YAML, but nothing past the loader
//! touches `serde_yaml` types directly. Everything is converted into [`Value`],
//! whose mappings preserve document order so that merge directives are applied
//! in the order they were written.

use std::cmp::Ordering;
use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::units;

/// Order-preserving string-keyed mapping.
pub type Mapping = IndexMap<String, Value>;

/// A YAML-like value.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
  #[default]
  Null,
  Bool(bool),
  Int(i64),
  Float(f64),
  String(String),
  List(Vec<Value>),
  Map(Mapping),
}

impl Value {
  /// Name of the variant, used in type mismatch errors.
  pub fn type_name(&self) -> &'static str {
    match self {
      Value::Null => "null",
      Value::Bool(_) => "boolean",
      Value::Int(_) => "integer",
      Value::Float(_) => "float",
      Value::String(_) => "string",
      Value::List(_) => "list",
      Value::Map(_) => "map",
    }
  }

  /// Truthiness used by `if`, `and`, `or` and `not`.
  ///
  /// Empty maps, lists and strings, zero, `false` and null are falsy.
  pub fn is_truthy(&self) -> bool {
    match self {
      Value::Null => false,
      Value::Bool(b) => *b,
      Value::Int(i) => *i != 0,
      Value::Float(f) => *f != 0.0,
      Value::String(s) => !s.is_empty(),
      Value::List(l) => !l.is_empty(),
      Value::Map(m) => !m.is_empty(),
    }
  }

  pub fn is_null(&self) -> bool {
    matches!(self, Value::Null)
  }

  pub fn as_str(&self) -> Option<&str> {
    match self {
      Value::String(s) => Some(s),
      _ => None,
    }
  }

  pub fn as_bool(&self) -> Option<bool> {
    match self {
      Value::Bool(b) => Some(*b),
      _ => None,
    }
  }

  pub fn as_i64(&self) -> Option<i64> {
    match self {
      Value::Int(i) => Some(*i),
      Value::Float(f) if f.fract() == 0.0 => Some(*f as i64),
      Value::String(s) => s.trim().parse().ok(),
      _ => None,
    }
  }

  pub fn as_f64(&self) -> Option<f64> {
    match self {
      Value::Int(i) => Some(*i as f64),
      Value::Float(f) => Some(*f),
      _ => None,
    }
  }

  pub fn as_list(&self) -> Option<&Vec<Value>> {
    match self {
      Value::List(l) => Some(l),
      _ => None,
    }
  }

  pub fn as_map(&self) -> Option<&Mapping> {
    match self {
      Value::Map(m) => Some(m),
      _ => None,
    }
  }

  pub fn as_map_mut(&mut self) -> Option<&mut Mapping> {
    match self {
      Value::Map(m) => Some(m),
      _ => None,
    }
  }

  /// Look up a key if this is a mapping.
  pub fn get(&self, key: &str) -> Option<&Value> {
    self.as_map().and_then(|m| m.get(key))
  }

  /// Render the value as text, as `concat` and templates do.
  ///
  /// Strings are emitted verbatim, null becomes the empty string and
  /// containers are rendered as compact JSON.
  pub fn to_text(&self) -> String {
    match self {
      Value::Null => String::new(),
      Value::Bool(b) => b.to_string(),
      Value::Int(i) => i.to_string(),
      Value::Float(f) => f.to_string(),
      Value::String(s) => s.clone(),
      Value::List(_) | Value::Map(_) => serde_json::to_string(self).unwrap_or_default(),
    }
  }

  /// Convert a parsed YAML value.
  ///
  /// Non-string mapping keys are stringified and YAML tags are dropped.
  pub fn from_yaml(value: serde_yaml::Value) -> Value {
    match value {
      serde_yaml::Value::Null => Value::Null,
      serde_yaml::Value::Bool(b) => Value::Bool(b),
      serde_yaml::Value::Number(n) => {
        if let Some(i) = n.as_i64() {
          Value::Int(i)
        } else {
          Value::Float(n.as_f64().unwrap_or(f64::NAN))
        }
      }
      serde_yaml::Value::String(s) => Value::String(s),
      serde_yaml::Value::Sequence(seq) => Value::List(seq.into_iter().map(Value::from_yaml).collect()),
      serde_yaml::Value::Mapping(map) => Value::Map(
        map
          .into_iter()
          .map(|(k, v)| (yaml_key(k), Value::from_yaml(v)))
          .collect(),
      ),
      serde_yaml::Value::Tagged(tagged) => Value::from_yaml(tagged.value),
    }
  }

  /// Parse a YAML (or JSON) string into a value.
  pub fn parse_yaml(text: &str) -> Result<Value, serde_yaml::Error> {
    let raw: serde_yaml::Value = serde_yaml::from_str(text)?;
    Ok(Value::from_yaml(raw))
  }

  /// Coerce a literal string to the type of `like`.
  ///
  /// Used by path tests such as `.count=3` where the right hand side is
  /// always written as text.
  pub fn coerce_like(text: &str, like: &Value) -> Value {
    match like {
      Value::Int(_) => text.parse().map(Value::Int).unwrap_or_else(|_| Value::String(text.to_string())),
      Value::Float(_) => text
        .parse()
        .map(Value::Float)
        .unwrap_or_else(|_| Value::String(text.to_string())),
      Value::Bool(_) => match text {
        "true" | "True" => Value::Bool(true),
        "false" | "False" => Value::Bool(false),
        _ => Value::String(text.to_string()),
      },
      Value::Null if text == "null" => Value::Null,
      _ => Value::String(text.to_string()),
    }
  }
}

fn yaml_key(key: serde_yaml::Value) -> String {
  match key {
    serde_yaml::Value::String(s) => s,
    serde_yaml::Value::Bool(b) => b.to_string(),
    serde_yaml::Value::Number(n) => n.to_string(),
    serde_yaml::Value::Null => "null".to_string(),
    other => serde_yaml::to_string(&other).unwrap_or_default().trim_end().to_string(),
  }
}

/// Equality that understands scalar units and mixed int/float numbers.
///
/// `"1 GB"` equals `"1000 MB"`, and `1` equals `1.0`.
pub fn values_equal(a: &Value, b: &Value) -> bool {
  match compare_values(a, b) {
    Some(ordering) => ordering == Ordering::Equal,
    None => a == b,
  }
}

/// Ordering between two values where one is defined.
///
/// Numbers compare numerically, scalar-unit strings of the same dimension
/// compare after normalisation, other strings compare lexically.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
  match (a, b) {
    (Value::Int(x), Value::Int(y)) => Some(x.cmp(y)),
    (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
    (Value::String(x), Value::String(y)) => match (units::parse_quantity(x), units::parse_quantity(y)) {
      (Some(qx), Some(qy)) => qx.partial_cmp_quantity(&qy),
      _ => Some(x.cmp(y)),
    },
    (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
    (Value::Null, Value::Null) => Some(Ordering::Equal),
    _ => None,
  }
}

impl fmt::Display for Value {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.to_text())
  }
}

impl From<&str> for Value {
  fn from(value: &str) -> Self {
    Value::String(value.to_string())
  }
}

impl From<String> for Value {
  fn from(value: String) -> Self {
    Value::String(value)
  }
}

impl From<bool> for Value {
  fn from(value: bool) -> Self {
    Value::Bool(value)
  }
}

impl From<i64> for Value {
  fn from(value: i64) -> Self {
    Value::Int(value)
  }
}

impl From<i32> for Value {
  fn from(value: i32) -> Self {
    Value::Int(value as i64)
  }
}

impl From<f64> for Value {
  fn from(value: f64) -> Self {
    Value::Float(value)
  }
}

impl From<Mapping> for Value {
  fn from(value: Mapping) -> Self {
    Value::Map(value)
  }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
  fn from(value: Vec<T>) -> Self {
    Value::List(value.into_iter().map(Into::into).collect())
  }
}

/// Build a [`Mapping`] literal.
///
/// ```
/// use strata_lib::mapping;
/// let m = mapping! { "a" => 1, "b" => "two" };
/// assert_eq!(m.len(), 2);
/// ```
#[macro_export]
macro_rules! mapping {
  () => { $crate::value::Mapping::new() };
  ($($key:expr => $value:expr),+ $(,)?) => {{
    let mut m = $crate::value::Mapping::new();
    $( m.insert($key.to_string(), $crate::value::Value::from($value)); )+
    m
  }};
}

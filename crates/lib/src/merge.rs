//! Layered document merging.
//!
//! Layers are folded onto an empty accumulator, lowest precedence first. At
//! every mapping level of a layer:
//!
//! 1. `-KEY` entries delete `KEY` from the accumulated result. `KEY` may be a
//!    glob; `-*` deletes everything.
//! 2. The remaining entries are applied in document order:
//!    - `+KEY` copies `KEY` from the copy source (usually the process
//!      environment), falling back to the value inherited from lower layers,
//!      unless the same layer sets `KEY` explicitly.
//!    - Any other key is applied with its strategy: whiteout removes the key,
//!      nullout sets it to null, merge recurses into mappings and appends to
//!      lists, replace overwrites.
//!
//! A strategy is requested with the reserved `+%` key inside a mapping
//! (`{+%: merge, ...}`), with the in-band forms `{merge: true, ...}` and
//! `{whiteout: true}`, or with the scalar `whiteout`. Directive keys never
//! appear in a merged result, which is what makes merging associative.

use glob::Pattern;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::value::{Mapping, Value};

/// Reserved key selecting the strategy for the enclosing mapping.
pub const STRATEGY_KEY: &str = "+%";

/// How a layer entry combines with the value beneath it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
  #[default]
  Replace,
  Merge,
  Whiteout,
  Nullout,
}

impl Strategy {
  fn parse(text: &str) -> Option<Self> {
    match text {
      "replace" => Some(Strategy::Replace),
      "merge" => Some(Strategy::Merge),
      "whiteout" => Some(Strategy::Whiteout),
      "nullout" => Some(Strategy::Nullout),
      _ => None,
    }
  }

  fn as_str(self) -> &'static str {
    match self {
      Strategy::Replace => "replace",
      Strategy::Merge => "merge",
      Strategy::Whiteout => "whiteout",
      Strategy::Nullout => "nullout",
    }
  }
}

/// Knobs for a merge.
#[derive(Debug, Clone, Default)]
pub struct MergeOptions {
  /// Strategy for mapping values that carry no directive.
  pub default_strategy: Strategy,
  /// Drop list items already present when appending.
  pub dedupe_lists: bool,
  /// Values consulted first by `+KEY` copy directives.
  pub copy_source: Mapping,
}

impl MergeOptions {
  pub fn with_copy_source(mut self, source: Mapping) -> Self {
    self.copy_source = source;
    self
  }
}

/// Merge `layers` in order; later layers take precedence.
pub fn merge_layers(layers: &[&Mapping], options: &MergeOptions) -> Mapping {
  let mut result = Mapping::new();
  for layer in layers {
    apply_layer(&mut result, layer, options);
  }
  result
}

/// Convenience for two layers.
pub fn merge(base: &Mapping, overlay: &Mapping, options: &MergeOptions) -> Mapping {
  merge_layers(&[base, overlay], options)
}

/// Apply one layer onto an already merged result in place.
pub fn apply_layer(result: &mut Mapping, layer: &Mapping, options: &MergeOptions) {
  // `+KEY` falls back to what lower layers held before this layer's deletions.
  let has_copies = layer.keys().any(|k| copy_target(k).is_some());
  let inherited = if has_copies { result.clone() } else { Mapping::new() };

  for key in layer.keys() {
    let Some(target) = delete_target(key) else {
      continue;
    };
    delete_matching(result, target);
  }

  for (key, value) in layer {
    if key == STRATEGY_KEY || delete_target(key).is_some() {
      continue;
    }

    if let Some(name) = copy_target(key) {
      if layer.contains_key(name) {
        continue;
      }
      let copied = options.copy_source.get(name).or_else(|| inherited.get(name));
      if let Some(copied) = copied {
        trace!(key = name, "copy directive");
        result.insert(name.to_string(), copied.clone());
      }
      continue;
    }

    let (strategy, stripped) = classify(value, options.default_strategy);
    match strategy {
      Strategy::Whiteout => {
        result.shift_remove(key);
      }
      Strategy::Nullout => {
        result.insert(key.clone(), Value::Null);
      }
      Strategy::Merge => match (result.get_mut(key), stripped) {
        (Some(Value::Map(existing)), Value::Map(patch)) => apply_layer(existing, &patch, options),
        (Some(Value::List(existing)), Value::List(items)) => append_items(existing, items, options.dedupe_lists),
        (_, stripped) => {
          result.insert(key.clone(), clean(stripped, options));
        }
      },
      Strategy::Replace => {
        result.insert(key.clone(), clean(stripped, options));
      }
    }
  }
}

/// Strip directives from a value that is about to be stored.
///
/// A mapping is treated as a layer applied onto nothing, so nested
/// whiteouts vanish and nested copy directives resolve against the copy source.
fn clean(value: Value, options: &MergeOptions) -> Value {
  match value {
    Value::Map(map) => {
      let mut out = Mapping::new();
      apply_layer(&mut out, &map, options);
      Value::Map(out)
    }
    other => other,
  }
}

fn append_items(existing: &mut Vec<Value>, items: Vec<Value>, dedupe: bool) {
  for item in items {
    if dedupe && existing.contains(&item) {
      continue;
    }
    existing.push(item);
  }
}

fn delete_target(key: &str) -> Option<&str> {
  key.strip_prefix('-').filter(|rest| !rest.is_empty())
}

fn copy_target(key: &str) -> Option<&str> {
  if key == STRATEGY_KEY {
    return None;
  }
  key.strip_prefix('+').filter(|rest| !rest.is_empty())
}

fn delete_matching(result: &mut Mapping, target: &str) {
  let is_glob = target.contains(['*', '?', '[']);
  if !is_glob {
    result.shift_remove(target);
    return;
  }
  match Pattern::new(target) {
    Ok(pattern) => result.retain(|k, _| !pattern.matches(k)),
    // An unparsable glob can only name a literal key.
    Err(_) => {
      result.shift_remove(target);
    }
  }
}

/// Split a layer value into its strategy and its payload with directive keys removed.
fn classify(value: &Value, default: Strategy) -> (Strategy, Value) {
  match value {
    Value::String(s) if s == "whiteout" => (Strategy::Whiteout, Value::Null),
    Value::Map(map) => {
      if let Some(strategy) = map.get(STRATEGY_KEY).and_then(Value::as_str).and_then(Strategy::parse) {
        let mut stripped = map.clone();
        stripped.shift_remove(STRATEGY_KEY);
        return (strategy, Value::Map(stripped));
      }
      if map.contains_key(STRATEGY_KEY) {
        let mut stripped = map.clone();
        stripped.shift_remove(STRATEGY_KEY);
        return (default, Value::Map(stripped));
      }
      if map.get("whiteout") == Some(&Value::Bool(true)) {
        return (Strategy::Whiteout, Value::Null);
      }
      if map.get("merge") == Some(&Value::Bool(true)) {
        let mut stripped = map.clone();
        stripped.shift_remove("merge");
        return (Strategy::Merge, Value::Map(stripped));
      }
      (default, value.clone())
    }
    other => (default, other.clone()),
  }
}

/// Compute a patch that turns `old` into `new` when merged on top of it.
///
/// Removed keys become whiteouts, keys set to null in `new` become nullouts
/// and nested mappings that only partly changed become merge patches.
pub fn diff(old: &Mapping, new: &Mapping) -> Mapping {
  let mut patch = Mapping::new();

  for key in old.keys() {
    if !new.contains_key(key) {
      patch.insert(key.clone(), strategy_marker(Strategy::Whiteout, Mapping::new()));
    }
  }

  for (key, new_value) in new {
    match (old.get(key), new_value) {
      (Some(old_value), _) if old_value == new_value => {}
      (Some(_), Value::Null) => {
        patch.insert(key.clone(), strategy_marker(Strategy::Nullout, Mapping::new()));
      }
      (Some(Value::Map(old_map)), Value::Map(new_map)) => {
        let nested = diff(old_map, new_map);
        patch.insert(key.clone(), strategy_marker(Strategy::Merge, nested));
      }
      (_, Value::Map(new_map)) => {
        patch.insert(key.clone(), strategy_marker(Strategy::Replace, new_map.clone()));
      }
      (_, other) => {
        patch.insert(key.clone(), other.clone());
      }
    }
  }

  patch
}

fn strategy_marker(strategy: Strategy, body: Mapping) -> Value {
  let mut map = Mapping::new();
  map.insert(STRATEGY_KEY.to_string(), Value::from(strategy.as_str()));
  map.extend(body);
  Value::Map(map)
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;

  fn yaml(text: &str) -> Mapping {
    match Value::parse_yaml(text).unwrap() {
      Value::Map(m) => m,
      other => panic!("expected mapping, got {other:?}"),
    }
  }

  fn merged(layers: &[&str]) -> Mapping {
    let parsed: Vec<Mapping> = layers.iter().map(|l| yaml(l)).collect();
    let refs: Vec<&Mapping> = parsed.iter().collect();
    merge_layers(&refs, &MergeOptions::default())
  }

  #[test]
  fn later_layer_replaces_by_default() {
    let result = merged(&["a: {x: 1, y: 2}\nb: 1", "a: {x: 3}"]);
    assert_eq!(result, yaml("a: {x: 3}\nb: 1"));
  }

  #[test]
  fn nested_whiteout_removes_key() {
    let result = merged(&["a: {x: 1}", "a: {x: whiteout}"]);
    assert_eq!(result, yaml("a: {}"));
  }

  #[test]
  fn merge_directive_recurses() {
    let result = merged(&["conn: {timeout: 30}", "conn: {merge: true, retries: 3}"]);
    assert_eq!(result, yaml("conn: {timeout: 30, retries: 3}"));
  }

  #[test]
  fn strategy_key_forms_are_equivalent() {
    let a = merged(&["conn: {timeout: 30}", "conn: {+%: merge, retries: 3}"]);
    let b = merged(&["conn: {timeout: 30}", "conn: {merge: true, retries: 3}"]);
    assert_eq!(a, b);
  }

  #[test]
  fn three_layer_whiteout() {
    let result = merged(&[
      "conn: {timeout: 30}\nname: db",
      "conn: {merge: true, retries: 3}",
      "conn: {whiteout: true}",
    ]);
    assert_eq!(result, yaml("name: db"));
  }

  #[test]
  fn nullout_keeps_key_as_null() {
    let result = merged(&["a: 1", "a: {+%: nullout}"]);
    assert_eq!(result.get("a"), Some(&Value::Null));
  }

  #[test]
  fn merge_appends_lists() {
    let layers = [yaml("tags: [a, b]"), yaml("tags: [b, c]")];
    let options = MergeOptions {
      default_strategy: Strategy::Merge,
      ..Default::default()
    };
    let result = merge_layers(&[&layers[0], &layers[1]], &options);
    assert_eq!(result, yaml("tags: [a, b, b, c]"));

    let options = MergeOptions {
      default_strategy: Strategy::Merge,
      dedupe_lists: true,
      ..Default::default()
    };
    let result = merge_layers(&[&layers[0], &layers[1]], &options);
    assert_eq!(result, yaml("tags: [a, b, c]"));
  }

  #[test]
  fn delete_all_then_copy_keeps_only_copied() {
    let base = yaml("HOME: /home/base\nPATH: /bin\nSECRET: x");
    let layer = yaml("-*: true\n+HOME: true");
    let options = MergeOptions::default().with_copy_source(yaml("HOME: /home/env\nPATH: /usr/bin"));
    let result = merge_layers(&[&base, &layer], &options);
    assert_eq!(result, yaml("HOME: /home/env"));
  }

  #[test]
  fn copy_falls_back_to_inherited_value() {
    let result = merged(&["HOME: /home/base\nPATH: /bin", "-*: true\n+HOME: true"]);
    assert_eq!(result, yaml("HOME: /home/base"));
  }

  #[test]
  fn copy_is_skipped_when_set_in_same_layer() {
    let options = MergeOptions::default().with_copy_source(yaml("HOME: /home/env"));
    let layer = yaml("+HOME: true\nHOME: /explicit");
    let result = merge_layers(&[&layer], &options);
    assert_eq!(result, yaml("HOME: /explicit"));
  }

  #[test]
  fn glob_deletion() {
    let result = merged(&["AWS_KEY: 1\nAWS_SECRET: 2\nUSER: me", "-AWS_*: true"]);
    assert_eq!(result, yaml("USER: me"));
  }

  #[test]
  fn directives_never_leak_into_results() {
    let result = merged(&["a: {+%: merge, b: {merge: true, c: 1}, d: whiteout}"]);
    assert_eq!(result, yaml("a: {b: {c: 1}}"));
  }

  #[test]
  fn merging_is_associative() {
    let a = yaml("x: {p: 1, q: [1]}\ny: keep\nz: 1");
    let b = yaml("x: {merge: true, q: {+%: merge}, r: 2}\n-z: true");
    let c = yaml("x: {+%: merge, p: whiteout}\ny: {+%: nullout}\nw: {whiteout: true}");
    let options = MergeOptions::default();

    let all = merge_layers(&[&a, &b, &c], &options);
    let ab = merge_layers(&[&a, &b], &options);
    let nested = merge_layers(&[&ab, &c], &options);
    assert_eq!(all, nested);
  }

  #[test]
  fn diff_round_trips_through_merge() {
    let old = yaml("a: 1\nb: {x: 1, y: 2}\nc: gone\nd: 4");
    let new = yaml("a: 2\nb: {x: 1, z: 3}\nd: null\ne: {f: 1}");
    let patch = diff(&old, &new);
    let result = merge(&old, &patch, &MergeOptions::default());
    assert_eq!(result, new);
  }
}

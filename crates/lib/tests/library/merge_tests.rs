use pretty_assertions::assert_eq;
use strata_lib::document::{LayerKind, LayerStack};
use strata_lib::environment::Environment;
use strata_lib::merge::{MergeOptions, merge, merge_layers};
use strata_lib::value::Value;

use super::common::{ensemble, layer, map, process_env};

#[test]
fn merging_is_associative() {
  let a = map("conn: {timeout: 30, tags: [a]}\nname: base\n");
  let b = map("conn: {+%: merge, retries: 3, tags: [b]}\nextra: {x: 1}\n");
  let c = map("conn: {+%: merge, timeout: whiteout}\nextra: {+%: merge, y: 2}\nname: top\n");
  let options = MergeOptions::default();

  let all_at_once = merge_layers(&[&a, &b, &c], &options);
  let left_first = merge(&merge(&a, &b, &options), &c, &options);
  assert_eq!(all_at_once, left_first);
  assert_eq!(all_at_once, map("conn: {tags: [b], retries: 3}\nname: top\nextra: {x: 1, y: 2}\n"));
}

#[test]
fn whiteout_removes_key_set_by_every_lower_layer() {
  let stack = LayerStack::new()
    .with(layer(LayerKind::Home, "a: {x: 1, y: 1}\n"))
    .with(layer(LayerKind::Project, "a: {+%: merge, x: 2}\n"))
    .with(layer(LayerKind::Ensemble, "a: {+%: merge, x: whiteout}\n"));
  let merged = stack.merge(&MergeOptions::default());
  assert_eq!(merged.root(), &map("a: {y: 1}\n"));
}

#[test]
fn three_layer_whiteout_drops_the_section() {
  let stack = LayerStack::new()
    .with(layer(LayerKind::Home, "conn: {timeout: 30}\nkeep: true\n"))
    .with(layer(LayerKind::Project, "conn: {merge: true, retries: 3}\n"))
    .with(layer(LayerKind::Ensemble, "conn: {whiteout: true}\n"));
  let merged = stack.merge(&MergeOptions::default());
  assert!(merged.get("conn").is_none());
  assert_eq!(merged.get("keep"), Some(&Value::Bool(true)));
}

#[test]
fn environment_keeps_only_readmitted_variables() {
  let base = process_env(&[("HOME", "/home/ops"), ("SECRET", "hunter2"), ("PATH", "/bin")]);
  let env = Environment::from_rules(&base, &map("-*: true\n+HOME: true\n"));
  assert_eq!(env.vars().len(), 1);
  assert_eq!(env.get("HOME"), Some("/home/ops"));
}

#[test]
fn environment_rules_from_every_layer_apply_in_order() {
  let base = process_env(&[("HOME", "/home/ops"), ("SECRET", "hunter2"), ("PATH", "/bin")]);
  let loaded = ensemble(
    &[
      "environment: {-*: true, +HOME: true}\n",
      "environment: {+PATH: true, MODE: prod}\nnode_templates: {}\n",
    ],
    &base,
  );
  let env = loaded.environment();
  assert_eq!(env.get("HOME"), Some("/home/ops"));
  assert_eq!(env.get("PATH"), Some("/bin"));
  assert_eq!(env.get("MODE"), Some("prod"));
  assert!(!env.contains("SECRET"));
}

#[test]
fn merged_document_round_trips_through_yaml() {
  let loaded = ensemble(
    &[
      "settings: {region: eu, zones: [a, b]}\n",
      "settings: {+%: merge, region: us}\nnode_templates: {}\n",
    ],
    &Environment::default(),
  );
  let text = loaded.document().to_yaml_string().unwrap();
  let reparsed = map(&text);
  assert_eq!(&reparsed, loaded.root());
  assert_eq!(reparsed["settings"], Value::Map(map("region: us\nzones: [a, b]\n")));
}

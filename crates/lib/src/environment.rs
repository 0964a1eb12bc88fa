//! Environment variables visible to expressions and configurators.
//!
//! The process environment is captured once. The `environment:` section of the
//! merged configuration is then applied on top of it with the same directive
//! rules as any other layer, so `-*` clears inherited variables and `+NAME`
//! re-admits one.

use indexmap::IndexMap;

use crate::merge::{MergeOptions, apply_layer};
use crate::value::{Mapping, Value};

/// Key of the environment rules in a merged document.
pub const ENVIRONMENT_KEY: &str = "environment";

/// Environment variables visible to expressions and configurators.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Environment {
  vars: IndexMap<String, String>,
}

impl Environment {
  pub fn new(vars: IndexMap<String, String>) -> Self {
    Self { vars }
  }

  /// Snapshot of the current process environment.
  pub fn from_process() -> Self {
    Self {
      vars: std::env::vars().collect(),
    }
  }

  /// Apply `rules` on top of `base`.
  pub fn from_rules(base: &Environment, rules: &Mapping) -> Self {
    base.apply(rules, base)
  }

  /// Apply `rules` on top of this environment; `+NAME` copies from `source`.
  ///
  /// Layers apply their rules one after another, each re-admitting from the
  /// original process environment.
  pub fn apply(&self, rules: &Mapping, source: &Environment) -> Self {
    let mut result = self.to_mapping();
    let options = MergeOptions::default().with_copy_source(source.to_mapping());
    apply_layer(&mut result, rules, &options);
    Self {
      vars: result
        .into_iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| (k, v.to_text()))
        .collect(),
    }
  }

  pub fn get(&self, name: &str) -> Option<&str> {
    self.vars.get(name).map(String::as_str)
  }

  pub fn contains(&self, name: &str) -> bool {
    self.vars.contains_key(name)
  }

  pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
    self.vars.insert(name.into(), value.into());
  }

  pub fn vars(&self) -> &IndexMap<String, String> {
    &self.vars
  }

  pub fn to_mapping(&self) -> Mapping {
    self
      .vars
      .iter()
      .map(|(k, v)| (k.clone(), Value::from(v.clone())))
      .collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn base() -> Environment {
    let mut env = Environment::default();
    env.set("HOME", "/home/me");
    env.set("PATH", "/bin");
    env.set("AWS_SECRET", "s3cr3t");
    env
  }

  fn rules(text: &str) -> Mapping {
    match Value::parse_yaml(text).unwrap() {
      Value::Map(m) => m,
      _ => panic!("mapping"),
    }
  }

  #[test]
  fn clear_then_readmit() {
    let env = Environment::from_rules(&base(), &rules("-*: true\n+HOME: true\nMODE: prod"));
    assert_eq!(env.get("HOME"), Some("/home/me"));
    assert_eq!(env.get("MODE"), Some("prod"));
    assert!(!env.contains("PATH"));
    assert!(!env.contains("AWS_SECRET"));
  }

  #[test]
  fn glob_removal_and_scalars() {
    let env = Environment::from_rules(&base(), &rules("-AWS_*: true\nPORT: 8080\nDEBUG: null"));
    assert!(!env.contains("AWS_SECRET"));
    assert_eq!(env.get("PORT"), Some("8080"));
    assert!(!env.contains("DEBUG"));
    assert_eq!(env.get("PATH"), Some("/bin"));
  }

  #[test]
  fn later_layers_readmit_from_source() {
    let source = base();
    let first = Environment::from_rules(&source, &rules("-*: true\n+HOME: true"));
    let second = first.apply(&rules("+PATH: true"), &source);
    assert_eq!(second.get("HOME"), Some("/home/me"));
    assert_eq!(second.get("PATH"), Some("/bin"));
    assert!(!second.contains("AWS_SECRET"));
  }

  #[test]
  fn from_process_sees_variables() {
    temp_env::with_var("STRATA_ENV_PROBE", Some("1"), || {
      assert_eq!(Environment::from_process().get("STRATA_ENV_PROBE"), Some("1"));
    });
  }
}

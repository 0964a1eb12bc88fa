use strata_lib::document::{Document, LayerKind, LayerStack};
use strata_lib::ensemble::Ensemble;
use strata_lib::environment::Environment;
use strata_lib::eval::{EvalCache, EvalContext, EvalError, evaluate};
use strata_lib::graph::{GraphStore, InstanceId};
use strata_lib::value::{Mapping, Value};

pub fn map(text: &str) -> Mapping {
  match Value::parse_yaml(text).unwrap() {
    Value::Map(m) => m,
    other => panic!("expected a mapping, found {}", other.type_name()),
  }
}

pub fn layer(kind: LayerKind, text: &str) -> Document {
  Document::from_yaml_str(kind, text).unwrap()
}

/// Project layers followed by the ensemble, lowest precedence first.
pub fn ensemble(layers: &[&str], env: &Environment) -> Ensemble {
  let mut stack = LayerStack::new();
  for (idx, text) in layers.iter().enumerate() {
    let kind = if idx + 1 == layers.len() {
      LayerKind::Ensemble
    } else {
      LayerKind::Project
    };
    stack.push(layer(kind, text));
  }
  Ensemble::from_stack(&stack, env).unwrap()
}

pub fn graph(ensemble: &Ensemble) -> GraphStore {
  let (graph, errors) = ensemble.graph().unwrap();
  assert!(errors.is_empty(), "unexpected graph errors: {errors:?}");
  graph
}

pub fn eval_on(graph: &GraphStore, env: &Environment, instance: &str, expr: Value) -> Result<Value, EvalError> {
  let cache = EvalCache::new();
  let id = graph.find(instance).map(|i| i.id.clone()).unwrap_or_else(|| InstanceId::new(instance));
  let mut ctx = EvalContext::new(graph, env, &cache).for_instance(id);
  evaluate(&expr, &mut ctx)
}

pub fn process_env(vars: &[(&str, &str)]) -> Environment {
  let mut env = Environment::default();
  for (name, value) in vars {
    env.set(*name, *value);
  }
  env
}

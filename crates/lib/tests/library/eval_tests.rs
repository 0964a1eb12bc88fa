use pretty_assertions::assert_eq;
use strata_lib::environment::Environment;
use strata_lib::eval::{EvalCache, EvalContext, EvalError, evaluate, query};
use strata_lib::graph::{GraphStore, InstanceId};
use strata_lib::value::Value;

use super::common::{ensemble, eval_on, graph, process_env};

const TYPES: &str = r#"
types:
  Org: {}
  Cluster:
    capabilities:
      host: Container
    attributes:
      organization_id:
        default: {eval: ".parent::.ancestors::organization_id"}
  Namespace:
    requirements:
      - host: Container
  Loop:
    attributes:
      a: {default: {eval: a}}
"#;

const TOPOLOGY: &str = r#"
inputs:
  region: eu-west-1
node_templates:
  org:
    type: Org
    properties:
      organization_id: 42
      billing_account: acct-0042
  cluster:
    type: Cluster
    parent: org
    properties: {name: k8s}
  ns:
    type: Namespace
    parent: cluster
    requirements:
      - host: cluster
  loop:
    type: Loop
"#;

fn fixture() -> (GraphStore, Environment) {
  let env = process_env(&[("HOME", "/home/ops")]);
  let loaded = ensemble(&[TYPES, TOPOLOGY], &env);
  (graph(&loaded), loaded.environment().clone())
}

fn yaml(text: &str) -> Value {
  Value::parse_yaml(text).unwrap()
}

#[test]
fn default_resolves_through_parent_ancestors() {
  let (g, env) = fixture();
  assert_eq!(
    eval_on(&g, &env, "cluster", Value::from("organization_id")).unwrap(),
    Value::Int(42)
  );
  // A child finds the value on its nearest ancestor that has it.
  assert_eq!(
    eval_on(&g, &env, "ns", Value::from("organization_id")).unwrap(),
    Value::Int(42)
  );
}

#[test]
fn repeated_evaluation_is_deterministic() {
  let (g, env) = fixture();
  let cache = EvalCache::new();
  let mut ctx = EvalContext::new(&g, &env, &cache).for_instance(InstanceId::new("ns"));
  let expr = Value::from(".ancestors::billing_account");
  let first = evaluate(&expr, &mut ctx).unwrap();
  let second = evaluate(&expr, &mut ctx).unwrap();
  assert_eq!(first, Value::from("acct-0042"));
  assert_eq!(first, second);
}

#[test]
fn untaken_branch_is_never_evaluated() {
  let (g, env) = fixture();
  let skipped = yaml("{if: false, then: {get_property: [SELF, missing_required_prop]}, else: ok}");
  assert_eq!(eval_on(&g, &env, "ns", skipped).unwrap(), Value::from("ok"));

  let taken = yaml("{if: true, then: {get_property: [SELF, missing_required_prop]}, else: ok}");
  assert!(matches!(
    eval_on(&g, &env, "ns", taken),
    Err(EvalError::UnresolvablePath(_))
  ));
}

#[test]
fn host_alias_follows_requirements() {
  let (g, env) = fixture();
  assert_eq!(
    eval_on(&g, &env, "ns", yaml("{get_property: [HOST, name]}")).unwrap(),
    Value::from("k8s")
  );
}

#[test]
fn self_referencing_default_is_cyclic() {
  let (g, env) = fixture();
  let err = eval_on(&g, &env, "loop", Value::from("a")).unwrap_err();
  assert_eq!(
    err,
    EvalError::CyclicDefault {
      instance: "loop".to_string(),
      attribute: "a".to_string(),
    }
  );
  // Other instances are unaffected.
  assert_eq!(
    eval_on(&g, &env, "cluster", Value::from("organization_id")).unwrap(),
    Value::Int(42)
  );
}

#[test]
fn functions_read_inputs_and_environment() {
  let (g, env) = fixture();
  let expr = yaml("{concat: [{get_input: region}, ':', {get_env: HOME}]}");
  assert_eq!(eval_on(&g, &env, "ns", expr).unwrap(), Value::from("eu-west-1:/home/ops"));
  assert_eq!(
    eval_on(&g, &env, "ns", yaml("{get_env: [MISSING, fallback]}")).unwrap(),
    Value::from("fallback")
  );
}

#[test]
fn query_from_root_lists_matching_instances() {
  let (g, env) = fixture();
  let cache = EvalCache::new();
  let mut ctx = EvalContext::new(&g, &env, &cache);
  let names = query("::*[organization_id]::.name", &mut ctx).unwrap();
  assert_eq!(names, vec![Value::from("org"), Value::from("cluster")]);
}

#[test]
fn unresolvable_path_is_an_error() {
  let (g, env) = fixture();
  let err = eval_on(&g, &env, "ns", Value::from(".parent::no_such_attribute")).unwrap_err();
  assert!(matches!(err, EvalError::UnresolvablePath(_)));
}

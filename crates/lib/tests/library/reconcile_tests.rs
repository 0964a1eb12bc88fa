use std::fs;

use pretty_assertions::assert_eq;
use strata_lib::ensemble::Ensemble;
use strata_lib::environment::Environment;
use strata_lib::graph::{GraphError, ReadyState, to_state_document};
use strata_lib::reconcile::{CancelToken, Configurators, Outcome, ReconcileError, Workflow};
use strata_lib::state::StateStore;
use strata_lib::value::Value;
use tempfile::TempDir;

use super::common::{ensemble, graph, process_env};

const PROJECT: &str = r#"
engine:
  parallelism: 2
environment:
  -*: true
  +HOME: true
  +PATH: true
types:
  Cluster:
    capabilities:
      host: Container
    interfaces:
      Standard:
        configure:
          implementation: shell
          inputs:
            command: "echo 'attributes: {endpoint: k8s-api}'"
            result: yaml
  Namespace:
    requirements:
      - host: Container
    interfaces:
      Standard:
        configure:
          implementation: shell
          inputs:
            command: 'echo "attributes: {seen: $ENDPOINT, home: $HOME, secret: ${SECRET:-none}}"'
            env:
              ENDPOINT: {get_attribute: [HOST, endpoint]}
            result: yaml
"#;

const TOPOLOGY: &str = r#"
node_templates:
  cluster:
    type: Cluster
  ns:
    type: Namespace
    requirements:
      - host: cluster
"#;

fn base_env() -> Environment {
  process_env(&[("HOME", "/home/ops"), ("SECRET", "hunter2"), ("PATH", "/usr/bin:/bin")])
}

#[cfg(unix)]
#[tokio::test]
async fn deploy_feeds_host_attributes_to_dependents() {
  let loaded = ensemble(&[PROJECT, TOPOLOGY], &base_env());
  let mut g = graph(&loaded);

  let report = loaded
    .reconciler(Configurators::builtin())
    .run(&mut g, Workflow::Deploy, &CancelToken::new())
    .await
    .unwrap();
  assert!(report.is_success(), "{report:#?}");

  let order: Vec<&str> = report.instances.iter().map(|r| r.instance.as_str()).collect();
  assert_eq!(order, vec!["cluster", "ns"]);

  let ns = g.find("ns").unwrap();
  assert_eq!(ns.attributes["seen"], Value::from("k8s-api"));
  assert_eq!(ns.attributes["home"], Value::from("/home/ops"));
  // Dropped by `-*` and never re-admitted.
  assert_eq!(ns.attributes["secret"], Value::from("none"));
  assert_eq!(report.get("ns").unwrap().outcome, Outcome::Ok);
}

#[cfg(unix)]
#[tokio::test]
async fn failed_host_blocks_namespace() {
  let failing = PROJECT.replace("echo 'attributes: {endpoint: k8s-api}'", "exit 3");
  let loaded = ensemble(&[failing.as_str(), TOPOLOGY], &base_env());
  let mut g = graph(&loaded);

  let report = loaded
    .reconciler(Configurators::builtin())
    .run(&mut g, Workflow::Deploy, &CancelToken::new())
    .await
    .unwrap();

  assert!(!report.is_success());
  let cluster = report.get("cluster").unwrap();
  assert_eq!(cluster.outcome, Outcome::Failed);
  assert!(cluster.errors[0].contains("status 3"), "{:?}", cluster.errors);
  let ns = report.get("ns").unwrap();
  assert_eq!(ns.outcome, Outcome::Blocked);
  assert!(ns.operations.is_empty());
  assert!(!g.find("ns").unwrap().attributes.contains_key("seen"));
}

#[tokio::test]
async fn requirement_cycle_stops_the_pass() {
  let types = r#"
types:
  Peer:
    capabilities:
      host: Container
    requirements:
      - host: Container
"#;
  let topology = r#"
node_templates:
  a: {type: Peer, requirements: [{host: b}]}
  b: {type: Peer, requirements: [{host: a}]}
"#;
  let loaded = ensemble(&[types, topology], &Environment::default());
  let mut g = graph(&loaded);

  let err = loaded
    .reconciler(Configurators::builtin())
    .run(&mut g, Workflow::Deploy, &CancelToken::new())
    .await
    .unwrap_err();
  assert_eq!(
    err,
    ReconcileError::Graph(GraphError::CyclicDependency {
      instances: vec!["a".to_string(), "b".to_string()],
    })
  );
  assert_eq!(g.find("a").unwrap().ready_state, ReadyState::Initial);
}

#[cfg(unix)]
#[tokio::test]
async fn saved_state_layers_over_the_next_load() {
  let temp = TempDir::new().unwrap();
  let project = temp.path().join("project.yaml");
  let topology = temp.path().join("ensemble.yaml");
  fs::write(&project, PROJECT).unwrap();
  fs::write(&topology, TOPOLOGY).unwrap();
  let files = vec![project, topology];
  let store = StateStore::new(temp.path().join("state"));

  let first = Ensemble::load(&files, None, &base_env()).unwrap();
  let mut g = graph(&first);
  let pass = store.next_pass().unwrap();
  let report = first
    .reconciler(Configurators::builtin())
    .with_pass(pass)
    .run(&mut g, Workflow::Deploy, &CancelToken::new())
    .await
    .unwrap();
  assert!(report.is_success());
  store.save(&to_state_document(&g), pass, Some("deploy")).unwrap();

  let state = store.load_current().unwrap();
  assert!(state.is_some());
  let second = Ensemble::load(&files, state, &base_env()).unwrap();
  let reloaded = graph(&second);
  let ns = reloaded.find("ns").unwrap();
  assert_eq!(ns.attributes["seen"], Value::from("k8s-api"));
  assert_eq!(ns.ready_state, g.find("ns").unwrap().ready_state);
  assert_eq!(ns.last_change, g.find("ns").unwrap().last_change);
  assert_eq!(store.next_pass().unwrap(), 2);
}

//! The reconciliation pass.
//!
//! A pass:
//!
//! 1. links requirements; instances with unsatisfied requirements are blocked,
//! 2. orders nodes into dependency waves (a cycle aborts the pass),
//! 3. evaluates every declared default once to find `CyclicDefault`s; the
//!    values stay in an [`EvalCache`] shared by the rest of the pass,
//! 4. runs each wave's instances concurrently, up to `parallelism` at a time,
//!    against a snapshot of the graph taken when the wave starts,
//! 5. commits results to the live graph after the wave, in wave order.
//!
//! A failed or blocked instance blocks everything that depends on it. A
//! result for an instance that an earlier commit of the same wave removed or
//! tombstoned is dropped and reported as skipped.
//! Undeploy walks the waves in reverse so dependents are torn down first.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::configurator::Configurators;
use super::lifecycle::{self, Transition};
use super::status::StatusMap;
use super::types::{
  CancelToken, ExecutionError, InstanceReport, Invocation, NewInstance, Operation, Outcome, PassReport, ReconcileError,
  ResultDocument, Workflow,
};
use crate::config::{EngineConfig, TombstonePolicy};
use crate::environment::Environment;
use crate::eval::{EvalCache, EvalContext, EvalError, map_value};
use crate::graph::{DependencyDag, GraphError, GraphStore, InstanceId, NodeTemplate, ReadyState, Status, parse_template};
use crate::merge::{MergeOptions, apply_layer};
use crate::value::{Mapping, Value};

/// One committed effect of an operation.
#[derive(Debug, Clone)]
struct Step {
  operation: Operation,
  ready_state: ReadyState,
  attributes: Mapping,
  new_instances: Option<Vec<NewInstance>>,
}

impl Step {
  fn failed(operation: Operation) -> Self {
    Self {
      operation,
      ready_state: ReadyState::Error,
      attributes: Mapping::new(),
      new_instances: None,
    }
  }
}

/// Result of running one instance's operations.
#[derive(Debug)]
struct TaskResult {
  operations: Vec<Operation>,
  steps: Vec<Step>,
  outcome: Outcome,
  errors: Vec<ReconcileError>,
}

/// Drives instances toward the state a workflow asks for.
#[derive(Debug, Clone)]
pub struct Reconciler {
  config: EngineConfig,
  configurators: Arc<Configurators>,
  env: Arc<Environment>,
  pass: u64,
}

impl Reconciler {
  pub fn new(config: EngineConfig, configurators: Configurators, env: Environment) -> Self {
    Self {
      config,
      configurators: Arc::new(configurators),
      env: Arc::new(env),
      pass: 1,
    }
  }

  /// Number used in change ids (`<pass>:<n>`).
  pub fn with_pass(mut self, pass: u64) -> Self {
    self.pass = pass;
    self
  }

  pub fn config(&self) -> &EngineConfig {
    &self.config
  }

  /// Operations each node would run, in pass order, without running them.
  pub fn plan(&self, graph: &GraphStore, workflow: Workflow) -> Result<Vec<(InstanceId, Vec<Operation>)>, ReconcileError> {
    let mut graph = graph.clone();
    graph.resolve_all_requirements();
    let dag = DependencyDag::from_graph(&graph)?;
    let mut out = Vec::new();
    for id in ordered(&dag, workflow).into_iter().flatten() {
      let instance = graph.instance(&id)?;
      let schema = graph.resolve_type(instance)?;
      out.push((id, lifecycle::plan(workflow, &schema, instance.ready_state)));
    }
    Ok(out)
  }

  /// Run one pass over `graph`.
  ///
  /// # Errors
  ///
  /// Only problems that stop the whole pass are returned: a requirement
  /// cycle or an inconsistent graph. Per-instance failures are in the report.
  pub async fn run(
    &self,
    graph: &mut GraphStore,
    workflow: Workflow,
    cancel: &CancelToken,
  ) -> Result<PassReport, ReconcileError> {
    self.run_with_cache(graph, workflow, cancel, Arc::new(EvalCache::new())).await
  }

  /// Like [`Reconciler::run`], memoizing evaluated values in `cache`.
  ///
  /// # Arguments
  ///
  /// * `cache` - used by the preflight and by every input resolution of the
  ///   pass. Entries invalidate themselves when what they read changes.
  pub async fn run_with_cache(
    &self,
    graph: &mut GraphStore,
    workflow: Workflow,
    cancel: &CancelToken,
    cache: Arc<EvalCache>,
  ) -> Result<PassReport, ReconcileError> {
    info!(pass = self.pass, %workflow, instances = graph.nodes().count(), "starting reconciliation pass");

    let mut blocked: IndexMap<InstanceId, Vec<String>> = IndexMap::new();
    for (instance, error) in graph.resolve_all_requirements() {
      warn!(instance = %instance, %error, "blocking instance");
      blocked.entry(instance).or_default().push(error.to_string());
    }

    let dag = DependencyDag::from_graph(graph)?;
    self.preflight(graph, &cache, &mut blocked);

    let waves = ordered(&dag, workflow);
    info!(wave_count = waves.len(), "computed reconciliation waves");

    let semaphore = Arc::new(Semaphore::new(self.config.parallelism.max(1)));
    let mut failed: HashSet<InstanceId> = HashSet::new();
    let mut reports: Vec<InstanceReport> = Vec::new();
    let mut changes = 0usize;
    let mut cancelled = false;

    for (wave_idx, wave) in waves.iter().enumerate() {
      if cancelled || cancel.is_cancelled() {
        cancelled = true;
        for id in wave {
          reports.push(self.report(graph, id, Vec::new(), Outcome::Cancelled, Vec::new()));
        }
        continue;
      }
      debug!(wave = wave_idx, instances = wave.len(), "executing wave");

      let mut ready: Vec<(InstanceId, Vec<Operation>)> = Vec::new();
      for id in wave {
        if !graph.contains(id) {
          debug!(instance = %id, "instance removed earlier in the pass");
          continue;
        }
        if let Some(errors) = blocked.get(id) {
          failed.insert(id.clone());
          reports.push(self.report(graph, id, Vec::new(), Outcome::Blocked, errors.clone()));
          continue;
        }

        let upstream = if workflow.is_reverse() {
          dag.dependents(id)
        } else {
          dag.dependencies(id)
        };
        if let Some(dep) = upstream.iter().find(|d| failed.contains(*d)) {
          warn!(instance = %id, failed_dep = %dep, "skipping instance due to failed dependency");
          failed.insert(id.clone());
          let error = ReconcileError::Blocked {
            instance: id.to_string(),
            dependency: dep.to_string(),
          };
          reports.push(self.report(graph, id, Vec::new(), Outcome::Blocked, vec![error.to_string()]));
          continue;
        }

        let instance = graph.instance(id)?;
        let schema = graph.resolve_type(instance)?;
        let invalid = workflow
          .operations()
          .iter()
          .copied()
          .filter(|op| schema.operations.contains_key(op.as_str()))
          .find(|op| lifecycle::transition(*op, instance.ready_state) == Transition::Invalid);
        if let Some(operation) = invalid {
          let error = ReconcileError::InvalidTransition {
            instance: id.to_string(),
            operation,
            state: instance.ready_state,
          };
          error!(instance = %id, %error, "invalid transition");
          failed.insert(id.clone());
          reports.push(self.report(graph, id, Vec::new(), Outcome::Failed, vec![error.to_string()]));
          continue;
        }

        let ops = lifecycle::plan(workflow, &schema, instance.ready_state);
        if ops.is_empty() {
          reports.push(self.report(graph, id, Vec::new(), Outcome::Skipped, Vec::new()));
        } else {
          ready.push((id.clone(), ops));
        }
      }

      if ready.is_empty() {
        continue;
      }

      let tombstoned: HashSet<InstanceId> = ready
        .iter()
        .filter(|(id, _)| graph.get(id).is_some_and(|i| i.tombstone))
        .map(|(id, _)| id.clone())
        .collect();
      let results = self.execute_wave(graph, ready, semaphore.clone(), cache.clone(), cancel).await;

      // Commit in wave order.
      for (id, result) in results {
        let superseded = match graph.get(&id) {
          None => true,
          Some(instance) => instance.tombstone && !tombstoned.contains(&id),
        };
        if superseded {
          info!(instance = %id, "dropping result for instance removed earlier in this wave");
          reports.push(self.report(graph, &id, result.operations, Outcome::Skipped, Vec::new()));
          continue;
        }
        let mut errors: Vec<String> = result.errors.iter().map(ToString::to_string).collect();
        for step in &result.steps {
          changes += 1;
          let change = format!("{}:{changes}", self.pass);
          errors.extend(apply_step(graph, &id, step, Some(&change), self.config.tombstones)?);
        }
        match result.outcome {
          Outcome::Ok => info!(instance = %id, "instance reconciled"),
          Outcome::Degraded => warn!(instance = %id, "instance reported an error state"),
          Outcome::Cancelled => cancelled = true,
          _ => {
            error!(instance = %id, errors = ?errors, "instance failed");
            failed.insert(id.clone());
          }
        }
        reports.push(self.report(graph, &id, result.operations, result.outcome, errors));
      }
    }

    let (hits, misses) = cache.stats();
    debug!(hits, misses, entries = cache.len(), "evaluation cache");

    let report = PassReport {
      pass: self.pass,
      workflow,
      cancelled,
      instances: reports,
    };
    info!(
      pass = self.pass,
      ok = report.count(Outcome::Ok),
      failed = report.count(Outcome::Failed),
      blocked = report.count(Outcome::Blocked),
      cancelled,
      "reconciliation pass complete"
    );
    Ok(report)
  }

  /// Evaluate every declared default so cyclic ones block their instance
  /// before anything runs.
  fn preflight(&self, graph: &GraphStore, cache: &EvalCache, blocked: &mut IndexMap<InstanceId, Vec<String>>) {
    for node in graph.nodes() {
      let Ok(schema) = graph.resolve_type(node) else {
        continue;
      };
      for name in schema.defaulted_names() {
        if node.explicit_value(name).is_some() {
          continue;
        }
        let mut ctx = EvalContext::new(graph, &self.env, cache).for_instance(node.id.clone());
        if let Err(error @ EvalError::CyclicDefault { .. }) = ctx.instance_value(&node.id, name) {
          error!(instance = %node.id, attribute = name, "cyclic default");
          blocked.entry(node.id.clone()).or_default().push(error.to_string());
          break;
        }
      }
    }
  }

  async fn execute_wave(
    &self,
    graph: &GraphStore,
    ready: Vec<(InstanceId, Vec<Operation>)>,
    semaphore: Arc<Semaphore>,
    cache: Arc<EvalCache>,
    cancel: &CancelToken,
  ) -> Vec<(InstanceId, TaskResult)> {
    let mut join_set = JoinSet::new();

    for (idx, (id, ops)) in ready.into_iter().enumerate() {
      // Every task works on its own copy of the wave's starting graph.
      let local = graph.clone();
      let this = self.clone();
      let semaphore = semaphore.clone();
      let cache = cache.clone();
      let cancel = cancel.clone();

      join_set.spawn(async move {
        let result = match semaphore.acquire_owned().await {
          Ok(_permit) => this.run_instance(local, &id, ops, &cache, &cancel).await,
          Err(_) => TaskResult {
            operations: Vec::new(),
            steps: Vec::new(),
            outcome: Outcome::Cancelled,
            errors: vec![ReconcileError::Cancelled],
          },
        };
        (idx, id, result)
      });
    }

    let mut results = Vec::new();
    while let Some(joined) = join_set.join_next().await {
      match joined {
        Ok(result) => results.push(result),
        Err(e) => error!(error = %e, "instance task panicked"),
      }
    }
    results.sort_by_key(|(idx, _, _)| *idx);
    results.into_iter().map(|(_, id, result)| (id, result)).collect()
  }

  async fn run_instance(
    &self,
    mut graph: GraphStore,
    id: &InstanceId,
    ops: Vec<Operation>,
    cache: &EvalCache,
    cancel: &CancelToken,
  ) -> TaskResult {
    let mut result = TaskResult {
      operations: Vec::new(),
      steps: Vec::new(),
      outcome: Outcome::Ok,
      errors: Vec::new(),
    };

    for op in ops {
      if cancel.is_cancelled() {
        if result.operations.is_empty() {
          result.outcome = Outcome::Cancelled;
        }
        break;
      }
      let before = graph.get(id).map(|i| i.ready_state).unwrap_or_default();
      // An earlier check may have found the instance already there.
      if !result.steps.is_empty() && lifecycle::transition(op, before) == Transition::Skip {
        debug!(instance = %id, %op, state = before.as_str(), "operation no longer needed");
        continue;
      }
      result.operations.push(op);

      let (invocation, status_map) = match self.prepare(&graph, cache, id, op) {
        Ok(prepared) => prepared,
        Err(error) => {
          result.errors.push(error);
          result.outcome = Outcome::Failed;
          break;
        }
      };

      if let Some(state) = lifecycle::in_progress(op) {
        debug!(instance = %id, %op, state = state.as_str(), "operation in progress");
        if let Err(error) = graph.set_ready_state(id, state) {
          warn!(instance = %id, %op, %error, "could not record in-progress state");
        }
      }

      let step = match self.invoke(&invocation).await {
        Err(error) => {
          result.errors.push(error);
          result.outcome = Outcome::Failed;
          Step::failed(op)
        }
        Ok(doc) if !doc.success => {
          result.errors.push(ReconcileError::OperationFailed {
            instance: id.to_string(),
            operation: op,
          });
          result.outcome = Outcome::Failed;
          Step {
            attributes: doc.attributes,
            ..Step::failed(op)
          }
        }
        Ok(doc) => {
          let reported = doc
            .ready_state
            .or_else(|| doc.upstream_status.as_deref().map(|s| status_map.map(s)));
          let mut ready_state = reported.unwrap_or_else(|| lifecycle::settled(op, before));
          if ready_state == ReadyState::Error {
            ready_state = ReadyState::Degraded;
            result.errors.push(ReconcileError::ReportedDegradedState {
              instance: id.to_string(),
              operation: op,
              upstream: doc.upstream_status.clone(),
            });
            result.outcome = Outcome::Degraded;
          }
          Step {
            operation: op,
            ready_state,
            attributes: doc.attributes,
            new_instances: doc.new_instances,
          }
        }
      };

      // Later operations of this instance see the effects of earlier ones.
      if let Err(e) = apply_step(&mut graph, id, &step, None, self.config.tombstones) {
        result.errors.push(e.into());
        result.outcome = Outcome::Failed;
      }
      result.steps.push(step);
      if result.outcome != Outcome::Ok {
        break;
      }
    }
    result
  }

  /// Resolve inputs and find the configurator for `op`.
  fn prepare(
    &self,
    graph: &GraphStore,
    cache: &EvalCache,
    id: &InstanceId,
    op: Operation,
  ) -> Result<(Invocation, StatusMap), ReconcileError> {
    let instance = graph.instance(id)?;
    let schema = graph.resolve_type(instance)?;
    let Some(def) = schema.operations.get(op.as_str()) else {
      return Err(ReconcileError::UnknownConfigurator {
        instance: id.to_string(),
        name: op.to_string(),
      });
    };

    let inputs = resolve_inputs(graph, &self.env, cache, id, &def.inputs).map_err(|source| ReconcileError::Evaluation {
      instance: id.to_string(),
      source,
    })?;
    let timeout = def.timeout_secs.or(self.config.timeout_secs).map(Duration::from_secs);
    let invocation = Invocation {
      instance: id.clone(),
      instance_name: instance.name.clone(),
      type_name: instance.type_name.clone(),
      operation: op,
      implementation: def.implementation.clone(),
      inputs,
      environment: self
        .env
        .vars()
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect::<BTreeMap<_, _>>(),
      timeout,
    };
    Ok((invocation, StatusMap::new(&def.status_map, self.config.unmapped_status)))
  }

  /// Call the configurator with retries and the deadline.
  async fn invoke(&self, invocation: &Invocation) -> Result<ResultDocument, ReconcileError> {
    let instance = invocation.instance.to_string();
    let operation = invocation.operation;
    let configurator =
      self
        .configurators
        .get(&invocation.implementation)
        .ok_or_else(|| ReconcileError::UnknownConfigurator {
          instance: instance.clone(),
          name: invocation.implementation.clone(),
        })?;

    let attempts = 1 + self.config.retries.retries(operation.is_mutating());
    let mut last = None;
    for attempt in 1..=attempts {
      debug!(instance = %instance, %operation, attempt, "invoking configurator");
      let outcome = match invocation.timeout {
        Some(deadline) => match tokio::time::timeout(deadline, configurator.run(invocation)).await {
          Ok(outcome) => outcome.map_err(|source| ReconcileError::Execution {
            instance: instance.clone(),
            operation,
            source,
          }),
          Err(_) => Err(ReconcileError::Timeout {
            instance: instance.clone(),
            operation,
            secs: deadline.as_secs(),
          }),
        },
        None => configurator
          .run(invocation)
          .await
          .map_err(|source: ExecutionError| ReconcileError::Execution {
            instance: instance.clone(),
            operation,
            source,
          }),
      };
      match outcome {
        Ok(doc) => return Ok(doc),
        Err(error) => {
          warn!(instance = %instance, %operation, attempt, %error, "invocation failed");
          last = Some(error);
        }
      }
    }
    Err(last.unwrap_or(ReconcileError::Cancelled))
  }

  fn report(
    &self,
    graph: &GraphStore,
    id: &InstanceId,
    operations: Vec<Operation>,
    outcome: Outcome,
    errors: Vec<String>,
  ) -> InstanceReport {
    let instance = graph.get(id);
    let ready_state = instance.map(|i| i.ready_state).unwrap_or(ReadyState::Absent);
    let own = instance.map(|i| i.status()).unwrap_or(Status::Absent);
    let status = Status::aggregate(
      std::iter::once(own).chain(graph.targets(id).into_iter().map(|dep| dep.status())),
    );
    InstanceReport {
      instance: id.clone(),
      operations,
      outcome,
      ready_state,
      status,
      errors,
      discovered: instance.is_some_and(|i| i.discovered),
      deleted: ready_state == ReadyState::Deleted,
      last_change: instance.and_then(|i| i.last_change.clone()),
    }
  }
}

/// Waves in the order the workflow visits them.
fn ordered(dag: &DependencyDag, workflow: Workflow) -> Vec<Vec<InstanceId>> {
  let mut waves = dag.waves();
  if workflow.is_reverse() {
    waves.reverse();
  }
  waves
}

/// Resolve an operation's input expressions against `id`.
///
/// Defaults read along the way are memoized in `cache`.
pub fn resolve_inputs(
  graph: &GraphStore,
  env: &Environment,
  cache: &EvalCache,
  id: &InstanceId,
  inputs: &Mapping,
) -> Result<Mapping, EvalError> {
  let mut ctx = EvalContext::new(graph, env, cache).for_instance(id.clone());
  let mut resolved = Mapping::new();
  for (name, expr) in inputs {
    resolved.insert(name.clone(), map_value(expr, &mut ctx)?);
  }
  Ok(resolved)
}

/// Apply a step to `graph`. Returns problems that did not stop the commit.
fn apply_step(
  graph: &mut GraphStore,
  id: &InstanceId,
  step: &Step,
  change: Option<&str>,
  tombstones: TombstonePolicy,
) -> Result<Vec<String>, GraphError> {
  if !step.attributes.is_empty() {
    let mut attributes = graph.instance(id)?.attributes.clone();
    apply_layer(&mut attributes, &step.attributes, &MergeOptions::default());
    graph.replace_attributes(id, attributes)?;
  }
  graph.set_ready_state(id, step.ready_state)?;
  if step.operation == Operation::Create && step.ready_state != ReadyState::Error {
    graph.restore(id)?;
  }
  if step.operation == Operation::Delete && step.ready_state == ReadyState::Deleted {
    // Kept as a tombstone until a later discover confirms it is gone.
    graph.replace_attributes(id, Mapping::new())?;
    graph.tombstone(id)?;
  }
  if let Some(change) = change {
    graph.set_last_change(id, change)?;
  }

  let Some(reported) = &step.new_instances else {
    return Ok(Vec::new());
  };
  let mut problems = Vec::new();
  let owner_name = graph.instance(id)?.name.clone();
  let mut seen: HashSet<&str> = HashSet::new();

  for new in reported {
    seen.insert(new.name.as_str());
    if let Some(existing) = graph.find(&new.name).map(|i| i.id.clone()) {
      let patch = new.template.get("attributes").and_then(Value::as_map).cloned().unwrap_or_default();
      let mut attributes = graph.instance(&existing)?.attributes.clone();
      apply_layer(&mut attributes, &patch, &MergeOptions::default());
      graph.replace_attributes(&existing, attributes)?;
      graph.restore(&existing)?;
      graph.set_ready_state(&existing, new.ready_state.unwrap_or(ReadyState::Started))?;
      continue;
    }

    let mut body = new.template.clone();
    body
      .entry("parent".to_string())
      .or_insert_with(|| Value::from(new.parent.clone().unwrap_or_else(|| owner_name.clone())));
    let created = parse_template(&new.name, &Value::Map(body)).and_then(|template| {
      graph.create_instance(NodeTemplate {
        discovered: true,
        ready_state: Some(new.ready_state.or(template.ready_state).unwrap_or(ReadyState::Started)),
        last_change: change.map(str::to_string),
        ..template
      })
    });
    match created {
      Ok(new_id) => {
        info!(instance = %new_id, discovered_by = %id, "discovered instance");
        for (_, error) in graph.resolve_all_requirements() {
          problems.push(error.to_string());
        }
      }
      Err(error) => {
        warn!(instance = %new.name, %error, "could not add discovered instance");
        problems.push(error.to_string());
      }
    }
  }

  // Children that were not reported this time. A tombstoned one is now
  // confirmed gone; a discovered one goes by the tombstone policy.
  let unreported: Vec<(InstanceId, bool)> = graph
    .children(id)
    .into_iter()
    .filter(|child| (child.discovered || child.tombstone) && !seen.contains(child.name.as_str()))
    .map(|child| (child.id.clone(), child.tombstone))
    .collect();
  for (gone, confirmed) in unreported {
    if confirmed {
      info!(instance = %gone, "absence confirmed, removing tombstone");
      graph.remove_instance(&gone)?;
      continue;
    }
    match tombstones {
      TombstonePolicy::KeepLastKnown => {
        info!(instance = %gone, "tombstoning instance no longer reported");
        graph.tombstone(&gone)?;
      }
      TombstonePolicy::Remove => {
        info!(instance = %gone, "removing instance no longer reported");
        graph.remove_instance(&gone)?;
      }
    }
  }
  Ok(problems)
}

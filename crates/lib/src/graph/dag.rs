//! Requirement dependency DAG and wave computation.
//!
//! Edges run from a dependency to its dependent, so a wave only contains
//! instances whose requirements were all satisfied by earlier waves.

use std::collections::HashMap;

use petgraph::Direction;
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};

use super::GraphError;
use super::instance::InstanceId;
use super::store::GraphStore;

/// Dependency graph over node instances.
#[derive(Debug)]
pub struct DependencyDag {
  graph: DiGraph<InstanceId, ()>,
  nodes: HashMap<InstanceId, NodeIndex>,
}

impl DependencyDag {
  /// Build the DAG from the requirement relationships in `store`.
  ///
  /// # Errors
  ///
  /// Returns `CyclicDependency` naming every instance on a cycle.
  pub fn from_graph(store: &GraphStore) -> Result<Self, GraphError> {
    let mut graph = DiGraph::new();
    let mut nodes = HashMap::new();

    for node in store.nodes() {
      let idx = graph.add_node(node.id.clone());
      nodes.insert(node.id.clone(), idx);
    }

    for node in store.nodes() {
      let dependent = nodes[&node.id];
      for dep in store.dependencies(&node.id) {
        if let Some(&dep_idx) = nodes.get(&dep) {
          graph.add_edge(dep_idx, dependent, ());
        }
      }
    }

    let dag = Self { graph, nodes };
    dag.verify_acyclic()?;
    Ok(dag)
  }

  fn verify_acyclic(&self) -> Result<(), GraphError> {
    if toposort(&self.graph, None).is_ok() {
      return Ok(());
    }
    let mut instances: Vec<String> = tarjan_scc(&self.graph)
      .into_iter()
      .filter(|scc| scc.len() > 1 || self.graph.contains_edge(scc[0], scc[0]))
      .flatten()
      .map(|idx| self.graph[idx].to_string())
      .collect();
    instances.sort();
    Err(GraphError::CyclicDependency { instances })
  }

  /// Instances in dependency order.
  pub fn topological(&self) -> Vec<InstanceId> {
    self.waves().into_iter().flatten().collect()
  }

  /// Groups of instances that can be reconciled in parallel.
  ///
  /// Within a wave instances keep creation order.
  pub fn waves(&self) -> Vec<Vec<InstanceId>> {
    let mut in_degree: HashMap<NodeIndex, usize> = self
      .graph
      .node_indices()
      .map(|idx| (idx, self.graph.neighbors_directed(idx, Direction::Incoming).count()))
      .collect();

    let mut remaining: Vec<NodeIndex> = self.graph.node_indices().collect();
    let mut waves = Vec::new();

    while !remaining.is_empty() {
      let ready: Vec<NodeIndex> = remaining.iter().copied().filter(|idx| in_degree[idx] == 0).collect();
      // Acyclicity was verified on construction.
      if ready.is_empty() {
        break;
      }
      remaining.retain(|idx| !ready.contains(idx));
      for &idx in &ready {
        for neighbor in self.graph.neighbors_directed(idx, Direction::Outgoing) {
          if let Some(deg) = in_degree.get_mut(&neighbor) {
            *deg = deg.saturating_sub(1);
          }
        }
      }
      waves.push(ready.into_iter().map(|idx| self.graph[idx].clone()).collect());
    }

    waves
  }

  /// Direct dependencies of `id`.
  pub fn dependencies(&self, id: &InstanceId) -> Vec<InstanceId> {
    self.neighbors(id, Direction::Incoming)
  }

  /// Direct dependents of `id`.
  pub fn dependents(&self, id: &InstanceId) -> Vec<InstanceId> {
    self.neighbors(id, Direction::Outgoing)
  }

  fn neighbors(&self, id: &InstanceId, direction: Direction) -> Vec<InstanceId> {
    let Some(&idx) = self.nodes.get(id) else {
      return Vec::new();
    };
    let mut out: Vec<InstanceId> = self
      .graph
      .neighbors_directed(idx, direction)
      .map(|n| self.graph[n].clone())
      .collect();
    out.sort();
    out.dedup();
    out
  }

  pub fn len(&self) -> usize {
    self.nodes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.nodes.is_empty()
  }
}

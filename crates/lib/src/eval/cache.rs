//! Per-pass memo of computed instance values.
//!
//! Entries remember every `(instance, name)` they read together with the
//! revision each one had at the time, plus the structure revision of the
//! store. An entry is stale once any of those differs in the store asking for
//! it. Revisions come from a clock shared by every clone of a store, so one
//! cache can serve a whole pass: the per-task snapshots of a wave and the live
//! store the results are committed to.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::graph::{GraphStore, InstanceId};
use crate::value::Value;

pub(crate) type Dep = (InstanceId, String);

#[derive(Debug, Clone)]
struct Entry {
  value: Option<Value>,
  structure: u64,
  deps: Vec<(Dep, u64)>,
}

/// Shared cache for one reconciliation pass.
#[derive(Debug, Default)]
pub struct EvalCache {
  entries: Mutex<HashMap<Dep, Entry>>,
  hits: AtomicU64,
  misses: AtomicU64,
}

impl EvalCache {
  pub fn new() -> Self {
    Self::default()
  }

  /// A still-valid cached value and the reads it was derived from.
  pub(crate) fn get(&self, graph: &GraphStore, id: &InstanceId, name: &str) -> Option<(Option<Value>, Vec<Dep>)> {
    let entries = self.entries.lock().ok()?;
    let found = entries
      .get(&(id.clone(), name.to_string()))
      .filter(|entry| Self::is_fresh(graph, entry));
    match found {
      Some(entry) => {
        self.hits.fetch_add(1, Ordering::Relaxed);
        Some((entry.value.clone(), entry.deps.iter().map(|(dep, _)| dep.clone()).collect()))
      }
      None => {
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
      }
    }
  }

  fn is_fresh(graph: &GraphStore, entry: &Entry) -> bool {
    if graph.structure_revision() != entry.structure {
      return false;
    }
    entry.deps.iter().all(|((id, name), seen)| {
      graph
        .get(id)
        .is_some_and(|instance| instance.revision_of(name) == *seen)
    })
  }

  /// Record `value` as computed against `graph` from `deps`.
  pub(crate) fn insert(&self, graph: &GraphStore, id: &InstanceId, name: &str, value: Option<Value>, deps: Vec<Dep>) {
    let deps = deps
      .into_iter()
      .map(|dep| {
        let seen = graph.get(&dep.0).map(|i| i.revision_of(&dep.1)).unwrap_or(0);
        (dep, seen)
      })
      .collect();
    let entry = Entry {
      value,
      structure: graph.structure_revision(),
      deps,
    };
    if let Ok(mut entries) = self.entries.lock() {
      entries.insert((id.clone(), name.to_string()), entry);
    }
  }

  /// Drop the entry for `(id, name)` and every entry derived from it.
  pub fn invalidate(&self, id: &InstanceId, name: &str) {
    let Ok(mut entries) = self.entries.lock() else {
      return;
    };
    let mut doomed = vec![(id.clone(), name.to_string())];
    while let Some(key) = doomed.pop() {
      entries.remove(&key);
      let dependents: Vec<Dep> = entries
        .iter()
        .filter(|(_, entry)| entry.deps.iter().any(|(dep, _)| *dep == key))
        .map(|(k, _)| k.clone())
        .collect();
      doomed.extend(dependents);
    }
  }

  /// Drop every entry computed for or from `id`.
  pub fn invalidate_instance(&self, id: &InstanceId) {
    if let Ok(mut entries) = self.entries.lock() {
      entries.retain(|(owner, _), entry| owner != id && !entry.deps.iter().any(|((dep, _), _)| dep == id));
    }
  }

  pub fn clear(&self) {
    if let Ok(mut entries) = self.entries.lock() {
      entries.clear();
    }
  }

  pub fn len(&self) -> usize {
    self.entries.lock().map(|e| e.len()).unwrap_or(0)
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// `(hits, misses)` since creation.
  pub fn stats(&self) -> (u64, u64) {
    (self.hits.load(Ordering::Relaxed), self.misses.load(Ordering::Relaxed))
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use super::*;
  use crate::graph::{NodeTemplate, StaticSchema};

  fn graph() -> (GraphStore, InstanceId) {
    let mut g = GraphStore::new(Arc::new(StaticSchema::default()));
    let id = g.create_instance(NodeTemplate::new("a", "Root")).unwrap();
    (g, id)
  }

  #[test]
  fn entry_goes_stale_when_dependency_written() {
    let (mut g, id) = graph();
    let cache = EvalCache::new();
    let deps = vec![(id.clone(), "x".to_string()), (id.clone(), "derived".to_string())];
    cache.insert(&g, &id, "derived", Some(Value::Int(1)), deps);
    assert!(cache.get(&g, &id, "derived").is_some());

    g.set_attribute(&id, "x", Value::Int(2)).unwrap();
    assert!(cache.get(&g, &id, "derived").is_none());
  }

  #[test]
  fn entry_goes_stale_on_structure_change() {
    let (mut g, id) = graph();
    let cache = EvalCache::new();
    cache.insert(&g, &id, "derived", None, vec![]);
    g.create_instance(NodeTemplate::new("b", "Root")).unwrap();
    assert!(cache.get(&g, &id, "derived").is_none());
  }

  #[test]
  fn invalidate_cascades_to_dependents() {
    let (g, id) = graph();
    let cache = EvalCache::new();
    cache.insert(&g, &id, "base", Some(Value::Int(1)), vec![]);
    cache.insert(
      &g,
      &id,
      "derived",
      Some(Value::Int(2)),
      vec![(id.clone(), "base".to_string())],
    );
    cache.insert(&g, &id, "other", Some(Value::Int(3)), vec![]);

    cache.invalidate(&id, "base");
    assert_eq!(cache.len(), 1);
    assert!(cache.get(&g, &id, "other").is_some());
  }

  #[test]
  fn snapshot_writes_do_not_leak_into_sibling_snapshots() {
    let (g, id) = graph();
    let cache = EvalCache::new();
    let mut left = g.clone();
    let right = g.clone();
    left.set_attribute(&id, "x", Value::Int(1)).unwrap();

    let deps = vec![(id.clone(), "x".to_string())];
    cache.insert(&left, &id, "derived", Some(Value::Int(1)), deps);
    assert!(cache.get(&left, &id, "derived").is_some());
    assert!(cache.get(&right, &id, "derived").is_none());
    assert!(cache.get(&g, &id, "derived").is_none());
  }
}

//! The instance graph store.
//!
//! Instances are held behind `Arc` so that cloning a store is cheap: the
//! reconciler hands each wave a frozen clone and commits results back into
//! the live store, copying only the instances it touches.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexMap;
use tracing::{debug, trace};

use super::GraphError;
use super::instance::{Instance, InstanceId, InstanceKind, Occurrences, ReadyState, RequirementAssignment};
use super::schema::{SchemaLookup, TypeSchema};
use crate::value::{Mapping, Value};

/// Capability every node exposes, used by requirements with no capability constraint.
pub const FEATURE_CAPABILITY: &str = "feature";
const FEATURE_CAPABILITY_TYPE: &str = "tosca.capabilities.Node";
const DEFAULT_RELATIONSHIP_TYPE: &str = "tosca.relationships.DependsOn";
const HOST_REQUIREMENT: &str = "host";

/// Key under which ready state changes are versioned.
pub(crate) const READY_STATE_KEY: &str = ".readyState";

/// Everything needed to create a node instance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeTemplate {
  pub name: String,
  pub type_name: String,
  pub parent: Option<String>,
  pub properties: Mapping,
  pub attributes: Mapping,
  /// Properties for capability instances, by capability name.
  pub capabilities: IndexMap<String, Mapping>,
  pub requirements: Vec<RequirementAssignment>,
  pub ready_state: Option<ReadyState>,
  pub tombstone: bool,
  pub discovered: bool,
  pub last_change: Option<String>,
}

impl NodeTemplate {
  pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      type_name: type_name.into(),
      ..Default::default()
    }
  }

  pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
    self.parent = Some(parent.into());
    self
  }

  pub fn with_property(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
    self.properties.insert(name.into(), value.into());
    self
  }

  pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
    self.attributes.insert(name.into(), value.into());
    self
  }

  pub fn with_requirement(mut self, requirement: RequirementAssignment) -> Self {
    self.requirements.push(requirement);
    self
  }
}

/// Typed instances with parent and requirement links.
#[derive(Debug, Clone)]
pub struct GraphStore {
  schema: Arc<dyn SchemaLookup>,
  instances: IndexMap<InstanceId, Arc<Instance>>,
  inputs: Arc<Mapping>,
  /// Revision of the latest mutation visible in this store.
  revision: u64,
  /// Revision of the latest change to the set of instances or their links.
  structure_revision: u64,
  /// Shared by every clone so revisions are unique across snapshots.
  clock: Arc<AtomicU64>,
}

impl GraphStore {
  pub fn new(schema: Arc<dyn SchemaLookup>) -> Self {
    Self {
      schema,
      instances: IndexMap::new(),
      inputs: Arc::new(Mapping::new()),
      revision: 0,
      structure_revision: 0,
      clock: Arc::new(AtomicU64::new(0)),
    }
  }

  pub fn with_inputs(mut self, inputs: Mapping) -> Self {
    self.inputs = Arc::new(inputs);
    self
  }

  pub fn schema(&self) -> &Arc<dyn SchemaLookup> {
    &self.schema
  }

  pub fn inputs(&self) -> &Mapping {
    &self.inputs
  }

  pub fn revision(&self) -> u64 {
    self.revision
  }

  pub fn structure_revision(&self) -> u64 {
    self.structure_revision
  }

  fn next_revision(&mut self) -> u64 {
    let rev = self.clock.fetch_add(1, Ordering::SeqCst) + 1;
    self.revision = rev;
    rev
  }

  fn bump_structure(&mut self) {
    self.structure_revision = self.next_revision();
  }

  pub fn resolve_type(&self, instance: &Instance) -> Result<Arc<TypeSchema>, GraphError> {
    self.schema.resolve_type(&instance.type_name)
  }

  // -- lookup ----------------------------------------------------------------

  pub fn get(&self, id: &InstanceId) -> Option<&Instance> {
    self.instances.get(id).map(Arc::as_ref)
  }

  pub fn instance(&self, id: &InstanceId) -> Result<&Instance, GraphError> {
    self.get(id).ok_or_else(|| GraphError::UnknownInstance(id.to_string()))
  }

  pub fn contains(&self, id: &InstanceId) -> bool {
    self.instances.contains_key(id)
  }

  /// Node instance by template name.
  pub fn find(&self, name: &str) -> Option<&Instance> {
    self
      .instances
      .get(&InstanceId::new(name))
      .map(Arc::as_ref)
      .filter(|i| i.kind == InstanceKind::Node)
  }

  /// Every instance in creation order.
  pub fn instances(&self) -> impl Iterator<Item = &Instance> {
    self.instances.values().map(Arc::as_ref)
  }

  /// Node instances in creation order.
  pub fn nodes(&self) -> impl Iterator<Item = &Instance> {
    self.instances().filter(|i| i.kind == InstanceKind::Node)
  }

  pub fn len(&self) -> usize {
    self.instances.len()
  }

  pub fn is_empty(&self) -> bool {
    self.instances.is_empty()
  }

  // -- navigation ------------------------------------------------------------

  pub fn parent(&self, id: &InstanceId) -> Option<&Instance> {
    let instance = self.get(id)?;
    instance
      .parent
      .as_ref()
      .or(instance.owner.as_ref())
      .and_then(|p| self.get(p))
  }

  /// The instance itself followed by each parent up to the root.
  pub fn ancestors(&self, id: &InstanceId) -> Vec<&Instance> {
    let mut chain = Vec::new();
    let mut current = self.get(id);
    while let Some(instance) = current {
      if chain.iter().any(|seen: &&Instance| seen.id == instance.id) {
        break;
      }
      chain.push(instance);
      current = self.parent(&instance.id);
    }
    chain
  }

  pub fn root(&self, id: &InstanceId) -> Option<&Instance> {
    self.ancestors(id).last().copied()
  }

  pub fn children(&self, id: &InstanceId) -> Vec<&Instance> {
    self.nodes().filter(|i| i.parent.as_ref() == Some(id)).collect()
  }

  /// The instance and all of its descendants, depth first.
  pub fn descendants(&self, id: &InstanceId) -> Vec<&Instance> {
    let mut out = Vec::new();
    let mut stack: Vec<&Instance> = self.get(id).into_iter().collect();
    while let Some(instance) = stack.pop() {
      out.push(instance);
      let mut children = self.children(&instance.id);
      children.reverse();
      stack.extend(children);
    }
    out
  }

  pub fn capabilities(&self, id: &InstanceId) -> Vec<&Instance> {
    self
      .instances()
      .filter(|i| i.kind == InstanceKind::Capability && i.owner.as_ref() == Some(id))
      .collect()
  }

  pub fn capability(&self, id: &InstanceId, name: &str) -> Option<&Instance> {
    self.get(&InstanceId::capability(id, name))
  }

  /// Relationship instances created from `id`'s requirements.
  pub fn requirements_of(&self, id: &InstanceId) -> Vec<&Instance> {
    self
      .get(id)
      .map(|i| i.relationships.iter().filter_map(|r| self.get(r)).collect())
      .unwrap_or_default()
  }

  /// Relationship instances that target one of `id`'s capabilities.
  pub fn relationships_to(&self, id: &InstanceId) -> Vec<&Instance> {
    self
      .instances()
      .filter(|i| i.kind == InstanceKind::Relationship)
      .filter(|rel| self.target_node(&rel.id).map(|t| &t.id) == Some(id))
      .collect()
  }

  /// Node a relationship points at.
  pub fn target_node(&self, relationship: &InstanceId) -> Option<&Instance> {
    let cap = self.get(relationship)?.target.as_ref()?;
    self.get(self.get(cap)?.owner.as_ref()?)
  }

  /// Node a relationship originates from.
  pub fn source_node(&self, relationship: &InstanceId) -> Option<&Instance> {
    self.get(self.get(relationship)?.owner.as_ref()?)
  }

  /// Nodes `id` requires, in requirement order.
  pub fn targets(&self, id: &InstanceId) -> Vec<&Instance> {
    self
      .requirements_of(id)
      .into_iter()
      .filter_map(|rel| self.target_node(&rel.id))
      .collect()
  }

  /// Nodes that require `id`.
  pub fn sources(&self, id: &InstanceId) -> Vec<&Instance> {
    self
      .relationships_to(id)
      .into_iter()
      .filter_map(|rel| self.source_node(&rel.id))
      .collect()
  }

  /// Target of the nearest `host` requirement, walking up the parent chain.
  pub fn host_of(&self, id: &InstanceId) -> Option<&Instance> {
    for instance in self.ancestors(id) {
      let host = self
        .requirements_of(&instance.id)
        .into_iter()
        .find(|rel| rel.name == HOST_REQUIREMENT || rel.type_name.ends_with("HostedOn"));
      if let Some(rel) = host {
        return self.target_node(&rel.id);
      }
    }
    None
  }

  /// Node ids `id` depends on through its requirements.
  pub fn dependencies(&self, id: &InstanceId) -> Vec<InstanceId> {
    self.targets(id).into_iter().map(|i| i.id.clone()).collect()
  }

  // -- mutation --------------------------------------------------------------

  /// Create a node instance and its capability instances.
  pub fn create_instance(&mut self, template: NodeTemplate) -> Result<InstanceId, GraphError> {
    let id = InstanceId::new(template.name.clone());
    if self.instances.contains_key(&id) {
      return Err(GraphError::DuplicateInstance(template.name));
    }
    if template.type_name.is_empty() {
      return Err(GraphError::InvalidTemplate {
        name: template.name,
        message: "missing type".to_string(),
      });
    }
    let type_schema = self.schema.resolve_type(&template.type_name)?;

    let parent = match &template.parent {
      Some(name) => {
        let parent_id = InstanceId::new(name.clone());
        if !self.contains(&parent_id) {
          return Err(GraphError::UnknownInstance(name.clone()));
        }
        Some(parent_id)
      }
      None => None,
    };

    let rev = self.next_revision();
    let mut instance = Instance::new(id.clone(), template.name.clone(), InstanceKind::Node, template.type_name);
    instance.parent = parent;
    instance.properties = template.properties;
    instance.attributes = template.attributes;
    instance.requirements = template.requirements;
    instance.ready_state = template.ready_state.unwrap_or_default();
    instance.tombstone = template.tombstone;
    instance.discovered = template.discovered;
    instance.last_change = template.last_change;
    for key in instance.attributes.keys().chain(instance.properties.keys()) {
      instance.revisions.insert(key.clone(), rev);
    }
    self.instances.insert(id.clone(), Arc::new(instance));

    let mut capabilities: Vec<(String, String)> = type_schema
      .capabilities
      .iter()
      .map(|(name, def)| (name.clone(), def.type_name.clone()))
      .collect();
    if !type_schema.capabilities.contains_key(FEATURE_CAPABILITY) {
      capabilities.push((FEATURE_CAPABILITY.to_string(), FEATURE_CAPABILITY_TYPE.to_string()));
    }
    for (cap_name, cap_type) in capabilities {
      let cap_id = InstanceId::capability(&id, &cap_name);
      let mut cap = Instance::new(cap_id.clone(), cap_name.clone(), InstanceKind::Capability, cap_type);
      cap.owner = Some(id.clone());
      cap.properties = template.capabilities.get(&cap_name).cloned().unwrap_or_default();
      self.instances.insert(cap_id, Arc::new(cap));
    }

    self.bump_structure();
    debug!(instance = %id, "created instance");
    Ok(id)
  }

  fn instance_mut(&mut self, id: &InstanceId) -> Result<&mut Instance, GraphError> {
    self
      .instances
      .get_mut(id)
      .map(Arc::make_mut)
      .ok_or_else(|| GraphError::UnknownInstance(id.to_string()))
  }

  pub fn set_attribute(&mut self, id: &InstanceId, name: &str, value: Value) -> Result<(), GraphError> {
    let rev = self.next_revision();
    let instance = self.instance_mut(id)?;
    instance.attributes.insert(name.to_string(), value);
    instance.revisions.insert(name.to_string(), rev);
    Ok(())
  }

  /// Replace all attributes, versioning only the keys whose value changed.
  pub fn replace_attributes(&mut self, id: &InstanceId, attributes: Mapping) -> Result<Vec<String>, GraphError> {
    let rev = self.next_revision();
    let instance = self.instance_mut(id)?;
    let mut changed: Vec<String> = instance
      .attributes
      .iter()
      .filter(|(k, v)| attributes.get(*k) != Some(*v))
      .map(|(k, _)| k.clone())
      .collect();
    changed.extend(
      attributes
        .keys()
        .filter(|k| !instance.attributes.contains_key(*k))
        .cloned(),
    );
    for key in &changed {
      instance.revisions.insert(key.clone(), rev);
    }
    instance.attributes = attributes;
    Ok(changed)
  }

  pub fn set_ready_state(&mut self, id: &InstanceId, state: ReadyState) -> Result<(), GraphError> {
    let rev = self.next_revision();
    let instance = self.instance_mut(id)?;
    if instance.ready_state != state {
      trace!(instance = %id, from = %instance.ready_state, to = %state, "ready state");
      instance.ready_state = state;
      instance.revisions.insert(READY_STATE_KEY.to_string(), rev);
    }
    Ok(())
  }

  pub fn set_last_change(&mut self, id: &InstanceId, change: &str) -> Result<(), GraphError> {
    self.instance_mut(id)?.last_change = Some(change.to_string());
    Ok(())
  }

  /// Mark an instance deleted but keep it for later confirmation.
  pub fn tombstone(&mut self, id: &InstanceId) -> Result<(), GraphError> {
    let rev = self.next_revision();
    let instance = self.instance_mut(id)?;
    instance.tombstone = true;
    instance.ready_state = ReadyState::Deleted;
    instance.revisions.insert(READY_STATE_KEY.to_string(), rev);
    Ok(())
  }

  /// Clear a tombstone after the instance was seen again.
  pub fn restore(&mut self, id: &InstanceId) -> Result<(), GraphError> {
    let instance = self.instance_mut(id)?;
    if instance.tombstone {
      debug!(instance = %id, "restoring tombstoned instance");
      instance.tombstone = false;
    }
    Ok(())
  }

  /// Remove a node along with its capabilities, its relationships and any
  /// relationships that targeted it.
  pub fn remove_instance(&mut self, id: &InstanceId) -> Result<(), GraphError> {
    if !self.contains(id) {
      return Err(GraphError::UnknownInstance(id.to_string()));
    }
    let caps: Vec<InstanceId> = self.capabilities(id).into_iter().map(|c| c.id.clone()).collect();
    let doomed: Vec<InstanceId> = self
      .instances()
      .filter(|i| {
        &i.id == id
          || i.owner.as_ref() == Some(id)
          || i.target.as_ref().is_some_and(|t| caps.contains(t))
      })
      .map(|i| i.id.clone())
      .collect();

    for gone in &doomed {
      self.instances.shift_remove(gone);
    }
    let sources: Vec<InstanceId> = self
      .nodes()
      .filter(|n| n.relationships.iter().any(|r| doomed.contains(r)))
      .map(|n| n.id.clone())
      .collect();
    for source in sources {
      self.instance_mut(&source)?.relationships.retain(|r| !doomed.contains(r));
    }

    self.bump_structure();
    debug!(instance = %id, removed = doomed.len(), "removed instance");
    Ok(())
  }

  // -- requirements ----------------------------------------------------------

  fn capability_occurrences(&self, capability: &Instance) -> Occurrences {
    capability
      .owner
      .as_ref()
      .and_then(|owner| self.get(owner))
      .and_then(|owner| self.resolve_type(owner).ok())
      .and_then(|schema| schema.capabilities.get(&capability.name).map(|d| d.occurrences))
      .unwrap_or(Occurrences::UNBOUNDED)
  }

  fn incoming_count(&self, capability: &InstanceId) -> usize {
    self
      .instances()
      .filter(|i| i.kind == InstanceKind::Relationship && i.target.as_ref() == Some(capability))
      .count()
  }

  fn capability_matches(&self, capability: &Instance, required: &str) -> bool {
    if required.is_empty() {
      return capability.name == FEATURE_CAPABILITY;
    }
    capability.name == required || self.schema.is_compatible(&capability.type_name, required)
  }

  fn requirement_spec(&self, instance: &Instance, requirement: &str) -> Result<RequirementSpec, GraphError> {
    let schema = self.resolve_type(instance)?;
    let def = schema.requirements.get(requirement);
    let assignment = instance.requirements.iter().find(|r| r.name == requirement);
    if def.is_none() && assignment.is_none() {
      return Err(GraphError::UnsatisfiedRequirement {
        instance: instance.name.clone(),
        requirement: requirement.to_string(),
      });
    }
    Ok(RequirementSpec {
      capability: assignment
        .and_then(|a| a.capability.clone())
        .or_else(|| def.map(|d| d.capability.clone()))
        .unwrap_or_default(),
      node: assignment.and_then(|a| a.node.clone()),
      node_type: def.and_then(|d| d.node.clone()),
      relationship: assignment
        .and_then(|a| a.relationship.clone())
        .or_else(|| def.and_then(|d| d.relationship.clone()))
        .unwrap_or_else(|| DEFAULT_RELATIONSHIP_TYPE.to_string()),
      occurrences: def.map(|d| d.occurrences).unwrap_or(Occurrences::EXACTLY_ONE),
      properties: assignment.map(|a| a.properties.clone()).unwrap_or_default(),
    })
  }

  /// Names of every requirement declared by the type or the template.
  pub fn requirement_names(&self, id: &InstanceId) -> Result<Vec<String>, GraphError> {
    let instance = self.instance(id)?;
    let schema = self.resolve_type(instance)?;
    let mut names: Vec<String> = schema.requirements.keys().cloned().collect();
    for assignment in &instance.requirements {
      if !names.contains(&assignment.name) {
        names.push(assignment.name.clone());
      }
    }
    Ok(names)
  }

  /// Connect `source`'s `requirement` to `capability`.
  pub fn link_relationship(
    &mut self,
    source: &InstanceId,
    requirement: &str,
    capability: &InstanceId,
  ) -> Result<InstanceId, GraphError> {
    let source_instance = self.instance(source)?;
    if source_instance.kind != InstanceKind::Node {
      return Err(GraphError::NotANode(source.to_string()));
    }
    let spec = self.requirement_spec(source_instance, requirement)?;
    let cap = self.instance(capability)?;
    if cap.kind != InstanceKind::Capability {
      return Err(GraphError::InvalidTemplate {
        name: source.to_string(),
        message: format!("'{capability}' is not a capability"),
      });
    }
    if !self.capability_matches(cap, &spec.capability) {
      return Err(GraphError::IncompatibleCapability {
        capability: capability.to_string(),
        capability_type: cap.type_name.clone(),
        required: spec.capability,
      });
    }
    if !self.capability_occurrences(cap).allows(self.incoming_count(capability)) {
      return Err(GraphError::UnsatisfiedRequirement {
        instance: source.to_string(),
        requirement: requirement.to_string(),
      });
    }

    let rel_id = InstanceId::relationship(source, requirement, capability);
    let mut rel = Instance::new(rel_id.clone(), requirement, InstanceKind::Relationship, spec.relationship);
    rel.owner = Some(source.clone());
    rel.target = Some(capability.clone());
    rel.properties = spec.properties;
    self.instances.insert(rel_id.clone(), Arc::new(rel));
    self.instance_mut(source)?.relationships.push(rel_id.clone());
    self.bump_structure();
    debug!(source = %source, requirement, target = %capability, "linked relationship");
    Ok(rel_id)
  }

  /// Find and link the target of `requirement`.
  ///
  /// An explicit target node is tried first, then any node with a compatible
  /// capability whose occurrences are not exhausted. Returns the target node,
  /// or `None` for an optional requirement with no match.
  pub fn resolve_requirement(&mut self, id: &InstanceId, requirement: &str) -> Result<Option<InstanceId>, GraphError> {
    let instance = self.instance(id)?;
    if instance.kind != InstanceKind::Node {
      return Err(GraphError::NotANode(id.to_string()));
    }
    if let Some(existing) = instance
      .relationships
      .iter()
      .filter_map(|r| self.get(r))
      .find(|rel| rel.name == requirement)
    {
      return Ok(self.target_node(&existing.id).map(|n| n.id.clone()));
    }

    let spec = self.requirement_spec(instance, requirement)?;
    let unsatisfied = || GraphError::UnsatisfiedRequirement {
      instance: id.to_string(),
      requirement: requirement.to_string(),
    };

    let capability = match &spec.node {
      Some(node) => {
        let node_id = InstanceId::new(node.clone());
        let target = self.find(node).ok_or_else(unsatisfied)?;
        let caps = self.capabilities(&target.id);
        match caps.iter().find(|c| self.capability_matches(c, &spec.capability)) {
          Some(cap) => Some(cap.id.clone()),
          None => {
            return Err(GraphError::IncompatibleCapability {
              capability: node_id.to_string(),
              capability_type: target.type_name.clone(),
              required: spec.capability,
            });
          }
        }
      }
      None => self.search_capability(id, &spec),
    };

    match capability {
      Some(cap) => {
        self.link_relationship(id, requirement, &cap)?;
        Ok(self.get(&cap).and_then(|c| c.owner.clone()))
      }
      None if spec.occurrences.min == 0 => Ok(None),
      None => Err(unsatisfied()),
    }
  }

  fn search_capability(&self, requester: &InstanceId, spec: &RequirementSpec) -> Option<InstanceId> {
    for node in self.nodes() {
      if &node.id == requester || node.tombstone {
        continue;
      }
      if let Some(node_type) = &spec.node_type {
        let Ok(schema) = self.resolve_type(node) else { continue };
        if !schema.is_a(node_type) {
          continue;
        }
      }
      let found = self.capabilities(&node.id).into_iter().find(|cap| {
        self.capability_matches(cap, &spec.capability)
          && self.capability_occurrences(cap).allows(self.incoming_count(&cap.id))
      });
      if let Some(cap) = found {
        return Some(cap.id.clone());
      }
    }
    None
  }

  /// Resolve every declared requirement of every node.
  ///
  /// Returns the failures by requesting node; satisfiable requirements are
  /// linked regardless.
  pub fn resolve_all_requirements(&mut self) -> Vec<(InstanceId, GraphError)> {
    let nodes: Vec<InstanceId> = self.nodes().filter(|n| !n.tombstone).map(|n| n.id.clone()).collect();
    let mut errors = Vec::new();
    for id in nodes {
      let names = match self.requirement_names(&id) {
        Ok(names) => names,
        Err(e) => {
          errors.push((id, e));
          continue;
        }
      };
      for name in names {
        if let Err(e) = self.resolve_requirement(&id, &name) {
          errors.push((id.clone(), e));
        }
      }
    }
    errors
  }
}

struct RequirementSpec {
  capability: String,
  node: Option<String>,
  node_type: Option<String>,
  relationship: String,
  occurrences: Occurrences,
  properties: Mapping,
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::graph::StaticSchema;

  fn store(types: &str) -> GraphStore {
    let types = match Value::parse_yaml(types).unwrap() {
      Value::Map(m) => m,
      Value::Null => Mapping::new(),
      _ => panic!("types must be a mapping"),
    };
    GraphStore::new(Arc::new(StaticSchema::new(types)))
  }

  const TYPES: &str = r#"
Cluster:
  capabilities:
    host: {type: Container, occurrences: [0, 1]}
Namespace:
  requirements:
    - host: {capability: Container, relationship: HostedOn}
Optional:
  requirements:
    - db: {capability: Database, occurrences: [0, 1]}
"#;

  #[test]
  fn create_rejects_duplicates_and_unknown_parents() {
    let mut g = store(TYPES);
    g.create_instance(NodeTemplate::new("a", "Cluster")).unwrap();
    assert_eq!(
      g.create_instance(NodeTemplate::new("a", "Cluster")),
      Err(GraphError::DuplicateInstance("a".into()))
    );
    assert_eq!(
      g.create_instance(NodeTemplate::new("b", "Cluster").with_parent("missing")),
      Err(GraphError::UnknownInstance("missing".into()))
    );
  }

  #[test]
  fn creates_capability_instances() {
    let mut g = store(TYPES);
    let id = g.create_instance(NodeTemplate::new("k8s", "Cluster")).unwrap();
    let names: Vec<_> = g.capabilities(&id).iter().map(|c| c.name.clone()).collect();
    assert_eq!(names, vec!["host", "feature"]);
  }

  #[test]
  fn ancestors_start_with_self() {
    let mut g = store(TYPES);
    g.create_instance(NodeTemplate::new("org", "Root")).unwrap();
    g.create_instance(NodeTemplate::new("folder", "Root").with_parent("org")).unwrap();
    let leaf = g.create_instance(NodeTemplate::new("leaf", "Root").with_parent("folder")).unwrap();
    let names: Vec<_> = g.ancestors(&leaf).iter().map(|i| i.name.clone()).collect();
    assert_eq!(names, vec!["leaf", "folder", "org"]);
    assert_eq!(g.root(&leaf).unwrap().name, "org");
    let desc: Vec<_> = g
      .descendants(&InstanceId::new("org"))
      .iter()
      .map(|i| i.name.clone())
      .collect();
    assert_eq!(desc, vec!["org", "folder", "leaf"]);
  }

  #[test]
  fn requirement_resolves_by_capability_type() {
    let mut g = store(TYPES);
    g.create_instance(NodeTemplate::new("cluster", "Cluster")).unwrap();
    let ns = g.create_instance(NodeTemplate::new("ns", "Namespace")).unwrap();
    let target = g.resolve_requirement(&ns, "host").unwrap();
    assert_eq!(target, Some(InstanceId::new("cluster")));
    assert_eq!(g.host_of(&ns).unwrap().name, "cluster");
    assert_eq!(g.sources(&InstanceId::new("cluster"))[0].name, "ns");
  }

  #[test]
  fn exhausted_occurrences_are_skipped() {
    let mut g = store(TYPES);
    g.create_instance(NodeTemplate::new("cluster", "Cluster")).unwrap();
    let a = g.create_instance(NodeTemplate::new("a", "Namespace")).unwrap();
    let b = g.create_instance(NodeTemplate::new("b", "Namespace")).unwrap();
    assert!(g.resolve_requirement(&a, "host").unwrap().is_some());
    assert_eq!(
      g.resolve_requirement(&b, "host"),
      Err(GraphError::UnsatisfiedRequirement {
        instance: "b".into(),
        requirement: "host".into()
      })
    );
  }

  #[test]
  fn optional_requirement_resolves_to_none() {
    let mut g = store(TYPES);
    let id = g.create_instance(NodeTemplate::new("app", "Optional")).unwrap();
    assert_eq!(g.resolve_requirement(&id, "db"), Ok(None));
  }

  #[test]
  fn explicit_target_must_be_compatible() {
    let mut g = store(TYPES);
    g.create_instance(NodeTemplate::new("plain", "Root")).unwrap();
    let ns = g
      .create_instance(NodeTemplate::new("ns", "Namespace").with_requirement(RequirementAssignment {
        name: "host".into(),
        node: Some("plain".into()),
        ..Default::default()
      }))
      .unwrap();
    assert!(matches!(
      g.resolve_requirement(&ns, "host"),
      Err(GraphError::IncompatibleCapability { .. })
    ));
  }

  #[test]
  fn remove_drops_links() {
    let mut g = store(TYPES);
    g.create_instance(NodeTemplate::new("cluster", "Cluster")).unwrap();
    let ns = g.create_instance(NodeTemplate::new("ns", "Namespace")).unwrap();
    g.resolve_requirement(&ns, "host").unwrap();
    g.remove_instance(&InstanceId::new("cluster")).unwrap();
    assert!(g.requirements_of(&ns).is_empty());
    assert!(g.get(&ns).unwrap().relationships.is_empty());
  }

  #[test]
  fn clones_share_instances_until_written() {
    let mut g = store(TYPES);
    let id = g.create_instance(NodeTemplate::new("a", "Root")).unwrap();
    let snapshot = g.clone();
    g.set_attribute(&id, "x", Value::Int(1)).unwrap();
    assert!(snapshot.get(&id).unwrap().attributes.is_empty());
    assert_eq!(g.get(&id).unwrap().attributes["x"], Value::Int(1));
    assert!(g.revision() > snapshot.revision());
  }

  #[test]
  fn replace_attributes_reports_changed_keys() {
    let mut g = store(TYPES);
    let id = g
      .create_instance(NodeTemplate::new("a", "Root").with_attribute("keep", 1).with_attribute("drop", 2))
      .unwrap();
    let mut next = Mapping::new();
    next.insert("keep".into(), Value::Int(1));
    next.insert("new".into(), Value::Int(3));
    let changed = g.replace_attributes(&id, next).unwrap();
    assert_eq!(changed, vec!["drop", "new"]);
  }
}

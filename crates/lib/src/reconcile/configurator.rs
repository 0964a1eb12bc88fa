//! The configurator seam: anything that can carry out an operation.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;

use super::shell::ShellConfigurator;
use super::types::{ExecutionError, Invocation, ResultDocument};

/// Runs one operation against the outside world.
///
/// `Err` means the invocation itself failed and may be retried. A tool that
/// ran and found the resource broken reports `Ok` with an error ready state.
#[async_trait]
pub trait Configurator: Send + Sync + Debug {
  async fn run(&self, invocation: &Invocation) -> Result<ResultDocument, ExecutionError>;
}

/// Configurators by implementation name.
#[derive(Debug, Clone, Default)]
pub struct Configurators {
  by_name: HashMap<String, Arc<dyn Configurator>>,
}

impl Configurators {
  pub fn new() -> Self {
    Self::default()
  }

  /// The built-in set: `shell`.
  pub fn builtin() -> Self {
    Self::new().with("shell", ShellConfigurator::default())
  }

  pub fn with(mut self, name: impl Into<String>, configurator: impl Configurator + 'static) -> Self {
    self.register(name, Arc::new(configurator));
    self
  }

  pub fn register(&mut self, name: impl Into<String>, configurator: Arc<dyn Configurator>) {
    self.by_name.insert(name.into(), configurator);
  }

  pub fn get(&self, name: &str) -> Option<Arc<dyn Configurator>> {
    self.by_name.get(name).cloned()
  }

  pub fn names(&self) -> Vec<&str> {
    let mut names: Vec<&str> = self.by_name.keys().map(String::as_str).collect();
    names.sort();
    names
  }
}

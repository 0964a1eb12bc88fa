//! Engine settings.
//!
//! Settings live under the `engine:` key of the configuration documents, so
//! they layer like everything else: home, then project, then environment,
//! then ensemble.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::merge::Strategy;
use crate::value::{Mapping, Value};

/// Key of the engine settings in a merged document.
pub const ENGINE_KEY: &str = "engine";

/// The `engine:` section could not be read.
#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("invalid engine settings: {0}")]
  Invalid(String),
}

/// What happens to an instance a discovery pass no longer reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TombstonePolicy {
  /// Mark it deleted but keep its last known attributes.
  #[default]
  KeepLastKnown,
  /// Drop it from the graph right away.
  Remove,
}

/// Ready state given to upstream statuses missing from a status map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnmappedStatus {
  /// Report `unknown`, which leaves the instance healthy enough to proceed.
  #[default]
  Unknown,
  /// Report `error`, degrading the instance.
  Error,
}

/// How often a failed configurator invocation is retried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
  /// Extra attempts for operations with side effects.
  pub mutating: u32,
  /// Extra attempts for `check` and `discover`; `None` means up to `idempotent_cap`.
  pub idempotent: Option<u32>,
  /// Upper bound on idempotent retries, and their number when none is set.
  pub idempotent_cap: u32,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      mutating: 0,
      idempotent: None,
      idempotent_cap: 5,
    }
  }
}

impl RetryPolicy {
  /// Extra attempts allowed after a failed invocation.
  pub fn retries(&self, mutating: bool) -> u32 {
    if mutating {
      self.mutating
    } else {
      self.idempotent.unwrap_or(self.idempotent_cap).min(self.idempotent_cap)
    }
  }
}

/// Settings for reconciliation passes, read from the merged `engine:` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
  /// Configurator invocations that may run at once.
  pub parallelism: usize,
  pub retries: RetryPolicy,
  /// Deadline for one configurator invocation, unless the operation sets its own.
  pub timeout_secs: Option<u64>,
  pub tombstones: TombstonePolicy,
  pub unmapped_status: UnmappedStatus,
  /// Strategy for mapping keys that carry no merge directive.
  pub default_merge: Strategy,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      parallelism: 1,
      retries: RetryPolicy::default(),
      timeout_secs: None,
      tombstones: TombstonePolicy::default(),
      unmapped_status: UnmappedStatus::default(),
      default_merge: Strategy::Replace,
    }
  }
}

impl EngineConfig {
  /// Read the `engine:` section of a merged document. A missing section yields the defaults.
  pub fn from_document(root: &Mapping) -> Result<Self, ConfigError> {
    match root.get(ENGINE_KEY) {
      None | Some(Value::Null) => Ok(Self::default()),
      Some(section) => Self::from_value(section),
    }
  }

  pub fn from_value(value: &Value) -> Result<Self, ConfigError> {
    let json = serde_json::to_value(value).map_err(|e| ConfigError::Invalid(e.to_string()))?;
    let config: Self = serde_json::from_value(json).map_err(|e| ConfigError::Invalid(e.to_string()))?;
    if config.parallelism == 0 {
      return Err(ConfigError::Invalid("parallelism must be at least 1".to_string()));
    }
    Ok(config)
  }
}

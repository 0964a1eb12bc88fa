//! Translation of tool-specific status strings into ready states.
//!
//! Operations may declare a `status_map` such as
//!
//! ```yaml
//! status_map:
//!   running: started
//!   exited: stopped
//!   deployed: started
//!   failed: error
//! ```
//!
//! Lookups are case-insensitive. Statuses that are neither in the table nor a
//! ready state name fall back to the configured [`UnmappedStatus`] policy.

use indexmap::IndexMap;
use tracing::debug;

use crate::config::UnmappedStatus;
use crate::graph::ReadyState;

/// Translates upstream status strings into ready states.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusMap {
  table: IndexMap<String, ReadyState>,
  unmapped: UnmappedStatus,
}

impl StatusMap {
  /// Build from an operation's `status_map`. Entries naming an unknown ready
  /// state are dropped.
  pub fn new(entries: &IndexMap<String, String>, unmapped: UnmappedStatus) -> Self {
    let table = entries
      .iter()
      .filter_map(|(upstream, state)| {
        let parsed = ReadyState::parse(state);
        if parsed.is_none() {
          debug!(upstream = %upstream, state = %state, "ignoring status map entry");
        }
        parsed.map(|s| (upstream.to_ascii_lowercase(), s))
      })
      .collect();
    Self { table, unmapped }
  }

  pub fn unmapped(policy: UnmappedStatus) -> Self {
    Self {
      table: IndexMap::new(),
      unmapped: policy,
    }
  }

  pub fn map(&self, upstream: &str) -> ReadyState {
    let key = upstream.trim().to_ascii_lowercase();
    if let Some(state) = self.table.get(&key) {
      return *state;
    }
    if let Some(state) = ReadyState::parse(&key) {
      return state;
    }
    debug!(upstream = %upstream, policy = ?self.unmapped, "unmapped upstream status");
    match self.unmapped {
      UnmappedStatus::Unknown => ReadyState::Unknown,
      UnmappedStatus::Error => ReadyState::Error,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn docker() -> IndexMap<String, String> {
    [("Running", "started"), ("exited", "stopped"), ("dead", "error"), ("bogus", "sideways")]
      .into_iter()
      .map(|(k, v)| (k.to_string(), v.to_string()))
      .collect()
  }

  #[test]
  fn table_entries_win() {
    let map = StatusMap::new(&docker(), UnmappedStatus::Unknown);
    assert_eq!(map.map("running"), ReadyState::Started);
    assert_eq!(map.map("EXITED"), ReadyState::Stopped);
    assert_eq!(map.map("dead"), ReadyState::Error);
  }

  #[test]
  fn ready_state_names_pass_through() {
    let map = StatusMap::unmapped(UnmappedStatus::Error);
    assert_eq!(map.map("degraded"), ReadyState::Degraded);
    assert_eq!(map.map("ok"), ReadyState::Started);
  }

  #[test]
  fn unmapped_policy_applies() {
    assert_eq!(
      StatusMap::new(&docker(), UnmappedStatus::Unknown).map("restarting"),
      ReadyState::Unknown
    );
    assert_eq!(
      StatusMap::new(&docker(), UnmappedStatus::Error).map("bogus"),
      ReadyState::Error
    );
  }
}

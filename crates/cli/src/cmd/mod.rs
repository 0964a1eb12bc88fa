mod eval;
mod merge;
mod plan;
pub mod run;
pub mod state;

use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

use strata_lib::ensemble::Ensemble;
use strata_lib::environment::Environment;
use strata_lib::state::StateStore;

use crate::Layers;

pub use eval::cmd_eval;
pub use merge::cmd_merge;
pub use plan::cmd_plan;
pub use run::cmd_run;
pub use state::cmd_state;

/// Load the layers named on the command line, with the current state on top
/// unless `--no-state` was given.
pub(crate) fn load_ensemble(layers: &Layers, state_dir: &Path) -> Result<Ensemble> {
  let state = if layers.no_state {
    None
  } else {
    StateStore::new(state_dir)
      .load_current()
      .with_context(|| format!("Failed to load state from {}", state_dir.display()))?
  };
  debug!(files = layers.files.len(), state = state.is_some(), "loading ensemble");
  Ensemble::load(&layers.files, state, &Environment::from_process()).context("Failed to load ensemble")
}

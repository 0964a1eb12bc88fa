//! Implementation of the `strata merge` command.

use std::path::Path;

use anyhow::Result;

use crate::Layers;
use crate::output::{OutputFormat, print_structured};

pub fn cmd_merge(layers: &Layers, state_dir: &Path, output: OutputFormat) -> Result<()> {
  let ensemble = super::load_ensemble(layers, state_dir)?;
  let format = if output.is_structured() { output } else { OutputFormat::Yaml };
  print_structured(ensemble.root(), format)
}

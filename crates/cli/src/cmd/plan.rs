//! Implementation of the `strata plan` command.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use strata_lib::reconcile::{Configurators, Operation, Workflow};

use crate::Layers;
use crate::output::{OutputFormat, print_info, print_structured, print_warning, symbols};

#[derive(Debug, Serialize)]
struct PlannedInstance {
  instance: String,
  operations: Vec<Operation>,
}

pub fn cmd_plan(layers: &Layers, state_dir: &Path, workflow: Workflow, output: OutputFormat) -> Result<()> {
  let ensemble = super::load_ensemble(layers, state_dir)?;
  let (graph, problems) = ensemble.graph().context("Failed to build instance graph")?;
  let plan = ensemble
    .reconciler(Configurators::builtin())
    .plan(&graph, workflow)
    .context("Failed to plan")?;

  if output.is_structured() {
    let planned: Vec<PlannedInstance> = plan
      .into_iter()
      .map(|(id, operations)| PlannedInstance {
        instance: id.to_string(),
        operations,
      })
      .collect();
    return print_structured(&planned, output);
  }

  for problem in &problems {
    print_warning(&problem.to_string());
  }
  let mut count = 0;
  for (id, operations) in &plan {
    if operations.is_empty() {
      continue;
    }
    let ops: Vec<&str> = operations.iter().map(|op| op.as_str()).collect();
    println!("  {} {} {}", symbols::ARROW, id, ops.join(", "));
    count += operations.len();
  }
  print_info(&format!("{workflow}: {count} operation(s) on {} instance(s)", plan.len()));
  Ok(())
}

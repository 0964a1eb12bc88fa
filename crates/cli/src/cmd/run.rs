//! Implementation of the `strata deploy|undeploy|check|discover` commands.
//!
//! Runs one reconciliation pass, saves the resulting state and prints a
//! per-instance summary. Ctrl-C cancels the pass after in-flight operations
//! finish; their results are still saved.

use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use tracing::info;

use strata_lib::graph::to_state_document;
use strata_lib::reconcile::{CancelToken, Configurators, Outcome, PassReport, Reconciler, Workflow};
use strata_lib::state::StateStore;

use crate::Layers;
use crate::output::{
  OutputFormat, format_duration, outcome_symbol, print_error, print_stat, print_structured, print_success,
  print_warning, truncate_hash,
};

#[derive(clap::Args, Debug)]
pub struct RunArgs {
  #[command(flatten)]
  layers: Layers,

  /// Override `engine.parallelism`
  #[arg(short = 'j', long)]
  parallelism: Option<usize>,

  /// Do not write the resulting state
  #[arg(long)]
  no_save: bool,

  #[arg(short = 'o', long, value_enum, default_value = "text")]
  output: OutputFormat,
}

pub fn cmd_run(args: &RunArgs, state_dir: &Path, workflow: Workflow) -> Result<()> {
  let store = StateStore::new(state_dir);
  let ensemble = super::load_ensemble(&args.layers, state_dir)?;
  let (mut graph, problems) = ensemble.graph().context("Failed to build instance graph")?;
  for problem in &problems {
    print_warning(&problem.to_string());
  }

  let mut config = ensemble.config().clone();
  if let Some(parallelism) = args.parallelism {
    config.parallelism = parallelism.max(1);
  }
  let pass = store.next_pass().context("Failed to read state index")?;
  let reconciler = Reconciler::new(config, Configurators::builtin(), ensemble.environment().clone()).with_pass(pass);

  let cancel = CancelToken::new();
  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let on_interrupt = cancel.clone();
  rt.spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      info!("interrupted, cancelling pass");
      on_interrupt.cancel();
    }
  });

  let started = Instant::now();
  let report = rt
    .block_on(reconciler.run(&mut graph, workflow, &cancel))
    .with_context(|| format!("{workflow} failed"))?;
  let elapsed = started.elapsed();

  let saved = if args.no_save {
    None
  } else {
    let document = to_state_document(&graph);
    Some(
      store
        .save(&document, pass, Some(&workflow.to_string()))
        .context("Failed to save state")?,
    )
  };

  if args.output.is_structured() {
    print_structured(&report, args.output)?;
  } else {
    print_report(&report);
    print_stat("Duration", &format_duration(elapsed));
    if let Some(meta) = &saved {
      print_stat("State", truncate_hash(&meta.id));
    }
  }

  if report.cancelled {
    bail!("{workflow} cancelled");
  }
  if !report.is_success() {
    bail!(
      "{workflow} finished with {} failed and {} blocked instance(s)",
      report.count(Outcome::Failed),
      report.count(Outcome::Blocked)
    );
  }
  Ok(())
}

fn print_report(report: &PassReport) {
  for instance in &report.instances {
    let ops: Vec<&str> = instance.operations.iter().map(|op| op.as_str()).collect();
    let ops = if ops.is_empty() {
      String::new()
    } else {
      format!(" [{}]", ops.join(", "))
    };
    println!(
      "  {} {} {}{}",
      outcome_symbol(instance.outcome),
      instance.instance,
      instance.ready_state,
      ops
    );
    for error in &instance.errors {
      print_error(&format!("    {error}"));
    }
  }
  if report.is_success() {
    print_success(&format!(
      "Pass {} ({}) complete: {} instance(s)",
      report.pass,
      report.workflow,
      report.instances.len()
    ));
  }
}

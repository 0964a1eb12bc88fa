//! Implementation of the `strata eval` command.
//!
//! The expression is read as YAML, so a bare path such as
//! `.ancestors::region` and a function call such as `{get_env: HOME}` are
//! both accepted.

use std::path::Path;

use anyhow::{Context, Result, bail};

use strata_lib::eval::{EvalCache, EvalContext, evaluate};
use strata_lib::value::Value;

use crate::Layers;
use crate::output::{OutputFormat, print_structured, print_warning};

pub fn cmd_eval(
  layers: &Layers,
  state_dir: &Path,
  expr: &str,
  instance: Option<&str>,
  output: OutputFormat,
) -> Result<()> {
  let ensemble = super::load_ensemble(layers, state_dir)?;
  let (graph, problems) = ensemble.graph().context("Failed to build instance graph")?;
  for problem in &problems {
    print_warning(&problem.to_string());
  }

  let parsed = Value::parse_yaml(expr).with_context(|| format!("Invalid expression: {expr}"))?;
  let cache = EvalCache::new();
  let mut ctx = EvalContext::new(&graph, ensemble.environment(), &cache);
  if let Some(name) = instance {
    let Some(found) = graph.find(name) else {
      bail!("Unknown instance: {name}");
    };
    ctx = ctx.for_instance(found.id.clone());
  }

  let value = evaluate(&parsed, &mut ctx).with_context(|| format!("Failed to evaluate {expr}"))?;
  match (output, &value) {
    (OutputFormat::Text, Value::String(_) | Value::Int(_) | Value::Float(_) | Value::Bool(_) | Value::Null) => {
      println!("{}", value.to_text());
      Ok(())
    }
    (OutputFormat::Text, _) => print_structured(&value, OutputFormat::Yaml),
    _ => print_structured(&value, output),
  }
}

//! Implementation of the `strata state` commands.

use std::path::Path;

use anyhow::{Context, Result, bail};
use clap::Subcommand;

use strata_lib::document::{Document, LayerKind};
use strata_lib::merge::diff;
use strata_lib::state::StateStore;

use crate::output::{
  OutputFormat, format_age, format_timestamp, print_info, print_stat, print_structured, print_success,
  truncate_hash,
};

#[derive(Subcommand, Debug)]
pub enum StateCommand {
  /// List saved state snapshots
  List {
    #[arg(short = 'o', long, value_enum, default_value = "text")]
    output: OutputFormat,
  },

  /// Print a state document (the current one by default)
  Show {
    id: Option<String>,
  },

  /// Print the layer that turns one state into another
  Diff {
    from: String,
    /// Defaults to the current state
    to: Option<String>,
  },

  /// Make a saved state current
  Use {
    id: String,
  },

  /// Delete state snapshots
  Delete {
    #[arg(required = true)]
    ids: Vec<String>,
  },
}

pub fn cmd_state(command: StateCommand, state_dir: &Path) -> Result<()> {
  let store = StateStore::new(state_dir);
  match command {
    StateCommand::List { output } => cmd_list(&store, output),
    StateCommand::Show { id } => cmd_show(&store, id.as_deref()),
    StateCommand::Diff { from, to } => cmd_diff(&store, &from, to.as_deref()),
    StateCommand::Use { id } => {
      let id = resolve_id(&store, &id)?;
      store.set_current(&id).with_context(|| format!("Failed to select state {id}"))?;
      print_success(&format!("Current state is now {}", truncate_hash(&id)));
      Ok(())
    }
    StateCommand::Delete { ids } => {
      for id in ids {
        let id = resolve_id(&store, &id)?;
        store.delete(&id).with_context(|| format!("Failed to delete state {id}"))?;
        print_success(&format!("Deleted {}", truncate_hash(&id)));
      }
      Ok(())
    }
  }
}

fn cmd_list(store: &StateStore, output: OutputFormat) -> Result<()> {
  let index = store.load_index().context("Failed to read state index")?;
  if output.is_structured() {
    return print_structured(&index, output);
  }
  if index.is_empty() {
    print_info("No saved state");
    return Ok(());
  }
  for meta in index.snapshots.iter().rev() {
    let marker = if index.current.as_deref() == Some(meta.id.as_str()) {
      "*"
    } else {
      " "
    };
    println!(
      "{marker} {}  pass {:<4} {:<9} {} instance(s)  {}",
      truncate_hash(&meta.id),
      meta.pass,
      meta.workflow.as_deref().unwrap_or("-"),
      meta.instances,
      format_age(meta.created_at)
    );
  }
  if let Some(current) = index.current.as_deref().and_then(|id| index.get(id)) {
    print_stat("Current", &format!("{} ({})", current.id, format_timestamp(current.created_at)));
  }
  Ok(())
}

fn cmd_show(store: &StateStore, id: Option<&str>) -> Result<()> {
  let document = match id {
    Some(id) => Some(store.load(&resolve_id(store, id)?)?),
    None => store.load_current()?,
  };
  match document {
    Some(document) => {
      print!("{}", document.to_yaml_string()?);
      Ok(())
    }
    None => bail!("No current state in {}", store.base_path().display()),
  }
}

fn cmd_diff(store: &StateStore, from: &str, to: Option<&str>) -> Result<()> {
  let old = store.load(&resolve_id(store, from)?)?;
  let new = match to {
    Some(id) => store.load(&resolve_id(store, id)?)?,
    None => store
      .load_current()?
      .with_context(|| format!("No current state in {}", store.base_path().display()))?,
  };
  let patch = diff(old.root(), new.root());
  if patch.is_empty() {
    print_info("No differences");
    return Ok(());
  }
  print!("{}", Document::new(LayerKind::State, patch).to_yaml_string()?);
  Ok(())
}

/// Accept a unique prefix of a snapshot id.
fn resolve_id(store: &StateStore, prefix: &str) -> Result<String> {
  let matches: Vec<String> = store
    .list()?
    .into_iter()
    .map(|meta| meta.id)
    .filter(|id| id.starts_with(prefix))
    .collect();
  match matches.as_slice() {
    [id] => Ok(id.clone()),
    [] => bail!("No state matches '{prefix}'"),
    _ => bail!("'{prefix}' matches {} states", matches.len()),
  }
}

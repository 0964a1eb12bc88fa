use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod cmd;
mod output;

use cmd::state::StateCommand;
use output::OutputFormat;
use strata_lib::reconcile::Workflow;

/// Environment variable holding the log filter.
const LOG_ENV: &str = "STRATA_LOG";

#[derive(Parser)]
#[command(name = "strata")]
#[command(author, version, about = "Layered configuration and instance reconciliation", long_about = None)]
struct Cli {
  /// Enable debug logging
  #[arg(short, long, global = true)]
  verbose: bool,

  /// Directory holding persisted state
  #[arg(long, global = true, env = "STRATA_STATE_DIR", default_value = ".strata")]
  state_dir: PathBuf,

  #[command(subcommand)]
  command: Commands,
}

/// Documents to load, lowest precedence first. The last one is the ensemble.
#[derive(clap::Args, Debug)]
pub struct Layers {
  #[arg(required = true)]
  files: Vec<PathBuf>,

  /// Ignore persisted state
  #[arg(long)]
  no_state: bool,
}

#[derive(Subcommand)]
enum Commands {
  /// Print the merged document
  Merge {
    #[command(flatten)]
    layers: Layers,

    #[arg(short = 'o', long, value_enum, default_value = "yaml")]
    output: OutputFormat,
  },

  /// Evaluate an expression against the instance graph
  Eval {
    #[command(flatten)]
    layers: Layers,

    /// Expression: a path, or a YAML mapping such as `{get_env: HOME}`
    #[arg(short, long)]
    expr: String,

    /// Instance the expression is evaluated from
    #[arg(short, long)]
    instance: Option<String>,

    #[arg(short = 'o', long, value_enum, default_value = "yaml")]
    output: OutputFormat,
  },

  /// Show the operations a workflow would run, in order
  Plan {
    #[command(flatten)]
    layers: Layers,

    #[arg(short, long, value_enum, default_value = "deploy")]
    workflow: WorkflowArg,

    #[arg(short = 'o', long, value_enum, default_value = "text")]
    output: OutputFormat,
  },

  /// Create, configure and start instances
  Deploy(cmd::run::RunArgs),

  /// Stop and delete instances, dependents first
  Undeploy(cmd::run::RunArgs),

  /// Check the live status of instances
  Check(cmd::run::RunArgs),

  /// Discover instances that already exist
  Discover(cmd::run::RunArgs),

  /// Manage persisted state
  #[command(subcommand)]
  State(StateCommand),
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum WorkflowArg {
  Deploy,
  Undeploy,
  Check,
  Discover,
}

impl From<WorkflowArg> for Workflow {
  fn from(value: WorkflowArg) -> Self {
    match value {
      WorkflowArg::Deploy => Workflow::Deploy,
      WorkflowArg::Undeploy => Workflow::Undeploy,
      WorkflowArg::Check => Workflow::Check,
      WorkflowArg::Discover => Workflow::Discover,
    }
  }
}

fn main() -> Result<()> {
  let cli = Cli::parse();

  let filter = if cli.verbose {
    EnvFilter::new("debug")
  } else {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"))
  };
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .without_time()
    .init();

  let state_dir = cli.state_dir;
  match cli.command {
    Commands::Merge { layers, output } => cmd::cmd_merge(&layers, &state_dir, output),
    Commands::Eval {
      layers,
      expr,
      instance,
      output,
    } => cmd::cmd_eval(&layers, &state_dir, &expr, instance.as_deref(), output),
    Commands::Plan {
      layers,
      workflow,
      output,
    } => cmd::cmd_plan(&layers, &state_dir, workflow.into(), output),
    Commands::Deploy(args) => cmd::cmd_run(&args, &state_dir, Workflow::Deploy),
    Commands::Undeploy(args) => cmd::cmd_run(&args, &state_dir, Workflow::Undeploy),
    Commands::Check(args) => cmd::cmd_run(&args, &state_dir, Workflow::Check),
    Commands::Discover(args) => cmd::cmd_run(&args, &state_dir, Workflow::Discover),
    Commands::State(command) => cmd::cmd_state(command, &state_dir),
  }
}

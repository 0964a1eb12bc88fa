//! CLI output formatting.
//!
//! Colored status lines, state and outcome symbols, and structured output in
//! YAML or JSON.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use clap::ValueEnum;
use owo_colors::{OwoColorize, Stream};
use strata_lib::reconcile::Outcome;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
  #[default]
  Text,
  Json,
  Yaml,
}

impl OutputFormat {
  pub fn is_structured(self) -> bool {
    !matches!(self, OutputFormat::Text)
  }
}

pub mod symbols {
  pub const SUCCESS: &str = "✓";
  pub const ERROR: &str = "✗";
  pub const WARNING: &str = "⚠";
  pub const INFO: &str = "•";
  pub const ARROW: &str = "→";
  pub const SKIP: &str = "-";
  pub const BLOCKED: &str = "⊘";
}

pub fn truncate_hash(hash: &str) -> &str {
  let len = hash.len().min(12);
  &hash[..len]
}

pub fn format_duration(duration: Duration) -> String {
  let secs = duration.as_secs();
  let millis = duration.subsec_millis();

  if secs >= 60 {
    format!("{}m {}s", secs / 60, secs % 60)
  } else if secs > 0 {
    format!("{}.{:02}s", secs, millis / 10)
  } else {
    format!("{}ms", millis)
  }
}

/// RFC 3339 timestamp for seconds since the epoch.
pub fn format_timestamp(secs: u64) -> String {
  humantime::format_rfc3339_seconds(UNIX_EPOCH + Duration::from_secs(secs)).to_string()
}

/// How long ago `secs` was, e.g. `3h 12m ago`.
pub fn format_age(secs: u64) -> String {
  let then = UNIX_EPOCH + Duration::from_secs(secs);
  match SystemTime::now().duration_since(then) {
    Ok(age) => {
      let rounded = Duration::from_secs(if age.as_secs() >= 60 {
        age.as_secs() / 60 * 60
      } else {
        age.as_secs()
      });
      format!("{} ago", humantime::format_duration(rounded))
    }
    Err(_) => "in the future".to_string(),
  }
}

pub fn outcome_symbol(outcome: Outcome) -> String {
  match outcome {
    Outcome::Ok => symbols::SUCCESS
      .if_supports_color(Stream::Stdout, |s| s.green())
      .to_string(),
    Outcome::Degraded => symbols::WARNING
      .if_supports_color(Stream::Stdout, |s| s.yellow())
      .to_string(),
    Outcome::Failed => symbols::ERROR.if_supports_color(Stream::Stdout, |s| s.red()).to_string(),
    Outcome::Blocked => symbols::BLOCKED
      .if_supports_color(Stream::Stdout, |s| s.red())
      .to_string(),
    Outcome::Skipped | Outcome::Cancelled => symbols::SKIP
      .if_supports_color(Stream::Stdout, |s| s.dimmed())
      .to_string(),
  }
}

pub fn print_success(message: &str) {
  println!(
    "{} {}",
    symbols::SUCCESS.if_supports_color(Stream::Stdout, |s| s.green()),
    message
  );
}

pub fn print_error(message: &str) {
  eprintln!(
    "{} {}",
    symbols::ERROR.if_supports_color(Stream::Stderr, |s| s.red()),
    message.if_supports_color(Stream::Stderr, |s| s.red())
  );
}

pub fn print_warning(message: &str) {
  eprintln!(
    "{} {}",
    symbols::WARNING.if_supports_color(Stream::Stderr, |s| s.yellow()),
    message.if_supports_color(Stream::Stderr, |s| s.yellow())
  );
}

pub fn print_info(message: &str) {
  println!(
    "{} {}",
    symbols::INFO.if_supports_color(Stream::Stdout, |s| s.blue()),
    message
  );
}

pub fn print_stat(label: &str, value: &str) {
  println!(
    "  {}: {}",
    label.if_supports_color(Stream::Stdout, |s| s.dimmed()),
    value
  );
}

/// Print `value` as JSON or YAML.
pub fn print_structured<T: serde::Serialize>(value: &T, format: OutputFormat) -> anyhow::Result<()> {
  match format {
    OutputFormat::Yaml => {
      let yaml = serde_yaml::to_string(value).context("Failed to serialize to YAML")?;
      print!("{yaml}");
    }
    _ => {
      let json = serde_json::to_string_pretty(value).context("Failed to serialize to JSON")?;
      println!("{json}");
    }
  }
  Ok(())
}

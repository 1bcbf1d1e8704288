//! CLI output formatting utilities.
//!
//! Colored status lines, human-readable sizes and durations, and the JSON
//! escape hatch shared by every command.

use std::time::Duration;

use anyhow::Context;
use clap::ValueEnum;
use owo_colors::{OwoColorize, Stream};

use cellar_lib::formula::OptionSet;

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
  #[default]
  Text,
  Json,
}

impl OutputFormat {
  pub fn is_json(self) -> bool {
    matches!(self, OutputFormat::Json)
  }
}

pub mod symbols {
  pub const SUCCESS: &str = "✓";
  pub const ERROR: &str = "✗";
  pub const WARNING: &str = "⚠";
  pub const INFO: &str = "•";
  pub const ARROW: &str = "→";
  pub const SKIP: &str = "-";
}

pub fn truncate_hash(hash: &str) -> &str {
  let len = hash.len().min(12);
  &hash[..len]
}

pub fn format_bytes(bytes: u64) -> String {
  const KB: u64 = 1024;
  const MB: u64 = KB * 1024;
  const GB: u64 = MB * 1024;

  if bytes >= GB {
    format!("{:.1} GB", bytes as f64 / GB as f64)
  } else if bytes >= MB {
    format!("{:.1} MB", bytes as f64 / MB as f64)
  } else if bytes >= KB {
    format!("{:.1} KB", bytes as f64 / KB as f64)
  } else {
    format!("{} B", bytes)
  }
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

/// `readline=off x11=on`, or an empty string when there are no options.
pub fn format_options(options: &OptionSet) -> String {
  options
    .iter()
    .map(|(name, on)| format!("{}={}", name, if on { "on" } else { "off" }))
    .collect::<Vec<_>>()
    .join(" ")
}

/// Color applied to a status line.
#[derive(Debug, Clone, Copy)]
enum Tone {
  Good,
  Bad,
  Warn,
  Note,
  Quiet,
}

fn paint(text: &str, tone: Tone, stream: Stream) -> String {
  match tone {
    Tone::Good => text.if_supports_color(stream, |s| s.green()).to_string(),
    Tone::Bad => text.if_supports_color(stream, |s| s.red()).to_string(),
    Tone::Warn => text.if_supports_color(stream, |s| s.yellow()).to_string(),
    Tone::Note => text.if_supports_color(stream, |s| s.blue()).to_string(),
    Tone::Quiet => text.if_supports_color(stream, |s| s.dimmed()).to_string(),
  }
}

/// Results go to stdout; problems go to stderr with the message colored too.
fn status_line(symbol: &str, tone: Tone, message: &str) {
  match tone {
    Tone::Bad | Tone::Warn => eprintln!(
      "{} {}",
      paint(symbol, tone, Stream::Stderr),
      paint(message, tone, Stream::Stderr)
    ),
    Tone::Quiet => println!(
      "{} {}",
      paint(symbol, tone, Stream::Stdout),
      paint(message, tone, Stream::Stdout)
    ),
    Tone::Good | Tone::Note => println!("{} {}", paint(symbol, tone, Stream::Stdout), message),
  }
}

pub fn print_success(message: &str) {
  status_line(symbols::SUCCESS, Tone::Good, message);
}

pub fn print_error(message: &str) {
  status_line(symbols::ERROR, Tone::Bad, message);
}

pub fn print_warning(message: &str) {
  status_line(symbols::WARNING, Tone::Warn, message);
}

pub fn print_info(message: &str) {
  status_line(symbols::INFO, Tone::Note, message);
}

pub fn print_skip(message: &str) {
  status_line(symbols::SKIP, Tone::Quiet, message);
}

pub fn print_stat(label: &str, value: &str) {
  println!(
    "  {}: {}",
    label.if_supports_color(Stream::Stdout, |s| s.dimmed()),
    value
  );
}

pub fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
  let json = serde_json::to_string_pretty(value).context("Failed to serialize to JSON")?;
  println!("{}", json);
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_truncate_hash() {
    assert_eq!(truncate_hash("abcdef123456789"), "abcdef123456");
    assert_eq!(truncate_hash("short"), "short");
  }

  #[test]
  fn test_format_bytes() {
    assert_eq!(format_bytes(500), "500 B");
    assert_eq!(format_bytes(1536), "1.5 KB");
    assert_eq!(format_bytes(1073741824), "1.0 GB");
  }

  #[test]
  fn test_format_duration() {
    assert_eq!(format_duration(Duration::from_millis(50)), "50ms");
    assert_eq!(format_duration(Duration::from_millis(1500)), "1.50s");
    assert_eq!(format_duration(Duration::from_secs(65)), "1m 5s");
  }

  #[test]
  fn test_format_options() {
    let options = OptionSet::new().with("x11", true).with("readline", false);
    assert_eq!(format_options(&options), "readline=off x11=on");
    assert_eq!(format_options(&OptionSet::new()), "");
  }
}

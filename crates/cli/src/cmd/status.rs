//! Status command implementation.
//!
//! Lists the latest recorded result for every artifact in the store.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use cellar_lib::execute::{BuildResult, BuildStatus};
use cellar_lib::platform::paths::store_dir;
use cellar_lib::store::{ArtifactStore, LockMode, StoreLock};

use crate::output::{
  OutputFormat, format_bytes, format_options, print_error, print_info, print_json, print_stat, print_success,
  symbols, truncate_hash,
};

pub fn cmd_status(store: Option<PathBuf>, verbose: bool, format: OutputFormat) -> Result<()> {
  let store_path = store.unwrap_or_else(store_dir);
  let _lock = StoreLock::try_acquire(&store_path, LockMode::Shared, "cellar status")?;
  let store =
    ArtifactStore::open(&store_path).with_context(|| format!("Failed to open store: {}", store_path.display()))?;
  let entries = store.entries();

  if format.is_json() {
    return print_json(&entries);
  }

  if entries.is_empty() {
    print_info(&format!("Store at {} is empty", store_path.display()));
    return Ok(());
  }

  let succeeded = entries.iter().filter(|r| r.is_success()).count();
  print_success(&format!("Store: {}", store_path.display()));
  print_stat("Artifacts", &succeeded.to_string());
  print_stat("Failed", &(entries.len() - succeeded).to_string());
  println!();

  for result in &entries {
    print_entry(result, verbose);
  }

  let usage: u64 = entries
    .iter()
    .filter_map(|r| r.prefix.as_deref())
    .map(dir_size)
    .sum();
  println!();
  print_stat("Store usage", &format_bytes(usage));

  Ok(())
}

fn print_entry(result: &BuildResult, verbose: bool) {
  let options = format_options(&result.options);
  let label = if options.is_empty() {
    result.id.to_string()
  } else {
    format!("{} [{options}]", result.id)
  };

  match result.status {
    BuildStatus::Success | BuildStatus::SkippedCached => {
      let hash = result.content_hash.as_ref().map(|h| truncate_hash(&h.0)).unwrap_or("");
      println!("  {} {label} {hash}", symbols::SUCCESS);
    }
    BuildStatus::Failed => {
      let reason = result.error().map(|e| e.to_string()).unwrap_or_default();
      print_error(&format!("{label}: {reason}"));
    }
  }

  if verbose {
    if let Some(prefix) = &result.prefix {
      print_stat("Prefix", &prefix.display().to_string());
    }
    if let Some(log) = &result.log_path {
      print_stat("Log", &log.display().to_string());
    }
    print_stat("Files", &result.manifest.len().to_string());
  }
}

fn dir_size(path: &Path) -> u64 {
  if !path.exists() {
    return 0;
  }

  let mut size = 0;
  if let Ok(entries) = std::fs::read_dir(path) {
    for entry in entries.flatten() {
      let entry_path = entry.path();
      if entry_path.is_file() {
        size += entry.metadata().map(|m| m.len()).unwrap_or(0);
      } else if entry_path.is_dir() {
        size += dir_size(&entry_path);
      }
    }
  }
  size
}

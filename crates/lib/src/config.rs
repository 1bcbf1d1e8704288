//! Orchestrator configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::execute::ResourceLimits;
use crate::platform::paths::{scratch_dir, store_dir};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
  /// Maximum number of builds running at once.
  pub concurrency: usize,
  /// Treat a manifest mismatch against an earlier build of the same key as a failure.
  pub strict_consistency: bool,
  /// Leave each build's scratch directory on disk for debugging.
  pub keep_scratch: bool,
  /// Run formula smoke tests after install.
  pub run_tests: bool,
  /// Timeout for steps that do not declare their own.
  pub default_step_timeout: Option<Duration>,
  /// Captured output kept per failing step.
  pub max_output_bytes: usize,
  pub store_dir: PathBuf,
  pub scratch_dir: PathBuf,
  /// Directories appended to `PATH` inside build environments.
  pub search_path: Vec<PathBuf>,
}

impl Default for OrchestratorConfig {
  fn default() -> Self {
    let limits = ResourceLimits::default();
    Self {
      concurrency: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
      strict_consistency: false,
      keep_scratch: false,
      run_tests: true,
      default_step_timeout: limits.default_step_timeout,
      max_output_bytes: limits.max_output_bytes,
      store_dir: store_dir(),
      scratch_dir: scratch_dir(),
      search_path: Vec::new(),
    }
  }
}

impl OrchestratorConfig {
  /// Defaults with store and scratch under `root`, for tests and sandboxes.
  pub fn rooted(root: impl Into<PathBuf>) -> Self {
    let root = root.into();
    Self {
      store_dir: root.join("store"),
      scratch_dir: root.join("scratch"),
      ..Self::default()
    }
  }

  pub fn limits(&self) -> ResourceLimits {
    ResourceLimits {
      default_step_timeout: self.default_step_timeout,
      max_output_bytes: self.max_output_bytes,
    }
  }
}

//! Result and error types for single-formula builds.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::formula::{FormulaId, OptionSet};
use crate::placeholder::PlaceholderError;
use crate::util::hash::{ContentHash, ObjectHash};

/// Why a build did not produce an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BuildError {
  #[error("step {step_index} ({step_name}) failed: {message}")]
  StepFailed {
    step_index: usize,
    step_name: String,
    message: String,
  },

  #[error("step {step_index} ({step_name}) timed out after {}s", limit.as_secs_f64())]
  Timeout {
    step_index: usize,
    step_name: String,
    limit: Duration,
  },

  #[error("failed to set up build environment: {0}")]
  EnvironmentSetupFailed(String),

  #[error("installed files differ from an earlier build of the same key: {0}")]
  InconsistentManifest(String),

  #[error("build task panicked: {0}")]
  Panicked(String),

  #[error("build cancelled")]
  Cancelled,
}

impl BuildError {
  pub fn step_index(&self) -> Option<usize> {
    match self {
      BuildError::StepFailed { step_index, .. } | BuildError::Timeout { step_index, .. } => Some(*step_index),
      _ => None,
    }
  }

  pub fn step_name(&self) -> Option<&str> {
    match self {
      BuildError::StepFailed { step_name, .. } | BuildError::Timeout { step_name, .. } => Some(step_name),
      _ => None,
    }
  }
}

/// Errors raised by a [`super::StepRunner`] while invoking one step.
#[derive(Debug, Error)]
pub enum RunnerError {
  #[error("placeholder error: {0}")]
  Placeholder(#[from] PlaceholderError),

  #[error("fetch failed for {url}: {message}")]
  FetchFailed { url: String, message: String },

  #[error("hash mismatch for {url}: expected {expected}, got {actual}")]
  HashMismatch {
    url: String,
    expected: String,
    actual: String,
  },

  #[error("failed to spawn '{bin}': {source}")]
  Spawn {
    bin: String,
    #[source]
    source: std::io::Error,
  },

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

/// What a step printed and how it exited.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepOutput {
  /// `None` when the process was terminated by a signal.
  pub exit_code: Option<i32>,
  pub stdout: String,
  pub stderr: String,
}

impl StepOutput {
  pub fn success(stdout: impl Into<String>) -> Self {
    Self {
      exit_code: Some(0),
      stdout: stdout.into(),
      stderr: String::new(),
    }
  }

  pub fn failure(code: i32, stderr: impl Into<String>) -> Self {
    Self {
      exit_code: Some(code),
      stdout: String::new(),
      stderr: stderr.into(),
    }
  }

  pub fn is_success(&self) -> bool {
    self.exit_code == Some(0)
  }

  /// Stdout followed by stderr, as written to the build log.
  pub fn combined(&self) -> String {
    let mut out = self.stdout.clone();
    if !self.stderr.is_empty() {
      if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
      }
      out.push_str(&self.stderr);
    }
    out
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BuildStatus {
  Success,
  Failed,
  SkippedCached,
}

/// Where and why a build stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildFailure {
  pub error: BuildError,
  /// Captured output of the failing step, truncated to the output cap.
  pub output: String,
}

/// Outcome of one executor invocation. Never mutated once recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildResult {
  pub id: FormulaId,
  pub options: OptionSet,
  pub options_hash: ObjectHash,
  pub recipe_hash: ObjectHash,
  pub status: BuildStatus,
  /// Installed files relative to `prefix`, sorted.
  pub manifest: Vec<String>,
  pub content_hash: Option<ContentHash>,
  pub prefix: Option<PathBuf>,
  pub log_path: Option<PathBuf>,
  pub duration: Duration,
  pub failure: Option<BuildFailure>,
}

impl BuildResult {
  pub fn is_success(&self) -> bool {
    matches!(self.status, BuildStatus::Success | BuildStatus::SkippedCached)
  }

  /// A failed result for a build that never got to run a step.
  pub fn not_started(
    id: FormulaId,
    options: OptionSet,
    recipe_hash: ObjectHash,
    error: BuildError,
  ) -> Self {
    Self {
      id,
      options_hash: options.hash(),
      options,
      recipe_hash,
      status: BuildStatus::Failed,
      manifest: Vec::new(),
      content_hash: None,
      prefix: None,
      log_path: None,
      duration: Duration::ZERO,
      failure: Some(BuildFailure {
        error,
        output: String::new(),
      }),
    }
  }

  /// This result turned into a failure after the build itself finished.
  pub fn rejected(self, error: BuildError) -> Self {
    Self {
      status: BuildStatus::Failed,
      failure: Some(BuildFailure {
        error,
        output: String::new(),
      }),
      ..self
    }
  }

  /// The same artifact, reported as served from the store. Never recorded.
  pub fn as_cached(&self) -> Self {
    Self {
      status: BuildStatus::SkippedCached,
      duration: Duration::ZERO,
      ..self.clone()
    }
  }

  pub fn error(&self) -> Option<&BuildError> {
    self.failure.as_ref().map(|f| &f.error)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn combined_output_joins_streams() {
    let out = StepOutput {
      exit_code: Some(1),
      stdout: "checking for gcc... no".to_string(),
      stderr: "configure: error: no acceptable C compiler".to_string(),
    };
    assert_eq!(
      out.combined(),
      "checking for gcc... no\nconfigure: error: no acceptable C compiler"
    );
    assert!(!out.is_success());
  }

  #[test]
  fn error_locates_failing_step() {
    let err = BuildError::Timeout {
      step_index: 2,
      step_name: "make".to_string(),
      limit: Duration::from_secs(30),
    };
    assert_eq!(err.step_index(), Some(2));
    assert_eq!(err.step_name(), Some("make"));
    assert_eq!(err.to_string(), "step 2 (make) timed out after 30s");
    assert_eq!(BuildError::Cancelled.step_index(), None);
  }

  #[test]
  fn rejected_result_is_a_failure() {
    let built = BuildResult {
      status: BuildStatus::Success,
      manifest: vec!["lib/libgmp.a".to_string()],
      failure: None,
      ..BuildResult::not_started(
        FormulaId::new("gmp", "6.1.2"),
        OptionSet::new(),
        ObjectHash("recipe".to_string()),
        BuildError::Cancelled,
      )
    };
    assert!(built.is_success());

    let rejected = built.rejected(BuildError::InconsistentManifest("lib/libgmp.so missing".to_string()));
    assert!(!rejected.is_success());
    assert_eq!(rejected.manifest, vec!["lib/libgmp.a"]);
    assert!(matches!(rejected.error(), Some(BuildError::InconsistentManifest(_))));
  }

  #[test]
  fn cached_copy_keeps_artifact_but_not_duration() {
    let built = BuildResult {
      status: BuildStatus::Success,
      duration: Duration::from_secs(3),
      failure: None,
      ..BuildResult::not_started(
        FormulaId::new("gmp", "6.1.2"),
        OptionSet::new(),
        ObjectHash("recipe".to_string()),
        BuildError::Cancelled,
      )
    };
    let cached = built.as_cached();
    assert_eq!(cached.status, BuildStatus::SkippedCached);
    assert_eq!(cached.duration, Duration::ZERO);
    assert!(cached.is_success());
  }
}

//! Single-formula build execution.
//!
//! [`build`] runs one formula's resolved steps inside an [`Environment`]:
//! - steps run in order, the first failure aborts the rest
//! - placeholders are substituted and declared inputs/outputs checked
//! - each step is bounded by its timeout and raced against cancellation
//! - on success the staged prefix is committed and its manifest hashed
//! - the optional smoke test runs against the committed prefix

pub mod actions;
mod env;
mod runner;
mod types;

pub use env::{
  Environment, EnvironmentConfig, HOMELESS, PATH_NOT_SET, ResourceLimits, SOURCE_DATE_EPOCH, dep_prefix_var,
};
pub use runner::{CommandRunner, StepRunner};
pub use types::{BuildError, BuildFailure, BuildResult, BuildStatus, RunnerError, StepOutput};

use std::path::Path;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

use crate::formula::{Formula, OptionSet, ResolvedStep};
use crate::util::hash::{DirDigest, ObjectHash, digest_directory};

/// How one step ended, short of success.
struct StepFailure {
  error: BuildError,
  output: String,
}

/// Build `formula` with `options` in `env`.
///
/// Never panics on build problems: every outcome, including setup failures
/// and cancellation, is a [`BuildResult`]. The environment's scratch space is
/// released before returning unless it was created with `keep_scratch`.
pub async fn build<R: StepRunner + ?Sized>(
  formula: &Formula,
  options: &OptionSet,
  mut env: Environment,
  runner: &R,
) -> BuildResult {
  let start = Instant::now();
  let id = formula.id();
  let options_hash = options.hash();

  info!(formula = %id, options = %options, "starting build");

  let recipe_hash = match formula.recipe_hash() {
    Ok(hash) => hash,
    Err(e) => {
      env.finish();
      let error = BuildError::EnvironmentSetupFailed(e.to_string());
      return BuildResult::not_started(id, options.clone(), ObjectHash(String::new()), error);
    }
  };

  let outcome = run_all(formula, options, &mut env, runner).await;
  let log_path = Some(env.log_path().to_path_buf());
  let prefix = env.prefix().to_path_buf();
  env.finish();

  let duration = start.elapsed();
  match outcome {
    Ok(digest) => {
      info!(formula = %id, files = digest.manifest.len(), duration_ms = duration.as_millis() as u64, "build complete");
      BuildResult {
        id,
        options: options.clone(),
        options_hash,
        recipe_hash,
        status: BuildStatus::Success,
        manifest: digest.manifest,
        content_hash: Some(digest.hash),
        prefix: Some(prefix),
        log_path,
        duration,
        failure: None,
      }
    }
    Err(failure) => {
      match &failure.error {
        BuildError::Cancelled => warn!(formula = %id, "build cancelled"),
        err => error!(formula = %id, error = %err, "build failed"),
      }
      BuildResult {
        id,
        options: options.clone(),
        options_hash,
        recipe_hash,
        status: BuildStatus::Failed,
        manifest: Vec::new(),
        content_hash: None,
        prefix: None,
        log_path,
        duration,
        failure: Some(BuildFailure {
          error: failure.error,
          output: failure.output,
        }),
      }
    }
  }
}

async fn run_all<R: StepRunner + ?Sized>(
  formula: &Formula,
  options: &OptionSet,
  env: &mut Environment,
  runner: &R,
) -> Result<DirDigest, StepFailure> {
  let mut log = open_log(env.log_path()).await.map_err(setup_failure)?;

  let steps = formula.resolve_steps(options);
  debug!(formula = %env.id(), steps = steps.len(), "resolved steps");

  for step in &steps {
    let output = run_step(step, env, runner, &mut log).await?;
    debug!(formula = %env.id(), step = step.index, bytes = output.len(), "step complete");
  }

  commit(env).await.map_err(setup_failure)?;
  let digest = digest_directory(env.prefix()).map_err(|e| setup_failure(e.to_string()))?;

  if env.run_tests()
    && let Some((test, expected)) = formula.resolve_test(options, steps.len())
  {
    info!(formula = %env.id(), "running smoke test");
    let result = match run_step(&test, env, runner, &mut log).await {
      Ok(stdout) => match expected {
        Some(expected) if stdout.trim() != expected.trim() => Err(StepFailure {
          error: BuildError::StepFailed {
            step_index: test.index,
            step_name: test.name.clone(),
            message: format!("expected output {:?}, got {:?}", expected.trim(), stdout.trim()),
          },
          output: truncate_output(&stdout, env.limits().max_output_bytes),
        }),
        _ => Ok(()),
      },
      Err(failure) => Err(failure),
    };

    if let Err(failure) = result {
      if let Err(e) = tokio::fs::remove_dir_all(env.prefix()).await {
        warn!(prefix = ?env.prefix(), error = %e, "failed to remove prefix after failed test");
      }
      return Err(failure);
    }
  }

  let _ = log.flush().await;
  Ok(digest)
}

fn setup_failure(message: impl ToString) -> StepFailure {
  StepFailure {
    error: BuildError::EnvironmentSetupFailed(message.to_string()),
    output: String::new(),
  }
}

async fn open_log(path: &Path) -> Result<tokio::fs::File, String> {
  if let Some(parent) = path.parent() {
    tokio::fs::create_dir_all(parent)
      .await
      .map_err(|e| format!("create log directory {}: {e}", parent.display()))?;
  }
  tokio::fs::File::create(path)
    .await
    .map_err(|e| format!("create log {}: {e}", path.display()))
}

/// Run one step and return its stdout.
async fn run_step<R: StepRunner + ?Sized>(
  step: &ResolvedStep,
  env: &Environment,
  runner: &R,
  log: &mut tokio::fs::File,
) -> Result<String, StepFailure> {
  let cap = env.limits().max_output_bytes;
  let step_failed = |message: String, output: String| StepFailure {
    error: BuildError::StepFailed {
      step_index: step.index,
      step_name: step.name.clone(),
      message,
    },
    output,
  };

  if env.cancellation().is_cancelled() {
    return Err(StepFailure {
      error: BuildError::Cancelled,
      output: String::new(),
    });
  }

  let materialized = env
    .materialize(step)
    .map_err(|e| step_failed(e.to_string(), String::new()))?;
  let step = &materialized;

  for input in &step.inputs {
    if !env.resolve_path(input).exists() {
      return Err(step_failed(format!("declared input '{input}' does not exist"), String::new()));
    }
  }

  info!(formula = %env.id(), step = step.index, name = %step.name, "running step");
  let _ = log
    .write_all(format!("==> [{}] {}\n", step.index, step.name).as_bytes())
    .await;

  let limit = step.timeout.or(env.limits().default_step_timeout);
  let outcome = tokio::select! {
    _ = env.cancellation().cancelled() => None,
    result = with_timeout(limit, runner.run(step, env)) => Some(result),
  };

  let output = match outcome {
    None => {
      let _ = log.write_all(b"cancelled\n").await;
      return Err(StepFailure {
        error: BuildError::Cancelled,
        output: String::new(),
      });
    }
    Some(Err(limit)) => {
      let _ = log.write_all(b"timed out\n").await;
      return Err(StepFailure {
        error: BuildError::Timeout {
          step_index: step.index,
          step_name: step.name.clone(),
          limit,
        },
        output: String::new(),
      });
    }
    Some(Ok(Err(e))) => {
      let message = e.to_string();
      let _ = log.write_all(format!("{message}\n").as_bytes()).await;
      return Err(step_failed(message, String::new()));
    }
    Some(Ok(Ok(output))) => output,
  };

  let combined = output.combined();
  let _ = log.write_all(combined.as_bytes()).await;
  if !combined.is_empty() && !combined.ends_with('\n') {
    let _ = log.write_all(b"\n").await;
  }

  if !output.is_success() {
    let message = match output.exit_code {
      Some(code) => format!("exited with status {code}"),
      None => "terminated by signal".to_string(),
    };
    return Err(step_failed(message, truncate_output(&combined, cap)));
  }

  for declared in &step.outputs {
    if !env.resolve_path(declared).exists() {
      return Err(step_failed(
        format!("declared output '{declared}' was not produced"),
        truncate_output(&combined, cap),
      ));
    }
  }

  Ok(output.stdout)
}

async fn with_timeout<F: std::future::Future>(limit: Option<Duration>, fut: F) -> Result<F::Output, Duration> {
  match limit {
    Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| limit),
    None => Ok(fut.await),
  }
}

/// Move the staged prefix to the final prefix, replacing any leftover there.
async fn commit(env: &mut Environment) -> Result<(), String> {
  let stage = env.stage_dir().to_path_buf();
  let prefix = env.prefix().to_path_buf();

  if tokio::fs::try_exists(&prefix).await.unwrap_or(false) {
    debug!(prefix = ?prefix, "replacing existing prefix");
    tokio::fs::remove_dir_all(&prefix)
      .await
      .map_err(|e| format!("remove stale prefix {}: {e}", prefix.display()))?;
  }
  if let Some(parent) = prefix.parent() {
    tokio::fs::create_dir_all(parent)
      .await
      .map_err(|e| format!("create {}: {e}", parent.display()))?;
  }

  if tokio::fs::rename(&stage, &prefix).await.is_err() {
    // Scratch and store may live on different filesystems.
    copy_tree(&stage, &prefix).map_err(|e| format!("commit {} to {}: {e}", stage.display(), prefix.display()))?;
  }

  env.mark_committed();
  info!(formula = %env.id(), prefix = ?prefix, "committed install prefix");
  Ok(())
}

fn copy_tree(from: &Path, to: &Path) -> std::io::Result<()> {
  for entry in walkdir::WalkDir::new(from) {
    let entry = entry.map_err(std::io::Error::other)?;
    let Ok(rel) = entry.path().strip_prefix(from) else {
      continue;
    };
    let target = to.join(rel);
    let file_type = entry.file_type();

    if file_type.is_dir() {
      std::fs::create_dir_all(&target)?;
    } else if file_type.is_symlink() {
      let link = std::fs::read_link(entry.path())?;
      #[cfg(unix)]
      std::os::unix::fs::symlink(&link, &target)?;
      #[cfg(windows)]
      std::fs::copy(entry.path(), &target).map(|_| ())?;
    } else {
      std::fs::copy(entry.path(), &target)?;
    }
  }
  Ok(())
}

/// Keep the last `max` bytes of `output`, on a character boundary.
fn truncate_output(output: &str, max: usize) -> String {
  if output.len() <= max {
    return output.to_string();
  }
  let mut start = output.len() - max;
  while !output.is_char_boundary(start) {
    start += 1;
  }
  format!("[... truncated]\n{}", &output[start..])
}

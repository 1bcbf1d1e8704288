//! Exec action: run a program inside the build environment.

use std::collections::BTreeMap;
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, info};

use crate::execute::env::Environment;
use crate::execute::types::{RunnerError, StepOutput};

/// Run `bin` with `args` in an isolated environment.
///
/// The process starts from a cleared environment holding only
/// [`Environment::variables`] plus `step_env`. `PATH` is the dependencies'
/// `bin` directories and the configured search path, or a sentinel that makes
/// every undeclared tool lookup fail. The working directory is `cwd` resolved
/// against the build directory, or the build directory itself.
///
/// The child is killed if the returned future is dropped, which is how
/// timeouts and cancellation stop a running step.
pub async fn execute_exec(
  bin: &str,
  args: &[String],
  step_env: &BTreeMap<String, String>,
  cwd: Option<&str>,
  env: &Environment,
) -> Result<StepOutput, RunnerError> {
  info!(formula = %env.id(), bin = %bin, "executing command");

  let working_dir = cwd.map(|c| env.resolve_path(c)).unwrap_or_else(|| env.build_dir().to_path_buf());
  tokio::fs::create_dir_all(&working_dir).await?;

  let mut command = Command::new(bin);
  command
    .args(args)
    .current_dir(&working_dir)
    .env_clear()
    .envs(env.variables())
    .envs(step_env)
    .stdin(Stdio::null())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);

  debug!(working_dir = ?working_dir, args = ?args, "spawning process");

  let output = command.output().await.map_err(|source| RunnerError::Spawn {
    bin: bin.to_string(),
    source,
  })?;

  let result = StepOutput {
    exit_code: output.status.code(),
    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
  };

  if !result.is_success() {
    debug!(code = ?result.exit_code, stderr = %result.stderr, "command failed");
  }

  Ok(result)
}

//! Built-in step actions used by [`super::CommandRunner`].

pub mod cmd;
pub mod fetch;

pub use cmd::execute_exec;
pub use fetch::execute_fetch;

use crate::formula::{ResolvedAction, ResolvedStep};

use super::env::Environment;
use super::types::{RunnerError, StepOutput};

/// Dispatch a materialized step to its action handler.
pub async fn execute_action(step: &ResolvedStep, env: &Environment) -> Result<StepOutput, RunnerError> {
  match &step.action {
    ResolvedAction::Exec { bin, args, env: step_env, cwd } => {
      execute_exec(bin, args, step_env, cwd.as_deref(), env).await
    }
    ResolvedAction::Fetch { url, sha256 } => {
      let path = execute_fetch(url, sha256, env.src_dir()).await?;
      Ok(StepOutput::success(path.to_string_lossy()))
    }
  }
}

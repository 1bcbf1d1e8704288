//! The execution backend seam.

use std::future::Future;

use crate::formula::ResolvedStep;

use super::actions;
use super::env::Environment;
use super::types::{RunnerError, StepOutput};

/// Invokes one materialized step.
///
/// The executor owns ordering, timeouts, cancellation, input/output checks and
/// logging; a runner only performs the step and reports what happened. A
/// non-zero exit is an `Ok` output; `Err` is reserved for failing to run at all.
pub trait StepRunner: Send + Sync {
  fn run(&self, step: &ResolvedStep, env: &Environment) -> impl Future<Output = Result<StepOutput, RunnerError>> + Send;
}

/// Runs steps as real processes and downloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandRunner;

impl StepRunner for CommandRunner {
  async fn run(&self, step: &ResolvedStep, env: &Environment) -> Result<StepOutput, RunnerError> {
    actions::execute_action(step, env).await
  }
}

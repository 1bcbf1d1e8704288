//! Expansion of option-dependent steps into a concrete sequence.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::options::OptionSet;
use super::types::{BuildStep, Formula, StepAction, StepArg};

/// A step with every option decision already made.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedStep {
  /// Position in the resolved sequence (not in the declared list).
  pub index: usize,
  pub name: String,
  pub action: ResolvedAction,
  pub inputs: Vec<String>,
  pub outputs: Vec<String>,
  pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResolvedAction {
  Exec {
    bin: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    cwd: Option<String>,
  },
  Fetch {
    url: String,
    sha256: String,
  },
}

impl ResolvedStep {
  pub(crate) fn from_step(index: usize, step: &BuildStep, options: &OptionSet) -> Self {
    let action = match &step.action {
      StepAction::Exec { bin, args, env, cwd } => ResolvedAction::Exec {
        bin: bin.clone(),
        args: args
          .iter()
          .flat_map(|arg| match arg {
            StepArg::Plain(s) => vec![s.clone()],
            StepArg::Conditional { option, on, off } => {
              if options.is_enabled(option) {
                on.clone()
              } else {
                off.clone()
              }
            }
          })
          .collect(),
        env: env.clone(),
        cwd: cwd.clone(),
      },
      StepAction::Fetch { url, sha256 } => ResolvedAction::Fetch {
        url: url.clone(),
        sha256: sha256.clone(),
      },
    };

    Self {
      index,
      name: step.name.clone(),
      action,
      inputs: step.inputs.clone(),
      outputs: step.outputs.clone(),
      timeout: step.timeout_secs.map(Duration::from_secs),
    }
  }
}

impl Formula {
  /// The concrete steps to run for `options`, in declared order.
  ///
  /// Steps whose condition does not hold are dropped and conditional
  /// arguments are expanded, so execution never branches on options.
  pub fn resolve_steps(&self, options: &OptionSet) -> Vec<ResolvedStep> {
    self
      .steps
      .iter()
      .filter(|step| step.when.as_ref().is_none_or(|cond| cond.holds(options)))
      .enumerate()
      .map(|(index, step)| ResolvedStep::from_step(index, step, options))
      .collect()
  }

  /// The smoke test as a resolved step placed after the install steps.
  pub fn resolve_test(&self, options: &OptionSet, after: usize) -> Option<(ResolvedStep, Option<String>)> {
    let test = self.test.as_ref()?;
    if !test.run.when.as_ref().is_none_or(|cond| cond.holds(options)) {
      return None;
    }
    Some((
      ResolvedStep::from_step(after, &test.run, options),
      test.expected_output.clone(),
    ))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::formula::{Condition, Dependency, OptionDecl};

  fn r_formula() -> Formula {
    Formula::new("r", "3.4.0")
      .depends_on(Dependency::optional("openblas"))
      .option(OptionDecl::new("librmath-only", false))
      .option(OptionDecl::new("test", true))
      .step(BuildStep::exec(
        "configure",
        "./configure",
        [
          StepArg::from("--enable-memory-profiling"),
          StepArg::Conditional {
            option: "openblas".to_string(),
            on: vec!["--with-blas=-lopenblas".to_string(), "--with-lapack".to_string()],
            off: vec![],
          },
        ],
      ))
      .step(BuildStep::exec("make", "make", Vec::<&str>::new()).when(Condition::without("librmath-only")))
      .step(BuildStep::exec("check", "make", ["check"]).when(Condition::with("test")))
      .step(BuildStep::exec("nmath", "make", ["-C", "src/nmath/standalone"]).timeout_secs(600))
  }

  #[test]
  fn default_options_keep_all_unconditional_steps() {
    let f = r_formula();
    let options = f.effective_options(&BTreeMap::new()).unwrap();
    let steps = f.resolve_steps(&options);

    let names: Vec<_> = steps.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["configure", "make", "check", "nmath"]);
    assert_eq!(steps.iter().map(|s| s.index).collect::<Vec<_>>(), vec![0, 1, 2, 3]);

    let ResolvedAction::Exec { args, .. } = &steps[0].action else {
      panic!("expected exec");
    };
    assert_eq!(args, &vec!["--enable-memory-profiling".to_string()]);
    assert_eq!(steps[3].timeout, Some(Duration::from_secs(600)));
  }

  #[test]
  fn options_drop_steps_and_expand_args() {
    let f = r_formula();
    let mut requested = BTreeMap::new();
    requested.insert("librmath-only".to_string(), true);
    requested.insert("test".to_string(), false);
    requested.insert("openblas".to_string(), true);
    let options = f.effective_options(&requested).unwrap();

    let steps = f.resolve_steps(&options);
    let names: Vec<_> = steps.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["configure", "nmath"]);
    assert_eq!(steps[1].index, 1);

    let ResolvedAction::Exec { args, .. } = &steps[0].action else {
      panic!("expected exec");
    };
    assert_eq!(
      args,
      &vec![
        "--enable-memory-profiling".to_string(),
        "--with-blas=-lopenblas".to_string(),
        "--with-lapack".to_string(),
      ]
    );
  }

  #[test]
  fn resolution_is_pure() {
    let f = r_formula();
    let options = f.effective_options(&BTreeMap::new()).unwrap();
    assert_eq!(f.resolve_steps(&options), f.resolve_steps(&options));
  }

  #[test]
  fn test_step_is_indexed_after_install_steps() {
    let f = r_formula().smoke_test(BuildStep::exec("test", "Rscript", ["-e", "quit('no')"]), Some(""));
    let options = f.effective_options(&BTreeMap::new()).unwrap();
    let (step, expected) = f.resolve_test(&options, 4).unwrap();
    assert_eq!(step.index, 4);
    assert_eq!(expected.as_deref(), Some(""));
  }
}

//! Test utilities for cellar-lib.
//!
//! [`MockRunner`] stands in for real processes so scheduling, caching and
//! failure handling can be tested without compilers or network. It interprets
//! a handful of pseudo-binaries:
//!
//! - `write PATH CONTENT` creates a file
//! - `echo ARGS...` prints its arguments
//! - `fail MESSAGE...` exits 1 with the message on stderr
//! - `sleep MILLIS` waits
//! - `panic MESSAGE...` panics inside the runner
//!
//! Any other exec step succeeds silently. Fetch steps drop a placeholder file
//! into the source directory.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::cancel::Cancellation;
use crate::execute::actions::fetch::url_to_filename;
use crate::execute::{Environment, EnvironmentConfig, ResourceLimits, RunnerError, StepOutput, StepRunner};
use crate::formula::{BuildStep, Dependency, Formula, FormulaId, FormulaRegistry, ResolvedAction, ResolvedStep};

#[derive(Debug, Default)]
pub struct MockRunner {
  invocations: Mutex<HashMap<String, usize>>,
  started: Mutex<Vec<String>>,
  in_flight: AtomicUsize,
  peak: AtomicUsize,
  delay: Option<Duration>,
}

impl MockRunner {
  pub fn new() -> Self {
    Self::default()
  }

  /// Every step additionally sleeps for `delay`, so overlapping builds are observable.
  pub fn with_delay(delay: Duration) -> Self {
    Self {
      delay: Some(delay),
      ..Self::default()
    }
  }

  /// Steps run for formula `name`.
  pub fn invocations(&self, name: &str) -> usize {
    self.invocations.lock().unwrap().get(name).copied().unwrap_or(0)
  }

  pub fn total_invocations(&self) -> usize {
    self.invocations.lock().unwrap().values().sum()
  }

  /// Formula names in the order their first step started.
  pub fn started(&self) -> Vec<String> {
    self.started.lock().unwrap().clone()
  }

  /// Highest number of steps that were running at the same time.
  pub fn peak_concurrency(&self) -> usize {
    self.peak.load(Ordering::SeqCst)
  }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
  fn drop(&mut self) {
    self.0.fetch_sub(1, Ordering::SeqCst);
  }
}

impl StepRunner for MockRunner {
  async fn run(&self, step: &ResolvedStep, env: &Environment) -> Result<StepOutput, RunnerError> {
    let name = env.id().name.clone();
    {
      let mut invocations = self.invocations.lock().unwrap();
      let count = invocations.entry(name.clone()).or_insert(0);
      if *count == 0 {
        self.started.lock().unwrap().push(name);
      }
      *count += 1;
    }

    let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    self.peak.fetch_max(now, Ordering::SeqCst);
    let _guard = InFlight(&self.in_flight);

    if let Some(delay) = self.delay {
      tokio::time::sleep(delay).await;
    }

    match &step.action {
      ResolvedAction::Exec { bin, args, .. } => match (bin.as_str(), args.as_slice()) {
        ("write", [path, content]) => {
          let path = env.resolve_path(path);
          if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
          }
          tokio::fs::write(&path, content).await?;
          Ok(StepOutput::success(""))
        }
        ("echo", args) => Ok(StepOutput::success(format!("{}\n", args.join(" ")))),
        ("fail", args) => Ok(StepOutput::failure(1, args.join(" "))),
        ("panic", args) => panic!("{}", args.join(" ")),
        ("sleep", [millis]) => {
          let millis = millis.parse::<u64>().unwrap_or(0);
          tokio::time::sleep(Duration::from_millis(millis)).await;
          Ok(StepOutput::success(""))
        }
        _ => Ok(StepOutput::success("")),
      },
      ResolvedAction::Fetch { url, .. } => {
        let path = env.src_dir().join(url_to_filename(url));
        tokio::fs::write(&path, url).await?;
        Ok(StepOutput::success(path.to_string_lossy()))
      }
    }
  }
}

/// Environment settings rooted in `root`, laid out like a real store.
pub fn env_config(root: &Path, id: &FormulaId) -> EnvironmentConfig {
  EnvironmentConfig {
    scratch_root: root.join("scratch"),
    prefix: root.join("store").join("cellar").join(&id.name).join(&id.version),
    log_path: root.join("logs").join(format!("{}-{}.log", id.name, id.version)),
    dep_prefixes: BTreeMap::new(),
    search_path: Vec::<PathBuf>::new(),
    limits: ResourceLimits::default(),
    keep_scratch: false,
    run_tests: true,
    cancel: Cancellation::new(),
  }
}

/// A formula whose single install step writes `bin/<name>`.
pub fn simple_formula(name: &str, deps: Vec<Dependency>) -> Formula {
  let mut formula = Formula::new(name, "1.0").step(BuildStep::exec(
    "install",
    "write",
    [format!("$${{prefix}}/bin/{name}"), name.to_string()],
  ));
  formula.dependencies = deps;
  formula
}

/// gmp, readline and gap, where gap needs gmp and recommends readline.
pub fn gap_registry() -> FormulaRegistry {
  let gmp = Formula::new("gmp", "6.1.2")
    .step(BuildStep::exec("install", "write", ["$${prefix}/lib/libgmp.a", "gmp"]));
  let readline = Formula::new("readline", "7.0")
    .step(BuildStep::exec("install", "write", ["$${prefix}/lib/libreadline.a", "readline"]));
  let gap = Formula::new("gap", "4.8.3")
    .depends_on(Dependency::runtime("gmp"))
    .depends_on(Dependency::recommended("readline"))
    .step(BuildStep::exec("configure", "echo", ["--with-gmp=$${dep:gmp}"]).inputs(["$${dep:gmp}/lib/libgmp.a"]))
    .step(BuildStep::exec("install", "write", ["$${prefix}/bin/gap", "gap"]));

  FormulaRegistry::from_formulas([gmp, readline, gap]).unwrap()
}

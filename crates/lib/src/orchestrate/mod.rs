//! Top-level build driver.
//!
//! An [`Orchestrator`] resolves a request into a plan, serves what it can from
//! the artifact store and schedules the rest on a bounded pool of build tasks.
//! A node starts only once all of its dependencies succeeded; a failure skips
//! everything downstream of it while unrelated branches carry on.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use thiserror::Error;
use tokio::sync::OnceCell;
use tokio::task::{self, JoinSet};
use tracing::{debug, error, info, warn};

pub use crate::cancel::Cancellation;

use crate::config::OrchestratorConfig;
use crate::execute::{self, BuildError, BuildResult, BuildStatus, CommandRunner, Environment, EnvironmentConfig, StepRunner};
use crate::formula::{FormulaError, FormulaId, FormulaRegistry, OptionOverrides, OptionSet};
use crate::report::{NodeReport, NodeStatus, OrchestrationReport};
use crate::resolve::{BuildPlan, ResolveError, resolve};
use crate::store::{ArtifactKey, ArtifactStore, ConsistencyError, StoreLayout};
use crate::util::hash::ObjectHash;

#[derive(Debug, Error)]
pub enum OrchestrateError {
  #[error(transparent)]
  Resolve(#[from] ResolveError),

  #[error(transparent)]
  Formula(#[from] FormulaError),

  #[error("concurrency must be at least 1")]
  InvalidConcurrency,
}

/// What one executor invocation produced, shared by every waiter on its key.
#[derive(Debug, Clone)]
struct NodeBuild {
  result: BuildResult,
  inconsistency: Option<ConsistencyError>,
}

struct Job {
  key: ArtifactKey,
  options: OptionSet,
  dep_prefixes: BTreeMap<String, PathBuf>,
}

type InFlight = Mutex<HashMap<ArtifactKey, Arc<OnceCell<NodeBuild>>>>;

/// Drops a key's single-flight entry once its holder is done with it, including
/// when the build unwinds.
struct Flight<'a> {
  table: &'a InFlight,
  key: &'a ArtifactKey,
  cell: Arc<OnceCell<NodeBuild>>,
}

impl Drop for Flight<'_> {
  fn drop(&mut self) {
    let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
    if table.get(self.key).is_some_and(|c| Arc::ptr_eq(c, &self.cell)) {
      table.remove(self.key);
    }
  }
}

/// Drives resolution, scheduling, caching and reporting.
///
/// Cheap to clone; clones share the registry, store, runner and the
/// single-flight table, so concurrent runs never build one key twice.
pub struct Orchestrator<R: StepRunner + 'static = CommandRunner> {
  registry: Arc<FormulaRegistry>,
  store: Arc<ArtifactStore>,
  runner: Arc<R>,
  config: Arc<OrchestratorConfig>,
  layout: StoreLayout,
  in_flight: Arc<InFlight>,
}

impl<R: StepRunner + 'static> Clone for Orchestrator<R> {
  fn clone(&self) -> Self {
    Self {
      registry: self.registry.clone(),
      store: self.store.clone(),
      runner: self.runner.clone(),
      config: self.config.clone(),
      layout: self.layout.clone(),
      in_flight: self.in_flight.clone(),
    }
  }
}

impl<R: StepRunner + 'static> Orchestrator<R> {
  pub fn new(registry: FormulaRegistry, store: ArtifactStore, runner: R, config: OrchestratorConfig) -> Self {
    Self::from_shared(Arc::new(registry), Arc::new(store), Arc::new(runner), config)
  }

  pub fn from_shared(
    registry: Arc<FormulaRegistry>,
    store: Arc<ArtifactStore>,
    runner: Arc<R>,
    config: OrchestratorConfig,
  ) -> Self {
    Self {
      registry,
      store,
      runner,
      layout: StoreLayout::new(config.store_dir.clone()),
      config: Arc::new(config),
      in_flight: Arc::new(Mutex::new(HashMap::new())),
    }
  }

  pub fn registry(&self) -> &FormulaRegistry {
    &self.registry
  }

  pub fn store(&self) -> &ArtifactStore {
    &self.store
  }

  pub fn config(&self) -> &OrchestratorConfig {
    &self.config
  }

  /// Resolve without building.
  pub fn plan<S: AsRef<str>>(&self, requested: &[S], overrides: &OptionOverrides) -> Result<BuildPlan, ResolveError> {
    resolve(&self.registry, requested, overrides)
  }

  pub async fn run<S: AsRef<str>>(
    &self,
    requested: &[S],
    overrides: &OptionOverrides,
    concurrency: usize,
  ) -> Result<OrchestrationReport, OrchestrateError> {
    self
      .run_with_cancel(requested, overrides, concurrency, &Cancellation::new())
      .await
  }

  /// Resolve and build `requested`, running at most `concurrency` builds at once.
  ///
  /// Resolution and recipe errors are returned before anything is built.
  /// Build failures are not errors: they are reported per node. Once `cancel`
  /// fires no new builds start, running builds are interrupted, and every
  /// unfinished node is reported as cancelled.
  pub async fn run_with_cancel<S: AsRef<str>>(
    &self,
    requested: &[S],
    overrides: &OptionOverrides,
    concurrency: usize,
    cancel: &Cancellation,
  ) -> Result<OrchestrationReport, OrchestrateError> {
    if concurrency == 0 {
      return Err(OrchestrateError::InvalidConcurrency);
    }
    let start = Instant::now();
    let plan = resolve(&self.registry, requested, overrides)?;
    let nodes = plan.nodes();
    let n = nodes.len();

    let positions: HashMap<&FormulaId, usize> = nodes.iter().enumerate().map(|(i, node)| (&node.id, i)).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut waiting: Vec<usize> = vec![0; n];
    for (i, node) in nodes.iter().enumerate() {
      waiting[i] = node.dependencies.len();
      for dep in &node.dependencies {
        if let Some(&d) = positions.get(&dep.id) {
          dependents[d].push(i);
        }
      }
    }

    let mut keys = Vec::with_capacity(n);
    let mut reports = Vec::with_capacity(n);
    for node in nodes {
      let formula = self
        .registry
        .get(&node.id.name)
        .ok_or_else(|| ResolveError::UnknownFormula(node.id.name.clone()))?;
      keys.push(ArtifactKey::new(
        node.id.clone(),
        node.options_hash.clone(),
        formula.recipe_hash()?,
      ));
      reports.push(NodeReport::pending(
        node.id.clone(),
        node.options.clone(),
        node.requested,
        formula.caveats_for(&node.options),
      ));
    }

    info!(nodes = n, concurrency, "starting orchestration");

    let mut done = vec![false; n];
    let mut prefixes: HashMap<String, PathBuf> = HashMap::new();
    let mut ready: BTreeSet<usize> = (0..n).filter(|&i| waiting[i] == 0).collect();
    let mut tasks: JoinSet<(usize, NodeBuild)> = JoinSet::new();
    let mut task_positions: HashMap<task::Id, usize> = HashMap::new();

    loop {
      while tasks.len() < concurrency && !cancel.is_cancelled() {
        let Some(pos) = ready.pop_first() else {
          break;
        };
        let node = &nodes[pos];
        let key = keys[pos].clone();

        if let Some(cached) = self.cached(&key) {
          info!(formula = %node.id, "using cached artifact");
          let report = &mut reports[pos];
          report.status = NodeStatus::Cached;
          report.prefix = cached.prefix.clone();
          report.content_hash = cached.content_hash.clone();
          report.log_path = cached.log_path.clone();
          if let Some(prefix) = cached.prefix {
            prefixes.insert(node.id.name.clone(), prefix);
          }
          done[pos] = true;
          release(pos, &dependents, &mut waiting, &done, &mut ready);
          continue;
        }

        let dep_prefixes = node
          .dependencies
          .iter()
          .filter_map(|dep| prefixes.get(&dep.id.name).map(|p| (dep.id.name.clone(), p.clone())))
          .collect();
        let job = Job {
          key,
          options: node.options.clone(),
          dep_prefixes,
        };

        debug!(formula = %node.id, position = pos, "scheduling build");
        let this = self.clone();
        let cancel = cancel.clone();
        let handle = tasks.spawn(async move { (pos, this.build_node(job, cancel).await) });
        task_positions.insert(handle.id(), pos);
      }

      let Some(joined) = tasks.join_next_with_id().await else {
        break;
      };
      let (pos, outcome) = match joined {
        Ok((task_id, value)) => {
          task_positions.remove(&task_id);
          value
        }
        Err(e) => {
          let Some(pos) = task_positions.remove(&e.id()) else {
            error!(error = %e, "build task ended without a plan position");
            continue;
          };
          error!(formula = %nodes[pos].id, error = %e, "build task died");
          let error = if e.is_panic() {
            BuildError::Panicked(e.to_string())
          } else {
            BuildError::Cancelled
          };
          let key = &keys[pos];
          let result = BuildResult::not_started(key.id.clone(), nodes[pos].options.clone(), key.recipe_hash.clone(), error);
          (
            pos,
            NodeBuild {
              result,
              inconsistency: None,
            },
          )
        }
      };

      done[pos] = true;
      let report = &mut reports[pos];
      report.duration = outcome.result.duration;
      report.log_path = outcome.result.log_path.clone();
      report.failure = outcome.result.failure.clone();
      report.inconsistency = outcome.inconsistency.clone();

      let status = match (&outcome.result.status, outcome.result.error()) {
        (_, Some(BuildError::Cancelled)) => NodeStatus::Cancelled,
        (BuildStatus::SkippedCached, _) => NodeStatus::Cached,
        (BuildStatus::Success, _) => NodeStatus::Built,
        (BuildStatus::Failed, _) => NodeStatus::Failed,
      };

      match status {
        NodeStatus::Built | NodeStatus::Cached => {
          report.prefix = outcome.result.prefix.clone();
          report.content_hash = outcome.result.content_hash.clone();
          if let Some(prefix) = outcome.result.prefix {
            prefixes.insert(nodes[pos].id.name.clone(), prefix);
          }
          report.status = status;
          release(pos, &dependents, &mut waiting, &done, &mut ready);
        }
        NodeStatus::Failed => {
          report.status = status;
          skip_dependents(pos, &nodes[pos].id, &dependents, &mut done, &mut reports);
        }
        other => report.status = other,
      }
    }

    let report = OrchestrationReport {
      nodes: reports,
      roots: plan.roots().to_vec(),
      external: plan.external().to_vec(),
      duration: start.elapsed(),
    };

    info!(
      built = report.count("built"),
      cached = report.count("cached"),
      failed = report.count("failed"),
      skipped = report.count("skipped"),
      cancelled = report.count("cancelled"),
      "orchestration finished"
    );
    Ok(report)
  }

  /// A stored success whose prefix is still on disk.
  fn cached(&self, key: &ArtifactKey) -> Option<BuildResult> {
    let found = self.store.lookup_key(key)?;
    match &found.prefix {
      Some(prefix) if !prefix.exists() => {
        warn!(artifact = %key, prefix = ?prefix, "cached prefix missing, rebuilding");
        None
      }
      _ => Some(found),
    }
  }

  /// Build one key, joining an in-flight build of the same key if there is one.
  async fn build_node(&self, job: Job, cancel: Cancellation) -> NodeBuild {
    let cell = {
      let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
      in_flight.entry(job.key.clone()).or_default().clone()
    };
    let flight = Flight {
      table: &self.in_flight,
      key: &job.key,
      cell,
    };

    flight
      .cell
      .get_or_init(|| self.build_and_record(&job, &cancel))
      .await
      .clone()
  }

  async fn build_and_record(&self, job: &Job, cancel: &Cancellation) -> NodeBuild {
    let key = &job.key;

    // A run that finished this key after our scheduler checked the store has
    // already left the single-flight table.
    if let Some(cached) = self.cached(key) {
      debug!(artifact = %key, "built by a concurrent run");
      return NodeBuild {
        result: cached.as_cached(),
        inconsistency: None,
      };
    }

    let not_started = |error: BuildError| {
      BuildResult::not_started(key.id.clone(), job.options.clone(), key.recipe_hash.clone(), error)
    };

    let mut result = match self.registry.get(&key.id.name) {
      None => not_started(BuildError::EnvironmentSetupFailed(format!("unknown formula {}", key.id))),
      Some(formula) => {
        let env_config = EnvironmentConfig {
          scratch_root: self.config.scratch_dir.clone(),
          prefix: self.layout.prefix(key),
          log_path: self.layout.log(key, self.store.history(key).len() + 1),
          dep_prefixes: job.dep_prefixes.clone(),
          search_path: self.config.search_path.clone(),
          limits: self.config.limits(),
          keep_scratch: self.config.keep_scratch,
          run_tests: self.config.run_tests,
          cancel: cancel.clone(),
        };
        match Environment::create(&key.id, env_config) {
          Ok(env) => execute::build(formula, &job.options, env, self.runner.as_ref()).await,
          Err(e) => not_started(e),
        }
      }
    };

    if result.error() == Some(&BuildError::Cancelled) {
      return NodeBuild {
        result,
        inconsistency: None,
      };
    }

    let mut inconsistency = None;
    if self.config.strict_consistency
      && let Some(drift) = self.store.check(&result)
    {
      error!(artifact = %key, error = %drift, "rejecting build with drifted manifest");
      result = result.rejected(BuildError::InconsistentManifest(drift.to_string()));
      inconsistency = Some(drift);
    }

    match self.store.record(result.clone()) {
      Ok(found) => inconsistency = inconsistency.or(found),
      Err(e) => error!(artifact = %key, error = %e, "failed to record build result"),
    }

    NodeBuild { result, inconsistency }
  }
}

fn release(pos: usize, dependents: &[Vec<usize>], waiting: &mut [usize], done: &[bool], ready: &mut BTreeSet<usize>) {
  for &d in &dependents[pos] {
    waiting[d] = waiting[d].saturating_sub(1);
    if waiting[d] == 0 && !done[d] {
      ready.insert(d);
    }
  }
}

/// Mark every transitive dependent of a failed node as skipped.
fn skip_dependents(
  failed: usize,
  root_cause: &FormulaId,
  dependents: &[Vec<usize>],
  done: &mut [bool],
  reports: &mut [NodeReport],
) {
  let mut stack: Vec<usize> = dependents[failed].clone();
  while let Some(d) = stack.pop() {
    if done[d] {
      continue;
    }
    done[d] = true;
    warn!(formula = %reports[d].id, cause = %root_cause, "skipping: dependency failed");
    reports[d].status = NodeStatus::SkippedDependencyFailed {
      root_cause: root_cause.clone(),
    };
    stack.extend(dependents[d].iter().copied());
  }
}

/// The key a plan node's artifact is stored under.
pub fn artifact_key(registry: &FormulaRegistry, id: &FormulaId, options_hash: &ObjectHash) -> Result<ArtifactKey, OrchestrateError> {
  let formula = registry
    .get(&id.name)
    .ok_or_else(|| ResolveError::UnknownFormula(id.name.clone()))?;
  Ok(ArtifactKey::new(id.clone(), options_hash.clone(), formula.recipe_hash()?))
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration;

  use crate::formula::{BuildStep, Dependency, Formula};
  use crate::util::testutil::{MockRunner, gap_registry, simple_formula};
  use tempfile::TempDir;
  use tracing_test::traced_test;

  fn orchestrator(temp: &TempDir, registry: FormulaRegistry, runner: MockRunner) -> Orchestrator<MockRunner> {
    let config = OrchestratorConfig::rooted(temp.path());
    let store = ArtifactStore::open(&config.store_dir).unwrap();
    Orchestrator::new(registry, store, runner, config)
  }

  fn without_readline() -> OptionOverrides {
    OptionOverrides::new().set("gap", "readline", false)
  }

  fn names(report: &OrchestrationReport) -> Vec<&str> {
    report.nodes.iter().map(|n| n.id.name.as_str()).collect()
  }

  #[tokio::test]
  async fn builds_dependencies_before_dependents() {
    let temp = TempDir::new().unwrap();
    let orch = orchestrator(&temp, gap_registry(), MockRunner::new());

    let report = orch.run(&["gap"], &without_readline(), 2).await.unwrap();

    assert!(report.is_success());
    assert_eq!(names(&report), vec!["gmp", "gap"]);
    assert_eq!(report.get("gmp").unwrap().status, NodeStatus::Built);
    assert_eq!(report.get("gap").unwrap().status, NodeStatus::Built);
    assert!(!report.get("gmp").unwrap().requested);
    assert!(report.get("gap").unwrap().requested);

    let gap_prefix = report.get("gap").unwrap().prefix.clone().unwrap();
    assert!(gap_prefix.join("bin/gap").exists());
    assert_eq!(orch.runner.started(), vec!["gmp", "gap"]);
  }

  #[tokio::test]
  async fn second_run_is_served_from_cache() {
    let temp = TempDir::new().unwrap();
    let orch = orchestrator(&temp, gap_registry(), MockRunner::new());

    orch.run(&["gap"], &without_readline(), 2).await.unwrap();
    let invoked = orch.runner.total_invocations();

    let report = orch.run(&["gap"], &without_readline(), 2).await.unwrap();
    assert!(report.is_success());
    assert_eq!(report.count("cached"), 2);
    assert_eq!(orch.runner.total_invocations(), invoked);
  }

  #[tokio::test]
  async fn cache_survives_reopening_the_store() {
    let temp = TempDir::new().unwrap();
    orchestrator(&temp, gap_registry(), MockRunner::new())
      .run(&["gap"], &without_readline(), 1)
      .await
      .unwrap();

    let orch = orchestrator(&temp, gap_registry(), MockRunner::new());
    let report = orch.run(&["gap"], &without_readline(), 1).await.unwrap();
    assert_eq!(report.count("cached"), 2);
    assert_eq!(orch.runner.total_invocations(), 0);
  }

  #[tokio::test]
  async fn changed_options_rebuild() {
    let temp = TempDir::new().unwrap();
    let orch = orchestrator(&temp, gap_registry(), MockRunner::new());

    orch.run(&["gap"], &without_readline(), 2).await.unwrap();
    let report = orch.run(&["gap"], &OptionOverrides::new(), 2).await.unwrap();

    assert_eq!(names(&report), vec!["gmp", "readline", "gap"]);
    assert_eq!(report.get("gmp").unwrap().status, NodeStatus::Cached);
    assert_eq!(report.get("readline").unwrap().status, NodeStatus::Built);
    assert_eq!(report.get("gap").unwrap().status, NodeStatus::Built);
  }

  #[tokio::test]
  async fn missing_prefix_forces_rebuild() {
    let temp = TempDir::new().unwrap();
    let orch = orchestrator(&temp, gap_registry(), MockRunner::new());

    let first = orch.run(&["gmp"], &OptionOverrides::new(), 1).await.unwrap();
    std::fs::remove_dir_all(first.get("gmp").unwrap().prefix.as_ref().unwrap()).unwrap();

    let second = orch.run(&["gmp"], &OptionOverrides::new(), 1).await.unwrap();
    assert_eq!(second.get("gmp").unwrap().status, NodeStatus::Built);
    assert_eq!(orch.runner.invocations("gmp"), 2);
  }

  #[tokio::test]
  #[traced_test]
  async fn failure_skips_dependents() {
    let temp = TempDir::new().unwrap();
    let gmp = Formula::new("gmp", "6.1.2").step(BuildStep::exec("configure", "fail", ["no compiler"]));
    let gap = simple_formula("gap", vec![Dependency::runtime("gmp")]);
    let top = simple_formula("top", vec![Dependency::runtime("gap")]);
    let registry = FormulaRegistry::from_formulas([gmp, gap, top]).unwrap();
    let orch = orchestrator(&temp, registry, MockRunner::new());

    let report = orch.run(&["top"], &OptionOverrides::new(), 2).await.unwrap();

    assert!(!report.is_success());
    assert_eq!(report.get("gmp").unwrap().status, NodeStatus::Failed);
    let gmp_id = FormulaId::new("gmp", "6.1.2");
    for name in ["gap", "top"] {
      assert_eq!(
        report.get(name).unwrap().status,
        NodeStatus::SkippedDependencyFailed {
          root_cause: gmp_id.clone()
        }
      );
      assert_eq!(orch.runner.invocations(name), 0);
    }

    let failure = report.get("gmp").unwrap().failure.as_ref().unwrap();
    assert_eq!(failure.error.step_name(), Some("configure"));
    assert!(failure.output.contains("no compiler"));
    assert!(logs_contain("skipping: dependency failed"));
  }

  #[tokio::test]
  async fn unrelated_branch_still_builds() {
    let temp = TempDir::new().unwrap();
    let broken = Formula::new("broken", "1.0").step(BuildStep::exec("build", "fail", ["boom"]));
    let fine = simple_formula("fine", vec![]);
    let registry = FormulaRegistry::from_formulas([broken, fine]).unwrap();
    let orch = orchestrator(&temp, registry, MockRunner::new());

    let report = orch.run(&["broken", "fine"], &OptionOverrides::new(), 1).await.unwrap();

    assert!(!report.is_success());
    assert_eq!(report.get("broken").unwrap().status, NodeStatus::Failed);
    assert_eq!(report.get("fine").unwrap().status, NodeStatus::Built);
  }

  #[tokio::test]
  async fn failures_are_recorded_but_not_served() {
    let temp = TempDir::new().unwrap();
    let broken = Formula::new("broken", "1.0").step(BuildStep::exec("build", "fail", ["boom"]));
    let registry = FormulaRegistry::from_formulas([broken]).unwrap();
    let orch = orchestrator(&temp, registry, MockRunner::new());

    orch.run(&["broken"], &OptionOverrides::new(), 1).await.unwrap();
    let report = orch.run(&["broken"], &OptionOverrides::new(), 1).await.unwrap();

    assert_eq!(report.get("broken").unwrap().status, NodeStatus::Failed);
    assert_eq!(orch.runner.invocations("broken"), 2);
    assert_eq!(orch.store().entries().len(), 1);
  }

  #[tokio::test]
  async fn concurrency_is_bounded() {
    let temp = TempDir::new().unwrap();
    let leaves: Vec<Formula> = (0..6).map(|i| simple_formula(&format!("leaf{i}"), vec![])).collect();
    let roots: Vec<String> = leaves.iter().map(|f| f.name.clone()).collect();
    let registry = FormulaRegistry::from_formulas(leaves).unwrap();
    let orch = orchestrator(&temp, registry, MockRunner::with_delay(Duration::from_millis(30)));

    let report = orch.run(&roots, &OptionOverrides::new(), 2).await.unwrap();

    assert!(report.is_success());
    assert_eq!(report.count("built"), 6);
    assert!(orch.runner.peak_concurrency() <= 2);
  }

  #[tokio::test]
  async fn single_worker_follows_plan_order() {
    let temp = TempDir::new().unwrap();
    let registry = FormulaRegistry::from_formulas([
      simple_formula("c", vec![]),
      simple_formula("a", vec![]),
      simple_formula("b", vec![Dependency::runtime("c")]),
    ])
    .unwrap();
    let orch = orchestrator(&temp, registry, MockRunner::new());

    let report = orch.run(&["a", "b"], &OptionOverrides::new(), 1).await.unwrap();

    assert_eq!(orch.runner.started(), names(&report));
    assert_eq!(orch.runner.peak_concurrency(), 1);
  }

  #[tokio::test]
  async fn concurrent_runs_share_one_build() {
    let temp = TempDir::new().unwrap();
    let registry = FormulaRegistry::from_formulas([simple_formula("zlib", vec![])]).unwrap();
    let orch = orchestrator(&temp, registry, MockRunner::with_delay(Duration::from_millis(50)));

    let (overrides_a, overrides_b) = (OptionOverrides::new(), OptionOverrides::new());
    let (a, b) = tokio::join!(
      orch.run(&["zlib"], &overrides_a, 1),
      orch.run(&["zlib"], &overrides_b, 1),
    );

    assert!(a.unwrap().is_success());
    assert!(b.unwrap().is_success());
    assert_eq!(orch.runner.invocations("zlib"), 1);
    assert_eq!(orch.store().history(&ArtifactKey::of(&orch.store().entries()[0])).len(), 1);
  }

  #[tokio::test]
  async fn cancel_before_start_builds_nothing() {
    let temp = TempDir::new().unwrap();
    let orch = orchestrator(&temp, gap_registry(), MockRunner::new());
    let cancel = Cancellation::new();
    cancel.cancel();

    let report = orch
      .run_with_cancel(&["gap"], &without_readline(), 2, &cancel)
      .await
      .unwrap();

    assert_eq!(report.count("cancelled"), 2);
    assert_eq!(orch.runner.total_invocations(), 0);
    assert!(orch.store().entries().is_empty());
  }

  #[tokio::test]
  async fn cancel_interrupts_running_build() {
    let temp = TempDir::new().unwrap();
    let slow = Formula::new("slow", "1.0").step(BuildStep::exec("compile", "sleep", ["5000"]));
    let after = simple_formula("after", vec![Dependency::runtime("slow")]);
    let registry = FormulaRegistry::from_formulas([slow, after]).unwrap();
    let orch = orchestrator(&temp, registry, MockRunner::new());

    let cancel = Cancellation::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
      tokio::time::sleep(Duration::from_millis(50)).await;
      trigger.cancel();
    });

    let started = Instant::now();
    let report = orch
      .run_with_cancel(&["after"], &OptionOverrides::new(), 2, &cancel)
      .await
      .unwrap();

    assert!(started.elapsed() < Duration::from_secs(4));
    assert_eq!(report.get("slow").unwrap().status, NodeStatus::Cancelled);
    assert_eq!(report.get("after").unwrap().status, NodeStatus::Cancelled);
    assert_eq!(orch.runner.invocations("after"), 0);
    assert!(orch.store().entries().is_empty());
  }

  fn stale_record(orch: &Orchestrator<MockRunner>, temp: &TempDir) -> BuildResult {
    let plan = orch.plan(&["gmp"], &OptionOverrides::new()).unwrap();
    let node = &plan.nodes()[0];
    let key = artifact_key(orch.registry(), &node.id, &node.options_hash).unwrap();
    BuildResult {
      id: key.id,
      options: node.options.clone(),
      options_hash: key.options_hash,
      recipe_hash: key.recipe_hash,
      status: BuildStatus::Success,
      manifest: vec!["lib/libgmp.so".to_string()],
      content_hash: None,
      prefix: Some(temp.path().join("gone")),
      log_path: None,
      duration: Duration::ZERO,
      failure: None,
    }
  }

  #[tokio::test]
  async fn manifest_drift_is_reported() {
    let temp = TempDir::new().unwrap();
    let orch = orchestrator(&temp, gap_registry(), MockRunner::new());
    orch.store().record(stale_record(&orch, &temp)).unwrap();

    let report = orch.run(&["gmp"], &OptionOverrides::new(), 1).await.unwrap();

    let gmp = report.get("gmp").unwrap();
    assert_eq!(gmp.status, NodeStatus::Built);
    let drift = gmp.inconsistency.as_ref().unwrap();
    assert_eq!(drift.missing, vec!["lib/libgmp.so"]);
    assert_eq!(drift.unexpected, vec!["lib/libgmp.a"]);
  }

  #[tokio::test]
  async fn strict_consistency_fails_on_drift() {
    let temp = TempDir::new().unwrap();
    let mut config = OrchestratorConfig::rooted(temp.path());
    config.strict_consistency = true;
    let store = ArtifactStore::open(&config.store_dir).unwrap();
    let registry = FormulaRegistry::from_formulas([
      gap_registry().get("gmp").unwrap().clone(),
      simple_formula("top", vec![Dependency::runtime("gmp")]),
    ])
    .unwrap();
    let orch = Orchestrator::new(registry, store, MockRunner::new(), config);
    orch.store().record(stale_record(&orch, &temp)).unwrap();

    let report = orch.run(&["top"], &OptionOverrides::new(), 1).await.unwrap();

    let gmp = report.get("gmp").unwrap();
    assert_eq!(gmp.status, NodeStatus::Failed);
    assert!(gmp.inconsistency.is_some());
    assert!(matches!(
      gmp.failure.as_ref().map(|f| &f.error),
      Some(BuildError::InconsistentManifest(_))
    ));
    assert!(matches!(
      report.get("top").unwrap().status,
      NodeStatus::SkippedDependencyFailed { .. }
    ));

    // The rejected build is not served on the next run.
    let again = orch.run(&["top"], &OptionOverrides::new(), 1).await.unwrap();
    assert_eq!(again.get("gmp").unwrap().status, NodeStatus::Failed);
    assert_eq!(orch.runner.invocations("gmp"), 2);
    assert_eq!(orch.runner.invocations("top"), 0);
  }

  #[tokio::test]
  async fn panicking_build_fails_and_skips_dependents() {
    let temp = TempDir::new().unwrap();
    let crashy = Formula::new("crashy", "1.0").step(BuildStep::exec("compile", "panic", ["runner bug"]));
    let after = simple_formula("after", vec![Dependency::runtime("crashy")]);
    let fine = simple_formula("fine", vec![]);
    let registry = FormulaRegistry::from_formulas([crashy, after, fine]).unwrap();
    let orch = orchestrator(&temp, registry, MockRunner::new());

    let report = orch.run(&["after", "fine"], &OptionOverrides::new(), 2).await.unwrap();

    let crashy = report.get("crashy").unwrap();
    assert_eq!(crashy.status, NodeStatus::Failed);
    assert!(matches!(
      crashy.failure.as_ref().map(|f| &f.error),
      Some(BuildError::Panicked(_))
    ));
    assert_eq!(
      report.get("after").unwrap().status,
      NodeStatus::SkippedDependencyFailed {
        root_cause: FormulaId::new("crashy", "1.0")
      }
    );
    assert_eq!(report.get("fine").unwrap().status, NodeStatus::Built);
    assert_eq!(report.count("cancelled"), 0);
    assert!(orch.in_flight.lock().unwrap().is_empty());
  }

  #[tokio::test]
  async fn build_rechecks_store_before_running() {
    let temp = TempDir::new().unwrap();
    let orch = orchestrator(&temp, gap_registry(), MockRunner::new());
    let first = orch.run(&["gmp"], &OptionOverrides::new(), 1).await.unwrap();

    // A scheduler that checked the store before the first run recorded gmp.
    let plan = orch.plan(&["gmp"], &OptionOverrides::new()).unwrap();
    let node = &plan.nodes()[0];
    let key = artifact_key(orch.registry(), &node.id, &node.options_hash).unwrap();
    let job = Job {
      key: key.clone(),
      options: node.options.clone(),
      dep_prefixes: BTreeMap::new(),
    };
    let outcome = orch.build_node(job, Cancellation::new()).await;

    assert_eq!(outcome.result.status, BuildStatus::SkippedCached);
    assert_eq!(outcome.result.prefix, first.get("gmp").unwrap().prefix);
    assert_eq!(orch.runner.invocations("gmp"), 1);
    assert_eq!(orch.store().history(&key).len(), 1);
  }

  #[tokio::test]
  async fn rebuilds_keep_earlier_logs() {
    let temp = TempDir::new().unwrap();
    let orch = orchestrator(&temp, gap_registry(), MockRunner::new());

    let first = orch.run(&["gmp"], &OptionOverrides::new(), 1).await.unwrap();
    let first_prefix = first.get("gmp").unwrap().prefix.clone().unwrap();
    std::fs::remove_dir_all(&first_prefix).unwrap();
    let second = orch.run(&["gmp"], &OptionOverrides::new(), 1).await.unwrap();

    let first_log = first.get("gmp").unwrap().log_path.clone().unwrap();
    let second_log = second.get("gmp").unwrap().log_path.clone().unwrap();
    assert_ne!(first_log, second_log);
    assert!(first_log.exists());
    assert!(second_log.exists());

    let history = orch.store().history(&ArtifactKey::of(&orch.store().entries()[0]));
    assert_eq!(history[0].log_path.as_ref(), Some(&first_log));
  }

  #[tokio::test]
  async fn resolve_errors_abort_before_building() {
    let temp = TempDir::new().unwrap();
    let registry = FormulaRegistry::from_formulas([
      simple_formula("a", vec![Dependency::runtime("b")]),
      simple_formula("b", vec![Dependency::runtime("a")]),
    ])
    .unwrap();
    let orch = orchestrator(&temp, registry, MockRunner::new());

    let err = orch.run(&["a"], &OptionOverrides::new(), 2).await.unwrap_err();
    assert!(matches!(
      err,
      OrchestrateError::Resolve(ResolveError::CyclicDependency { .. })
    ));
    assert_eq!(orch.runner.total_invocations(), 0);
  }

  #[tokio::test]
  async fn zero_concurrency_is_rejected() {
    let temp = TempDir::new().unwrap();
    let orch = orchestrator(&temp, gap_registry(), MockRunner::new());
    let err = orch.run(&["gmp"], &OptionOverrides::new(), 0).await.unwrap_err();
    assert!(matches!(err, OrchestrateError::InvalidConcurrency));
  }
}

//! The scoped context of one build invocation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::TempDir;
use tracing::{debug, info};

use crate::cancel::Cancellation;
use crate::formula::{FormulaId, ResolvedAction, ResolvedStep};
use crate::placeholder::{self, PlaceholderError, Resolver};

use super::types::BuildError;

/// Value of `PATH` when no search path is configured, so undeclared tools fail fast.
pub const PATH_NOT_SET: &str = "/path-not-set";
pub const HOMELESS: &str = "/homeless-shelter";
/// 1980-01-01T00:00:00Z, the ZIP epoch.
pub const SOURCE_DATE_EPOCH: &str = "315532800";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLimits {
  /// Applies to steps without their own timeout. `None` means unbounded.
  pub default_step_timeout: Option<Duration>,
  /// Captured output kept per step; older output is dropped first.
  pub max_output_bytes: usize,
}

impl Default for ResourceLimits {
  fn default() -> Self {
    Self {
      default_step_timeout: None,
      max_output_bytes: 64 * 1024,
    }
  }
}

/// Everything needed to create an [`Environment`].
#[derive(Debug, Clone)]
pub struct EnvironmentConfig {
  /// Directory the unique scratch directory is created in.
  pub scratch_root: PathBuf,
  /// Final install prefix; the staged prefix is renamed here on success.
  pub prefix: PathBuf,
  pub log_path: PathBuf,
  /// Install prefixes of included dependencies, by formula name.
  pub dep_prefixes: BTreeMap<String, PathBuf>,
  /// Directories joined into `PATH` after the dependencies' `bin` directories.
  pub search_path: Vec<PathBuf>,
  pub limits: ResourceLimits,
  pub keep_scratch: bool,
  pub run_tests: bool,
  pub cancel: Cancellation,
}

/// Scoped filesystem roots, variables and limits for one build.
///
/// Exclusively owned by one in-flight build. The scratch directory is removed
/// when the environment is dropped unless `keep_scratch` was set.
#[derive(Debug)]
pub struct Environment {
  id: FormulaId,
  scratch: Option<TempDir>,
  root: PathBuf,
  src_dir: PathBuf,
  build_dir: PathBuf,
  stage_dir: PathBuf,
  tmp_dir: PathBuf,
  prefix: PathBuf,
  committed: bool,
  log_path: PathBuf,
  dep_prefixes: BTreeMap<String, PathBuf>,
  search_path: Vec<PathBuf>,
  limits: ResourceLimits,
  keep_scratch: bool,
  run_tests: bool,
  cancel: Cancellation,
}

impl Environment {
  /// Create a unique scratch directory with its `src`, `build`, `stage` and
  /// `tmp` subdirectories.
  pub fn create(id: &FormulaId, config: EnvironmentConfig) -> Result<Self, BuildError> {
    let setup_err = |what: &str, e: std::io::Error| BuildError::EnvironmentSetupFailed(format!("{what}: {e}"));

    std::fs::create_dir_all(&config.scratch_root)
      .map_err(|e| setup_err(&format!("create {}", config.scratch_root.display()), e))?;

    let scratch = tempfile::Builder::new()
      .prefix(&format!("{}-{}-", id.name, id.version))
      .tempdir_in(&config.scratch_root)
      .map_err(|e| setup_err("create scratch directory", e))?;
    let root = dunce::canonicalize(scratch.path()).unwrap_or_else(|_| scratch.path().to_path_buf());

    let src_dir = root.join("src");
    let build_dir = root.join("build");
    let stage_dir = root.join("stage");
    let tmp_dir = root.join("tmp");
    for dir in [&src_dir, &build_dir, &stage_dir, &tmp_dir] {
      std::fs::create_dir_all(dir).map_err(|e| setup_err(&format!("create {}", dir.display()), e))?;
    }

    debug!(formula = %id, scratch = ?root, "created build environment");

    Ok(Self {
      id: id.clone(),
      scratch: Some(scratch),
      root,
      src_dir,
      build_dir,
      stage_dir,
      tmp_dir,
      prefix: config.prefix,
      committed: false,
      log_path: config.log_path,
      dep_prefixes: config.dep_prefixes,
      search_path: config.search_path,
      limits: config.limits,
      keep_scratch: config.keep_scratch,
      run_tests: config.run_tests,
      cancel: config.cancel,
    })
  }

  pub fn id(&self) -> &FormulaId {
    &self.id
  }

  pub fn scratch_dir(&self) -> &Path {
    &self.root
  }

  pub fn src_dir(&self) -> &Path {
    &self.src_dir
  }

  pub fn build_dir(&self) -> &Path {
    &self.build_dir
  }

  pub fn tmp_dir(&self) -> &Path {
    &self.tmp_dir
  }

  pub fn stage_dir(&self) -> &Path {
    &self.stage_dir
  }

  /// The final install prefix.
  pub fn prefix(&self) -> &Path {
    &self.prefix
  }

  /// Where steps install to: the staged prefix until commit, the final prefix after.
  pub fn active_prefix(&self) -> &Path {
    if self.committed { &self.prefix } else { &self.stage_dir }
  }

  pub fn log_path(&self) -> &Path {
    &self.log_path
  }

  pub fn dep_prefixes(&self) -> &BTreeMap<String, PathBuf> {
    &self.dep_prefixes
  }

  pub fn limits(&self) -> &ResourceLimits {
    &self.limits
  }

  pub fn run_tests(&self) -> bool {
    self.run_tests
  }

  pub fn cancellation(&self) -> &Cancellation {
    &self.cancel
  }

  pub(crate) fn mark_committed(&mut self) {
    self.committed = true;
  }

  /// The variables a step process starts from, before its own `env` entries.
  pub fn variables(&self) -> BTreeMap<String, String> {
    let mut vars = BTreeMap::new();

    let mut path: Vec<String> = self
      .dep_prefixes
      .values()
      .map(|p| p.join("bin").to_string_lossy().into_owned())
      .collect();
    path.extend(self.search_path.iter().map(|p| p.to_string_lossy().into_owned()));
    let path = if path.is_empty() {
      PATH_NOT_SET.to_string()
    } else {
      path.join(PATH_SEPARATOR)
    };

    let tmp = self.tmp_dir.to_string_lossy().into_owned();
    vars.insert("PATH".to_string(), path);
    vars.insert("HOME".to_string(), HOMELESS.to_string());
    for key in ["TMPDIR", "TMP", "TEMP", "TEMPDIR"] {
      vars.insert(key.to_string(), tmp.clone());
    }
    vars.insert("LANG".to_string(), "C".to_string());
    vars.insert("LC_ALL".to_string(), "C".to_string());
    vars.insert("SOURCE_DATE_EPOCH".to_string(), SOURCE_DATE_EPOCH.to_string());
    vars.insert("prefix".to_string(), self.active_prefix().to_string_lossy().into_owned());
    vars.insert("src".to_string(), self.src_dir.to_string_lossy().into_owned());
    vars.insert("build".to_string(), self.build_dir.to_string_lossy().into_owned());

    for (name, prefix) in &self.dep_prefixes {
      vars.insert(dep_prefix_var(name), prefix.to_string_lossy().into_owned());
    }

    vars
  }

  /// Substitute placeholders in everything a step will touch.
  pub fn materialize(&self, step: &ResolvedStep) -> Result<ResolvedStep, PlaceholderError> {
    let dirs = DirValues::new(self);
    let sub = |s: &String| placeholder::substitute(s, &dirs);

    let action = match &step.action {
      ResolvedAction::Exec { bin, args, env, cwd } => ResolvedAction::Exec {
        bin: sub(bin)?,
        args: args.iter().map(sub).collect::<Result<_, _>>()?,
        env: env
          .iter()
          .map(|(k, v)| sub(v).map(|v| (k.clone(), v)))
          .collect::<Result<_, _>>()?,
        cwd: cwd.as_ref().map(sub).transpose()?,
      },
      ResolvedAction::Fetch { url, sha256 } => ResolvedAction::Fetch {
        url: sub(url)?,
        sha256: sha256.clone(),
      },
    };

    Ok(ResolvedStep {
      index: step.index,
      name: step.name.clone(),
      action,
      inputs: step.inputs.iter().map(sub).collect::<Result<_, _>>()?,
      outputs: step.outputs.iter().map(sub).collect::<Result<_, _>>()?,
      timeout: step.timeout,
    })
  }

  /// Resolve a declared path; relative paths are taken from the build directory.
  pub fn resolve_path(&self, path: &str) -> PathBuf {
    let path = Path::new(path);
    if path.is_absolute() {
      path.to_path_buf()
    } else {
      self.build_dir.join(path)
    }
  }

  /// Release the scratch directory now, or keep it on disk when retained.
  pub fn finish(mut self) -> Option<PathBuf> {
    let scratch = self.scratch.take()?;
    if self.keep_scratch {
      let kept = scratch.keep();
      info!(formula = %self.id, scratch = ?kept, "keeping scratch directory");
      Some(kept)
    } else {
      if let Err(e) = scratch.close() {
        debug!(formula = %self.id, error = %e, "failed to remove scratch directory");
      }
      None
    }
  }
}

impl Drop for Environment {
  fn drop(&mut self) {
    if self.keep_scratch
      && let Some(scratch) = self.scratch.take()
    {
      let _ = scratch.keep();
    }
  }
}

#[cfg(unix)]
const PATH_SEPARATOR: &str = ":";
#[cfg(windows)]
const PATH_SEPARATOR: &str = ";";

/// `gmp` -> `GMP_PREFIX`, `pkg-config` -> `PKG_CONFIG_PREFIX`.
pub fn dep_prefix_var(name: &str) -> String {
  let mut var: String = name
    .chars()
    .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
    .collect();
  var.push_str("_PREFIX");
  var
}

struct DirValues {
  prefix: String,
  src: String,
  build: String,
  deps: BTreeMap<String, String>,
}

impl DirValues {
  fn new(env: &Environment) -> Self {
    Self {
      prefix: env.active_prefix().to_string_lossy().into_owned(),
      src: env.src_dir.to_string_lossy().into_owned(),
      build: env.build_dir.to_string_lossy().into_owned(),
      deps: env
        .dep_prefixes
        .iter()
        .map(|(k, v)| (k.clone(), v.to_string_lossy().into_owned()))
        .collect(),
    }
  }
}

impl Resolver for DirValues {
  fn resolve_prefix(&self) -> &str {
    &self.prefix
  }

  fn resolve_src(&self) -> &str {
    &self.src
  }

  fn resolve_build(&self) -> &str {
    &self.build
  }

  fn resolve_dep(&self, name: &str) -> Result<&str, PlaceholderError> {
    self
      .deps
      .get(name)
      .map(String::as_str)
      .ok_or_else(|| PlaceholderError::UnresolvedDependency(name.to_string()))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::formula::{BuildStep, Formula, OptionSet};
  use tempfile::TempDir;

  fn config(root: &Path) -> EnvironmentConfig {
    let mut dep_prefixes = BTreeMap::new();
    dep_prefixes.insert("gmp".to_string(), root.join("store/gmp"));
    EnvironmentConfig {
      scratch_root: root.join("scratch"),
      prefix: root.join("store/gap"),
      log_path: root.join("logs/gap.log"),
      dep_prefixes,
      search_path: Vec::new(),
      limits: ResourceLimits::default(),
      keep_scratch: false,
      run_tests: true,
      cancel: Cancellation::new(),
    }
  }

  #[test]
  fn create_lays_out_scratch() {
    let temp = TempDir::new().unwrap();
    let env = Environment::create(&FormulaId::new("gap", "4.8.3"), config(temp.path())).unwrap();

    for dir in [env.src_dir(), env.build_dir(), env.stage_dir(), env.tmp_dir()] {
      assert!(dir.is_dir(), "{} should exist", dir.display());
      assert!(dir.starts_with(env.scratch_dir()));
    }
    assert_eq!(env.active_prefix(), env.stage_dir());
  }

  #[test]
  fn scratch_released_on_finish() {
    let temp = TempDir::new().unwrap();
    let env = Environment::create(&FormulaId::new("gap", "4.8.3"), config(temp.path())).unwrap();
    let scratch = env.scratch_dir().to_path_buf();
    assert!(env.finish().is_none());
    assert!(!scratch.exists());
  }

  #[test]
  fn scratch_kept_when_requested() {
    let temp = TempDir::new().unwrap();
    let mut cfg = config(temp.path());
    cfg.keep_scratch = true;
    let env = Environment::create(&FormulaId::new("gap", "4.8.3"), cfg).unwrap();
    let kept = env.finish().unwrap();
    assert!(kept.is_dir());
  }

  #[test]
  fn concurrent_environments_are_distinct() {
    let temp = TempDir::new().unwrap();
    let id = FormulaId::new("gap", "4.8.3");
    let a = Environment::create(&id, config(temp.path())).unwrap();
    let b = Environment::create(&id, config(temp.path())).unwrap();
    assert_ne!(a.scratch_dir(), b.scratch_dir());
  }

  #[test]
  fn variables_are_isolated() {
    let temp = TempDir::new().unwrap();
    let env = Environment::create(&FormulaId::new("gap", "4.8.3"), config(temp.path())).unwrap();
    let vars = env.variables();

    assert_eq!(vars["HOME"], HOMELESS);
    assert_eq!(vars["SOURCE_DATE_EPOCH"], SOURCE_DATE_EPOCH);
    assert_eq!(vars["TMPDIR"], env.tmp_dir().to_string_lossy());
    assert_eq!(vars["GMP_PREFIX"], temp.path().join("store/gmp").to_string_lossy());
    assert!(vars["PATH"].contains("gmp"));
    assert_eq!(vars["prefix"], env.stage_dir().to_string_lossy());
  }

  #[test]
  fn path_sentinel_without_search_path() {
    let temp = TempDir::new().unwrap();
    let mut cfg = config(temp.path());
    cfg.dep_prefixes.clear();
    let env = Environment::create(&FormulaId::new("gmp", "6.1.2"), cfg).unwrap();
    assert_eq!(env.variables()["PATH"], PATH_NOT_SET);
  }

  #[test]
  fn materialize_substitutes_placeholders() {
    let temp = TempDir::new().unwrap();
    let env = Environment::create(&FormulaId::new("gap", "4.8.3"), config(temp.path())).unwrap();

    let formula = Formula::new("gap", "4.8.3").step(
      BuildStep::exec("configure", "./configure", ["--prefix=$${prefix}", "--with-gmp=$${dep:gmp}"])
        .outputs(["$${prefix}/bin/gap"]),
    );
    let steps = formula.resolve_steps(&OptionSet::new());
    let step = env.materialize(&steps[0]).unwrap();

    let ResolvedAction::Exec { args, .. } = &step.action else {
      panic!("expected exec");
    };
    assert_eq!(args[0], format!("--prefix={}", env.stage_dir().display()));
    assert_eq!(args[1], format!("--with-gmp={}", temp.path().join("store/gmp").display()));
    assert_eq!(step.outputs[0], format!("{}/bin/gap", env.stage_dir().display()));
  }

  #[test]
  fn materialize_rejects_undeclared_dependency() {
    let temp = TempDir::new().unwrap();
    let env = Environment::create(&FormulaId::new("gap", "4.8.3"), config(temp.path())).unwrap();
    let formula = Formula::new("gap", "4.8.3").step(BuildStep::exec("configure", "./configure", ["$${dep:readline}"]));
    let steps = formula.resolve_steps(&OptionSet::new());
    assert_eq!(
      env.materialize(&steps[0]).unwrap_err(),
      PlaceholderError::UnresolvedDependency("readline".to_string())
    );
  }

  #[test]
  fn dep_prefix_var_names() {
    assert_eq!(dep_prefix_var("gmp"), "GMP_PREFIX");
    assert_eq!(dep_prefix_var("pkg-config"), "PKG_CONFIG_PREFIX");
  }
}

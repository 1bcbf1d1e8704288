//! Formula model.
//!
//! A [`Formula`] is pure data: metadata, dependency edges, options and an
//! ordered list of declared build steps. Everything here is side-effect free:
//! validation, option resolution and the expansion of option-dependent steps
//! into a concrete [`ResolvedStep`] sequence all happen before any build runs.

mod options;
mod registry;
mod steps;
mod types;

pub use options::{OptionOverrides, OptionSet};
pub use registry::FormulaRegistry;
pub use steps::{ResolvedAction, ResolvedStep};
pub use types::*;

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use thiserror::Error;

use crate::util::hash::{HashError, Hashable, ObjectHash};

/// Errors in a formula definition.
///
/// These are data problems in the recipe itself and abort before any build starts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormulaError {
  #[error("{formula}: dependency '{dependency}' is declared more than once")]
  DuplicateDependency { formula: FormulaId, dependency: String },

  #[error("{formula}: option '{option}' is declared more than once")]
  OptionCollision { formula: FormulaId, option: String },

  #[error("{formula}: step '{step}' references undeclared option '{option}'")]
  UndeclaredOption {
    formula: FormulaId,
    step: String,
    option: String,
  },

  #[error("{formula}: deprecated option '{alias}' points at undeclared option '{target}'")]
  InvalidDeprecatedOption {
    formula: FormulaId,
    alias: String,
    target: String,
  },

  #[error("{formula}: unknown option '{option}'")]
  UnknownOption { formula: FormulaId, option: String },

  #[error("formula '{0}' is defined more than once")]
  DuplicateFormula(String),

  #[error("{formula}: failed to hash recipe: {message}")]
  Hash { formula: FormulaId, message: String },
}

/// The parts of a formula that determine what gets built.
///
/// Descriptive metadata (description, homepage, caveats) is excluded so editing
/// it does not invalidate cached artifacts.
#[derive(Serialize)]
struct RecipeFingerprint<'a> {
  id: FormulaId,
  revision: u32,
  dependencies: &'a [Dependency],
  steps: &'a [BuildStep],
  test: &'a Option<SmokeTest>,
}

impl Hashable for RecipeFingerprint<'_> {}

impl Formula {
  /// Check the recipe for internal consistency.
  pub fn validate(&self) -> Result<(), FormulaError> {
    let id = self.id();

    let mut dep_names = BTreeSet::new();
    for dep in &self.dependencies {
      if !dep_names.insert(dep.name.as_str()) {
        return Err(FormulaError::DuplicateDependency {
          formula: id,
          dependency: dep.name.clone(),
        });
      }
    }

    let declared = self.declared_options_checked()?;

    for (alias, target) in &self.deprecated_options {
      if declared.contains_key(alias.as_str()) {
        return Err(FormulaError::OptionCollision {
          formula: id,
          option: alias.clone(),
        });
      }
      if !declared.contains_key(target.as_str()) {
        return Err(FormulaError::InvalidDeprecatedOption {
          formula: id,
          alias: alias.clone(),
          target: target.clone(),
        });
      }
    }

    let test_step = self.test.as_ref().map(|t| &t.run);
    for step in self.steps.iter().chain(test_step) {
      for option in step.referenced_options() {
        if !declared.contains_key(option) {
          return Err(FormulaError::UndeclaredOption {
            formula: id,
            step: step.name.clone(),
            option: option.to_string(),
          });
        }
      }
    }

    for caveat in &self.caveats {
      if let Some(cond) = &caveat.when
        && !declared.contains_key(cond.option.as_str())
      {
        return Err(FormulaError::UndeclaredOption {
          formula: id,
          step: "caveats".to_string(),
          option: cond.option.clone(),
        });
      }
    }

    Ok(())
  }

  /// Every option this formula understands with its default value: explicit
  /// declarations plus one implicit option per optional/recommended dependency.
  pub fn declared_options(&self) -> BTreeMap<&str, bool> {
    let mut declared = BTreeMap::new();
    for decl in &self.options {
      declared.insert(decl.name.as_str(), decl.default);
    }
    for dep in &self.dependencies {
      if let Some(default) = dep.kind.implicit_option_default() {
        declared.entry(dep.name.as_str()).or_insert(default);
      }
    }
    declared
  }

  fn declared_options_checked(&self) -> Result<BTreeMap<&str, bool>, FormulaError> {
    let mut declared = BTreeMap::new();
    let implicit = self
      .dependencies
      .iter()
      .filter_map(|d| d.kind.implicit_option_default().map(|default| (d.name.as_str(), default)));
    let explicit = self.options.iter().map(|d| (d.name.as_str(), d.default));

    for (name, default) in explicit.chain(implicit) {
      if declared.insert(name, default).is_some() {
        return Err(FormulaError::OptionCollision {
          formula: self.id(),
          option: name.to_string(),
        });
      }
    }
    Ok(declared)
  }

  /// Map a possibly deprecated option name to the name it is stored under.
  pub fn canonical_option<'a>(&'a self, name: &'a str) -> Option<&'a str> {
    let name = self.deprecated_options.get(name).map(String::as_str).unwrap_or(name);
    self.declared_options().contains_key(name).then_some(name)
  }

  /// Defaults overlaid with `requested` values.
  ///
  /// Deprecated names are normalized; names the formula does not declare are rejected.
  pub fn effective_options(&self, requested: &BTreeMap<String, bool>) -> Result<OptionSet, FormulaError> {
    let mut set: OptionSet = self
      .declared_options()
      .into_iter()
      .map(|(name, default)| (name.to_string(), default))
      .collect();

    for (name, value) in requested {
      let Some(canonical) = self.canonical_option(name) else {
        return Err(FormulaError::UnknownOption {
          formula: self.id(),
          option: name.clone(),
        });
      };
      set.set(canonical, *value);
    }

    Ok(set)
  }

  /// Hash of everything that affects the build output.
  pub fn recipe_hash(&self) -> Result<ObjectHash, FormulaError> {
    let fingerprint = RecipeFingerprint {
      id: self.id(),
      revision: self.revision,
      dependencies: &self.dependencies,
      steps: &self.steps,
      test: &self.test,
    };
    fingerprint.compute_hash().map_err(|e: HashError| FormulaError::Hash {
      formula: self.id(),
      message: e.to_string(),
    })
  }

  /// Caveat texts that apply to a build with `options`.
  pub fn caveats_for(&self, options: &OptionSet) -> Vec<String> {
    self
      .caveats
      .iter()
      .filter(|c| c.when.as_ref().is_none_or(|cond| cond.holds(options)))
      .map(|c| c.text.clone())
      .collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn gap() -> Formula {
    Formula::new("gap", "4.8.3")
      .depends_on(Dependency::runtime("gmp"))
      .depends_on(Dependency::recommended("readline"))
      .option(OptionDecl::new("InstPackages", false))
      .step(BuildStep::exec(
        "configure",
        "./configure",
        [
          StepArg::from("--with-gmp=system"),
          StepArg::Conditional {
            option: "readline".to_string(),
            on: vec!["--with-readline".to_string()],
            off: vec!["--without-readline".to_string()],
          },
        ],
      ))
      .step(BuildStep::exec("make", "make", Vec::<&str>::new()))
      .step(BuildStep::exec("packages", "./InstPackages.sh", Vec::<&str>::new()).when(Condition::with("InstPackages")))
      .caveat(Some(Condition::without("InstPackages")), "packages need manual builds")
      .caveat(Some(Condition::with("InstPackages")), "packages were built automatically")
  }

  #[test]
  fn valid_formula_passes() {
    assert_eq!(gap().validate(), Ok(()));
  }

  #[test]
  fn duplicate_dependency_rejected() {
    let f = gap().depends_on(Dependency::build("gmp"));
    assert!(matches!(
      f.validate(),
      Err(FormulaError::DuplicateDependency { dependency, .. }) if dependency == "gmp"
    ));
  }

  #[test]
  fn duplicate_option_rejected() {
    let f = gap().option(OptionDecl::new("InstPackages", true));
    assert!(matches!(f.validate(), Err(FormulaError::OptionCollision { option, .. }) if option == "InstPackages"));
  }

  #[test]
  fn option_colliding_with_dependency_option_rejected() {
    let f = gap().option(OptionDecl::new("readline", false));
    assert!(matches!(f.validate(), Err(FormulaError::OptionCollision { option, .. }) if option == "readline"));
  }

  #[test]
  fn step_referencing_undeclared_option_rejected() {
    let f = gap().step(BuildStep::exec("check", "make", ["check"]).when(Condition::with("test")));
    assert!(matches!(
      f.validate(),
      Err(FormulaError::UndeclaredOption { step, option, .. }) if step == "check" && option == "test"
    ));
  }

  #[test]
  fn conditional_arg_referencing_undeclared_option_rejected() {
    let f = Formula::new("r", "3.4.0").step(BuildStep::exec(
      "configure",
      "./configure",
      [StepArg::Conditional {
        option: "tcltk".to_string(),
        on: vec![],
        off: vec!["--without-tcltk".to_string()],
      }],
    ));
    assert!(matches!(f.validate(), Err(FormulaError::UndeclaredOption { option, .. }) if option == "tcltk"));
  }

  #[test]
  fn deprecated_option_must_target_declared_option() {
    let f = gap().deprecated_option("check", "test");
    assert!(matches!(f.validate(), Err(FormulaError::InvalidDeprecatedOption { .. })));

    let f = Formula::new("r", "3.4.0")
      .option(OptionDecl::new("test", true))
      .deprecated_option("check", "test");
    assert_eq!(f.validate(), Ok(()));
  }

  #[test]
  fn effective_options_apply_defaults_and_requests() {
    let f = gap();
    let mut requested = BTreeMap::new();
    requested.insert("readline".to_string(), false);

    let options = f.effective_options(&requested).unwrap();
    assert_eq!(options.get("readline"), Some(false));
    assert_eq!(options.get("InstPackages"), Some(false));
    assert_eq!(options.len(), 2);
  }

  #[test]
  fn effective_options_normalize_deprecated_names() {
    let f = Formula::new("r", "3.4.0")
      .option(OptionDecl::new("test", true))
      .deprecated_option("check", "test");
    let mut requested = BTreeMap::new();
    requested.insert("check".to_string(), false);

    let options = f.effective_options(&requested).unwrap();
    assert_eq!(options.get("test"), Some(false));
    assert_eq!(options.get("check"), None);
  }

  #[test]
  fn effective_options_reject_unknown_names() {
    let mut requested = BTreeMap::new();
    requested.insert("x11".to_string(), true);
    assert!(matches!(
      gap().effective_options(&requested),
      Err(FormulaError::UnknownOption { option, .. }) if option == "x11"
    ));
  }

  #[test]
  fn recipe_hash_ignores_caveats_but_not_steps() {
    let base = gap().recipe_hash().unwrap();

    let mut reworded = gap();
    reworded.caveats.clear();
    assert_eq!(reworded.recipe_hash().unwrap(), base);

    let changed = gap().step(BuildStep::exec("install", "make", ["install"]));
    assert_ne!(changed.recipe_hash().unwrap(), base);

    let mut revised = gap();
    revised.revision = 1;
    assert_ne!(revised.recipe_hash().unwrap(), base);
  }

  #[test]
  fn caveats_follow_options() {
    let f = gap();
    let without = OptionSet::new().with("InstPackages", false);
    let with = OptionSet::new().with("InstPackages", true);
    assert_eq!(f.caveats_for(&without), vec!["packages need manual builds".to_string()]);
    assert_eq!(f.caveats_for(&with), vec!["packages were built automatically".to_string()]);
  }
}

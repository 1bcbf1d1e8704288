use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::util::hash::ObjectHash;

/// Fully resolved option values for one formula build.
///
/// Backed by a `BTreeMap` so iteration order, serialization and the derived
/// hash are stable across runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OptionSet(BTreeMap<String, bool>);

impl OptionSet {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn set(&mut self, name: &str, value: bool) {
    self.0.insert(name.to_string(), value);
  }

  pub fn with(mut self, name: &str, value: bool) -> Self {
    self.set(name, value);
    self
  }

  pub fn get(&self, name: &str) -> Option<bool> {
    self.0.get(name).copied()
  }

  /// Unknown options read as disabled.
  pub fn is_enabled(&self, name: &str) -> bool {
    self.get(name).unwrap_or(false)
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, bool)> {
    self.0.iter().map(|(k, v)| (k.as_str(), *v))
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  /// Stable hash of the option values, used in artifact keys.
  pub fn hash(&self) -> ObjectHash {
    let mut canonical = String::new();
    for (name, value) in &self.0 {
      canonical.push_str(name);
      canonical.push('=');
      canonical.push(if *value { '1' } else { '0' });
      canonical.push('\n');
    }
    ObjectHash::from_bytes(canonical.as_bytes())
  }
}

impl FromIterator<(String, bool)> for OptionSet {
  fn from_iter<I: IntoIterator<Item = (String, bool)>>(iter: I) -> Self {
    Self(iter.into_iter().collect())
  }
}

impl std::fmt::Display for OptionSet {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let parts: Vec<String> = self
      .0
      .iter()
      .map(|(name, on)| format!("{}{}", if *on { "with-" } else { "without-" }, name))
      .collect();
    write!(f, "[{}]", parts.join(", "))
  }
}

/// Caller-supplied option requests for a resolve.
///
/// Per-formula values act as one requester; dependents that request options
/// on their dependencies are others. `enable` globally pulls optional
/// dependencies into the plan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionOverrides {
  #[serde(default)]
  pub formulas: BTreeMap<String, BTreeMap<String, bool>>,
  #[serde(default)]
  pub enable: BTreeSet<String>,
}

impl OptionOverrides {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn set(mut self, formula: &str, option: &str, value: bool) -> Self {
    self
      .formulas
      .entry(formula.to_string())
      .or_default()
      .insert(option.to_string(), value);
    self
  }

  pub fn enable(mut self, dependency: &str) -> Self {
    self.enable.insert(dependency.to_string());
    self
  }

  pub fn for_formula(&self, name: &str) -> Option<&BTreeMap<String, bool>> {
    self.formulas.get(name)
  }

  pub fn is_globally_enabled(&self, name: &str) -> bool {
    self.enable.contains(name)
  }
}

use std::collections::BTreeMap;

use super::FormulaError;
use super::types::Formula;

/// The set of known formulas, keyed by name.
///
/// One formula per name; dependency edges and requests refer to formulas by name.
#[derive(Debug, Clone, Default)]
pub struct FormulaRegistry {
  formulas: BTreeMap<String, Formula>,
}

impl FormulaRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Build a registry, rejecting duplicate names.
  pub fn from_formulas(formulas: impl IntoIterator<Item = Formula>) -> Result<Self, FormulaError> {
    let mut registry = Self::new();
    for formula in formulas {
      registry.insert(formula)?;
    }
    Ok(registry)
  }

  pub fn insert(&mut self, formula: Formula) -> Result<(), FormulaError> {
    if self.formulas.contains_key(&formula.name) {
      return Err(FormulaError::DuplicateFormula(formula.name));
    }
    self.formulas.insert(formula.name.clone(), formula);
    Ok(())
  }

  pub fn get(&self, name: &str) -> Option<&Formula> {
    self.formulas.get(name)
  }

  pub fn contains(&self, name: &str) -> bool {
    self.formulas.contains_key(name)
  }

  pub fn len(&self) -> usize {
    self.formulas.len()
  }

  pub fn is_empty(&self) -> bool {
    self.formulas.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = &Formula> {
    self.formulas.values()
  }
}

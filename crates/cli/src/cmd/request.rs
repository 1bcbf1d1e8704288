//! Arguments shared by `plan` and `build`: where formulas come from and which
//! ones to resolve with what options.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::Args;

use cellar_lib::formula::{Formula, FormulaRegistry, OptionOverrides};

#[derive(Debug, Args)]
pub struct RequestArgs {
  /// JSON file holding an array of formulas
  #[arg(short, long, default_value = "formulas.json")]
  pub formulas: PathBuf,

  /// Formulas to build
  #[arg(required = true)]
  pub names: Vec<String>,

  /// Set an option for one formula, as FORMULA:OPTION=true|false
  #[arg(short = 'o', long = "option", value_name = "FORMULA:OPTION=BOOL")]
  pub options: Vec<String>,

  /// Enable an optional dependency everywhere it is declared
  #[arg(long, value_name = "DEPENDENCY")]
  pub enable: Vec<String>,
}

impl RequestArgs {
  pub fn registry(&self) -> Result<FormulaRegistry> {
    load_registry(&self.formulas)
  }

  pub fn overrides(&self) -> Result<OptionOverrides> {
    let mut overrides = OptionOverrides::new();
    for raw in &self.options {
      let (formula, option, value) = parse_option(raw)?;
      overrides = overrides.set(formula, option, value);
    }
    for dep in &self.enable {
      overrides = overrides.enable(dep);
    }
    Ok(overrides)
  }
}

pub fn load_registry(path: &Path) -> Result<FormulaRegistry> {
  let contents = fs::read_to_string(path).with_context(|| format!("Failed to read formulas: {}", path.display()))?;
  let formulas: Vec<Formula> =
    serde_json::from_str(&contents).with_context(|| format!("Failed to parse formulas: {}", path.display()))?;
  FormulaRegistry::from_formulas(formulas).with_context(|| format!("Invalid formulas in {}", path.display()))
}

/// Parse `gap:readline=false`. A bare `gap:readline` means `true`.
fn parse_option(raw: &str) -> Result<(&str, &str, bool)> {
  let Some((formula, rest)) = raw.split_once(':') else {
    bail!("invalid option '{raw}': expected FORMULA:OPTION=BOOL");
  };
  let (option, value) = match rest.split_once('=') {
    Some((option, value)) => (option, value),
    None => (rest, "true"),
  };
  let value = match value {
    "true" | "on" | "yes" | "1" => true,
    "false" | "off" | "no" | "0" => false,
    other => bail!("invalid option value '{other}' in '{raw}'"),
  };
  if formula.is_empty() || option.is_empty() {
    bail!("invalid option '{raw}': expected FORMULA:OPTION=BOOL");
  }
  Ok((formula, option, value))
}

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::options::OptionSet;

/// Identifies a formula: a package name plus the version the recipe builds.
///
/// Ordering is lexicographic by name, then version. The resolver relies on
/// this ordering to break ties deterministically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FormulaId {
  pub name: String,
  pub version: String,
}

impl FormulaId {
  pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      version: version.into(),
    }
  }
}

impl fmt::Display for FormulaId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}@{}", self.name, self.version)
  }
}

/// How a dependency participates in the build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DepKind {
  /// Needed only while building.
  Build,
  /// Needed to build and at run time.
  Runtime,
  /// Off unless enabled by option, override, or already part of the plan.
  Optional,
  /// On unless disabled by option.
  Recommended,
}

impl DepKind {
  /// Build and runtime edges are always part of the plan.
  pub fn is_required(self) -> bool {
    matches!(self, DepKind::Build | DepKind::Runtime)
  }

  /// Whether the dependency declares an implicit option, and its default.
  pub fn implicit_option_default(self) -> Option<bool> {
    match self {
      DepKind::Optional => Some(false),
      DepKind::Recommended => Some(true),
      DepKind::Build | DepKind::Runtime => None,
    }
  }
}

impl fmt::Display for DepKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      DepKind::Build => "build",
      DepKind::Runtime => "runtime",
      DepKind::Optional => "optional",
      DepKind::Recommended => "recommended",
    };
    f.write_str(s)
  }
}

fn default_dep_kind() -> DepKind {
  DepKind::Runtime
}

/// A declared dependency of a formula.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
  /// Name of the formula (or unmanaged requirement) depended upon.
  pub name: String,

  #[serde(default = "default_dep_kind")]
  pub kind: DepKind,

  /// Unmanaged requirement (a system compiler, X11): recorded in the plan, never built.
  #[serde(default, skip_serializing_if = "std::ops::Not::not")]
  pub external: bool,

  /// Options this formula requires the dependency to be built with.
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub options: BTreeMap<String, bool>,
}

impl Dependency {
  fn with_kind(name: &str, kind: DepKind) -> Self {
    Self {
      name: name.to_string(),
      kind,
      external: false,
      options: BTreeMap::new(),
    }
  }

  pub fn build(name: &str) -> Self {
    Self::with_kind(name, DepKind::Build)
  }

  pub fn runtime(name: &str) -> Self {
    Self::with_kind(name, DepKind::Runtime)
  }

  pub fn optional(name: &str) -> Self {
    Self::with_kind(name, DepKind::Optional)
  }

  pub fn recommended(name: &str) -> Self {
    Self::with_kind(name, DepKind::Recommended)
  }

  pub fn external(name: &str, kind: DepKind) -> Self {
    Self {
      external: true,
      ..Self::with_kind(name, kind)
    }
  }

  /// Require the dependency to be built with `option` set to `value`.
  pub fn with_option(mut self, option: &str, value: bool) -> Self {
    self.options.insert(option.to_string(), value);
    self
  }
}

/// A user-visible boolean build option.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionDecl {
  pub name: String,
  #[serde(default)]
  pub default: bool,
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub description: String,
}

impl OptionDecl {
  pub fn new(name: &str, default: bool) -> Self {
    Self {
      name: name.to_string(),
      default,
      description: String::new(),
    }
  }
}

fn enabled_by_default() -> bool {
  true
}

/// Guard on an option value: `with` (`enabled: true`) or `without`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
  pub option: String,
  #[serde(default = "enabled_by_default")]
  pub enabled: bool,
}

impl Condition {
  pub fn with(option: &str) -> Self {
    Self {
      option: option.to_string(),
      enabled: true,
    }
  }

  pub fn without(option: &str) -> Self {
    Self {
      option: option.to_string(),
      enabled: false,
    }
  }

  pub fn holds(&self, options: &OptionSet) -> bool {
    options.is_enabled(&self.option) == self.enabled
  }
}

/// One argument of an exec action.
///
/// Plain strings pass through; conditional arguments expand to `on` or `off`
/// depending on an option, e.g. `--with-readline` / `--without-readline`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepArg {
  Plain(String),
  Conditional {
    option: String,
    #[serde(default)]
    on: Vec<String>,
    #[serde(default)]
    off: Vec<String>,
  },
}

impl From<&str> for StepArg {
  fn from(s: &str) -> Self {
    StepArg::Plain(s.to_string())
  }
}

impl From<String> for StepArg {
  fn from(s: String) -> Self {
    StepArg::Plain(s)
  }
}

/// What a build step does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepAction {
  /// Run a program with arguments. No shell is involved unless `bin` is one.
  Exec {
    bin: String,
    #[serde(default)]
    args: Vec<StepArg>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cwd: Option<String>,
  },
  /// Download a file into the source directory, verifying its SHA-256.
  Fetch { url: String, sha256: String },
}

/// A declared build action with the files it reads and writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildStep {
  pub name: String,
  pub action: StepAction,

  /// Paths that must exist before the step runs.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub inputs: Vec<String>,

  /// Paths the step must produce.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub outputs: Vec<String>,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub when: Option<Condition>,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub timeout_secs: Option<u64>,
}

impl BuildStep {
  pub fn exec<A: Into<StepArg>>(name: &str, bin: &str, args: impl IntoIterator<Item = A>) -> Self {
    Self {
      name: name.to_string(),
      action: StepAction::Exec {
        bin: bin.to_string(),
        args: args.into_iter().map(Into::into).collect(),
        env: BTreeMap::new(),
        cwd: None,
      },
      inputs: Vec::new(),
      outputs: Vec::new(),
      when: None,
      timeout_secs: None,
    }
  }

  pub fn fetch(name: &str, url: &str, sha256: &str) -> Self {
    Self {
      name: name.to_string(),
      action: StepAction::Fetch {
        url: url.to_string(),
        sha256: sha256.to_string(),
      },
      inputs: Vec::new(),
      outputs: Vec::new(),
      when: None,
      timeout_secs: None,
    }
  }

  pub fn when(mut self, condition: Condition) -> Self {
    self.when = Some(condition);
    self
  }

  pub fn timeout_secs(mut self, secs: u64) -> Self {
    self.timeout_secs = Some(secs);
    self
  }

  pub fn inputs<S: Into<String>>(mut self, paths: impl IntoIterator<Item = S>) -> Self {
    self.inputs = paths.into_iter().map(Into::into).collect();
    self
  }

  pub fn outputs<S: Into<String>>(mut self, paths: impl IntoIterator<Item = S>) -> Self {
    self.outputs = paths.into_iter().map(Into::into).collect();
    self
  }

  /// Every option name this step reads.
  pub fn referenced_options(&self) -> Vec<&str> {
    let mut names = Vec::new();
    if let Some(cond) = &self.when {
      names.push(cond.option.as_str());
    }
    if let StepAction::Exec { args, .. } = &self.action {
      for arg in args {
        if let StepArg::Conditional { option, .. } = arg {
          names.push(option.as_str());
        }
      }
    }
    names
  }
}

/// Opaque post-install notice shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caveat {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub when: Option<Condition>,
  pub text: String,
}

/// Smoke test run against the installed prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmokeTest {
  pub run: BuildStep,
  /// Exact expected stdout; `None` checks the exit status only.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub expected_output: Option<String>,
}

/// A buildable package recipe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Formula {
  pub name: String,
  pub version: String,

  /// Bumped when the recipe changes without a version change.
  #[serde(default)]
  pub revision: u32,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub desc: Option<String>,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub homepage: Option<String>,

  #[serde(default)]
  pub dependencies: Vec<Dependency>,

  #[serde(default)]
  pub options: Vec<OptionDecl>,

  /// Old option name -> current option name.
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub deprecated_options: BTreeMap<String, String>,

  #[serde(default)]
  pub steps: Vec<BuildStep>,

  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub caveats: Vec<Caveat>,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub test: Option<SmokeTest>,
}

impl Formula {
  pub fn new(name: &str, version: &str) -> Self {
    Self {
      name: name.to_string(),
      version: version.to_string(),
      revision: 0,
      desc: None,
      homepage: None,
      dependencies: Vec::new(),
      options: Vec::new(),
      deprecated_options: BTreeMap::new(),
      steps: Vec::new(),
      caveats: Vec::new(),
      test: None,
    }
  }

  pub fn id(&self) -> FormulaId {
    FormulaId::new(&self.name, &self.version)
  }

  pub fn depends_on(mut self, dep: Dependency) -> Self {
    self.dependencies.push(dep);
    self
  }

  pub fn option(mut self, decl: OptionDecl) -> Self {
    self.options.push(decl);
    self
  }

  pub fn deprecated_option(mut self, old: &str, new: &str) -> Self {
    self.deprecated_options.insert(old.to_string(), new.to_string());
    self
  }

  pub fn step(mut self, step: BuildStep) -> Self {
    self.steps.push(step);
    self
  }

  pub fn caveat(mut self, when: Option<Condition>, text: &str) -> Self {
    self.caveats.push(Caveat {
      when,
      text: text.to_string(),
    });
    self
  }

  pub fn smoke_test(mut self, run: BuildStep, expected_output: Option<&str>) -> Self {
    self.test = Some(SmokeTest {
      run,
      expected_output: expected_output.map(str::to_string),
    });
    self
  }

  pub fn dependency(&self, name: &str) -> Option<&Dependency> {
    self.dependencies.iter().find(|d| d.name == name)
  }
}

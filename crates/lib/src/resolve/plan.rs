use serde::{Deserialize, Serialize};

use crate::formula::{DepKind, FormulaId, OptionSet};
use crate::util::hash::ObjectHash;

/// An included dependency edge of a plan node.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlanDependency {
  pub id: FormulaId,
  pub kind: DepKind,
}

/// One formula to build, with every option decision made.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanNode {
  pub id: FormulaId,
  pub options: OptionSet,
  pub options_hash: ObjectHash,
  /// Included dependencies, sorted by id. Every one precedes this node in the plan.
  pub dependencies: Vec<PlanDependency>,
  /// Whether the caller asked for this formula directly.
  pub requested: bool,
}

/// An unmanaged requirement: recorded, never built.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExternalRequirement {
  pub required_by: FormulaId,
  pub name: String,
  pub kind: DepKind,
}

/// A topologically ordered build sequence for a set of requested formulas.
///
/// Produced only by [`super::resolve`]; immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildPlan {
  nodes: Vec<PlanNode>,
  roots: Vec<FormulaId>,
  external: Vec<ExternalRequirement>,
}

impl BuildPlan {
  pub(crate) fn new(nodes: Vec<PlanNode>, roots: Vec<FormulaId>, external: Vec<ExternalRequirement>) -> Self {
    Self { nodes, roots, external }
  }

  /// Nodes in build order: dependencies before dependents.
  pub fn nodes(&self) -> &[PlanNode] {
    &self.nodes
  }

  /// Requested formulas, sorted.
  pub fn roots(&self) -> &[FormulaId] {
    &self.roots
  }

  pub fn external(&self) -> &[ExternalRequirement] {
    &self.external
  }

  pub fn len(&self) -> usize {
    self.nodes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.nodes.is_empty()
  }

  pub fn ids(&self) -> impl Iterator<Item = &FormulaId> {
    self.nodes.iter().map(|n| &n.id)
  }

  pub fn position(&self, id: &FormulaId) -> Option<usize> {
    self.nodes.iter().position(|n| &n.id == id)
  }

  pub fn node(&self, id: &FormulaId) -> Option<&PlanNode> {
    self.nodes.iter().find(|n| &n.id == id)
  }

  /// Canonical JSON form; identical inputs to the resolver give identical bytes.
  pub fn to_json(&self) -> Result<String, serde_json::Error> {
    serde_json::to_string(self)
  }
}

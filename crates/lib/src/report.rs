//! The aggregate outcome of one orchestration run.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::execute::BuildFailure;
use crate::formula::{FormulaId, OptionSet};
use crate::resolve::ExternalRequirement;
use crate::store::ConsistencyError;
use crate::util::hash::ContentHash;

/// Terminal status of one plan node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum NodeStatus {
  Built,
  /// Served from the store without running the executor.
  #[serde(rename = "skipped-cached")]
  Cached,
  Failed,
  /// Never attempted because a dependency did not succeed.
  SkippedDependencyFailed {
    /// The failed build the skip traces back to.
    root_cause: FormulaId,
  },
  Cancelled,
}

impl NodeStatus {
  pub fn is_success(&self) -> bool {
    matches!(self, NodeStatus::Built | NodeStatus::Cached)
  }

  pub fn label(&self) -> &'static str {
    match self {
      NodeStatus::Built => "built",
      NodeStatus::Cached => "cached",
      NodeStatus::Failed => "failed",
      NodeStatus::SkippedDependencyFailed { .. } => "skipped",
      NodeStatus::Cancelled => "cancelled",
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeReport {
  pub id: FormulaId,
  pub options: OptionSet,
  pub requested: bool,
  #[serde(flatten)]
  pub status: NodeStatus,
  pub duration: Duration,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub prefix: Option<PathBuf>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub content_hash: Option<ContentHash>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub log_path: Option<PathBuf>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub failure: Option<BuildFailure>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub inconsistency: Option<ConsistencyError>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub caveats: Vec<String>,
}

impl NodeReport {
  pub(crate) fn pending(id: FormulaId, options: OptionSet, requested: bool, caveats: Vec<String>) -> Self {
    Self {
      id,
      options,
      requested,
      status: NodeStatus::Cancelled,
      duration: Duration::ZERO,
      prefix: None,
      content_hash: None,
      log_path: None,
      failure: None,
      inconsistency: None,
      caveats,
    }
  }
}

/// Every plan node with exactly one terminal status, in plan order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestrationReport {
  pub nodes: Vec<NodeReport>,
  pub roots: Vec<FormulaId>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub external: Vec<ExternalRequirement>,
  pub duration: Duration,
}

impl OrchestrationReport {
  /// True only if every requested formula was built or served from cache.
  pub fn is_success(&self) -> bool {
    self
      .roots
      .iter()
      .all(|root| self.node(root).is_some_and(|n| n.status.is_success()))
  }

  pub fn node(&self, id: &FormulaId) -> Option<&NodeReport> {
    self.nodes.iter().find(|n| &n.id == id)
  }

  /// Node by formula name.
  pub fn get(&self, name: &str) -> Option<&NodeReport> {
    self.nodes.iter().find(|n| n.id.name == name)
  }

  pub fn count(&self, label: &str) -> usize {
    self.nodes.iter().filter(|n| n.status.label() == label).count()
  }

  pub fn failures(&self) -> impl Iterator<Item = &NodeReport> {
    self.nodes.iter().filter(|n| n.status == NodeStatus::Failed)
  }
}

//! Dependency resolution.
//!
//! Turns a set of requested formula names into a [`BuildPlan`]: the requested
//! formulas plus their transitive dependencies, with options resolved and the
//! whole set ordered so every dependency precedes its dependents.
//!
//! Resolution is pure. It reads the registry and overrides and nothing else,
//! and ties in the topological order are broken by [`FormulaId`] so the same
//! inputs always give the same plan.

mod plan;

pub use plan::{BuildPlan, ExternalRequirement, PlanDependency, PlanNode};

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use thiserror::Error;
use tracing::{debug, info};

use crate::formula::{DepKind, Formula, FormulaError, FormulaId, FormulaRegistry, OptionOverrides, OptionSet};

/// Name used for the caller's overrides when reporting option conflicts.
pub const OVERRIDES_REQUESTER: &str = "overrides";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
  #[error("dependency cycle detected: {}", display_ids(.members))]
  CyclicDependency { members: Vec<FormulaId> },

  #[error(
    "conflicting values for option '{option}' of {formula}: {first} requests {first_value}, {second} requests {second_value}"
  )]
  ConflictingOptions {
    formula: FormulaId,
    option: String,
    first: String,
    first_value: bool,
    second: String,
    second_value: bool,
  },

  #[error("{formula} depends on unknown formula '{dependency}'")]
  UnknownDependency { formula: FormulaId, dependency: String },

  #[error("unknown formula '{0}'")]
  UnknownFormula(String),

  #[error("{requester} sets unknown option '{option}' on {formula}")]
  UnknownOption {
    formula: FormulaId,
    option: String,
    requester: String,
  },

  #[error("options of {formula} do not settle: enabling a dependency changes the options that enabled it")]
  UnsettledOptions { formula: FormulaId },

  #[error("invalid formula: {0}")]
  InvalidFormula(#[from] FormulaError),
}

fn display_ids(ids: &[FormulaId]) -> String {
  ids.iter().map(ToString::to_string).collect::<Vec<_>>().join(" -> ")
}

/// One requester's option demands on a formula.
struct OptionRequest<'a> {
  requester: String,
  values: &'a BTreeMap<String, bool>,
}

/// Resolve `requested` formulas into a build plan.
pub fn resolve<S: AsRef<str>>(
  registry: &FormulaRegistry,
  requested: &[S],
  overrides: &OptionOverrides,
) -> Result<BuildPlan, ResolveError> {
  let roots: BTreeSet<String> = requested.iter().map(|s| s.as_ref().to_string()).collect();
  info!(requested = roots.len(), "resolving build plan");

  for name in roots.iter().chain(overrides.formulas.keys()) {
    if !registry.contains(name) {
      return Err(ResolveError::UnknownFormula(name.clone()));
    }
  }

  // Recompute the closure from the roots under each round's options. An option
  // turned off late drops its edge and anything only that edge pulled in.
  let mut options = compute_options(registry, &roots, &BTreeMap::new(), overrides)?;
  let mut earlier: Vec<BTreeMap<String, OptionSet>> = Vec::new();
  let (nodes, edges) = loop {
    let (nodes, edges) = closure(registry, &roots, &options, overrides)?;
    let next_options = compute_options(registry, &nodes, &edges, overrides)?;
    if next_options == options {
      break (nodes, edges);
    }
    if earlier.contains(&next_options) {
      return Err(unsettled(registry, &options, &next_options));
    }
    debug!(nodes = nodes.len(), "options changed, recomputing closure");
    earlier.push(std::mem::replace(&mut options, next_options));
  };

  let order = topological_order(registry, &nodes, &edges)?;

  let mut plan_nodes = Vec::with_capacity(order.len());
  for name in &order {
    let formula = lookup(registry, name)?;
    let node_options = options.get(name).cloned().unwrap_or_default();
    let mut dependencies: Vec<PlanDependency> = edges
      .get(name)
      .into_iter()
      .flatten()
      .map(|(dep, kind)| {
        lookup(registry, dep).map(|f| PlanDependency {
          id: f.id(),
          kind: *kind,
        })
      })
      .collect::<Result<_, _>>()?;
    dependencies.sort();

    plan_nodes.push(PlanNode {
      id: formula.id(),
      options_hash: node_options.hash(),
      options: node_options,
      dependencies,
      requested: roots.contains(name),
    });
  }

  let mut root_ids = Vec::new();
  for name in &roots {
    root_ids.push(lookup(registry, name)?.id());
  }
  root_ids.sort();

  let external = external_requirements(registry, &nodes, &options, overrides)?;

  info!(nodes = plan_nodes.len(), external = external.len(), "resolved build plan");
  Ok(BuildPlan::new(plan_nodes, root_ids, external))
}

fn lookup<'a>(registry: &'a FormulaRegistry, name: &str) -> Result<&'a Formula, ResolveError> {
  registry
    .get(name)
    .ok_or_else(|| ResolveError::UnknownFormula(name.to_string()))
}

/// Whether a dependency pulls its target into the plan on its own.
fn pulls_in(kind: DepKind, target: &str, dependent_options: Option<&OptionSet>, overrides: &OptionOverrides) -> bool {
  kind.is_required()
    || overrides.is_globally_enabled(target)
    || dependent_options.is_some_and(|o| o.is_enabled(target))
}

/// Managed edges keyed by dependent name: `dependent -> [(dependency, kind)]`.
type Edges = BTreeMap<String, Vec<(String, DepKind)>>;

/// Formulas reachable from `roots` under `options`, and every managed edge
/// between them. An optional edge whose target is in the plan for another
/// reason is kept.
fn closure(
  registry: &FormulaRegistry,
  roots: &BTreeSet<String>,
  options: &BTreeMap<String, OptionSet>,
  overrides: &OptionOverrides,
) -> Result<(BTreeSet<String>, Edges), ResolveError> {
  let mut nodes = BTreeSet::new();
  let mut queue: VecDeque<String> = roots.iter().cloned().collect();

  while let Some(name) = queue.pop_front() {
    if !nodes.insert(name.clone()) {
      continue;
    }
    let formula = lookup(registry, &name)?;
    formula.validate()?;

    for dep in formula.dependencies.iter().filter(|d| !d.external) {
      if !pulls_in(dep.kind, &dep.name, options.get(&name), overrides) {
        continue;
      }
      if !registry.contains(&dep.name) {
        return Err(ResolveError::UnknownDependency {
          formula: formula.id(),
          dependency: dep.name.clone(),
        });
      }
      if !nodes.contains(&dep.name) {
        queue.push_back(dep.name.clone());
      }
    }
  }

  let mut edges = Edges::new();
  for name in &nodes {
    let deps = lookup(registry, name)?
      .dependencies
      .iter()
      .filter(|d| !d.external && nodes.contains(&d.name))
      .map(|d| (d.name.clone(), d.kind))
      .collect();
    edges.insert(name.clone(), deps);
  }

  Ok((nodes, edges))
}

/// Names the first formula whose options keep flipping between rounds.
fn unsettled(
  registry: &FormulaRegistry,
  current: &BTreeMap<String, OptionSet>,
  next: &BTreeMap<String, OptionSet>,
) -> ResolveError {
  let name = next
    .iter()
    .find(|(name, opts)| current.get(*name) != Some(*opts))
    .or_else(|| next.iter().next())
    .map(|(name, _)| name.clone())
    .unwrap_or_default();
  match registry.get(&name) {
    Some(formula) => ResolveError::UnsettledOptions { formula: formula.id() },
    None => ResolveError::UnknownFormula(name),
  }
}

/// Resolve each node's options from overrides and the option requests carried
/// by included edges into it, rejecting disagreements between requesters.
fn compute_options(
  registry: &FormulaRegistry,
  nodes: &BTreeSet<String>,
  edges: &Edges,
  overrides: &OptionOverrides,
) -> Result<BTreeMap<String, OptionSet>, ResolveError> {
  let mut requests: HashMap<&str, Vec<OptionRequest<'_>>> = HashMap::new();

  for (dependent, deps) in edges {
    let dependent_formula = lookup(registry, dependent)?;
    for (dep_name, _) in deps {
      if let Some(dep) = dependent_formula.dependency(dep_name)
        && !dep.options.is_empty()
      {
        requests.entry(dep_name.as_str()).or_default().push(OptionRequest {
          requester: dependent_formula.id().to_string(),
          values: &dep.options,
        });
      }
    }
  }

  let mut resolved = BTreeMap::new();
  for name in nodes {
    let formula = lookup(registry, name)?;

    let mut all_requests: Vec<OptionRequest<'_>> = Vec::new();
    if let Some(values) = overrides.for_formula(name) {
      all_requests.push(OptionRequest {
        requester: OVERRIDES_REQUESTER.to_string(),
        values,
      });
    }
    if let Some(mut from_edges) = requests.remove(name.as_str()) {
      from_edges.sort_by(|a, b| a.requester.cmp(&b.requester));
      all_requests.extend(from_edges);
    }

    let merged = merge_requests(formula, &all_requests)?;
    resolved.insert(name.clone(), formula.effective_options(&merged)?);
  }

  Ok(resolved)
}

fn merge_requests(formula: &Formula, requests: &[OptionRequest<'_>]) -> Result<BTreeMap<String, bool>, ResolveError> {
  // canonical option name -> (requester, value)
  let mut merged: BTreeMap<String, (&str, bool)> = BTreeMap::new();

  for request in requests {
    for (option, value) in request.values {
      let Some(canonical) = formula.canonical_option(option) else {
        return Err(ResolveError::UnknownOption {
          formula: formula.id(),
          option: option.clone(),
          requester: request.requester.clone(),
        });
      };

      match merged.get(canonical) {
        Some((first, first_value)) if first_value != value => {
          return Err(ResolveError::ConflictingOptions {
            formula: formula.id(),
            option: canonical.to_string(),
            first: first.to_string(),
            first_value: *first_value,
            second: request.requester.clone(),
            second_value: *value,
          });
        }
        Some(_) => {}
        None => {
          merged.insert(canonical.to_string(), (request.requester.as_str(), *value));
        }
      }
    }
  }

  Ok(merged.into_iter().map(|(k, (_, v))| (k, v)).collect())
}

/// Kahn's algorithm with a sorted ready set, so ties resolve by formula id.
fn topological_order(
  registry: &FormulaRegistry,
  nodes: &BTreeSet<String>,
  edges: &Edges,
) -> Result<Vec<String>, ResolveError> {
  let mut graph: DiGraph<String, ()> = DiGraph::new();
  let mut index: HashMap<&str, NodeIndex> = HashMap::new();
  for name in nodes {
    index.insert(name.as_str(), graph.add_node(name.clone()));
  }
  for (dependent, deps) in edges {
    for (dep, _) in deps {
      if let (Some(&from), Some(&to)) = (index.get(dep.as_str()), index.get(dependent.as_str())) {
        graph.add_edge(from, to, ());
      }
    }
  }

  if let Some(members) = find_cycle(registry, &graph)? {
    return Err(ResolveError::CyclicDependency { members });
  }

  let ids: HashMap<NodeIndex, FormulaId> = graph
    .node_indices()
    .map(|idx| lookup(registry, &graph[idx]).map(|f| (idx, f.id())))
    .collect::<Result<_, _>>()?;

  let mut in_degree: HashMap<NodeIndex, usize> = graph
    .node_indices()
    .map(|idx| (idx, graph.neighbors_directed(idx, petgraph::Direction::Incoming).count()))
    .collect();

  let mut ready: BTreeSet<(FormulaId, NodeIndex)> = in_degree
    .iter()
    .filter(|(_, deg)| **deg == 0)
    .filter_map(|(idx, _)| ids.get(idx).map(|id| (id.clone(), *idx)))
    .collect();

  let mut order = Vec::with_capacity(nodes.len());
  while let Some((_, idx)) = ready.pop_first() {
    order.push(graph[idx].clone());
    for next in graph.neighbors_directed(idx, petgraph::Direction::Outgoing) {
      if let Some(deg) = in_degree.get_mut(&next) {
        *deg = deg.saturating_sub(1);
        if *deg == 0
          && let Some(id) = ids.get(&next)
        {
          ready.insert((id.clone(), next));
        }
      }
    }
  }

  Ok(order)
}

/// Members of the first cycle found, sorted; `None` when the graph is acyclic.
fn find_cycle(registry: &FormulaRegistry, graph: &DiGraph<String, ()>) -> Result<Option<Vec<FormulaId>>, ResolveError> {
  let mut cycles: Vec<Vec<FormulaId>> = Vec::new();

  for component in tarjan_scc(graph) {
    let is_cycle = match component.as_slice() {
      [single] => graph.contains_edge(*single, *single),
      members => members.len() > 1,
    };
    if !is_cycle {
      continue;
    }
    let mut members = component
      .iter()
      .map(|idx| lookup(registry, &graph[*idx]).map(Formula::id))
      .collect::<Result<Vec<_>, _>>()?;
    members.sort();
    cycles.push(members);
  }

  cycles.sort();
  Ok(cycles.into_iter().next())
}

fn external_requirements(
  registry: &FormulaRegistry,
  nodes: &BTreeSet<String>,
  options: &BTreeMap<String, OptionSet>,
  overrides: &OptionOverrides,
) -> Result<Vec<ExternalRequirement>, ResolveError> {
  let mut external = Vec::new();
  for name in nodes {
    let formula = lookup(registry, name)?;
    for dep in formula.dependencies.iter().filter(|d| d.external) {
      if pulls_in(dep.kind, &dep.name, options.get(name), overrides) {
        external.push(ExternalRequirement {
          required_by: formula.id(),
          name: dep.name.clone(),
          kind: dep.kind,
        });
      }
    }
  }
  external.sort();
  Ok(external)
}

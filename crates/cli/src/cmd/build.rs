//! Implementation of the `cellar build` command.
//!
//! Resolves the request, builds whatever the store does not already hold and
//! prints a per-formula report. Ctrl-C cancels the run; builds in progress are
//! interrupted and reported as cancelled.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use tracing::{info, warn};

use cellar_lib::config::OrchestratorConfig;
use cellar_lib::execute::CommandRunner;
use cellar_lib::orchestrate::{Cancellation, Orchestrator};
use cellar_lib::report::{NodeReport, NodeStatus, OrchestrationReport};
use cellar_lib::store::{ArtifactStore, LockMode, StoreLock};

use super::request::RequestArgs;
use crate::output::{
  OutputFormat, format_duration, format_options, print_error, print_info, print_json, print_skip, print_stat,
  print_success, print_warning, truncate_hash,
};

#[derive(Debug, Args)]
pub struct BuildArgs {
  #[command(flatten)]
  pub request: RequestArgs,

  /// Maximum number of formulas built at once
  #[arg(short, long)]
  pub jobs: Option<usize>,

  /// Fail a build whose installed files differ from an earlier build of the same recipe
  #[arg(long)]
  pub strict: bool,

  /// Keep each build's scratch directory for inspection
  #[arg(long)]
  pub keep_scratch: bool,

  /// Skip formula smoke tests
  #[arg(long)]
  pub no_test: bool,

  /// Timeout for steps that do not declare one, e.g. "10m"
  #[arg(long, value_name = "DURATION")]
  pub step_timeout: Option<humantime::Duration>,

  /// Bytes of step output kept in failure reports
  #[arg(long, value_name = "BYTES")]
  pub max_output: Option<usize>,

  /// Append the host PATH to the build environment's PATH
  #[arg(long)]
  pub host_path: bool,
}

impl BuildArgs {
  fn config(&self, store: Option<PathBuf>) -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    if let Some(store) = store {
      config.store_dir = store;
    }
    if let Some(jobs) = self.jobs {
      config.concurrency = jobs;
    }
    if let Some(timeout) = self.step_timeout {
      config.default_step_timeout = Some(timeout.into());
    }
    if let Some(max) = self.max_output {
      config.max_output_bytes = max;
    }
    if self.host_path
      && let Some(path) = std::env::var_os("PATH")
    {
      config.search_path.extend(std::env::split_paths(&path));
    }
    config.strict_consistency = self.strict;
    config.keep_scratch = self.keep_scratch;
    config.run_tests = !self.no_test;
    config
  }
}

/// Returns whether every requested formula ended up built or cached.
pub fn cmd_build(args: &BuildArgs, store: Option<PathBuf>, format: OutputFormat) -> Result<bool> {
  let registry = args.request.registry()?;
  let overrides = args.request.overrides()?;
  let config = args.config(store);

  let command = std::env::args().collect::<Vec<_>>().join(" ");
  let _lock = StoreLock::try_acquire(&config.store_dir, LockMode::Exclusive, &command)?;

  let store = ArtifactStore::open(&config.store_dir)
    .with_context(|| format!("Failed to open store: {}", config.store_dir.display()))?;
  let concurrency = config.concurrency;
  let orchestrator = Orchestrator::new(registry, store, CommandRunner, config);

  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let report = rt.block_on(async {
    let cancel = Cancellation::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
      if tokio::signal::ctrl_c().await.is_ok() {
        warn!("interrupted, cancelling builds");
        trigger.cancel();
      }
    });
    orchestrator
      .run_with_cancel(&args.request.names, &overrides, concurrency, &cancel)
      .await
  })?;

  info!(success = report.is_success(), "build finished");

  if format.is_json() {
    print_json(&report)?;
  } else {
    print_report(&report);
  }
  Ok(report.is_success())
}

fn print_report(report: &OrchestrationReport) {
  for node in &report.nodes {
    print_node(node);
  }

  let failures: Vec<&NodeReport> = report.failures().collect();
  if !failures.is_empty() {
    println!();
    for node in failures {
      print_failure(node);
    }
  }

  let caveats: Vec<&NodeReport> = report
    .nodes
    .iter()
    .filter(|n| n.status.is_success() && !n.caveats.is_empty())
    .collect();
  if !caveats.is_empty() {
    println!();
    print_info("Caveats:");
    for node in caveats {
      println!("  {}:", node.id);
      for caveat in &node.caveats {
        for line in caveat.lines() {
          println!("    {line}");
        }
      }
    }
  }

  if !report.external.is_empty() {
    println!();
    print_info("External requirements (not built):");
    for ext in &report.external {
      println!("  {} ({}, required by {})", ext.name, ext.kind, ext.required_by);
    }
  }

  println!();
  let summary = format!(
    "{} built, {} cached, {} failed, {} skipped, {} cancelled in {}",
    report.count("built"),
    report.count("cached"),
    report.count("failed"),
    report.count("skipped"),
    report.count("cancelled"),
    format_duration(report.duration)
  );
  if report.is_success() {
    print_success(&summary);
  } else {
    print_error(&summary);
  }
}

fn print_node(node: &NodeReport) {
  let mut label = node.id.to_string();
  let options = format_options(&node.options);
  if !options.is_empty() {
    label.push_str(&format!(" [{options}]"));
  }

  match &node.status {
    NodeStatus::Built => {
      let hash = node.content_hash.as_ref().map(|h| truncate_hash(&h.0)).unwrap_or("");
      print_success(&format!("{label} built in {} {hash}", format_duration(node.duration)));
    }
    NodeStatus::Cached => print_success(&format!("{label} cached")),
    NodeStatus::Failed => print_error(&format!("{label} failed")),
    NodeStatus::SkippedDependencyFailed { root_cause } => {
      print_skip(&format!("{label} skipped ({root_cause} failed)"))
    }
    NodeStatus::Cancelled => print_skip(&format!("{label} cancelled")),
  }

  if let Some(drift) = &node.inconsistency {
    print_warning(&drift.to_string());
  }
}

fn print_failure(node: &NodeReport) {
  print_error(&format!("{} failed", node.id));
  if let Some(failure) = &node.failure {
    print_stat("Error", &failure.error.to_string());
    if !failure.output.is_empty() {
      println!("  Output:");
      for line in failure.output.lines() {
        println!("    {line}");
      }
    }
  }
  if let Some(log) = &node.log_path {
    print_stat("Log", &log.display().to_string());
  }
}

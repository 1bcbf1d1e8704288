//! Implementation of the `cellar plan` command.
//!
//! Resolves the requested formulas and prints the build order without
//! touching the store.

use anyhow::{Context, Result};
use owo_colors::{OwoColorize, Stream};

use cellar_lib::resolve::{BuildPlan, resolve};

use super::request::RequestArgs;
use crate::output::{OutputFormat, format_options, print_info, symbols};

pub fn cmd_plan(args: &RequestArgs, format: OutputFormat) -> Result<()> {
  let registry = args.registry()?;
  let overrides = args.overrides()?;
  let plan = resolve(&registry, &args.names, &overrides).context("Failed to resolve formulas")?;

  if format.is_json() {
    println!("{}", plan.to_json().context("Failed to serialize plan")?);
    return Ok(());
  }

  print_plan(&plan);
  Ok(())
}

fn print_plan(plan: &BuildPlan) {
  print_info(&format!("Build order ({} formulas):", plan.len()));
  for (i, node) in plan.nodes().iter().enumerate() {
    let mut line = format!("{:>3}. {}", i + 1, node.id);
    let options = format_options(&node.options);
    if !options.is_empty() {
      line.push_str(&format!(" [{options}]"));
    }
    if node.requested {
      println!("{}", line.if_supports_color(Stream::Stdout, |s| s.bold()));
    } else {
      println!("{line}");
    }
    for dep in &node.dependencies {
      println!(
        "       {} {} ({})",
        symbols::ARROW,
        dep.id,
        dep.kind.if_supports_color(Stream::Stdout, |s| s.dimmed())
      );
    }
  }

  if !plan.external().is_empty() {
    println!();
    print_info("External requirements (not built):");
    for ext in plan.external() {
      println!("  {} {} ({}, required by {})", symbols::INFO, ext.name, ext.kind, ext.required_by);
    }
  }
}

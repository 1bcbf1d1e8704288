mod cmd;
mod output;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use cmd::{BuildArgs, RequestArgs, cmd_build, cmd_plan, cmd_status};
use output::{OutputFormat, print_error};

/// cellar - build formulas and their dependencies in isolated environments
#[derive(Parser)]
#[command(name = "cellar")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Enable debug logging
  #[arg(short, long, global = true)]
  verbose: bool,

  /// Store directory (defaults to $CELLAR_STORE or the platform data directory)
  #[arg(long, global = true, value_name = "DIR")]
  store: Option<PathBuf>,

  /// Output format
  #[arg(long, global = true, value_enum, default_value_t)]
  format: OutputFormat,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Resolve formulas and print the build order
  Plan(RequestArgs),

  /// Build formulas and their dependencies
  Build(BuildArgs),

  /// Show what the store holds
  Status,
}

fn main() -> ExitCode {
  let cli = Cli::parse();

  let default_level = if cli.verbose { "debug" } else { "warn" };
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .without_time()
    .init();

  match run(cli) {
    Ok(true) => ExitCode::SUCCESS,
    Ok(false) => ExitCode::FAILURE,
    Err(err) => {
      print_error(&format!("{err:#}"));
      ExitCode::FAILURE
    }
  }
}

fn run(cli: Cli) -> Result<bool> {
  match cli.command {
    Commands::Plan(args) => cmd_plan(&args, cli.format).map(|()| true),
    Commands::Build(args) => cmd_build(&args, cli.store, cli.format),
    Commands::Status => cmd_status(cli.store, cli.verbose, cli.format).map(|()| true),
  }
}

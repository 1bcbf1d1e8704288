//! cellar-lib: formula resolution and isolated builds for Cellar
//!
//! The pieces, bottom up:
//! - `formula`: recipes, their dependencies, options and steps
//! - `resolve`: turn requested formulas into an ordered `BuildPlan`
//! - `execute`: run one formula's steps in a fresh `Environment`
//! - `store`: the append-only record of build results and install prefixes
//! - `orchestrate`: schedule a plan across workers, reusing cached artifacts

pub mod cancel;
pub mod config;
pub mod consts;
pub mod execute;
pub mod formula;
pub mod orchestrate;
pub mod placeholder;
pub mod platform;
pub mod report;
pub mod resolve;
pub mod store;
pub mod util;

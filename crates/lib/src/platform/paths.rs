//! Default locations for the artifact store and build scratch space.
//!
//! Every location can be overridden through an environment variable so tests
//! and CI can run against isolated directories.

use std::path::PathBuf;

use crate::consts::{APP_NAME, SCRATCH_ENV, STORE_ENV};

/// Returns the user's home directory, falling back to the temp dir when unset.
#[cfg(windows)]
pub fn home_dir() -> PathBuf {
  std::env::var("USERPROFILE")
    .map(PathBuf::from)
    .unwrap_or_else(|_| std::env::temp_dir())
}

/// Returns the user's home directory, falling back to the temp dir when unset.
#[cfg(not(windows))]
pub fn home_dir() -> PathBuf {
  std::env::var("HOME")
    .map(PathBuf::from)
    .unwrap_or_else(|_| std::env::temp_dir())
}

/// Returns the directory for data files for the application
#[cfg(windows)]
pub fn data_dir() -> PathBuf {
  std::env::var("LOCALAPPDATA")
    .map(PathBuf::from)
    .unwrap_or_else(|_| home_dir())
    .join(APP_NAME)
}

/// Returns the directory for data files for the application
#[cfg(not(windows))]
pub fn data_dir() -> PathBuf {
  let data_home = std::env::var("XDG_DATA_HOME")
    .map(PathBuf::from)
    .unwrap_or_else(|_| home_dir().join(".local").join("share"));
  data_home.join(APP_NAME)
}

/// Root of the artifact store: install prefixes, logs and the record journal.
pub fn store_dir() -> PathBuf {
  if let Ok(path) = std::env::var(STORE_ENV) {
    return PathBuf::from(path);
  }
  data_dir().join("store")
}

/// Parent directory for per-build scratch environments.
///
/// Scratch space lives outside the store so a crashed build never leaves
/// partial state next to committed prefixes.
pub fn scratch_dir() -> PathBuf {
  if let Ok(path) = std::env::var(SCRATCH_ENV) {
    return PathBuf::from(path);
  }
  std::env::temp_dir().join(APP_NAME)
}

//! On-disk layout of a store.
//!
//! ```text
//! store/
//! ├── cellar/                          # install prefixes
//! │   └── <name>/<version>/<options>-<recipe>/
//! ├── logs/                            # captured build output
//! │   └── <name>-<version>-<options>-<recipe>.<attempt>.log
//! ├── records.jsonl                    # append-only build journal
//! └── .lock                            # cross-process store lock
//! ```

use std::path::{Path, PathBuf};

use crate::consts::{LOCK_FILE, RECORDS_FILE};

use super::ArtifactKey;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreLayout {
  root: PathBuf,
}

impl StoreLayout {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  pub fn cellar_dir(&self) -> PathBuf {
    self.root.join("cellar")
  }

  pub fn logs_dir(&self) -> PathBuf {
    self.root.join("logs")
  }

  pub fn records_path(&self) -> PathBuf {
    self.root.join(RECORDS_FILE)
  }

  pub fn lock_path(&self) -> PathBuf {
    self.root.join(LOCK_FILE)
  }

  /// Final install prefix of an artifact.
  pub fn prefix(&self, key: &ArtifactKey) -> PathBuf {
    self
      .cellar_dir()
      .join(&key.id.name)
      .join(&key.id.version)
      .join(format!("{}-{}", key.options_hash, key.recipe_hash))
  }

  /// Log of the `attempt`th build of an artifact, counting from 1. Each
  /// attempt gets its own file so a rebuild keeps earlier logs readable.
  pub fn log(&self, key: &ArtifactKey, attempt: usize) -> PathBuf {
    self.logs_dir().join(format!(
      "{}-{}-{}-{}.{attempt}.log",
      key.id.name, key.id.version, key.options_hash, key.recipe_hash
    ))
  }
}

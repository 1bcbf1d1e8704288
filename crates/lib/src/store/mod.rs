//! Artifact store: the record of every build outcome.
//!
//! Results are keyed by [`ArtifactKey`] (formula id, options hash, recipe
//! hash) and only ever appended. A persistent store journals each record as
//! one JSON line in `records.jsonl` and replays the journal on open.

mod layout;
mod lock;

pub use layout::StoreLayout;
pub use lock::{Holder, LockError, LockMode, StoreLock};

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::execute::{BuildResult, BuildStatus};
use crate::formula::FormulaId;
use crate::util::hash::ObjectHash;

/// Identity of a build artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArtifactKey {
  pub id: FormulaId,
  pub options_hash: ObjectHash,
  pub recipe_hash: ObjectHash,
}

impl ArtifactKey {
  pub fn new(id: FormulaId, options_hash: ObjectHash, recipe_hash: ObjectHash) -> Self {
    Self {
      id,
      options_hash,
      recipe_hash,
    }
  }

  pub fn of(result: &BuildResult) -> Self {
    Self::new(result.id.clone(), result.options_hash.clone(), result.recipe_hash.clone())
  }
}

impl std::fmt::Display for ArtifactKey {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{} [{}/{}]", self.id, self.options_hash, self.recipe_hash)
  }
}

/// Two successful builds of the same key installed different files.
///
/// Reported, not fatal: the new record is kept either way.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{key}: manifest differs from earlier build ({} missing, {} unexpected)", missing.len(), unexpected.len())]
pub struct ConsistencyError {
  pub key: ArtifactKey,
  /// In the earlier manifest but not the new one.
  pub missing: Vec<String>,
  /// In the new manifest but not the earlier one.
  pub unexpected: Vec<String>,
}

#[derive(Debug, Error)]
pub enum StoreError {
  #[error("store i/o error at {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to encode build record: {0}")]
  Encode(#[from] serde_json::Error),

  #[error("store lock poisoned")]
  Poisoned,
}

#[derive(Debug, Default)]
struct Index {
  records: HashMap<ArtifactKey, Vec<BuildResult>>,
  /// Latest successful key per (formula, options hash).
  latest_success: HashMap<(FormulaId, ObjectHash), ArtifactKey>,
  journal: Option<(PathBuf, File)>,
}

impl Index {
  fn insert(&mut self, result: BuildResult) {
    let key = ArtifactKey::of(&result);
    if result.status == BuildStatus::Success {
      self
        .latest_success
        .insert((key.id.clone(), key.options_hash.clone()), key.clone());
    }
    self.records.entry(key).or_default().push(result);
  }

  fn last_success(&self, key: &ArtifactKey) -> Option<&BuildResult> {
    self
      .records
      .get(key)?
      .iter()
      .rev()
      .find(|r| r.status == BuildStatus::Success)
  }

  /// How a successful `result` differs from the last success of its key.
  fn drift(&self, result: &BuildResult) -> Option<ConsistencyError> {
    if result.status != BuildStatus::Success {
      return None;
    }
    let key = ArtifactKey::of(result);
    let previous = self.last_success(&key)?;
    (previous.manifest != result.manifest).then(|| ConsistencyError {
      missing: difference(&previous.manifest, &result.manifest),
      unexpected: difference(&result.manifest, &previous.manifest),
      key,
    })
  }
}

/// Append-only record of build results.
///
/// Safe for concurrent use: lookups take a read lock; `record` holds the
/// write lock across the journal append and the index update, so a reader
/// never sees a half-written record.
#[derive(Debug)]
pub struct ArtifactStore {
  index: RwLock<Index>,
}

impl ArtifactStore {
  /// A store that lives only as long as this value.
  pub fn in_memory() -> Self {
    Self {
      index: RwLock::new(Index::default()),
    }
  }

  /// Open (or create) the journal in `dir` and replay it.
  ///
  /// Lines that fail to parse, such as a record torn by a crash, are skipped
  /// with a warning.
  pub fn open(dir: &Path) -> Result<Self, StoreError> {
    let layout = StoreLayout::new(dir);
    let path = layout.records_path();
    let io_err = |path: &Path| {
      let path = path.to_path_buf();
      move |source| StoreError::Io { path, source }
    };

    std::fs::create_dir_all(dir).map_err(io_err(dir))?;

    let mut index = Index::default();
    if path.exists() {
      let file = File::open(&path).map_err(io_err(&path))?;
      for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(io_err(&path))?;
        if line.trim().is_empty() {
          continue;
        }
        match serde_json::from_str::<BuildResult>(&line) {
          Ok(result) => index.insert(result),
          Err(e) => warn!(path = ?path, line = line_no + 1, error = %e, "skipping unreadable build record"),
        }
      }
    }

    let journal = OpenOptions::new()
      .create(true)
      .append(true)
      .open(&path)
      .map_err(io_err(&path))?;
    index.journal = Some((path.clone(), journal));

    info!(path = ?path, artifacts = index.records.len(), "opened artifact store");
    Ok(Self {
      index: RwLock::new(index),
    })
  }

  /// Latest successful result for `formula` built with `options_hash`, for any recipe.
  pub fn lookup(&self, formula: &FormulaId, options_hash: &ObjectHash) -> Option<BuildResult> {
    let index = self.index.read().ok()?;
    let key = index.latest_success.get(&(formula.clone(), options_hash.clone()))?;
    index.last_success(key).cloned()
  }

  /// Latest successful result for exactly `key`.
  pub fn lookup_key(&self, key: &ArtifactKey) -> Option<BuildResult> {
    let index = self.index.read().ok()?;
    index.last_success(key).cloned()
  }

  pub fn manifest_of(&self, formula: &FormulaId, options_hash: &ObjectHash) -> Option<Vec<String>> {
    self.lookup(formula, options_hash).map(|r| r.manifest)
  }

  /// The [`ConsistencyError`] recording `result` would report, without recording it.
  pub fn check(&self, result: &BuildResult) -> Option<ConsistencyError> {
    self.index.read().ok()?.drift(result)
  }

  /// Append `result`.
  ///
  /// Returns a [`ConsistencyError`] when a successful result's manifest
  /// differs from the previous successful result for the same key.
  pub fn record(&self, result: BuildResult) -> Result<Option<ConsistencyError>, StoreError> {
    let mut index = self.index.write().map_err(|_| StoreError::Poisoned)?;
    let key = ArtifactKey::of(&result);
    let inconsistency = index.drift(&result);

    if let Some((path, journal)) = index.journal.as_mut() {
      let mut line = serde_json::to_string(&result)?;
      line.push('\n');
      journal
        .write_all(line.as_bytes())
        .and_then(|()| journal.flush())
        .map_err(|source| StoreError::Io {
          path: path.clone(),
          source,
        })?;
    }

    if let Some(err) = &inconsistency {
      warn!(artifact = %key, error = %err, "inconsistent artifact manifest");
    }
    debug!(artifact = %key, status = ?result.status, "recorded build result");
    index.insert(result);

    Ok(inconsistency)
  }

  /// The most recent result of every key, sorted by key.
  pub fn entries(&self) -> Vec<BuildResult> {
    let Ok(index) = self.index.read() else {
      return Vec::new();
    };
    let mut entries: Vec<(ArtifactKey, BuildResult)> = index
      .records
      .iter()
      .filter_map(|(key, results)| results.last().map(|r| (key.clone(), r.clone())))
      .collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    entries.into_iter().map(|(_, r)| r).collect()
  }

  /// Every result ever recorded for `key`, oldest first.
  pub fn history(&self, key: &ArtifactKey) -> Vec<BuildResult> {
    self
      .index
      .read()
      .ok()
      .and_then(|index| index.records.get(key).cloned())
      .unwrap_or_default()
  }
}

fn difference(a: &[String], b: &[String]) -> Vec<String> {
  a.iter().filter(|x| b.binary_search(x).is_err()).cloned().collect()
}

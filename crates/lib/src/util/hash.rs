//! Hashing utilities for artifact keys and install verification.
//!
//! This module provides:
//! - `ObjectHash`: a truncated 20-character hash identifying recipes and option sets
//! - `ContentHash`: a full 64-character hash of installed content
//! - `digest_directory()`: deterministic directory hashing that also yields the file manifest
//! - `hash_file()` / `hash_bytes()`: single file and byte hashing

use std::fs;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::consts::OBJ_HASH_PREFIX_LEN;

pub type HashError = serde_json::Error;

/// A hash identifying a unique serializable object.
///
/// The hash is a 20-character truncated SHA-256 of the JSON-serialized value,
/// lowercase hex, e.g. `"a1b2c3d4e5f6789012ab"`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectHash(pub String);

impl ObjectHash {
  /// Truncated SHA-256 of raw bytes.
  pub fn from_bytes(data: &[u8]) -> Self {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let full = format!("{:x}", hasher.finalize());
    ObjectHash(full[..OBJ_HASH_PREFIX_LEN].to_string())
  }
}

impl std::fmt::Display for ObjectHash {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Types whose JSON serialization is stable and can be hashed into an [`ObjectHash`].
///
/// Implementors must serialize deterministically: use `BTreeMap` rather than
/// `HashMap` for any map fields.
pub trait Hashable: Serialize {
  fn compute_hash(&self) -> Result<ObjectHash, HashError> {
    let serialized = serde_json::to_string(self)?;
    Ok(ObjectHash::from_bytes(serialized.as_bytes()))
  }
}

/// A full 64-character SHA-256 hash of content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub String);

impl std::fmt::Display for ContentHash {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

#[derive(Debug, thiserror::Error)]
pub enum DirHashError {
  #[error("failed to walk directory: {message}")]
  WalkDir { message: String },

  #[error("failed to read file {path}: {message}")]
  ReadFile { path: String, message: String },

  #[error("failed to read symlink {path}: {message}")]
  ReadSymlink { path: String, message: String },
}

/// Result of walking an install prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirDigest {
  /// Relative paths of every file and symlink, sorted, `/`-separated.
  pub manifest: Vec<String>,
  /// Hash over paths, file contents and symlink targets.
  pub hash: ContentHash,
}

/// Walk `path` and compute its manifest and content hash.
///
/// Directories contribute to the hash (so empty directories are visible) but
/// are not listed in the manifest. Timestamps and permissions are ignored.
/// Special files (sockets, devices) are skipped.
pub fn digest_directory(path: &Path) -> Result<DirDigest, DirHashError> {
  let mut entries: Vec<(String, String)> = Vec::new();
  let mut manifest = Vec::new();

  for entry in WalkDir::new(path).sort_by_file_name() {
    let entry = entry.map_err(|e| DirHashError::WalkDir { message: e.to_string() })?;
    let entry_path = entry.path();

    let Ok(rel) = entry_path.strip_prefix(path) else {
      continue;
    };
    let rel_path = rel
      .components()
      .map(|c| c.as_os_str().to_string_lossy())
      .collect::<Vec<_>>()
      .join("/");
    if rel_path.is_empty() {
      continue;
    }

    let file_type = entry.file_type();
    let line = if file_type.is_symlink() {
      let target = fs::read_link(entry_path).map_err(|e| DirHashError::ReadSymlink {
        path: entry_path.display().to_string(),
        message: e.to_string(),
      })?;
      manifest.push(rel_path.clone());
      format!("L:{}:{}", rel_path, hash_bytes(target.to_string_lossy().as_bytes()).0)
    } else if file_type.is_file() {
      manifest.push(rel_path.clone());
      format!("F:{}:{}", rel_path, hash_file(entry_path)?.0)
    } else if file_type.is_dir() {
      format!("D:{}", rel_path)
    } else {
      continue;
    };

    entries.push((rel_path, line));
  }

  entries.sort_by(|a, b| a.0.cmp(&b.0));
  manifest.sort();

  let mut hasher = Sha256::new();
  for (_, line) in entries {
    hasher.update(line.as_bytes());
    hasher.update(b"\n");
  }

  Ok(DirDigest {
    manifest,
    hash: ContentHash(format!("{:x}", hasher.finalize())),
  })
}

/// Hash a file's contents.
pub fn hash_file(path: &Path) -> Result<ContentHash, DirHashError> {
  let read_err = |e: std::io::Error| DirHashError::ReadFile {
    path: path.display().to_string(),
    message: e.to_string(),
  };

  let mut file = fs::File::open(path).map_err(read_err)?;
  let mut hasher = Sha256::new();
  let mut buffer = [0u8; 8192];

  loop {
    let n = file.read(&mut buffer).map_err(read_err)?;
    if n == 0 {
      break;
    }
    hasher.update(&buffer[..n]);
  }

  Ok(ContentHash(format!("{:x}", hasher.finalize())))
}

/// Hash arbitrary bytes.
pub fn hash_bytes(data: &[u8]) -> ContentHash {
  let mut hasher = Sha256::new();
  hasher.update(data);
  ContentHash(format!("{:x}", hasher.finalize()))
}

//! Fetch action: download a source archive with SHA-256 verification.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::execute::types::RunnerError;

/// Download `url` into `dest_dir` and verify it against `expected_sha256`.
///
/// A file already present under the same name with the right hash is reused
/// without touching the network. Returns the path of the verified file.
pub async fn execute_fetch(url: &str, expected_sha256: &str, dest_dir: &Path) -> Result<PathBuf, RunnerError> {
  info!(url = %url, "fetching source");

  fs::create_dir_all(dest_dir).await?;
  let dest_path = dest_dir.join(url_to_filename(url));
  let expected = expected_sha256.to_ascii_lowercase();

  if fs::try_exists(&dest_path).await.unwrap_or(false) {
    let actual = hash_file(&dest_path).await?;
    if actual == expected {
      info!(path = ?dest_path, "using existing file");
      return Ok(dest_path);
    }
    debug!(expected = %expected, actual = %actual, "existing file hash mismatch, downloading");
  }

  let fetch_err = |e: reqwest::Error| RunnerError::FetchFailed {
    url: url.to_string(),
    message: e.to_string(),
  };

  let response = reqwest::get(url).await.map_err(fetch_err)?;
  if !response.status().is_success() {
    return Err(RunnerError::FetchFailed {
      url: url.to_string(),
      message: format!("HTTP {}", response.status()),
    });
  }
  let bytes = response.bytes().await.map_err(fetch_err)?;

  let actual = hex::encode(Sha256::digest(&bytes));
  if actual != expected {
    return Err(RunnerError::HashMismatch {
      url: url.to_string(),
      expected,
      actual,
    });
  }

  let mut file = fs::File::create(&dest_path).await?;
  file.write_all(&bytes).await?;
  file.flush().await?;

  info!(path = ?dest_path, size = bytes.len(), "download complete");
  Ok(dest_path)
}

async fn hash_file(path: &Path) -> Result<String, std::io::Error> {
  let bytes = fs::read(path).await?;
  Ok(hex::encode(Sha256::digest(&bytes)))
}

/// The last path segment of `url`, sanitized; a hash of the URL if that is unusable.
pub(crate) fn url_to_filename(url: &str) -> String {
  let last = url.split(['?', '#']).next().unwrap_or(url).rsplit('/').next().unwrap_or("");
  let sanitized: String = last
    .chars()
    .map(|c| {
      if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '+') {
        c
      } else {
        '_'
      }
    })
    .collect();

  if !sanitized.is_empty() && sanitized != "." && sanitized != ".." {
    return sanitized;
  }

  format!("download_{}", &hex::encode(Sha256::digest(url.as_bytes()))[..16])
}

//! Cross-process lock on a store directory.
//!
//! `cellar build` holds the store exclusively for the whole run and
//! `cellar status` holds it shared. An exclusive holder leaves a [`Holder`]
//! record in the lock file, so a process that finds the store busy can say
//! who has it.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::StoreLayout;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
  Shared,
  Exclusive,
}

/// The process holding a store exclusively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Holder {
  pub pid: u32,
  pub command: String,
  /// RFC 3339, whole seconds.
  pub since: String,
}

impl Holder {
  fn this_process(command: &str) -> Self {
    Self {
      pid: std::process::id(),
      command: command.to_string(),
      since: humantime::format_rfc3339_seconds(SystemTime::now()).to_string(),
    }
  }
}

impl fmt::Display for Holder {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "`{}` (pid {}, since {})", self.command, self.pid, self.since)
  }
}

#[derive(Debug, Error)]
pub enum LockError {
  #[error("store is busy: held by {}\nIf that process is gone, delete {}", holder_text(.holder), .path.display())]
  Busy { path: PathBuf, holder: Option<Holder> },

  #[error("cannot lock store at {}: {source}", .path.display())]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

fn holder_text(holder: &Option<Holder>) -> String {
  match holder {
    Some(holder) => holder.to_string(),
    None => "another process".to_string(),
  }
}

/// A held store lock. Closing the file on drop releases it.
#[derive(Debug)]
pub struct StoreLock {
  file: File,
  path: PathBuf,
  mode: LockMode,
}

impl StoreLock {
  /// Lock the store rooted at `store` without waiting, creating it if needed.
  pub fn try_acquire(store: &Path, mode: LockMode, command: &str) -> Result<Self, LockError> {
    let layout = StoreLayout::new(store);
    let path = layout.lock_path();
    let io_err = |source| LockError::Io {
      path: path.clone(),
      source,
    };

    std::fs::create_dir_all(layout.root()).map_err(io_err)?;
    let file = OpenOptions::new()
      .read(true)
      .write(true)
      .create(true)
      .truncate(false)
      .open(&path)
      .map_err(io_err)?;

    match sys::lock_nonblocking(&file, mode) {
      Ok(()) => {}
      Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
        let holder = read_holder(&file).ok();
        return Err(LockError::Busy { path, holder });
      }
      Err(e) => return Err(io_err(e)),
    }

    if mode == LockMode::Exclusive {
      write_holder(&file, &Holder::this_process(command)).map_err(io_err)?;
    }

    debug!(path = ?path, mode = ?mode, "locked store");
    Ok(Self { file, path, mode })
  }

  pub fn mode(&self) -> LockMode {
    self.mode
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  /// The recorded exclusive holder, read through this handle. Windows refuses
  /// a second handle to a locked file.
  pub fn holder(&self) -> Option<Holder> {
    read_holder(&self.file).ok()
  }
}

fn read_holder(mut file: &File) -> io::Result<Holder> {
  file.seek(SeekFrom::Start(0))?;
  let mut contents = String::new();
  file.read_to_string(&mut contents)?;
  serde_json::from_str(&contents).map_err(io::Error::other)
}

fn write_holder(mut file: &File, holder: &Holder) -> io::Result<()> {
  file.set_len(0)?;
  file.seek(SeekFrom::Start(0))?;
  serde_json::to_writer(&mut file, holder).map_err(io::Error::other)?;
  file.flush()
}

#[cfg(unix)]
mod sys {
  use std::fs::File;
  use std::io;

  use rustix::fs::{FlockOperation, flock};

  use super::LockMode;

  pub(super) fn lock_nonblocking(file: &File, mode: LockMode) -> io::Result<()> {
    let operation = match mode {
      LockMode::Shared => FlockOperation::NonBlockingLockShared,
      LockMode::Exclusive => FlockOperation::NonBlockingLockExclusive,
    };
    flock(file, operation).map_err(io::Error::from)
  }
}

#[cfg(windows)]
mod sys {
  use std::fs::File;
  use std::io;
  use std::os::windows::io::AsRawHandle;

  use windows_sys::Win32::Foundation::HANDLE;
  use windows_sys::Win32::Storage::FileSystem::{LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY, LockFileEx};

  use super::LockMode;

  pub(super) fn lock_nonblocking(file: &File, mode: LockMode) -> io::Result<()> {
    let mut flags = LOCKFILE_FAIL_IMMEDIATELY;
    if mode == LockMode::Exclusive {
      flags |= LOCKFILE_EXCLUSIVE_LOCK;
    }

    // SAFETY: the handle stays open for the call and a zeroed OVERLAPPED
    // locks from offset 0.
    let locked = unsafe {
      let mut overlapped = std::mem::zeroed();
      LockFileEx(file.as_raw_handle() as HANDLE, flags, 0, 1, 0, &mut overlapped)
    };
    if locked != 0 { Ok(()) } else { Err(io::Error::last_os_error()) }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  #[test]
  fn build_lock_names_its_holder() {
    let temp = TempDir::new().unwrap();
    let lock = StoreLock::try_acquire(temp.path(), LockMode::Exclusive, "cellar build gap").unwrap();
    assert_eq!(lock.path(), StoreLayout::new(temp.path()).lock_path());
    assert_eq!(lock.mode(), LockMode::Exclusive);

    let holder = lock.holder().unwrap();
    assert_eq!(holder.command, "cellar build gap");
    assert_eq!(holder.pid, std::process::id());
    assert!(humantime::parse_rfc3339(&holder.since).is_ok());
  }

  #[test]
  fn status_lock_creates_missing_store() {
    let temp = TempDir::new().unwrap();
    let store = temp.path().join("nested/store");
    let lock = StoreLock::try_acquire(&store, LockMode::Shared, "cellar status").unwrap();
    assert!(lock.path().starts_with(&store));
    assert!(lock.holder().is_none());
  }

  #[test]
  fn readers_share_the_store() {
    let temp = TempDir::new().unwrap();
    let _a = StoreLock::try_acquire(temp.path(), LockMode::Shared, "cellar status").unwrap();
    let _b = StoreLock::try_acquire(temp.path(), LockMode::Shared, "cellar status").unwrap();
  }

  #[cfg(unix)]
  #[test]
  fn second_build_sees_first_holder() {
    let temp = TempDir::new().unwrap();
    let _held = StoreLock::try_acquire(temp.path(), LockMode::Exclusive, "cellar build r").unwrap();

    let err = StoreLock::try_acquire(temp.path(), LockMode::Exclusive, "cellar build gap").unwrap_err();
    let LockError::Busy { holder, .. } = &err else {
      panic!("expected a busy store, got {err:?}");
    };
    assert_eq!(holder.as_ref().map(|h| h.command.as_str()), Some("cellar build r"));
    assert!(err.to_string().contains("`cellar build r`"));
  }

  #[cfg(unix)]
  #[test]
  fn status_is_refused_during_build() {
    let temp = TempDir::new().unwrap();
    let _held = StoreLock::try_acquire(temp.path(), LockMode::Exclusive, "cellar build r").unwrap();
    let err = StoreLock::try_acquire(temp.path(), LockMode::Shared, "cellar status").unwrap_err();
    assert!(matches!(err, LockError::Busy { .. }));
  }

  #[test]
  fn dropping_the_lock_frees_the_store() {
    let temp = TempDir::new().unwrap();
    drop(StoreLock::try_acquire(temp.path(), LockMode::Exclusive, "first").unwrap());

    let lock = StoreLock::try_acquire(temp.path(), LockMode::Exclusive, "second").unwrap();
    assert_eq!(lock.holder().unwrap().command, "second");
  }
}

// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Directory removal and rename primitives used by exception recovery.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use thiserror::Error;

/// Filesystem failure reported to recovery.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{op} {}: {reason}", .path.display())]
pub struct FsError {
    /// Operation name.
    pub op: &'static str,
    /// Path the operation targeted.
    pub path: PathBuf,
    /// Backend message.
    pub reason: String,
}

/// Filesystem collaborator.
pub trait FileOps: Send + Sync {
    /// Recursively removes `path`; a missing directory counts as removed.
    fn remove_dir(&self, path: &Path) -> Result<(), FsError>;

    /// Renames `from` to `to`, replacing `to` if present.
    fn rename_dir(&self, from: &Path, to: &Path) -> Result<(), FsError>;
}

/// `std::fs` backed implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdFileOps;

impl FileOps for StdFileOps {
    fn remove_dir(&self, path: &Path) -> Result<(), FsError> {
        match fs::remove_dir_all(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                Err(FsError { op: "remove_dir", path: path.to_path_buf(), reason: err.to_string() })
            }
        }
    }

    fn rename_dir(&self, from: &Path, to: &Path) -> Result<(), FsError> {
        let fail = |err: std::io::Error| FsError {
            op: "rename_dir",
            path: from.to_path_buf(),
            reason: err.to_string(),
        };
        fs::metadata(from).map_err(fail)?;
        if to.exists() {
            fs::remove_dir_all(to).map_err(fail)?;
        }
        fs::rename(from, to).map_err(fail)
    }
}

/// Operation recorded by [`MemoryFs`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsCall {
    /// `remove_dir(path)`.
    Remove(PathBuf),
    /// `rename_dir(from, to)`.
    Rename(PathBuf, PathBuf),
}

/// Recording filesystem double with per-path failure injection.
#[derive(Debug, Default)]
pub struct MemoryFs {
    calls: Mutex<Vec<FsCall>>,
    failing: Mutex<BTreeSet<PathBuf>>,
}

impl MemoryFs {
    /// Creates a double where every call succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every operation on `path` fail.
    pub fn fail_on(&self, path: impl Into<PathBuf>) {
        self.failing.lock().insert(path.into());
    }

    /// Lets operations on every path succeed again.
    pub fn heal(&self) {
        self.failing.lock().clear();
    }

    /// Calls seen so far.
    pub fn calls(&self) -> Vec<FsCall> {
        self.calls.lock().clone()
    }

    fn check(&self, op: &'static str, path: &Path) -> Result<(), FsError> {
        if self.failing.lock().contains(path) {
            return Err(FsError { op, path: path.to_path_buf(), reason: "injected".into() });
        }
        Ok(())
    }
}

impl FileOps for MemoryFs {
    fn remove_dir(&self, path: &Path) -> Result<(), FsError> {
        self.calls.lock().push(FsCall::Remove(path.to_path_buf()));
        self.check("remove_dir", path)
    }

    fn rename_dir(&self, from: &Path, to: &Path) -> Result<(), FsError> {
        self.calls.lock().push(FsCall::Rename(from.to_path_buf(), to.to_path_buf()));
        self.check("rename_dir", from)
    }
}

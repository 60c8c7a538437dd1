// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Persistence collaborator contract and host backends
//! OWNERS: @runtime
//! STATUS: Functional (host-first)
//! API_STABILITY: Stable
//! TEST_COVERAGE: Unit tests (in-memory failure injection, directory store with tempfile)
//!
//! PUBLIC API:
//!   - BundleStore: put/delete/get_all over opaque blobs
//!   - MemoryStore: in-memory backend with call counters and injectable failures
//!   - JsonDirStore: one file per key under a directory
//!
//! The registry never interprets the backend beyond this contract.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use thiserror::Error;

/// Errors reported by a storage backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Backend rejected or failed the write.
    #[error("write failed: {0}")]
    Write(String),
    /// Backend failed the delete.
    #[error("delete failed: {0}")]
    Delete(String),
    /// Backend failed the scan.
    #[error("read failed: {0}")]
    Read(String),
    /// Key cannot be represented by the backend.
    #[error("invalid key: {0}")]
    InvalidKey(String),
}

/// Durable key-value contract consumed by the registry.
pub trait BundleStore: Send + Sync {
    /// Writes `value` under `key`, replacing any previous value.
    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    /// Removes `key`; removing an absent key succeeds.
    fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Returns every stored pair.
    fn get_all(&self) -> Result<Vec<(String, Vec<u8>)>, StoreError>;
}

// ============================================================================
// In-memory backend
// ============================================================================

/// In-memory store for hosts and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
    fail_put: AtomicBool,
    fail_delete: AtomicBool,
    puts: AtomicUsize,
    deletes: AtomicUsize,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following `put` fail (or succeed again).
    pub fn set_fail_put(&self, fail: bool) {
        self.fail_put.store(fail, Ordering::SeqCst);
    }

    /// Makes every following `delete` fail (or succeed again).
    pub fn set_fail_delete(&self, fail: bool) {
        self.fail_delete.store(fail, Ordering::SeqCst);
    }

    /// Number of `put` calls, failed ones included.
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    /// Number of `delete` calls, failed ones included.
    pub fn delete_count(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    /// Stored value of `key`.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.entries.lock().get(key).cloned()
    }

    /// Stored keys in order.
    pub fn keys(&self) -> Vec<String> {
        self.entries.lock().keys().cloned().collect()
    }

    /// Writes a raw value, bypassing counters and failure injection.
    pub fn insert_raw(&self, key: &str, value: &[u8]) {
        self.entries.lock().insert(key.to_string(), value.to_vec());
    }
}

impl BundleStore for MemoryStore {
    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        if self.fail_put.load(Ordering::SeqCst) {
            return Err(StoreError::Write(format!("injected failure for {key}")));
        }
        self.entries.lock().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(StoreError::Delete(format!("injected failure for {key}")));
        }
        self.entries.lock().remove(key);
        Ok(())
    }

    fn get_all(&self) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        Ok(self.entries.lock().iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }
}

// ============================================================================
// Directory backend
// ============================================================================

const BLOB_EXTENSION: &str = "json";

/// Stores each key as `<dir>/<key>.json`, written through a temporary file.
#[derive(Debug)]
pub struct JsonDirStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonDirStore {
    /// Opens (and creates if needed) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .map_err(|err| StoreError::Write(format!("{}: {err}", dir.display())))?;
        Ok(Self { dir, write_lock: Mutex::new(()) })
    }

    /// Root directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        if key.is_empty() || key.starts_with('.') || key.contains(['/', '\\']) {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.dir.join(format!("{key}.{BLOB_EXTENSION}")))
    }
}

impl BundleStore for JsonDirStore {
    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        let staging = self.dir.join(format!(".{key}.tmp"));
        let _guard = self.write_lock.lock();
        let write = || -> std::io::Result<()> {
            let mut file = fs::File::create(&staging)?;
            file.write_all(value)?;
            file.sync_all()?;
            fs::rename(&staging, &path)
        };
        write().map_err(|err| StoreError::Write(format!("{key}: {err}")))
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        let _guard = self.write_lock.lock();
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StoreError::Delete(format!("{key}: {err}"))),
        }
    }

    fn get_all(&self) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let read_err = |err: std::io::Error| StoreError::Read(err.to_string());
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.dir).map_err(read_err)? {
            let path = entry.map_err(read_err)?.path();
            let is_blob = path.extension().and_then(|ext| ext.to_str()) == Some(BLOB_EXTENSION);
            if !path.is_file() || !is_blob {
                continue;
            }
            let Some(key) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            if key.starts_with('.') {
                continue;
            }
            let value = fs::read(&path).map_err(read_err)?;
            out.push((key.to_string(), value));
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }
}

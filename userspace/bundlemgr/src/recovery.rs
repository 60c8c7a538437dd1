// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Load-time repair of records left behind by interrupted operations
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: Unit tests per install phase, failure deferral, idempotence, dead store handle
//!
//! The handler holds a non-owning handle to the store. When the store is gone the
//! handler does nothing and the record stays invisible until the next load.
//! Record fields are only touched after the filesystem step succeeded.

use std::path::PathBuf;
use std::sync::{Arc, Weak};

use crate::config::StoreConfig;
use crate::fs::FileOps;
use crate::record::{BundleRecord, BundleStatus, InstallPhase};
use crate::storage::BundleStore;

/// Decision taken for one loaded record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// Record was already consistent.
    Valid,
    /// Record was repaired and may be exposed.
    Repaired,
    /// Record was dropped and deleted from storage.
    Discarded,
    /// Cleanup failed or the store is gone; retry on the next load.
    Deferred,
}

impl RecoveryOutcome {
    /// True when the record may enter the registry.
    pub fn is_usable(self) -> bool {
        matches!(self, RecoveryOutcome::Valid | RecoveryOutcome::Repaired)
    }
}

/// Repairs or discards records whose install mark is not `Finished`.
pub struct ExceptionRecoveryHandler {
    config: StoreConfig,
    fs: Arc<dyn FileOps>,
    store: Weak<dyn BundleStore>,
}

impl ExceptionRecoveryHandler {
    /// Creates a handler writing back through a weak handle to `store`.
    pub fn new(config: StoreConfig, fs: Arc<dyn FileOps>, store: &Arc<dyn BundleStore>) -> Self {
        Self { config, fs, store: Arc::downgrade(store) }
    }

    /// Inspects `record` stored under `key` and repairs it in place when possible.
    pub fn handle(&self, key: &str, record: &mut BundleRecord) -> RecoveryOutcome {
        let mark = record.install_mark.clone();
        if mark.phase == InstallPhase::Finished {
            return RecoveryOutcome::Valid;
        }
        let Some(store) = self.store.upgrade() else {
            log::warn!("bundlemgr: store gone, recovery of {key} skipped");
            return RecoveryOutcome::Deferred;
        };
        let bundle = record.bundle_name.clone();
        let package = mark.package_name.as_str();
        log::info!("bundlemgr: recovering {key} from {:?} ({package})", mark.phase);

        match mark.phase {
            InstallPhase::Finished => RecoveryOutcome::Valid,
            InstallPhase::InstallStart | InstallPhase::UninstallBundleStart => {
                self.discard(store.as_ref(), key, record)
            }
            InstallPhase::UninstallPackageStart if record.is_only_module(package) => {
                self.discard(store.as_ref(), key, record)
            }
            InstallPhase::UpdatingExistingStart => {
                let staging = self.config.module_staging_dir(&bundle, package);
                if !self.remove_all(&[staging]) {
                    return RecoveryOutcome::Deferred;
                }
                record.status = BundleStatus::Enabled;
                self.finish(store.as_ref(), key, record)
            }
            InstallPhase::UpdatingNewStart => {
                if !self.remove_all(&self.module_dirs(record, package)) {
                    return RecoveryOutcome::Deferred;
                }
                record.status = BundleStatus::Enabled;
                self.finish(store.as_ref(), key, record)
            }
            InstallPhase::UninstallPackageStart => {
                if !self.remove_all(&self.module_dirs(record, package)) {
                    return RecoveryOutcome::Deferred;
                }
                record.remove_module(package);
                record.status = BundleStatus::Enabled;
                self.finish(store.as_ref(), key, record)
            }
            InstallPhase::UpdatingFinish => {
                let staging = self.config.module_staging_dir(&bundle, package);
                let live = self.config.module_code_dir(&bundle, package);
                if let Err(err) = self.fs.rename_dir(&staging, &live) {
                    log::error!("bundlemgr: recovery of {key} deferred: {err}");
                    return RecoveryOutcome::Deferred;
                }
                self.finish(store.as_ref(), key, record)
            }
            InstallPhase::Unknown => {
                log::error!("bundlemgr: {key} carries an unknown install phase");
                RecoveryOutcome::Deferred
            }
        }
    }

    fn bundle_dirs(&self, record: &BundleRecord) -> Vec<PathBuf> {
        let mut dirs = vec![self.config.bundle_code_dir(&record.bundle_name)];
        dirs.extend(
            record.users.keys().map(|user| self.config.bundle_data_dir(*user, &record.bundle_name)),
        );
        dirs
    }

    fn module_dirs(&self, record: &BundleRecord, package: &str) -> Vec<PathBuf> {
        let mut dirs = vec![self.config.module_code_dir(&record.bundle_name, package)];
        dirs.extend(record.users.keys().map(|user| {
            self.config.module_data_dir(*user, &record.bundle_name, package)
        }));
        dirs
    }

    fn remove_all(&self, dirs: &[PathBuf]) -> bool {
        for dir in dirs {
            if let Err(err) = self.fs.remove_dir(dir) {
                log::error!("bundlemgr: recovery cleanup failed: {err}");
                return false;
            }
        }
        true
    }

    fn discard(
        &self,
        store: &dyn BundleStore,
        key: &str,
        record: &BundleRecord,
    ) -> RecoveryOutcome {
        if !self.remove_all(&self.bundle_dirs(record)) {
            return RecoveryOutcome::Deferred;
        }
        if let Err(err) = store.delete(key) {
            log::error!("bundlemgr: failed to delete discarded {key}: {err}");
        }
        RecoveryOutcome::Discarded
    }

    fn finish(
        &self,
        store: &dyn BundleStore,
        key: &str,
        record: &mut BundleRecord,
    ) -> RecoveryOutcome {
        let package = record.install_mark.package_name.clone();
        record.set_install_mark(&package, InstallPhase::Finished);
        match serde_json::to_vec(record) {
            Ok(blob) => {
                if let Err(err) = store.put(key, &blob) {
                    log::warn!("bundlemgr: repaired {key} not persisted: {err}");
                }
            }
            Err(err) => log::warn!("bundlemgr: repaired {key} not encodable: {err}"),
        }
        RecoveryOutcome::Repaired
    }
}

// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Bundle registry orchestrating lifecycle, persistence and queries
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: Unit tests here, end-to-end flows in tests/registry_flow.rs
//!
//! PUBLIC API:
//!   - BundleRegistry::load_all: restore records, recovering interrupted operations
//!   - BundleRegistry::apply / begin_install: validated lifecycle transitions
//!   - BundleRegistry::commit_install / commit_update / add_module / remove_module
//!   - BundleRegistry::set_app_enabled / set_ability_enabled: per-user toggles
//!   - BundleRegistry::set_module_removable / set_module_upgrade_flag: module flags
//!   - BundleRegistry::check_public_keys: signing identity comparison
//!   - BundleRegistry::query_*: capability resolution against a locked snapshot
//!   - BundleRegistry::notify: status callbacks and external events
//!
//! Locking: the registry lock (`bundles`) is always taken before the state lock
//! (`states`). The id allocator, callback table, pre-install table, user set and
//! per-bundle lock map are leaves and never wrap either of them.
//!
//! Every mutation is write-ahead: the next version of a record is built on a copy,
//! persisted, and only then swapped into the map.
//!
//! A bundle stays invisible to every query until it has reached `InstallSuccess` or
//! `UpdatingSuccess` at least once.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::callbacks::{CallbackTable, StatusCallback, SubscriberId};
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::events::{BundleEvent, EventSink, NotifyType, NullSink};
use crate::fs::{FileOps, StdFileOps};
use crate::identity::{derive_gids, IdentityAllocator, NamespaceHook, NoopNamespace};
use crate::projection::{ProjectionOptions, QueryFlags};
use crate::record::{
    base_name, merge_new_module, merge_update, AbilityInfo, ApplicationInfo, BundleRecord,
    BundleStatus, BundleUserState, ExtensionInfo, ExtensionType, PreInstallBundleInfo,
    SandboxAppInfo, UserRecord,
};
use crate::recovery::ExceptionRecoveryHandler;
use crate::resolver::{CapabilityResolver, Resolved};
use crate::skill::Want;
use crate::state::{InstallState, InstallStateMap, Transition};
use crate::storage::{BundleStore, MemoryStore};
use crate::user::{UserSelector, UserSet};

/// Result code reported to callbacks for a successful operation.
pub const RESULT_OK: i32 = 0;

const USER_STATE_SEPARATOR: char = '_';

/// Outcome of comparing the signing identities of two bundles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureCompare {
    /// Both bundles carry the same provision id.
    Matched,
    /// The provision ids differ.
    NotMatched,
    /// A name was empty or names no stored bundle.
    UnknownBundle,
}

/// External collaborators the registry drives.
pub struct Collaborators {
    /// Full bundle records keyed by bundle name (or clone key).
    pub store: Arc<dyn BundleStore>,
    /// Per-user enablement snapshots keyed `<bundle>_<user>`.
    pub user_state_store: Arc<dyn BundleStore>,
    /// Pre-install table keyed by bundle name.
    pub pre_install_store: Arc<dyn BundleStore>,
    /// Directory primitives used by recovery.
    pub fs: Arc<dyn FileOps>,
    /// Event delivery.
    pub sink: Arc<dyn EventSink>,
    /// Namespace hook fired on id allocation and release.
    pub namespace: Arc<dyn NamespaceHook>,
}

impl Collaborators {
    /// Uses `store` for records, in-memory side tables, the real filesystem and no
    /// event delivery.
    pub fn with_store(store: Arc<dyn BundleStore>) -> Self {
        Self {
            store,
            user_state_store: Arc::new(MemoryStore::new()),
            pre_install_store: Arc::new(MemoryStore::new()),
            fs: Arc::new(StdFileOps),
            sink: Arc::new(NullSink),
            namespace: Arc::new(NoopNamespace),
        }
    }
}

/// Summary of a [`BundleRegistry::load_all`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Records now visible in the registry.
    pub loaded: usize,
    /// Blobs that failed to decode.
    pub corrupt: usize,
    /// Records dropped or deferred by recovery.
    pub skipped: usize,
}

/// In-memory registry of installed bundles.
pub struct BundleRegistry {
    config: StoreConfig,
    bundles: Mutex<BTreeMap<String, BundleRecord>>,
    states: Mutex<InstallStateMap>,
    identity: IdentityAllocator,
    callbacks: CallbackTable,
    pre_install: Mutex<BTreeMap<String, PreInstallBundleInfo>>,
    users: UserSet,
    bundle_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    store: Arc<dyn BundleStore>,
    user_state_store: Arc<dyn BundleStore>,
    pre_install_store: Arc<dyn BundleStore>,
    fs: Arc<dyn FileOps>,
    sink: Arc<dyn EventSink>,
}

impl BundleRegistry {
    /// Creates an empty registry.
    pub fn new(config: StoreConfig, collaborators: Collaborators) -> Self {
        Self {
            identity: IdentityAllocator::new(&config, collaborators.namespace),
            config,
            bundles: Mutex::new(BTreeMap::new()),
            states: Mutex::new(InstallStateMap::new()),
            callbacks: CallbackTable::new(),
            pre_install: Mutex::new(BTreeMap::new()),
            users: UserSet::new(),
            bundle_locks: Mutex::new(HashMap::new()),
            store: collaborators.store,
            user_state_store: collaborators.user_state_store,
            pre_install_store: collaborators.pre_install_store,
            fs: collaborators.fs,
            sink: collaborators.sink,
        }
    }

    /// Configuration in use.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    // ========================================================================
    // Loading
    // ========================================================================

    /// Pulls every persisted record, runs recovery on it and makes the survivors
    /// visible with state `InstallSuccess`.
    pub fn load_all(&self) -> Result<LoadReport> {
        let entries = self.store.get_all()?;
        let recovery =
            ExceptionRecoveryHandler::new(self.config.clone(), Arc::clone(&self.fs), &self.store);
        let mut report = LoadReport::default();

        let mut bundles = self.bundles.lock();
        let mut states = self.states.lock();
        for (key, blob) in entries {
            let mut record: BundleRecord = match serde_json::from_slice(&blob) {
                Ok(record) => record,
                Err(err) => {
                    log::error!("bundlemgr: undecodable record {key}: {err}");
                    report.corrupt += 1;
                    continue;
                }
            };
            if !recovery.handle(&key, &mut record).is_usable() {
                report.skipped += 1;
                continue;
            }
            self.restore_identity(&record);
            states.seed(&key, InstallState::InstallSuccess);
            bundles.insert(key, record);
            report.loaded += 1;
        }
        drop(states);
        self.load_user_states(&mut bundles)?;
        drop(bundles);
        self.load_pre_install()?;
        log::info!(
            "bundlemgr: loaded {} bundles ({} corrupt, {} skipped)",
            report.loaded,
            report.corrupt,
            report.skipped
        );
        Ok(report)
    }

    fn restore_identity(&self, record: &BundleRecord) {
        for user_id in record.users.keys() {
            self.users.add(*user_id);
        }
        let Some((user_id, user)) = record.users.iter().next() else {
            return;
        };
        match self.identity.bundle_id_from_uid(user.uid, *user_id) {
            Some(bundle_id) => self.identity.restore(bundle_id, &record.bundle_name),
            None => log::warn!("bundlemgr: {} carries bad uid {}", record.bundle_name, user.uid),
        }
    }

    fn load_user_states(&self, bundles: &mut BTreeMap<String, BundleRecord>) -> Result<()> {
        for (key, blob) in self.user_state_store.get_all()? {
            let Some((bundle_name, user)) = key.rsplit_once(USER_STATE_SEPARATOR) else {
                log::warn!("bundlemgr: malformed user state key {key}");
                continue;
            };
            let (Ok(user_id), Ok(state)) =
                (user.parse::<i32>(), serde_json::from_slice::<BundleUserState>(&blob))
            else {
                log::warn!("bundlemgr: undecodable user state {key}");
                continue;
            };
            let applied = bundles
                .get_mut(bundle_name)
                .is_some_and(|record| record.apply_user_state(user_id, &state));
            if !applied {
                log::debug!("bundlemgr: user state {key} has no owner");
            }
        }
        Ok(())
    }

    fn load_pre_install(&self) -> Result<()> {
        let mut table = self.pre_install.lock();
        for (key, blob) in self.pre_install_store.get_all()? {
            match serde_json::from_slice::<PreInstallBundleInfo>(&blob) {
                Ok(info) => {
                    table.insert(key, info);
                }
                Err(err) => log::warn!("bundlemgr: undecodable pre-install info {key}: {err}"),
            }
        }
        Ok(())
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Applies a lifecycle transition. Delete-terminal targets purge the record,
    /// its persisted blob and its bundle id; either all of it happens or nothing.
    pub fn apply(&self, bundle_name: &str, target: InstallState) -> Result<()> {
        let mut bundles = self.bundles.lock();
        let mut states = self.states.lock();
        let transition = states.check(bundle_name, target)?;
        if let Transition::Purge(_) = transition {
            self.delete_bundle(&mut bundles, bundle_name)?;
        }
        states.commit(bundle_name, transition);
        log::debug!("bundlemgr: {bundle_name} -> {target:?}");
        Ok(())
    }

    /// Starts a first install.
    pub fn begin_install(&self, bundle_name: &str) -> Result<()> {
        self.apply(bundle_name, InstallState::InstallStart)
    }

    /// Current lifecycle state.
    pub fn install_state(&self, bundle_name: &str) -> Option<InstallState> {
        self.states.lock().get(bundle_name)
    }

    fn delete_bundle(
        &self,
        bundles: &mut BTreeMap<String, BundleRecord>,
        bundle_name: &str,
    ) -> Result<()> {
        if bundles.contains_key(bundle_name) {
            if let Err(err) = self.store.delete(bundle_name) {
                log::error!("bundlemgr: delete {bundle_name} failed: {err}");
                return Err(err.into());
            }
        }
        self.identity.recycle(bundle_name);
        if let Some(record) = bundles.remove(bundle_name) {
            for user_id in record.users.keys() {
                self.drop_user_state(bundle_name, *user_id);
            }
            log::info!("bundlemgr: purged {bundle_name}");
        }
        Ok(())
    }

    fn persist(&self, key: &str, record: &BundleRecord) -> Result<()> {
        let blob = serde_json::to_vec(record)?;
        self.store.put(key, &blob).map_err(|err| {
            log::error!("bundlemgr: persist {key} failed: {err}");
            Error::from(err)
        })
    }

    /// Persists and inserts a freshly installed record. Requires `InstallStart`.
    pub fn commit_install(&self, bundle_name: &str, record: BundleRecord) -> Result<()> {
        let mut bundles = self.bundles.lock();
        self.states.lock().require(
            bundle_name,
            &[InstallState::InstallStart],
            InstallState::InstallSuccess,
        )?;
        if bundles.contains_key(bundle_name) {
            return Err(Error::AlreadyExists(bundle_name.to_string()));
        }
        self.persist(bundle_name, &record)?;
        bundles.insert(bundle_name.to_string(), record);
        log::info!("bundlemgr: installed {bundle_name}");
        Ok(())
    }

    /// Merges `new` into `existing` and replaces the stored record. Requires
    /// `UpdatingSuccess`, `RollBack` or `UserChange`.
    pub fn commit_update(
        &self,
        bundle_name: &str,
        new: &BundleRecord,
        existing: &BundleRecord,
    ) -> Result<()> {
        let mut bundles = self.bundles.lock();
        self.states.lock().require(
            bundle_name,
            &[InstallState::UpdatingSuccess, InstallState::RollBack, InstallState::UserChange],
            InstallState::UpdatingSuccess,
        )?;
        if !bundles.contains_key(bundle_name) {
            return Err(Error::NotFound(format!("bundle {bundle_name}")));
        }
        let merged = merge_update(existing, new);
        self.persist(bundle_name, &merged)?;
        bundles.insert(bundle_name.to_string(), merged);
        log::info!("bundlemgr: updated {bundle_name}");
        Ok(())
    }

    /// Adds the modules of `new` to `existing`. Requires `UpdatingSuccess`.
    pub fn add_module(
        &self,
        bundle_name: &str,
        new: &BundleRecord,
        existing: &BundleRecord,
    ) -> Result<()> {
        let mut bundles = self.bundles.lock();
        self.states.lock().require(
            bundle_name,
            &[InstallState::UpdatingSuccess],
            InstallState::UpdatingSuccess,
        )?;
        if !bundles.contains_key(bundle_name) {
            return Err(Error::NotFound(format!("bundle {bundle_name}")));
        }
        let merged = merge_new_module(existing, new);
        self.persist(bundle_name, &merged)?;
        bundles.insert(bundle_name.to_string(), merged);
        Ok(())
    }

    /// Drops `package` from `existing` and replaces the stored record. Requires
    /// `UninstallStart` or `RollBack`.
    pub fn remove_module(
        &self,
        bundle_name: &str,
        package: &str,
        existing: &BundleRecord,
    ) -> Result<()> {
        let mut bundles = self.bundles.lock();
        self.states.lock().require(
            bundle_name,
            &[InstallState::UninstallStart, InstallState::RollBack],
            InstallState::UninstallStart,
        )?;
        if !bundles.contains_key(bundle_name) {
            return Err(Error::NotFound(format!("bundle {bundle_name}")));
        }
        let mut updated = existing.clone();
        if !updated.remove_module(package) {
            return Err(Error::NotFound(format!("module {package} of {bundle_name}")));
        }
        updated.status = BundleStatus::Enabled;
        self.persist(bundle_name, &updated)?;
        bundles.insert(bundle_name.to_string(), updated);
        log::info!("bundlemgr: removed module {package} of {bundle_name}");
        Ok(())
    }

    /// Copy of the stored record, visible or not.
    pub fn installed_record(&self, bundle_name: &str) -> Result<BundleRecord> {
        self.bundles
            .lock()
            .get(bundle_name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("bundle {bundle_name}")))
    }

    fn replace(
        &self,
        key: &str,
        mutate: impl FnOnce(&mut BundleRecord) -> Result<()>,
    ) -> Result<()> {
        let mut bundles = self.bundles.lock();
        let current = bundles.get(key).ok_or_else(|| Error::NotFound(format!("bundle {key}")))?;
        let mut updated = current.clone();
        mutate(&mut updated)?;
        self.persist(key, &updated)?;
        bundles.insert(key.to_string(), updated);
        Ok(())
    }

    /// Makes the bundle visible to queries again.
    pub fn enable_bundle(&self, bundle_name: &str) -> Result<()> {
        self.replace(bundle_name, |record| {
            record.status = BundleStatus::Enabled;
            Ok(())
        })
    }

    /// Hides the bundle from every query.
    pub fn disable_bundle(&self, bundle_name: &str) -> Result<()> {
        self.replace(bundle_name, |record| {
            record.status = BundleStatus::Disabled;
            Ok(())
        })
    }

    // ========================================================================
    // Module flags
    // ========================================================================

    /// Stores the upgrade flag of the module named `module_name`.
    pub fn set_module_upgrade_flag(
        &self,
        bundle_name: &str,
        module_name: &str,
        flag: i32,
    ) -> Result<()> {
        self.replace(bundle_name, |record| record.set_module_upgrade_flag(module_name, flag))
    }

    /// Upgrade flag of the module named `module_name`.
    pub fn module_upgrade_flag(&self, bundle_name: &str, module_name: &str) -> Result<i32> {
        self.visible_record(bundle_name, |record| {
            record.module_by_name(module_name).map(|module| module.upgrade_flag)
        })?
        .ok_or_else(|| Error::NotFound(format!("module {module_name} of {bundle_name}")))
    }

    /// Stores whether `user_id` may remove the module named `module_name`.
    pub fn set_module_removable(
        &self,
        bundle_name: &str,
        module_name: &str,
        user_id: i32,
        removable: bool,
    ) -> Result<()> {
        if bundle_name.is_empty() || module_name.is_empty() {
            return Err(Error::InvalidQuery);
        }
        self.users.resolve(user_id.into())?;
        self.replace(bundle_name, |record| {
            record.set_module_removable(module_name, user_id, removable)
        })?;
        log::debug!("bundlemgr: {bundle_name}/{module_name} removable={removable} for {user_id}");
        Ok(())
    }

    /// Whether `user_id` may remove the module; unset entries read false.
    pub fn is_module_removable(
        &self,
        bundle_name: &str,
        module_name: &str,
        user_id: i32,
    ) -> Result<bool> {
        if bundle_name.is_empty() || module_name.is_empty() {
            return Err(Error::InvalidQuery);
        }
        self.visible_record(bundle_name, |record| record.is_module_removable(module_name, user_id))
    }

    /// Transitive dependencies of `package`, breadth-first and without duplicates.
    pub fn all_dependent_module_names(
        &self,
        bundle_name: &str,
        package: &str,
    ) -> Result<Vec<String>> {
        self.visible_record(bundle_name, |record| record.dependent_module_names(package))
    }

    // ========================================================================
    // Identity and per-user records
    // ========================================================================

    /// Builds a per-user record with a uid derived from the bundle's id, allocating
    /// the id on first use.
    pub fn generate_user_record(&self, bundle_name: &str, user_id: i32) -> Result<UserRecord> {
        let had_id = self.identity.bundle_id_of(bundle_name).is_some();
        let bundle_id = self.identity.allocate(bundle_name)?;
        let uid = match self.identity.derive_uid(bundle_id, user_id) {
            Ok(uid) => uid,
            Err(err) => {
                if !had_id {
                    self.identity.recycle(bundle_name);
                }
                return Err(err);
            }
        };
        let mut record = UserRecord::new(user_id, uid);
        record.gids = derive_gids(uid);
        Ok(record)
    }

    /// Bundle id currently owned by `bundle_name`.
    pub fn bundle_id(&self, bundle_name: &str) -> Option<u32> {
        self.identity.bundle_id_of(bundle_name)
    }

    /// Adds or replaces the per-user record of an installed bundle.
    pub fn add_user_record(&self, bundle_name: &str, user: UserRecord) -> Result<()> {
        self.users.add(user.user_id);
        self.replace(bundle_name, |record| {
            record.users.insert(user.user_id, user);
            record.status = BundleStatus::Enabled;
            Ok(())
        })
    }

    /// Removes one user's record and its enablement snapshot.
    pub fn remove_user_record(&self, bundle_name: &str, user_id: i32) -> Result<()> {
        self.replace(bundle_name, |record| {
            if record.users.remove(&user_id).is_none() {
                return Err(Error::NotFound(format!("user {user_id} of {bundle_name}")));
            }
            record.status = BundleStatus::Enabled;
            Ok(())
        })?;
        self.drop_user_state(bundle_name, user_id);
        Ok(())
    }

    fn user_state_key(bundle_name: &str, user_id: i32) -> String {
        format!("{bundle_name}{USER_STATE_SEPARATOR}{user_id}")
    }

    fn drop_user_state(&self, bundle_name: &str, user_id: i32) {
        let key = Self::user_state_key(bundle_name, user_id);
        if let Err(err) = self.user_state_store.delete(&key) {
            log::warn!("bundlemgr: drop user state {key} failed: {err}");
        }
    }

    fn store_user_state(
        &self,
        bundle_name: &str,
        user_id: i32,
        state: &BundleUserState,
    ) -> Result<()> {
        let key = Self::user_state_key(bundle_name, user_id);
        if state.is_initial() {
            self.user_state_store.delete(&key)?;
        } else {
            self.user_state_store.put(&key, &serde_json::to_vec(state)?)?;
        }
        Ok(())
    }

    fn toggle(
        &self,
        bundle_name: &str,
        user_id: i32,
        change: impl FnOnce(&mut BundleRecord) -> Result<()>,
    ) -> Result<()> {
        let mut bundles = self.bundles.lock();
        let current = bundles
            .get(bundle_name)
            .ok_or_else(|| Error::NotFound(format!("bundle {bundle_name}")))?;
        let mut updated = current.clone();
        change(&mut updated)?;
        let state = updated
            .user_state(user_id)
            .ok_or_else(|| Error::NotFound(format!("user {user_id} of {bundle_name}")))?;
        self.store_user_state(bundle_name, user_id, &state)?;
        bundles.insert(bundle_name.to_string(), updated);
        Ok(())
    }

    /// Enables or disables the application for one user.
    pub fn set_app_enabled(&self, bundle_name: &str, user_id: i32, enabled: bool) -> Result<()> {
        self.toggle(bundle_name, user_id, |record| {
            record.set_application_enabled(user_id, enabled)
        })?;
        log::info!("bundlemgr: {bundle_name} enabled={enabled} for user {user_id}");
        Ok(())
    }

    /// Enables or disables one ability for one user.
    pub fn set_ability_enabled(
        &self,
        bundle_name: &str,
        module_name: &str,
        ability_name: &str,
        user_id: i32,
        enabled: bool,
    ) -> Result<()> {
        self.toggle(bundle_name, user_id, |record| {
            record.set_ability_enabled(module_name, ability_name, user_id, enabled)
        })
    }

    // ========================================================================
    // Sandbox, pre-install and clone bookkeeping
    // ========================================================================

    /// Records a sandbox instance, replacing one with the same index and user.
    pub fn store_sandbox_info(&self, bundle_name: &str, info: SandboxAppInfo) -> Result<()> {
        self.replace(bundle_name, |record| {
            record
                .sandbox_apps
                .retain(|app| (app.app_index, app.user_id) != (info.app_index, info.user_id));
            record.sandbox_apps.push(info);
            Ok(())
        })
    }

    /// Forgets a sandbox instance.
    pub fn delete_sandbox_info(&self, bundle_name: &str, info: SandboxAppInfo) -> Result<()> {
        self.replace(bundle_name, |record| {
            let before = record.sandbox_apps.len();
            record.sandbox_apps.retain(|app| *app != info);
            if record.sandbox_apps.len() == before {
                return Err(Error::NotFound(format!("sandbox {} of {bundle_name}", info.app_index)));
            }
            Ok(())
        })
    }

    /// Saves or replaces a pre-install entry.
    pub fn save_pre_install_info(&self, info: PreInstallBundleInfo) -> Result<()> {
        let mut table = self.pre_install.lock();
        self.pre_install_store.put(&info.bundle_name, &serde_json::to_vec(&info)?)?;
        table.insert(info.bundle_name.clone(), info);
        Ok(())
    }

    /// Deletes a pre-install entry.
    pub fn delete_pre_install_info(&self, bundle_name: &str) -> Result<()> {
        let mut table = self.pre_install.lock();
        if !table.contains_key(bundle_name) {
            return Err(Error::NotFound(format!("pre-install {bundle_name}")));
        }
        self.pre_install_store.delete(bundle_name)?;
        table.remove(bundle_name);
        Ok(())
    }

    /// Pre-install entry of `bundle_name`.
    pub fn pre_install_info(&self, bundle_name: &str) -> Option<PreInstallBundleInfo> {
        self.pre_install.lock().get(bundle_name).cloned()
    }

    /// Every pre-install entry.
    pub fn all_pre_install_infos(&self) -> Vec<PreInstallBundleInfo> {
        self.pre_install.lock().values().cloned().collect()
    }

    /// Key of an installed clone of `bundle_name`.
    pub fn cloned_bundle_name(&self, bundle_name: &str) -> Option<String> {
        self.bundles
            .lock()
            .keys()
            .find(|key| key.as_str() != bundle_name && base_name(key) == bundle_name)
            .cloned()
    }

    /// Advisory lock serializing long operations on one bundle.
    pub fn bundle_mutex(&self, bundle_name: &str) -> Arc<Mutex<()>> {
        Arc::clone(self.bundle_locks.lock().entry(bundle_name.to_string()).or_default())
    }

    // ========================================================================
    // Users
    // ========================================================================

    /// Registers a user id.
    pub fn add_user_id(&self, user_id: i32) {
        self.users.add(user_id);
    }

    /// Unregisters a user id.
    pub fn remove_user_id(&self, user_id: i32) {
        self.users.remove(user_id);
    }

    /// True when `user_id` is registered.
    pub fn has_user_id(&self, user_id: i32) -> bool {
        self.users.contains(user_id)
    }

    /// Every registered user id.
    pub fn all_users(&self) -> Vec<i32> {
        self.users.all().into_iter().collect()
    }

    // ========================================================================
    // Lookups
    // ========================================================================

    fn hidden(&self, bundles: &BTreeMap<String, BundleRecord>) -> HashSet<String> {
        let states = self.states.lock();
        bundles
            .keys()
            .filter(|name| !states.has_succeeded(name))
            .cloned()
            .collect()
    }

    fn with_resolver<T>(
        &self,
        selector: UserSelector,
        query: impl FnOnce(&CapabilityResolver<'_>, UserSelector) -> Result<T>,
    ) -> Result<T> {
        let selector = self.users.resolve(selector)?;
        let bundles = self.bundles.lock();
        let hidden = self.hidden(&bundles);
        query(&CapabilityResolver::new(&bundles).hiding(hidden), selector)
    }

    fn visible_record<T>(
        &self,
        bundle_name: &str,
        read: impl FnOnce(&BundleRecord) -> T,
    ) -> Result<T> {
        let bundles = self.bundles.lock();
        let hidden = self.hidden(&bundles);
        bundles
            .get(bundle_name)
            .filter(|record| !hidden.contains(bundle_name) && !record.is_disabled())
            .map(read)
            .ok_or_else(|| Error::NotFound(format!("bundle {bundle_name}")))
    }

    fn uid_owner<T>(&self, uid: i32, read: impl FnOnce(&BundleRecord) -> T) -> Option<T> {
        let user_id = self.identity.user_of_uid(uid);
        let bundles = self.bundles.lock();
        let hidden = self.hidden(&bundles);
        bundles
            .values()
            .filter(|record| !hidden.contains(&record.bundle_name) && !record.is_disabled())
            .find(|record| record.uid(user_id) == Some(uid))
            .map(read)
    }

    /// Bundle that runs under `uid`.
    pub fn bundle_name_for_uid(&self, uid: i32) -> Result<String> {
        self.uid_owner(uid, |record| record.bundle_name.clone())
            .ok_or_else(|| Error::NotFound(format!("uid {uid}")))
    }

    /// Bundles sharing `uid`; a uid is never shared so this holds at most one name.
    pub fn bundles_for_uid(&self, uid: i32) -> Result<Vec<String>> {
        Ok(vec![self.bundle_name_for_uid(uid)?])
    }

    /// Supplementary groups of the bundle's first per-user record.
    pub fn bundle_gids(&self, bundle_name: &str) -> Result<Vec<i32>> {
        self.visible_record(bundle_name, |record| {
            record.users.values().next().map(|user| user.gids.clone())
        })?
        .ok_or_else(|| Error::NotFound(format!("gids of {bundle_name}")))
    }

    /// Signing identity of the bundle.
    pub fn provision_id(&self, bundle_name: &str) -> Result<String> {
        self.visible_record(bundle_name, |record| record.provision_id.clone())
    }

    /// Compares the signing identities of two stored bundles, visible or not.
    pub fn check_public_keys(&self, first: &str, second: &str) -> SignatureCompare {
        if first.is_empty() || second.is_empty() {
            return SignatureCompare::UnknownBundle;
        }
        let bundles = self.bundles.lock();
        match (bundles.get(first), bundles.get(second)) {
            (Some(a), Some(b)) if a.provision_id == b.provision_id => SignatureCompare::Matched,
            (Some(_), Some(_)) => SignatureCompare::NotMatched,
            _ => {
                log::warn!("bundlemgr: cannot compare signatures of {first} and {second}");
                SignatureCompare::UnknownBundle
            }
        }
    }

    /// Feature tag of the bundle.
    pub fn app_feature(&self, bundle_name: &str) -> Result<String> {
        self.visible_record(bundle_name, |record| record.app_feature.clone())
    }

    /// Privilege level of the bundle.
    pub fn app_privilege_level(&self, bundle_name: &str) -> Result<String> {
        self.visible_record(bundle_name, |record| record.app_privilege_level.clone())
    }

    /// True once the bundle reached `InstallSuccess` and has not moved on since.
    pub fn is_app_or_ability_installed(&self, bundle_name: &str) -> bool {
        self.install_state(bundle_name) == Some(InstallState::InstallSuccess)
    }

    /// Application enablement as seen by `selector`.
    pub fn is_application_enabled(
        &self,
        bundle_name: &str,
        selector: UserSelector,
    ) -> Result<bool> {
        let selector = self.users.resolve(selector)?;
        self.visible_record(bundle_name, |record| {
            record.is_app_enabled(record.response_user(selector))
        })
    }

    /// True for configured system uids and for uids owned by visible, enabled system apps.
    pub fn is_system_app_by_uid(&self, uid: i32) -> bool {
        if self.config.system_uids.contains(&uid) {
            return true;
        }
        self.uid_owner(uid, BundleRecord::is_system_app).unwrap_or(false)
    }

    // ========================================================================
    // Listings and queries
    // ========================================================================

    /// Names of the bundles visible to `selector`.
    pub fn bundle_list(&self, selector: UserSelector) -> Result<Vec<String>> {
        self.with_resolver(selector, |resolver, selector| {
            Ok(resolver
                .bundle_infos(&ProjectionOptions::default(), selector)
                .into_iter()
                .map(|record| record.bundle_name)
                .collect())
        })
    }

    /// Shaped snapshot of one bundle.
    pub fn bundle_info(
        &self,
        bundle_name: &str,
        flags: QueryFlags,
        selector: UserSelector,
    ) -> Result<BundleRecord> {
        let options = ProjectionOptions::from(flags);
        self.with_resolver(selector, |resolver, selector| {
            resolver.bundle_info(bundle_name, &options, selector)
        })
    }

    /// Shaped snapshots of every bundle visible to `selector`.
    pub fn bundle_infos(
        &self,
        flags: QueryFlags,
        selector: UserSelector,
    ) -> Result<Vec<BundleRecord>> {
        let options = ProjectionOptions::from(flags);
        self.with_resolver(selector, |resolver, selector| {
            Ok(resolver.bundle_infos(&options, selector))
        })
    }

    /// Application fields of one bundle.
    pub fn application_info(
        &self,
        bundle_name: &str,
        flags: QueryFlags,
        selector: UserSelector,
    ) -> Result<ApplicationInfo> {
        let options = ProjectionOptions::from(flags);
        self.with_resolver(selector, |resolver, selector| {
            resolver.application_info(bundle_name, &options, selector)
        })
    }

    /// Application fields of every bundle visible to `selector`.
    pub fn application_infos(
        &self,
        flags: QueryFlags,
        selector: UserSelector,
    ) -> Result<Vec<ApplicationInfo>> {
        let options = ProjectionOptions::from(flags);
        self.with_resolver(selector, |resolver, selector| {
            Ok(resolver.application_infos(&options, selector))
        })
    }

    /// Abilities satisfying `want`, best first.
    pub fn query_abilities(
        &self,
        want: &Want,
        flags: QueryFlags,
        selector: UserSelector,
    ) -> Result<Vec<AbilityInfo>> {
        let options = ProjectionOptions::from(flags);
        self.with_resolver(selector, |resolver, selector| {
            resolver.query_abilities(want, &options, selector)
        })
    }

    /// Best ability satisfying `want`.
    pub fn query_ability(
        &self,
        want: &Want,
        flags: QueryFlags,
        selector: UserSelector,
    ) -> Result<AbilityInfo> {
        let options = ProjectionOptions::from(flags);
        self.with_resolver(selector, |resolver, selector| {
            resolver.query_ability(want, &options, selector)
        })
    }

    /// Extensions satisfying `want`, best first.
    pub fn query_extensions(
        &self,
        want: &Want,
        flags: QueryFlags,
        selector: UserSelector,
    ) -> Result<Vec<ExtensionInfo>> {
        let options = ProjectionOptions::from(flags);
        self.with_resolver(selector, |resolver, selector| {
            resolver.query_extensions(want, &options, selector)
        })
    }

    /// Extensions of one type.
    pub fn query_extensions_by_type(
        &self,
        extension_type: ExtensionType,
        selector: UserSelector,
    ) -> Result<Vec<ExtensionInfo>> {
        self.with_resolver(selector, |resolver, selector| {
            Ok(resolver.extensions_by_type(extension_type, selector))
        })
    }

    /// Single best ability or extension for `want`.
    pub fn resolve_by_priority(
        &self,
        want: &Want,
        flags: QueryFlags,
        selector: UserSelector,
    ) -> Result<Resolved> {
        let options = ProjectionOptions::from(flags);
        self.with_resolver(selector, |resolver, selector| {
            resolver.resolve_by_priority(want, &options, selector)
        })
    }

    /// Launcher entries matching `want` on action and entities.
    pub fn query_launcher_abilities(
        &self,
        want: &Want,
        selector: UserSelector,
    ) -> Result<Vec<AbilityInfo>> {
        self.with_resolver(selector, |resolver, selector| {
            resolver.launcher_abilities(want, selector)
        })
    }

    /// Data ability addressed by `uri`.
    pub fn query_ability_by_uri(
        &self,
        uri: &str,
        flags: QueryFlags,
        selector: UserSelector,
    ) -> Result<AbilityInfo> {
        let options = ProjectionOptions::from(flags);
        self.with_resolver(selector, |resolver, selector| {
            resolver.ability_by_uri(uri, &options, selector)
        })
    }

    /// Extension whose declared uri matches the authority of `uri`.
    pub fn query_extension_by_uri(
        &self,
        uri: &str,
        selector: UserSelector,
    ) -> Result<ExtensionInfo> {
        self.with_resolver(selector, |resolver, selector| resolver.extension_by_uri(uri, selector))
    }

    /// Keep-alive bundles shaped for `selector`; an empty result is [`Error::NotFound`].
    pub fn query_keep_alive_bundle_infos(
        &self,
        selector: UserSelector,
    ) -> Result<Vec<BundleRecord>> {
        let found = self.with_resolver(selector, |resolver, selector| {
            Ok(resolver.keep_alive_bundles(selector))
        })?;
        if found.is_empty() {
            return Err(Error::NotFound("keep-alive bundles".into()));
        }
        Ok(found)
    }

    /// Want that starts the main ability of `bundle_name`.
    pub fn launch_want_for_bundle(
        &self,
        bundle_name: &str,
        selector: UserSelector,
    ) -> Result<Want> {
        self.with_resolver(selector, |resolver, selector| {
            resolver.launch_want(bundle_name, selector)
        })
    }

    // ========================================================================
    // Notification
    // ========================================================================

    /// Subscribes `callback` to status changes of `bundle_name`.
    pub fn register_status_callback(
        &self,
        bundle_name: impl Into<String>,
        callback: Arc<dyn StatusCallback>,
    ) -> SubscriberId {
        self.callbacks.subscribe(bundle_name, callback)
    }

    /// Drops one subscription.
    pub fn unregister_status_callback(&self, id: SubscriberId) -> bool {
        self.callbacks.unsubscribe(id)
    }

    /// Drops every subscription.
    pub fn clear_status_callbacks(&self) {
        self.callbacks.clear();
    }

    /// Handles the death of a subscriber's channel.
    pub fn on_subscriber_disconnected(&self, id: SubscriberId) -> bool {
        self.callbacks.on_disconnect(id)
    }

    /// Delivers a status change to subscribers and, on success, publishes one event.
    pub fn notify(
        &self,
        bundle_name: &str,
        module_name: &str,
        ability_name: &str,
        result_code: i32,
        notify_type: NotifyType,
        uid: i32,
    ) {
        let install_type = notify_type.install_type();
        let delivered = self.callbacks.dispatch(install_type, result_code, bundle_name);
        log::debug!("bundlemgr: {notify_type:?} for {bundle_name} reached {delivered} subscribers");
        if result_code != RESULT_OK {
            return;
        }
        self.sink.publish(BundleEvent {
            kind: notify_type.event_kind(),
            bundle_name: bundle_name.to_string(),
            module_name: module_name.to_string(),
            ability_name: ability_name.to_string(),
            uid,
            user_id: self.identity.user_of_uid(uid),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::recording::RecordingCallback;
    use crate::events::{EventKind, InstallType, MemorySink};
    use crate::fs::MemoryFs;
    use crate::record::fixtures::{ability, record};
    use crate::record::InstallPhase;
    use crate::skill::Skill;

    const USER: i32 = 100;

    struct Harness {
        registry: BundleRegistry,
        store: Arc<MemoryStore>,
        user_states: Arc<MemoryStore>,
        sink: Arc<MemorySink>,
    }

    fn harness() -> Harness {
        harness_with(Arc::new(MemoryStore::new()))
    }

    fn harness_with(store: Arc<MemoryStore>) -> Harness {
        let user_states = Arc::new(MemoryStore::new());
        let sink = Arc::new(MemorySink::new());
        let collaborators = Collaborators {
            store: store.clone(),
            user_state_store: user_states.clone(),
            pre_install_store: Arc::new(MemoryStore::new()),
            fs: Arc::new(MemoryFs::new()),
            sink: sink.clone(),
            namespace: Arc::new(NoopNamespace),
        };
        let registry = BundleRegistry::new(StoreConfig::default(), collaborators);
        registry.add_user_id(USER);
        Harness { registry, store, user_states, sink }
    }

    fn view_skill() -> Skill {
        Skill { actions: vec!["action.view".into()], ..Skill::default() }
    }

    fn install(registry: &BundleRegistry, name: &str) -> BundleRecord {
        registry.begin_install(name).expect("begin");
        let mut rec = record(name, &[("entry", true)]);
        rec.add_ability(ability("entry", "Main", 10), vec![view_skill()]).expect("entry");
        rec.users.insert(USER, registry.generate_user_record(name, USER).expect("uid"));
        registry.commit_install(name, rec.clone()).expect("commit");
        registry.apply(name, InstallState::InstallSuccess).expect("success");
        rec
    }

    #[test]
    fn install_becomes_visible_after_success() {
        let h = harness();
        h.registry.begin_install("com.a").expect("begin");
        let mut rec = record("com.a", &[("entry", true)]);
        rec.add_ability(ability("entry", "Main", 10), vec![view_skill()]).expect("entry");
        rec.users.insert(USER, h.registry.generate_user_record("com.a", USER).expect("uid"));
        h.registry.commit_install("com.a", rec).expect("commit");

        let want = Want::new().with_action("action.view");
        assert!(h.registry.query_abilities(&want, QueryFlags::empty(), USER.into()).is_err());
        assert!(!h.registry.is_app_or_ability_installed("com.a"));

        h.registry.apply("com.a", InstallState::InstallSuccess).expect("success");
        let found = h.registry.query_abilities(&want, QueryFlags::empty(), USER.into()).expect("q");
        assert_eq!(found[0].name, "Main");
        assert!(h.registry.is_app_or_ability_installed("com.a"));
        assert_eq!(h.store.put_count(), 1);
    }

    #[test]
    fn commit_install_requires_install_start() {
        let h = harness();
        let rec = record("com.a", &[("entry", true)]);
        assert!(matches!(
            h.registry.commit_install("com.a", rec),
            Err(Error::InvalidTransition { from: None, .. })
        ));
        install(&h.registry, "com.b");
        h.registry.apply("com.b", InstallState::UpdatingStart).expect("updating");
        h.registry.apply("com.b", InstallState::InstallStart).expect_err("not a predecessor");
        assert_eq!(h.store.put_count(), 1);
    }

    #[test]
    fn update_from_install_success_is_rejected() {
        let h = harness();
        let existing = install(&h.registry, "com.app.a");
        let mut new = record("com.app.a", &[("entry", true)]);
        new.base.version_code = 2;
        assert!(matches!(
            h.registry.commit_update("com.app.a", &new, &existing),
            Err(Error::InvalidTransition { from: Some(InstallState::InstallSuccess), .. })
        ));
        assert_eq!(h.registry.installed_record("com.app.a").expect("kept"), existing);

        h.registry.apply("com.app.a", InstallState::UpdatingStart).expect("start");
        h.registry.apply("com.app.a", InstallState::UpdatingSuccess).expect("success");
        h.registry.commit_update("com.app.a", &new, &existing).expect("update");
        assert_eq!(h.registry.installed_record("com.app.a").expect("rec").base.version_code, 2);
    }

    #[test]
    fn failed_put_leaves_registry_untouched() {
        let h = harness();
        let existing = install(&h.registry, "com.a");
        h.registry.apply("com.a", InstallState::UpdatingStart).expect("start");
        h.registry.apply("com.a", InstallState::UpdatingSuccess).expect("success");
        h.store.set_fail_put(true);

        let mut new = record("com.a", &[("entry", true)]);
        new.base.version_code = 9;
        assert!(matches!(
            h.registry.commit_update("com.a", &new, &existing),
            Err(Error::PersistenceFailure(_))
        ));
        assert!(h.registry.disable_bundle("com.a").is_err());
        assert!(h.registry.remove_user_record("com.a", USER).is_err());
        assert_eq!(h.registry.installed_record("com.a").expect("kept"), existing);
    }

    #[test]
    fn uninstall_purges_everything() {
        let h = harness();
        install(&h.registry, "com.a");
        let bundle_id = h.registry.bundle_id("com.a").expect("id");
        h.registry.set_app_enabled("com.a", USER, false).expect("toggle");
        assert_eq!(h.user_states.keys(), vec!["com.a_100".to_string()]);

        h.registry.apply("com.a", InstallState::UninstallStart).expect("start");
        h.registry.apply("com.a", InstallState::UninstallSuccess).expect("done");
        assert_eq!(h.store.delete_count(), 1);
        assert!(h.store.keys().is_empty());
        assert!(h.user_states.keys().is_empty());
        assert!(h.registry.installed_record("com.a").is_err());
        assert_eq!(h.registry.install_state("com.a"), None);

        install(&h.registry, "com.b");
        assert_eq!(h.registry.bundle_id("com.b"), Some(bundle_id));
    }

    #[test]
    fn failed_delete_aborts_cascade() {
        let h = harness();
        install(&h.registry, "com.a");
        h.registry.apply("com.a", InstallState::UninstallStart).expect("start");
        h.store.set_fail_delete(true);
        assert!(matches!(
            h.registry.apply("com.a", InstallState::UninstallSuccess),
            Err(Error::PersistenceFailure(_))
        ));
        assert_eq!(h.registry.install_state("com.a"), Some(InstallState::UninstallStart));
        assert!(h.registry.installed_record("com.a").is_ok());
        assert!(h.registry.bundle_id("com.a").is_some());
    }

    #[test]
    fn install_fail_without_record_only_recycles() {
        let h = harness();
        h.registry.begin_install("com.a").expect("begin");
        h.registry.generate_user_record("com.a", USER).expect("uid");
        h.registry.apply("com.a", InstallState::InstallFail).expect("fail");
        assert_eq!(h.store.delete_count(), 0);
        assert_eq!(h.registry.bundle_id("com.a"), None);
    }

    #[test]
    fn remove_module_needs_uninstall_state() {
        let h = harness();
        let mut existing = install(&h.registry, "com.a");
        h.registry.apply("com.a", InstallState::UpdatingStart).expect("start");
        h.registry.apply("com.a", InstallState::UpdatingSuccess).expect("success");
        let feature = record("com.a", &[("feature", false)]);
        h.registry.add_module("com.a", &feature, &existing).expect("add");
        existing = h.registry.installed_record("com.a").expect("rec");
        assert_eq!(existing.modules.len(), 2);

        assert!(h.registry.remove_module("com.a", "feature", &existing).is_err());
        h.registry.apply("com.a", InstallState::UninstallStart).expect("uninstall");
        assert!(matches!(
            h.registry.remove_module("com.a", "missing", &existing),
            Err(Error::NotFound(_))
        ));
        h.registry.remove_module("com.a", "feature", &existing).expect("remove");
        assert_eq!(h.registry.installed_record("com.a").expect("rec").modules.len(), 1);
    }

    #[test]
    fn toggles_write_compact_snapshots() {
        let h = harness();
        install(&h.registry, "com.a");
        let puts = h.store.put_count();

        h.registry.set_ability_enabled("com.a", "", "Main", USER, false).expect("off");
        let want = Want::new().with_action("action.view");
        assert!(h.registry.query_abilities(&want, QueryFlags::empty(), USER.into()).is_err());
        assert!(h
            .registry
            .query_abilities(&want, QueryFlags::WITH_DISABLE, USER.into())
            .is_ok());
        h.registry.set_ability_enabled("com.a", "", "Main", USER, true).expect("on");

        assert_eq!(h.store.put_count(), puts);
        assert!(h.user_states.keys().is_empty());
        assert!(matches!(
            h.registry.set_ability_enabled("com.a", "", "Nope", USER, false),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            h.registry.set_app_enabled("com.a", 7, false),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn unregistered_user_is_rejected() {
        let h = harness();
        install(&h.registry, "com.a");
        let want = Want::new().with_action("action.view");
        assert_eq!(
            h.registry.query_abilities(&want, QueryFlags::empty(), 555.into()),
            Err(Error::InvalidUser(555))
        );
        assert!(h.registry.bundle_list(UserSelector::All).is_ok());
        assert!(h.registry.is_application_enabled("com.a", 555.into()).is_err());
        assert!(h.registry.is_application_enabled("com.a", USER.into()).expect("enabled"));
    }

    #[test]
    fn uid_lookups() {
        let h = harness();
        let rec = install(&h.registry, "com.a");
        let uid = rec.users[&USER].uid;
        assert_eq!(h.registry.bundle_name_for_uid(uid).expect("owner"), "com.a");
        assert_eq!(h.registry.bundle_gids("com.a").expect("gids"), vec![uid]);
        assert!(h.registry.is_system_app_by_uid(1000));
        assert!(!h.registry.is_system_app_by_uid(uid));
        assert!(h.registry.bundle_name_for_uid(uid + 1).is_err());
        assert_eq!(h.registry.app_privilege_level("com.a").expect("level"), "normal");

        h.registry.disable_bundle("com.a").expect("disable");
        assert!(h.registry.provision_id("com.a").is_err());
        assert!(h.registry.bundle_list(USER.into()).expect("list").is_empty());
        h.registry.enable_bundle("com.a").expect("enable");
        assert_eq!(h.registry.bundle_list(USER.into()).expect("list"), vec!["com.a".to_string()]);
    }

    #[test]
    fn notify_dispatches_then_publishes_on_success() {
        let h = harness();
        let cb = Arc::new(RecordingCallback::default());
        let id = h.registry.register_status_callback("com.a", cb.clone());

        h.registry.notify("com.a", "entry", "", RESULT_OK, NotifyType::Install, 20_010_000);
        h.registry.notify("com.a", "entry", "", 8, NotifyType::UninstallBundle, 20_010_000);
        assert_eq!(
            cb.seen.lock().as_slice(),
            &[
                (InstallType::InstallCallback, RESULT_OK, "com.a".to_string()),
                (InstallType::UninstallCallback, 8, "com.a".to_string()),
            ]
        );
        let events = h.sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::PackageAdded);
        assert_eq!(events[0].user_id, USER);

        assert!(h.registry.on_subscriber_disconnected(id));
        assert!(!h.registry.unregister_status_callback(id));
    }

    #[test]
    fn load_restores_identity_and_snapshots() {
        let store = Arc::new(MemoryStore::new());
        let first = harness_with(store.clone());
        let rec = install(&first.registry, "com.a");
        first.registry.set_app_enabled("com.a", USER, false).expect("toggle");
        let snapshot = first.user_states.get("com.a_100").expect("snapshot");

        let mut interrupted = record("com.b", &[("entry", true)]);
        interrupted.set_install_mark("entry", InstallPhase::InstallStart);
        store.insert_raw("com.b", &serde_json::to_vec(&interrupted).expect("encode"));
        store.insert_raw("com.c", b"not json");

        let second = harness_with(store.clone());
        second.user_states.insert_raw("com.a_100", &snapshot);
        let report = second.registry.load_all().expect("load");
        assert_eq!(report, LoadReport { loaded: 1, corrupt: 1, skipped: 1 });
        assert!(store.get("com.b").is_none());
        assert_eq!(second.registry.bundle_id("com.a"), first.registry.bundle_id("com.a"));
        assert_eq!(second.registry.install_state("com.a"), Some(InstallState::InstallSuccess));
        let restored = second.registry.installed_record("com.a").expect("rec");
        assert!(!restored.is_app_enabled(Some(USER)));
        assert!(second.registry.has_user_id(USER));
        assert_ne!(
            second.registry.generate_user_record("com.z", USER).expect("uid").uid,
            rec.users[&USER].uid
        );
    }

    #[test]
    fn pre_install_sandbox_and_clones() {
        let h = harness();
        let info = PreInstallBundleInfo { bundle_name: "com.sys".into(), ..Default::default() };
        h.registry.save_pre_install_info(info.clone()).expect("save");
        assert_eq!(h.registry.pre_install_info("com.sys"), Some(info));
        h.registry.delete_pre_install_info("com.sys").expect("delete");
        assert!(h.registry.all_pre_install_infos().is_empty());
        assert!(h.registry.delete_pre_install_info("com.sys").is_err());

        install(&h.registry, "com.a");
        let sandbox = SandboxAppInfo { app_index: 1, user_id: USER, token_id: 7 };
        h.registry.store_sandbox_info("com.a", sandbox).expect("store");
        h.registry.store_sandbox_info("com.a", sandbox).expect("replace");
        assert_eq!(h.registry.installed_record("com.a").expect("rec").sandbox_apps.len(), 1);
        h.registry.delete_sandbox_info("com.a", sandbox).expect("delete");
        assert!(h.registry.delete_sandbox_info("com.a", sandbox).is_err());

        let clone = crate::record::clone_key("com.a", "1");
        install(&h.registry, &clone);
        assert_eq!(h.registry.cloned_bundle_name("com.a"), Some(clone));
        assert_eq!(h.registry.cloned_bundle_name("com.b"), None);
    }

    #[test]
    fn never_succeeded_bundles_stay_hidden() {
        let h = harness();
        let want = Want::new().with_action("action.view");
        for (name, next) in
            [("com.a", InstallState::UninstallStart), ("com.b", InstallState::UpdatingStart)]
        {
            h.registry.begin_install(name).expect("begin");
            let mut rec = record(name, &[("entry", true)]);
            rec.add_ability(ability("entry", "Main", 10), vec![view_skill()]).expect("entry");
            let user = h.registry.generate_user_record(name, USER).expect("uid");
            let uid = user.uid;
            rec.users.insert(USER, user);
            h.registry.commit_install(name, rec).expect("commit");
            h.registry.apply(name, next).expect("moved on");

            assert!(h.registry.query_abilities(&want, QueryFlags::empty(), USER.into()).is_err());
            assert!(h.registry.bundle_info(name, QueryFlags::empty(), USER.into()).is_err());
            assert!(h.registry.bundle_name_for_uid(uid).is_err());
            assert!(h.registry.bundle_list(USER.into()).expect("list").is_empty());
        }

        h.registry.apply("com.b", InstallState::UpdatingSuccess).expect("success");
        let found = h.registry.query_abilities(&want, QueryFlags::empty(), USER.into()).expect("q");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].bundle_name, "com.b");
        h.registry.apply("com.b", InstallState::UninstallStart).expect("uninstall");
        assert!(h.registry.bundle_info("com.b", QueryFlags::empty(), USER.into()).is_ok());
    }

    #[test]
    fn user_beyond_uid_space_is_rejected() {
        let h = harness();
        h.registry.add_user_id(20_000);
        assert_eq!(
            h.registry.generate_user_record("com.a", 20_000),
            Err(Error::InvalidUser(20_000))
        );
        assert_eq!(h.registry.bundle_id("com.a"), None);

        install(&h.registry, "com.b");
        assert_eq!(
            h.registry.generate_user_record("com.b", 20_000),
            Err(Error::InvalidUser(20_000))
        );
        assert_eq!(h.registry.bundle_id("com.b"), Some(10_000));
    }

    #[test]
    fn system_uid_check_skips_hidden_and_disabled() {
        let h = harness();
        h.registry.begin_install("com.sys").expect("begin");
        let mut rec = record("com.sys", &[("entry", true)]);
        rec.application.is_system_app = true;
        let user = h.registry.generate_user_record("com.sys", USER).expect("uid");
        let uid = user.uid;
        rec.users.insert(USER, user);
        h.registry.commit_install("com.sys", rec).expect("commit");
        assert!(!h.registry.is_system_app_by_uid(uid));

        h.registry.apply("com.sys", InstallState::InstallSuccess).expect("success");
        assert!(h.registry.is_system_app_by_uid(uid));
        assert_eq!(h.registry.bundles_for_uid(uid).expect("owner"), vec!["com.sys".to_string()]);

        h.registry.disable_bundle("com.sys").expect("disable");
        assert!(!h.registry.is_system_app_by_uid(uid));
        assert!(h.registry.bundles_for_uid(uid).is_err());
    }

    #[test]
    fn user_record_changes_reenable_the_bundle() {
        let h = harness();
        install(&h.registry, "com.a");
        h.registry.add_user_id(101);

        h.registry.disable_bundle("com.a").expect("disable");
        let other = h.registry.generate_user_record("com.a", 101).expect("uid");
        h.registry.add_user_record("com.a", other).expect("add");
        let status = h.registry.installed_record("com.a").expect("rec").status;
        assert_eq!(status, BundleStatus::Enabled);

        h.registry.disable_bundle("com.a").expect("disable");
        h.registry.remove_user_record("com.a", 101).expect("remove");
        let status = h.registry.installed_record("com.a").expect("rec").status;
        assert_eq!(status, BundleStatus::Enabled);
        assert!(h.registry.remove_user_record("com.a", 101).is_err());
    }

    #[test]
    fn module_flags_are_write_ahead() {
        let h = harness();
        install(&h.registry, "com.a");
        assert_eq!(h.registry.module_upgrade_flag("com.a", "entry"), Ok(0));
        h.registry.set_module_upgrade_flag("com.a", "entry", 1).expect("flag");
        assert_eq!(h.registry.module_upgrade_flag("com.a", "entry"), Ok(1));
        assert!(h.registry.set_module_upgrade_flag("com.a", "ghost", 1).is_err());
        assert!(h.registry.module_upgrade_flag("com.a", "ghost").is_err());

        assert_eq!(h.registry.is_module_removable("com.a", "entry", USER), Ok(false));
        h.registry.set_module_removable("com.a", "entry", USER, true).expect("removable");
        assert_eq!(h.registry.is_module_removable("com.a", "entry", USER), Ok(true));
        assert_eq!(
            h.registry.set_module_removable("com.a", "", USER, true),
            Err(Error::InvalidQuery)
        );
        assert_eq!(
            h.registry.set_module_removable("com.a", "entry", 555, true),
            Err(Error::InvalidUser(555))
        );

        h.store.set_fail_put(true);
        assert!(matches!(
            h.registry.set_module_removable("com.a", "entry", USER, false),
            Err(Error::PersistenceFailure(_))
        ));
        assert!(h.registry.set_module_upgrade_flag("com.a", "entry", 2).is_err());
        assert_eq!(h.registry.is_module_removable("com.a", "entry", USER), Ok(true));
        assert_eq!(h.registry.module_upgrade_flag("com.a", "entry"), Ok(1));

        h.store.set_fail_put(false);
        h.registry.set_module_upgrade_flag("com.a", "entry", 2).expect("flag");
        let blob = h.store.get("com.a").expect("stored");
        let stored: BundleRecord = serde_json::from_slice(&blob).expect("decode");
        let module = stored.module_by_name("entry").expect("entry");
        assert_eq!((module.upgrade_flag, module.removable.get(&USER)), (2, Some(&true)));
    }

    #[test]
    fn dependencies_signatures_and_launch() {
        let h = harness();
        h.registry.begin_install("com.a").expect("begin");
        let mut rec = record("com.a", &[("entry", true), ("lib", false)]);
        rec.add_ability(ability("entry", "Main", 10), vec![view_skill()]).expect("entry");
        rec.modules.get_mut("entry").expect("entry").dependencies = vec!["lib".into()];
        rec.provision_id = "p1".into();
        rec.base.keep_alive = true;
        rec.users.insert(USER, h.registry.generate_user_record("com.a", USER).expect("uid"));
        h.registry.commit_install("com.a", rec).expect("commit");
        assert_eq!(h.registry.check_public_keys("com.a", "com.a"), SignatureCompare::Matched);
        assert!(h.registry.query_keep_alive_bundle_infos(USER.into()).is_err());
        h.registry.apply("com.a", InstallState::InstallSuccess).expect("success");

        assert_eq!(
            h.registry.all_dependent_module_names("com.a", "entry").expect("deps"),
            vec!["lib".to_string()]
        );
        assert!(h.registry.all_dependent_module_names("com.a", "ghost").expect("deps").is_empty());
        assert!(h.registry.all_dependent_module_names("com.x", "entry").is_err());

        install(&h.registry, "com.b");
        assert_eq!(h.registry.check_public_keys("com.a", "com.b"), SignatureCompare::NotMatched);
        assert_eq!(h.registry.check_public_keys("com.a", ""), SignatureCompare::UnknownBundle);
        assert_eq!(h.registry.check_public_keys("com.a", "com.x"), SignatureCompare::UnknownBundle);

        let alive = h.registry.query_keep_alive_bundle_infos(USER.into()).expect("alive");
        assert_eq!(alive.len(), 1);
        assert_eq!(alive[0].bundle_name, "com.a");

        let want = h.registry.launch_want_for_bundle("com.a", USER.into()).expect("want");
        assert_eq!(want.element.ability_name, "Main");
        assert_eq!(want.action, crate::skill::ACTION_HOME);
        assert_eq!(
            h.registry.launch_want_for_bundle("com.a", 555.into()),
            Err(Error::InvalidUser(555))
        );
    }

    #[test]
    fn bundle_mutex_is_shared_per_name() {
        let h = harness();
        let a = h.registry.bundle_mutex("com.a");
        let again = h.registry.bundle_mutex("com.a");
        let b = h.registry.bundle_mutex("com.b");
        assert!(Arc::ptr_eq(&a, &again));
        assert!(!Arc::ptr_eq(&a, &b));
        let _held = a.lock();
        assert!(b.try_lock().is_some());
    }
}

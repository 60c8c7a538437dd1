// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Bundle metadata model persisted by the registry
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: Unit tests for module bookkeeping, module flags, per-user state and merge
//!
//! PUBLIC API:
//!   - BundleRecord: one installed bundle, serialized as the storage blob
//!   - UserRecord / BundleUserState: per-user uid, enablement and its compact snapshot
//!   - PreInstallBundleInfo: system image bundles, kept in their own table
//!   - merge_update / merge_new_module: pure merge of an existing record with a new package
//!
//! Ability and extension keys are `<bundle>.<package>.<name>`; every ability,
//! extension and skill entry belongs to exactly one module in `modules`.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use semver::Version;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::skill::Skill;
use crate::user::{UserSelector, START_USERID};

/// Prefix of data ability uris.
pub const DATA_ABILITY_URI_PREFIX: &str = "dataability://";
const URI_PATH_SEPARATOR: char = '/';
const PARAM_URI_SEPARATOR: &str = ":///";
const URI_SEPARATOR: &str = "://";
const CLONE_SEPARATOR: char = '#';

/// Builds the storage key of a cloned bundle instance.
pub fn clone_key(bundle_name: &str, suffix: &str) -> String {
    format!("{bundle_name}{CLONE_SEPARATOR}{suffix}")
}

/// Returns the bundle name a (possibly cloned) storage key belongs to.
pub fn base_name(key: &str) -> &str {
    key.split_once(CLONE_SEPARATOR).map_or(key, |(name, _)| name)
}

/// Bundle-wide enablement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BundleStatus {
    /// Visible to queries.
    #[default]
    Enabled,
    /// Hidden from every query.
    Disabled,
}

/// Recovery checkpoint of an interrupted operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstallPhase {
    /// No operation in flight.
    #[default]
    Finished,
    /// First install started.
    InstallStart,
    /// In-place module replacement started.
    UpdatingExistingStart,
    /// New module addition started.
    UpdatingNewStart,
    /// Module staged, awaiting rename into place.
    UpdatingFinish,
    /// Whole-bundle uninstall started.
    UninstallBundleStart,
    /// Single-module uninstall started.
    UninstallPackageStart,
    /// Phase written by a newer or corrupted store.
    #[serde(other)]
    Unknown,
}

/// Install mark persisted with the record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallMark {
    /// Bundle the mark refers to.
    pub bundle_name: String,
    /// Module package the operation targets.
    pub package_name: String,
    /// Checkpoint reached.
    pub phase: InstallPhase,
}

/// Installer classification of a bundle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppType {
    /// Shipped with the system image.
    SystemApp,
    /// Third-party app signed as system.
    ThirdSystemApp,
    /// Regular third-party app.
    #[default]
    ThirdPartyApp,
}

/// Name/value metadata entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    /// Entry name.
    pub name: String,
    /// Entry value.
    pub value: String,
    /// Optional resource reference.
    #[serde(default)]
    pub resource: String,
}

/// Application-level fields, also used as the user-scoped projection attached to
/// query results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationInfo {
    /// Owning bundle.
    pub bundle_name: String,
    /// Display label.
    #[serde(default)]
    pub label: String,
    /// Vendor string.
    #[serde(default)]
    pub vendor: String,
    /// Application version.
    pub version: Version,
    /// True for system-image apps.
    #[serde(default)]
    pub is_system_app: bool,
    /// Root code path.
    #[serde(default)]
    pub code_path: String,
    /// Requested permissions.
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Application metadata.
    #[serde(default)]
    pub metadata: Vec<Metadata>,
    /// Uid of the responding user, filled on projection.
    #[serde(default)]
    pub uid: i32,
    /// Enablement for the responding user, filled on projection.
    #[serde(default = "enabled_default")]
    pub enabled: bool,
}

fn enabled_default() -> bool {
    true
}

impl ApplicationInfo {
    /// Creates application fields for `bundle_name` at version 1.0.0.
    pub fn new(bundle_name: impl Into<String>) -> Self {
        Self {
            bundle_name: bundle_name.into(),
            label: String::new(),
            vendor: String::new(),
            version: Version::new(1, 0, 0),
            is_system_app: false,
            code_path: String::new(),
            permissions: Vec::new(),
            metadata: Vec::new(),
            uid: 0,
            enabled: true,
        }
    }
}

/// Bundle-level descriptive fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleBaseInfo {
    /// Bundle version.
    pub version: Version,
    /// Monotonic version code.
    #[serde(default)]
    pub version_code: u32,
    /// Vendor string.
    #[serde(default)]
    pub vendor: String,
    /// Name of the main entry ability.
    #[serde(default)]
    pub main_entry: String,
    /// Module name of the entry module.
    #[serde(default)]
    pub entry_module_name: String,
    /// Restarted by the system whenever it exits.
    #[serde(default)]
    pub keep_alive: bool,
}

impl Default for BundleBaseInfo {
    fn default() -> Self {
        Self {
            version: Version::new(1, 0, 0),
            version_code: 0,
            vendor: String::new(),
            main_entry: String::new(),
            entry_module_name: String::new(),
            keep_alive: false,
        }
    }
}

/// Summary of the packages shipped with the last install or update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackInfo {
    /// Package names in the shipped pack.
    pub packages: Vec<String>,
    /// Version code of the pack.
    pub version_code: u32,
}

/// One module (package) of a bundle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleInfo {
    /// Package name, unique within the bundle.
    pub package: String,
    /// Module name used by queries.
    pub module_name: String,
    /// True for the entry module.
    #[serde(default)]
    pub is_entry: bool,
    /// Per-user removability; users without an entry read as not removable.
    #[serde(default)]
    pub removable: BTreeMap<i32, bool>,
    /// Upgrade flag set by the installer.
    #[serde(default)]
    pub upgrade_flag: i32,
    /// Module metadata.
    #[serde(default)]
    pub metadata: Vec<Metadata>,
    /// Modules this one depends on.
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// Kind of a launchable ability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbilityKind {
    /// UI page.
    #[default]
    Page,
    /// Background service.
    Service,
    /// Data provider reachable through a `dataability://` uri.
    Data,
}

/// Declared ability.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbilityInfo {
    /// Ability name.
    pub name: String,
    /// Owning bundle.
    pub bundle_name: String,
    /// Owning module name.
    pub module_name: String,
    /// Owning package.
    pub package: String,
    /// Ability kind.
    #[serde(default)]
    pub kind: AbilityKind,
    /// Resolution priority, higher wins.
    #[serde(default)]
    pub priority: i32,
    /// Data ability uri, if any.
    #[serde(default)]
    pub uri: String,
    /// Permissions required to start the ability.
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Ability metadata.
    #[serde(default)]
    pub metadata: Vec<Metadata>,
    /// Free-form custom data.
    #[serde(default)]
    pub custom_data: BTreeMap<String, String>,
    /// User-scoped application projection, filled on request.
    #[serde(default)]
    pub application_info: Option<ApplicationInfo>,
}

/// Kind of an extension ability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExtensionType {
    /// Widget provider.
    Form,
    /// Deferred work.
    WorkScheduler,
    /// Input method.
    InputMethod,
    /// Background service.
    Service,
    /// Accessibility service.
    Accessibility,
    /// Data share provider.
    DataShare,
    /// File share provider.
    FileShare,
    /// Static event subscriber.
    StaticSubscriber,
    /// Wallpaper provider.
    Wallpaper,
    /// Backup agent.
    Backup,
    /// Not declared.
    #[default]
    Unspecified,
}

/// Declared extension ability.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionInfo {
    /// Extension name.
    pub name: String,
    /// Owning bundle.
    pub bundle_name: String,
    /// Owning module name.
    pub module_name: String,
    /// Owning package.
    pub package: String,
    /// Extension kind.
    #[serde(default)]
    pub extension_type: ExtensionType,
    /// Resolution priority, higher wins.
    #[serde(default)]
    pub priority: i32,
    /// Provider uri, if any.
    #[serde(default)]
    pub uri: String,
    /// Permissions required to bind.
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Extension metadata.
    #[serde(default)]
    pub metadata: Vec<Metadata>,
    /// User-scoped application projection, filled on request.
    #[serde(default)]
    pub application_info: Option<ApplicationInfo>,
}

/// Per-user state of a bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    /// User the record belongs to.
    pub user_id: i32,
    /// Uid the bundle runs under for this user.
    pub uid: i32,
    /// Supplementary groups.
    pub gids: Vec<i32>,
    /// Application enablement.
    #[serde(default = "enabled_default")]
    pub app_enabled: bool,
    /// Abilities disabled for this user.
    #[serde(default)]
    pub disabled_abilities: BTreeSet<String>,
    /// Access token assigned by the token manager.
    #[serde(default)]
    pub access_token_id: u32,
}

impl UserRecord {
    /// Creates an enabled record.
    pub fn new(user_id: i32, uid: i32) -> Self {
        Self {
            user_id,
            uid,
            gids: vec![uid],
            app_enabled: true,
            disabled_abilities: BTreeSet::new(),
            access_token_id: 0,
        }
    }

    /// Compact enablement snapshot of this record.
    pub fn state(&self) -> BundleUserState {
        BundleUserState {
            enabled: self.app_enabled,
            disabled_abilities: self.disabled_abilities.clone(),
        }
    }
}

/// Per-user enablement, persisted apart from the full record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleUserState {
    /// Application enablement.
    pub enabled: bool,
    /// Disabled ability names.
    #[serde(default)]
    pub disabled_abilities: BTreeSet<String>,
}

impl Default for BundleUserState {
    fn default() -> Self {
        Self { enabled: true, disabled_abilities: BTreeSet::new() }
    }
}

impl BundleUserState {
    /// True when the snapshot matches a freshly installed bundle.
    pub fn is_initial(&self) -> bool {
        self.enabled && self.disabled_abilities.is_empty()
    }
}

/// Secondary isolated instance of a bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SandboxAppInfo {
    /// Instance index.
    pub app_index: i32,
    /// User the instance runs for.
    pub user_id: i32,
    /// Access token of the instance.
    pub token_id: u32,
}

/// Bundle shipped with the system image, tracked apart from installed records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreInstallBundleInfo {
    /// Bundle name.
    pub bundle_name: String,
    /// Version code of the shipped package.
    #[serde(default)]
    pub version_code: u32,
    /// Package paths on the system image.
    #[serde(default)]
    pub bundle_paths: Vec<String>,
    /// Installer classification.
    #[serde(default)]
    pub app_type: AppType,
    /// Whether the user may uninstall it.
    #[serde(default)]
    pub removable: bool,
}

/// One installed bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleRecord {
    /// Registry key.
    pub bundle_name: String,
    /// Bundle-wide enablement.
    #[serde(default)]
    pub status: BundleStatus,
    /// Recovery checkpoint.
    #[serde(default)]
    pub install_mark: InstallMark,
    /// Bundle-level fields.
    #[serde(default)]
    pub base: BundleBaseInfo,
    /// Application-level fields.
    pub application: ApplicationInfo,
    /// Package summary of the last install or update.
    #[serde(default)]
    pub pack_info: PackInfo,
    /// Modules keyed by package.
    #[serde(default)]
    pub modules: BTreeMap<String, ModuleInfo>,
    /// Abilities keyed by `<bundle>.<package>.<name>`.
    #[serde(default)]
    pub abilities: BTreeMap<String, AbilityInfo>,
    /// Extensions keyed by `<bundle>.<package>.<name>`.
    #[serde(default)]
    pub extensions: BTreeMap<String, ExtensionInfo>,
    /// Skills keyed by ability or extension key.
    #[serde(default)]
    pub skills: BTreeMap<String, Vec<Skill>>,
    /// Per-user records keyed by user id.
    #[serde(default)]
    pub users: BTreeMap<i32, UserRecord>,
    /// Sandbox instances.
    #[serde(default)]
    pub sandbox_apps: Vec<SandboxAppInfo>,
    /// Signing identity.
    #[serde(default)]
    pub provision_id: String,
    /// Installer classification.
    #[serde(default)]
    pub app_type: AppType,
    /// Feature tag, e.g. `hos_system_app`.
    #[serde(default)]
    pub app_feature: String,
    /// Privilege level granted by the signing profile.
    #[serde(default)]
    pub app_privilege_level: String,
    /// ACLs allowed by the signing profile.
    #[serde(default)]
    pub allowed_acls: Vec<String>,
}

fn component_key(bundle_name: &str, package: &str, name: &str) -> String {
    format!("{bundle_name}.{package}.{name}")
}

impl BundleRecord {
    /// Creates an empty, enabled record.
    pub fn new(bundle_name: impl Into<String>) -> Self {
        let bundle_name = bundle_name.into();
        Self {
            install_mark: InstallMark {
                bundle_name: bundle_name.clone(),
                package_name: String::new(),
                phase: InstallPhase::Finished,
            },
            application: ApplicationInfo::new(bundle_name.clone()),
            bundle_name,
            status: BundleStatus::Enabled,
            base: BundleBaseInfo::default(),
            pack_info: PackInfo::default(),
            modules: BTreeMap::new(),
            abilities: BTreeMap::new(),
            extensions: BTreeMap::new(),
            skills: BTreeMap::new(),
            users: BTreeMap::new(),
            sandbox_apps: Vec::new(),
            provision_id: String::new(),
            app_type: AppType::default(),
            app_feature: String::new(),
            app_privilege_level: "normal".to_string(),
            allowed_acls: Vec::new(),
        }
    }

    /// True when the bundle-wide status is disabled.
    pub fn is_disabled(&self) -> bool {
        self.status == BundleStatus::Disabled
    }

    /// True for system-image apps.
    pub fn is_system_app(&self) -> bool {
        self.application.is_system_app
    }

    /// True when any module is the entry module.
    pub fn has_entry(&self) -> bool {
        self.modules.values().any(|module| module.is_entry)
    }

    /// Sets the recovery checkpoint.
    pub fn set_install_mark(&mut self, package_name: &str, phase: InstallPhase) {
        self.install_mark = InstallMark {
            bundle_name: self.bundle_name.clone(),
            package_name: package_name.to_string(),
            phase,
        };
    }

    /// Adds or replaces a module entry.
    pub fn add_module(&mut self, module: ModuleInfo) {
        if module.is_entry {
            self.base.entry_module_name = module.module_name.clone();
        }
        self.modules.insert(module.package.clone(), module);
    }

    /// Adds an ability with its skills; the ability's package must already be a module.
    pub fn add_ability(&mut self, mut ability: AbilityInfo, skills: Vec<Skill>) -> Result<String> {
        let module = self
            .modules
            .get(&ability.package)
            .ok_or_else(|| Error::NotFound(format!("module {}", ability.package)))?;
        ability.bundle_name = self.bundle_name.clone();
        ability.module_name = module.module_name.clone();
        let key = component_key(&self.bundle_name, &ability.package, &ability.name);
        if module.is_entry && self.base.main_entry.is_empty() {
            self.base.main_entry = ability.name.clone();
        }
        if !skills.is_empty() {
            self.skills.insert(key.clone(), skills);
        }
        self.abilities.insert(key.clone(), ability);
        Ok(key)
    }

    /// Adds an extension with its skills; the extension's package must already be a module.
    pub fn add_extension(
        &mut self,
        mut extension: ExtensionInfo,
        skills: Vec<Skill>,
    ) -> Result<String> {
        let module = self
            .modules
            .get(&extension.package)
            .ok_or_else(|| Error::NotFound(format!("module {}", extension.package)))?;
        extension.bundle_name = self.bundle_name.clone();
        extension.module_name = module.module_name.clone();
        let key = component_key(&self.bundle_name, &extension.package, &extension.name);
        if !skills.is_empty() {
            self.skills.insert(key.clone(), skills);
        }
        self.extensions.insert(key.clone(), extension);
        Ok(key)
    }

    /// Drops a module together with its abilities, extensions and skills.
    /// Returns false when the module is unknown.
    pub fn remove_module(&mut self, package: &str) -> bool {
        let Some(module) = self.modules.remove(package) else {
            log::error!("bundlemgr: module {package} of {} does not exist", self.bundle_name);
            return false;
        };
        if module.is_entry {
            self.base.main_entry.clear();
            self.base.entry_module_name.clear();
        }
        let mut dropped = Vec::new();
        self.abilities.retain(|key, ability| {
            let keep = ability.package != package;
            if !keep {
                dropped.push(key.clone());
            }
            keep
        });
        self.extensions.retain(|key, extension| {
            let keep = extension.package != package;
            if !keep {
                dropped.push(key.clone());
            }
            keep
        });
        for key in dropped {
            self.skills.remove(&key);
        }
        true
    }

    /// True when `package` is the bundle's only module.
    pub fn is_only_module(&self, package: &str) -> bool {
        self.modules.len() == 1 && self.modules.contains_key(package)
    }

    /// Copies every module of `new`, replacing same-package modules of `self`.
    pub fn update_module_info(&mut self, new: &BundleRecord) {
        for package in new.modules.keys() {
            if self.modules.contains_key(package) {
                self.remove_module(package);
            }
        }
        self.absorb_modules(new);
    }

    fn absorb_modules(&mut self, new: &BundleRecord) {
        for (package, module) in &new.modules {
            self.modules.insert(package.clone(), module.clone());
            if module.is_entry {
                self.base.entry_module_name = module.module_name.clone();
                if !new.base.main_entry.is_empty() {
                    self.base.main_entry = new.base.main_entry.clone();
                }
            }
        }
        for (key, ability) in &new.abilities {
            if new.modules.contains_key(&ability.package) {
                self.abilities.insert(key.clone(), ability.clone());
                if let Some(skills) = new.skills.get(key) {
                    self.skills.insert(key.clone(), skills.clone());
                }
            }
        }
        for (key, extension) in &new.extensions {
            if new.modules.contains_key(&extension.package) {
                self.extensions.insert(key.clone(), extension.clone());
                if let Some(skills) = new.skills.get(key) {
                    self.skills.insert(key.clone(), skills.clone());
                }
            }
        }
    }

    fn take_base_fields(&mut self, new: &BundleRecord) {
        let main_entry = std::mem::take(&mut self.base.main_entry);
        let entry_module_name = std::mem::take(&mut self.base.entry_module_name);
        self.base = new.base.clone();
        if self.base.main_entry.is_empty() {
            self.base.main_entry = main_entry;
        }
        if self.base.entry_module_name.is_empty() {
            self.base.entry_module_name = entry_module_name;
        }
        self.application = new.application.clone();
        self.app_type = new.app_type;
        self.app_feature = new.app_feature.clone();
        self.app_privilege_level = new.app_privilege_level.clone();
        self.allowed_acls = new.allowed_acls.clone();
    }

    /// User that answers a request made for `selector`.
    pub fn response_user(&self, selector: UserSelector) -> Option<i32> {
        match selector {
            UserSelector::All => None,
            UserSelector::Any => self.users.keys().next().copied(),
            UserSelector::Id(id) if self.users.contains_key(&id) => Some(id),
            UserSelector::Id(id) if id < START_USERID => None,
            UserSelector::Id(_) => self.users.keys().find(|id| **id < START_USERID).copied(),
        }
    }

    /// Application enablement for `user`; no user reads as disabled.
    pub fn is_app_enabled(&self, user: Option<i32>) -> bool {
        user.and_then(|id| self.users.get(&id)).is_some_and(|record| record.app_enabled)
    }

    /// Ability enablement for `user`; no user reads as disabled.
    pub fn is_ability_enabled(&self, ability_name: &str, user: Option<i32>) -> bool {
        user.and_then(|id| self.users.get(&id))
            .is_some_and(|record| !record.disabled_abilities.contains(ability_name))
    }

    /// Uid of the bundle for `user_id`.
    pub fn uid(&self, user_id: i32) -> Option<i32> {
        self.users.get(&user_id).map(|record| record.uid)
    }

    /// Finds an ability; an empty `module_name` matches any module.
    pub fn find_ability(&self, module_name: &str, ability_name: &str) -> Option<&AbilityInfo> {
        self.abilities.values().find(|ability| {
            ability.name == ability_name
                && (module_name.is_empty() || ability.module_name == module_name)
        })
    }

    /// Finds an extension; an empty `module_name` matches any module.
    pub fn find_extension(&self, module_name: &str, name: &str) -> Option<&ExtensionInfo> {
        self.extensions.values().find(|extension| {
            extension.name == name
                && (module_name.is_empty() || extension.module_name == module_name)
        })
    }

    /// Finds the extension whose declared uri equals `uri`.
    pub fn find_extension_by_uri(&self, uri: &str) -> Option<&ExtensionInfo> {
        self.extensions.values().find(|extension| extension.uri == uri)
    }

    /// Module whose `module_name` equals `module_name`.
    pub fn module_by_name(&self, module_name: &str) -> Option<&ModuleInfo> {
        self.modules.values().find(|module| module.module_name == module_name)
    }

    fn module_by_name_mut(&mut self, module_name: &str) -> Result<&mut ModuleInfo> {
        let bundle_name = &self.bundle_name;
        self.modules
            .values_mut()
            .find(|module| module.module_name == module_name)
            .ok_or_else(|| Error::NotFound(format!("module {module_name} of {bundle_name}")))
    }

    /// Sets whether `module_name` may be removed by `user_id`.
    pub fn set_module_removable(
        &mut self,
        module_name: &str,
        user_id: i32,
        removable: bool,
    ) -> Result<()> {
        self.module_by_name_mut(module_name)?.removable.insert(user_id, removable);
        Ok(())
    }

    /// Removability of `module_name` for `user_id`; unknown modules and users read false.
    pub fn is_module_removable(&self, module_name: &str, user_id: i32) -> bool {
        self.module_by_name(module_name)
            .and_then(|module| module.removable.get(&user_id).copied())
            .unwrap_or(false)
    }

    /// Sets the upgrade flag of `module_name`.
    pub fn set_module_upgrade_flag(&mut self, module_name: &str, flag: i32) -> Result<()> {
        self.module_by_name_mut(module_name)?.upgrade_flag = flag;
        Ok(())
    }

    /// Every module `package` depends on, directly or transitively, in breadth-first
    /// order without duplicates. An unknown package has no dependencies.
    pub fn dependent_module_names(&self, package: &str) -> Vec<String> {
        let direct = |key: &str| {
            self.modules.get(key).map(|module| module.dependencies.clone()).unwrap_or_default()
        };
        let mut queue: VecDeque<String> = direct(package).into();
        let mut found: Vec<String> = Vec::new();
        while let Some(name) = queue.pop_front() {
            if found.contains(&name) {
                continue;
            }
            queue.extend(direct(&name));
            found.push(name);
        }
        found
    }

    /// Finds the data ability whose declared uri authority equals `authority`.
    pub fn find_ability_by_uri(&self, authority: &str) -> Option<&AbilityInfo> {
        self.abilities.values().find(|ability| {
            ability.uri.strip_prefix(DATA_ABILITY_URI_PREFIX) == Some(authority)
        })
    }

    /// Minimal, user-scoped application projection.
    pub fn application_info_for(&self, user: Option<i32>) -> ApplicationInfo {
        let mut info = self.application.clone();
        info.permissions.clear();
        info.metadata.clear();
        let record = user.and_then(|id| self.users.get(&id));
        info.uid = record.map_or(-1, |record| record.uid);
        info.enabled = record.is_some_and(|record| record.app_enabled);
        info
    }

    /// Sets application enablement for `user_id`.
    pub fn set_application_enabled(&mut self, user_id: i32, enabled: bool) -> Result<()> {
        let record = self
            .users
            .get_mut(&user_id)
            .ok_or_else(|| Error::NotFound(format!("user {user_id} of {}", self.bundle_name)))?;
        record.app_enabled = enabled;
        Ok(())
    }

    /// Sets ability enablement for `user_id`.
    pub fn set_ability_enabled(
        &mut self,
        module_name: &str,
        ability_name: &str,
        user_id: i32,
        enabled: bool,
    ) -> Result<()> {
        if self.find_ability(module_name, ability_name).is_none() {
            return Err(Error::NotFound(format!("ability {ability_name} of {}", self.bundle_name)));
        }
        let record = self
            .users
            .get_mut(&user_id)
            .ok_or_else(|| Error::NotFound(format!("user {user_id} of {}", self.bundle_name)))?;
        if enabled {
            record.disabled_abilities.remove(ability_name);
        } else {
            record.disabled_abilities.insert(ability_name.to_string());
        }
        Ok(())
    }

    /// Enablement snapshot for `user_id`.
    pub fn user_state(&self, user_id: i32) -> Option<BundleUserState> {
        self.users.get(&user_id).map(UserRecord::state)
    }

    /// Applies a loaded snapshot; unknown users are ignored.
    pub fn apply_user_state(&mut self, user_id: i32, state: &BundleUserState) -> bool {
        match self.users.get_mut(&user_id) {
            Some(record) => {
                record.app_enabled = state.enabled;
                record.disabled_abilities = state.disabled_abilities.clone();
                true
            }
            None => false,
        }
    }
}

/// Extracts the authority of a `dataability://` uri, or `None` when malformed.
pub fn data_ability_authority(uri: &str) -> Option<&str> {
    let rest = uri.strip_prefix(DATA_ABILITY_URI_PREFIX)?;
    let (_, after_first) = rest.split_once(URI_PATH_SEPARATOR)?;
    Some(after_first.split(URI_PATH_SEPARATOR).next().unwrap_or(after_first))
}

/// Reduces a `scheme:///authority/path` request uri to the `scheme://authority` form
/// extensions declare; `None` when `uri` lacks `:///`.
pub fn extension_uri_key(uri: &str) -> Option<String> {
    let scheme_end = uri.find(PARAM_URI_SEPARATOR)?;
    let rest = &uri[scheme_end + PARAM_URI_SEPARATOR.len()..];
    let authority = rest.split(URI_PATH_SEPARATOR).next().unwrap_or(rest);
    Some(format!("{}{URI_SEPARATOR}{authority}", &uri[..scheme_end]))
}

/// Merges an update package into an existing record.
///
/// Base bundle and application fields, classification and ACLs come from `new` when
/// `new` carries an entry module or `existing` has none. Module data and the pack
/// summary always come from `new`. The result is enabled.
pub fn merge_update(existing: &BundleRecord, new: &BundleRecord) -> BundleRecord {
    let mut merged = existing.clone();
    if new.has_entry() || !existing.has_entry() {
        merged.take_base_fields(new);
    }
    merged.pack_info = new.pack_info.clone();
    merged.update_module_info(new);
    merged.status = BundleStatus::Enabled;
    merged
}

/// Merges a brand-new module package into an existing record.
///
/// Base fields come from `new` only when `existing` has no entry module.
pub fn merge_new_module(existing: &BundleRecord, new: &BundleRecord) -> BundleRecord {
    let mut merged = existing.clone();
    if !existing.has_entry() {
        merged.take_base_fields(new);
    }
    merged.pack_info = new.pack_info.clone();
    merged.absorb_modules(new);
    merged.status = BundleStatus::Enabled;
    merged
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    /// Record with one module per `(package, is_entry)` and no abilities.
    pub fn record(bundle_name: &str, modules: &[(&str, bool)]) -> BundleRecord {
        let mut record = BundleRecord::new(bundle_name);
        for (package, is_entry) in modules {
            record.add_module(ModuleInfo {
                package: package.to_string(),
                module_name: package.to_string(),
                is_entry: *is_entry,
                ..ModuleInfo::default()
            });
        }
        record
    }

    pub fn ability(package: &str, name: &str, priority: i32) -> AbilityInfo {
        AbilityInfo {
            name: name.to_string(),
            package: package.to_string(),
            priority,
            permissions: vec!["perm.camera".into()],
            metadata: vec![Metadata {
                name: "m".into(),
                value: "v".into(),
                resource: String::new(),
            }],
            custom_data: BTreeMap::from([("k".to_string(), "v".to_string())]),
            ..AbilityInfo::default()
        }
    }
}

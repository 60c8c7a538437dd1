// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Read-only ability and extension resolution over a registry snapshot
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: Unit tests for explicit/implicit lookup, ordering, filtering and projection
//!
//! PUBLIC API:
//!   - CapabilityResolver::query_abilities / query_ability / query_extensions
//!   - CapabilityResolver::resolve_by_priority: best ability or extension for a want
//!   - CapabilityResolver::launcher_abilities / ability_by_uri / extensions_by_type
//!   - CapabilityResolver::extension_by_uri / launch_want / keep_alive_bundles
//!   - CapabilityResolver::bundle_info / bundle_infos / application_infos
//!
//! The resolver borrows the bundle map while the registry lock is held. Bundles in
//! `hidden` have never completed an install and behave as absent. Implicit results
//! are sorted by descending priority; equal priorities keep encounter order (bundle
//! name, then component key).

use std::collections::{BTreeMap, HashSet};

use crate::error::{Error, Result};
use crate::projection::ProjectionOptions;
use crate::record::{
    data_ability_authority, extension_uri_key, AbilityInfo, ApplicationInfo, BundleRecord,
    ExtensionInfo, ExtensionType,
};
use crate::skill::{Skill, Want, ACTION_HOME, ENTITY_HOME};
use crate::user::UserSelector;

/// Winner of a combined ability/extension resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved {
    /// An ability ranked at least as high as every extension.
    Ability(AbilityInfo),
    /// An extension ranked strictly higher than every ability.
    Extension(ExtensionInfo),
}

/// A bundle admitted for a request together with the user answering it.
struct Scope<'a> {
    record: &'a BundleRecord,
    user: Option<i32>,
    per_user: bool,
}

impl Scope<'_> {
    fn component_enabled(&self, name: &str) -> bool {
        !self.per_user || self.record.is_ability_enabled(name, self.user)
    }
}

/// Resolver over a borrowed bundle map.
pub struct CapabilityResolver<'a> {
    bundles: &'a BTreeMap<String, BundleRecord>,
    hidden: HashSet<String>,
}

impl<'a> CapabilityResolver<'a> {
    /// Creates a resolver that sees every bundle in `bundles`.
    pub fn new(bundles: &'a BTreeMap<String, BundleRecord>) -> Self {
        Self { bundles, hidden: HashSet::new() }
    }

    /// Treats `hidden` bundles as absent.
    pub fn hiding(mut self, hidden: HashSet<String>) -> Self {
        self.hidden = hidden;
        self
    }

    fn visible(&self) -> impl Iterator<Item = &'a BundleRecord> + '_ {
        self.bundles.iter().filter(|(name, _)| !self.hidden.contains(*name)).map(|(_, rec)| rec)
    }

    fn record(&self, bundle_name: &str) -> Option<&'a BundleRecord> {
        if self.hidden.contains(bundle_name) {
            return None;
        }
        self.bundles.get(bundle_name)
    }

    fn scope(
        &self,
        bundle_name: &str,
        options: &ProjectionOptions,
        selector: UserSelector,
    ) -> Result<Scope<'a>> {
        let record = self
            .record(bundle_name)
            .ok_or_else(|| Error::NotFound(format!("bundle {bundle_name}")))?;
        self.admit(record, options, selector)
    }

    fn admit(
        &self,
        record: &'a BundleRecord,
        options: &ProjectionOptions,
        selector: UserSelector,
    ) -> Result<Scope<'a>> {
        if record.is_disabled() {
            return Err(Error::Disabled(record.bundle_name.clone()));
        }
        let per_user = selector != UserSelector::All;
        let user = record.response_user(selector);
        if per_user && !options.with_disabled && !record.is_app_enabled(user) {
            log::debug!("bundlemgr: {} disabled for {selector:?}", record.bundle_name);
            return Err(Error::Disabled(record.bundle_name.clone()));
        }
        Ok(Scope { record, user, per_user })
    }

    // ========================================================================
    // Abilities
    // ========================================================================

    /// Explicit lookup by `(bundle, module, ability)` named in `want`.
    pub fn explicit_ability(
        &self,
        want: &Want,
        options: &ProjectionOptions,
        selector: UserSelector,
    ) -> Result<AbilityInfo> {
        let element = &want.element;
        if element.bundle_name.is_empty() || element.ability_name.is_empty() {
            return Err(Error::InvalidQuery);
        }
        let scope = self.scope(&element.bundle_name, options, selector)?;
        if options.system_app_only && !scope.record.is_system_app() {
            return Err(Error::NotFound(format!("system bundle {}", element.bundle_name)));
        }
        let ability = scope
            .record
            .find_ability(&element.module_name, &element.ability_name)
            .ok_or_else(|| Error::NotFound(format!("ability {}", element.ability_name)))?;
        if !options.with_disabled && !scope.component_enabled(&ability.name) {
            return Err(Error::Disabled(ability.name.clone()));
        }
        Ok(options.project_ability(ability.clone(), scope.record, scope.user))
    }

    /// Implicit lookup; an empty result is not an error here.
    pub fn implicit_abilities(
        &self,
        want: &Want,
        options: &ProjectionOptions,
        selector: UserSelector,
    ) -> Result<Vec<AbilityInfo>> {
        if want.is_blank() {
            return Err(Error::InvalidQuery);
        }
        let mut found = Vec::new();
        for scope in self.search_scopes(want, options, selector)? {
            self.collect_abilities(&scope, want, options, &mut found);
        }
        let module_name = &want.element.module_name;
        if !module_name.is_empty() {
            found.retain(|ability| &ability.module_name == module_name);
        }
        found.sort_by(|a, b| b.priority.cmp(&a.priority));
        Ok(found)
    }

    fn search_scopes(
        &self,
        want: &Want,
        options: &ProjectionOptions,
        selector: UserSelector,
    ) -> Result<Vec<Scope<'a>>> {
        let bundle_name = &want.element.bundle_name;
        if !bundle_name.is_empty() {
            return Ok(vec![self.scope(bundle_name, options, selector)?]);
        }
        Ok(self
            .visible()
            .filter_map(|record| self.admit(record, options, selector).ok())
            .collect())
    }

    fn collect_abilities(
        &self,
        scope: &Scope<'a>,
        want: &Want,
        options: &ProjectionOptions,
        found: &mut Vec<AbilityInfo>,
    ) {
        if options.system_app_only && !scope.record.is_system_app() {
            return;
        }
        for (key, ability) in &scope.record.abilities {
            if !first_match(&scope.record.skills, key, |skill| skill.matches(want)) {
                continue;
            }
            if !options.with_disabled && !scope.component_enabled(&ability.name) {
                log::debug!("bundlemgr: skip disabled ability {key}");
                continue;
            }
            found.push(options.project_ability(ability.clone(), scope.record, scope.user));
        }
    }

    /// Explicit when `want` names a bundle and an ability, implicit otherwise. An empty
    /// implicit result is reported as [`Error::NotFound`].
    pub fn query_abilities(
        &self,
        want: &Want,
        options: &ProjectionOptions,
        selector: UserSelector,
    ) -> Result<Vec<AbilityInfo>> {
        if want.is_explicit() {
            return self.explicit_ability(want, options, selector).map(|ability| vec![ability]);
        }
        let found = self.implicit_abilities(want, options, selector)?;
        if found.is_empty() {
            return Err(Error::NotFound("no ability matches".into()));
        }
        Ok(found)
    }

    /// Highest ranked ability for `want`.
    pub fn query_ability(
        &self,
        want: &Want,
        options: &ProjectionOptions,
        selector: UserSelector,
    ) -> Result<AbilityInfo> {
        self.query_abilities(want, options, selector)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::NotFound("no ability matches".into()))
    }

    /// Abilities whose skills admit `want` on action and entities alone.
    pub fn launcher_abilities(
        &self,
        want: &Want,
        selector: UserSelector,
    ) -> Result<Vec<AbilityInfo>> {
        let options = ProjectionOptions { with_application: true, ..Default::default() };
        let mut found = Vec::new();
        for scope in self.search_scopes(want, &options, selector)? {
            for (key, ability) in &scope.record.abilities {
                let admitted =
                    first_match(&scope.record.skills, key, |skill| skill.matches_launcher(want));
                if admitted && scope.component_enabled(&ability.name) {
                    found.push(options.project_ability(ability.clone(), scope.record, scope.user));
                }
            }
        }
        if found.is_empty() {
            return Err(Error::NotFound("no launcher ability".into()));
        }
        Ok(found)
    }

    /// Data ability addressed by a `dataability://` uri.
    pub fn ability_by_uri(
        &self,
        uri: &str,
        options: &ProjectionOptions,
        selector: UserSelector,
    ) -> Result<AbilityInfo> {
        let authority = data_ability_authority(uri).ok_or(Error::InvalidQuery)?;
        for record in self.visible() {
            let Some(ability) = record.find_ability_by_uri(authority) else {
                continue;
            };
            let scope = self.admit(record, options, selector)?;
            if !options.with_disabled && !scope.component_enabled(&ability.name) {
                return Err(Error::Disabled(ability.name.clone()));
            }
            return Ok(options.project_ability(ability.clone(), record, scope.user));
        }
        Err(Error::NotFound(format!("data ability {authority}")))
    }

    // ========================================================================
    // Extensions
    // ========================================================================

    /// Explicit extension lookup.
    pub fn explicit_extension(
        &self,
        want: &Want,
        options: &ProjectionOptions,
        selector: UserSelector,
    ) -> Result<ExtensionInfo> {
        let element = &want.element;
        if element.bundle_name.is_empty() || element.ability_name.is_empty() {
            return Err(Error::InvalidQuery);
        }
        let scope = self.scope(&element.bundle_name, options, selector)?;
        if options.system_app_only && !scope.record.is_system_app() {
            return Err(Error::NotFound(format!("system bundle {}", element.bundle_name)));
        }
        let extension = scope
            .record
            .find_extension(&element.module_name, &element.ability_name)
            .ok_or_else(|| Error::NotFound(format!("extension {}", element.ability_name)))?;
        if !options.with_disabled && !scope.component_enabled(&extension.name) {
            return Err(Error::Disabled(extension.name.clone()));
        }
        Ok(options.project_extension(extension.clone(), scope.record, scope.user))
    }

    /// Implicit extension lookup; an empty result is not an error here.
    pub fn implicit_extensions(
        &self,
        want: &Want,
        options: &ProjectionOptions,
        selector: UserSelector,
    ) -> Result<Vec<ExtensionInfo>> {
        if want.is_blank() {
            return Err(Error::InvalidQuery);
        }
        let mut found = Vec::new();
        for scope in self.search_scopes(want, options, selector)? {
            if options.system_app_only && !scope.record.is_system_app() {
                continue;
            }
            for (key, extension) in &scope.record.extensions {
                if !first_match(&scope.record.skills, key, |skill| skill.matches(want)) {
                    continue;
                }
                if !options.with_disabled && !scope.component_enabled(&extension.name) {
                    continue;
                }
                found.push(options.project_extension(
                    extension.clone(),
                    scope.record,
                    scope.user,
                ));
            }
        }
        let module_name = &want.element.module_name;
        if !module_name.is_empty() {
            found.retain(|extension| &extension.module_name == module_name);
        }
        found.sort_by(|a, b| b.priority.cmp(&a.priority));
        Ok(found)
    }

    /// Explicit or implicit extension query, mirroring [`CapabilityResolver::query_abilities`].
    pub fn query_extensions(
        &self,
        want: &Want,
        options: &ProjectionOptions,
        selector: UserSelector,
    ) -> Result<Vec<ExtensionInfo>> {
        if want.is_explicit() {
            return self.explicit_extension(want, options, selector).map(|ext| vec![ext]);
        }
        let found = self.implicit_extensions(want, options, selector)?;
        if found.is_empty() {
            return Err(Error::NotFound("no extension matches".into()));
        }
        Ok(found)
    }

    /// Every extension of `extension_type` visible to the user; may be empty.
    pub fn extensions_by_type(
        &self,
        extension_type: ExtensionType,
        selector: UserSelector,
    ) -> Vec<ExtensionInfo> {
        let options = ProjectionOptions { with_application: true, ..Default::default() };
        let mut found = Vec::new();
        for record in self.visible() {
            let Ok(scope) = self.admit(record, &options, selector) else {
                continue;
            };
            found.extend(
                record
                    .extensions
                    .values()
                    .filter(|ext| ext.extension_type == extension_type)
                    .map(|ext| options.project_extension(ext.clone(), record, scope.user)),
            );
        }
        found
    }

    /// Extension declaring the authority of a `scheme:///authority/path` uri, with the
    /// application fields of the user answering `selector` attached.
    pub fn extension_by_uri(&self, uri: &str, selector: UserSelector) -> Result<ExtensionInfo> {
        let key = extension_uri_key(uri).ok_or(Error::InvalidQuery)?;
        let options = ProjectionOptions { with_application: true, ..Default::default() };
        for record in self.visible() {
            let Ok(scope) = self.admit(record, &options, selector) else {
                continue;
            };
            if let Some(extension) = record.find_extension_by_uri(&key) {
                return Ok(options.project_extension(extension.clone(), record, scope.user));
            }
        }
        Err(Error::NotFound(format!("extension {key}")))
    }

    /// Best single result across abilities and extensions; the ability wins ties.
    pub fn resolve_by_priority(
        &self,
        want: &Want,
        options: &ProjectionOptions,
        selector: UserSelector,
    ) -> Result<Resolved> {
        let ability = self.implicit_abilities(want, options, selector)?.into_iter().next();
        let extension = self.implicit_extensions(want, options, selector)?.into_iter().next();
        match (ability, extension) {
            (Some(ability), Some(extension)) if extension.priority > ability.priority => {
                Ok(Resolved::Extension(extension))
            }
            (Some(ability), _) => Ok(Resolved::Ability(ability)),
            (None, Some(extension)) => Ok(Resolved::Extension(extension)),
            (None, None) => Err(Error::NotFound("nothing matches".into())),
        }
    }

    // ========================================================================
    // Listings
    // ========================================================================

    /// Shaped snapshot of one bundle.
    pub fn bundle_info(
        &self,
        bundle_name: &str,
        options: &ProjectionOptions,
        selector: UserSelector,
    ) -> Result<BundleRecord> {
        let scope = self.scope(bundle_name, options, selector)?;
        if scope.per_user && scope.user.is_none() {
            return Err(Error::NotFound(format!("{bundle_name} for {selector:?}")));
        }
        Ok(options.project_record(scope.record, scope.user))
    }

    /// Shaped snapshots of every bundle admitted for the user. With
    /// [`UserSelector::All`] every enabled bundle is listed.
    pub fn bundle_infos(
        &self,
        options: &ProjectionOptions,
        selector: UserSelector,
    ) -> Vec<BundleRecord> {
        self.visible()
            .filter_map(|record| self.bundle_info(&record.bundle_name, options, selector).ok())
            .collect()
    }

    /// Keep-alive bundles that have a record for the user answering `selector`.
    pub fn keep_alive_bundles(&self, selector: UserSelector) -> Vec<BundleRecord> {
        let options = ProjectionOptions { with_disabled: true, ..Default::default() };
        self.visible()
            .filter(|record| record.base.keep_alive)
            .filter_map(|record| self.bundle_info(&record.bundle_name, &options, selector).ok())
            .collect()
    }

    /// Want that starts the main ability of `bundle_name`.
    pub fn launch_want(&self, bundle_name: &str, selector: UserSelector) -> Result<Want> {
        let scope = self.scope(bundle_name, &ProjectionOptions::default(), selector)?;
        let main = &scope.record.base.main_entry;
        if main.is_empty() {
            log::error!("bundlemgr: no main ability in {bundle_name}");
            return Err(Error::NotFound(format!("main ability of {bundle_name}")));
        }
        Ok(Want::new()
            .with_element(bundle_name, "", main.as_str())
            .with_action(ACTION_HOME)
            .with_entity(ENTITY_HOME))
    }

    /// Application fields of one bundle.
    pub fn application_info(
        &self,
        bundle_name: &str,
        options: &ProjectionOptions,
        selector: UserSelector,
    ) -> Result<ApplicationInfo> {
        let scope = self.scope(bundle_name, options, selector)?;
        if scope.per_user && scope.user.is_none() {
            return Err(Error::NotFound(format!("{bundle_name} for {selector:?}")));
        }
        Ok(options.project_application(scope.record, scope.user))
    }

    /// Application fields of every bundle admitted for the user.
    pub fn application_infos(
        &self,
        options: &ProjectionOptions,
        selector: UserSelector,
    ) -> Vec<ApplicationInfo> {
        self.visible()
            .filter_map(|record| self.application_info(&record.bundle_name, options, selector).ok())
            .collect()
    }
}

/// True when any skill admits; later skills are not tested after the first match.
fn first_match(
    skills: &BTreeMap<String, Vec<Skill>>,
    key: &str,
    admits: impl Fn(&Skill) -> bool,
) -> bool {
    skills.get(key).is_some_and(|skills| skills.iter().any(admits))
}

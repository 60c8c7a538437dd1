// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Query flag bitmask and its decoded form.
//!
//! Raw bits stay at the API boundary; internal code only sees [`ProjectionOptions`].

use bitflags::bitflags;

use crate::record::{AbilityInfo, ApplicationInfo, BundleRecord, ExtensionInfo};

bitflags! {
    /// Result-shaping flags accepted by query operations.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct QueryFlags: u32 {
        /// Keep `permissions`.
        const WITH_PERMISSION = 0x0000_0002;
        /// Attach the user-scoped application projection.
        const WITH_APPLICATION = 0x0000_0004;
        /// Keep metadata and custom data.
        const WITH_METADATA = 0x0000_0020;
        /// Include disabled apps and abilities.
        const WITH_DISABLE = 0x0000_0100;
        /// Only return results owned by system apps.
        const SYSTEMAPP_ONLY = 0x0000_0200;
    }
}

/// Decoded [`QueryFlags`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProjectionOptions {
    /// Keep `permissions`.
    pub with_permissions: bool,
    /// Keep metadata and custom data.
    pub with_metadata: bool,
    /// Attach the user-scoped application projection.
    pub with_application: bool,
    /// Only return results owned by system apps.
    pub system_app_only: bool,
    /// Include disabled apps and abilities.
    pub with_disabled: bool,
}

impl From<QueryFlags> for ProjectionOptions {
    fn from(flags: QueryFlags) -> Self {
        Self {
            with_permissions: flags.contains(QueryFlags::WITH_PERMISSION),
            with_metadata: flags.contains(QueryFlags::WITH_METADATA),
            with_application: flags.contains(QueryFlags::WITH_APPLICATION),
            system_app_only: flags.contains(QueryFlags::SYSTEMAPP_ONLY),
            with_disabled: flags.contains(QueryFlags::WITH_DISABLE),
        }
    }
}

impl ProjectionOptions {
    /// Decodes raw bits; unknown bits are ignored.
    pub fn from_bits(bits: u32) -> Self {
        QueryFlags::from_bits_truncate(bits).into()
    }

    /// Shapes an ability result.
    pub fn project_ability(
        &self,
        mut ability: AbilityInfo,
        record: &BundleRecord,
        user: Option<i32>,
    ) -> AbilityInfo {
        if !self.with_permissions {
            ability.permissions.clear();
        }
        if !self.with_metadata {
            ability.metadata.clear();
            ability.custom_data.clear();
        }
        ability.application_info =
            self.with_application.then(|| record.application_info_for(user));
        ability
    }

    /// Shapes an extension result.
    pub fn project_extension(
        &self,
        mut extension: ExtensionInfo,
        record: &BundleRecord,
        user: Option<i32>,
    ) -> ExtensionInfo {
        if !self.with_permissions {
            extension.permissions.clear();
        }
        if !self.with_metadata {
            extension.metadata.clear();
        }
        extension.application_info =
            self.with_application.then(|| record.application_info_for(user));
        extension
    }

    /// Shapes the application fields returned by application listings.
    pub fn project_application(
        &self,
        record: &BundleRecord,
        user: Option<i32>,
    ) -> ApplicationInfo {
        let mut info = record.application_info_for(user);
        if self.with_permissions {
            info.permissions = record.application.permissions.clone();
        }
        if self.with_metadata {
            info.metadata = record.application.metadata.clone();
        }
        info
    }

    /// Snapshot of a whole record with every component shaped.
    pub fn project_record(&self, record: &BundleRecord, user: Option<i32>) -> BundleRecord {
        let mut snapshot = record.clone();
        snapshot.application = self.project_application(record, user);
        let components = ProjectionOptions { with_application: false, ..*self };
        for ability in snapshot.abilities.values_mut() {
            *ability = components.project_ability(std::mem::take(ability), record, user);
        }
        for extension in snapshot.extensions.values_mut() {
            *extension = components.project_extension(std::mem::take(extension), record, user);
        }
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::fixtures::{ability, record};

    #[test]
    fn bits_decode_once() {
        let options = ProjectionOptions::from_bits(0x2 | 0x100 | 0x8000_0000);
        assert!(options.with_permissions);
        assert!(options.with_disabled);
        assert!(!options.with_metadata);
        assert!(!options.with_application);
        assert!(!options.system_app_only);
        assert_eq!(ProjectionOptions::from_bits(0), ProjectionOptions::default());
    }

    #[test]
    fn projection_clears_unrequested_fields() {
        let rec = record("com.a", &[("entry", true)]);
        let plain =
            ProjectionOptions::default().project_ability(ability("entry", "Main", 1), &rec, None);
        assert!(plain.permissions.is_empty());
        assert!(plain.metadata.is_empty());
        assert!(plain.custom_data.is_empty());
        assert!(plain.application_info.is_none());

        let full = ProjectionOptions::from(
            QueryFlags::WITH_PERMISSION | QueryFlags::WITH_METADATA | QueryFlags::WITH_APPLICATION,
        )
        .project_ability(ability("entry", "Main", 1), &rec, None);
        assert_eq!(full.permissions.len(), 1);
        assert_eq!(full.custom_data.len(), 1);
        assert_eq!(full.application_info.map(|app| app.bundle_name), Some("com.a".to_string()));
    }

    #[test]
    fn record_snapshot_keeps_requested_fields_only() {
        let mut rec = record("com.a", &[("entry", true)]);
        rec.application.permissions = vec!["perm.net".into()];
        rec.add_ability(ability("entry", "Main", 1), vec![]).expect("entry module");

        let bare = ProjectionOptions::default().project_record(&rec, None);
        assert!(bare.application.permissions.is_empty());
        assert!(bare.abilities.values().all(|a| a.permissions.is_empty()));

        let with_perms = ProjectionOptions { with_permissions: true, ..Default::default() };
        let snapshot = with_perms.project_record(&rec, None);
        assert_eq!(snapshot.application.permissions, vec!["perm.net".to_string()]);
        assert!(snapshot.abilities.values().all(|a| a.application_info.is_none()));
    }
}

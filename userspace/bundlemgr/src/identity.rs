// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Bundle id allocation and uid/gid derivation
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: Unit tests + proptests (uniqueness under churn, narrow id windows)
//!
//! Each bundle owns exactly one bundle id regardless of how many users it is
//! installed for. Freed ids are reused lowest-first.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::StoreConfig;
use crate::error::{Error, Result};

/// Filesystem namespace hook fired when an id is bound or released.
pub trait NamespaceHook: Send + Sync {
    /// Creates any namespace scoped to `(bundle_name, bundle_id)`.
    fn create(&self, bundle_name: &str, bundle_id: u32) -> core::result::Result<(), String>;

    /// Removes the namespace created by [`NamespaceHook::create`].
    fn remove(&self, bundle_name: &str, bundle_id: u32) -> core::result::Result<(), String>;
}

/// Hook that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNamespace;

impl NamespaceHook for NoopNamespace {
    fn create(&self, _bundle_name: &str, _bundle_id: u32) -> core::result::Result<(), String> {
        Ok(())
    }

    fn remove(&self, _bundle_name: &str, _bundle_id: u32) -> core::result::Result<(), String> {
        Ok(())
    }
}

/// `bundle_id -> bundle_name` allocator behind its own lock.
pub struct IdentityAllocator {
    ids: Mutex<BTreeMap<u32, String>>,
    base: u32,
    max: u32,
    user_range: u32,
    namespace: Arc<dyn NamespaceHook>,
}

impl IdentityAllocator {
    /// Creates an allocator for the id window of `config`.
    pub fn new(config: &StoreConfig, namespace: Arc<dyn NamespaceHook>) -> Self {
        Self {
            ids: Mutex::new(BTreeMap::new()),
            base: config.base_app_uid,
            max: config.max_app_uid,
            user_range: config.user_range.clamp(1, i32::MAX as u32),
            namespace,
        }
    }

    /// Returns the id owned by `bundle_name`, allocating the lowest free one if needed.
    pub fn allocate(&self, bundle_name: &str) -> Result<u32> {
        let id = {
            let mut ids = self.ids.lock();
            if let Some((id, _)) = ids.iter().find(|(_, name)| name.as_str() == bundle_name) {
                return Ok(*id);
            }
            let id = self.first_free(&ids)?;
            ids.insert(id, bundle_name.to_string());
            id
        };
        log::debug!("bundlemgr: bundle id {id} -> {bundle_name}");
        if let Err(err) = self.namespace.create(bundle_name, id) {
            log::warn!("bundlemgr: namespace create for {bundle_name} failed: {err}");
        }
        Ok(id)
    }

    fn first_free(&self, ids: &BTreeMap<u32, String>) -> Result<u32> {
        let mut candidate = self.base;
        for id in ids.keys().copied().filter(|id| *id >= self.base) {
            if id != candidate {
                break;
            }
            if candidate == self.max {
                return Err(Error::ExhaustedIdentitySpace);
            }
            candidate += 1;
        }
        if candidate > self.max {
            return Err(Error::ExhaustedIdentitySpace);
        }
        Ok(candidate)
    }

    /// Releases the id owned by `bundle_name`; returns it when one was held.
    pub fn recycle(&self, bundle_name: &str) -> Option<u32> {
        let id = {
            let mut ids = self.ids.lock();
            let id = ids.iter().find(|(_, name)| name.as_str() == bundle_name).map(|(id, _)| *id)?;
            ids.remove(&id);
            id
        };
        log::debug!("bundlemgr: bundle id {id} released by {bundle_name}");
        if let Err(err) = self.namespace.remove(bundle_name, id) {
            log::warn!("bundlemgr: namespace remove for {bundle_name} failed: {err}");
        }
        Some(id)
    }

    /// Rebinds an id recovered from a persisted uid and recreates its namespace.
    pub fn restore(&self, bundle_id: u32, bundle_name: &str) {
        self.ids.lock().entry(bundle_id).or_insert_with(|| bundle_name.to_string());
        if let Err(err) = self.namespace.create(bundle_name, bundle_id) {
            log::warn!("bundlemgr: namespace create for {bundle_name} failed: {err}");
        }
    }

    /// Id currently owned by `bundle_name`.
    pub fn bundle_id_of(&self, bundle_name: &str) -> Option<u32> {
        self.ids.lock().iter().find(|(_, name)| name.as_str() == bundle_name).map(|(id, _)| *id)
    }

    /// Number of ids in use.
    pub fn in_use(&self) -> usize {
        self.ids.lock().len()
    }

    /// `user_id * user_range + bundle_id mod user_range`.
    ///
    /// Fails with [`Error::InvalidUser`] when the uid does not fit an `i32`.
    pub fn derive_uid(&self, bundle_id: u32, user_id: i32) -> Result<i32> {
        derive_uid(bundle_id, user_id, self.user_range).ok_or(Error::InvalidUser(user_id))
    }

    /// Recovers the bundle id from a uid of `user_id`.
    pub fn bundle_id_from_uid(&self, uid: i32, user_id: i32) -> Option<u32> {
        let offset = i64::from(uid) - i64::from(user_id) * i64::from(self.user_range);
        u32::try_from(offset).ok()
    }

    /// User that owns `uid`.
    pub fn user_of_uid(&self, uid: i32) -> i32 {
        let user = i64::from(uid) / i64::from(self.user_range);
        i32::try_from(user).unwrap_or_default()
    }
}

/// Pure uid derivation; `None` for a negative user, an empty window or overflow.
pub fn derive_uid(bundle_id: u32, user_id: i32, user_range: u32) -> Option<i32> {
    if user_id < 0 || user_range == 0 {
        return None;
    }
    let offset = i64::from(bundle_id % user_range);
    let uid = i64::from(user_id).checked_mul(i64::from(user_range))?.checked_add(offset)?;
    i32::try_from(uid).ok()
}

/// Supplementary groups of a uid.
pub fn derive_gids(uid: i32) -> Vec<i32> {
    vec![uid]
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[derive(Default)]
    struct CountingHook {
        created: Mutex<Vec<(String, u32)>>,
        removed: Mutex<Vec<(String, u32)>>,
    }

    impl NamespaceHook for CountingHook {
        fn create(&self, name: &str, id: u32) -> core::result::Result<(), String> {
            self.created.lock().push((name.to_string(), id));
            Err("no hmdfs".into())
        }

        fn remove(&self, name: &str, id: u32) -> core::result::Result<(), String> {
            self.removed.lock().push((name.to_string(), id));
            Ok(())
        }
    }

    fn allocator(max: u32) -> IdentityAllocator {
        let config = StoreConfig { max_app_uid: max, ..StoreConfig::default() };
        IdentityAllocator::new(&config, Arc::new(NoopNamespace))
    }

    #[test]
    fn allocate_is_idempotent_and_dense() {
        let ids = allocator(65_535);
        assert_eq!(ids.allocate("a").unwrap(), 10_000);
        assert_eq!(ids.allocate("b").unwrap(), 10_001);
        assert_eq!(ids.allocate("a").unwrap(), 10_000);
        assert_eq!(ids.in_use(), 2);
    }

    #[test]
    fn freed_ids_are_reused_lowest_first() {
        let ids = allocator(65_535);
        for name in ["a", "b", "c"] {
            ids.allocate(name).unwrap();
        }
        assert_eq!(ids.recycle("b"), Some(10_001));
        assert_eq!(ids.recycle("b"), None);
        assert_eq!(ids.allocate("d").unwrap(), 10_001);
        assert_eq!(ids.allocate("e").unwrap(), 10_003);
    }

    #[test]
    fn exhaustion_reported() {
        let ids = allocator(10_001);
        ids.allocate("a").unwrap();
        ids.allocate("b").unwrap();
        assert_eq!(ids.allocate("c"), Err(Error::ExhaustedIdentitySpace));
        ids.recycle("a");
        assert_eq!(ids.allocate("c").unwrap(), 10_000);
    }

    #[test]
    fn hook_failures_are_swallowed() {
        let hook = Arc::new(CountingHook::default());
        let ids = IdentityAllocator::new(&StoreConfig::default(), hook.clone());
        assert_eq!(ids.allocate("a").unwrap(), 10_000);
        ids.recycle("a");
        assert_eq!(hook.created.lock().as_slice(), &[("a".to_string(), 10_000)]);
        assert_eq!(hook.removed.lock().as_slice(), &[("a".to_string(), 10_000)]);
    }

    #[test]
    fn uid_derivation() {
        let ids = allocator(65_535);
        assert_eq!(ids.derive_uid(10_000, 100), Ok(20_010_000));
        assert_eq!(ids.derive_uid(10_000, 0), Ok(10_000));
        assert_eq!(ids.bundle_id_from_uid(20_010_000, 100), Some(10_000));
        assert_eq!(ids.user_of_uid(20_010_000), 100);
        assert_eq!(derive_gids(20_010_000), vec![20_010_000]);
    }

    #[test]
    fn uid_overflow_is_an_invalid_user() {
        let ids = allocator(65_535);
        assert_eq!(ids.derive_uid(10_000, 20_000), Err(Error::InvalidUser(20_000)));
        assert_eq!(ids.derive_uid(10_000, -1), Err(Error::InvalidUser(-1)));
        assert_eq!(ids.derive_uid(10_000, i32::MAX), Err(Error::InvalidUser(i32::MAX)));
        assert_eq!(ids.derive_uid(10_000, 10_737), Ok(2_147_410_000));
        assert_eq!(derive_uid(5, 1, 0), None);
    }

    #[test]
    fn restore_blocks_reallocation() {
        let hook = Arc::new(CountingHook::default());
        let ids = IdentityAllocator::new(&StoreConfig::default(), hook.clone());
        ids.restore(10_000, "kept");
        assert_eq!(ids.allocate("new").unwrap(), 10_001);
        assert_eq!(ids.bundle_id_of("kept"), Some(10_000));
        assert_eq!(
            hook.created.lock().as_slice(),
            &[("kept".to_string(), 10_000), ("new".to_string(), 10_001)]
        );
    }

    proptest! {
        #[test]
        fn uids_distinct_in_narrow_window(
            ops in proptest::collection::vec((any::<bool>(), 0u8..150), 1..120),
        ) {
            let config = StoreConfig {
                base_app_uid: 100,
                max_app_uid: 199,
                user_range: 200,
                ..StoreConfig::default()
            };
            config.validate().unwrap();
            let ids = IdentityAllocator::new(&config, Arc::new(NoopNamespace));
            let mut live: HashSet<String> = HashSet::new();
            for (install, n) in ops {
                let name = format!("bundle{n}");
                if install {
                    match ids.allocate(&name) {
                        Ok(_) => {
                            live.insert(name);
                        }
                        Err(err) => {
                            prop_assert_eq!(err, Error::ExhaustedIdentitySpace);
                        }
                    }
                } else {
                    ids.recycle(&name);
                    live.remove(&name);
                }
                let mut uids = HashSet::new();
                for name in &live {
                    let id = ids.bundle_id_of(name).unwrap();
                    for user in [0, 100, 101] {
                        let uid = ids.derive_uid(id, user).unwrap();
                        prop_assert_eq!(ids.user_of_uid(uid), user);
                        prop_assert!(uids.insert(uid));
                    }
                }
            }
        }
    }

    proptest! {
        #[test]
        fn live_ids_stay_unique(ops in proptest::collection::vec((any::<bool>(), 0u8..12), 1..80)) {
            let ids = allocator(65_535);
            let mut live: HashSet<String> = HashSet::new();
            for (install, n) in ops {
                let name = format!("bundle{n}");
                if install {
                    ids.allocate(&name).unwrap();
                    live.insert(name);
                } else {
                    ids.recycle(&name);
                    live.remove(&name);
                }
                let owned: Vec<u32> =
                    live.iter().filter_map(|name| ids.bundle_id_of(name)).collect();
                let distinct: HashSet<u32> = owned.iter().copied().collect();
                prop_assert_eq!(owned.len(), live.len());
                prop_assert_eq!(distinct.len(), owned.len());
            }
        }
    }
}

// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Multi-user bookkeeping: the set of registered user ids and request selectors.

use std::collections::BTreeSet;

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// First id of a regular (non-system) user.
pub const START_USERID: i32 = 100;
/// Default foreground user.
pub const DEFAULT_USERID: i32 = 100;

/// Which user a request is made on behalf of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UserSelector {
    /// A concrete user id; must be registered.
    Id(i32),
    /// Any user that has the bundle installed.
    Any,
    /// Every user, without per-user filtering.
    All,
}

impl From<i32> for UserSelector {
    fn from(value: i32) -> Self {
        Self::Id(value)
    }
}

/// Registered user ids, guarded by their own leaf lock.
#[derive(Debug, Default)]
pub struct UserSet {
    ids: Mutex<BTreeSet<i32>>,
}

impl UserSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `user_id`; registering twice is a no-op.
    pub fn add(&self, user_id: i32) {
        self.ids.lock().insert(user_id);
    }

    /// Forgets `user_id`.
    pub fn remove(&self, user_id: i32) {
        self.ids.lock().remove(&user_id);
    }

    /// Returns true when `user_id` is registered.
    pub fn contains(&self, user_id: i32) -> bool {
        self.ids.lock().contains(&user_id)
    }

    /// Snapshot of every registered user.
    pub fn all(&self) -> BTreeSet<i32> {
        self.ids.lock().clone()
    }

    /// Validates a selector. `Any` and `All` always pass.
    pub fn resolve(&self, selector: UserSelector) -> Result<UserSelector> {
        match selector {
            UserSelector::Id(id) if !self.contains(id) => {
                log::error!("bundlemgr: user {id} is not registered");
                Err(Error::InvalidUser(id))
            }
            other => Ok(other),
        }
    }
}

// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Status callback subscription table
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: Unit tests for filtering and disconnect cleanup
//!
//! Subscribers are keyed by a stable [`SubscriberId`]. A subscriber whose channel
//! reports [`Disconnected`] is unsubscribed once the dispatch loop finishes; hosts
//! may also report a death explicitly through [`CallbackTable::on_disconnect`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use crate::events::InstallType;

/// Returned by a callback whose peer is gone.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("subscriber channel disconnected")]
pub struct Disconnected;

/// Receiver of bundle status changes.
pub trait StatusCallback: Send + Sync {
    /// Called for every notification on the subscribed bundle.
    fn on_bundle_state_changed(
        &self,
        install_type: InstallType,
        result_code: i32,
        bundle_name: &str,
    ) -> Result<(), Disconnected>;
}

/// Stable identifier of one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriberId(u64);

impl SubscriberId {
    /// Raw value, mainly for logs and tests.
    pub fn value(self) -> u64 {
        self.0
    }
}

struct Subscription {
    id: SubscriberId,
    bundle_name: String,
    callback: Arc<dyn StatusCallback>,
}

/// Subscriptions guarded by their own leaf lock.
pub struct CallbackTable {
    subscriptions: Mutex<Vec<Subscription>>,
    next_id: AtomicU64,
}

impl Default for CallbackTable {
    fn default() -> Self {
        Self { subscriptions: Mutex::new(Vec::new()), next_id: AtomicU64::new(1) }
    }
}

impl CallbackTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes `callback` to notifications about `bundle_name`.
    pub fn subscribe(
        &self,
        bundle_name: impl Into<String>,
        callback: Arc<dyn StatusCallback>,
    ) -> SubscriberId {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscriptions.lock().push(Subscription {
            id,
            bundle_name: bundle_name.into(),
            callback,
        });
        id
    }

    /// Removes a subscription; returns false when unknown.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut subscriptions = self.subscriptions.lock();
        let before = subscriptions.len();
        subscriptions.retain(|sub| sub.id != id);
        subscriptions.len() != before
    }

    /// Handles the death of a subscriber's channel.
    pub fn on_disconnect(&self, id: SubscriberId) -> bool {
        let removed = self.unsubscribe(id);
        if removed {
            log::info!("bundlemgr: subscriber {} disconnected", id.value());
        }
        removed
    }

    /// Drops every subscription.
    pub fn clear(&self) {
        self.subscriptions.lock().clear();
    }

    /// Number of live subscriptions.
    pub fn len(&self) -> usize {
        self.subscriptions.lock().len()
    }

    /// True when nobody is subscribed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invokes every subscriber of `bundle_name` outside the table lock.
    /// Returns how many callbacks were delivered.
    pub fn dispatch(
        &self,
        install_type: InstallType,
        result_code: i32,
        bundle_name: &str,
    ) -> usize {
        let targets: Vec<(SubscriberId, Arc<dyn StatusCallback>)> = self
            .subscriptions
            .lock()
            .iter()
            .filter(|sub| sub.bundle_name == bundle_name)
            .map(|sub| (sub.id, Arc::clone(&sub.callback)))
            .collect();

        let mut delivered = 0;
        let mut dead = Vec::new();
        for (id, callback) in targets {
            match callback.on_bundle_state_changed(install_type, result_code, bundle_name) {
                Ok(()) => delivered += 1,
                Err(Disconnected) => dead.push(id),
            }
        }
        for id in dead {
            self.on_disconnect(id);
        }
        delivered
    }
}

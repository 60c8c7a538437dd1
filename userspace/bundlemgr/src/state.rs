// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Install-lifecycle state machine
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: Exhaustive transition table test + visibility bookkeeping
//!
//! `InstallStateMap` only decides; the registry applies the decision under its
//! locks so a delete cascade and the state update happen together or not at all.
//!
//! The map also remembers which bundles have ever committed an install or an
//! update. Queries stay blind to a bundle until that happens.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Lifecycle state of a bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstallState {
    /// First install in progress.
    InstallStart,
    /// Install committed.
    InstallSuccess,
    /// Install aborted.
    InstallFail,
    /// Update in progress.
    UpdatingStart,
    /// Update committed.
    UpdatingSuccess,
    /// Update aborted.
    UpdatingFail,
    /// Uninstall in progress.
    UninstallStart,
    /// Uninstall completed.
    UninstallSuccess,
    /// Uninstall aborted.
    UninstallFail,
    /// Rolling back a failed update.
    RollBack,
    /// Per-user install or uninstall in progress.
    UserChange,
}

use InstallState::*;

impl InstallState {
    /// Every state, in declaration order.
    pub const ALL: [InstallState; 11] = [
        InstallStart,
        InstallSuccess,
        InstallFail,
        UpdatingStart,
        UpdatingSuccess,
        UpdatingFail,
        UninstallStart,
        UninstallSuccess,
        UninstallFail,
        RollBack,
        UserChange,
    ];

    /// States from which a move to `self` is allowed.
    pub fn allowed_predecessors(self) -> &'static [InstallState] {
        match self {
            InstallSuccess => {
                &[InstallStart, UpdatingStart, UpdatingSuccess, RollBack, UserChange]
            }
            InstallFail => &[InstallStart],
            UpdatingStart => &[InstallSuccess, InstallStart, UserChange],
            UpdatingSuccess => &[UpdatingStart, InstallSuccess, UserChange],
            UpdatingFail => &[UpdatingStart, InstallStart],
            UninstallStart => &[InstallSuccess, InstallStart, UpdatingSuccess, UserChange],
            UninstallFail => &[UninstallStart],
            UninstallSuccess => &[UninstallStart],
            RollBack => &[InstallSuccess, UpdatingStart, UpdatingSuccess],
            UserChange => &[UninstallStart, UpdatingStart, InstallSuccess, UpdatingSuccess],
            InstallStart => &[],
        }
    }

    /// Reaching this state makes the bundle visible to queries.
    pub fn is_success(self) -> bool {
        matches!(self, InstallSuccess | UpdatingSuccess)
    }

    /// Reaching this state purges the bundle record.
    pub fn is_delete_terminal(self) -> bool {
        matches!(self, InstallFail | UninstallFail | UninstallSuccess | UpdatingFail)
    }

    /// True when a move from `current` (absent when `None`) to `self` is allowed.
    pub fn accepts(self, current: Option<InstallState>) -> bool {
        match current {
            None => self == InstallStart,
            Some(current) => self.allowed_predecessors().contains(&current),
        }
    }
}

/// Outcome of a validated transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Overwrite the state entry.
    Store(InstallState),
    /// Erase the state entry and purge the bundle.
    Purge(InstallState),
}

/// `bundle_name -> InstallState`, guarded by the registry's state lock.
#[derive(Debug, Default)]
pub struct InstallStateMap {
    states: HashMap<String, InstallState>,
    succeeded: HashSet<String>,
}

impl InstallStateMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state of `bundle_name`.
    pub fn get(&self, bundle_name: &str) -> Option<InstallState> {
        self.states.get(bundle_name).copied()
    }

    /// Validates a move without applying it.
    pub fn check(&self, bundle_name: &str, target: InstallState) -> Result<Transition> {
        let current = self.get(bundle_name);
        if !target.accepts(current) {
            log::warn!("bundlemgr: reject {bundle_name} {current:?} -> {target:?}");
            return Err(Error::InvalidTransition { from: current, to: target });
        }
        Ok(if target.is_delete_terminal() {
            Transition::Purge(target)
        } else {
            Transition::Store(target)
        })
    }

    /// Applies a transition returned by [`InstallStateMap::check`].
    pub fn commit(&mut self, bundle_name: &str, transition: Transition) {
        match transition {
            Transition::Store(state) => self.seed(bundle_name, state),
            Transition::Purge(_) => {
                self.states.remove(bundle_name);
                self.succeeded.remove(bundle_name);
            }
        }
    }

    /// Seeds a state without validation; used while loading persisted records.
    pub fn seed(&mut self, bundle_name: &str, state: InstallState) {
        if state.is_success() {
            self.succeeded.insert(bundle_name.to_string());
        }
        self.states.insert(bundle_name.to_string(), state);
    }

    /// True once `bundle_name` has reached `InstallSuccess` or `UpdatingSuccess`.
    pub fn has_succeeded(&self, bundle_name: &str) -> bool {
        self.succeeded.contains(bundle_name)
    }

    /// Requires the current state to be one of `allowed`.
    pub fn require(
        &self,
        bundle_name: &str,
        allowed: &[InstallState],
        target: InstallState,
    ) -> Result<()> {
        match self.get(bundle_name) {
            Some(state) if allowed.contains(&state) => Ok(()),
            current => {
                log::error!("bundlemgr: {bundle_name} in {current:?}, need one of {allowed:?}");
                Err(Error::InvalidTransition { from: current, to: target })
            }
        }
    }
}

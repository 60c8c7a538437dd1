// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy shared by every public registry operation.

use crate::state::InstallState;

/// Result alias for bundle store operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors produced by the bundle store.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    /// Bundle, module, ability, extension or user record is absent.
    #[error("not found: {0}")]
    NotFound(String),
    /// The lifecycle state machine rejected the requested move.
    #[error("invalid transition {from:?} -> {to:?}")]
    InvalidTransition {
        /// Current state, `None` when the bundle has no state entry.
        from: Option<InstallState>,
        /// Requested target state.
        to: InstallState,
    },
    /// App or ability disabled for the requesting user.
    #[error("disabled: {0}")]
    Disabled(String),
    /// User id is not registered with the system.
    #[error("invalid user {0}")]
    InvalidUser(i32),
    /// Every bundle id up to the configured maximum is in use.
    #[error("bundle id space exhausted")]
    ExhaustedIdentitySpace,
    /// The storage collaborator reported a failure.
    #[error("persistence failure: {0}")]
    PersistenceFailure(String),
    /// Install attempted for a bundle already present.
    #[error("bundle already exists: {0}")]
    AlreadyExists(String),
    /// Implicit query descriptor carries no action, entity, uri or type.
    #[error("query descriptor is empty")]
    InvalidQuery,
}

impl From<crate::storage::StoreError> for Error {
    fn from(err: crate::storage::StoreError) -> Self {
        Self::PersistenceFailure(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::PersistenceFailure(format!("encode: {err}"))
    }
}

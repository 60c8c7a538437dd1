// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Bundle metadata store and install-lifecycle state machine
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: Unit tests per module + integration flows in tests/registry_flow.rs
//!
//! PUBLIC API:
//!   - BundleRegistry: installed bundles, lifecycle transitions, persistence, queries
//!   - IdentityAllocator: bundle id allocation and uid/gid derivation
//!   - InstallState / InstallStateMap: validated lifecycle transitions
//!   - ExceptionRecoveryHandler: repair or discard of interrupted operations on load
//!   - CapabilityResolver: explicit and implicit ability/extension resolution
//!   - BundleStore / FileOps / EventSink / NamespaceHook / StatusCallback: collaborator seams
//!
//! DEPENDENCIES:
//!   - parking_lot: registry, state and leaf locks
//!   - serde/serde_json: persisted record blobs
//!   - toml: StoreConfig files
//!   - bitflags: QueryFlags at the query boundary
//!   - semver: application and bundle versions
//!   - regex: skill uri path expressions

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

pub mod callbacks;
pub mod config;
pub mod error;
pub mod events;
pub mod fs;
pub mod identity;
pub mod projection;
pub mod record;
pub mod recovery;
pub mod registry;
pub mod resolver;
pub mod skill;
pub mod state;
pub mod storage;
pub mod user;

pub use callbacks::{CallbackTable, Disconnected, StatusCallback, SubscriberId};
pub use config::{ConfigError, StoreConfig};
pub use error::{Error, Result};
pub use events::{BundleEvent, EventKind, EventSink, InstallType, MemorySink, NotifyType, NullSink};
pub use fs::{FileOps, FsError, MemoryFs, StdFileOps};
pub use identity::{IdentityAllocator, NamespaceHook, NoopNamespace};
pub use projection::{ProjectionOptions, QueryFlags};
pub use record::{
    clone_key, AbilityInfo, ApplicationInfo, BundleRecord, BundleStatus, ExtensionInfo,
    ExtensionType, InstallPhase, ModuleInfo, PreInstallBundleInfo, SandboxAppInfo, UserRecord,
};
pub use recovery::{ExceptionRecoveryHandler, RecoveryOutcome};
pub use registry::{BundleRegistry, Collaborators, LoadReport, SignatureCompare, RESULT_OK};
pub use resolver::{CapabilityResolver, Resolved};
pub use skill::{ElementName, Skill, SkillUri, Want, ACTION_HOME, ENTITY_HOME};
pub use state::{InstallState, InstallStateMap, Transition};
pub use storage::{BundleStore, JsonDirStore, MemoryStore, StoreError};
pub use user::{UserSelector, UserSet, DEFAULT_USERID, START_USERID};

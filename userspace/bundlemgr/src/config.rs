// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Store configuration loaded from TOML.
//!
//! Every key is optional; missing keys fall back to [`StoreConfig::default`].
//!
//! ```toml
//! base_app_uid = 10000
//! max_app_uid = 65535
//! user_range = 200000
//! code_root = "/data/app/el1/bundle/public"
//! data_root = "/data/app/el2"
//! system_uids = [0, 1000]
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// First bundle id handed out by the allocator.
pub const BASE_APP_UID: u32 = 10_000;
/// Largest bundle id the allocator may hand out.
pub const MAX_APP_UID: u32 = 65_535;
/// Width of the uid window reserved for each user.
pub const BASE_USER_RANGE: u32 = 200_000;

/// Errors raised while loading a [`StoreConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Reading the configuration file failed.
    #[error("failed to read config {path}: {source}")]
    Read {
        /// File that failed to load.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The file is not valid TOML for this schema.
    #[error("failed to parse config: {0}")]
    Parse(#[source] toml::de::Error),
    /// Values are syntactically valid but inconsistent.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Tunables for identity allocation and on-disk layout.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// First bundle id handed out.
    pub base_app_uid: u32,
    /// Last bundle id that may be handed out.
    pub max_app_uid: u32,
    /// Uid window per user.
    pub user_range: u32,
    /// Root of installed bundle code directories.
    pub code_root: PathBuf,
    /// Root of per-user bundle data directories.
    pub data_root: PathBuf,
    /// Uids always treated as system callers.
    pub system_uids: Vec<i32>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            base_app_uid: BASE_APP_UID,
            max_app_uid: MAX_APP_UID,
            user_range: BASE_USER_RANGE,
            code_root: PathBuf::from("/data/app/el1/bundle/public"),
            data_root: PathBuf::from("/data/app/el2"),
            system_uids: vec![0, 1000],
        }
    }
}

impl StoreConfig {
    /// Parses and validates a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: StoreConfig = toml::from_str(text).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        Self::from_toml_str(&text)
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.user_range == 0 {
            return Err(ConfigError::Invalid("user_range must be non-zero".into()));
        }
        if i32::try_from(self.user_range).is_err() {
            return Err(ConfigError::Invalid(format!(
                "user_range {} does not fit a uid",
                self.user_range
            )));
        }
        if self.base_app_uid > self.max_app_uid {
            return Err(ConfigError::Invalid(format!(
                "base_app_uid {} exceeds max_app_uid {}",
                self.base_app_uid, self.max_app_uid
            )));
        }
        // Bundle ids are reduced modulo user_range; larger ids would alias.
        if self.max_app_uid >= self.user_range {
            return Err(ConfigError::Invalid(format!(
                "max_app_uid {} must be below user_range {}",
                self.max_app_uid, self.user_range
            )));
        }
        Ok(())
    }

    /// Code directory of a bundle.
    pub fn bundle_code_dir(&self, bundle_name: &str) -> PathBuf {
        self.code_root.join(bundle_name)
    }

    /// Code directory of one module inside a bundle.
    pub fn module_code_dir(&self, bundle_name: &str, package: &str) -> PathBuf {
        self.bundle_code_dir(bundle_name).join(package)
    }

    /// Staging directory used while a module is replaced in place.
    pub fn module_staging_dir(&self, bundle_name: &str, package: &str) -> PathBuf {
        self.bundle_code_dir(bundle_name).join(format!("{package}_tmp"))
    }

    /// Per-user data directory of a bundle.
    pub fn bundle_data_dir(&self, user_id: i32, bundle_name: &str) -> PathBuf {
        self.data_root.join(user_id.to_string()).join("base").join(bundle_name)
    }

    /// Per-user data directory of one module.
    pub fn module_data_dir(&self, user_id: i32, bundle_name: &str, package: &str) -> PathBuf {
        self.bundle_data_dir(user_id, bundle_name).join(package)
    }
}

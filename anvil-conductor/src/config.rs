// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Configuration related types used by the conductor engine

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Run the automated clean step list when a node is released; when
    /// false, non-manual cleaning goes straight to done.
    pub automated_clean: bool,
    /// Permit clean/deploy/service operations on nodes in maintenance
    /// mode. When false, an in-progress operation is aborted on the first
    /// heartbeat received while the node is in maintenance.
    pub allow_provisioning_in_maintenance: bool,
    /// Permit steps fanned out to child nodes to return an asynchronous
    /// result; when false, a child going asynchronous fails the parent
    /// step.
    pub allow_child_node_async_steps: bool,
    /// Tolerate heartbeats from nodes idling in enroll/manageable/
    /// available without logging an unsupported-state error.
    pub fast_track: bool,
    /// Collect ramdisk logs when a step fails fatally.
    pub collect_ramdisk_logs: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            automated_clean: true,
            allow_provisioning_in_maintenance: false,
            allow_child_node_async_steps: false,
            fast_track: false,
            collect_ramdisk_logs: true,
        }
    }
}

impl Config {
    /// Load a `Config` from the given TOML file
    pub fn from_file<P: AsRef<Utf8Path>>(
        path: P,
    ) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|error| {
            ConfigError::Io { error, path: path.to_owned() }
        })?;
        toml::from_str(&data).map_err(|error| ConfigError::Parse {
            error,
            path: path.to_owned(),
        })
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {path}")]
    Io {
        #[source]
        error: std::io::Error,
        path: Utf8PathBuf,
    },
    #[error("failed to parse config file: {path}")]
    Parse {
        #[source]
        error: toml::de::Error,
        path: Utf8PathBuf,
    },
}

// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration layout.
//!
//! Specify the layout of the settings file that Stackship uses to remember
//! operator input between runs, and of the project manifest it peeks into to
//! decide whether the deployed service needs proxy forwarding settings.
//!
//! Settings are an explicit value. They are loaded once at process start and
//! saved back through [`SettingsStore::save`] at well defined checkpoints,
//! never implicitly.

use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Error as FmtError, Formatter, Result as FmtResult},
    fs::{read_to_string, write},
    io::ErrorKind,
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::{debug, instrument, warn};

/// Remote port checked for conflicts when nothing else is configured.
pub const DEFAULT_REMOTE_PORT: u16 = 8228;

/// Operator input remembered between runs.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct Settings {
    /// Host alias from `~/.ssh/config` to deploy to.
    pub ssh_host: Option<String>,

    /// Folder on the remote host that holds deployed projects.
    pub remote_parent_folder: Option<String>,

    /// Port on the remote host the deployed stack publishes.
    pub remote_port: Option<u16>,

    /// Address of the reverse proxy in front of the deployed service.
    pub proxy_ip_address: Option<String>,
}

impl Settings {
    /// Remote port to check, falling back to [`DEFAULT_REMOTE_PORT`].
    pub fn remote_port_or_default(&self) -> u16 {
        self.remote_port.unwrap_or(DEFAULT_REMOTE_PORT)
    }
}

impl FromStr for Settings {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        toml::de::from_str(data).map_err(ConfigError::Deserialize)
    }
}

impl Display for Settings {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(
            toml::ser::to_string_pretty(self)
                .map_err(ConfigError::Serialize)?
                .as_str(),
        )
    }
}

/// Location of the settings file on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    /// Construct new settings store at target path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path to settings file.
    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// Load settings.
    ///
    /// A missing settings file yields default settings. So does a settings
    /// file that cannot be parsed, after warning the operator about it.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::Read`] if settings file exists but cannot be
    ///   read.
    #[instrument(skip(self), level = "debug")]
    pub fn load(&self) -> Result<Settings> {
        let data = match read_to_string(&self.path) {
            Ok(data) => data,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("no settings at {:?}, using defaults", self.path.display());
                return Ok(Settings::default());
            }
            Err(err) => {
                return Err(ConfigError::Read {
                    source: err,
                    path: self.path.clone(),
                })
            }
        };

        match data.parse() {
            Ok(settings) => Ok(settings),
            Err(err) => {
                warn!(
                    "ignoring malformed settings at {:?}: {err}",
                    self.path.display()
                );
                Ok(Settings::default())
            }
        }
    }

    /// Save settings.
    ///
    /// Creates parent directories of settings file if needed.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::Write`] if settings file cannot be written.
    /// - Return [`ConfigError::Serialize`] if settings cannot be serialized.
    #[instrument(skip(self, settings), level = "debug")]
    pub fn save(&self, settings: &Settings) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            mkdirp::mkdirp(parent).map_err(|err| ConfigError::Write {
                source: err,
                path: self.path.clone(),
            })?;
        }

        let data = toml::ser::to_string_pretty(settings)?;
        write(&self.path, data).map_err(|err| ConfigError::Write {
            source: err,
            path: self.path.clone(),
        })?;
        debug!("saved settings to {:?}", self.path.display());

        Ok(())
    }
}

/// Python project manifest, i.e., `pyproject.toml`.
///
/// Only the parts needed to detect the web framework of the deployed service
/// are modeled.
#[derive(Default, Debug, PartialEq, Clone, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    project: ManifestProject,

    #[serde(default)]
    tool: ManifestTool,
}

#[derive(Default, Debug, PartialEq, Clone, Deserialize)]
struct ManifestProject {
    #[serde(default)]
    dependencies: Vec<String>,
}

#[derive(Default, Debug, PartialEq, Clone, Deserialize)]
struct ManifestTool {
    #[serde(default)]
    poetry: Option<toml::Table>,
}

impl Manifest {
    /// Check if the project depends on FastAPI.
    ///
    /// FastAPI services run behind uvicorn, which only trusts forwarded
    /// headers from addresses listed in `FORWARDED_ALLOW_IPS`.
    pub fn uses_fastapi(&self) -> bool {
        let declared = self
            .project
            .dependencies
            .iter()
            .any(|dep| dependency_name(dep).eq_ignore_ascii_case("fastapi"));
        let poetry = self
            .tool
            .poetry
            .as_ref()
            .and_then(|poetry| poetry.get("dependencies"))
            .and_then(toml::Value::as_table)
            .is_some_and(|deps| deps.keys().any(|key| key.eq_ignore_ascii_case("fastapi")));

        declared || poetry
    }
}

impl FromStr for Manifest {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        toml::de::from_str(data).map_err(ConfigError::Deserialize)
    }
}

// INVARIANT: PEP 508 names end at the first version, extra, or marker token.
fn dependency_name(requirement: &str) -> &str {
    let end = requirement
        .find(|c: char| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
        .unwrap_or(requirement.len());
    &requirement[..end]
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to deserialize configuration.
    #[error(transparent)]
    Deserialize(#[from] toml::de::Error),

    /// Failed to serialize configuration.
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),

    /// Settings file cannot be read.
    #[error("failed to read settings at {:?}", path.display())]
    Read {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Settings file cannot be written.
    #[error("failed to write settings at {:?}", path.display())]
    Write {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },
}

impl From<ConfigError> for FmtError {
    fn from(_: ConfigError) -> Self {
        FmtError
    }
}

/// Friendly result alias :3
type Result<T, E = ConfigError> = std::result::Result<T, E>;

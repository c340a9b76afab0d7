// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Remote port and container inspection.
//!
//! Before deploying, Stackship makes sure the port the new stack will publish
//! is not already held by some other running container. When it is, the
//! owning compose stack can be shut down first.
//!
//! # Published Port Format
//!
//! The `Ports` field of `docker ps --format json` is a comma separated list of
//! mappings. Docker does not document this format as a stable contract, so
//! all knowledge about it lives in [`parse_published_ports`]. Recognized
//! mappings look like the following:
//!
//! - `0.0.0.0:8228->8228/tcp`
//! - `:::8228->8228/tcp` and `[::]:8228->8228/tcp`
//! - `0.0.0.0:8000-8001->8000-8001/tcp`
//! - `0.0.0.0:8228-8228/tcp`
//! - `8228/tcp`, which is exposed but __not__ published on the host

use crate::{
    compose::ComposeInvocation,
    remote::{quote, Remote, RemoteShell},
};

use serde::{de::DeserializeOwned, Deserialize};
use std::{collections::HashMap, ops::RangeInclusive, time::Duration};
use tracing::{debug, info, instrument, warn};

const LIST_TIMEOUT: Duration = Duration::from_secs(10);
const INSPECT_TIMEOUT: Duration = Duration::from_secs(10);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(60);

/// Label Docker Compose puts on every container it creates.
pub const WORKING_DIR_LABEL: &str = "com.docker.compose.project.working_dir";

/// One record of `docker ps --format json`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ContainerSummary {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Names")]
    pub names: String,
    #[serde(rename = "Ports", default)]
    pub ports: String,
}

#[derive(Debug, Deserialize)]
struct Inspection {
    #[serde(rename = "Config")]
    config: InspectionConfig,
}

#[derive(Debug, Deserialize)]
struct InspectionConfig {
    #[serde(rename = "Labels", default)]
    labels: Option<HashMap<String, String>>,
}

/// Running container that publishes a port the deployment needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteContainer {
    pub id: String,
    pub name: String,
    pub exposed_port: u16,

    /// Compose working directory, only known once resolved.
    pub working_dir: Option<String>,
}

/// Parse host side port ranges out of a `Ports` field.
///
/// Every comma separated mapping is inspected. Mappings that are not
/// published on the host are skipped.
///
/// # Errors
///
/// - Return [`DockerError::PortFormat`] if a published mapping has no valid
///   host port.
pub fn parse_published_ports(field: &str) -> Result<Vec<RangeInclusive<u16>>> {
    let mut ranges = Vec::new();
    for mapping in field.split(',').map(str::trim) {
        if mapping.is_empty() {
            continue;
        }

        // INVARIANT: Host side is everything before the arrow, if present.
        let host = mapping.split("->").next().unwrap_or(mapping);
        let Some((_, ports)) = host.rsplit_once(':') else {
            debug!("skipping unpublished mapping {mapping:?}");
            continue;
        };

        // INVARIANT: Arrow-less mappings carry the protocol on the host side.
        let ports = ports.split('/').next().unwrap_or(ports);
        let malformed = || DockerError::PortFormat(mapping.to_owned());
        let (start, end) = match ports.split_once('-') {
            Some((start, end)) => (start, end),
            None => (ports, ports),
        };
        let start: u16 = start.parse().map_err(|_| malformed())?;
        let end: u16 = end.parse().map_err(|_| malformed())?;
        if end < start {
            return Err(malformed());
        }

        ranges.push(start..=end);
    }

    Ok(ranges)
}

/// Decode `--format json` output of Docker commands.
///
/// Depending on version and subcommand, Docker prints either one JSON record
/// per line or a single JSON array. Both are accepted.
///
/// # Errors
///
/// - Return [`serde_json::Error`] if any record is not valid JSON.
pub fn json_records<T>(stdout: &str) -> serde_json::Result<Vec<T>>
where
    T: DeserializeOwned,
{
    if stdout.trim_start().starts_with('[') {
        return serde_json::from_str(stdout);
    }

    stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(serde_json::from_str::<T>)
        .collect()
}

/// Find running container that publishes target port.
///
/// The first container in listing order wins. Docker does not guarantee a
/// stable listing order, so which container is reported when several match
/// is unspecified. Containers with unparsable `Ports` fields are skipped with
/// a warning.
///
/// # Errors
///
/// - Return [`DockerError::Remote`] if listing containers fails.
/// - Return [`DockerError::Json`] if a listing record is not valid JSON.
#[instrument(skip(shell), level = "debug")]
pub fn find_conflict<R>(shell: &RemoteShell<R>, port: u16) -> Result<Option<RemoteContainer>>
where
    R: Remote,
{
    let stdout = shell.query("docker ps --format json", LIST_TIMEOUT)?;
    for summary in json_records::<ContainerSummary>(&stdout)? {
        let ranges = match parse_published_ports(&summary.ports) {
            Ok(ranges) => ranges,
            Err(err) => {
                warn!("ignoring container {}: {err}", summary.names);
                continue;
            }
        };

        if ranges.iter().any(|range| range.contains(&port)) {
            return Ok(Some(RemoteContainer {
                id: summary.id,
                name: summary.names,
                exposed_port: port,
                working_dir: None,
            }));
        }
    }

    Ok(None)
}

/// Resolve compose working directory of container.
///
/// Issues one `docker inspect` call the first time, and reuses the result
/// after that.
///
/// # Errors
///
/// - Return [`DockerError::Remote`] if inspecting fails.
/// - Return [`DockerError::NotComposeManaged`] if the container was not
///   created by Docker Compose.
#[instrument(skip(shell, container), fields(id = %container.id), level = "debug")]
pub fn resolve_working_dir<'c, R>(
    shell: &RemoteShell<R>,
    container: &'c mut RemoteContainer,
) -> Result<&'c str>
where
    R: Remote,
{
    if container.working_dir.is_none() {
        info!("getting the location of {}", container.name);
        let stdout = shell.query(&format!("docker inspect {}", quote(&container.id)), INSPECT_TIMEOUT)?;
        let inspections: Vec<Inspection> = serde_json::from_str(&stdout)?;
        let working_dir = inspections
            .into_iter()
            .next()
            .and_then(|inspection| inspection.config.labels)
            .and_then(|mut labels| labels.remove(WORKING_DIR_LABEL))
            .ok_or_else(|| DockerError::NotComposeManaged(container.name.clone()))?;
        container.working_dir = Some(working_dir);
    }

    Ok(container.working_dir.as_deref().unwrap_or_default())
}

/// Shut down compose stack that owns container.
///
/// # Errors
///
/// - Return [`DockerError::Remote`] if inspecting or shutting down fails.
/// - Return [`DockerError::NotComposeManaged`] if the container was not
///   created by Docker Compose.
#[instrument(skip(shell, compose, container), fields(id = %container.id), level = "debug")]
pub fn shutdown<R>(
    shell: &RemoteShell<R>,
    compose: &ComposeInvocation,
    container: &mut RemoteContainer,
) -> Result<()>
where
    R: Remote,
{
    let working_dir = resolve_working_dir(shell, container)?.to_owned();
    info!("shutting down {} ({})", container.name, container.id);
    shell.mutate(&compose.in_dir(&working_dir, "down"), SHUTDOWN_TIMEOUT)?;

    Ok(())
}

/// Docker inspection error types.
#[derive(Debug, thiserror::Error)]
pub enum DockerError {
    /// Remote Docker command fails.
    #[error(transparent)]
    Remote(#[from] crate::remote::RemoteError),

    /// Docker output is not the expected JSON.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Port mapping has unexpected format.
    #[error("unrecognized port mapping {0:?}")]
    PortFormat(String),

    /// Container carries no compose working directory label.
    #[error("container {0:?} was not started by Docker Compose")]
    NotComposeManaged(String),
}

/// Friendly result alias :3
pub type Result<T, E = DockerError> = std::result::Result<T, E>;

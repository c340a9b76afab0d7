// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! File synchronization.
//!
//! Transfers the local project onto the remote target as an overlay: files are
//! added and updated, but nothing already on the remote side is deleted.
//! Paths ignored by Git are excluded, so local build artifacts and secrets
//! never leave the operator's machine.

use crate::{
    deploy::DeploymentTarget,
    preflight::{self, LocalProject},
};

use std::{
    ffi::{OsStr, OsString},
    io::Write,
    path::Path,
    process::Command,
};
use tempfile::NamedTempFile;
use tracing::{debug, info, instrument};

/// Copy a local folder onto a remote destination.
pub trait FileTransfer {
    /// Transfer contents of source folder to `host:path` destination.
    ///
    /// Paths listed in the exclusion file, one pattern per line, are skipped.
    fn transfer(&self, source: &Path, destination: &str, exclude_from: &Path) -> Result<()>;
}

impl<T> FileTransfer for &T
where
    T: FileTransfer + ?Sized,
{
    fn transfer(&self, source: &Path, destination: &str, exclude_from: &Path) -> Result<()> {
        (**self).transfer(source, destination, exclude_from)
    }
}

/// Transfer files with the `rsync` executable over `ssh`.
#[derive(Debug, Default, Clone)]
pub struct Rsync;

impl Rsync {
    /// Seconds of I/O inactivity before `rsync` gives up.
    pub const TIMEOUT_SECS: u64 = 60;

    /// Arguments for one transfer, relative to the source folder.
    pub fn args(destination: &str, exclude_from: &Path) -> Vec<OsString> {
        let mut exclude = OsString::from("--exclude-from=");
        exclude.push(exclude_from.as_os_str());

        vec![
            "--quiet".into(),
            "--recursive".into(),
            "--compress".into(),
            "--rsh=ssh".into(),
            "--perms".into(),
            "--times".into(),
            "--group".into(),
            format!("--timeout={}", Self::TIMEOUT_SECS).into(),
            exclude,
            ".".into(),
            destination.into(),
        ]
    }
}

impl FileTransfer for Rsync {
    #[instrument(skip(self, source, exclude_from), level = "debug")]
    fn transfer(&self, source: &Path, destination: &str, exclude_from: &Path) -> Result<()> {
        let output = syscall_non_interactive(source, "rsync", Self::args(destination, exclude_from))?;
        if !output.is_empty() {
            debug!("{output}");
        }

        Ok(())
    }
}

/// Exclusion list anchored to the transfer root.
///
/// Anchoring keeps a pattern like `build` from also excluding some nested
/// `src/build` folder that Git does track.
pub fn exclusion_list(ignored: &[String]) -> String {
    ignored
        .iter()
        .map(|path| format!("/{}\n", path.trim_start_matches('/')))
        .collect()
}

/// Sync local project onto remote target.
///
/// The ignore list is always computed. The transfer itself is skipped on a
/// dry run. The temporary exclusion file is removed when this returns, on
/// success and failure alike.
///
/// # Errors
///
/// - Return [`SyncError::Preflight`] if Git ignore status cannot be read.
/// - Return [`SyncError::Io`] if exclusion file cannot be written.
/// - Return [`SyncError::Syscall`] if the transfer fails.
#[instrument(skip(transfer, project, target), fields(target = %target), level = "debug")]
pub fn sync<T>(
    transfer: &T,
    project: &LocalProject,
    host: &str,
    target: &DeploymentTarget,
    dry_run: bool,
) -> Result<()>
where
    T: FileTransfer,
{
    let ignored = project.ignored_paths()?;
    debug!("excluding {} ignored path(s): {ignored:?}", ignored.len());

    let destination = format!("{host}:{}", target.path());
    info!("syncing {} to {destination}", project.name());
    if dry_run {
        return Ok(());
    }

    let mut exclusions = NamedTempFile::new()?;
    exclusions.write_all(exclusion_list(&ignored).as_bytes())?;
    exclusions.flush()?;

    transfer.transfer(project.root(), &destination, exclusions.path())
}

fn syscall_non_interactive(
    dir: &Path,
    cmd: impl AsRef<OsStr>,
    args: impl IntoIterator<Item = impl AsRef<OsStr>>,
) -> Result<String> {
    let output = Command::new(cmd.as_ref())
        .args(args)
        .current_dir(dir)
        .output()?;
    let stdout = String::from_utf8_lossy(output.stdout.as_slice()).into_owned();
    let stderr = String::from_utf8_lossy(output.stderr.as_slice()).into_owned();
    let mut message = String::new();

    if !stdout.is_empty() {
        message.push_str(format!("stdout: {stdout}").as_str());
    }

    if !stderr.is_empty() {
        message.push_str(format!("stderr: {stderr}").as_str());
    }

    // INVARIANT: Chomp trailing newlines.
    let message = message.trim_end_matches(['\r', '\n']).to_owned();

    if !output.status.success() {
        return Err(SyncError::Syscall {
            command: cmd.as_ref().to_string_lossy().into_owned(),
            message,
        });
    }

    Ok(message)
}

/// File synchronization error types.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Preflight(#[from] preflight::PreflightError),

    /// External transfer command exits unsuccessfully.
    #[error("command {command:?} failed:\n{message}")]
    Syscall { command: String, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Friendly result alias :3
pub type Result<T, E = SyncError> = std::result::Result<T, E>;

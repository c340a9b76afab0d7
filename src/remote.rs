// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Remote command channel.
//!
//! Every interaction with the remote host is a single shell command string
//! executed to completion over one long lived session. Success is an exit
//! status of zero. Captured stdout is parsed by the caller, either as
//! newline-delimited sentinel lines, or as newline-delimited JSON records.
//!
//! # Dry Runs
//!
//! Commands are split into two kinds. __Queries__ only observe remote state,
//! and always execute. __Mutations__ change remote state, and are skipped
//! entirely during a dry run. [`RemoteShell`] enforces this split for every
//! stage, so no stage needs to consult the dry run flag on its own to decide
//! whether a command may touch the remote host.
//!
//! # See Also
//!
//! 1. [`ssh`] for the production transport.

pub mod ssh;

use std::time::Duration;
use tracing::{debug, instrument};

/// Captured result of a remote command.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RemoteOutput {
    /// Exit status reported by the remote shell.
    pub status: i32,

    /// Everything the command wrote to stdout.
    pub stdout: String,

    /// Everything the command wrote to stderr.
    pub stderr: String,
}

impl RemoteOutput {
    /// Check if the command exited successfully.
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Run shell commands on a remote host.
pub trait Remote {
    /// Run command to completion, giving up after the given timeout.
    ///
    /// A non-zero exit status is __not__ an error at this level. Only
    /// transport level failures are, e.g., the timeout expiring.
    fn exec(&self, command: &str, timeout: Duration) -> Result<RemoteOutput>;
}

impl<R> Remote for &R
where
    R: Remote + ?Sized,
{
    fn exec(&self, command: &str, timeout: Duration) -> Result<RemoteOutput> {
        (**self).exec(command, timeout)
    }
}

/// Remote command runner with dry run policy and exit status checking.
#[derive(Debug)]
pub struct RemoteShell<R>
where
    R: Remote,
{
    remote: R,
    dry_run: bool,
}

impl<R> RemoteShell<R>
where
    R: Remote,
{
    /// Construct new remote shell.
    pub fn new(remote: R, dry_run: bool) -> Self {
        Self { remote, dry_run }
    }

    /// Check if mutations are being skipped.
    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Run command that only observes remote state.
    ///
    /// Always executes, even on a dry run. Returns captured stdout.
    ///
    /// # Errors
    ///
    /// - Return [`RemoteError::Failed`] if command exits with non-zero status.
    /// - Return any transport error from the underlying [`Remote`].
    #[instrument(skip(self, timeout), level = "debug")]
    pub fn query(&self, command: &str, timeout: Duration) -> Result<String> {
        let output = self.remote.exec(command, timeout)?;
        check(command, output)
    }

    /// Run command that changes remote state.
    ///
    /// Skipped on a dry run, yielding [`None`]. Otherwise returns captured
    /// stdout.
    ///
    /// # Errors
    ///
    /// - Return [`RemoteError::Failed`] if command exits with non-zero status.
    /// - Return any transport error from the underlying [`Remote`].
    #[instrument(skip(self, timeout), level = "debug")]
    pub fn mutate(&self, command: &str, timeout: Duration) -> Result<Option<String>> {
        if self.dry_run {
            debug!("dry run, skipping: {command}");
            return Ok(None);
        }

        let output = self.remote.exec(command, timeout)?;
        check(command, output).map(Some)
    }

    /// Run command that changes remote state, tolerating non-zero exit.
    ///
    /// Skipped on a dry run, yielding [`None`]. Otherwise the full output is
    /// handed back for the caller to judge.
    ///
    /// # Errors
    ///
    /// - Return any transport error from the underlying [`Remote`].
    #[instrument(skip(self, timeout), level = "debug")]
    pub fn mutate_lenient(&self, command: &str, timeout: Duration) -> Result<Option<RemoteOutput>> {
        if self.dry_run {
            debug!("dry run, skipping: {command}");
            return Ok(None);
        }

        self.remote.exec(command, timeout).map(Some)
    }
}

fn check(command: &str, output: RemoteOutput) -> Result<String> {
    if !output.success() {
        return Err(RemoteError::Failed {
            command: command.to_owned(),
            status: output.status,
            stderr: output.stderr.trim_end().to_owned(),
        });
    }

    Ok(output.stdout)
}

/// Wrap value in single quotes for the remote shell.
///
/// Embedded single quotes are closed, escaped, and reopened, so the result is
/// always exactly one shell word.
pub fn quote(value: impl AsRef<str>) -> String {
    format!("'{}'", value.as_ref().replace('\'', r"'\''"))
}

/// Remote command error types.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    /// Command ran, but exited with non-zero status.
    #[error("remote command `{command}` failed with status {status}: {stderr}")]
    Failed {
        command: String,
        status: i32,
        stderr: String,
    },

    /// Command did not finish before its timeout.
    #[error("remote command `{command}` timed out after {}s", timeout.as_secs())]
    Timeout { command: String, timeout: Duration },

    /// Session level failure while running a command.
    #[error(transparent)]
    Ssh(#[from] ssh2::Error),

    /// Stream level failure while reading command output.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Friendly result alias :3
pub type Result<T, E = RemoteError> = std::result::Result<T, E>;

// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Remote project status probing.
//!
//! One composite shell script inspects the remote project folder and prints a
//! fixed sentinel line for every condition that holds. A missing sentinel
//! means the condition is false. Control flow never looks at the sentinel
//! text itself, only at the [`RemoteState`] decoded from it.

use crate::{
    deploy::DeploymentTarget,
    remote::{self, quote, Remote, RemoteShell},
};

use std::time::Duration;
use tracing::{info, instrument};

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

pub const FOLDER_EXISTS: &str = "project folder exists";
pub const GIT_FOLDER_EXISTS: &str = ".git folder exists";
pub const GIT_IS_CLEAN: &str = "Git is clean";
pub const DOTENV_EXISTS: &str = ".env file exists";

/// Raw facts about the remote project folder.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProjectStatus {
    pub folder_exists: bool,
    pub git_folder_exists: bool,

    /// Only meaningful when `git_folder_exists` holds.
    pub git_is_clean: bool,
    pub dotenv_exists: bool,
}

impl ProjectStatus {
    /// Decode sentinel lines printed by [`probe_script`].
    ///
    /// Lines are matched exactly after trimming. Unknown lines are ignored.
    pub fn parse(stdout: &str) -> Self {
        let mut status = Self::default();
        for line in stdout.lines().map(str::trim) {
            match line {
                FOLDER_EXISTS => status.folder_exists = true,
                GIT_FOLDER_EXISTS => status.git_folder_exists = true,
                GIT_IS_CLEAN => status.git_is_clean = true,
                DOTENV_EXISTS => status.dotenv_exists = true,
                _ => continue,
            }
        }

        status
    }

    /// Classify status for reconciliation.
    pub fn state(&self) -> RemoteState {
        if !self.folder_exists {
            return RemoteState::Absent;
        }

        // INVARIANT: Cleanliness is only trusted when a .git folder exists.
        let git = match (self.git_folder_exists, self.git_is_clean) {
            (false, _) => GitState::Untracked,
            (true, true) => GitState::Clean,
            (true, false) => GitState::Dirty,
        };

        RemoteState::Present {
            git,
            dotenv: self.dotenv_exists,
        }
    }
}

/// Git condition of an existing remote project folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitState {
    Clean,
    Dirty,

    /// Folder exists, but has no `.git` folder.
    Untracked,
}

/// Classified remote project state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteState {
    Absent,
    Present { git: GitState, dotenv: bool },
}

/// Shell script that prints one sentinel line per true condition.
pub fn probe_script(target: &DeploymentTarget) -> String {
    let folder = quote(target.path());
    let git_folder = quote(format!("{}/.git", target.path()));
    let dotenv = quote(format!("{}/.env", target.path()));

    format!(
        "if [ -d {folder} ]; then\n\
         \x20   echo '{FOLDER_EXISTS}'\n\
         \x20   if [ -d {git_folder} ]; then\n\
         \x20       echo '{GIT_FOLDER_EXISTS}'\n\
         \x20       is_clean=$(git -C {folder} status --porcelain)\n\
         \x20       if [ -z \"$is_clean\" ]; then\n\
         \x20           echo '{GIT_IS_CLEAN}'\n\
         \x20       fi\n\
         \x20   fi\n\
         \x20   if [ -f {dotenv} ]; then\n\
         \x20       echo '{DOTENV_EXISTS}'\n\
         \x20   fi\n\
         fi\n"
    )
}

/// Probe remote project folder with exactly one remote command.
///
/// Read only, so it runs on a dry run as well.
///
/// # Errors
///
/// - Return [`remote::RemoteError`] if the probe script fails or times out.
#[instrument(skip(shell, target), fields(target = %target), level = "debug")]
pub fn probe<R>(shell: &RemoteShell<R>, target: &DeploymentTarget) -> remote::Result<ProjectStatus>
where
    R: Remote,
{
    info!("checking the status of the {} project", target.name());
    let stdout = shell.query(&probe_script(target), PROBE_TIMEOUT)?;

    Ok(ProjectStatus::parse(&stdout))
}

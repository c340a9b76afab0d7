// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Reconciliation of remote project state.
//!
//! Maps the probed [`RemoteState`] to a recovery action:
//!
//! - __Absent__: nothing to reconcile, the sync stage creates the folder.
//! - __Present__: the operator picks one of [`ReconcileAction`].
//!
//! A reset is destructive and always runs in the same order: stop the compose
//! stack, enumerate its volumes, delete exactly those volumes, then delete
//! the folder. Volumes and the folder are never touched while the stack may
//! still be running.

use crate::{
    compose::ComposeInvocation,
    deploy::{
        probe::{GitState, ProjectStatus, RemoteState},
        DeploymentTarget,
    },
    docker::json_records,
    prompt::{self, Prompter},
    remote::{self, quote, Remote, RemoteShell},
};

use serde::Deserialize;
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    time::Duration,
};
use tracing::{info, instrument, warn};

const DOWN_TIMEOUT: Duration = Duration::from_secs(60);
const VOLUMES_TIMEOUT: Duration = Duration::from_secs(10);
const VOLUME_RM_TIMEOUT: Duration = Duration::from_secs(20);
const RM_TIMEOUT: Duration = Duration::from_secs(15);

/// Operator's choice for an existing remote project.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Overlay tracked files onto the existing folder and redeploy.
    Update,

    /// Delete volumes and folder, then deploy from scratch.
    Reset,

    /// Stop here without touching anything.
    Cancel,
}

impl ReconcileAction {
    pub const ALL: [Self; 3] = [Self::Update, Self::Reset, Self::Cancel];
}

impl Display for ReconcileAction {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        let label = match self {
            Self::Update => "Update files tracked by Git and redeploy",
            Self::Reset => "Delete any volumes and the folder, create a new folder, and redeploy",
            Self::Cancel => "Cancel redeployment",
        };
        fmt.write_str(label)
    }
}

#[derive(Debug, Deserialize)]
struct VolumeSummary {
    #[serde(rename = "Name")]
    name: String,
}

/// Drive remote project into a deployable state.
pub struct Reconciler<'run, R, P>
where
    R: Remote,
    P: Prompter,
{
    shell: &'run RemoteShell<R>,
    compose: &'run ComposeInvocation,
    prompter: P,
    host: &'run str,
}

impl<'run, R, P> Reconciler<'run, R, P>
where
    R: Remote,
    P: Prompter,
{
    /// Construct new reconciler.
    ///
    /// The host alias is only used for narration.
    pub fn new(
        shell: &'run RemoteShell<R>,
        compose: &'run ComposeInvocation,
        prompter: P,
        host: &'run str,
    ) -> Self {
        Self {
            shell,
            compose,
            prompter,
            host,
        }
    }

    /// Decide and apply the recovery action for the probed status.
    ///
    /// Returns [`None`] when the project is absent, and there was nothing to
    /// decide. The status is updated to reflect the applied action.
    ///
    /// # Errors
    ///
    /// - Return [`ReconcileError::Prompt`] if operator choice cannot be read.
    /// - Return [`ReconcileError::Remote`] if a reset step fails.
    #[instrument(skip(self, target, status), level = "debug")]
    pub fn reconcile(
        &mut self,
        target: &DeploymentTarget,
        status: &mut ProjectStatus,
    ) -> Result<Option<ReconcileAction>> {
        let name = target.name();
        let git = match status.state() {
            RemoteState::Absent => {
                info!("the {name} project does not yet exist on {}", self.host);
                return Ok(None);
            }
            RemoteState::Present { git, .. } => git,
        };

        match git {
            GitState::Clean => info!(
                "the {name} project already exists on {} and its Git is clean",
                self.host
            ),
            GitState::Dirty => warn!(
                "the {name} project already exists on {}, but its Git is dirty",
                self.host
            ),
            GitState::Untracked => warn!(
                "a folder named {name:?} already exists on {}, but it has no .git folder",
                self.host
            ),
        }

        let action = self
            .prompter
            .select("What do you want to do?", ReconcileAction::ALL.to_vec())?;
        self.apply(action, target, status)?;

        Ok(Some(action))
    }

    /// Apply chosen action.
    ///
    /// # Errors
    ///
    /// - Return [`ReconcileError::Remote`] if a reset step fails.
    pub fn apply(
        &self,
        action: ReconcileAction,
        target: &DeploymentTarget,
        status: &mut ProjectStatus,
    ) -> Result<()> {
        match action {
            ReconcileAction::Update => {
                info!("updating files tracked by Git in place");
                Ok(())
            }
            ReconcileAction::Reset => self.reset(target, status),
            ReconcileAction::Cancel => {
                info!("redeployment canceled");
                Ok(())
            }
        }
    }

    /// Destroy remote project: stack, volumes, then folder.
    ///
    /// Failing to delete every file of the folder is only a warning, since
    /// files created by containers are often owned by root. The remote `.env`
    /// is considered gone afterwards either way.
    ///
    /// # Errors
    ///
    /// - Return [`ReconcileError::Remote`] if stopping the stack, listing its
    ///   volumes, or deleting them fails.
    #[instrument(skip(self, target, status), fields(target = %target), level = "debug")]
    pub fn reset(&self, target: &DeploymentTarget, status: &mut ProjectStatus) -> Result<()> {
        info!("making sure no services are running in the remote project folder");
        self.shell
            .mutate(&self.compose.in_dir(target.path(), "down"), DOWN_TIMEOUT)?;

        info!("deleting any volumes");
        let stdout = self.shell.query(
            &self.compose.in_dir(target.path(), "volumes --format json"),
            VOLUMES_TIMEOUT,
        )?;
        let volumes = json_records::<VolumeSummary>(&stdout)?
            .into_iter()
            .map(|volume| quote(volume.name))
            .collect::<Vec<_>>();
        if volumes.is_empty() {
            info!("no volumes to delete");
        } else {
            self.shell.mutate(
                &format!("docker volume rm {}", volumes.join(" ")),
                VOLUME_RM_TIMEOUT,
            )?;
        }

        info!("deleting the folder");
        status.dotenv_exists = false;
        let output = self
            .shell
            .mutate_lenient(&format!("rm -rf {}", quote(target.path())), RM_TIMEOUT)?;
        if let Some(output) = output.filter(|output| !output.success()) {
            warn!(
                "some files in {} could not be deleted: {}",
                target.path(),
                output.stderr.trim_end()
            );
        }

        Ok(())
    }
}

/// Reconciliation error types.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Remote(#[from] remote::RemoteError),

    /// Volume listing is not the expected JSON.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Prompt(#[from] prompt::PromptError),
}

/// Friendly result alias :3
pub type Result<T, E = ReconcileError> = std::result::Result<T, E>;

// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Remote deployment pipeline.
//!
//! A deployment reconciles whatever is on the remote host with the local
//! project, then (re)starts the compose stack. The stages always run in the
//! same order:
//!
//! 1. Port inspection: a container already publishing the target port is
//!    either shut down or the deployment is canceled.
//! 2. Target selection: the operator confirms the remote parent folder.
//! 3. Probe: one remote call classifies the remote project folder.
//! 4. Reconciliation: nothing, update in place, or destructive reset.
//! 5. Sync: Git-aware overlay transfer of the project files.
//! 6. Environment: remote `.env` is created if missing.
//! 7. Lifecycle: `compose up -d`, then status monitoring until interrupted.
//!
//! # Dry Runs
//!
//! Every mutating remote command and the file transfer are skipped, while
//! all read-only probes still run. The narration is identical, so a dry run
//! shows exactly what a real run would do.
//!
//! # Cancellation
//!
//! The operator can cancel at any prompt. Cancellation is terminal, but it is
//! not a failure: [`Deployment::run`] reports [`Outcome::Canceled`].

pub mod dotenv;
pub mod lifecycle;
pub mod probe;
pub mod reconcile;
pub mod sync;

use crate::{
    compose::ComposeInvocation,
    config::{ConfigError, Settings, SettingsStore},
    docker::{self, RemoteContainer},
    path,
    preflight::LocalProject,
    prompt::{PromptError, Prompter},
    remote::{self, quote, Remote, RemoteShell},
};
use probe::ProjectStatus;
use reconcile::{ReconcileAction, Reconciler};
use sync::FileTransfer;

use indicatif::ProgressBar;
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    future::Future,
    time::Duration,
};
use tracing::{info, instrument};

const MKDIR_TIMEOUT: Duration = Duration::from_secs(5);

/// Remote project folder, i.e., `<parent folder>/<project name>`.
///
/// Neither half may contain single quotes, since every remote command wraps
/// paths in single quotes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentTarget {
    parent: String,
    name: String,
    path: String,
}

impl DeploymentTarget {
    /// Construct new deployment target.
    ///
    /// Trailing slashes of the parent folder are dropped.
    ///
    /// # Errors
    ///
    /// - Return [`DeployError::SingleQuote`] if either half has a single
    ///   quote.
    /// - Return [`DeployError::RootParent`] if parent folder is `/` or empty.
    /// - Return [`DeployError::EmptyName`] if project name is empty.
    pub fn new(parent: impl AsRef<str>, name: impl AsRef<str>) -> Result<Self> {
        let raw = parent.as_ref().trim();
        let name = name.as_ref();

        for value in [raw, name] {
            if value.contains('\'') {
                return Err(DeployError::SingleQuote(value.to_owned()));
            }
        }

        let parent = raw.trim_end_matches('/');
        if parent.is_empty() {
            return Err(DeployError::RootParent);
        }

        if name.is_empty() || name.contains('/') {
            return Err(DeployError::EmptyName);
        }

        Ok(Self {
            parent: parent.to_owned(),
            name: name.to_owned(),
            path: format!("{parent}/{name}"),
        })
    }

    /// Remote parent folder.
    pub fn parent(&self) -> &str {
        self.parent.as_str()
    }

    /// Project folder name.
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Full remote project path.
    pub fn path(&self) -> &str {
        self.path.as_str()
    }
}

impl Display for DeploymentTarget {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(&self.path)
    }
}

/// How a deployment attempt ended, short of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Deployed,
    Canceled,
}

/// What to do about a port conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConflictChoice {
    ShutDown,
    Cancel,
}

impl Display for ConflictChoice {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::ShutDown => fmt.write_str("Shut down the existing services"),
            Self::Cancel => fmt.write_str("Cancel deployment"),
        }
    }
}

/// Everything a deployment run reads, shared with the caller.
pub struct RunContext<'run> {
    /// Local project being deployed.
    pub project: &'run LocalProject,

    /// Compose prefix shared by every compose call of the run.
    pub compose: &'run ComposeInvocation,

    /// SSH host alias, used for `rsync` and narration.
    pub host: &'run str,

    /// Settings, saved back after each confirmed answer.
    pub settings: &'run mut Settings,
    pub store: &'run SettingsStore,
}

/// One deployment attempt.
///
/// Remote commands go through the shell, operator input through the
/// prompter, and file copies through the transfer engine. All three are
/// traits, so the whole pipeline runs against test doubles as well.
pub struct Deployment<'run, R, P, T>
where
    R: Remote,
    P: Prompter,
    T: FileTransfer,
{
    context: RunContext<'run>,
    shell: RemoteShell<R>,
    prompter: P,
    transfer: T,
    monitor_interval: Duration,
}

impl<'run, R, P, T> Deployment<'run, R, P, T>
where
    R: Remote,
    P: Prompter,
    T: FileTransfer,
{
    /// Construct new deployment.
    pub fn new(context: RunContext<'run>, shell: RemoteShell<R>, prompter: P, transfer: T) -> Self {
        Self {
            context,
            shell,
            prompter,
            transfer,
            monitor_interval: lifecycle::MONITOR_INTERVAL,
        }
    }

    /// Use a different pause between status polls.
    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval = interval;
        self
    }

    /// Run every stage of the deployment.
    ///
    /// The shutdown future ends status monitoring, e.g., on Ctrl+C.
    ///
    /// # Errors
    ///
    /// - Return [`DeployError`] for any fatal stage failure. Operator
    ///   cancellation is __not__ an error.
    pub async fn run<F>(mut self, shutdown: F) -> Result<Outcome>
    where
        F: Future<Output = ()>,
    {
        match self.stages(shutdown).await {
            Err(err) if err.is_canceled() => {
                info!("deployment canceled");
                Ok(Outcome::Canceled)
            }
            result => result,
        }
    }

    async fn stages<F>(&mut self, shutdown: F) -> Result<Outcome>
    where
        F: Future<Output = ()>,
    {
        let port = self.context.settings.remote_port_or_default();
        if self.clear_port(port)? == Outcome::Canceled {
            return Ok(Outcome::Canceled);
        }

        let target = self.choose_target()?;
        self.ensure_parent(&target)?;

        let mut status = probe::probe(&self.shell, &target)?;
        let action = Reconciler::new(
            &self.shell,
            self.context.compose,
            &mut self.prompter,
            self.context.host,
        )
        .reconcile(&target, &mut status)?;
        if action == Some(ReconcileAction::Cancel) {
            return Ok(Outcome::Canceled);
        }

        sync::sync(
            &self.transfer,
            self.context.project,
            self.context.host,
            &target,
            self.shell.is_dry_run(),
        )?;
        self.provision_dotenv(&status, &target)?;

        lifecycle::start(&self.shell, self.context.compose, &target, ProgressBar::new_spinner())?;
        lifecycle::monitor(
            &self.shell,
            self.context.compose,
            &target,
            self.monitor_interval,
            shutdown,
        )
        .await?;

        Ok(Outcome::Deployed)
    }

    /// Make sure target port is free, asking to shut down its owner if not.
    #[instrument(skip(self), level = "debug")]
    fn clear_port(&mut self, port: u16) -> Result<Outcome> {
        let host = self.context.host;
        info!("checking whether port {port} is already in use on {host}");
        let Some(mut container) = docker::find_conflict(&self.shell, port)? else {
            info!("port {port} is available");
            return Ok(Outcome::Deployed);
        };

        info!(
            "port {port} is already in use by {} ({}) on {host}",
            container.name, container.id
        );
        let choice = self.prompter.select(
            "What do you want to do?",
            vec![ConflictChoice::ShutDown, ConflictChoice::Cancel],
        )?;
        if choice == ConflictChoice::Cancel {
            return Ok(Outcome::Canceled);
        }

        self.shut_down(&mut container)?;
        Ok(Outcome::Deployed)
    }

    fn shut_down(&self, container: &mut RemoteContainer) -> Result<()> {
        docker::shutdown(&self.shell, self.context.compose, container)?;
        Ok(())
    }

    /// Ask for remote parent folder, and remember the answer.
    fn choose_target(&mut self) -> Result<DeploymentTarget> {
        let default = match &self.context.settings.remote_parent_folder {
            Some(folder) => folder.clone(),
            None => path::default_remote_parent_folder()?,
        };
        let parent = self
            .prompter
            .text("Remote parent folder", Some(default.as_str()))?;
        let target = DeploymentTarget::new(&parent, self.context.project.name())?;

        self.context.settings.remote_parent_folder = Some(target.parent().to_owned());
        self.context.store.save(self.context.settings)?;

        Ok(target)
    }

    fn ensure_parent(&self, target: &DeploymentTarget) -> Result<()> {
        info!(
            "making sure the project's parent folder exists on {}",
            self.context.host
        );
        self.shell.mutate(
            &format!("mkdir --parents {}", quote(target.parent())),
            MKDIR_TIMEOUT,
        )?;

        Ok(())
    }

    fn provision_dotenv(&mut self, status: &ProjectStatus, target: &DeploymentTarget) -> Result<()> {
        let project = self.context.project;
        let settings = &mut *self.context.settings;
        let store = self.context.store;

        dotenv::ensure_dotenv(&self.shell, &mut self.prompter, status, target, |prompter| {
            let local = project.read_dotenv()?;
            let mut proxy = None;
            if project.uses_fastapi() {
                proxy = dotenv::proxy_address(prompter, settings.proxy_ip_address.as_deref())?;
                if let Some(address) = &proxy {
                    settings.proxy_ip_address = Some(address.clone());
                    store.save(settings)?;
                }
            }

            Ok(dotenv::seed_text(local.as_deref(), proxy.as_deref()))
        })?;

        Ok(())
    }
}

/// Read-only snapshot of the remote host for one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub port: u16,

    /// Running container already publishing the port.
    pub conflict: Option<RemoteContainer>,
    pub project: ProjectStatus,
}

/// Inspect target port and remote project folder without changing anything.
///
/// # Errors
///
/// - Return [`DeployError::Docker`] if containers cannot be listed.
/// - Return [`DeployError::Remote`] if project probe fails.
#[instrument(skip(remote, target), fields(target = %target), level = "debug")]
pub fn inspect_status<R>(remote: R, target: &DeploymentTarget, port: u16) -> Result<StatusReport>
where
    R: Remote,
{
    // INVARIANT: Status never changes the remote host.
    let shell = RemoteShell::new(remote, true);
    let conflict = docker::find_conflict(&shell, port)?;
    let project = probe::probe(&shell, target)?;

    Ok(StatusReport {
        port,
        conflict,
        project,
    })
}

/// Deployment error types.
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    /// Remote path contains a single quote.
    #[error("remote paths must not contain single quotes: {0:?}")]
    SingleQuote(String),

    /// Root folder chosen as remote parent folder.
    #[error("you cannot choose the root folder as the remote parent folder")]
    RootParent,

    /// Project name cannot name a folder.
    #[error("project name must be a single non-empty folder name")]
    EmptyName,

    #[error(transparent)]
    Prompt(#[from] PromptError),

    #[error(transparent)]
    Remote(#[from] remote::RemoteError),

    #[error(transparent)]
    Docker(#[from] docker::DockerError),

    #[error(transparent)]
    Reconcile(#[from] reconcile::ReconcileError),

    #[error(transparent)]
    Sync(#[from] sync::SyncError),

    #[error(transparent)]
    Dotenv(#[from] dotenv::DotenvError),

    #[error(transparent)]
    Lifecycle(#[from] lifecycle::LifecycleError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    NoWayHome(#[from] path::NoWayHome),
}

impl DeployError {
    /// Check if error only means the operator backed out.
    pub fn is_canceled(&self) -> bool {
        matches!(
            self,
            Self::Prompt(PromptError::Canceled)
                | Self::Reconcile(reconcile::ReconcileError::Prompt(PromptError::Canceled))
                | Self::Dotenv(dotenv::DotenvError::Prompt(PromptError::Canceled))
        )
    }
}

/// Friendly result alias :3
pub type Result<T, E = DeployError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use simple_test_case::test_case;

    #[test_case("/srv/apps", "/srv/apps/demo"; "plain")]
    #[test_case("/srv/apps/", "/srv/apps/demo"; "trailing slash")]
    #[test_case("  repos ", "repos/demo"; "relative to remote home")]
    #[test]
    fn target_joins_parent_and_name(parent: &str, expect: &str) -> anyhow::Result<()> {
        let target = DeploymentTarget::new(parent, "demo")?;
        pretty_assertions::assert_eq!(target.path(), expect);
        pretty_assertions::assert_eq!(target.to_string(), expect);

        Ok(())
    }

    #[test]
    fn target_rejects_unsafe_input() {
        assert!(matches!(
            DeploymentTarget::new("/srv/bob's", "demo"),
            Err(DeployError::SingleQuote(_))
        ));
        assert!(matches!(
            DeploymentTarget::new("/srv", "it's"),
            Err(DeployError::SingleQuote(_))
        ));
        assert!(matches!(
            DeploymentTarget::new("/", "demo"),
            Err(DeployError::RootParent)
        ));
        assert!(matches!(
            DeploymentTarget::new("///", "demo"),
            Err(DeployError::RootParent)
        ));
        assert!(matches!(
            DeploymentTarget::new("/srv", ""),
            Err(DeployError::EmptyName)
        ));
    }

    #[test]
    fn nested_cancellation_is_recognized() {
        let err = DeployError::from(reconcile::ReconcileError::Prompt(PromptError::Canceled));
        assert!(err.is_canceled());
        assert!(!DeployError::RootParent.is_canceled());
    }
}

// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use stackship::{
    compose::{self, ComposeError, ComposeFiles},
    config::SettingsStore,
    deploy::{
        self,
        probe::{GitState, RemoteState},
        sync::Rsync,
        Deployment, DeploymentTarget, Outcome, RunContext,
    },
    path::{default_remote_parent_folder, default_settings_file, known_hosts_file, ssh_config_file},
    preflight::{require_executables, LocalProject, REQUIRED_EXECUTABLES},
    prompt::{InquirePrompter, PromptError, Prompter},
    remote::{
        ssh::{SshConfig, SshSession},
        RemoteShell,
    },
};

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use std::{env::current_dir, process::exit, time::Duration};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "stackship [options] <command>",
    subcommand_help_heading = "Commands",
    version
)]
struct Cli {
    /// Show debug output, e.g., every remote command.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    async fn run(self) -> Result<()> {
        match self.command {
            Command::Deploy(opts) => run_deploy(opts).await,
            Command::Status => run_status(),
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Deploy the current folder's project.
    #[command(override_usage = "stackship deploy [options]")]
    Deploy(DeployOptions),

    /// Show remote port and project status without changing anything.
    #[command(override_usage = "stackship status [options]")]
    Status,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct DeployOptions {
    /// Run every check, but skip everything that changes the remote host.
    #[arg(long)]
    pub dry_run: bool,

    /// Remote port the deployed services publish.
    #[arg(short, long, value_name = "port")]
    pub port: Option<u16>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let layer = fmt::layer()
        .compact()
        .with_target(false)
        .without_time();
    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();

    if let Err(error) = cli.run().await {
        if is_canceled(&error) {
            info!("deployment canceled");
            exit(0);
        }

        error!("{error:?}");
        exit(1);
    }

    exit(0)
}

fn is_canceled(error: &anyhow::Error) -> bool {
    if let Some(err) = error.downcast_ref::<PromptError>() {
        return err.is_canceled();
    }

    matches!(
        error.downcast_ref::<ComposeError>(),
        Some(ComposeError::Prompt(PromptError::Canceled))
    )
}

async fn run_deploy(opts: DeployOptions) -> Result<()> {
    if opts.dry_run {
        info!("dry run");
    }

    require_executables(&REQUIRED_EXECUTABLES)?;
    let store = SettingsStore::new(default_settings_file()?);
    let mut settings = store.load()?;

    let project = LocalProject::open(current_dir()?)?;
    project.ensure_clean()?;
    info!("preparing to deploy commit {}", project.short_commit()?);
    let files = ComposeFiles::discover(project.root())?;
    let mut prompter = InquirePrompter::new(project.editor_command()?);

    let host = prompter.text("SSH host", settings.ssh_host.as_deref())?;
    settings.ssh_host = Some(host.clone());
    store.save(&settings)?;

    info!("reading SSH configuration");
    let ssh_host = SshConfig::open(ssh_config_file()?)?.lookup(&host)?;

    let Some(compose) = compose::negotiate(&files, &mut prompter)? else {
        info!("deployment canceled");
        return Ok(());
    };

    let port = match opts.port {
        Some(port) => port,
        None => prompter.port("Remote port", settings.remote_port_or_default())?,
    };
    settings.remote_port = Some(port);
    store.save(&settings)?;

    let session = SshSession::connect(&ssh_host, &known_hosts_file()?, CONNECT_TIMEOUT)?;
    let context = RunContext {
        project: &project,
        compose: &compose,
        host: &host,
        settings: &mut settings,
        store: &store,
    };
    let deployment = Deployment::new(
        context,
        RemoteShell::new(&session, opts.dry_run),
        &mut prompter,
        Rsync,
    );
    let shutdown = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("cannot listen for Ctrl+C: {err}");
            std::future::pending::<()>().await;
        }
    };

    match deployment.run(shutdown).await? {
        Outcome::Deployed => info!("deployment attempt complete"),
        Outcome::Canceled => return Ok(()),
    }

    if opts.dry_run {
        info!("dry run complete");
    }

    Ok(())
}

fn run_status() -> Result<()> {
    let store = SettingsStore::new(default_settings_file()?);
    let settings = store.load()?;
    let host = settings
        .ssh_host
        .clone()
        .ok_or_else(|| anyhow!("no SSH host saved yet, run `stackship deploy` first"))?;

    let project = LocalProject::open(current_dir()?)?;
    let parent = match settings.remote_parent_folder.clone() {
        Some(parent) => parent,
        None => default_remote_parent_folder()?,
    };
    let target = DeploymentTarget::new(parent, project.name())?;

    let ssh_host = SshConfig::open(ssh_config_file()?)?.lookup(&host)?;
    let session = SshSession::connect(&ssh_host, &known_hosts_file()?, CONNECT_TIMEOUT)?;
    let report = deploy::inspect_status(&session, &target, settings.remote_port_or_default())?;

    let port = report.port;
    match report.conflict {
        Some(container) => info!(
            "port {port} is in use by {} ({}) on {host}",
            container.name, container.id
        ),
        None => info!("port {port} is available on {host}"),
    }

    match report.project.state() {
        RemoteState::Absent => info!("the {} project does not yet exist on {host}", target.name()),
        RemoteState::Present { git, dotenv } => {
            let git = match git {
                GitState::Clean => "its Git is clean",
                GitState::Dirty => "its Git is dirty",
                GitState::Untracked => "it has no .git folder",
            };
            let dotenv = if dotenv { "has" } else { "has no" };
            info!("{target} exists on {host}, {git}, and it {dotenv} .env file");
        }
    }

    Ok(())
}

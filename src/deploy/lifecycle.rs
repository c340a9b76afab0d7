// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Remote compose stack lifecycle.

use crate::{
    compose::ComposeInvocation,
    deploy::DeploymentTarget,
    docker::json_records,
    remote::{self, Remote, RemoteShell},
};

use indicatif::{ProgressBar, ProgressStyle};
use serde::Deserialize;
use std::{future::Future, time::Duration};
use tracing::{info, instrument};

const UP_TIMEOUT: Duration = Duration::from_secs(500);
const PS_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause between two status polls of the monitor.
pub const MONITOR_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServiceStatus {
    #[serde(rename = "Name")]
    pub name: String,

    #[serde(rename = "Status")]
    pub status: String,
}

/// Start compose stack in the background.
///
/// Skipped on a dry run. The given bar spins while the remote side pulls
/// images and starts containers.
///
/// # Errors
///
/// - Return [`LifecycleError::Remote`] if `compose up` fails or times out.
/// - Return [`LifecycleError::IndicatifStyleTemplate`] if spinner template is
///   invalid.
#[instrument(skip(shell, compose, target, bar), fields(target = %target), level = "debug")]
pub fn start<R>(
    shell: &RemoteShell<R>,
    compose: &ComposeInvocation,
    target: &DeploymentTarget,
    bar: ProgressBar,
) -> Result<()>
where
    R: Remote,
{
    info!("starting the Docker services");
    if shell.is_dry_run() {
        return Ok(());
    }

    let style = ProgressStyle::with_template("{spinner:.green} {elapsed:.yellow} {msg}")?;
    bar.set_style(style);
    bar.set_message(format!("{compose} up -d"));
    bar.enable_steady_tick(Duration::from_millis(100));

    let result = shell.mutate(&compose.in_dir(target.path(), "up -d"), UP_TIMEOUT);
    bar.finish_and_clear();
    result?;

    Ok(())
}

/// Poll service statuses until interrupted.
///
/// Each round waits for the interval, then prints every service with its
/// status. Completion of the shutdown future ends the loop successfully, even
/// in the middle of a wait. Only narrated on a dry run. Returns number of
/// completed polls.
///
/// # Errors
///
/// - Return [`LifecycleError::NoServices`] if no service is running.
/// - Return [`LifecycleError::Remote`] if a status poll fails.
/// - Return [`LifecycleError::Json`] if poll output is not valid JSON.
#[instrument(skip(shell, compose, target, shutdown), fields(target = %target), level = "debug")]
pub async fn monitor<R, F>(
    shell: &RemoteShell<R>,
    compose: &ComposeInvocation,
    target: &DeploymentTarget,
    interval: Duration,
    shutdown: F,
) -> Result<usize>
where
    R: Remote,
    F: Future<Output = ()>,
{
    info!("monitoring the services' statuses (press Ctrl+C to stop)");
    if shell.is_dry_run() {
        return Ok(0);
    }

    let command = compose.in_dir(target.path(), "ps --format json");
    tokio::pin!(shutdown);

    let mut polls = 0;
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => break,
            _ = tokio::time::sleep(interval) => {}
        }

        let stdout = shell.query(&command, PS_TIMEOUT)?;
        let services = json_records::<ServiceStatus>(&stdout)?;
        if services.is_empty() {
            return Err(LifecycleError::NoServices);
        }

        info!("\t------------------------------");
        for service in services {
            info!("\t{}: {}", service.name, service.status);
        }
        polls += 1;
    }

    info!("stopped monitoring after {polls} poll(s)");
    Ok(polls)
}

/// Lifecycle error types.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    /// Status poll found nothing running.
    #[error("no services are running")]
    NoServices,

    #[error(transparent)]
    Remote(#[from] remote::RemoteError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Spinner template is invalid.
    #[error(transparent)]
    IndicatifStyleTemplate(#[from] indicatif::style::TemplateError),
}

/// Friendly result alias :3
pub type Result<T, E = LifecycleError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{LogCapture, ScriptedRemote};
    use pretty_assertions::assert_eq;
    use std::{future::poll_fn, task::Poll};

    const SERVICES: &str = concat!(
        r#"{"Name":"demo-web-1","Service":"web","Status":"Up 5 seconds"}"#,
        "\n",
        r#"{"Name":"demo-db-1","Service":"db","Status":"Up 6 seconds (healthy)"}"#,
        "\n",
    );

    fn fixture() -> anyhow::Result<(DeploymentTarget, ComposeInvocation)> {
        Ok((
            DeploymentTarget::new("/srv/apps", "demo")?,
            ComposeInvocation::build(["compose.yaml"])?,
        ))
    }

    #[test]
    fn start_runs_compose_up() -> anyhow::Result<()> {
        let (target, compose) = fixture()?;
        let remote = ScriptedRemote::new();
        let shell = RemoteShell::new(&remote, false);

        start(&shell, &compose, &target, ProgressBar::hidden())?;
        assert_eq!(
            remote.commands(),
            vec!["cd '/srv/apps/demo' && docker compose -f 'compose.yaml' up -d"]
        );

        Ok(())
    }

    #[test]
    fn start_failure_is_fatal() -> anyhow::Result<()> {
        let (target, compose) = fixture()?;
        let remote = ScriptedRemote::new().respond("up -d", 1, "", "pull access denied");
        let shell = RemoteShell::new(&remote, false);

        assert!(matches!(
            start(&shell, &compose, &target, ProgressBar::hidden()),
            Err(LifecycleError::Remote(_))
        ));

        Ok(())
    }

    #[tokio::test]
    async fn monitor_stops_on_interrupt_after_polls() -> anyhow::Result<()> {
        let (target, compose) = fixture()?;
        let remote = ScriptedRemote::new().respond("ps --format json", 0, SERVICES, "");
        let shell = RemoteShell::new(&remote, false);
        let interrupt = poll_fn(|_| {
            if remote.commands().len() >= 3 {
                Poll::Ready(())
            } else {
                Poll::Pending
            }
        });

        let polls = monitor(&shell, &compose, &target, Duration::from_millis(1), interrupt).await?;
        assert_eq!(polls, 3);

        Ok(())
    }

    #[tokio::test]
    async fn monitor_without_services_is_fatal() -> anyhow::Result<()> {
        let (target, compose) = fixture()?;
        let remote = ScriptedRemote::new().respond("ps --format json", 0, "", "");
        let shell = RemoteShell::new(&remote, false);

        let result = monitor(
            &shell,
            &compose,
            &target,
            Duration::from_millis(1),
            std::future::pending(),
        )
        .await;
        match result {
            Err(err @ LifecycleError::NoServices) => {
                assert_eq!(err.to_string(), "no services are running")
            }
            other => panic!("expected no services, got {other:?}"),
        }
        assert_eq!(remote.commands().len(), 1);

        Ok(())
    }

    #[tokio::test]
    async fn interrupt_during_first_wait_polls_nothing() -> anyhow::Result<()> {
        let (target, compose) = fixture()?;
        let remote = ScriptedRemote::new();
        let shell = RemoteShell::new(&remote, false);

        let polls = monitor(&shell, &compose, &target, Duration::from_secs(3600), async {}).await?;
        assert_eq!(polls, 0);
        assert!(remote.commands().is_empty());

        Ok(())
    }

    #[tokio::test]
    async fn dry_run_skips_lifecycle() -> anyhow::Result<()> {
        let (target, compose) = fixture()?;
        let remote = ScriptedRemote::new();
        let shell = RemoteShell::new(&remote, true);
        let logs = LogCapture::default();
        let _guard = logs.install();

        start(&shell, &compose, &target, ProgressBar::hidden())?;
        let polls = monitor(&shell, &compose, &target, Duration::from_millis(1), std::future::pending()).await?;
        assert_eq!(polls, 0);
        assert!(remote.commands().is_empty());

        // INVARIANT: Dry runs narrate every stage they skip.
        let output = logs.contents();
        assert!(output.contains("starting the Docker services"));
        assert!(output.contains("monitoring the services' statuses"));

        Ok(())
    }
}

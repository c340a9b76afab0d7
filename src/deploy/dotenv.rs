// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Remote `.env` provisioning.
//!
//! A remote `.env` file is only created when none exists yet. Its contents
//! start out as a copy of the local `.env` file, and the operator gets the
//! final say in their editor before anything is written.

use crate::{
    deploy::{probe::ProjectStatus, DeploymentTarget},
    prompt::{self, Prompter},
    remote::{self, quote, Remote, RemoteShell},
};

use std::time::Duration;
use tracing::{info, instrument};

const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

pub const DOTENV_HEADER: &str = "# Choose the contents of the remote .env file.";
const SEEDED_HEADER_SUFFIX: &str = " Here's a copy of the local .env file:";
const HEREDOC_BASE: &str = "HEREDOC_DELIM";
const UVICORN_DOCS: &str = "https://www.uvicorn.org/settings/#http:~:text=Defaults%20to%20the%20%24-,forwarded_allow_ips,-environment%20variable%20if";

/// Pick heredoc delimiter that does not occur anywhere in the body.
pub fn heredoc_delimiter(body: &str) -> String {
    let mut delimiter = String::from(HEREDOC_BASE);
    while body.contains(delimiter.as_str()) {
        delimiter.push('A');
    }

    delimiter
}

/// Uvicorn setting that trusts forwarded headers from a proxy address.
pub fn forwarded_allow_ips(address: &str) -> String {
    format!("FORWARDED_ALLOW_IPS=\"{address}\"  # {UVICORN_DOCS}")
}

/// Initial `.env` contents before the operator edits them.
pub fn seed_text(local: Option<&str>, proxy: Option<&str>) -> String {
    let mut text = local.unwrap_or_default().trim_end().to_owned();
    if let Some(address) = proxy {
        text.push_str("\n\n");
        text.push_str(&forwarded_allow_ips(address));
        text = text.trim_start().to_owned();
    }

    text
}

fn header(seed: &str) -> String {
    let mut header = String::from(DOTENV_HEADER);
    if !seed.trim().is_empty() {
        header.push_str(SEEDED_HEADER_SUFFIX);
    }

    header
}

/// Text handed to the operator's editor.
pub fn editor_text(seed: &str) -> String {
    format!("{}\n\n{seed}", header(seed))
}

/// Strip header from edited text, and trim surrounding whitespace.
pub fn strip_header(edited: &str, seed: &str) -> String {
    edited.replacen(&header(seed), "", 1).trim().to_owned()
}

/// Command creating remote `.env` with owner-only permissions.
///
/// The heredoc delimiter is quoted, so the remote shell writes the body as
/// is, without expanding `$VARIABLES` or command substitutions in it.
pub fn write_command(target: &DeploymentTarget, body: &str) -> String {
    let delimiter = heredoc_delimiter(body);
    format!(
        "cd {} && touch .env && chmod 600 .env && cat << '{delimiter}' > .env\n{body}\n{delimiter}\n",
        quote(target.path())
    )
}

/// Ask whether deployed service sits behind a proxy, and for its address.
///
/// Returns [`None`] if there is no proxy, or an empty address was given.
///
/// # Errors
///
/// - Return [`DotenvError::Prompt`] if operator input cannot be read.
pub fn proxy_address<P>(prompter: &mut P, default: Option<&str>) -> Result<Option<String>>
where
    P: Prompter,
{
    if !prompter.confirm("Will the deployed service use a proxy?", true)? {
        return Ok(None);
    }

    let address = prompter.text("Proxy IP address", default)?;
    if address.is_empty() {
        info!("canceled proxy");
        return Ok(None);
    }

    Ok(Some(address))
}

/// Make sure remote project has a `.env` file.
///
/// Skipped entirely if the probe found one. Otherwise the seed is computed
/// lazily, edited by the operator, and written unless the result is empty.
///
/// # Errors
///
/// - Return [`DotenvError::Prompt`] if editing fails.
/// - Return [`DotenvError::Remote`] if writing the file fails.
/// - Return any error produced by the seed callback.
#[instrument(skip(shell, prompter, status, target, seed), level = "debug")]
pub fn ensure_dotenv<R, P, F>(
    shell: &RemoteShell<R>,
    prompter: &mut P,
    status: &ProjectStatus,
    target: &DeploymentTarget,
    seed: F,
) -> Result<()>
where
    R: Remote,
    P: Prompter,
    F: FnOnce(&mut P) -> Result<String>,
{
    if status.dotenv_exists {
        info!("keeping the existing .env file in the remote project folder");
        return Ok(());
    }

    let seed = seed(prompter)?;
    info!("waiting for you to choose the contents of the remote .env file");
    let edited = prompter.edit("Remote .env file", &editor_text(&seed), ".env")?;
    let body = strip_header(&edited, &seed);
    if body.is_empty() {
        info!("skipping creating a .env file in the remote project folder");
        return Ok(());
    }

    info!("creating a .env file in the remote project folder");
    shell.mutate(&write_command(target, &body), WRITE_TIMEOUT)?;

    Ok(())
}

/// Environment provisioning error types.
#[derive(Debug, thiserror::Error)]
pub enum DotenvError {
    #[error(transparent)]
    Prompt(#[from] prompt::PromptError),

    #[error(transparent)]
    Remote(#[from] remote::RemoteError),

    /// Settings cannot be saved after confirming the proxy address.
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    /// Local `.env` exists, but cannot be read.
    #[error(transparent)]
    Preflight(#[from] crate::preflight::PreflightError),
}

/// Friendly result alias :3
pub type Result<T, E = DotenvError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Answer, ScriptedPrompter, ScriptedRemote};
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use simple_test_case::test_case;

    #[test_case("KEY=value", "HEREDOC_DELIM"; "plain body")]
    #[test_case("A=HEREDOC_DELIM", "HEREDOC_DELIMA"; "base taken")]
    #[test_case("HEREDOC_DELIM HEREDOC_DELIMA", "HEREDOC_DELIMAA"; "first extension taken")]
    #[test]
    fn delimiter_is_unique(body: &str, expect: &str) {
        let result = heredoc_delimiter(body);
        pretty_assertions::assert_eq!(result, expect);
        assert!(!body.contains(result.as_str()));
    }

    #[test]
    fn write_command_uses_quoted_heredoc() -> anyhow::Result<()> {
        let target = DeploymentTarget::new("/srv/apps", "demo")?;
        let result = write_command(&target, "SECRET=$HOME\nMARK=HEREDOC_DELIM");
        let expect = indoc! {r#"
            cd '/srv/apps/demo' && touch .env && chmod 600 .env && cat << 'HEREDOC_DELIMA' > .env
            SECRET=$HOME
            MARK=HEREDOC_DELIM
            HEREDOC_DELIMA
        "#};
        assert_eq!(result, expect);

        Ok(())
    }

    #[test_case(None, None, ""; "nothing")]
    #[test_case(Some("A=1\n\n"), None, "A=1"; "local only")]
    #[test_case(
        None,
        Some("10.0.0.2"),
        "FORWARDED_ALLOW_IPS=\"10.0.0.2\"  # https://www.uvicorn.org/settings/#http:~:text=Defaults%20to%20the%20%24-,forwarded_allow_ips,-environment%20variable%20if";
        "proxy only"
    )]
    #[test]
    fn seed_combines_local_and_proxy(local: Option<&str>, proxy: Option<&str>, expect: &str) {
        pretty_assertions::assert_eq!(seed_text(local, proxy), expect);
    }

    #[test]
    fn seed_appends_proxy_after_blank_line() {
        let result = seed_text(Some("A=1"), Some("10.0.0.2"));
        assert_eq!(result, format!("A=1\n\n{}", forwarded_allow_ips("10.0.0.2")));
    }

    #[test]
    fn header_mentions_local_copy_only_when_seeded() {
        assert_eq!(editor_text(""), format!("{DOTENV_HEADER}\n\n"));
        assert_eq!(
            editor_text("A=1"),
            format!("{DOTENV_HEADER} Here's a copy of the local .env file:\n\nA=1")
        );
        assert_eq!(strip_header(&editor_text("A=1"), "A=1"), "A=1");
    }

    #[test]
    fn existing_dotenv_is_left_alone() -> anyhow::Result<()> {
        let target = DeploymentTarget::new("/srv/apps", "demo")?;
        let remote = ScriptedRemote::new();
        let shell = RemoteShell::new(&remote, false);
        let mut prompter = ScriptedPrompter::default();
        let status = ProjectStatus {
            folder_exists: true,
            dotenv_exists: true,
            ..Default::default()
        };

        ensure_dotenv(&shell, &mut prompter, &status, &target, |_| {
            panic!("seed must not be computed")
        })?;
        assert!(remote.commands().is_empty());
        assert!(prompter.messages.is_empty());

        Ok(())
    }

    #[test]
    fn edited_dotenv_is_written() -> anyhow::Result<()> {
        let target = DeploymentTarget::new("/srv/apps", "demo")?;
        let remote = ScriptedRemote::new();
        let shell = RemoteShell::new(&remote, false);
        let edited = format!("{DOTENV_HEADER} Here's a copy of the local .env file:\n\nA=2\n");
        let mut prompter = ScriptedPrompter::new([Answer::Edit(edited)]);

        ensure_dotenv(&shell, &mut prompter, &ProjectStatus::default(), &target, |_| {
            Ok("A=1".into())
        })?;

        assert_eq!(prompter.edited, vec![editor_text("A=1")]);
        assert_eq!(
            remote.commands(),
            vec![write_command(&target, "A=2")]
        );

        Ok(())
    }

    #[test]
    fn empty_edit_skips_creation() -> anyhow::Result<()> {
        let target = DeploymentTarget::new("/srv/apps", "demo")?;
        let remote = ScriptedRemote::new();
        let shell = RemoteShell::new(&remote, false);
        let mut prompter = ScriptedPrompter::new([Answer::Edit(format!("{DOTENV_HEADER}\n\n"))]);

        ensure_dotenv(&shell, &mut prompter, &ProjectStatus::default(), &target, |_| {
            Ok(String::new())
        })?;
        assert!(remote.commands().is_empty());

        Ok(())
    }

    #[test]
    fn proxy_prompts() -> anyhow::Result<()> {
        let mut prompter = ScriptedPrompter::new([Answer::Confirm(false)]);
        assert_eq!(proxy_address(&mut prompter, None)?, None);

        let mut prompter = ScriptedPrompter::new([
            Answer::Confirm(true),
            Answer::Text("10.0.0.2".into()),
        ]);
        assert_eq!(proxy_address(&mut prompter, None)?, Some("10.0.0.2".into()));

        let mut prompter = ScriptedPrompter::new([Answer::Confirm(true), Answer::Text(String::new())]);
        assert_eq!(proxy_address(&mut prompter, Some("10.0.0.2"))?, None);

        Ok(())
    }
}

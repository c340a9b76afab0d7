// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! SSH transport.
//!
//! Resolve a host alias through the operator's OpenSSH client configuration,
//! and run remote commands over one authenticated libssh2 session.
//!
//! # Host Resolution
//!
//! Only a small subset of `ssh_config(5)` is understood: `Host` blocks with
//! glob patterns (including `!` negation), `Key value` or `Key=value` lines,
//! case-insensitive keywords, and first-obtained-value-wins semantics. The
//! alias must be named literally by some `Host` line, and must resolve to a
//! `HostName`, `Port`, `User`, and `IdentityFile`.
//!
//! # Host Key Verification
//!
//! The remote host key must already be present in `~/.ssh/known_hosts`.
//! Unknown hosts are rejected rather than trusted on first use.

use crate::remote::{self, Remote, RemoteError, RemoteOutput};

use glob::Pattern;
use ssh2::{Channel, CheckResult, KnownHostFileKind, Session};
use std::{
    collections::HashMap,
    fs::read_to_string,
    io::{ErrorKind, Read},
    net::{TcpStream, ToSocketAddrs},
    path::{Path, PathBuf},
    str::FromStr,
    thread::sleep,
    time::{Duration, Instant},
};
use tracing::{debug, info, instrument, warn};

/// Parsed OpenSSH client configuration.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SshConfig {
    global: Vec<(String, String)>,
    blocks: Vec<HostBlock>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct HostBlock {
    patterns: Vec<String>,
    options: Vec<(String, String)>,
}

impl HostBlock {
    fn matches(&self, alias: &str) -> bool {
        let mut matched = false;
        for pattern in &self.patterns {
            if let Some(negated) = pattern.strip_prefix('!') {
                if glob_matches(negated, alias) {
                    return false;
                }
            } else if glob_matches(pattern, alias) {
                matched = true;
            }
        }

        matched
    }
}

fn glob_matches(pattern: &str, alias: &str) -> bool {
    Pattern::new(pattern)
        .map(|pattern| pattern.matches(alias))
        .unwrap_or(false)
}

impl SshConfig {
    /// Read and parse configuration file at target path.
    ///
    /// # Errors
    ///
    /// - Return [`SshError::ReadConfig`] if file cannot be read.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let data = read_to_string(path.as_ref()).map_err(|err| SshError::ReadConfig {
            source: err,
            path: path.as_ref().to_path_buf(),
        })?;

        Ok(data.parse()?)
    }

    /// Host aliases named literally by `Host` lines.
    pub fn hostnames(&self) -> Vec<&str> {
        self.blocks
            .iter()
            .flat_map(|block| block.patterns.iter())
            .map(String::as_str)
            .filter(|pattern| !pattern.starts_with('!'))
            .collect()
    }

    /// Resolve host alias into connection parameters.
    ///
    /// # Errors
    ///
    /// - Return [`SshError::UnknownAlias`] if no `Host` line names the alias.
    /// - Return [`SshError::MissingOption`] if a required keyword is unset.
    /// - Return [`SshError::InvalidPort`] if `Port` is not a port number.
    /// - Return [`SshError::ShellExpansion`] if `IdentityFile` cannot be
    ///   expanded.
    pub fn lookup(&self, alias: &str) -> Result<SshHost> {
        if !self.hostnames().contains(&alias) {
            return Err(SshError::UnknownAlias(alias.to_owned()));
        }

        // INVARIANT: First obtained value wins across all matching blocks.
        let mut resolved: HashMap<&str, &str> = HashMap::new();
        let matching = self
            .blocks
            .iter()
            .filter(|block| block.matches(alias))
            .flat_map(|block| block.options.iter());
        for (keyword, value) in self.global.iter().chain(matching) {
            resolved.entry(keyword.as_str()).or_insert(value.as_str());
        }

        let require = |keyword: &'static str| {
            resolved
                .get(keyword)
                .copied()
                .ok_or_else(|| SshError::MissingOption {
                    alias: alias.to_owned(),
                    keyword,
                })
        };

        let hostname = require("hostname")?.to_owned();
        let port = require("port")?;
        let port = port.parse().map_err(|_| SshError::InvalidPort(port.to_owned()))?;
        let user = require("user")?.to_owned();
        let identity_file = PathBuf::from(
            shellexpand::full(require("identityfile")?)
                .map_err(SshError::ShellExpansion)?
                .into_owned(),
        );

        Ok(SshHost {
            alias: alias.to_owned(),
            hostname,
            port,
            user,
            identity_file,
        })
    }
}

impl FromStr for SshConfig {
    type Err = SshError;

    fn from_str(data: &str) -> std::result::Result<Self, Self::Err> {
        let mut config = SshConfig::default();

        for line in data.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (keyword, value) = split_option(line);
            let keyword = keyword.to_ascii_lowercase();
            match keyword.as_str() {
                "host" => config.blocks.push(HostBlock {
                    patterns: value.split_whitespace().map(str::to_owned).collect(),
                    options: Vec::new(),
                }),
                // INVARIANT: Options under an unsupported Match block never apply.
                "match" => {
                    warn!("ignoring unsupported ssh config directive: {line}");
                    config.blocks.push(HostBlock::default());
                }
                _ => {
                    let option = (keyword, value.trim_matches('"').to_owned());
                    match config.blocks.last_mut() {
                        Some(block) => block.options.push(option),
                        None => config.global.push(option),
                    }
                }
            }
        }

        Ok(config)
    }
}

fn split_option(line: &str) -> (&str, &str) {
    let end = line
        .find(|c: char| c.is_whitespace() || c == '=')
        .unwrap_or(line.len());
    let (keyword, rest) = line.split_at(end);
    let value = rest
        .trim_start()
        .strip_prefix('=')
        .unwrap_or(rest)
        .trim();

    (keyword, value)
}

/// Connection parameters for one remote host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshHost {
    /// Alias the parameters were resolved from.
    pub alias: String,

    /// Real host name or address to connect to.
    pub hostname: String,

    /// Port the SSH daemon listens on.
    pub port: u16,

    /// Remote user to log in as.
    pub user: String,

    /// Private key to authenticate with.
    pub identity_file: PathBuf,
}

/// Authenticated libssh2 session.
///
/// The session is disconnected when dropped.
pub struct SshSession {
    session: Session,
    alias: String,
}

impl SshSession {
    /// Connect and authenticate to target host.
    ///
    /// Verifies the host key against the known hosts file before sending
    /// any credentials. Authenticates with the identity file, falling back
    /// to the SSH agent.
    ///
    /// # Errors
    ///
    /// - Return [`SshError::Connect`] if TCP connection fails.
    /// - Return [`SshError::UnknownHostKey`] or [`SshError::HostKeyMismatch`]
    ///   if host key verification fails.
    /// - Return [`SshError::Authentication`] if no credential is accepted.
    #[instrument(skip(host, known_hosts, timeout), fields(alias = %host.alias), level = "debug")]
    pub fn connect(host: &SshHost, known_hosts: &Path, timeout: Duration) -> Result<Self> {
        info!("connecting to {}", host.alias);
        let address = (host.hostname.as_str(), host.port)
            .to_socket_addrs()
            .map_err(|err| SshError::Connect {
                source: err,
                address: format!("{}:{}", host.hostname, host.port),
            })?
            .next()
            .ok_or_else(|| SshError::Connect {
                source: ErrorKind::AddrNotAvailable.into(),
                address: format!("{}:{}", host.hostname, host.port),
            })?;
        let tcp = TcpStream::connect_timeout(&address, timeout).map_err(|err| SshError::Connect {
            source: err,
            address: address.to_string(),
        })?;

        let mut session = Session::new()?;
        session.set_tcp_stream(tcp);
        session.set_timeout(timeout.as_millis() as u32);
        session.handshake()?;
        verify_host_key(&session, host, known_hosts)?;

        if let Err(err) = session.userauth_pubkey_file(&host.user, None, &host.identity_file, None) {
            debug!("identity file rejected, trying ssh-agent: {err}");
            if let Err(err) = session.userauth_agent(&host.user) {
                debug!("ssh-agent rejected: {err}");
            }
        }

        if !session.authenticated() {
            return Err(SshError::Authentication {
                user: host.user.clone(),
                alias: host.alias.clone(),
            });
        }
        session.set_keepalive(true, 30);

        Ok(Self {
            session,
            alias: host.alias.clone(),
        })
    }
}

fn verify_host_key(session: &Session, host: &SshHost, known_hosts: &Path) -> Result<()> {
    let mut known = session.known_hosts()?;
    if known_hosts.exists() {
        known.read_file(known_hosts, KnownHostFileKind::OpenSSH)?;
    }

    let (key, _) = session.host_key().ok_or_else(|| SshError::UnknownHostKey {
        alias: host.alias.clone(),
    })?;

    match known.check_port(&host.hostname, host.port, key) {
        CheckResult::Match => Ok(()),
        CheckResult::Mismatch => Err(SshError::HostKeyMismatch {
            alias: host.alias.clone(),
        }),
        CheckResult::NotFound | CheckResult::Failure => Err(SshError::UnknownHostKey {
            alias: host.alias.clone(),
        }),
    }
}

impl Remote for SshSession {
    #[instrument(skip(self, timeout), level = "debug")]
    fn exec(&self, command: &str, timeout: Duration) -> remote::Result<RemoteOutput> {
        // INVARIANT: Zero means no timeout for libssh2, so never pass it.
        self.session.set_timeout((timeout.as_millis() as u32).max(1));
        let timed_out = |err: std::io::Error| match err.kind() {
            ErrorKind::TimedOut => RemoteError::Timeout {
                command: command.to_owned(),
                timeout,
            },
            _ => RemoteError::Io(err),
        };

        let mut channel = self
            .session
            .channel_session()
            .map_err(|err| timed_out(err.into()))?;
        channel.exec(command).map_err(|err| timed_out(err.into()))?;

        // INVARIANT: Both streams share one channel window, so read them together.
        self.session.set_blocking(false);
        let output = drain_output(&mut channel, Instant::now() + timeout, DRAIN_PAUSE);
        self.session.set_blocking(true);
        let (stdout, stderr) = output.map_err(timed_out)?;

        channel.wait_close().map_err(|err| timed_out(err.into()))?;
        let status = channel.exit_status()?;

        Ok(RemoteOutput {
            status,
            stdout,
            stderr,
        })
    }
}

const DRAIN_PAUSE: Duration = Duration::from_millis(10);

/// Channel with separate stdout and stderr streams.
trait OutputStreams {
    /// Read from stream 0 (stdout) or stream 1 (stderr).
    fn read_stream(&mut self, stream: i32, buf: &mut [u8]) -> std::io::Result<usize>;

    /// Check if remote side sent end of file.
    fn at_eof(&self) -> bool;
}

impl OutputStreams for Channel {
    fn read_stream(&mut self, stream: i32, buf: &mut [u8]) -> std::io::Result<usize> {
        self.stream(stream).read(buf)
    }

    fn at_eof(&self) -> bool {
        self.eof()
    }
}

/// Collect stdout and stderr of non-blocking channel until end of file.
///
/// Each round reads whatever either stream has, so a command that floods
/// stderr before closing stdout still finishes.
fn drain_output<C>(
    channel: &mut C,
    deadline: Instant,
    pause: Duration,
) -> std::io::Result<(String, String)>
where
    C: OutputStreams,
{
    let mut output = [Vec::new(), Vec::new()];
    let mut buf = [0u8; 8192];
    loop {
        let mut progressed = false;
        for (stream, collected) in output.iter_mut().enumerate() {
            match channel.read_stream(stream as i32, &mut buf) {
                Ok(0) => {}
                Ok(len) => {
                    collected.extend_from_slice(&buf[..len]);
                    progressed = true;
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {}
                Err(err) => return Err(err),
            }
        }

        if progressed {
            continue;
        }

        if channel.at_eof() {
            break;
        }

        if Instant::now() >= deadline {
            return Err(ErrorKind::TimedOut.into());
        }
        sleep(pause);
    }

    let [stdout, stderr] = output;
    Ok((
        String::from_utf8_lossy(&stdout).into_owned(),
        String::from_utf8_lossy(&stderr).into_owned(),
    ))
}

impl Drop for SshSession {
    fn drop(&mut self) {
        debug!("disconnecting from {}", self.alias);
        if let Err(err) = self.session.disconnect(None, "deployment finished", None) {
            debug!("disconnect from {} failed: {err}", self.alias);
        }
    }
}

/// SSH error types.
#[derive(Debug, thiserror::Error)]
pub enum SshError {
    /// SSH client configuration cannot be read.
    #[error("failed to read ssh config at {:?}", path.display())]
    ReadConfig {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// No host block names the alias.
    #[error("ssh host {0:?} was not found in ~/.ssh/config")]
    UnknownAlias(String),

    /// Host block lacks required keyword.
    #[error(
        "ssh host {alias:?} in ~/.ssh/config must define \"HostName\", \"Port\", \"User\", \
         and \"IdentityFile\" (missing {keyword:?})"
    )]
    MissingOption { alias: String, keyword: &'static str },

    /// Port keyword is not a port number.
    #[error("invalid ssh port {0:?}")]
    InvalidPort(String),

    /// Identity file path cannot be expanded.
    #[error(transparent)]
    ShellExpansion(#[from] shellexpand::LookupError<std::env::VarError>),

    /// TCP connection cannot be established.
    #[error("failed to connect to {address}")]
    Connect {
        #[source]
        source: std::io::Error,
        address: String,
    },

    /// Host key is not in known hosts file.
    #[error("host key of {alias:?} is unknown. Connect once with `ssh {alias}` to verify and record it")]
    UnknownHostKey { alias: String },

    /// Host key differs from known hosts file.
    #[error("host key of {alias:?} does not match ~/.ssh/known_hosts. Refusing to connect")]
    HostKeyMismatch { alias: String },

    /// No credential was accepted.
    #[error(
        "authentication as {user:?} on {alias:?} failed. Did you add the host's SSH key to ssh-agent?"
    )]
    Authentication { user: String, alias: String },

    /// Operations from libssh2 fail.
    #[error(transparent)]
    Ssh2(#[from] ssh2::Error),
}

/// Friendly result alias :3
type Result<T, E = SshError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use sealed_test::prelude::*;
    use std::collections::VecDeque;

    const CONFIG: &str = indoc! {r#"
        # deployment targets
        Host prod
            HostName 203.0.113.10
            Port 2222
            User deploy
            IdentityFile ~/.ssh/prod_ed25519

        Host staging
            HostName=staging.example.com
            User deploy

        Host *
            Port 22
            User nobody
            IdentityFile "~/.ssh/id_ed25519"
    "#};

    /// Channel double handing out scripted chunks per stream.
    struct ScriptedStreams {
        chunks: [VecDeque<Vec<u8>>; 2],
        eof: bool,
    }

    impl ScriptedStreams {
        fn new(stdout: Vec<Vec<u8>>, stderr: Vec<Vec<u8>>) -> Self {
            Self {
                chunks: [stdout.into(), stderr.into()],
                eof: false,
            }
        }
    }

    impl OutputStreams for ScriptedStreams {
        fn read_stream(&mut self, stream: i32, buf: &mut [u8]) -> std::io::Result<usize> {
            // INVARIANT: Stdout stays silent until stderr is fully drained.
            if stream == 0 && !self.chunks[1].is_empty() {
                return Err(ErrorKind::WouldBlock.into());
            }

            match self.chunks[stream as usize].pop_front() {
                Some(chunk) => {
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(chunk.len())
                }
                None if self.chunks.iter().all(VecDeque::is_empty) => {
                    self.eof = true;
                    Ok(0)
                }
                None => Err(ErrorKind::WouldBlock.into()),
            }
        }

        fn at_eof(&self) -> bool {
            self.eof
        }
    }

    #[test]
    fn drain_reads_stderr_flood_before_stdout() -> anyhow::Result<()> {
        let flood = vec![vec![b'e'; 4096]; 64];
        let mut streams = ScriptedStreams::new(vec![b"done\n".to_vec()], flood);

        let deadline = Instant::now() + Duration::from_secs(5);
        let (stdout, stderr) = drain_output(&mut streams, deadline, Duration::ZERO)?;
        assert_eq!(stdout, "done\n");
        assert_eq!(stderr.len(), 4096 * 64);

        Ok(())
    }

    #[test]
    fn drain_times_out_on_silent_channel() {
        struct Silent;

        impl OutputStreams for Silent {
            fn read_stream(&mut self, _stream: i32, _buf: &mut [u8]) -> std::io::Result<usize> {
                Err(ErrorKind::WouldBlock.into())
            }

            fn at_eof(&self) -> bool {
                false
            }
        }

        let deadline = Instant::now() + Duration::from_millis(20);
        let result = drain_output(&mut Silent, deadline, Duration::from_millis(1));
        assert!(matches!(result, Err(err) if err.kind() == ErrorKind::TimedOut));
    }

    #[sealed_test(env = [("HOME", "/home/blah")])]
    fn lookup_first_value_wins() -> anyhow::Result<()> {
        let config: SshConfig = CONFIG.parse()?;

        let result = config.lookup("prod")?;
        let expect = SshHost {
            alias: "prod".into(),
            hostname: "203.0.113.10".into(),
            port: 2222,
            user: "deploy".into(),
            identity_file: PathBuf::from("/home/blah/.ssh/prod_ed25519"),
        };
        assert_eq!(result, expect);

        Ok(())
    }

    #[sealed_test(env = [("HOME", "/home/blah")])]
    fn lookup_falls_back_to_wildcard_block() -> anyhow::Result<()> {
        let config: SshConfig = CONFIG.parse()?;

        let result = config.lookup("staging")?;
        let expect = SshHost {
            alias: "staging".into(),
            hostname: "staging.example.com".into(),
            port: 22,
            user: "deploy".into(),
            identity_file: PathBuf::from("/home/blah/.ssh/id_ed25519"),
        };
        assert_eq!(result, expect);

        Ok(())
    }

    #[test]
    fn lookup_requires_literal_alias() -> anyhow::Result<()> {
        let config: SshConfig = CONFIG.parse()?;
        assert!(matches!(
            config.lookup("backup"),
            Err(SshError::UnknownAlias(alias)) if alias == "backup"
        ));

        Ok(())
    }

    #[test]
    fn lookup_reports_missing_option() -> anyhow::Result<()> {
        let config: SshConfig = indoc! {r#"
            Host lab
                HostName 192.0.2.7
                User root
                IdentityFile /keys/lab
        "#}
        .parse()?;

        assert!(matches!(
            config.lookup("lab"),
            Err(SshError::MissingOption { keyword: "port", .. })
        ));

        Ok(())
    }

    #[test]
    fn negated_pattern_excludes_host() -> anyhow::Result<()> {
        let config: SshConfig = indoc! {r#"
            Host lab
                HostName 192.0.2.7
                IdentityFile /keys/lab

            Host * !lab
                Port 2200

            Host *
                Port 22
                User root
        "#}
        .parse()?;

        let result = config.lookup("lab")?;
        assert_eq!(result.port, 22);

        Ok(())
    }

    #[test]
    fn global_options_apply_first() -> anyhow::Result<()> {
        let config: SshConfig = indoc! {r#"
            User admin

            Host lab
                HostName 192.0.2.7
                Port 22
                User root
                IdentityFile /keys/lab
        "#}
        .parse()?;

        assert_eq!(config.hostnames(), vec!["lab"]);
        assert_eq!(config.lookup("lab")?.user, "admin");

        Ok(())
    }
}

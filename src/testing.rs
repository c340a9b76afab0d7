// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Test doubles shared by unit tests.

use crate::{
    prompt::{PromptError, Prompter},
    remote::{self, Remote, RemoteOutput},
};

use git2::{Repository, RepositoryInitOptions};
use std::{
    cell::RefCell,
    collections::VecDeque,
    fmt::Display,
    fs::{create_dir_all, write},
    io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};
use tempfile::TempDir;
use tracing::subscriber::DefaultGuard;

/// Log output collected from the current thread.
#[derive(Debug, Clone, Default)]
pub(crate) struct LogCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl LogCapture {
    /// Route logs of the current thread here until the guard drops.
    pub(crate) fn install(&self) -> DefaultGuard {
        let capture = self.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .without_time()
            .with_writer(move || capture.clone())
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub(crate) fn contents(&self) -> String {
        let buffer = self.buffer.lock().map(|buf| buf.clone()).unwrap_or_default();
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Ok(mut buffer) = self.buffer.lock() {
            buffer.extend_from_slice(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Normal Git repository in a named folder under a temporary directory.
pub(crate) struct GitFixture {
    _dir: TempDir,
    root: PathBuf,
    repo: Repository,
}

impl GitFixture {
    pub(crate) fn new(name: &str) -> anyhow::Result<Self> {
        let dir = tempfile::tempdir()?;
        let root = dir.path().join(name);
        create_dir_all(&root)?;

        let mut opts = RepositoryInitOptions::new();
        opts.initial_head("main");
        let repo = Repository::init_opts(&root, &opts)?;

        // INVARIANT: Always provide valid name and email.
        let mut config = repo.config()?;
        config.set_str("user.name", "John Doe")?;
        config.set_str("user.email", "john@doe.com")?;

        Ok(Self {
            _dir: dir,
            root,
            repo,
        })
    }

    pub(crate) fn root(&self) -> &Path {
        self.root.as_path()
    }

    /// Write file into work tree, then stage and commit it.
    pub(crate) fn commit_file(&self, name: &str, contents: &str) -> anyhow::Result<()> {
        write(self.root.join(name), contents)?;

        let mut index = self.repo.index()?;
        index.add_path(Path::new(name))?;
        index.write()?;
        let tree = self.repo.find_tree(index.write_tree()?)?;

        let signature = self.repo.signature()?;
        let parent = match self.repo.head() {
            Ok(head) => Some(head.peel_to_commit()?),
            Err(_) => None,
        };
        let parents = parent.iter().collect::<Vec<_>>();
        self.repo.commit(
            Some("HEAD"),
            &signature,
            &signature,
            &format!("chore: add {name}"),
            &tree,
            &parents,
        )?;

        Ok(())
    }
}

/// Remote that answers commands from a script and records them in order.
///
/// A command is answered by the first rule whose pattern it contains. Rules
/// with several queued outputs hand them out in order, repeating the last.
/// Commands that match no rule succeed with empty output.
#[derive(Debug, Default)]
pub(crate) struct ScriptedRemote {
    rules: RefCell<Vec<(String, VecDeque<RemoteOutput>)>>,
    commands: RefCell<Vec<String>>,
}

impl ScriptedRemote {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn respond(
        self,
        pattern: impl Into<String>,
        status: i32,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) -> Self {
        let pattern = pattern.into();
        let output = RemoteOutput {
            status,
            stdout: stdout.into(),
            stderr: stderr.into(),
        };

        {
            let mut rules = self.rules.borrow_mut();
            match rules.iter_mut().find(|(known, _)| *known == pattern) {
                Some((_, outputs)) => outputs.push_back(output),
                None => rules.push((pattern, VecDeque::from([output]))),
            }
        }

        self
    }

    pub(crate) fn commands(&self) -> Vec<String> {
        self.commands.borrow().clone()
    }

    pub(crate) fn position(&self, pattern: &str) -> Option<usize> {
        self.commands
            .borrow()
            .iter()
            .position(|command| command.contains(pattern))
    }
}

impl Remote for ScriptedRemote {
    fn exec(&self, command: &str, _timeout: Duration) -> remote::Result<RemoteOutput> {
        self.commands.borrow_mut().push(command.to_owned());

        let mut rules = self.rules.borrow_mut();
        let output = rules
            .iter_mut()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
            .map(|(_, outputs)| {
                if outputs.len() > 1 {
                    outputs.pop_front().unwrap_or_default()
                } else {
                    outputs.front().cloned().unwrap_or_default()
                }
            })
            .unwrap_or_default();

        Ok(output)
    }
}

/// Scripted operator answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Answer {
    Text(String),
    Port(u16),
    Confirm(bool),
    Select(usize),
    Edit(String),
    Cancel,
}

/// Prompter that replays scripted answers and records prompt messages.
#[derive(Debug, Default)]
pub(crate) struct ScriptedPrompter {
    answers: VecDeque<Answer>,
    pub(crate) messages: Vec<String>,
    pub(crate) edited: Vec<String>,
}

impl ScriptedPrompter {
    pub(crate) fn new(answers: impl IntoIterator<Item = Answer>) -> Self {
        Self {
            answers: answers.into_iter().collect(),
            ..Default::default()
        }
    }

    fn next(&mut self, message: &str) -> Result<Answer, PromptError> {
        self.messages.push(message.to_owned());
        match self.answers.pop_front() {
            Some(Answer::Cancel) => Err(PromptError::Canceled),
            Some(answer) => Ok(answer),
            None => panic!("no scripted answer for prompt {message:?}"),
        }
    }
}

impl Prompter for ScriptedPrompter {
    fn text(&mut self, message: &str, _default: Option<&str>) -> Result<String, PromptError> {
        match self.next(message)? {
            Answer::Text(text) => Ok(text),
            other => panic!("expected text answer for {message:?}, got {other:?}"),
        }
    }

    fn port(&mut self, message: &str, _default: u16) -> Result<u16, PromptError> {
        match self.next(message)? {
            Answer::Port(port) => Ok(port),
            other => panic!("expected port answer for {message:?}, got {other:?}"),
        }
    }

    fn confirm(&mut self, message: &str, _default: bool) -> Result<bool, PromptError> {
        match self.next(message)? {
            Answer::Confirm(yes) => Ok(yes),
            other => panic!("expected confirm answer for {message:?}, got {other:?}"),
        }
    }

    fn select<T>(&mut self, message: &str, mut options: Vec<T>) -> Result<T, PromptError>
    where
        T: Display,
    {
        match self.next(message)? {
            Answer::Select(index) => Ok(options.remove(index)),
            other => panic!("expected select answer for {message:?}, got {other:?}"),
        }
    }

    fn edit(&mut self, message: &str, text: &str, _extension: &str) -> Result<String, PromptError> {
        self.edited.push(text.to_owned());
        match self.next(message)? {
            Answer::Edit(edited) => Ok(edited),
            other => panic!("expected edit answer for {message:?}, got {other:?}"),
        }
    }
}

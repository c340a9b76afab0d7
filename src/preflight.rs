// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Local preconditions.
//!
//! Everything that must hold on the operator's machine before any remote
//! host is contacted. The project being deployed is the Git repository at
//! the current directory. It must be committed in full, because only what
//! Git tracks (and does not ignore) ends up on the remote host.

use crate::{config::Manifest, prompt::EditorCommand};

use git2::{Repository, Status, StatusOptions};
use std::{
    env,
    fs::read,
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument, warn};

/// Executables Stackship shells out to, with a place to learn about them.
pub const REQUIRED_EXECUTABLES: [(&str, &str); 2] = [
    ("rsync", "https://en.wikipedia.org/wiki/Rsync"),
    ("ssh", "https://www.openssh.com/"),
];

/// Editor used when Git and the environment name none.
pub const DEFAULT_EDITOR: &str = "code -w";

/// Make sure every required executable is on `PATH`.
///
/// # Errors
///
/// - Return [`PreflightError::MissingExecutables`] listing __every__ missing
///   executable, not just the first.
pub fn require_executables(executables: &[(&str, &str)]) -> Result<()> {
    let missing = executables
        .iter()
        .filter(|(name, _)| which::which(name).is_err())
        .map(|(name, url)| format!("{name} {url}"))
        .collect::<Vec<_>>();

    if !missing.is_empty() {
        return Err(PreflightError::MissingExecutables(missing));
    }

    Ok(())
}

/// Pick editor command line from Git config, then `VISUAL`, then `EDITOR`.
///
/// Blank values are skipped. Falls back to [`DEFAULT_EDITOR`].
pub fn pick_editor(
    configured: Option<String>,
    visual: Option<String>,
    editor: Option<String>,
) -> String {
    [configured, visual, editor]
        .into_iter()
        .flatten()
        .find(|line| !line.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_EDITOR.to_owned())
}

/// Local Git project being deployed.
pub struct LocalProject {
    repository: Repository,
    root: PathBuf,
    name: String,
}

impl LocalProject {
    /// Open project at target directory.
    ///
    /// # Errors
    ///
    /// - Return [`PreflightError::RootFolder`] if directory is `/`.
    /// - Return [`PreflightError::SingleQuote`] if folder name has a single
    ///   quote.
    /// - Return [`PreflightError::NotRepository`] if directory has no `.git`
    ///   folder.
    /// - Return [`PreflightError::Git2`] if repository cannot be opened.
    #[instrument(skip(dir), level = "debug")]
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let root = dir.as_ref().to_path_buf();
        let name = match root.file_name() {
            Some(name) => name.to_string_lossy().into_owned(),
            None => return Err(PreflightError::RootFolder),
        };

        if name.contains('\'') {
            return Err(PreflightError::SingleQuote(name));
        }

        if !root.join(".git").is_dir() {
            return Err(PreflightError::NotRepository(root));
        }

        let repository = Repository::open(&root)?;
        debug!("opened local project {name:?} at {:?}", root.display());

        Ok(Self {
            repository,
            root,
            name,
        })
    }

    /// Name of project folder, reused as the remote folder name.
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Absolute path to project folder.
    pub fn root(&self) -> &Path {
        self.root.as_path()
    }

    /// Make sure there is nothing uncommitted.
    ///
    /// Modified, staged, and untracked files all count. Ignored files do not.
    ///
    /// # Errors
    ///
    /// - Return [`PreflightError::UncommittedChanges`] listing offending
    ///   paths.
    /// - Return [`PreflightError::Git2`] if status cannot be computed.
    #[instrument(skip(self), level = "debug")]
    pub fn ensure_clean(&self) -> Result<()> {
        info!("making sure there are no uncommitted changes");
        let mut opts = StatusOptions::new();
        opts.include_untracked(true)
            .include_ignored(false)
            .recurse_untracked_dirs(false);

        let statuses = self.repository.statuses(Some(&mut opts))?;
        let dirty = statuses
            .iter()
            .filter(|entry| entry.status() != Status::CURRENT && !entry.status().is_ignored())
            .filter_map(|entry| entry.path().map(ToOwned::to_owned))
            .collect::<Vec<_>>();

        if !dirty.is_empty() {
            return Err(PreflightError::UncommittedChanges(dirty));
        }

        Ok(())
    }

    /// Abbreviated hash of `HEAD`.
    ///
    /// # Errors
    ///
    /// - Return [`PreflightError::Git2`] if `HEAD` has no commit.
    pub fn short_commit(&self) -> Result<String> {
        let commit = self.repository.head()?.peel_to_commit()?;
        let short = commit.as_object().short_id()?;

        Ok(short.as_str().unwrap_or_default().to_owned())
    }

    /// Resolve editor that blocks until the edited file is closed.
    ///
    /// # Errors
    ///
    /// - Return [`PreflightError::EditorNotFound`] if the editor program is
    ///   not on `PATH`.
    #[instrument(skip(self), level = "debug")]
    pub fn editor_command(&self) -> Result<EditorCommand> {
        let configured = self
            .repository
            .config()
            .and_then(|config| config.get_string("core.editor"))
            .ok();
        let line = pick_editor(configured, env::var("VISUAL").ok(), env::var("EDITOR").ok());
        debug!("editor command line {line:?}");

        let editor = EditorCommand::parse(&line)
            .ok_or_else(|| PreflightError::EditorNotFound(line.clone()))?;
        if which::which(editor.program()).is_err() {
            return Err(PreflightError::EditorNotFound(line));
        }

        Ok(editor)
    }

    /// List paths Git ignores, relative to project root.
    ///
    /// Ignored directories are collapsed into one entry instead of listing
    /// their contents.
    ///
    /// # Errors
    ///
    /// - Return [`PreflightError::Git2`] if status cannot be computed.
    #[instrument(skip(self), level = "debug")]
    pub fn ignored_paths(&self) -> Result<Vec<String>> {
        info!("getting the list of files and folders ignored by Git");
        let mut opts = StatusOptions::new();
        opts.include_ignored(true)
            .recurse_ignored_dirs(false)
            .include_untracked(false);

        let statuses = self.repository.statuses(Some(&mut opts))?;
        let mut ignored = statuses
            .iter()
            .filter(|entry| entry.status().is_ignored())
            .filter_map(|entry| entry.path().map(ToOwned::to_owned))
            .collect::<Vec<_>>();
        ignored.sort();

        Ok(ignored)
    }

    /// Read local `.env` file with trailing whitespace trimmed.
    ///
    /// Invalid UTF-8 is replaced rather than rejected.
    ///
    /// # Errors
    ///
    /// - Return [`PreflightError::Read`] if the file exists but cannot be
    ///   read.
    pub fn read_dotenv(&self) -> Result<Option<String>> {
        let path = self.root.join(".env");
        let bytes = match read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(PreflightError::Read { source: err, path }),
        };

        Ok(Some(String::from_utf8_lossy(&bytes).trim_end().to_owned()))
    }

    /// Check if project manifest declares a FastAPI dependency.
    ///
    /// Falls back to a plain text search when `pyproject.toml` is not valid
    /// TOML.
    pub fn uses_fastapi(&self) -> bool {
        let path = self.root.join("pyproject.toml");
        let Ok(bytes) = read(&path) else {
            return false;
        };

        let data = String::from_utf8_lossy(&bytes);
        match data.parse::<Manifest>() {
            Ok(manifest) => manifest.uses_fastapi(),
            Err(err) => {
                warn!("cannot parse {:?}: {err}", path.display());
                data.contains("fastapi")
            }
        }
    }
}

/// Local precondition error types.
#[derive(Debug, thiserror::Error)]
pub enum PreflightError {
    /// Required executables are not installed.
    #[error("missing required executable(s):\n\t{}", .0.join("\n\t"))]
    MissingExecutables(Vec<String>),

    /// Root folder chosen as project.
    #[error("you cannot choose the root folder as the project folder")]
    RootFolder,

    /// Project folder name contains a single quote.
    #[error("the project folder's name must not contain single quotes: {0:?}")]
    SingleQuote(String),

    /// Project folder is not a Git repository.
    #[error("{:?} is not a Git repository", .0.display())]
    NotRepository(PathBuf),

    /// Project has uncommitted changes.
    #[error("there are uncommitted changes that should be handled first:\n\t{}", .0.join("\n\t"))]
    UncommittedChanges(Vec<String>),

    /// Editor cannot be found.
    #[error(
        "editor command `{0}` not found, set your editor in your .gitconfig (https://git-scm.com/docs/git-config)"
    )]
    EditorNotFound(String),

    /// Project file cannot be read.
    #[error("failed to read {:?}", path.display())]
    Read {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    #[error(transparent)]
    Git2(#[from] git2::Error),
}

/// Friendly result alias :3
pub type Result<T, E = PreflightError> = std::result::Result<T, E>;

// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Docker Compose invocation building.
//!
//! A project may split its stack across several compose files that Docker
//! Compose merges in the order they are given, e.g., `compose.yaml` followed
//! by `compose.prod.yaml`. The operator decides that merge order once per
//! run, and every remote compose command of the run then shares the same
//! [`ComposeInvocation`].
//!
//! # Merge Order
//!
//! When more than one compose file is found, the canonical base file is moved
//! to the front, and the operator gets to edit the resulting list in their
//! editor. Lines can be reordered or removed. Removing every line cancels
//! the deployment.

use crate::{
    prompt::{self, Prompter},
    remote::quote,
};

use glob::{MatchOptions, Pattern};
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    fs::read_dir,
    path::{Path, PathBuf},
};
use tracing::{info, instrument};

/// Base compose file names, in order of preference.
pub const CANONICAL_COMPOSE_FILES: [&str; 4] = [
    "compose.yaml",
    "compose.yml",
    "docker-compose.yaml",
    "docker-compose.yml",
];

const MERGE_ORDER_HEADER: &str =
    "# Choose the merge order of the compose files. Any files you remove will be skipped.";

/// Compose files found at the top-level of a project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposeFiles {
    names: Vec<String>,
}

impl ComposeFiles {
    /// Find compose files in target directory.
    ///
    /// Matches `[docker-]compose[.<variant>].y[a]ml` case-insensitively.
    /// Names containing single quotes are skipped, since they cannot be quoted
    /// safely for the remote shell. Names are sorted, then the canonical base
    /// file is moved to the front.
    ///
    /// # Errors
    ///
    /// - Return [`ComposeError::ReadDir`] if directory cannot be read.
    /// - Return [`ComposeError::NotFound`] if no compose file exists.
    #[instrument(skip(dir), level = "debug")]
    pub fn discover(dir: impl AsRef<Path>) -> Result<Self> {
        let patterns = compose_patterns();
        let options = MatchOptions {
            case_sensitive: false,
            require_literal_separator: true,
            require_literal_leading_dot: false,
        };

        let entries = read_dir(dir.as_ref()).map_err(|err| ComposeError::ReadDir {
            source: err,
            path: dir.as_ref().to_path_buf(),
        })?;

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| ComposeError::ReadDir {
                source: err,
                path: dir.as_ref().to_path_buf(),
            })?;
            if !entry.path().is_file() {
                continue;
            }

            let name = entry.file_name().to_string_lossy().into_owned();
            if name.contains('\'') {
                continue;
            }

            if patterns
                .iter()
                .any(|pattern| pattern.matches_with(&name, options))
            {
                names.push(name);
            }
        }

        if names.is_empty() {
            return Err(ComposeError::NotFound(dir.as_ref().to_path_buf()));
        }
        names.sort();

        Ok(Self {
            names: canonical_first(names),
        })
    }

    /// Construct from known file names, applying canonical ordering.
    pub fn new(names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            names: canonical_first(names.into_iter().map(Into::into).collect()),
        }
    }

    /// File names in their current order.
    pub fn names(&self) -> &[String] {
        self.names.as_slice()
    }
}

fn compose_patterns() -> Vec<Pattern> {
    ["", "docker-"]
        .into_iter()
        .flat_map(|prefix| {
            ["compose.yaml", "compose.yml", "compose.?*.yaml", "compose.?*.yml"]
                .into_iter()
                .map(move |name| format!("{prefix}{name}"))
        })
        .filter_map(|pattern| Pattern::new(&pattern).ok())
        .collect()
}

/// Move canonical base compose file to the front.
///
/// Only applies when more than one file is given. The first name that matches
/// one of [`CANONICAL_COMPOSE_FILES`] case-insensitively is moved, and the
/// relative order of the rest is kept.
pub fn canonical_first(mut names: Vec<String>) -> Vec<String> {
    if names.len() < 2 {
        return names;
    }

    let canonical = names.iter().position(|name| {
        CANONICAL_COMPOSE_FILES
            .iter()
            .any(|canonical| name.eq_ignore_ascii_case(canonical))
    });
    if let Some(index) = canonical {
        let name = names.remove(index);
        names.insert(0, name);
    }

    names
}

/// Read merge order from operator's edited file listing.
///
/// Blank lines and lines starting with `#` are dropped. Returns [`None`] if no
/// name remains, which means the operator canceled.
///
/// # Errors
///
/// - Return [`ComposeError::UnknownFile`] if a listed name is not one of the
///   known compose files.
pub fn parse_merge_order(edited: &str, known: &[String]) -> Result<Option<Vec<String>>> {
    let mut order = Vec::new();
    for line in edited.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if !known.iter().any(|name| name == line) {
            return Err(ComposeError::UnknownFile(line.to_owned()));
        }
        order.push(line.to_owned());
    }

    if order.is_empty() {
        return Ok(None);
    }

    Ok(Some(order))
}

/// Settle merge order with operator, and build invocation from it.
///
/// A lone compose file needs no negotiation. Returns [`None`] if the operator
/// canceled by removing every file.
///
/// # Errors
///
/// - Return [`ComposeError::UnknownFile`] if operator lists unknown files.
/// - Return [`ComposeError::Prompt`] if editor prompt fails.
#[instrument(skip(files, prompter), level = "debug")]
pub fn negotiate(files: &ComposeFiles, prompter: &mut impl Prompter) -> Result<Option<ComposeInvocation>> {
    let mut names = files.names().to_vec();

    if names.len() > 1 {
        info!("waiting for you to choose the merge order of the compose files");
        let text = format!("{MERGE_ORDER_HEADER}\n{}\n", names.join("\n"));
        let edited = prompter.edit("Compose file merge order", &text, ".yaml")?;
        match parse_merge_order(&edited, files.names())? {
            Some(order) => names = order,
            None => return Ok(None),
        }
        info!("compose files merge order: {}", names.join(", "));
    }

    ComposeInvocation::build(names).map(Some)
}

/// Compose command prefix shared by every compose call of a run.
///
/// Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposeInvocation {
    files: Vec<String>,
    prefix: String,
}

impl ComposeInvocation {
    /// Build `docker compose -f '<file>'...` prefix from ordered file names.
    ///
    /// # Errors
    ///
    /// - Return [`ComposeError::Empty`] if no file name is given.
    pub fn build(names: impl IntoIterator<Item = impl Into<String>>) -> Result<Self> {
        let files = names.into_iter().map(Into::into).collect::<Vec<String>>();
        if files.is_empty() {
            return Err(ComposeError::Empty);
        }

        let mut prefix = String::from("docker compose");
        for file in &files {
            prefix.push_str(" -f ");
            prefix.push_str(&quote(file));
        }

        Ok(Self { files, prefix })
    }

    /// Ordered compose file names.
    pub fn files(&self) -> &[String] {
        self.files.as_slice()
    }

    /// Command prefix, e.g., `docker compose -f 'compose.yaml'`.
    pub fn prefix(&self) -> &str {
        self.prefix.as_str()
    }

    /// Full command running compose subcommand inside target directory.
    pub fn in_dir(&self, dir: impl AsRef<str>, subcommand: impl AsRef<str>) -> String {
        format!(
            "cd {} && {} {}",
            quote(dir),
            self.prefix,
            subcommand.as_ref()
        )
    }
}

impl Display for ComposeInvocation {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(&self.prefix)
    }
}

/// Compose invocation error types.
#[derive(Debug, thiserror::Error)]
pub enum ComposeError {
    /// Project directory cannot be listed.
    #[error("failed to read project folder at {:?}", path.display())]
    ReadDir {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Project has no compose file.
    #[error("Docker compose file not found in {:?}", .0.display())]
    NotFound(PathBuf),

    /// Operator listed a file that is not a compose file.
    #[error("{0:?} is not a Docker compose file")]
    UnknownFile(String),

    /// Invocation built without files.
    #[error("no compose file names found")]
    Empty,

    /// Merge order prompt fails.
    #[error(transparent)]
    Prompt(#[from] prompt::PromptError),
}

/// Friendly result alias :3
pub type Result<T, E = ComposeError> = std::result::Result<T, E>;

// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Operator prompts.
//!
//! Deployment stages never talk to the terminal directly. They ask a
//! [`Prompter`] instead, so the decision logic can be driven by scripted
//! answers in tests, and by [`inquire`] prompts for real.

use inquire::{Confirm, CustomType, Editor, InquireError, Select, Text};
use std::{
    ffi::{OsStr, OsString},
    fmt::Display,
};
use tracing::instrument;

/// Ask the operator for input.
///
/// Escaping out of any prompt cancels the whole deployment through
/// [`PromptError::Canceled`].
pub trait Prompter {
    /// Ask for one line of free text.
    fn text(&mut self, message: &str, default: Option<&str>) -> Result<String>;

    /// Ask for a TCP port number.
    fn port(&mut self, message: &str, default: u16) -> Result<u16>;

    /// Ask a yes or no question.
    fn confirm(&mut self, message: &str, default: bool) -> Result<bool>;

    /// Ask operator to pick exactly one of the given options.
    fn select<T>(&mut self, message: &str, options: Vec<T>) -> Result<T>
    where
        T: Display;

    /// Let operator edit a block of text in their editor.
    ///
    /// The extension picks the syntax highlighting of the temporary file.
    fn edit(&mut self, message: &str, text: &str, extension: &str) -> Result<String>;
}

impl<P> Prompter for &mut P
where
    P: Prompter + ?Sized,
{
    fn text(&mut self, message: &str, default: Option<&str>) -> Result<String> {
        (**self).text(message, default)
    }

    fn port(&mut self, message: &str, default: u16) -> Result<u16> {
        (**self).port(message, default)
    }

    fn confirm(&mut self, message: &str, default: bool) -> Result<bool> {
        (**self).confirm(message, default)
    }

    fn select<T>(&mut self, message: &str, options: Vec<T>) -> Result<T>
    where
        T: Display,
    {
        (**self).select(message, options)
    }

    fn edit(&mut self, message: &str, text: &str, extension: &str) -> Result<String> {
        (**self).edit(message, text, extension)
    }
}

/// Editor command that blocks until the edited file is closed.
///
/// Usually taken from `core.editor`, e.g., "code -w" or "vim".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditorCommand {
    program: OsString,
    args: Vec<OsString>,
}

impl EditorCommand {
    /// Split editor command line on whitespace.
    ///
    /// Returns [`None`] for a blank command line.
    pub fn parse(command_line: impl AsRef<str>) -> Option<Self> {
        let mut words = command_line.as_ref().split_whitespace();
        let program = words.next()?.into();
        let args = words.map(Into::into).collect();

        Some(Self { program, args })
    }

    /// Program to execute.
    pub fn program(&self) -> &OsStr {
        self.program.as_os_str()
    }

    /// Arguments passed before the edited file path.
    pub fn args(&self) -> &[OsString] {
        self.args.as_slice()
    }
}

/// Prompt operator through the terminal.
#[derive(Debug, Clone)]
pub struct InquirePrompter {
    editor: EditorCommand,
}

impl InquirePrompter {
    /// Construct new terminal prompter using target editor for edits.
    pub fn new(editor: EditorCommand) -> Self {
        Self { editor }
    }
}

impl Prompter for InquirePrompter {
    fn text(&mut self, message: &str, default: Option<&str>) -> Result<String> {
        let mut prompt = Text::new(message);
        if let Some(default) = default {
            prompt = prompt.with_default(default);
        }

        Ok(prompt.prompt()?.trim().to_owned())
    }

    fn port(&mut self, message: &str, default: u16) -> Result<u16> {
        Ok(CustomType::<u16>::new(message)
            .with_default(default)
            .with_error_message("please type a port number between 0 and 65535")
            .prompt()?)
    }

    fn confirm(&mut self, message: &str, default: bool) -> Result<bool> {
        Ok(Confirm::new(message).with_default(default).prompt()?)
    }

    fn select<T>(&mut self, message: &str, options: Vec<T>) -> Result<T>
    where
        T: Display,
    {
        Ok(Select::new(message, options).prompt()?)
    }

    #[instrument(skip(self, text), level = "debug")]
    fn edit(&mut self, message: &str, text: &str, extension: &str) -> Result<String> {
        let args = self
            .editor
            .args()
            .iter()
            .map(OsString::as_os_str)
            .collect::<Vec<_>>();

        Ok(Editor::new(message)
            .with_predefined_text(text)
            .with_file_extension(extension)
            .with_editor_command(self.editor.program())
            .with_args(&args)
            .prompt()?)
    }
}

/// Prompt error types.
#[derive(Debug, thiserror::Error)]
pub enum PromptError {
    /// Operator backed out of a prompt.
    #[error("deployment canceled")]
    Canceled,

    /// Prompt could not be shown or answered.
    #[error(transparent)]
    Inquire(InquireError),
}

impl PromptError {
    /// Check if error is an operator cancellation rather than a failure.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }
}

impl From<InquireError> for PromptError {
    fn from(err: InquireError) -> Self {
        match err {
            InquireError::OperationCanceled | InquireError::OperationInterrupted => Self::Canceled,
            err => Self::Inquire(err),
        }
    }
}

/// Friendly result alias :3
pub type Result<T, E = PromptError> = std::result::Result<T, E>;

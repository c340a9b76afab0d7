// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Deploy Docker Compose projects to remote hosts over SSH.
//!
//! Stackship takes the Git repository in the current directory, and makes a
//! remote host run its compose stack. It inspects what is already on the
//! remote host, reconciles any differences with the operator's consent,
//! transfers the files Git tracks, provisions a `.env` file, and then starts
//! and monitors the services.
//!
//! # See Also
//!
//! 1. [`deploy`] for the reconciliation pipeline.
//! 2. [`remote`] for the remote command channel and its dry run policy.

pub mod compose;
pub mod config;
pub mod deploy;
pub mod docker;
pub mod path;
pub mod preflight;
pub mod prompt;
pub mod remote;

#[cfg(test)]
pub(crate) mod testing;

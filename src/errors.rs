//! Error types for spec validation and process execution.
//!
//! Configuration-time problems (`SpecError`) abort the whole batch before any
//! process is spawned. Runtime problems (`RunnerError`) stay local to the runner
//! that hit them.

use std::io;

use thiserror::Error;

use crate::ansi::BackgroundColor;
use crate::process::{Separator, MAX_COMMANDS};

/// A spec string or batch that cannot be turned into runnable commands.
#[derive(Debug, Error)]
pub enum SpecError {
    #[error("invalid command: {input} (expected \"<color><sep><prefix><sep><command>\")")]
    Format { input: String },

    #[error(
        "invalid background color: {value} (allowed: {allowed})",
        allowed = BackgroundColor::names().join(", ")
    )]
    InvalidColor { value: String },

    #[error("invalid separator: {value} (allowed: {allowed})", allowed = Separator::allowed())]
    InvalidSeparator { value: String },

    #[error("invalid pre-hook command: {input}")]
    PreHookFormat { input: String },

    #[error("no command to execute")]
    NoCommands,

    #[error("only support up to {max} commands, got {count}")]
    TooManyCommands { count: usize, max: usize },
}

impl SpecError {
    pub fn too_many(count: usize) -> Self {
        SpecError::TooManyCommands {
            count,
            max: MAX_COMMANDS,
        }
    }
}

/// Failure while driving a single child process.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("failed to start `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    /// The runner was destroyed before a worker got to start it.
    #[error("runner was cancelled before start")]
    Cancelled,

    #[error("failed waiting for process exit: {0}")]
    Wait(#[source] io::Error),
}

//! Error types for the supervisor.

use std::path::PathBuf;
use thiserror::Error;

/// Configuration errors that should be reported to the user as a plain
/// message, without a backtrace or error chain.
#[derive(Error, Debug)]
pub enum UserError {
    /// `--new` was given but the grain's var directory already exists.
    #[error("Grain already exists: {0}")]
    GrainExists(String),

    /// The grain's var directory does not exist and `--new` was not given.
    #[error("No such grain: {0}")]
    NoSuchGrain(String),

    /// App name was empty or contained a path separator.
    #[error("Invalid app name.")]
    InvalidAppName,

    /// Grain id was empty or contained a path separator.
    #[error("Invalid grain id.")]
    InvalidGrainId,

    /// An `--env` argument was not of the form NAME=VALUE.
    #[error("Invalid environment variable (expected NAME=VALUE): {0}")]
    InvalidEnvVar(String),
}

/// Errors that can occur while interacting with `/proc` filesystem entries.
#[derive(Error, Debug)]
pub enum ProcfsError {
    /// Failed to write to a `/proc` filesystem entry.
    #[error("failed to write to {path:?}")]
    WriteFailed {
        /// The `/proc` entry that was being written.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source_err: std::io::Error,
    },

    /// Failed to read from a `/proc` filesystem entry.
    #[error("failed to read from {path:?}")]
    ReadFailed {
        /// The `/proc` entry that was being read.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source_err: std::io::Error,
    },
}

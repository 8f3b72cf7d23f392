//! Error types for command execution.
//!
//! A nonzero exit code is not an error; callers inspect
//! [`CommandResult::exit_code`](crate::CommandResult) themselves.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("empty command")]
    EmptyCommand,

    #[error("io error while waiting on '{program}': {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

impl ExecError {
    /// Whether the program never started (binary missing, permission denied).
    pub fn is_spawn_failure(&self) -> bool {
        matches!(self, ExecError::Spawn { .. } | ExecError::EmptyCommand)
    }
}

/// Result type for command execution.
pub type Result<T> = std::result::Result<T, ExecError>;

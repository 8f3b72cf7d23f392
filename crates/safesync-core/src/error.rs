//! Error taxonomy for the sync workflow.
//!
//! The rebase engine itself never returns `Err`: every failure it meets is
//! folded into the terminal phase of a [`RebaseAttempt`](crate::RebaseAttempt).
//! These errors cover the surrounding workflow.

use crate::rebase::RebaseAttempt;

/// Errors from the commit-message seam.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("no changes to describe")]
    EmptyDiff,

    #[error("generator returned an empty message")]
    EmptyMessage,

    #[error("generator command failed (exit {exit_code}): {stderr}")]
    CommandFailed { exit_code: i32, stderr: String },

    #[error("generator not configured")]
    NotConfigured,

    #[error("generator interrupted")]
    Interrupted,

    #[error("failed to launch generator: {0}")]
    Exec(#[from] safesync_exec::ExecError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Workflow errors.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("command could not be launched: {0}")]
    Spawn(#[from] safesync_exec::ExecError),

    #[error("git error: {0}")]
    GitError(String),

    #[error("not inside a git work tree: {0}")]
    NotARepository(String),

    #[error("interrupted")]
    Interrupted,

    #[error("check failed: {0}")]
    CheckFailed(String),

    #[error("commit message unavailable: {0}")]
    Message(#[from] MessageError),

    #[error("integration ended in {}: {}", .0.phase, .0.diagnostic.as_deref().unwrap_or("no diagnostic"))]
    Integration(Box<RebaseAttempt>),

    #[error("declined: {0}")]
    Declined(String),

    #[error("untracked files present: {0}")]
    UntrackedFiles(String),

    #[error("push failed: {0}")]
    PushFailed(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Process exit code for this error (130 for interruption, 1 otherwise).
    pub fn exit_code(&self) -> i32 {
        match self {
            SyncError::Interrupted | SyncError::Message(MessageError::Interrupted) => 130,
            _ => 1,
        }
    }
}

/// Result type for workflow operations.
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_git_error_display() {
        let err = SyncError::GitError("rev-parse HEAD failed".to_string());
        assert!(err.to_string().contains("git error"));
        assert!(err.to_string().contains("rev-parse HEAD failed"));
    }

    #[test]
    fn test_message_error_wraps() {
        let err: SyncError = MessageError::EmptyMessage.into();
        assert!(err.to_string().contains("commit message unavailable"));
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn test_interrupted_maps_to_sigint_exit() {
        assert_eq!(SyncError::Interrupted.exit_code(), 130);
        assert_eq!(SyncError::Message(MessageError::Interrupted).exit_code(), 130);
    }

    #[test]
    fn test_generator_failure_display() {
        let err = MessageError::CommandFailed {
            exit_code: 2,
            stderr: "quota exceeded".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("exit 2"));
        assert!(msg.contains("quota exceeded"));
    }
}

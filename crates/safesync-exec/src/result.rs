//! Outcome of one command invocation.

use serde::{Deserialize, Serialize};

/// Exit code reported for a cancelled command (SIGINT convention).
pub const EXIT_CANCELLED: i32 = 130;

/// Exit code reported for a command that hit its timeout.
pub const EXIT_TIMED_OUT: i32 = 124;

/// Which pipe a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Result of a command execution. Immutable once returned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    /// Exit code (0 = success by the tool's convention).
    pub exit_code: i32,

    /// Captured stdout, lossily decoded.
    pub stdout: String,

    /// Captured stderr, lossily decoded.
    pub stderr: String,

    /// Terminated because the cancellation token fired.
    pub cancelled: bool,

    /// Terminated because the timeout elapsed.
    pub timed_out: bool,

    /// Terminated because a line callback asked to stop.
    pub stopped_early: bool,

    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
}

impl CommandResult {
    /// A result for a command that ran to completion.
    pub fn completed(exit_code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: stdout.into(),
            stderr: stderr.into(),
            cancelled: false,
            timed_out: false,
            stopped_early: false,
            duration_ms: 0,
        }
    }

    /// A result for a command terminated by cancellation.
    pub fn cancelled(stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            cancelled: true,
            ..Self::completed(EXIT_CANCELLED, stdout, stderr)
        }
    }

    /// A result for a command terminated by its timeout.
    pub fn timed_out(stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            timed_out: true,
            ..Self::completed(EXIT_TIMED_OUT, stdout, stderr)
        }
    }

    /// Cancelled or timed out. Check this before `exit_code`.
    pub fn interrupted(&self) -> bool {
        self.cancelled || self.timed_out
    }

    /// Ran to completion with exit code 0.
    pub fn success(&self) -> bool {
        !self.interrupted() && !self.stopped_early && self.exit_code == 0
    }

    /// stdout followed by stderr.
    pub fn combined_output(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (true, _) => self.stderr.clone(),
            (_, true) => self.stdout.clone(),
            _ => format!("{}\n{}", self.stdout.trim_end(), self.stderr),
        }
    }

    /// Trimmed stdout, the usual shape for single-value git queries.
    pub fn trimmed_stdout(&self) -> &str {
        self.stdout.trim()
    }
}

//! Workflow configuration.
//!
//! Defaults come from environment variables so the binary and library users
//! see the same knobs:
//!
//! | variable                       | default  |
//! |--------------------------------|----------|
//! | `SAFESYNC_REMOTE`              | `origin` |
//! | `SAFESYNC_TIMEOUT_SECS`        | `600`    |
//! | `SAFESYNC_GRACE_SECS`          | `10`     |
//! | `SAFESYNC_CHECK_TIMEOUT_SECS`  | `300`    |
//! | `SAFESYNC_MESSAGE_CMD`         | unset    |
//!
//! A timeout of `0` disables the limit.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Result, SyncError};

pub const DEFAULT_REMOTE: &str = "origin";
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_GRACE_SECS: u64 = 10;
pub const DEFAULT_CHECK_TIMEOUT_SECS: u64 = 300;

/// Configuration shared by the engine, checks and workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Remote that integration targets are resolved against.
    pub remote: String,

    /// Per-command limit for git invocations (0 = none).
    pub command_timeout_secs: u64,

    /// Wait between terminate and kill when a command is interrupted.
    pub grace_secs: u64,

    /// Limit for `./lint` and `./test` (0 = none).
    pub check_timeout_secs: u64,

    /// argv of an external commit-message generator; the diff file path is appended.
    pub message_command: Option<Vec<String>>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            remote: std::env::var("SAFESYNC_REMOTE")
                .ok()
                .filter(|r| !r.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_REMOTE.to_string()),
            command_timeout_secs: env_secs("SAFESYNC_TIMEOUT_SECS", DEFAULT_COMMAND_TIMEOUT_SECS),
            grace_secs: env_secs("SAFESYNC_GRACE_SECS", DEFAULT_GRACE_SECS),
            check_timeout_secs: env_secs(
                "SAFESYNC_CHECK_TIMEOUT_SECS",
                DEFAULT_CHECK_TIMEOUT_SECS,
            ),
            message_command: std::env::var("SAFESYNC_MESSAGE_CMD")
                .ok()
                .and_then(|raw| split_argv(&raw)),
        }
    }
}

impl SyncConfig {
    /// Create a config from environment variables.
    pub fn from_env() -> Self {
        Self::default()
    }

    pub fn with_remote(mut self, remote: &str) -> Self {
        self.remote = remote.to_string();
        self
    }

    pub fn with_command_timeout_secs(mut self, secs: u64) -> Self {
        self.command_timeout_secs = secs;
        self
    }

    pub fn with_grace_secs(mut self, secs: u64) -> Self {
        self.grace_secs = secs;
        self
    }

    pub fn with_check_timeout_secs(mut self, secs: u64) -> Self {
        self.check_timeout_secs = secs;
        self
    }

    pub fn with_message_command(mut self, argv: Vec<String>) -> Self {
        self.message_command = Some(argv).filter(|a| !a.is_empty());
        self
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        non_zero(self.command_timeout_secs)
    }

    pub fn check_timeout(&self) -> Option<Duration> {
        non_zero(self.check_timeout_secs)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }

    /// Reject configurations the engine cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.remote.trim().is_empty() || self.remote.contains(char::is_whitespace) {
            return Err(SyncError::Config(format!(
                "remote name '{}' is not usable",
                self.remote
            )));
        }
        Ok(())
    }
}

fn env_secs(var: &str, default: u64) -> u64 {
    std::env::var(var)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn non_zero(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

/// Split an argv string with POSIX shell quoting rules.
///
/// `None` for blank input or unbalanced quotes.
pub fn split_argv(raw: &str) -> Option<Vec<String>> {
    shlex::split(raw).filter(|argv| !argv.is_empty())
}

//! Commit message generation.
//!
//! The workflow asks a [`MessageGenerator`] for a one-line message describing
//! the staged diff. Generators never touch the repository.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use safesync_exec::{CancellationToken, CommandRunner, CommandSpec};

use crate::error::MessageError;

#[async_trait]
pub trait MessageGenerator: Send + Sync {
    /// Produce a commit message for `diff`.
    async fn generate(
        &self,
        diff: &str,
        cancel: &CancellationToken,
    ) -> Result<String, MessageError>;
}

/// Always returns the same message.
#[derive(Debug, Clone)]
pub struct FixedMessage(String);

impl FixedMessage {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

#[async_trait]
impl MessageGenerator for FixedMessage {
    async fn generate(
        &self,
        _diff: &str,
        _cancel: &CancellationToken,
    ) -> Result<String, MessageError> {
        clean_message(&self.0).ok_or(MessageError::EmptyMessage)
    }
}

/// Runs an external command with the diff file path appended to its argv.
///
/// The first non-empty stdout line becomes the message.
pub struct CommandMessageGenerator {
    argv: Vec<String>,
    runner: Arc<dyn CommandRunner>,
    timeout: Option<Duration>,
}

impl CommandMessageGenerator {
    pub fn new(argv: Vec<String>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            argv,
            runner,
            timeout: Some(Duration::from_secs(120)),
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl MessageGenerator for CommandMessageGenerator {
    async fn generate(
        &self,
        diff: &str,
        cancel: &CancellationToken,
    ) -> Result<String, MessageError> {
        if diff.trim().is_empty() {
            return Err(MessageError::EmptyDiff);
        }
        let mut file = tempfile::Builder::new()
            .prefix("safesync-diff-")
            .suffix(".patch")
            .tempfile()?;
        file.write_all(diff.as_bytes())?;
        file.flush()?;

        let spec = CommandSpec::from_argv(&self.argv)
            .ok_or(MessageError::NotConfigured)?
            .arg(file.path().to_string_lossy().into_owned())
            .quiet(true)
            .timeout(self.timeout);
        let result = self.runner.run(&spec, cancel).await?;
        if result.interrupted() {
            return Err(MessageError::Interrupted);
        }
        if !result.success() {
            return Err(MessageError::CommandFailed {
                exit_code: result.exit_code,
                stderr: result.stderr.trim().to_string(),
            });
        }
        clean_message(&result.stdout).ok_or(MessageError::EmptyMessage)
    }
}

/// First non-empty line with surrounding quotes or backticks removed.
pub fn clean_message(raw: &str) -> Option<String> {
    raw.lines()
        .map(|l| l.trim().trim_matches(|c| c == '"' || c == '\'' || c == '`').trim())
        .find(|l| !l.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use safesync_exec::ProcessRunner;

    #[test]
    fn clean_message_takes_first_line() {
        assert_eq!(
            clean_message("\n  \"fix: handle empty diff\"  \nmore detail\n").as_deref(),
            Some("fix: handle empty diff")
        );
        assert_eq!(clean_message("```\n\n"), None);
        assert_eq!(clean_message(""), None);
    }

    #[tokio::test]
    async fn fixed_message_rejects_blank() {
        let cancel = CancellationToken::new();
        assert_eq!(
            FixedMessage::new("chore: sync").generate("", &cancel).await.unwrap(),
            "chore: sync"
        );
        assert!(matches!(
            FixedMessage::new("  ").generate("", &cancel).await,
            Err(MessageError::EmptyMessage)
        ));
    }

    #[tokio::test]
    async fn command_generator_reads_diff_file() {
        let generator = CommandMessageGenerator::new(
            vec![
                "sh".to_string(),
                "-c".to_string(),
                "echo \"update $(grep -c '^+' \"$0\") lines\"".to_string(),
            ],
            Arc::new(ProcessRunner::new()),
        );
        let message = generator
            .generate("+a\n+b\n-c\n", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(message, "update 2 lines");
    }

    #[tokio::test]
    async fn command_generator_surfaces_failure() {
        let generator = CommandMessageGenerator::new(
            vec!["sh".to_string(), "-c".to_string(), "echo nope >&2; exit 4".to_string()],
            Arc::new(ProcessRunner::new()),
        );
        let err = generator
            .generate("+x\n", &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            MessageError::CommandFailed { exit_code, stderr } => {
                assert_eq!(exit_code, 4);
                assert_eq!(stderr, "nope");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn empty_diff_is_rejected_before_running() {
        let generator =
            CommandMessageGenerator::new(vec!["false".to_string()], Arc::new(ProcessRunner::new()));
        assert!(matches!(
            generator.generate("  \n", &CancellationToken::new()).await,
            Err(MessageError::EmptyDiff)
        ));
    }
}

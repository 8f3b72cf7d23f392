//! Project lint and test scripts.
//!
//! `./lint` and `./test` in the repository root are run through `bash` when
//! present, with a timeout and optional early stop on an output line.

use std::path::{Path, PathBuf};
use std::time::Duration;

use safesync_exec::{
    CancellationToken, CommandResult, CommandSpec, LineControl, OutputStream, ProcessRunner,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Result, SyncError};

/// Which script to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckKind {
    Lint,
    Test,
}

impl CheckKind {
    pub fn name(self) -> &'static str {
        match self {
            CheckKind::Lint => "lint",
            CheckKind::Test => "test",
        }
    }

    pub fn script(self, root: &Path) -> PathBuf {
        root.join(self.name())
    }
}

/// Outcome of one script run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckReport {
    pub name: String,
    pub passed: bool,
    pub exit_code: i32,
    pub output: String,
    pub stopped_early: bool,
    pub timed_out: bool,
    pub cancelled: bool,
    pub message: Option<String>,
}

impl CheckReport {
    fn from_result(kind: CheckKind, result: CommandResult) -> Self {
        let name = kind.name().to_string();
        let message = if result.cancelled {
            Some(format!("{name} interrupted"))
        } else if result.timed_out {
            Some(format!("{name} timed out"))
        } else if result.stopped_early {
            Some(format!("{name} stopped early"))
        } else if !result.success() {
            Some(format!("{name} failed with exit code {}", result.exit_code))
        } else {
            None
        };
        Self {
            passed: result.success(),
            exit_code: result.exit_code,
            output: result.combined_output(),
            stopped_early: result.stopped_early,
            timed_out: result.timed_out,
            cancelled: result.cancelled,
            message,
            name,
        }
    }
}

/// Lint and test results together. A missing script counts as passing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LintTestReport {
    pub lint: Option<CheckReport>,
    pub test: Option<CheckReport>,
}

impl LintTestReport {
    pub fn success(&self) -> bool {
        self.reports().all(|r| r.passed)
    }

    pub fn interrupted(&self) -> bool {
        self.reports().any(|r| r.cancelled)
    }

    pub fn exit_code(&self) -> i32 {
        self.reports()
            .find(|r| !r.passed)
            .map(|r| r.exit_code)
            .unwrap_or(0)
    }

    pub fn error_message(&self) -> Option<String> {
        self.reports().find(|r| !r.passed).and_then(|r| r.message.clone())
    }

    fn reports(&self) -> impl Iterator<Item = &CheckReport> {
        self.lint.iter().chain(self.test.iter())
    }
}

/// Settings shared by both scripts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOptions {
    pub verbose: bool,
    pub timeout: Option<Duration>,
    pub grace: Duration,
    /// Mirror script output to the terminal.
    pub stream: bool,
}

impl Default for CheckOptions {
    fn default() -> Self {
        Self {
            verbose: false,
            timeout: Some(Duration::from_secs(crate::config::DEFAULT_CHECK_TIMEOUT_SECS)),
            grace: safesync_exec::spec::DEFAULT_GRACE,
            stream: true,
        }
    }
}

fn check_spec(kind: CheckKind, root: &Path, options: &CheckOptions) -> CommandSpec {
    let mut spec = CommandSpec::new("bash")
        .arg(format!("./{}", kind.name()))
        .cwd(root)
        .quiet(!options.stream)
        .timeout(options.timeout)
        .grace(options.grace);
    if options.verbose {
        spec = spec.arg("--verbose");
    }
    spec
}

/// Run one script if it exists; `None` when it does not.
///
/// `on_line` sees every output line and may stop the script.
pub async fn run_check<F>(
    kind: CheckKind,
    root: &Path,
    options: &CheckOptions,
    cancel: &CancellationToken,
    on_line: F,
) -> Result<Option<CheckReport>>
where
    F: FnMut(OutputStream, &str) -> LineControl + Send,
{
    if !kind.script(root).is_file() {
        return Ok(None);
    }
    let spec = check_spec(kind, root, options);
    info!(check = kind.name(), command = %spec.display(), "running check");
    let result = ProcessRunner::new()
        .run_with_lines(&spec, cancel, on_line)
        .await
        .map_err(SyncError::from)?;
    let report = CheckReport::from_result(kind, result);
    if let Some(message) = &report.message {
        warn!(check = kind.name(), exit_code = report.exit_code, "{message}");
    }
    Ok(Some(report))
}

/// Run `./lint` then `./test`, skipping either on request.
///
/// Stops after a failing lint; the test report is then `None`.
pub async fn lint_test(
    root: &Path,
    options: &CheckOptions,
    skip_lint: bool,
    skip_test: bool,
    cancel: &CancellationToken,
) -> Result<LintTestReport> {
    let mut report = LintTestReport::default();
    if !skip_lint {
        report.lint = run_check(CheckKind::Lint, root, options, cancel, continue_always).await?;
        if !report.success() {
            return Ok(report);
        }
    }
    if !skip_test {
        report.test = run_check(CheckKind::Test, root, options, cancel, continue_always).await?;
    }
    Ok(report)
}

fn continue_always(_: OutputStream, _: &str) -> LineControl {
    LineControl::Continue
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_script(dir: &Path, name: &str, body: &str) {
        std::fs::write(dir.join(name), format!("#!/bin/bash\n{body}\n")).unwrap();
    }

    fn quiet() -> CheckOptions {
        CheckOptions {
            stream: false,
            ..CheckOptions::default()
        }
    }

    #[tokio::test]
    async fn missing_scripts_pass() {
        let dir = tempfile::tempdir().unwrap();
        let report = lint_test(dir.path(), &quiet(), false, false, &CancellationToken::new())
            .await
            .unwrap();
        assert!(report.lint.is_none());
        assert!(report.test.is_none());
        assert!(report.success());
        assert_eq!(report.exit_code(), 0);
    }

    #[tokio::test]
    async fn failing_lint_skips_tests() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "lint", "echo 'style error' >&2; exit 3");
        write_script(dir.path(), "test", "echo ran > ran.txt");
        let report = lint_test(dir.path(), &quiet(), false, false, &CancellationToken::new())
            .await
            .unwrap();
        assert!(!report.success());
        assert_eq!(report.exit_code(), 3);
        assert!(report.lint.as_ref().unwrap().output.contains("style error"));
        assert!(report.test.is_none());
        assert!(!dir.path().join("ran.txt").exists());
        assert_eq!(
            report.error_message().as_deref(),
            Some("lint failed with exit code 3")
        );
    }

    #[tokio::test]
    async fn verbose_flag_is_passed() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "test", "echo \"args: $*\"");
        let options = CheckOptions {
            verbose: true,
            ..quiet()
        };
        let report = lint_test(dir.path(), &options, true, false, &CancellationToken::new())
            .await
            .unwrap();
        let test = report.test.unwrap();
        assert!(test.passed);
        assert!(test.output.contains("args: --verbose"));
    }

    #[tokio::test]
    async fn line_callback_can_stop_a_check() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "test", "echo FAILED: first; exec sleep 30");
        let report = run_check(
            CheckKind::Test,
            dir.path(),
            &quiet(),
            &CancellationToken::new(),
            |_, line| {
                if line.starts_with("FAILED") {
                    LineControl::Stop
                } else {
                    LineControl::Continue
                }
            },
        )
        .await
        .unwrap()
        .unwrap();
        assert!(report.stopped_early);
        assert!(!report.passed);
        assert_eq!(report.message.as_deref(), Some("test stopped early"));
    }

    #[tokio::test]
    async fn timeout_fails_the_check() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "lint", "exec sleep 30");
        let options = CheckOptions {
            timeout: Some(Duration::from_millis(300)),
            grace: Duration::from_millis(200),
            ..quiet()
        };
        let report = lint_test(dir.path(), &options, false, true, &CancellationToken::new())
            .await
            .unwrap();
        let lint = report.lint.unwrap();
        assert!(lint.timed_out);
        assert!(!lint.passed);
    }
}

//! The end-to-end sync: detect changes, check, commit, integrate, push.

use std::sync::Arc;

use safesync_exec::{CancellationToken, CommandResult};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::checks::{self, CheckOptions, LintTestReport};
use crate::config::SyncConfig;
use crate::error::{MessageError, Result, SyncError};
use crate::git::Git;
use crate::message::{clean_message, MessageGenerator};
use crate::rebase::{RebaseAttempt, SafeRebase};

const SUSPICIOUS_SUFFIXES: &[&str] = &[
    ".txt", ".log", ".tmp", ".temp", ".o", ".obj", ".exe", ".dll", ".so", ".dylib", ".pyc",
    ".pyo", ".pyd", ".class", ".vsproj", ".vcxproj", ".sln", ".suo", ".user", ".cache", ".bak",
    ".swp", ".swo",
];

/// Names that usually should not be committed (build output, editor
/// droppings, temp files).
pub fn is_suspicious_file(name: &str) -> bool {
    let lower = name.to_lowercase();
    SUSPICIOUS_SUFFIXES.iter().any(|s| lower.ends_with(s))
        || lower.contains("tmp")
        || lower.contains("temp")
}

/// Interactive questions asked during a sync.
pub trait Prompter: Send + Sync {
    fn confirm(&self, question: &str, default: bool) -> bool;
    fn ask(&self, question: &str) -> Option<String>;
}

/// Answers every question with its default.
#[derive(Debug, Clone, Copy, Default)]
pub struct AssumeDefaults;

impl Prompter for AssumeDefaults {
    fn confirm(&self, _question: &str, default: bool) -> bool {
        default
    }

    fn ask(&self, _question: &str) -> Option<String> {
        None
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOptions {
    pub no_push: bool,
    pub no_rebase: bool,
    pub no_lint: bool,
    pub no_test: bool,
    /// Run checks only.
    pub dry_run: bool,
    /// With `dry_run`, run only `./lint` (unless `test_only` is also set).
    pub lint_only: bool,
    /// With `dry_run`, run only `./test` (unless `lint_only` is also set).
    pub test_only: bool,
    pub non_interactive: bool,
    pub verbose: bool,
    pub message: Option<String>,
    /// Show a generated message and ask before committing with it.
    pub no_autoaccept: bool,
    /// Fail on untracked files instead of asking about them.
    pub pre_test: bool,
    /// Stage everything and commit; no checks, integration or push.
    pub just_commit: bool,
}

impl SyncOptions {
    /// `(no_lint, no_test)` after applying the dry-run selection.
    pub fn skipped_checks(&self) -> (bool, bool) {
        let (mut no_lint, mut no_test) = (self.no_lint, self.no_test);
        if self.dry_run && self.lint_only != self.test_only {
            no_lint |= self.test_only;
            no_test |= self.lint_only;
        }
        (no_lint, no_test)
    }
}

/// Working-copy changes at the start of a sync.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub staged: Vec<String>,
    pub unstaged: Vec<String>,
    pub untracked: Vec<String>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.staged.is_empty() && self.unstaged.is_empty() && self.untracked.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushStatus {
    Skipped,
    Pushed,
    /// First push was rejected; pushed after integrating the remote.
    PushedAfterIntegration,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub changes: ChangeSet,
    pub checks: Option<LintTestReport>,
    /// Message of the commit made, if any.
    pub committed: Option<String>,
    pub integrations: Vec<RebaseAttempt>,
    pub push: PushStatus,
}

impl SyncReport {
    fn new(changes: ChangeSet) -> Self {
        Self {
            changes,
            checks: None,
            committed: None,
            integrations: Vec::new(),
            push: PushStatus::Skipped,
        }
    }
}

pub struct SyncWorkflow {
    git: Git,
    config: SyncConfig,
    generator: Option<Arc<dyn MessageGenerator>>,
    prompter: Arc<dyn Prompter>,
    cancel: CancellationToken,
}

impl SyncWorkflow {
    pub fn new(git: Git, config: SyncConfig) -> Self {
        Self {
            git,
            config,
            generator: None,
            prompter: Arc::new(AssumeDefaults),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_generator(mut self, generator: Arc<dyn MessageGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn with_prompter(mut self, prompter: Arc<dyn Prompter>) -> Self {
        self.prompter = prompter;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn engine(&self) -> SafeRebase {
        SafeRebase::new(self.git.clone())
            .with_remote(&self.config.remote)
            .with_cancellation(self.cancel.clone())
    }

    fn checkpoint(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(SyncError::Interrupted)
        } else {
            Ok(())
        }
    }

    /// Interrupted → `Interrupted`, nonzero → `GitError`.
    fn ensure(result: CommandResult, what: &str) -> Result<CommandResult> {
        if result.interrupted() {
            return Err(SyncError::Interrupted);
        }
        if !result.success() {
            return Err(SyncError::GitError(format!(
                "{what} failed (exit {}): {}",
                result.exit_code,
                result.combined_output().trim()
            )));
        }
        Ok(result)
    }

    pub async fn detect_changes(&self) -> Result<ChangeSet> {
        Ok(ChangeSet {
            staged: self.git.staged_files(&self.cancel).await?,
            unstaged: self.git.unstaged_files(&self.cancel).await?,
            untracked: self.git.untracked_files(&self.cancel).await?,
        })
    }

    /// Whether HEAD has commits its upstream lacks. `false` without an upstream.
    pub async fn has_unpushed_commits(&self) -> Result<bool> {
        match self.git.upstream_branch(&self.cancel).await? {
            Some(upstream) => Ok(self.git.commits_ahead(&upstream, &self.cancel).await? > 0),
            None => Ok(false),
        }
    }

    /// `<remote>/<main>` when the current branch is a side branch whose merge
    /// base lags the remote main branch.
    pub async fn rebase_target(&self) -> Result<Option<String>> {
        let remote = &self.config.remote;
        let main = self.git.main_branch(remote, &self.cancel).await?;
        let current = self.git.current_branch(&self.cancel).await?;
        if current.as_deref() == Some(main.as_str()) {
            return Ok(None);
        }
        let tracking = format!("{remote}/{main}");
        let remote_head = self.git.rev_parse(&tracking, &self.cancel).await?;
        if remote_head.interrupted() {
            return Err(SyncError::Interrupted);
        }
        if !remote_head.success() {
            return Ok(None);
        }
        let base = self.git.merge_base("HEAD", &tracking, &self.cancel).await?;
        Ok((base != remote_head.trimmed_stdout()).then_some(tracking))
    }

    pub async fn run(&self, options: &SyncOptions) -> Result<SyncReport> {
        if options.just_commit {
            return self.just_commit(options).await;
        }
        if options.dry_run {
            let mut report = SyncReport::new(ChangeSet::default());
            report.checks = Some(self.run_checks(options).await?);
            return Ok(report);
        }

        let changes = self.detect_changes().await?;
        let mut report = SyncReport::new(changes.clone());

        if changes.is_empty() {
            if options.no_push || !self.has_unpushed_commits().await? {
                info!("no changes to commit, working tree clean");
                return Ok(report);
            }
            info!("no changes to commit; pushing unpushed commits");
        } else {
            self.stage_untracked(&changes.untracked, options).await?;
            self.checkpoint()?;

            report.checks = Some(self.run_checks(options).await?);
            self.checkpoint()?;

            Self::ensure(self.git.add_all(&self.cancel).await?, "git add")?;
            let message = self.commit_message(options).await?;
            Self::ensure(self.git.commit(&message, &self.cancel).await?, "git commit")?;
            info!(message = %message, "committed");
            report.committed = Some(message);
        }

        if options.no_push {
            return Ok(report);
        }
        self.checkpoint()?;
        Self::ensure(
            self.git.fetch(&self.config.remote, None, &self.cancel).await?,
            "git fetch",
        )?;

        if !options.no_rebase {
            if let Some(target) = self.rebase_target().await? {
                info!(target = %target, "branch is behind; integrating");
                if !options.non_interactive
                    && !self
                        .prompter
                        .confirm(&format!("Attempt rebase onto {target}?"), true)
                {
                    return Err(SyncError::Declined(format!("rebase onto {target}")));
                }
                let attempt = self.integrate(&target, &mut report).await?;
                info!(phase = %attempt.phase, "integration finished");
            }
        }

        let push = self.safe_push(options, &mut report).await?;
        report.push = push;
        Ok(report)
    }

    /// `git add -A`, then commit with the usual message sources.
    async fn just_commit(&self, options: &SyncOptions) -> Result<SyncReport> {
        let changes = self.detect_changes().await?;
        let mut report = SyncReport::new(changes.clone());
        if changes.is_empty() {
            info!("no changes to commit, working tree clean");
            return Ok(report);
        }
        Self::ensure(self.git.add_all(&self.cancel).await?, "git add")?;
        let message = self.commit_message(options).await?;
        Self::ensure(self.git.commit(&message, &self.cancel).await?, "git commit")?;
        info!(message = %message, "committed");
        report.committed = Some(message);
        Ok(report)
    }

    async fn run_checks(&self, options: &SyncOptions) -> Result<LintTestReport> {
        let check_options = CheckOptions {
            verbose: options.verbose,
            timeout: self.config.check_timeout(),
            grace: self.config.grace(),
            stream: true,
        };
        let (no_lint, no_test) = options.skipped_checks();
        let report = checks::lint_test(
            self.git.workdir(),
            &check_options,
            no_lint,
            no_test,
            &self.cancel,
        )
        .await?;
        if report.interrupted() {
            return Err(SyncError::Interrupted);
        }
        if !report.success() {
            return Err(SyncError::CheckFailed(
                report
                    .error_message()
                    .unwrap_or_else(|| "checks failed".to_string()),
            ));
        }
        Ok(report)
    }

    async fn stage_untracked(&self, files: &[String], options: &SyncOptions) -> Result<()> {
        if files.is_empty() {
            return Ok(());
        }
        if options.pre_test {
            return Err(SyncError::UntrackedFiles(files.join(", ")));
        }
        for file in files.iter().filter(|f| is_suspicious_file(f)) {
            warn!(file = %file, "untracked file looks like it should not be committed");
        }
        if !options.non_interactive && !self.prompter.confirm("There are untracked files. Continue?", true) {
            return Err(SyncError::Declined("untracked files".to_string()));
        }
        for file in files {
            self.checkpoint()?;
            let add = options.non_interactive
                || self
                    .prompter
                    .confirm(&format!("  Add {file}?"), !is_suspicious_file(file));
            if add {
                Self::ensure(self.git.add_path(file, &self.cancel).await?, "git add")?;
            } else {
                info!(file = %file, "skipping untracked file");
            }
        }
        Ok(())
    }

    async fn commit_message(&self, options: &SyncOptions) -> Result<String> {
        if let Some(message) = options.message.as_deref() {
            return clean_message(message).ok_or(SyncError::Message(MessageError::EmptyMessage));
        }

        let generated = match &self.generator {
            Some(generator) => {
                let diff = self.git.diff_cached(&self.cancel).await?;
                generator.generate(&diff, &self.cancel).await
            }
            None => Err(MessageError::NotConfigured),
        };

        match generated {
            Ok(message) => self.accept_generated(message, options),
            Err(MessageError::Interrupted) => Err(SyncError::Interrupted),
            Err(e) if options.non_interactive => Err(e.into()),
            Err(e) => {
                warn!(error = %e, "automatic commit message unavailable");
                self.prompter
                    .ask("Commit message: ")
                    .as_deref()
                    .and_then(clean_message)
                    .ok_or(SyncError::Message(e))
            }
        }
    }

    /// With `no_autoaccept`, show the generated message and let the user keep
    /// it or type a replacement.
    fn accept_generated(&self, message: String, options: &SyncOptions) -> Result<String> {
        if !options.no_autoaccept || options.non_interactive {
            return Ok(message);
        }
        if self
            .prompter
            .confirm(&format!("Generated commit message: {message}\nUse it?"), true)
        {
            return Ok(message);
        }
        self.prompter
            .ask("Commit message: ")
            .as_deref()
            .and_then(clean_message)
            .ok_or_else(|| SyncError::Declined("generated commit message".to_string()))
    }

    /// Run the engine; anything but `Success` becomes `SyncError::Integration`.
    async fn integrate(&self, target: &str, report: &mut SyncReport) -> Result<RebaseAttempt> {
        let attempt = self.engine().attempt_safe_integration(target).await;
        report.integrations.push(attempt.clone());
        if attempt.is_success() {
            Ok(attempt)
        } else if self.cancel.is_cancelled() && attempt.outcome().is_some_and(|o| o.restored()) {
            Err(SyncError::Interrupted)
        } else {
            Err(SyncError::Integration(Box::new(attempt)))
        }
    }

    /// Push; on a non-fast-forward rejection integrate the upstream once and
    /// retry a single time.
    pub async fn safe_push(&self, options: &SyncOptions, report: &mut SyncReport) -> Result<PushStatus> {
        let branch = self
            .git
            .current_branch(&self.cancel)
            .await?
            .ok_or_else(|| SyncError::PushFailed("HEAD is detached".to_string()))?;
        let upstream = self.git.upstream_branch(&self.cancel).await?;
        let remote = &self.config.remote;

        let first = self
            .git
            .push(remote, &branch, upstream.is_none(), &self.cancel)
            .await?;
        if first.interrupted() {
            return Err(SyncError::Interrupted);
        }
        if first.success() {
            return Ok(PushStatus::Pushed);
        }

        let stderr = first.stderr.to_lowercase();
        let rejected = stderr.contains("non-fast-forward")
            || stderr.contains("rejected")
            || stderr.contains("fetch first");
        if !rejected || options.no_rebase {
            return Err(SyncError::PushFailed(first.stderr.trim().to_string()));
        }

        warn!("push rejected; integrating remote changes before retrying");
        let target = upstream.unwrap_or_else(|| format!("{remote}/{branch}"));
        self.integrate(&target, report).await?;

        let second = self.git.push(remote, &branch, false, &self.cancel).await?;
        if second.interrupted() {
            return Err(SyncError::Interrupted);
        }
        if second.success() {
            Ok(PushStatus::PushedAfterIntegration)
        } else {
            Err(SyncError::PushFailed(format!(
                "push failed after integration: {}",
                second.stderr.trim()
            )))
        }
    }
}

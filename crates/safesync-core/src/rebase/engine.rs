use safesync_exec::{CancellationToken, CommandResult};
use tracing::{info, warn, Instrument};

use super::attempt::{BackupRef, FailureKind, Outcome, Phase, RebaseAttempt};
use super::target::IntegrationTarget;
use crate::config::DEFAULT_REMOTE;
use crate::conflict;
use crate::error::{Result, SyncError};
use crate::git::{self, Git};
use crate::obs;
use crate::recovery::{self, BackupCheck, RollbackReport};

/// Drives one rebase attempt at a time against a working copy.
///
/// Cancelling the token interrupts whichever git command is running; the
/// engine then rolls back and reports a non-success terminal phase.
pub struct SafeRebase {
    git: Git,
    remote: String,
    cancel: CancellationToken,
}

/// Early exit before any mutation: always `PreconditionFailed`.
struct Halt {
    failure: FailureKind,
    diagnostic: String,
    recovery: Vec<String>,
}

impl Halt {
    fn precondition(diagnostic: String, recovery: Vec<String>) -> Self {
        Self {
            failure: FailureKind::Precondition,
            diagnostic,
            recovery,
        }
    }

    fn interrupted(step: &str, result: &CommandResult, recovery: Vec<String>) -> Self {
        Self {
            failure: FailureKind::Cancellation,
            diagnostic: format!(
                "{step} {}; no local changes were made",
                interruption(result)
            ),
            recovery,
        }
    }

    fn spawn(step: &str, error: &SyncError, recovery: Vec<String>) -> Self {
        Self {
            failure: FailureKind::Spawn,
            diagnostic: format!("{step}: git could not be launched: {error}"),
            recovery,
        }
    }

    fn conclude(self, attempt: &mut RebaseAttempt) {
        attempt.fail(self.failure);
        attempt.conclude(
            Outcome::PreconditionFailed,
            Some(self.diagnostic),
            self.recovery,
        );
    }
}

fn interruption(result: &CommandResult) -> &'static str {
    if result.timed_out {
        "timed out"
    } else {
        "was interrupted"
    }
}

impl SafeRebase {
    pub fn new(git: Git) -> Self {
        Self {
            git,
            remote: DEFAULT_REMOTE.to_string(),
            cancel: CancellationToken::new(),
        }
    }

    /// Remote used when a target names only a branch.
    pub fn with_remote(mut self, remote: &str) -> Self {
        self.remote = remote.to_string();
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn git(&self) -> &Git {
        &self.git
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Integrate the current branch onto `target` by rebase.
    ///
    /// Never returns an error: every failure ends in a terminal phase with a
    /// diagnostic and remediation commands on the returned attempt.
    pub async fn attempt_safe_integration(&self, target: &str) -> RebaseAttempt {
        let target = IntegrationTarget::parse(target, &self.remote);
        let mut attempt = RebaseAttempt::new(&target);
        let id = attempt.id.to_string();
        let tracking = target.tracking_ref();

        obs::emit_integration_started(&id, &tracking);
        self.drive(&mut attempt, &target)
            .instrument(obs::attempt_span(&id, &tracking))
            .await;
        obs::emit_integration_finished(&id, &attempt.phase, attempt.duration_ms());
        attempt
    }

    /// Force the working copy back to `backup`. Safe to repeat.
    pub async fn emergency_rollback(&self, backup: &BackupRef) -> RollbackReport {
        recovery::emergency_rollback(&self.git, backup).await
    }

    /// Validate a user-supplied backup id, e.g. from an earlier attempt's report.
    pub async fn resolve_backup(&self, candidate: &str) -> Result<BackupRef> {
        let (check, _) = recovery::validate_backup(&self.git, candidate, &self.cancel).await?;
        match check {
            BackupCheck::Valid(backup) => Ok(backup),
            BackupCheck::Invalid(reason) => Err(SyncError::GitError(format!(
                "backup reference invalid: {reason}"
            ))),
            BackupCheck::Interrupted => Err(SyncError::Interrupted),
        }
    }

    async fn drive(&self, attempt: &mut RebaseAttempt, target: &IntegrationTarget) {
        let backup = match self.capture_backup(attempt, target).await {
            Ok(backup) => backup,
            Err(halt) => return halt.conclude(attempt),
        };
        attempt.set_backup(backup.clone());
        attempt.transition(Phase::BackupCaptured);

        if let Err(halt) = self.verify_clean(attempt, target, &backup).await {
            return halt.conclude(attempt);
        }
        attempt.transition(Phase::CleanVerified);

        match self.fetch(attempt, target, &backup).await {
            Ok(remote_ref) => attempt.remote_ref = Some(remote_ref),
            Err(halt) => return halt.conclude(attempt),
        }
        attempt.transition(Phase::Fetched);

        self.rebase(attempt, target, &backup).await
    }

    /// Run `git <args>` under the attempt's token and record it.
    async fn step(&self, attempt: &mut RebaseAttempt, args: &[&str]) -> Result<CommandResult> {
        let command = self.git.spec(args).display();
        match self.git.run(args, &self.cancel).await {
            Ok(result) => {
                attempt.record(&command, &result);
                Ok(result)
            }
            Err(e) => {
                attempt.record_spawn_failure(&command, &e);
                Err(e)
            }
        }
    }

    async fn capture_backup(
        &self,
        attempt: &mut RebaseAttempt,
        target: &IntegrationTarget,
    ) -> std::result::Result<BackupRef, Halt> {
        let none = || recovery::recovery_commands(None, target);

        let head = self
            .step(attempt, &["rev-parse", "HEAD"])
            .await
            .map_err(|e| Halt::spawn("backup reference invalid", &e, none()))?;
        if head.interrupted() {
            return Err(Halt::interrupted("backup capture", &head, none()));
        }
        if !head.success() || head.trimmed_stdout().is_empty() {
            return Err(Halt::precondition(
                format!(
                    "backup reference invalid: rev-parse HEAD failed (exit {}): {}",
                    head.exit_code,
                    head.stderr.trim()
                ),
                none(),
            ));
        }

        let candidate = head.trimmed_stdout().to_string();
        let check_args = recovery::backup_check_args(&candidate);
        let check_args: Vec<&str> = check_args.iter().map(String::as_str).collect();
        let command = self.git.spec(&check_args).display();
        let (check, result) = match recovery::validate_backup(&self.git, &candidate, &self.cancel).await {
            Ok(checked) => checked,
            Err(e) => {
                attempt.record_spawn_failure(&command, &e);
                return Err(Halt::spawn("backup reference invalid", &e, none()));
            }
        };
        attempt.record(&command, &result);
        match check {
            BackupCheck::Valid(backup) => {
                info!(backup = %backup, "backup captured");
                Ok(backup)
            }
            BackupCheck::Invalid(reason) => Err(Halt::precondition(
                format!("backup reference invalid: {reason}"),
                none(),
            )),
            BackupCheck::Interrupted => Err(Halt::interrupted("backup validation", &result, none())),
        }
    }

    async fn verify_clean(
        &self,
        attempt: &mut RebaseAttempt,
        target: &IntegrationTarget,
        backup: &BackupRef,
    ) -> std::result::Result<(), Halt> {
        let status = self
            .step(attempt, &["status", "--porcelain"])
            .await
            .map_err(|e| {
                Halt::spawn(
                    "working directory status",
                    &e,
                    recovery::recovery_commands(Some(backup), target),
                )
            })?;
        if status.interrupted() {
            return Err(Halt::interrupted(
                "working directory status check",
                &status,
                recovery::dirty_tree_commands(),
            ));
        }
        if !status.success() {
            return Err(Halt::precondition(
                format!(
                    "working directory status could not be read (exit {}): {}",
                    status.exit_code,
                    status.stderr.trim()
                ),
                recovery::dirty_tree_commands(),
            ));
        }
        if !git::is_clean(&status.stdout) {
            return Err(Halt::precondition(
                format!(
                    "working directory not clean; inspect with `git status`, then stash, commit or reset before retrying:\n{}",
                    status.stdout.trim_end()
                ),
                recovery::dirty_tree_commands(),
            ));
        }
        Ok(())
    }

    /// Fetch the target branch and resolve its remote-tracking position.
    async fn fetch(
        &self,
        attempt: &mut RebaseAttempt,
        target: &IntegrationTarget,
        backup: &BackupRef,
    ) -> std::result::Result<String, Halt> {
        let recovery = || recovery::recovery_commands(Some(backup), target);

        let fetch = self
            .step(attempt, &["fetch", &target.remote, &target.branch])
            .await
            .map_err(|e| Halt::spawn("fetch failed", &e, recovery()))?;
        if fetch.interrupted() {
            return Err(Halt::interrupted("fetch", &fetch, recovery()));
        }
        if !fetch.success() {
            return Err(Halt::precondition(
                format!(
                    "fetch failed for {target} (exit {}): {}",
                    fetch.exit_code,
                    fetch.stderr.trim()
                ),
                recovery(),
            ));
        }

        let tracking = target.tracking_ref();
        let resolved = self
            .step(attempt, &["rev-parse", "--verify", "--quiet", &tracking])
            .await
            .map_err(|e| Halt::spawn("fetch failed", &e, recovery()))?;
        if resolved.interrupted() {
            return Err(Halt::interrupted("fetch", &resolved, recovery()));
        }
        if !resolved.success() || resolved.trimmed_stdout().is_empty() {
            return Err(Halt::precondition(
                format!("fetch failed: {tracking} does not resolve after fetching"),
                recovery(),
            ));
        }
        Ok(resolved.trimmed_stdout().to_string())
    }

    async fn rebase(&self, attempt: &mut RebaseAttempt, target: &IntegrationTarget, backup: &BackupRef) {
        attempt.transition(Phase::Rebasing);
        let onto = target.tracking_ref();

        let result = match self.step(attempt, &["rebase", &onto]).await {
            Ok(result) => result,
            Err(e) => {
                attempt.fail(FailureKind::Spawn);
                let diagnostic = format!("rebase onto {onto} could not be launched: {e}");
                return self.rollback(attempt, target, backup, diagnostic).await;
            }
        };

        // interruption is checked before the exit code
        if result.interrupted() {
            attempt.fail(FailureKind::Cancellation);
            let diagnostic = format!("rebase onto {onto} {}", interruption(&result));
            return self.rollback(attempt, target, backup, diagnostic).await;
        }

        if result.success() {
            attempt.transition(Phase::RebaseSucceeded);
            return self.verify_success(attempt, target, backup).await;
        }

        attempt.transition(Phase::ConflictDetected);
        attempt.fail(FailureKind::Conflict);
        let output = result.combined_output();
        let diagnostic = if conflict::detect_conflict(&output) {
            format!("rebase onto {onto} stopped on conflicts")
        } else {
            format!(
                "rebase onto {onto} failed (exit {}) without conflict markers:\n{}",
                result.exit_code,
                output.trim()
            )
        };
        attempt.conflict_paths = self.conflict_paths(attempt, &output).await;
        self.abort(attempt, target, backup, diagnostic).await
    }

    /// Paths from `CONFLICT` lines merged with git's own unmerged list.
    async fn conflict_paths(&self, attempt: &mut RebaseAttempt, output: &str) -> Vec<String> {
        let parsed = conflict::parse_conflict_paths(output);
        let unmerged = match self
            .step(attempt, &["diff", "--name-only", "--diff-filter=U"])
            .await
        {
            Ok(result) if result.success() => result.stdout,
            _ => String::new(),
        };
        conflict::merge_paths(parsed.iter().map(String::as_str), unmerged.lines())
    }

    async fn abort(
        &self,
        attempt: &mut RebaseAttempt,
        target: &IntegrationTarget,
        backup: &BackupRef,
        diagnostic: String,
    ) {
        attempt.transition(Phase::Aborting);

        let abort = match self.step(attempt, &["rebase", "--abort"]).await {
            Ok(result) => result,
            Err(e) => {
                attempt.fail(FailureKind::Rollback);
                let diagnostic = format!("{diagnostic}; rebase --abort could not be launched: {e}");
                return self.rollback(attempt, target, backup, diagnostic).await;
            }
        };
        if abort.interrupted() {
            attempt.fail(FailureKind::Cancellation);
            let diagnostic = format!("{diagnostic}; rebase --abort {}", interruption(&abort));
            return self.rollback(attempt, target, backup, diagnostic).await;
        }
        if !abort.success() {
            attempt.fail(FailureKind::Rollback);
            let diagnostic = format!(
                "{diagnostic}; rebase --abort failed (exit {}): {}",
                abort.exit_code,
                abort.combined_output().trim()
            );
            return self.rollback(attempt, target, backup, diagnostic).await;
        }

        attempt.transition(Phase::AbortVerified);
        let mut steps = Vec::new();
        let verified = recovery::verify_at_backup(&self.git, backup, &self.cancel, &mut steps).await;
        attempt.transcript.extend(steps);

        match verified {
            Ok(()) => {
                attempt.transition(Phase::CleanRollback);
                let mut message = diagnostic;
                if !attempt.conflict_paths.is_empty() {
                    message.push_str(&format!(
                        "; conflicting paths: {}",
                        attempt.conflict_paths.join(", ")
                    ));
                }
                message.push_str(&format!(
                    "; rebase aborted, repository restored to {}; resolve manually and retry",
                    backup.short()
                ));
                attempt.conclude(
                    Outcome::ConflictRecovered,
                    Some(message),
                    recovery::recovery_commands(Some(backup), target),
                );
            }
            Err(reason) => {
                let kind = if self.cancel.is_cancelled() {
                    FailureKind::Cancellation
                } else {
                    FailureKind::Rollback
                };
                attempt.fail(kind);
                let diagnostic = format!("{diagnostic}; state after abort not verified: {reason}");
                self.rollback(attempt, target, backup, diagnostic).await
            }
        }
    }

    /// Confirm a successful rebase left a clean tree on top of the fetched
    /// remote position.
    async fn verify_success(
        &self,
        attempt: &mut RebaseAttempt,
        target: &IntegrationTarget,
        backup: &BackupRef,
    ) {
        let remote_ref = attempt
            .remote_ref
            .clone()
            .unwrap_or_else(|| target.tracking_ref());

        let status = match self.step(attempt, &["status", "--porcelain"]).await {
            Ok(result) => result,
            Err(e) => {
                attempt.fail(FailureKind::Spawn);
                let diagnostic = format!("post-rebase status could not be launched: {e}");
                return self.rollback(attempt, target, backup, diagnostic).await;
            }
        };
        if status.interrupted() {
            attempt.fail(FailureKind::Cancellation);
            let diagnostic = format!("post-rebase verification {}", interruption(&status));
            return self.rollback(attempt, target, backup, diagnostic).await;
        }
        if !status.success() || !git::is_clean(&status.stdout) {
            let reason = format!(
                "rebase reported success but the working copy is not clean (exit {}):\n{}{}",
                status.exit_code,
                status.stdout.trim_end(),
                status.stderr.trim_end()
            );
            return self.unverified(attempt, target, backup, reason);
        }

        let ancestry = match self
            .step(attempt, &["merge-base", "--is-ancestor", &remote_ref, "HEAD"])
            .await
        {
            Ok(result) => result,
            Err(e) => {
                attempt.fail(FailureKind::Spawn);
                let diagnostic = format!("post-rebase ancestry check could not be launched: {e}");
                return self.rollback(attempt, target, backup, diagnostic).await;
            }
        };
        if ancestry.interrupted() {
            attempt.fail(FailureKind::Cancellation);
            let diagnostic = format!("post-rebase verification {}", interruption(&ancestry));
            return self.rollback(attempt, target, backup, diagnostic).await;
        }
        match ancestry.exit_code {
            0 => {}
            1 => {
                let reason = format!("rebase reported success but HEAD does not contain {remote_ref}");
                return self.unverified(attempt, target, backup, reason);
            }
            code => {
                let reason = format!(
                    "could not compare HEAD with {remote_ref} (exit {code}): {}",
                    ancestry.stderr.trim()
                );
                return self.unverified(attempt, target, backup, reason);
            }
        }

        attempt.transition(Phase::PostVerified);
        attempt.conclude(Outcome::Success, None, Vec::new());
    }

    /// Success claimed by git but not confirmed: leave the state for a human.
    fn unverified(
        &self,
        attempt: &mut RebaseAttempt,
        target: &IntegrationTarget,
        backup: &BackupRef,
        reason: String,
    ) {
        warn!(reason = %reason, "integration result could not be verified");
        attempt.fail(FailureKind::Emergency);
        attempt.conclude(
            Outcome::Unrecoverable,
            Some(format!(
                "{reason}; repository left as is for inspection, backup is {}",
                backup.short()
            )),
            recovery::unrecoverable_commands(backup, target),
        );
    }

    async fn rollback(
        &self,
        attempt: &mut RebaseAttempt,
        target: &IntegrationTarget,
        backup: &BackupRef,
        diagnostic: String,
    ) {
        attempt.transition(Phase::EmergencyRollback);
        let report = recovery::emergency_rollback(&self.git, backup).await;
        attempt.transcript.extend(report.steps);

        if report.restored {
            attempt.conclude(
                Outcome::EmergencyRolledBack,
                Some(format!(
                    "{diagnostic}; emergency rollback restored {}",
                    backup.short()
                )),
                recovery::recovery_commands(Some(backup), target),
            );
        } else {
            attempt.fail(FailureKind::Emergency);
            let reason = report
                .failure
                .unwrap_or_else(|| "state after reset not verified".to_string());
            attempt.conclude(
                Outcome::Unrecoverable,
                Some(format!(
                    "{diagnostic}; emergency rollback failed: {reason}; manual recovery required"
                )),
                recovery::unrecoverable_commands(backup, target),
            );
        }
    }
}

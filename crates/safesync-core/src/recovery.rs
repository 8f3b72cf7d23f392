//! Backup validation, remediation command lists, and emergency rollback.
//!
//! Everything here is pure except [`validate_backup`] and
//! [`emergency_rollback`], which issue git commands.

use safesync_exec::{CancellationToken, CommandResult};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};
use crate::git::{self, Git};
use crate::obs;
use crate::rebase::{BackupRef, IntegrationTarget, TranscriptEntry};

/// Result of checking that a candidate backup id still resolves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupCheck {
    Valid(BackupRef),
    Invalid(String),
    Interrupted,
}

/// argv of the query [`validate_backup`] issues for `candidate`.
pub fn backup_check_args(candidate: &str) -> Vec<String> {
    vec![
        "rev-parse".to_string(),
        "--verify".to_string(),
        "--quiet".to_string(),
        git::commit_rev(candidate.trim()),
    ]
}

/// Confirm `candidate` names a commit in the local store and expand it to
/// the full id, so abbreviated ids compare equal to `rev-parse HEAD` later.
///
/// Returns the check together with the raw result for the caller's transcript.
pub async fn validate_backup(
    git: &Git,
    candidate: &str,
    cancel: &CancellationToken,
) -> Result<(BackupCheck, CommandResult)> {
    let candidate = candidate.trim();
    if candidate.is_empty() || candidate.starts_with('-') || candidate.contains(char::is_whitespace)
    {
        let result = CommandResult::completed(128, "", "empty or malformed identifier");
        return Ok((
            BackupCheck::Invalid(format!("'{candidate}' is not a usable identifier")),
            result,
        ));
    }

    let result = git.resolve_commit(candidate, cancel).await?;
    let resolved = result.trimmed_stdout();
    let check = if result.interrupted() {
        BackupCheck::Interrupted
    } else if result.success() && !resolved.is_empty() {
        BackupCheck::Valid(BackupRef::validated(resolved))
    } else {
        BackupCheck::Invalid(format!(
            "{candidate} does not name a commit (exit {}){}",
            result.exit_code,
            match result.stderr.trim() {
                "" => String::new(),
                stderr => format!(": {stderr}"),
            }
        ))
    };
    Ok((check, result))
}

/// Remediation after a failed integration: inspect status, reset to backup,
/// retry, inspect history.
pub fn recovery_commands(backup: Option<&BackupRef>, target: &IntegrationTarget) -> Vec<String> {
    let mut commands = vec!["git status  # check current state".to_string()];
    match backup {
        Some(backup) => commands.push(format!(
            "git reset --hard {backup}  # roll back to pre-rebase state ({})",
            backup.short()
        )),
        None => commands.push("git reset --hard ORIG_HEAD  # roll back to previous HEAD".to_string()),
    }
    commands.push(format!(
        "git rebase {}  # retry the rebase manually",
        target.tracking_ref()
    ));
    commands.push("git reflog  # view detailed history for recovery".to_string());
    commands
}

/// Remediation when even the forced reset could not be verified.
pub fn emergency_recovery_commands(backup: Option<&BackupRef>) -> Vec<String> {
    let mut commands = vec![
        "git status  # check current repository state".to_string(),
        "git reflog --oneline -10  # view recent ref changes".to_string(),
    ];
    match backup {
        Some(backup) => {
            commands.push("git rebase --abort  # clear any rebase still in progress".to_string());
            commands.push(format!(
                "git reset --hard {backup}  # force rollback to backup state ({})",
                backup.short()
            ));
        }
        None => {
            commands.push("git reset --hard ORIG_HEAD  # try rolling back to previous HEAD".to_string());
            commands.push("git fsck --lost-found  # find any orphaned commits".to_string());
        }
    }
    commands
}

/// Remediation for an attempt left in an unverified state: inspect,
/// force the backup back, then re-attempt.
pub fn unrecoverable_commands(backup: &BackupRef, target: &IntegrationTarget) -> Vec<String> {
    let mut commands = emergency_recovery_commands(Some(backup));
    commands.push(format!(
        "git rebase {}  # re-attempt once the state is understood",
        target.tracking_ref()
    ));
    commands
}

/// Remediation for a dirty working copy.
pub fn dirty_tree_commands() -> Vec<String> {
    vec![
        "git status  # see what is modified".to_string(),
        "git stash push --include-untracked  # set changes aside".to_string(),
        "git commit -am \"wip\"  # or commit them".to_string(),
        "git reset --hard  # or discard tracked changes".to_string(),
    ]
}

/// What an emergency rollback did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackReport {
    /// HEAD equals the backup and the tree is clean.
    pub restored: bool,
    pub steps: Vec<TranscriptEntry>,
    pub failure: Option<String>,
}

impl RollbackReport {
    fn record(&mut self, git: &Git, args: &[&str], result: &CommandResult) {
        self.steps
            .push(TranscriptEntry::from_result(git.spec(args).display(), result));
    }

    fn spawn_failed(&mut self, git: &Git, args: &[&str], error: &SyncError) {
        self.steps
            .push(TranscriptEntry::spawn_failure(git.spec(args).display(), error));
        self.failure = Some(format!("git {} could not run: {error}", args.join(" ")));
    }
}

/// Force the working copy back to `backup`.
///
/// Uses its own never-cancelled token: the interrupt that triggered the
/// rollback must not also stop it. Aborts a rebase left mid-flight first,
/// then `reset --hard`, then verifies HEAD and cleanliness. Running it twice
/// leaves the same state as running it once.
pub async fn emergency_rollback(git: &Git, backup: &BackupRef) -> RollbackReport {
    let cancel = CancellationToken::new();
    let mut report = RollbackReport::default();
    obs::emit_emergency_rollback(backup.as_str());

    // the backup must still resolve before anything destructive runs
    let check_args = backup_check_args(backup.as_str());
    let check_args: Vec<&str> = check_args.iter().map(String::as_str).collect();
    let resolved = match validate_backup(git, backup.as_str(), &cancel).await {
        Ok((check, result)) => {
            report.record(git, &check_args, &result);
            match check {
                BackupCheck::Valid(resolved) => resolved,
                BackupCheck::Invalid(reason) => {
                    report.failure = Some(format!("backup no longer resolves: {reason}"));
                    obs::emit_rollback_finished(backup.as_str(), false);
                    return report;
                }
                BackupCheck::Interrupted => {
                    report.failure = Some("backup check did not complete".to_string());
                    obs::emit_rollback_finished(backup.as_str(), false);
                    return report;
                }
            }
        }
        Err(e) => {
            report.spawn_failed(git, &check_args, &e);
            obs::emit_rollback_finished(backup.as_str(), false);
            return report;
        }
    };
    let backup = &resolved;

    match git.status_long(&cancel).await {
        Ok(status) => {
            report.record(git, &["status"], &status);
            if git::rebase_in_progress(&status.stdout) {
                // result ignored; the reset below decides
                match git.rebase_abort(&cancel).await {
                    Ok(abort) => report.record(git, &["rebase", "--abort"], &abort),
                    Err(e) => tracing::warn!(error = %e, "rebase --abort could not run during rollback"),
                }
            }
        }
        Err(e) => tracing::warn!(error = %e, "status could not run during rollback"),
    }

    let reset_args = ["reset", "--hard", backup.as_str()];
    match git.reset_hard(backup.as_str(), &cancel).await {
        Ok(reset) => {
            report.record(git, &reset_args, &reset);
            if !reset.success() {
                report.failure = Some(format!(
                    "git reset --hard {} failed (exit {}): {}",
                    backup.short(),
                    reset.exit_code,
                    reset.stderr.trim()
                ));
                obs::emit_rollback_finished(backup.as_str(), false);
                return report;
            }
        }
        Err(e) => {
            report.spawn_failed(git, &reset_args, &e);
            obs::emit_rollback_finished(backup.as_str(), false);
            return report;
        }
    }

    match verify_at_backup(git, backup, &cancel, &mut report.steps).await {
        Ok(()) => report.restored = true,
        Err(reason) => report.failure = Some(format!("state after reset not verified: {reason}")),
    }
    obs::emit_rollback_finished(backup.as_str(), report.restored);
    report
}

/// Check HEAD equals `backup` and the working copy is clean.
///
/// Both must hold; `Err` carries the first mismatch found.
pub async fn verify_at_backup(
    git: &Git,
    backup: &BackupRef,
    cancel: &CancellationToken,
    transcript: &mut Vec<TranscriptEntry>,
) -> std::result::Result<(), String> {
    let head = git
        .rev_parse_head(cancel)
        .await
        .map_err(|e| format!("rev-parse HEAD could not run: {e}"))?;
    transcript.push(TranscriptEntry::from_result(
        git.spec(&["rev-parse", "HEAD"]).display(),
        &head,
    ));
    if head.interrupted() {
        return Err("interrupted while reading HEAD".to_string());
    }
    if !head.success() {
        return Err(format!(
            "rev-parse HEAD failed (exit {}): {}",
            head.exit_code,
            head.stderr.trim()
        ));
    }
    if head.trimmed_stdout() != backup.as_str() {
        return Err(format!(
            "HEAD is {} but backup is {}",
            head.trimmed_stdout(),
            backup
        ));
    }

    let status = git
        .status_porcelain(cancel)
        .await
        .map_err(|e| format!("status could not run: {e}"))?;
    transcript.push(TranscriptEntry::from_result(
        git.spec(&["status", "--porcelain"]).display(),
        &status,
    ));
    if status.interrupted() {
        return Err("interrupted while reading status".to_string());
    }
    if !status.success() {
        return Err(format!(
            "status failed (exit {}): {}",
            status.exit_code,
            status.stderr.trim()
        ));
    }
    if !git::is_clean(&status.stdout) {
        return Err(format!(
            "working copy is not clean:\n{}",
            status.stdout.trim_end()
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backup() -> BackupRef {
        BackupRef::validated("0123456789abcdef0123456789abcdef01234567")
    }

    #[test]
    fn recovery_commands_follow_inspect_reset_retry_history_order() {
        let target = IntegrationTarget::new("origin", "main");
        let commands = recovery_commands(Some(&backup()), &target);
        assert_eq!(commands.len(), 4);
        assert!(commands[0].starts_with("git status"));
        assert!(commands[1].starts_with("git reset --hard 0123456789abcdef"));
        assert!(commands[1].contains("(01234567)"));
        assert!(commands[2].starts_with("git rebase origin/main"));
        assert!(commands[3].starts_with("git reflog"));
    }

    #[test]
    fn recovery_commands_without_backup_fall_back_to_orig_head() {
        let target = IntegrationTarget::new("origin", "feature-xyz");
        let commands = recovery_commands(None, &target);
        assert!(commands.iter().any(|c| c.contains("ORIG_HEAD")));
        assert!(commands.iter().any(|c| c.contains("origin/feature-xyz")));
    }

    #[test]
    fn emergency_commands_with_and_without_backup() {
        let with = emergency_recovery_commands(Some(&backup()));
        assert!(with.iter().any(|c| c.starts_with("git reset --hard 0123456789abcdef")));
        assert!(with.iter().any(|c| c.starts_with("git reflog --oneline -10")));

        let without = emergency_recovery_commands(None);
        assert!(without.iter().any(|c| c.contains("ORIG_HEAD")));
        assert!(without.iter().any(|c| c.starts_with("git fsck --lost-found")));
    }

    #[test]
    fn unrecoverable_commands_end_with_retry() {
        let target = IntegrationTarget::new("origin", "main");
        let commands = unrecoverable_commands(&backup(), &target);
        assert!(commands[0].starts_with("git status"));
        assert!(commands.iter().any(|c| c.starts_with("git reset --hard 0123456789abcdef")));
        assert!(commands.last().unwrap().starts_with("git rebase origin/main"));
    }

    #[test]
    fn dirty_tree_commands_offer_stash() {
        let commands = dirty_tree_commands();
        assert!(commands[0].starts_with("git status"));
        assert!(commands.iter().any(|c| c.contains("stash")));
    }
}

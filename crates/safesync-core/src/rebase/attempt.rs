use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use safesync_exec::CommandResult;

use super::target::IntegrationTarget;
use crate::obs;

/// Phases of one integration attempt.
///
/// `Init → BackupCaptured → CleanVerified → Fetched → Rebasing →
/// {RebaseSucceeded → PostVerified | ConflictDetected → Aborting →
/// AbortVerified → {CleanRollback | EmergencyRollback}}`, ending in one of
/// the five terminal phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Init,
    BackupCaptured,
    CleanVerified,
    Fetched,
    Rebasing,
    RebaseSucceeded,
    ConflictDetected,
    PostVerified,
    Aborting,
    AbortVerified,
    CleanRollback,
    EmergencyRollback,

    Success,
    ConflictRecovered,
    EmergencyRolledBack,
    PreconditionFailed,
    Unrecoverable,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        self.outcome().is_some()
    }

    pub fn outcome(self) -> Option<Outcome> {
        match self {
            Phase::Success => Some(Outcome::Success),
            Phase::ConflictRecovered => Some(Outcome::ConflictRecovered),
            Phase::EmergencyRolledBack => Some(Outcome::EmergencyRolledBack),
            Phase::PreconditionFailed => Some(Outcome::PreconditionFailed),
            Phase::Unrecoverable => Some(Outcome::Unrecoverable),
            _ => None,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Terminal outcome of an attempt. Exactly one per attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    /// Rebase stopped on conflicts; the repository is back at the backup.
    ConflictRecovered,
    /// State had to be forced back to the backup.
    EmergencyRolledBack,
    /// Nothing was mutated.
    PreconditionFailed,
    /// Restoration could not be verified; manual recovery required.
    Unrecoverable,
}

impl Outcome {
    pub fn phase(self) -> Phase {
        match self {
            Outcome::Success => Phase::Success,
            Outcome::ConflictRecovered => Phase::ConflictRecovered,
            Outcome::EmergencyRolledBack => Phase::EmergencyRolledBack,
            Outcome::PreconditionFailed => Phase::PreconditionFailed,
            Outcome::Unrecoverable => Phase::Unrecoverable,
        }
    }

    /// Whether the repository is known to be at its pre-attempt state.
    pub fn restored(self) -> bool {
        matches!(
            self,
            Outcome::ConflictRecovered | Outcome::EmergencyRolledBack | Outcome::PreconditionFailed
        )
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.phase(), f)
    }
}

/// Failure classes met during an attempt, in the order they occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// git could not be launched.
    Spawn,
    /// Backup invalid, dirty tree or fetch failure.
    Precondition,
    /// Rebase produced conflict markers or an unexplained nonzero exit.
    Conflict,
    /// Abort, or verification after abort, failed.
    Rollback,
    /// Forced reset to the backup failed or could not be verified.
    Emergency,
    /// Interrupt or timeout during a blocking step.
    Cancellation,
}

/// Validated commit id captured before any mutation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackupRef(String);

impl BackupRef {
    /// Wrap an id already confirmed to exist in the object store.
    pub(crate) fn validated(id: &str) -> Self {
        Self(id.trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight characters, for messages.
    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

impl std::fmt::Display for BackupRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One command issued during an attempt and what it returned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub command: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub cancelled: bool,
    pub timed_out: bool,
}

impl TranscriptEntry {
    pub fn from_result(command: impl Into<String>, result: &CommandResult) -> Self {
        Self {
            command: command.into(),
            exit_code: result.exit_code,
            stdout: result.stdout.clone(),
            stderr: result.stderr.clone(),
            cancelled: result.cancelled,
            timed_out: result.timed_out,
        }
    }

    /// Entry for a command that never started.
    pub fn spawn_failure(command: impl Into<String>, error: &dyn std::fmt::Display) -> Self {
        Self {
            command: command.into(),
            exit_code: -1,
            stdout: String::new(),
            stderr: error.to_string(),
            cancelled: false,
            timed_out: false,
        }
    }
}

/// One safe-rebase attempt, threaded through the engine and returned with
/// its terminal phase populated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebaseAttempt {
    pub id: Uuid,
    pub target_branch: String,
    pub remote: String,
    backup_ref: Option<BackupRef>,
    /// Fetched remote position the rebase ran against.
    pub remote_ref: Option<String>,
    pub phase: Phase,
    /// Unmerged paths; only populated once `ConflictDetected` is entered.
    pub conflict_paths: Vec<String>,
    /// Set on every non-success terminal phase.
    pub diagnostic: Option<String>,
    pub failures: Vec<FailureKind>,
    /// Manual remediation steps, never executed automatically.
    pub recovery_commands: Vec<String>,
    pub transcript: Vec<TranscriptEntry>,
    pub transitions: Vec<Phase>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RebaseAttempt {
    pub fn new(target: &IntegrationTarget) -> Self {
        Self {
            id: Uuid::new_v4(),
            target_branch: target.branch.clone(),
            remote: target.remote.clone(),
            backup_ref: None,
            remote_ref: None,
            phase: Phase::Init,
            conflict_paths: Vec::new(),
            diagnostic: None,
            failures: Vec::new(),
            recovery_commands: Vec::new(),
            transcript: Vec::new(),
            transitions: vec![Phase::Init],
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn target(&self) -> IntegrationTarget {
        IntegrationTarget::new(&self.remote, &self.target_branch)
    }

    pub fn backup_ref(&self) -> Option<&BackupRef> {
        self.backup_ref.as_ref()
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.phase.outcome()
    }

    pub fn is_success(&self) -> bool {
        self.phase == Phase::Success
    }

    pub fn duration_ms(&self) -> u64 {
        let end = self.finished_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_milliseconds().max(0) as u64
    }

    /// Record the backup. A second capture is ignored.
    pub(crate) fn set_backup(&mut self, backup: BackupRef) {
        if self.backup_ref.is_none() {
            self.backup_ref = Some(backup);
        } else {
            tracing::warn!(attempt_id = %self.id, "backup already captured; keeping the first");
        }
    }

    pub(crate) fn transition(&mut self, next: Phase) {
        if self.phase.is_terminal() {
            tracing::warn!(attempt_id = %self.id, from = %self.phase, to = %next, "transition after terminal phase ignored");
            return;
        }
        obs::emit_transition(&self.id.to_string(), &self.phase, &next);
        self.phase = next;
        self.transitions.push(next);
    }

    pub(crate) fn fail(&mut self, kind: FailureKind) {
        self.failures.push(kind);
    }

    pub(crate) fn record(&mut self, command: &str, result: &CommandResult) {
        self.transcript
            .push(TranscriptEntry::from_result(command, result));
    }

    pub(crate) fn record_spawn_failure(&mut self, command: &str, error: &dyn std::fmt::Display) {
        self.transcript
            .push(TranscriptEntry::spawn_failure(command, error));
    }

    /// Enter a terminal phase with its diagnostic and remediation list.
    pub(crate) fn conclude(
        &mut self,
        outcome: Outcome,
        diagnostic: Option<String>,
        recovery_commands: Vec<String>,
    ) {
        self.transition(outcome.phase());
        self.diagnostic = diagnostic;
        self.recovery_commands = recovery_commands;
        self.finished_at = Some(Utc::now());
    }
}

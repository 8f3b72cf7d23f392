//! safesync-core - safe rebase recovery engine and sync workflow
//!
//! This crate provides:
//! - `SafeRebase`: backup, verify clean, fetch, rebase, and verified rollback
//! - Conflict classification and recovery command generation
//! - Lint/test checks, commit message generation, and the end-to-end sync
//! - Structured observability via `tracing`

pub mod checks;
pub mod config;
pub mod conflict;
pub mod error;
pub mod fakes;
pub mod git;
pub mod message;
pub mod obs;
pub mod rebase;
pub mod recovery;
pub mod sync;
pub mod telemetry;

// Re-export key types
pub use checks::{lint_test, CheckKind, CheckOptions, CheckReport, LintTestReport};
pub use config::SyncConfig;
pub use conflict::{detect_conflict, CONFLICT_SIGNATURES};
pub use error::{MessageError, Result, SyncError};
pub use git::Git;
pub use message::{CommandMessageGenerator, FixedMessage, MessageGenerator};
pub use rebase::{
    BackupRef, FailureKind, IntegrationTarget, Outcome, Phase, RebaseAttempt, SafeRebase,
    TranscriptEntry,
};
pub use recovery::{
    dirty_tree_commands, emergency_recovery_commands, recovery_commands, RollbackReport,
};
pub use sync::{
    AssumeDefaults, ChangeSet, Prompter, PushStatus, SyncOptions, SyncReport, SyncWorkflow,
};
pub use telemetry::init_tracing;

pub use safesync_exec::{CancellationToken, CommandResult, CommandRunner, ProcessRunner};

//! Safe rebase state machine.
//!
//! Every mutating step is preceded by a validated backup. Every failure path
//! either restores the pre-attempt state and verifies it, or stops with the
//! exact manual commands needed.

pub mod attempt;
pub mod engine;
pub mod target;

pub use attempt::{BackupRef, FailureKind, Outcome, Phase, RebaseAttempt, TranscriptEntry};
pub use engine::SafeRebase;
pub use target::IntegrationTarget;

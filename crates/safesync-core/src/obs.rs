//! Structured observability hooks for integration attempts.
//!
//! This module provides:
//! - Attempt-scoped tracing spans via [`attempt_span`]
//! - Emission functions for lifecycle events: start, phase transition, finish, rollback
//!
//! Events are emitted at `info!` level (filter with `RUST_LOG`), rollback
//! failures at `error!`.

use tracing::{error, info, warn};

/// Span carrying the attempt id and target.
///
/// Attach with `tracing::Instrument` so every event inside the attempt,
/// across awaits, is tagged.
///
/// # Example
///
/// ```ignore
/// drive(&mut attempt).instrument(attempt_span("6f1c...", "origin/main")).await;
/// ```
pub fn attempt_span(attempt_id: &str, target: &str) -> tracing::Span {
    tracing::info_span!("safesync.integration", attempt_id = %attempt_id, target = %target)
}

/// Emit event: integration attempt started.
pub fn emit_integration_started(attempt_id: &str, target: &str) {
    info!(event = "integration.started", attempt_id = %attempt_id, target = %target);
}

/// Emit event: the attempt moved between phases.
pub fn emit_transition(attempt_id: &str, from: &dyn std::fmt::Display, to: &dyn std::fmt::Display) {
    info!(
        event = "integration.transition",
        attempt_id = %attempt_id,
        from = %from,
        to = %to,
    );
}

/// Emit event: attempt reached a terminal phase.
pub fn emit_integration_finished(attempt_id: &str, outcome: &dyn std::fmt::Display, duration_ms: u64) {
    info!(
        event = "integration.finished",
        attempt_id = %attempt_id,
        outcome = %outcome,
        duration_ms = duration_ms,
    );
}

/// Emit event: emergency rollback started.
pub fn emit_emergency_rollback(backup: &str) {
    warn!(event = "rollback.emergency", backup = %backup);
}

/// Emit event: emergency rollback finished.
pub fn emit_rollback_finished(backup: &str, restored: bool) {
    if restored {
        info!(event = "rollback.finished", backup = %backup, restored = true);
    } else {
        error!(event = "rollback.finished", backup = %backup, restored = false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attempt_span_create() {
        let _span = attempt_span("attempt-1", "origin/main").entered();
        emit_transition("attempt-1", &"Init", &"BackupCaptured");
        emit_rollback_finished("abc123", false);
    }
}

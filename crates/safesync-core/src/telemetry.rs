//! Log setup for the `safesync` binary.
//!
//! All log lines go to stderr; stdout carries mirrored command output and
//! the final report.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Filter override read before `RUST_LOG`.
pub const LOG_ENV: &str = "SAFESYNC_LOG";

/// Our crates at `level`, everything else at `warn`.
fn default_directives(level: Level) -> String {
    let level = level.as_str().to_lowercase();
    format!("warn,safesync={level},safesync_core={level},safesync_exec={level}")
}

fn filter(level: Level) -> EnvFilter {
    std::env::var(LOG_ENV)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .and_then(|v| EnvFilter::try_new(v).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(default_directives(level)))
}

/// Install the global subscriber, plain text or newline-delimited JSON.
///
/// A subscriber already installed (a second call, a test harness) is kept.
pub fn init_tracing(json: bool, level: Level) {
    let layer = fmt::layer().with_target(false).with_writer(std::io::stderr);
    let registry = tracing_subscriber::registry().with(filter(level));
    let installed = if json {
        registry.with(layer.json()).try_init()
    } else {
        registry.with(layer).try_init()
    };
    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_directives_scope_verbosity_to_our_crates() {
        assert_eq!(
            default_directives(Level::DEBUG),
            "warn,safesync=debug,safesync_core=debug,safesync_exec=debug"
        );
        assert!(EnvFilter::try_new(default_directives(Level::INFO)).is_ok());
    }

    #[test]
    fn init_twice_does_not_panic() {
        init_tracing(false, Level::WARN);
        init_tracing(true, Level::DEBUG);
    }
}

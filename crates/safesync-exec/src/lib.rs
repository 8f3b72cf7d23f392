//! safesync-exec - external command execution
//!
//! Runs one external command to completion or interruption and always
//! hands back a [`CommandResult`]:
//! - argv-only invocation (never a shell-interpreted string)
//! - stdout/stderr drained concurrently, captured in arrival order per stream
//! - optional live mirroring to the parent's stdout/stderr
//! - cancellation and timeout with graceful terminate, bounded grace, force kill

pub mod error;
pub mod result;
pub mod runner;
pub mod spec;

// Re-export key types
pub use error::{ExecError, Result};
pub use result::{CommandResult, OutputStream};
pub use runner::{run_command, CommandRunner, LineControl, ProcessRunner};
pub use spec::CommandSpec;

pub use tokio_util::sync::CancellationToken;

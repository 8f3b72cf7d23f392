//! Command execution: spawn, drain, mirror, interrupt.

use crate::error::{ExecError, Result};
use crate::result::{CommandResult, OutputStream};
use crate::spec::CommandSpec;
use async_trait::async_trait;
use std::io::Write;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How long to keep reading pipes after the child is gone. A grandchild
/// that inherited the pipes can hold them open indefinitely.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Returned by a line callback to keep going or stop the command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineControl {
    Continue,
    Stop,
}

/// Runs external commands.
///
/// Implementations must never turn a nonzero exit into an error, and must
/// report interruption through [`CommandResult::cancelled`] /
/// [`CommandResult::timed_out`] rather than through `Err`.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `spec` to completion, timeout, or cancellation of `cancel`.
    async fn run(&self, spec: &CommandSpec, cancel: &CancellationToken) -> Result<CommandResult>;
}

/// Runner backed by real child processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }

    /// Like [`CommandRunner::run`], calling `on_line` for every output line
    /// (trailing newline stripped). Returning [`LineControl::Stop`] terminates
    /// the child and marks the result `stopped_early`.
    pub async fn run_with_lines<F>(
        &self,
        spec: &CommandSpec,
        cancel: &CancellationToken,
        mut on_line: F,
    ) -> Result<CommandResult>
    where
        F: FnMut(OutputStream, &str) -> LineControl + Send,
    {
        execute(spec, cancel, &mut on_line).await
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, spec: &CommandSpec, cancel: &CancellationToken) -> Result<CommandResult> {
        execute(spec, cancel, &mut keep_going).await
    }
}

/// Run one command with a fresh, never-cancelled token.
pub async fn run_command(
    program: &str,
    args: &[&str],
    cwd: Option<&Path>,
    quiet: bool,
) -> Result<CommandResult> {
    let mut spec = CommandSpec::new(program)
        .args(args.iter().copied())
        .quiet(quiet);
    if let Some(dir) = cwd {
        spec = spec.cwd(dir);
    }
    ProcessRunner::new()
        .run(&spec, &CancellationToken::new())
        .await
}

fn keep_going(_: OutputStream, _: &str) -> LineControl {
    LineControl::Continue
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interruption {
    Cancelled,
    TimedOut,
    Stopped,
}

type Line = (OutputStream, Vec<u8>);

async fn execute(
    spec: &CommandSpec,
    cancel: &CancellationToken,
    on_line: &mut (dyn FnMut(OutputStream, &str) -> LineControl + Send),
) -> Result<CommandResult> {
    if spec.program.is_empty() {
        return Err(ExecError::EmptyCommand);
    }

    let start = Instant::now();
    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &spec.cwd {
        command.current_dir(dir);
    }
    for (key, value) in &spec.env {
        command.env(key, value);
    }

    debug!(command = %spec.display(), quiet = spec.quiet, "spawning command");
    let mut child = command.spawn().map_err(|source| ExecError::Spawn {
        program: spec.program.clone(),
        source,
    })?;

    let (tx, mut rx) = mpsc::unbounded_channel::<Line>();
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(pump(stdout, OutputStream::Stdout, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(pump(stderr, OutputStream::Stderr, tx.clone()));
    }
    drop(tx);

    let mut capture = Capture::new(spec.quiet);
    let deadline = spec.timeout.map(|t| tokio::time::Instant::now() + t);
    let mut interruption = None;
    let mut status = None;
    let mut streams_closed = false;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                interruption = Some(Interruption::Cancelled);
                break;
            }
            _ = sleep_until(deadline) => {
                interruption = Some(Interruption::TimedOut);
                break;
            }
            line = rx.recv(), if !streams_closed => match line {
                Some((stream, bytes)) => {
                    capture.record(stream, &bytes);
                    if on_line(stream, &line_text(&bytes)) == LineControl::Stop {
                        interruption = Some(Interruption::Stopped);
                        break;
                    }
                }
                None => streams_closed = true,
            },
            waited = child.wait() => {
                status = Some(waited.map_err(|source| ExecError::Io {
                    program: spec.program.clone(),
                    source,
                })?);
                break;
            }
        }
    }

    if let Some(reason) = interruption {
        warn!(command = %spec.display(), reason = ?reason, "terminating command");
        status = terminate(&mut child, spec.grace).await;
    }

    // Collect whatever is still buffered in the pipes.
    let drain_deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
    while !streams_closed {
        match tokio::time::timeout_at(drain_deadline, rx.recv()).await {
            Ok(Some((stream, bytes))) => {
                capture.record(stream, &bytes);
                if interruption.is_none()
                    && on_line(stream, &line_text(&bytes)) == LineControl::Stop
                {
                    interruption = Some(Interruption::Stopped);
                }
            }
            Ok(None) => streams_closed = true,
            Err(_) => {
                warn!(command = %spec.display(), "output pipes still open after exit; dropping remainder");
                break;
            }
        }
    }

    let (stdout, stderr) = capture.finish();
    let mut result = match interruption {
        Some(Interruption::Cancelled) => CommandResult::cancelled(stdout, stderr),
        Some(Interruption::TimedOut) => CommandResult::timed_out(stdout, stderr),
        Some(Interruption::Stopped) => CommandResult {
            stopped_early: true,
            ..CommandResult::completed(exit_code(status), stdout, stderr)
        },
        None => CommandResult::completed(exit_code(status), stdout, stderr),
    };
    result.duration_ms = start.elapsed().as_millis() as u64;

    debug!(
        command = %spec.display(),
        exit_code = result.exit_code,
        cancelled = result.cancelled,
        timed_out = result.timed_out,
        duration_ms = result.duration_ms,
        "command finished"
    );
    Ok(result)
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Graceful stop, bounded wait, then force kill. Reaps the child.
async fn terminate(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    request_graceful_stop(child);
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => return Some(status),
        Ok(Err(e)) => warn!(error = %e, "wait after terminate request failed"),
        Err(_) => debug!(grace_ms = grace.as_millis() as u64, "grace period elapsed; killing"),
    }
    if let Err(e) = child.kill().await {
        warn!(error = %e, "force kill failed");
    }
    child.wait().await.ok()
}

#[cfg(unix)]
fn request_graceful_stop(child: &mut Child) {
    if let Some(pid) = child.id() {
        // SAFETY: `pid` is our own child and has not been reaped yet.
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if rc != 0 {
            debug!(pid, "SIGTERM delivery failed");
        }
    }
}

#[cfg(not(unix))]
fn request_graceful_stop(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "terminate request failed");
    }
}

fn exit_code(status: Option<ExitStatus>) -> i32 {
    status.and_then(|s| s.code()).unwrap_or(-1)
}

fn line_text(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    text.trim_end_matches(['\n', '\r']).to_string()
}

async fn pump<R>(reader: R, stream: OutputStream, tx: mpsc::UnboundedSender<Line>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    loop {
        let mut buf = Vec::new();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if tx.send((stream, buf)).is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(stream = ?stream, error = %e, "pipe read failed");
                break;
            }
        }
    }
}

/// Per-stream capture buffers with optional live mirroring.
struct Capture {
    quiet: bool,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl Capture {
    fn new(quiet: bool) -> Self {
        Self {
            quiet,
            stdout: Vec::new(),
            stderr: Vec::new(),
        }
    }

    fn record(&mut self, stream: OutputStream, bytes: &[u8]) {
        if !self.quiet {
            mirror(stream, bytes);
        }
        match stream {
            OutputStream::Stdout => self.stdout.extend_from_slice(bytes),
            OutputStream::Stderr => self.stderr.extend_from_slice(bytes),
        }
    }

    fn finish(self) -> (String, String) {
        (
            String::from_utf8_lossy(&self.stdout).into_owned(),
            String::from_utf8_lossy(&self.stderr).into_owned(),
        )
    }
}

fn mirror(stream: OutputStream, bytes: &[u8]) {
    let written = match stream {
        OutputStream::Stdout => {
            let mut out = std::io::stdout().lock();
            out.write_all(bytes).and_then(|_| out.flush())
        }
        OutputStream::Stderr => {
            let mut err = std::io::stderr().lock();
            err.write_all(bytes).and_then(|_| err.flush())
        }
    };
    if let Err(e) = written {
        debug!(error = %e, "mirroring output failed");
    }
}

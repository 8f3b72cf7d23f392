//! Integration tests for the process runner: streams, interruption, decoding.

use safesync_exec::{
    CancellationToken, CommandRunner, CommandSpec, LineControl, OutputStream, ProcessRunner,
};
use std::time::{Duration, Instant};

fn sh(script: &str) -> CommandSpec {
    CommandSpec::new("sh").args(["-c", script]).quiet(true)
}

/// Test: stdout and stderr are captured independently, each in order
#[tokio::test]
async fn test_streams_captured_in_order_per_stream() {
    let spec = sh("for i in 1 2 3; do echo out$i; echo err$i >&2; done");
    let result = ProcessRunner::new()
        .run(&spec, &CancellationToken::new())
        .await
        .expect("run failed");

    assert!(result.success());
    assert_eq!(result.stdout, "out1\nout2\nout3\n");
    assert_eq!(result.stderr, "err1\nerr2\nerr3\n");
}

/// Test: heavy output on both pipes does not deadlock
#[tokio::test]
async fn test_large_output_on_both_streams() {
    let spec = sh(
        "i=0; while [ $i -lt 20000 ]; do echo line$i; echo errline$i >&2; i=$((i+1)); done",
    );
    let result = ProcessRunner::new()
        .run(&spec, &CancellationToken::new())
        .await
        .expect("run failed");

    assert!(result.success());
    assert_eq!(result.stdout.lines().count(), 20000);
    assert_eq!(result.stderr.lines().count(), 20000);
    assert_eq!(result.stdout.lines().last(), Some("line19999"));
}

/// Test: invalid UTF-8 is replaced rather than failing
#[tokio::test]
async fn test_invalid_utf8_is_replaced() {
    let spec = sh("printf '\\377abc\\n'");
    let result = ProcessRunner::new()
        .run(&spec, &CancellationToken::new())
        .await
        .expect("run failed");

    assert!(result.success());
    assert!(result.stdout.contains('\u{fffd}'));
    assert!(result.stdout.contains("abc"));
}

/// Test: cancellation terminates the child, keeps partial output, and
/// leaves the token cancelled for the caller
#[tokio::test]
async fn test_cancellation_returns_partial_output() {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(400)).await;
        trigger.cancel();
    });

    let start = Instant::now();
    let spec = sh("echo started; exec sleep 30");
    let result = ProcessRunner::new()
        .run(&spec, &cancel)
        .await
        .expect("run failed");

    assert!(result.cancelled);
    assert!(!result.timed_out);
    assert!(!result.success());
    assert_eq!(result.exit_code, 130);
    assert!(result.stdout.contains("started"));
    assert!(cancel.is_cancelled(), "interrupt must stay visible to the caller");
    assert!(start.elapsed() < Duration::from_secs(15));
}

/// Test: an already-cancelled token interrupts immediately
#[tokio::test]
async fn test_pre_cancelled_token() {
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = ProcessRunner::new()
        .run(&sh("exec sleep 30"), &cancel)
        .await
        .expect("run failed");
    assert!(result.cancelled);
}

/// Test: timeout is reported separately from cancellation
#[tokio::test]
async fn test_timeout_is_distinct_from_cancel() {
    let spec = sh("exec sleep 30").timeout(Some(Duration::from_millis(300)));
    let result = ProcessRunner::new()
        .run(&spec, &CancellationToken::new())
        .await
        .expect("run failed");

    assert!(result.timed_out);
    assert!(!result.cancelled);
    assert!(result.interrupted());
    assert_eq!(result.exit_code, 124);
}

/// Test: a child ignoring SIGTERM is force-killed after the grace period
#[cfg(unix)]
#[tokio::test]
async fn test_force_kill_after_grace() {
    let spec = sh("trap '' TERM; echo ready; exec sleep 30")
        .timeout(Some(Duration::from_millis(300)))
        .grace(Duration::from_millis(200));

    let start = Instant::now();
    let result = ProcessRunner::new()
        .run(&spec, &CancellationToken::new())
        .await
        .expect("run failed");

    assert!(result.timed_out);
    assert!(result.stdout.contains("ready"));
    assert!(start.elapsed() < Duration::from_secs(15));
}

/// Test: a line callback can stop the command early
#[tokio::test]
async fn test_line_callback_stops_early() {
    let mut seen = Vec::new();
    let spec = sh("echo first; echo stop-here; exec sleep 30");
    let result = ProcessRunner::new()
        .run_with_lines(&spec, &CancellationToken::new(), |stream, line| {
            if stream == OutputStream::Stdout {
                seen.push(line.to_string());
            }
            if line == "stop-here" {
                LineControl::Stop
            } else {
                LineControl::Continue
            }
        })
        .await
        .expect("run failed");

    assert!(result.stopped_early);
    assert!(!result.cancelled);
    assert!(!result.success());
    assert_eq!(seen, vec!["first".to_string(), "stop-here".to_string()]);
}

/// Test: nonzero exit codes are surfaced verbatim
#[tokio::test]
async fn test_exit_code_passthrough() {
    let result = ProcessRunner::new()
        .run(&sh("echo boom >&2; exit 7"), &CancellationToken::new())
        .await
        .expect("run failed");
    assert_eq!(result.exit_code, 7);
    assert_eq!(result.stderr.trim(), "boom");
}

//! safesync - commit, integrate and push a git working copy without losing work
//!
//! ## Commands
//!
//! - (none): run lint/test, commit, integrate the remote if needed, push
//! - `integrate`: rebase onto a target with automatic rollback on failure
//! - `rollback`: force the working copy back to a backup commit

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use safesync_core::config::split_argv;
use safesync_core::{
    emergency_recovery_commands, CancellationToken, CommandMessageGenerator, CommandRunner, Git,
    Prompter, PushStatus, RebaseAttempt, SafeRebase, SyncConfig, SyncError, SyncOptions,
    SyncReport, SyncWorkflow,
};
use safesync_exec::ProcessRunner;
use tracing::{info, warn, Level};

const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser)]
#[command(name = "safesync")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Safely commit, integrate and push a git working copy", long_about = None)]
struct Cli {
    /// Enable verbose output (mirrors git and check output)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines and reports
    #[arg(long, global = true)]
    json: bool,

    /// Run as if started in this directory
    #[arg(short = 'C', long, global = true, default_value = ".")]
    dir: PathBuf,

    /// Remote to fetch from and push to (default: origin)
    #[arg(long, global = true)]
    remote: Option<String>,

    /// Timeout for each git command in seconds (0 disables)
    #[arg(long, global = true)]
    timeout_secs: Option<u64>,

    #[command(flatten)]
    sync: SyncArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args, Default)]
struct SyncArgs {
    /// Commit but do not push
    #[arg(long)]
    no_push: bool,

    /// Never rebase; a rejected push is an error
    #[arg(long)]
    no_rebase: bool,

    /// Skip ./lint
    #[arg(long)]
    no_lint: bool,

    /// Skip ./test
    #[arg(long)]
    no_test: bool,

    /// Run the checks only
    #[arg(long)]
    dry_run: bool,

    /// With --dry-run, run only ./lint
    #[arg(long, requires = "dry_run")]
    lint: bool,

    /// With --dry-run, run only ./test
    #[arg(long, requires = "dry_run")]
    test: bool,

    /// Commit message (skips message generation)
    #[arg(short, long)]
    message: Option<String>,

    /// Command that prints a commit message for the diff file appended to it
    #[arg(long)]
    message_cmd: Option<String>,

    /// Never prompt; take defaults and fail where input would be needed
    #[arg(long)]
    non_interactive: bool,

    /// Show a generated commit message and ask before using it
    #[arg(long)]
    no_autoaccept: bool,

    /// Fail on untracked files instead of asking about them
    #[arg(long)]
    pre_test: bool,

    /// Stage everything and commit; skip checks, integration and push
    #[arg(long, conflicts_with = "dry_run")]
    just_commit: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Rebase the current branch onto a target, rolling back on any failure
    Integrate {
        /// Branch or remote-tracking ref, e.g. `main` or `origin/feature`
        target: String,
    },

    /// Force the working copy back to a backup commit
    Rollback {
        /// Backup commit id reported by a previous attempt
        backup: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    safesync_core::init_tracing(cli.json, level);

    let cancel = CancellationToken::new();
    spawn_interrupt_handler(cancel.clone());

    match run(cli, &cancel).await {
        Ok(code) => code,
        Err(e) => {
            let code = error_exit_code(&e, &cancel);
            if code == EXIT_INTERRUPTED {
                eprintln!("Interrupted");
            } else {
                eprintln!("Error: {e:#}");
            }
            ExitCode::from(code)
        }
    }
}

/// Cancel `cancel` on the first Ctrl-C; running git commands are stopped and
/// any rebase in flight is rolled back.
fn spawn_interrupt_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping");
            cancel.cancel();
        }
    });
}

async fn run(cli: Cli, cancel: &CancellationToken) -> Result<ExitCode> {
    let config = build_config(&cli)?;
    let runner: Arc<dyn CommandRunner> = Arc::new(ProcessRunner::new());

    let root = Git::find_repo_root(runner.clone(), &cli.dir, cancel)
        .await
        .context("Not inside a git working copy")?;
    info!(root = %root.display(), "repository found");

    let git = Git::new(runner.clone(), root)
        .with_timeout(config.command_timeout())
        .with_grace(config.grace())
        .with_verbose(cli.verbose);

    match cli.command {
        Some(Commands::Integrate { target }) => {
            cmd_integrate(git, &config, &target, cancel, cli.json).await
        }
        Some(Commands::Rollback { backup }) => cmd_rollback(git, &backup, cli.json).await,
        None => cmd_sync(git, config, runner, &cli.sync, cli.verbose, cli.json, cancel).await,
    }
}

fn build_config(cli: &Cli) -> Result<SyncConfig> {
    let mut config = SyncConfig::from_env();
    if let Some(remote) = &cli.remote {
        config = config.with_remote(remote);
    }
    if let Some(secs) = cli.timeout_secs {
        config = config.with_command_timeout_secs(secs);
    }
    if let Some(raw) = &cli.sync.message_cmd {
        let argv = split_argv(raw).context("--message-cmd must name a command with balanced quotes")?;
        config = config.with_message_command(argv);
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn error_exit_code(error: &anyhow::Error, cancel: &CancellationToken) -> u8 {
    if cancel.is_cancelled() {
        return EXIT_INTERRUPTED;
    }
    match error.downcast_ref::<SyncError>() {
        Some(e) if e.exit_code() == i32::from(EXIT_INTERRUPTED) => EXIT_INTERRUPTED,
        _ => 1,
    }
}

fn attempt_exit_code(attempt: &RebaseAttempt, cancel: &CancellationToken) -> ExitCode {
    if attempt.is_success() {
        ExitCode::SUCCESS
    } else if cancel.is_cancelled() {
        ExitCode::from(EXIT_INTERRUPTED)
    } else {
        ExitCode::from(1)
    }
}

/// Rebase onto `target` and report the attempt
async fn cmd_integrate(
    git: Git,
    config: &SyncConfig,
    target: &str,
    cancel: &CancellationToken,
    json: bool,
) -> Result<ExitCode> {
    let engine = SafeRebase::new(git)
        .with_remote(&config.remote)
        .with_cancellation(cancel.clone());
    let attempt = engine.attempt_safe_integration(target).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&attempt)?);
    } else {
        print_attempt(&attempt);
    }
    Ok(attempt_exit_code(&attempt, cancel))
}

/// Restore the working copy to `backup`
async fn cmd_rollback(git: Git, backup: &str, json: bool) -> Result<ExitCode> {
    let engine = SafeRebase::new(git);
    let backup = engine
        .resolve_backup(backup)
        .await
        .context("Cannot roll back")?;
    let report = engine.emergency_rollback(&backup).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if report.restored {
        println!("Restored working copy to {}", backup.short());
    } else {
        println!(
            "Rollback failed: {}",
            report.failure.as_deref().unwrap_or("state not verified")
        );
        println!("\nRecover manually:");
        for command in emergency_recovery_commands(Some(&backup)) {
            println!("  {command}");
        }
    }

    Ok(if report.restored {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}

/// The full sync: checks, commit, integrate, push
async fn cmd_sync(
    git: Git,
    config: SyncConfig,
    runner: Arc<dyn CommandRunner>,
    args: &SyncArgs,
    verbose: bool,
    json: bool,
    cancel: &CancellationToken,
) -> Result<ExitCode> {
    let mut workflow = SyncWorkflow::new(git, config.clone()).with_cancellation(cancel.clone());
    if let Some(argv) = config.message_command.clone() {
        workflow = workflow.with_generator(Arc::new(CommandMessageGenerator::new(argv, runner)));
    }
    if !args.non_interactive {
        workflow = workflow.with_prompter(Arc::new(StdinPrompter));
    }

    let options = SyncOptions {
        no_push: args.no_push,
        no_rebase: args.no_rebase,
        no_lint: args.no_lint,
        no_test: args.no_test,
        dry_run: args.dry_run,
        lint_only: args.lint,
        test_only: args.test,
        non_interactive: args.non_interactive,
        verbose,
        message: args.message.clone(),
        no_autoaccept: args.no_autoaccept,
        pre_test: args.pre_test,
        just_commit: args.just_commit,
    };

    match workflow.run(&options).await {
        Ok(report) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_sync(&report, &options);
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(SyncError::Integration(attempt)) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&attempt)?);
            } else {
                print_attempt(&attempt);
            }
            Ok(attempt_exit_code(&attempt, cancel))
        }
        Err(e) => Err(e).context("Sync failed"),
    }
}

fn print_attempt(attempt: &RebaseAttempt) {
    println!("Integration onto {}: {}", attempt.target(), attempt.phase);
    if let Some(backup) = attempt.backup_ref() {
        println!("Backup:  {backup}");
    }
    if !attempt.conflict_paths.is_empty() {
        println!("\nConflicting paths:");
        for path in &attempt.conflict_paths {
            println!("  - {path}");
        }
    }
    if let Some(diagnostic) = &attempt.diagnostic {
        println!("\n{diagnostic}");
    }
    if !attempt.recovery_commands.is_empty() {
        println!("\nRecovery commands:");
        for command in &attempt.recovery_commands {
            println!("  {command}");
        }
    }
}

fn print_sync(report: &SyncReport, options: &SyncOptions) {
    if let Some(checks) = &report.checks {
        for check in checks.lint.iter().chain(checks.test.iter()) {
            println!("{}: passed", check.name);
        }
    }
    if options.dry_run {
        println!("Dry run complete; nothing committed");
        return;
    }
    if let Some(message) = &report.committed {
        println!("Committed: {message}");
    } else if report.changes.is_empty() {
        println!("Nothing to commit, working tree clean");
    }
    for attempt in &report.integrations {
        println!("Integrated onto {}: {}", attempt.target(), attempt.phase);
    }
    match report.push {
        PushStatus::Pushed => println!("Pushed"),
        PushStatus::PushedAfterIntegration => {
            println!("Pushed after integrating remote changes")
        }
        PushStatus::Skipped => {}
    }
}

/// Questions on stdout, answers from stdin. EOF takes the default.
struct StdinPrompter;

impl Prompter for StdinPrompter {
    fn confirm(&self, question: &str, default: bool) -> bool {
        let hint = if default { "[Y/n]" } else { "[y/N]" };
        match read_answer(&format!("{question} {hint} ")) {
            Some(answer) if !answer.is_empty() => parse_yes(&answer),
            _ => default,
        }
    }

    fn ask(&self, question: &str) -> Option<String> {
        read_answer(question).filter(|answer| !answer.is_empty())
    }
}

fn read_answer(prompt: &str) -> Option<String> {
    let mut stdout = io::stdout();
    write!(stdout, "{prompt}").ok()?;
    stdout.flush().ok()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line).ok()?;
    Some(line.trim().to_string())
}

fn parse_yes(answer: &str) -> bool {
    matches!(answer.to_lowercase().as_str(), "y" | "yes")
}

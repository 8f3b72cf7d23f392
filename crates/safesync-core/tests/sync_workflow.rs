//! End-to-end sync against a bare remote: commit, push, rejection handling.

use std::path::{Path, PathBuf};
use std::process::Command as StdCommand;
use std::sync::{Arc, Mutex};

use safesync_core::{
    CommandMessageGenerator, FixedMessage, Git, Outcome, ProcessRunner, Prompter, PushStatus,
    SyncConfig, SyncError, SyncOptions, SyncWorkflow,
};
use tempfile::TempDir;

fn run_git(dir: &Path, args: &[&str]) -> String {
    let output = StdCommand::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

fn configure(dir: &Path) {
    run_git(dir, &["config", "user.name", "test-user"]);
    run_git(dir, &["config", "user.email", "test@example.com"]);
    run_git(dir, &["config", "commit.gpgsign", "false"]);
}

struct Fixture {
    _root: TempDir,
    remote: PathBuf,
    work: PathBuf,
    other: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let remote = root.path().join("remote.git");
        let seed = root.path().join("seed");
        std::fs::create_dir_all(&remote).unwrap();
        std::fs::create_dir_all(&seed).unwrap();

        run_git(&remote, &["init", "--bare"]);
        run_git(&remote, &["symbolic-ref", "HEAD", "refs/heads/main"]);
        run_git(&seed, &["init"]);
        run_git(&seed, &["symbolic-ref", "HEAD", "refs/heads/main"]);
        configure(&seed);
        std::fs::write(seed.join("file.txt"), "line one\nline two\n").unwrap();
        run_git(&seed, &["add", "file.txt"]);
        run_git(&seed, &["commit", "-m", "initial"]);
        run_git(&seed, &["remote", "add", "origin", remote.to_str().unwrap()]);
        run_git(&seed, &["push", "origin", "main"]);

        let work = root.path().join("work");
        let other = root.path().join("other");
        for clone in [&work, &other] {
            run_git(
                root.path(),
                &["clone", remote.to_str().unwrap(), clone.to_str().unwrap()],
            );
            configure(clone);
        }
        Self {
            _root: root,
            remote,
            work,
            other,
        }
    }

    fn write(&self, file: &str, contents: &str) {
        std::fs::write(self.work.join(file), contents).unwrap();
    }

    fn publish(&self, file: &str, contents: &str, message: &str) {
        std::fs::write(self.other.join(file), contents).unwrap();
        run_git(&self.other, &["add", file]);
        run_git(&self.other, &["commit", "-m", message]);
        run_git(&self.other, &["push", "origin", "main"]);
    }

    fn head(&self) -> String {
        run_git(&self.work, &["rev-parse", "HEAD"])
    }

    fn remote_main(&self) -> String {
        run_git(&self.remote, &["rev-parse", "refs/heads/main"])
    }

    fn workflow(&self) -> SyncWorkflow {
        let git = Git::new(Arc::new(ProcessRunner::new()), &self.work);
        SyncWorkflow::new(git, SyncConfig::default().with_remote("origin"))
    }
}

/// Fixed answers; remembers every question asked.
struct ScriptedPrompter {
    confirm: bool,
    answer: Option<String>,
    questions: Mutex<Vec<String>>,
}

impl ScriptedPrompter {
    fn new(confirm: bool, answer: Option<&str>) -> Arc<Self> {
        Arc::new(Self {
            confirm,
            answer: answer.map(str::to_string),
            questions: Mutex::new(Vec::new()),
        })
    }

    fn questions(&self) -> Vec<String> {
        self.questions.lock().unwrap().clone()
    }
}

impl Prompter for ScriptedPrompter {
    fn confirm(&self, question: &str, _default: bool) -> bool {
        self.questions.lock().unwrap().push(question.to_string());
        self.confirm
    }

    fn ask(&self, question: &str) -> Option<String> {
        self.questions.lock().unwrap().push(question.to_string());
        self.answer.clone()
    }
}

fn subject(dir: &Path) -> String {
    run_git(dir, &["log", "-1", "--format=%s"])
}

fn options(message: &str) -> SyncOptions {
    SyncOptions {
        non_interactive: true,
        message: Some(message.to_string()),
        ..SyncOptions::default()
    }
}

/// Test: tracked and untracked changes are committed and pushed
#[tokio::test]
async fn test_sync_commits_and_pushes() {
    let fx = Fixture::new();
    fx.write("file.txt", "line one\nline two\nline three\n");
    fx.write("notes.md", "# notes\n");

    let report = fx.workflow().run(&options("docs: add notes")).await.unwrap();

    assert_eq!(report.changes.unstaged, vec!["file.txt"]);
    assert_eq!(report.changes.untracked, vec!["notes.md"]);
    assert_eq!(report.committed.as_deref(), Some("docs: add notes"));
    assert_eq!(report.push, PushStatus::Pushed);
    assert!(report.integrations.is_empty());
    assert_eq!(fx.remote_main(), fx.head());
    assert_eq!(
        run_git(&fx.work, &["log", "-1", "--format=%s"]),
        "docs: add notes"
    );
    assert!(run_git(&fx.work, &["status", "--porcelain"]).is_empty());
}

/// Test: a clean, pushed clone has nothing to do
#[tokio::test]
async fn test_sync_with_nothing_to_do() {
    let fx = Fixture::new();
    let before = fx.head();

    let report = fx.workflow().run(&options("unused")).await.unwrap();

    assert!(report.changes.is_empty());
    assert!(report.committed.is_none());
    assert_eq!(report.push, PushStatus::Skipped);
    assert_eq!(fx.head(), before);
}

/// Test: commits made outside the tool are still pushed
#[tokio::test]
async fn test_sync_pushes_unpushed_commits() {
    let fx = Fixture::new();
    fx.write("file.txt", "edited by hand\n");
    run_git(&fx.work, &["commit", "-am", "manual commit"]);

    let workflow = fx.workflow();
    assert!(workflow.has_unpushed_commits().await.unwrap());
    let report = workflow.run(&options("unused")).await.unwrap();

    assert!(report.committed.is_none());
    assert_eq!(report.push, PushStatus::Pushed);
    assert_eq!(fx.remote_main(), fx.head());
}

/// Test: a rejected push integrates the remote once and retries
#[tokio::test]
async fn test_rejected_push_integrates_and_retries() {
    let fx = Fixture::new();
    fx.publish("other.txt", "theirs\n", "remote change");
    fx.write("local.txt", "mine\n");

    let report = fx.workflow().run(&options("feat: local change")).await.unwrap();

    assert_eq!(report.push, PushStatus::PushedAfterIntegration);
    assert_eq!(report.integrations.len(), 1);
    assert_eq!(report.integrations[0].outcome(), Some(Outcome::Success));
    assert_eq!(fx.remote_main(), fx.head());
    assert!(fx.work.join("other.txt").exists());
    assert!(fx.work.join("local.txt").exists());
}

/// Test: a rejected push that conflicts reports the recovered attempt
#[tokio::test]
async fn test_rejected_push_with_conflict_is_reported() {
    let fx = Fixture::new();
    fx.publish("file.txt", "theirs\nline two\n", "remote edit");
    fx.write("file.txt", "ours\nline two\n");
    let remote_before = fx.remote_main();

    let err = fx
        .workflow()
        .run(&options("fix: local edit"))
        .await
        .unwrap_err();

    let SyncError::Integration(attempt) = err else {
        panic!("expected integration failure, got {err}");
    };
    assert_eq!(attempt.outcome(), Some(Outcome::ConflictRecovered));
    assert_eq!(attempt.conflict_paths, vec!["file.txt"]);
    assert_eq!(fx.head(), attempt.backup_ref().unwrap().as_str());
    assert_eq!(fx.remote_main(), remote_before);
    assert_eq!(
        std::fs::read_to_string(fx.work.join("file.txt")).unwrap(),
        "ours\nline two\n"
    );
}

/// Test: with rebasing disabled a rejected push is an error
#[tokio::test]
async fn test_rejected_push_without_rebase_fails() {
    let fx = Fixture::new();
    fx.publish("other.txt", "theirs\n", "remote change");
    fx.write("local.txt", "mine\n");

    let opts = SyncOptions {
        no_rebase: true,
        ..options("feat: local change")
    };
    let err = fx.workflow().run(&opts).await.unwrap_err();

    assert!(matches!(err, SyncError::PushFailed(_)), "{err}");
    assert_eq!(err.exit_code(), 1);
}

/// Test: dry run only runs the checks
#[tokio::test]
async fn test_dry_run_only_checks() {
    let fx = Fixture::new();
    fx.write("test", "#!/bin/bash\necho \"checked $*\"\n");
    fx.write("local.txt", "mine\n");
    let before = fx.head();

    let opts = SyncOptions {
        dry_run: true,
        verbose: true,
        ..options("unused")
    };
    let report = fx.workflow().run(&opts).await.unwrap();

    let checks = report.checks.unwrap();
    assert!(checks.lint.is_none());
    let test = checks.test.unwrap();
    assert!(test.passed);
    assert!(test.output.contains("checked --verbose"));
    assert!(report.committed.is_none());
    assert_eq!(report.push, PushStatus::Skipped);
    assert_eq!(fx.head(), before);
}

/// Test: a failing lint stops the sync before committing
#[tokio::test]
async fn test_failing_lint_blocks_commit() {
    let fx = Fixture::new();
    fx.write("lint", "#!/bin/bash\necho 'unused import' >&2\nexit 2\n");
    fx.write("file.txt", "changed\n");
    let before = fx.head();

    let err = fx.workflow().run(&options("wip")).await.unwrap_err();

    match err {
        SyncError::CheckFailed(message) => assert!(message.contains("exit code 2"), "{message}"),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(fx.head(), before);
    assert_eq!(fx.remote_main(), before);
}

/// Test: the message command's output becomes the commit subject
#[tokio::test]
async fn test_generated_commit_message() {
    let fx = Fixture::new();
    fx.write("file.txt", "line one\nline 2\n");

    let generator = CommandMessageGenerator::new(
        vec![
            "sh".to_string(),
            "-c".to_string(),
            "grep -q '^+line 2' \"$0\" && echo 'fix: number the second line'".to_string(),
        ],
        Arc::new(ProcessRunner::new()),
    );
    let workflow = fx.workflow().with_generator(Arc::new(generator));
    let opts = SyncOptions {
        non_interactive: true,
        no_push: true,
        ..SyncOptions::default()
    };
    let report = workflow.run(&opts).await.unwrap();

    assert_eq!(report.committed.as_deref(), Some("fix: number the second line"));
    assert_eq!(report.push, PushStatus::Skipped);
    assert_ne!(fx.remote_main(), fx.head());
}

/// Test: without a message source a non-interactive sync refuses to commit
#[tokio::test]
async fn test_missing_message_is_an_error() {
    let fx = Fixture::new();
    fx.write("file.txt", "changed\n");
    let opts = SyncOptions {
        non_interactive: true,
        ..SyncOptions::default()
    };

    let err = fx.workflow().run(&opts).await.unwrap_err();

    assert!(matches!(err, SyncError::Message(_)), "{err}");
}

/// Test: side branches lagging the remote main are rebase candidates
#[tokio::test]
async fn test_rebase_target_for_side_branch() {
    let fx = Fixture::new();
    let workflow = fx.workflow();
    assert_eq!(workflow.rebase_target().await.unwrap(), None);

    run_git(&fx.work, &["checkout", "-b", "feature"]);
    assert_eq!(workflow.rebase_target().await.unwrap(), None);

    fx.publish("other.txt", "theirs\n", "remote change");
    run_git(&fx.work, &["fetch", "origin"]);
    assert_eq!(
        workflow.rebase_target().await.unwrap().as_deref(),
        Some("origin/main")
    );
}

/// Test: a generated message is shown and kept once confirmed
#[tokio::test]
async fn test_generated_message_confirmed_before_commit() {
    let fx = Fixture::new();
    fx.write("file.txt", "line one\nline 2\n");
    let prompter = ScriptedPrompter::new(true, None);
    let workflow = fx
        .workflow()
        .with_generator(Arc::new(FixedMessage::new("chore: generated")))
        .with_prompter(prompter.clone());
    let opts = SyncOptions {
        no_push: true,
        no_autoaccept: true,
        ..SyncOptions::default()
    };

    let report = workflow.run(&opts).await.unwrap();

    assert_eq!(report.committed.as_deref(), Some("chore: generated"));
    assert_eq!(subject(&fx.work), "chore: generated");
    assert!(prompter
        .questions()
        .iter()
        .any(|q| q.contains("chore: generated")));
}

/// Test: a rejected generated message is replaced by the typed one
#[tokio::test]
async fn test_rejected_generated_message_is_replaced() {
    let fx = Fixture::new();
    fx.write("file.txt", "line one\nline 2\n");
    let prompter = ScriptedPrompter::new(false, Some("docs: written by hand"));
    let workflow = fx
        .workflow()
        .with_generator(Arc::new(FixedMessage::new("chore: generated")))
        .with_prompter(prompter);
    let opts = SyncOptions {
        no_push: true,
        no_autoaccept: true,
        ..SyncOptions::default()
    };

    let report = workflow.run(&opts).await.unwrap();

    assert_eq!(report.committed.as_deref(), Some("docs: written by hand"));
    assert_eq!(subject(&fx.work), "docs: written by hand");
}

/// Test: rejecting the generated message without a replacement commits nothing
#[tokio::test]
async fn test_rejected_generated_message_without_replacement() {
    let fx = Fixture::new();
    fx.write("file.txt", "line one\nline 2\n");
    let before = fx.head();
    let workflow = fx
        .workflow()
        .with_generator(Arc::new(FixedMessage::new("chore: generated")))
        .with_prompter(ScriptedPrompter::new(false, None));
    let opts = SyncOptions {
        no_push: true,
        no_autoaccept: true,
        ..SyncOptions::default()
    };

    let err = workflow.run(&opts).await.unwrap_err();

    assert!(matches!(err, SyncError::Declined(_)), "{err}");
    assert_eq!(fx.head(), before);
}

/// Test: untracked files fail fast instead of prompting
#[tokio::test]
async fn test_untracked_files_fail_before_checks() {
    let fx = Fixture::new();
    fx.write("notes.md", "draft\n");
    let before = fx.head();
    let prompter = ScriptedPrompter::new(true, None);
    let workflow = fx.workflow().with_prompter(prompter.clone());
    let opts = SyncOptions {
        pre_test: true,
        ..options("wip")
    };

    let err = workflow.run(&opts).await.unwrap_err();

    match err {
        SyncError::UntrackedFiles(files) => assert_eq!(files, "notes.md"),
        other => panic!("unexpected error: {other}"),
    }
    assert!(prompter.questions().is_empty());
    assert_eq!(fx.head(), before);
    assert_eq!(
        run_git(&fx.work, &["status", "--porcelain"]),
        "?? notes.md"
    );
}

/// Test: commit-only mode stages everything and skips checks and push
#[tokio::test]
async fn test_just_commit_skips_checks_and_push() {
    let fx = Fixture::new();
    fx.write("lint", "#!/bin/bash\nexit 1\n");
    fx.write("file.txt", "line one\nline 2\n");
    let workflow = fx
        .workflow()
        .with_generator(Arc::new(FixedMessage::new("chore: snapshot")));
    let opts = SyncOptions {
        non_interactive: true,
        just_commit: true,
        ..SyncOptions::default()
    };

    let report = workflow.run(&opts).await.unwrap();

    assert_eq!(report.committed.as_deref(), Some("chore: snapshot"));
    assert!(report.checks.is_none());
    assert_eq!(report.push, PushStatus::Skipped);
    assert!(run_git(&fx.work, &["status", "--porcelain"]).is_empty());
    assert_ne!(fx.remote_main(), fx.head());
}

/// Test: a dry run restricted to lint leaves the test script alone
#[tokio::test]
async fn test_dry_run_lint_only() {
    let fx = Fixture::new();
    fx.write("lint", "#!/bin/bash\necho linted\n");
    fx.write("test", "#!/bin/bash\nexit 1\n");

    let opts = SyncOptions {
        dry_run: true,
        lint_only: true,
        ..options("unused")
    };
    let report = fx.workflow().run(&opts).await.unwrap();

    let checks = report.checks.unwrap();
    assert!(checks.lint.unwrap().passed);
    assert!(checks.test.is_none());
}

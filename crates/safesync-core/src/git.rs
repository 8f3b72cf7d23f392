//! Git invocations for the sync workflow.
//!
//! Every operation shells out to `git` through a [`CommandRunner`] and
//! returns the raw [`CommandResult`], so callers decide what a nonzero exit
//! means. Helpers that need a parsed value (branch names, file lists) return
//! [`SyncError::GitError`] on failure instead.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use safesync_exec::{CancellationToken, CommandResult, CommandRunner, CommandSpec};

use crate::error::{Result, SyncError};

/// Subcommands that can change refs, the index or the working tree.
pub const MUTATING_SUBCOMMANDS: &[&str] = &[
    "add",
    "am",
    "checkout",
    "cherry-pick",
    "clean",
    "commit",
    "merge",
    "pull",
    "push",
    "rebase",
    "reset",
    "restore",
    "revert",
    "stash",
    "switch",
];

/// Whether a git argv (without the leading `git`) can mutate the repository.
///
/// `fetch` only updates remote-tracking refs and is not counted.
pub fn is_mutating<S: AsRef<str>>(args: &[S]) -> bool {
    args.iter()
        .map(AsRef::as_ref)
        .find(|a| !a.starts_with('-'))
        .is_some_and(|sub| MUTATING_SUBCOMMANDS.contains(&sub))
}

/// Whether long-form `git status` output reports a rebase mid-flight.
pub fn rebase_in_progress(status_long: &str) -> bool {
    let lower = status_long.to_lowercase();
    lower.contains("rebase in progress") || lower.contains("you are currently rebasing")
}

/// `rev` peeled to a commit, e.g. `abc123^{commit}`.
pub fn commit_rev(rev: &str) -> String {
    format!("{rev}^{{commit}}")
}

/// Whether `git status --porcelain` output describes a clean tree.
pub fn is_clean(porcelain: &str) -> bool {
    porcelain.trim().is_empty()
}

fn lines(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// Handle on one working copy.
#[derive(Clone)]
pub struct Git {
    runner: Arc<dyn CommandRunner>,
    workdir: PathBuf,
    timeout: Option<Duration>,
    grace: Duration,
    verbose: bool,
}

impl std::fmt::Debug for Git {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Git")
            .field("workdir", &self.workdir)
            .field("timeout", &self.timeout)
            .field("grace", &self.grace)
            .field("verbose", &self.verbose)
            .finish()
    }
}

impl Git {
    pub fn new(runner: Arc<dyn CommandRunner>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            workdir: workdir.into(),
            timeout: None,
            grace: safesync_exec::spec::DEFAULT_GRACE,
            verbose: false,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Mirror output of fetch and mutating commands to the terminal.
    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn runner(&self) -> Arc<dyn CommandRunner> {
        Arc::clone(&self.runner)
    }

    /// The `CommandSpec` for `git <args>` in this working copy.
    pub fn spec(&self, args: &[&str]) -> CommandSpec {
        let mirrored = self.verbose && (is_mutating(args) || args.first() == Some(&"fetch"));
        CommandSpec::new("git")
            .args(args.iter().copied())
            .cwd(&self.workdir)
            .env("LC_ALL", "C")
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("GIT_EDITOR", "true")
            .quiet(!mirrored)
            .timeout(self.timeout)
            .grace(self.grace)
    }

    /// Run `git <args>`.
    pub async fn run(&self, args: &[&str], cancel: &CancellationToken) -> Result<CommandResult> {
        let spec = self.spec(args);
        tracing::debug!(command = %spec.display(), "git");
        Ok(self.runner.run(&spec, cancel).await?)
    }

    /// Run `git <args>` and return trimmed stdout, failing on nonzero exit.
    async fn query(&self, args: &[&str], cancel: &CancellationToken) -> Result<String> {
        let result = self.run(args, cancel).await?;
        if result.interrupted() {
            return Err(SyncError::Interrupted);
        }
        if !result.success() {
            return Err(SyncError::GitError(format!(
                "git {} failed (exit {}): {}",
                args.join(" "),
                result.exit_code,
                result.stderr.trim()
            )));
        }
        Ok(result.trimmed_stdout().to_string())
    }

    // -- queries ------------------------------------------------------------

    pub async fn rev_parse_head(&self, cancel: &CancellationToken) -> Result<CommandResult> {
        self.run(&["rev-parse", "HEAD"], cancel).await
    }

    pub async fn rev_parse(&self, rev: &str, cancel: &CancellationToken) -> Result<CommandResult> {
        self.run(&["rev-parse", "--verify", "--quiet", rev], cancel).await
    }

    /// Peel `rev` to a commit and print its full id; exit 1 when it names
    /// no commit (missing, ambiguous, tree or blob).
    pub async fn resolve_commit(
        &self,
        rev: &str,
        cancel: &CancellationToken,
    ) -> Result<CommandResult> {
        let peeled = commit_rev(rev);
        self.run(&["rev-parse", "--verify", "--quiet", peeled.as_str()], cancel)
            .await
    }

    pub async fn status_porcelain(&self, cancel: &CancellationToken) -> Result<CommandResult> {
        self.run(&["status", "--porcelain"], cancel).await
    }

    /// Long-form status, the only form that reports an in-progress rebase.
    pub async fn status_long(&self, cancel: &CancellationToken) -> Result<CommandResult> {
        self.run(&["status"], cancel).await
    }

    /// `merge-base --is-ancestor`: exit 0 yes, 1 no, anything else an error.
    pub async fn is_ancestor(
        &self,
        ancestor: &str,
        descendant: &str,
        cancel: &CancellationToken,
    ) -> Result<CommandResult> {
        self.run(&["merge-base", "--is-ancestor", ancestor, descendant], cancel)
            .await
    }

    /// Number of commits reachable from HEAD but not from `base`.
    pub async fn commits_ahead(&self, base: &str, cancel: &CancellationToken) -> Result<u64> {
        let range = format!("{base}..HEAD");
        let count = self.query(&["rev-list", "--count", &range], cancel).await?;
        count
            .parse()
            .map_err(|_| SyncError::GitError(format!("unexpected rev-list output: {count}")))
    }

    pub async fn merge_base(&self, a: &str, b: &str, cancel: &CancellationToken) -> Result<String> {
        self.query(&["merge-base", a, b], cancel).await
    }

    /// Paths with unresolved merge conflicts.
    pub async fn unmerged_paths(&self, cancel: &CancellationToken) -> Result<CommandResult> {
        self.run(&["diff", "--name-only", "--diff-filter=U"], cancel).await
    }

    // -- diffs and file lists -----------------------------------------------

    pub async fn diff(&self, cancel: &CancellationToken) -> Result<String> {
        self.query(&["diff"], cancel).await
    }

    pub async fn diff_cached(&self, cancel: &CancellationToken) -> Result<String> {
        self.query(&["diff", "--cached"], cancel).await
    }

    pub async fn staged_files(&self, cancel: &CancellationToken) -> Result<Vec<String>> {
        Ok(lines(&self.query(&["diff", "--cached", "--name-only"], cancel).await?))
    }

    pub async fn unstaged_files(&self, cancel: &CancellationToken) -> Result<Vec<String>> {
        Ok(lines(&self.query(&["diff", "--name-only"], cancel).await?))
    }

    pub async fn untracked_files(&self, cancel: &CancellationToken) -> Result<Vec<String>> {
        Ok(lines(
            &self
                .query(&["ls-files", "--others", "--exclude-standard"], cancel)
                .await?,
        ))
    }

    // -- actions ------------------------------------------------------------

    pub async fn fetch(
        &self,
        remote: &str,
        branch: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<CommandResult> {
        match branch {
            Some(branch) => self.run(&["fetch", remote, branch], cancel).await,
            None => self.run(&["fetch", remote], cancel).await,
        }
    }

    pub async fn rebase(&self, onto: &str, cancel: &CancellationToken) -> Result<CommandResult> {
        self.run(&["rebase", onto], cancel).await
    }

    pub async fn rebase_abort(&self, cancel: &CancellationToken) -> Result<CommandResult> {
        self.run(&["rebase", "--abort"], cancel).await
    }

    pub async fn reset_hard(&self, rev: &str, cancel: &CancellationToken) -> Result<CommandResult> {
        self.run(&["reset", "--hard", rev], cancel).await
    }

    pub async fn add_all(&self, cancel: &CancellationToken) -> Result<CommandResult> {
        self.run(&["add", "-A"], cancel).await
    }

    pub async fn add_path(&self, path: &str, cancel: &CancellationToken) -> Result<CommandResult> {
        self.run(&["add", "--", path], cancel).await
    }

    pub async fn commit(&self, message: &str, cancel: &CancellationToken) -> Result<CommandResult> {
        self.run(&["commit", "-m", message], cancel).await
    }

    /// Push `branch` to `remote`, recording it as upstream when asked.
    pub async fn push(
        &self,
        remote: &str,
        branch: &str,
        set_upstream: bool,
        cancel: &CancellationToken,
    ) -> Result<CommandResult> {
        if set_upstream {
            self.run(&["push", "-u", remote, branch], cancel).await
        } else {
            self.run(&["push", remote, branch], cancel).await
        }
    }

    // -- branches and repository --------------------------------------------

    /// Current branch name, `None` when HEAD is detached.
    pub async fn current_branch(&self, cancel: &CancellationToken) -> Result<Option<String>> {
        let name = self
            .query(&["rev-parse", "--abbrev-ref", "HEAD"], cancel)
            .await?;
        Ok((name != "HEAD" && !name.is_empty()).then_some(name))
    }

    /// Upstream tracking branch of HEAD, e.g. `origin/feature-xyz`.
    pub async fn upstream_branch(&self, cancel: &CancellationToken) -> Result<Option<String>> {
        let result = self
            .run(
                &["rev-parse", "--abbrev-ref", "--symbolic-full-name", "@{u}"],
                cancel,
            )
            .await?;
        if result.interrupted() {
            return Err(SyncError::Interrupted);
        }
        let name = result.trimmed_stdout();
        Ok((result.success() && !name.is_empty()).then(|| name.to_string()))
    }

    /// The remote's default branch: `<remote>/HEAD` if set, else `main`, else `master`.
    pub async fn main_branch(&self, remote: &str, cancel: &CancellationToken) -> Result<String> {
        let head_ref = format!("refs/remotes/{remote}/HEAD");
        let result = self.run(&["symbolic-ref", &head_ref], cancel).await?;
        if result.interrupted() {
            return Err(SyncError::Interrupted);
        }
        let prefix = format!("refs/remotes/{remote}/");
        if let Some(branch) = result
            .success()
            .then(|| result.trimmed_stdout().strip_prefix(&prefix))
            .flatten()
        {
            return Ok(branch.to_string());
        }

        for candidate in ["main", "master"] {
            let remote_ref = format!("refs/remotes/{remote}/{candidate}");
            let local_ref = format!("refs/heads/{candidate}");
            for rev in [remote_ref, local_ref] {
                let probe = self.rev_parse(&rev, cancel).await?;
                if probe.interrupted() {
                    return Err(SyncError::Interrupted);
                }
                if probe.success() {
                    return Ok(candidate.to_string());
                }
            }
        }
        Ok("main".to_string())
    }

    /// Top-level directory of the work tree containing `dir`.
    pub async fn find_repo_root(
        runner: Arc<dyn CommandRunner>,
        dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let probe = Git::new(runner, dir);
        let result = probe.run(&["rev-parse", "--show-toplevel"], cancel).await?;
        if result.interrupted() {
            return Err(SyncError::Interrupted);
        }
        if !result.success() || result.trimmed_stdout().is_empty() {
            return Err(SyncError::NotARepository(format!(
                "{}: {}",
                dir.display(),
                result.stderr.trim()
            )));
        }
        Ok(PathBuf::from(result.trimmed_stdout()))
    }
}

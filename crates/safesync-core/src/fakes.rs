//! In-memory fakes for the command seam (testing only)
//!
//! Provides `FakeRepo`, a scripted stand-in for `git` that keeps a tiny
//! commit graph and working-copy state and can inject faults per command,
//! and `RecordingRunner`, which wraps a real runner and logs every argv.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use safesync_exec::{CancellationToken, CommandResult, CommandRunner, CommandSpec, ExecError};

use crate::git::is_mutating;

// ---------------------------------------------------------------------------
// Faults
// ---------------------------------------------------------------------------

/// What happens instead of the normal command behaviour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultEffect {
    /// Exit with `code` and `stderr`, no state change.
    Exit { code: i32, stderr: String },
    /// Cancel the caller's token and report the command as cancelled.
    /// With `apply`, the command's state change happens first.
    Interrupt { apply: bool },
    /// Report the command as timed out, no state change.
    Timeout,
    /// The program cannot be launched.
    SpawnError,
}

#[derive(Debug, Clone)]
struct Fault {
    prefix: Vec<String>,
    effect: FaultEffect,
    /// `None` fires on every match.
    remaining: Option<usize>,
}

impl Fault {
    fn matches(&self, args: &[String]) -> bool {
        args.len() >= self.prefix.len() && self.prefix.iter().zip(args).all(|(p, a)| p == a)
    }
}

/// How `git rebase <onto>` behaves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebaseBehaviour {
    /// Replays local commits onto the target (fast-forwarding when possible).
    Replay,
    /// Stops with conflicts in these paths, leaving a rebase in progress.
    Conflict(Vec<String>),
    /// Exits nonzero with this stderr and changes nothing.
    Fail { code: i32, stderr: String },
}

// ---------------------------------------------------------------------------
// FakeRepo
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct InProgress {
    orig_head: String,
    paths: Vec<String>,
}

#[derive(Debug, Clone)]
struct RepoState {
    branch: String,
    head: String,
    /// commit id -> parents
    commits: HashMap<String, Vec<String>>,
    /// branch tips on the remote side, e.g. `origin/main`, visible after fetch
    upstream: HashMap<String, String>,
    /// remote-tracking refs in the local store
    tracking: HashMap<String, String>,
    /// porcelain lines
    dirty: Vec<String>,
    rebase: Option<InProgress>,
    behaviour: RebaseBehaviour,
}

/// Observable state, for comparing repositories before and after.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoSnapshot {
    pub head: String,
    pub dirty: Vec<String>,
    pub rebase_in_progress: bool,
}

/// Scripted `git` with a small commit graph.
///
/// Starts with one commit `c0` on `main`, mirrored as `origin/main`.
#[derive(Debug)]
pub struct FakeRepo {
    state: Mutex<RepoState>,
    calls: Mutex<Vec<Vec<String>>>,
    faults: Mutex<Vec<Fault>>,
}

impl Default for FakeRepo {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRepo {
    pub fn new() -> Self {
        let mut commits = HashMap::new();
        commits.insert("c0".to_string(), Vec::new());
        let mut upstream = HashMap::new();
        upstream.insert("origin/main".to_string(), "c0".to_string());
        Self {
            state: Mutex::new(RepoState {
                branch: "main".to_string(),
                head: "c0".to_string(),
                commits,
                tracking: upstream.clone(),
                upstream,
                dirty: Vec::new(),
                rebase: None,
                behaviour: RebaseBehaviour::Replay,
            }),
            calls: Mutex::new(Vec::new()),
            faults: Mutex::new(Vec::new()),
        }
    }

    /// Add a local commit on top of HEAD.
    pub fn with_local_commit(self, id: &str) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            let parent = state.head.clone();
            state.commits.insert(id.to_string(), vec![parent]);
            state.head = id.to_string();
        }
        self
    }

    /// Add a commit to the remote's `main`, visible after the next fetch.
    pub fn with_remote_commit(self, id: &str) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            let parent = state.upstream["origin/main"].clone();
            state.commits.insert(id.to_string(), vec![parent]);
            state.upstream.insert("origin/main".to_string(), id.to_string());
        }
        self
    }

    /// Add a porcelain line such as ` M file.txt`.
    pub fn with_dirty(self, line: &str) -> Self {
        self.state.lock().unwrap().dirty.push(line.to_string());
        self
    }

    pub fn with_rebase(self, behaviour: RebaseBehaviour) -> Self {
        self.state.lock().unwrap().behaviour = behaviour;
        self
    }

    /// Inject `effect` on the next command whose argv starts with `prefix`.
    pub fn fail_once(&self, prefix: &[&str], effect: FaultEffect) {
        self.push_fault(prefix, effect, Some(1));
    }

    /// Inject `effect` on every command whose argv starts with `prefix`.
    pub fn fail_always(&self, prefix: &[&str], effect: FaultEffect) {
        self.push_fault(prefix, effect, None);
    }

    fn push_fault(&self, prefix: &[&str], effect: FaultEffect, remaining: Option<usize>) {
        self.faults.lock().unwrap().push(Fault {
            prefix: prefix.iter().map(|s| s.to_string()).collect(),
            effect,
            remaining,
        });
    }

    pub fn head(&self) -> String {
        self.state.lock().unwrap().head.clone()
    }

    pub fn snapshot(&self) -> RepoSnapshot {
        let state = self.state.lock().unwrap();
        RepoSnapshot {
            head: state.head.clone(),
            dirty: state.dirty.clone(),
            rebase_in_progress: state.rebase.is_some(),
        }
    }

    /// Whether `ancestor` is reachable from `descendant`.
    pub fn is_ancestor(&self, ancestor: &str, descendant: &str) -> bool {
        reachable(&self.state.lock().unwrap().commits, descendant, ancestor)
    }

    /// git argv of every call, in order.
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }

    /// Calls joined with spaces, e.g. `"rebase origin/main"`.
    pub fn call_lines(&self) -> Vec<String> {
        self.calls().iter().map(|c| c.join(" ")).collect()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    fn take_fault(&self, args: &[String]) -> Option<FaultEffect> {
        let mut faults = self.faults.lock().unwrap();
        let index = faults.iter().position(|f| f.matches(args))?;
        let effect = faults[index].effect.clone();
        if let Some(remaining) = faults[index].remaining.as_mut() {
            *remaining -= 1;
            if *remaining == 0 {
                faults.remove(index);
            }
        }
        Some(effect)
    }

    fn apply(&self, args: &[String]) -> CommandResult {
        let mut state = self.state.lock().unwrap();
        let argv: Vec<&str> = args.iter().map(String::as_str).collect();
        match argv.as_slice() {
            ["rev-parse", "HEAD"] => ok(format!("{}\n", state.head)),
            ["rev-parse", "--abbrev-ref", "HEAD"] => ok(format!("{}\n", state.branch)),
            ["rev-parse", "--verify", "--quiet", rev] => match resolve(&state, rev) {
                Some(id) => ok(format!("{id}\n")),
                None => CommandResult::completed(1, "", ""),
            },
            ["status", "--porcelain"] => ok(porcelain(&state.dirty)),
            ["status"] => ok(long_status(&state)),
            ["fetch", remote, branch] => {
                let name = format!("{remote}/{branch}");
                match state.upstream.get(&name).cloned() {
                    Some(id) => {
                        state.tracking.insert(name, id);
                        ok(String::new())
                    }
                    None => CommandResult::completed(
                        128,
                        "",
                        format!("fatal: couldn't find remote ref {branch}\n"),
                    ),
                }
            }
            ["rebase", "--abort"] => match state.rebase.take() {
                Some(in_progress) => {
                    state.head = in_progress.orig_head;
                    state.dirty.clear();
                    ok(String::new())
                }
                None => CommandResult::completed(128, "", "fatal: No rebase in progress?\n"),
            },
            ["rebase", onto] => rebase(&mut state, onto),
            ["reset", "--hard", rev] => match resolve(&state, rev) {
                Some(id) => {
                    state.head = id.clone();
                    state.dirty.clear();
                    ok(format!("HEAD is now at {id}\n"))
                }
                None => CommandResult::completed(
                    128,
                    "",
                    format!("fatal: ambiguous argument '{rev}': unknown revision\n"),
                ),
            },
            ["merge-base", "--is-ancestor", a, b] => {
                match (resolve(&state, a), resolve(&state, b)) {
                    (Some(a), Some(b)) if reachable(&state.commits, &b, &a) => ok(String::new()),
                    (Some(_), Some(_)) => CommandResult::completed(1, "", ""),
                    _ => CommandResult::completed(128, "", "fatal: Not a valid commit name\n"),
                }
            }
            ["diff", "--name-only", "--diff-filter=U"] => ok(state
                .rebase
                .as_ref()
                .map(|r| r.paths.iter().map(|p| format!("{p}\n")).collect())
                .unwrap_or_default()),
            _ => ok(String::new()),
        }
    }
}

fn ok(stdout: String) -> CommandResult {
    CommandResult::completed(0, stdout, "")
}

fn resolve(state: &RepoState, rev: &str) -> Option<String> {
    let rev = rev.strip_suffix("^{commit}").unwrap_or(rev);
    if rev == "HEAD" {
        return Some(state.head.clone());
    }
    let name = rev.strip_prefix("refs/remotes/").unwrap_or(rev);
    if let Some(id) = state.tracking.get(name) {
        return Some(id.clone());
    }
    state.commits.contains_key(rev).then(|| rev.to_string())
}

fn reachable(commits: &HashMap<String, Vec<String>>, from: &str, target: &str) -> bool {
    let mut queue = VecDeque::from([from.to_string()]);
    let mut seen = HashSet::new();
    while let Some(id) = queue.pop_front() {
        if id == target {
            return true;
        }
        if seen.insert(id.clone()) {
            queue.extend(commits.get(&id).cloned().unwrap_or_default());
        }
    }
    false
}

fn porcelain(dirty: &[String]) -> String {
    dirty.iter().map(|l| format!("{l}\n")).collect()
}

fn long_status(state: &RepoState) -> String {
    let mut out = match &state.rebase {
        Some(_) => format!(
            "interactive rebase in progress; onto {}\nYou are currently rebasing branch '{}'.\n",
            state.head, state.branch
        ),
        None => format!("On branch {}\n", state.branch),
    };
    if state.dirty.is_empty() {
        out.push_str("nothing to commit, working tree clean\n");
    } else {
        out.push_str("Changes not staged for commit:\n");
        for line in &state.dirty {
            out.push_str(&format!("\t{}\n", line.trim()));
        }
    }
    out
}

fn rebase(state: &mut RepoState, onto: &str) -> CommandResult {
    let Some(onto_id) = resolve(state, onto) else {
        return CommandResult::completed(128, "", format!("fatal: invalid upstream '{onto}'\n"));
    };
    match state.behaviour.clone() {
        RebaseBehaviour::Fail { code, stderr } => CommandResult::completed(code, "", stderr),
        RebaseBehaviour::Conflict(paths) => {
            let mut stdout = String::new();
            for path in &paths {
                stdout.push_str(&format!(
                    "Auto-merging {path}\nCONFLICT (content): Merge conflict in {path}\n"
                ));
            }
            let stderr = format!(
                "error: could not apply {}... local change\nhint: Resolve all conflicts manually, mark them as resolved with\nhint: \"git add/rm <conflicted_files>\", then run \"git rebase --continue\".\n",
                state.head
            );
            state.rebase = Some(InProgress {
                orig_head: state.head.clone(),
                paths: paths.clone(),
            });
            state.head = onto_id;
            state.dirty = paths.iter().map(|p| format!("UU {p}")).collect();
            CommandResult::completed(1, stdout, stderr)
        }
        RebaseBehaviour::Replay => {
            if reachable(&state.commits, &state.head, &onto_id) {
                return ok(format!("Current branch {} is up to date.\n", state.branch));
            }
            if !reachable(&state.commits, &onto_id, &state.head) {
                let replayed = format!("{}-rebased", state.head);
                state.commits.insert(replayed.clone(), vec![onto_id]);
                state.head = replayed;
            } else {
                state.head = onto_id;
            }
            ok(format!(
                "Successfully rebased and updated refs/heads/{}.\n",
                state.branch
            ))
        }
    }
}

#[async_trait]
impl CommandRunner for FakeRepo {
    async fn run(
        &self,
        spec: &CommandSpec,
        cancel: &CancellationToken,
    ) -> safesync_exec::Result<CommandResult> {
        if spec.program != "git" {
            return Err(ExecError::Spawn {
                program: spec.program.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "not scripted"),
            });
        }
        self.calls.lock().unwrap().push(spec.args.clone());

        if cancel.is_cancelled() {
            return Ok(CommandResult::cancelled("", ""));
        }

        match self.take_fault(&spec.args) {
            None => Ok(self.apply(&spec.args)),
            Some(FaultEffect::Exit { code, stderr }) => {
                Ok(CommandResult::completed(code, "", stderr))
            }
            Some(FaultEffect::Timeout) => Ok(CommandResult::timed_out("", "")),
            Some(FaultEffect::SpawnError) => Err(ExecError::Spawn {
                program: "git".to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "simulated"),
            }),
            Some(FaultEffect::Interrupt { apply }) => {
                let partial = if apply {
                    self.apply(&spec.args)
                } else {
                    CommandResult::completed(0, "", "")
                };
                cancel.cancel();
                Ok(CommandResult::cancelled(partial.stdout, partial.stderr))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// RecordingRunner
// ---------------------------------------------------------------------------

/// Wraps another runner and records every argv (program first).
pub struct RecordingRunner {
    inner: Arc<dyn CommandRunner>,
    calls: Mutex<Vec<Vec<String>>>,
}

impl RecordingRunner {
    pub fn new(inner: Arc<dyn CommandRunner>) -> Self {
        Self {
            inner,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }

    /// Index of the first git call that can mutate the repository.
    pub fn first_mutating_call(&self) -> Option<usize> {
        self.calls()
            .iter()
            .position(|c| c.first().map(String::as_str) == Some("git") && is_mutating(&c[1..]))
    }
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(
        &self,
        spec: &CommandSpec,
        cancel: &CancellationToken,
    ) -> safesync_exec::Result<CommandResult> {
        let mut argv = vec![spec.program.clone()];
        argv.extend(spec.args.iter().cloned());
        self.calls.lock().unwrap().push(argv);
        self.inner.run(spec, cancel).await
    }
}

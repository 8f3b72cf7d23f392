//! Command specification.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default wait between a graceful termination request and a force kill.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(10);

/// One external command invocation.
///
/// Output is always captured; `quiet` only controls live mirroring.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandSpec {
    /// Executable name or path.
    pub program: String,

    /// Ordered arguments, passed verbatim.
    pub args: Vec<String>,

    /// Working directory (inherits the parent's when `None`).
    pub cwd: Option<PathBuf>,

    /// Extra environment variables.
    pub env: Vec<(String, String)>,

    /// Suppress live mirroring of output.
    pub quiet: bool,

    /// Maximum duration before the command is terminated.
    pub timeout: Option<Duration>,

    /// Grace period between terminate and kill.
    pub grace: Duration,
}

impl CommandSpec {
    /// Create a spec for `program` with no arguments.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            quiet: false,
            timeout: None,
            grace: DEFAULT_GRACE,
        }
    }

    /// Build a spec from an argv vector (first element is the executable).
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self::new(program.clone()).args(args.iter().cloned()))
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Shell-quoted command line for logs. Never executed by a shell.
    pub fn display(&self) -> String {
        std::iter::once(&self.program)
            .chain(&self.args)
            .map(|part| {
                // only a nul byte makes quoting fail; show it as-is
                shlex::try_quote(part)
                    .map(|q| q.into_owned())
                    .unwrap_or_else(|_| part.clone())
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_keeps_argument_order() {
        let spec = CommandSpec::new("git")
            .arg("rebase")
            .args(["origin/main", "--no-autostash"])
            .quiet(true);
        assert_eq!(spec.program, "git");
        assert_eq!(spec.args, vec!["rebase", "origin/main", "--no-autostash"]);
        assert!(spec.quiet);
        assert_eq!(spec.grace, DEFAULT_GRACE);
        assert!(spec.timeout.is_none());
    }

    #[test]
    fn from_argv_splits_program() {
        let argv = vec!["echo".to_string(), "hello".to_string()];
        let spec = CommandSpec::from_argv(&argv).unwrap();
        assert_eq!(spec.program, "echo");
        assert_eq!(spec.args, vec!["hello"]);

        assert!(CommandSpec::from_argv(&[]).is_none());
    }

    #[test]
    fn display_quotes_arguments_with_spaces() {
        let spec = CommandSpec::new("git").args(["commit", "-m", "fix: two words"]);
        assert_eq!(spec.display(), "git commit -m 'fix: two words'");
    }

    #[test]
    fn display_output_splits_back_into_argv() {
        let spec = CommandSpec::new("llm-commit").args(["--prompt", "it's \"quoted\"", ""]);
        let argv = shlex::split(&spec.display()).unwrap();
        assert_eq!(argv, vec!["llm-commit", "--prompt", "it's \"quoted\"", ""]);
    }
}

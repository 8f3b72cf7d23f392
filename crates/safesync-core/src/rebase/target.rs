use serde::{Deserialize, Serialize};

/// The remote branch an attempt integrates onto.
///
/// Accepts `main`, `origin/main`, `refs/remotes/origin/main` and upstream
/// tracking names such as `origin/feature-xyz`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrationTarget {
    pub remote: String,
    pub branch: String,
}

impl IntegrationTarget {
    pub fn new(remote: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            remote: remote.into(),
            branch: branch.into(),
        }
    }

    /// Parse a target name, using `default_remote` when none is named.
    pub fn parse(target: &str, default_remote: &str) -> Self {
        let target = target.trim();
        if let Some(rest) = target.strip_prefix("refs/remotes/") {
            if let Some((remote, branch)) = rest.split_once('/') {
                return Self::new(remote, branch);
            }
        }
        let branch = target.strip_prefix("refs/heads/").unwrap_or(target);
        match branch
            .strip_prefix(default_remote)
            .and_then(|r| r.strip_prefix('/'))
        {
            Some(rest) if !rest.is_empty() => Self::new(default_remote, rest),
            _ => Self::new(default_remote, branch),
        }
    }

    /// Remote-tracking name, e.g. `origin/main`.
    pub fn tracking_ref(&self) -> String {
        format!("{}/{}", self.remote, self.branch)
    }
}

impl std::fmt::Display for IntegrationTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.remote, self.branch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_branch_uses_default_remote() {
        let t = IntegrationTarget::parse("main", "origin");
        assert_eq!(t, IntegrationTarget::new("origin", "main"));
        assert_eq!(t.tracking_ref(), "origin/main");
    }

    #[test]
    fn tracking_name_is_split() {
        let t = IntegrationTarget::parse("origin/feature-xyz", "origin");
        assert_eq!(t.branch, "feature-xyz");
        let nested = IntegrationTarget::parse("origin/team/feature", "origin");
        assert_eq!(nested.branch, "team/feature");
    }

    #[test]
    fn full_refs_are_understood() {
        let t = IntegrationTarget::parse("refs/remotes/upstream/dev", "origin");
        assert_eq!(t, IntegrationTarget::new("upstream", "dev"));
        let local = IntegrationTarget::parse("refs/heads/main", "origin");
        assert_eq!(local, IntegrationTarget::new("origin", "main"));
    }

    #[test]
    fn branch_sharing_remote_prefix_is_not_split() {
        let t = IntegrationTarget::parse("originals", "origin");
        assert_eq!(t.branch, "originals");
    }
}

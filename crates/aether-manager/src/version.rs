//! Build information advertised in the readiness handshake.

/// Manager version from Cargo.toml
pub const MANAGER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Placeholder when no commit could be determined.
pub const UNKNOWN_COMMIT: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct BuildInfo {
    pub version: &'static str,
    pub commit: String,
}

impl Default for BuildInfo {
    fn default() -> Self {
        Self {
            version: MANAGER_VERSION,
            commit: UNKNOWN_COMMIT.to_string(),
        }
    }
}

impl BuildInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve the commit from the build environment, then the process environment.
    pub fn detect() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`BuildInfo::detect`], reading runtime variables through `lookup`.
    ///
    /// A commit baked in at compile time via `AETHER_BUILD_COMMIT` takes
    /// precedence over `AETHER_BUILD_COMMIT` / `GIT_COMMIT` at runtime.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let commit = option_env!("AETHER_BUILD_COMMIT")
            .map(str::to_string)
            .or_else(|| lookup("AETHER_BUILD_COMMIT"))
            .or_else(|| lookup("GIT_COMMIT"))
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty());

        match commit {
            Some(commit) => Self::new().with_commit(commit),
            None => Self::new(),
        }
    }

    pub fn with_commit(mut self, commit: impl Into<String>) -> Self {
        self.commit = commit.into();
        self
    }
}

//! Error type for git driver operations.
//!
//! [`GitError`] is the single error type returned by [`crate::GitDriver`].
//! It carries enough context (the argument vector, the exit code, the
//! stderr tail) that a caller three layers up can still produce a useful
//! single-line message without re-deriving it.

use thiserror::Error;

/// Errors returned by [`crate::GitDriver`] invocations.
#[derive(Debug, Error)]
pub enum GitError {
    /// `git` exited with code 128 while resolving the repository root.
    ///
    /// Git uses this code for "not a git repository (or any parent up to
    /// mount point)" — the driver recognizes it specifically so callers can
    /// surface "must be in a git repository" instead of a raw exit code.
    #[error("not a git repository")]
    NotARepository,

    /// The invocation did not complete within its timeout.
    #[error("`git {}` timed out after {timeout_ms}ms", args.join(" "))]
    Timeout {
        /// The argument vector that was running.
        args: Vec<String>,
        /// The timeout that was exceeded, in milliseconds.
        timeout_ms: u64,
    },

    /// The caller's cancellation token fired before the command completed.
    #[error("`git {}` cancelled", args.join(" "))]
    Cancelled {
        /// The argument vector that was running.
        args: Vec<String>,
    },

    /// `git` ran to completion but returned a non-zero exit code.
    #[error("`git {}` failed (exit {})", args.join(" "), exit_code.map_or_else(|| "signal".to_owned(), |c| c.to_string()))]
    CommandFailed {
        /// The argument vector that was run.
        args: Vec<String>,
        /// The process exit code, or `None` if killed by a signal.
        exit_code: Option<i32>,
        /// Captured stderr, trimmed.
        stderr: String,
    },

    /// The child process could not be spawned, or I/O with it failed.
    #[error("I/O error running git: {0}")]
    Io(#[from] std::io::Error),
}

impl GitError {
    /// `true` if this error represents exit code 128 from a repo-root probe.
    #[must_use]
    pub const fn is_not_a_repository(&self) -> bool {
        matches!(self, Self::NotARepository)
    }

    /// Classify a raw exit code the way the spec mandates: 128 means "not a
    /// git repository" for the narrow case of repo-root resolution.
    #[must_use]
    pub const fn classify_repo_root_exit(exit_code: Option<i32>) -> bool {
        matches!(exit_code, Some(128))
    }
}

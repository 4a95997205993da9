//! The crate-level error enum.
//!
//! Every fallible operation in `cu-core` returns [`Error`]. Each variant
//! carries enough context (operation name, environment id, lower-level
//! cause) that a caller three layers up can still print a useful
//! single-line message without re-deriving it.

use cu_git::GitError;
use thiserror::Error;

/// Errors surfaced by the environment engine.
#[derive(Debug, Error)]
pub enum Error {
    /// The current directory (or the path given to the coordinator) is not
    /// inside a git repository. Git's exit code 128 is remapped to this.
    #[error("must be in a git repository\n  To fix: run `cu` from inside a git repository, or `git init` one here first")]
    NotInRepository,

    /// No environment with the given id exists in this repository's fork.
    #[error("environment {id:?} not found\n  To fix: check available environments: cu list")]
    EnvironmentNotFound {
        /// The id that was looked up.
        id: String,
    },

    /// A lock could not be acquired within its retry budget.
    #[error(
        "timed out acquiring {class} lock for {repo} after {attempts} attempts\n  \
         To fix: another process may be stuck holding this lock; check for a stale lock file under <base>/locks/ and remove it if no process holds it"
    )]
    LockTimeout {
        /// The lock class that could not be acquired.
        class: String,
        /// The repository path the lock guards.
        repo: String,
        /// How many acquisition attempts were made.
        attempts: u32,
    },

    /// The caller's cancellation token fired before the operation completed.
    #[error("{operation} cancelled")]
    Cancelled {
        /// The operation that was cancelled.
        operation: String,
    },

    /// A git invocation failed; `source` carries the underlying detail.
    #[error("git command failed during {operation}: {source}")]
    GitCommandFailed {
        /// The higher-level operation that was attempting the git call.
        operation: String,
        /// The underlying git error.
        #[source]
        source: GitError,
    },

    /// The container engine failed to materialize a base image / run setup.
    #[error("container build failed: {reason}")]
    ContainerBuildFailed {
        /// Human-readable reason, normally including the failing setup command.
        reason: String,
    },

    /// A foreground command could not even be started (infrastructure
    /// failure). Non-zero *exit* from a command the engine did run is not an
    /// error — see §7 of the design notes — it is returned as a result string.
    #[error("container exec failed: {reason}")]
    ContainerExecFailed {
        /// Human-readable reason.
        reason: String,
    },

    /// A file op targeted a path inside a cached submodule directory.
    #[error(
        "path {path:?} is inside submodule {submodule:?} and cannot be modified\n  \
         To fix: edit the submodule's own repository directly, outside this environment"
    )]
    SubmoduleProtected {
        /// The path the caller attempted to modify.
        path: String,
        /// The submodule directory that protects it.
        submodule: String,
    },

    /// An `Edit` search string matched more than once; the caller must
    /// retry with one of the listed match ids.
    #[error(
        "edit search matched {} locations; disambiguate with a match id\n  To fix: retry with match_id set to one of: {}",
        matches.len(),
        matches.join(", ")
    )]
    AmbiguousEdit {
        /// The candidate match ids, in file order.
        matches: Vec<String>,
    },

    /// A secret spec entry failed validation (bad scheme, duplicate name, …).
    #[error("invalid secret spec: {reason}\n  To fix: use NAME=scheme://location with scheme one of file, env, op, vault")]
    SecretInvalid {
        /// Human-readable reason.
        reason: String,
    },

    /// `environment.json` exists but failed to parse or carries unknown
    /// fields.
    #[error("malformed configuration at {path}: {reason}\n  To fix: edit the config file and correct the issue")]
    ConfigMalformed {
        /// Path to the offending file.
        path: String,
        /// Human-readable reason.
        reason: String,
    },

    /// `Apply` (§4.9) failed partway through. Always carries the
    /// stash-recovery hint so the operator can restore their pending
    /// changes even when the failure happened mid-sequence.
    #[error("{detail}")]
    ApplyFailed {
        /// Full human-readable detail, including the `git stash apply <sha>`
        /// recovery hint when a safety stash was created.
        detail: String,
    },

    /// Generic I/O failure (filesystem, lock file, temp dir).
    #[error("I/O error during {operation}: {source}")]
    Io {
        /// The operation that failed.
        operation: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Build an [`Error::Io`] tagging the failing operation.
    pub fn io(operation: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    /// Wrap a [`GitError`], remapping [`GitError::NotARepository`] to
    /// [`Error::NotInRepository`] and [`GitError::Cancelled`] to
    /// [`Error::Cancelled`] so callers don't have to special-case the two
    /// layers separately.
    pub fn from_git(operation: impl Into<String>, source: GitError) -> Self {
        match source {
            GitError::NotARepository => Self::NotInRepository,
            GitError::Cancelled { .. } => Self::Cancelled {
                operation: operation.into(),
            },
            other => Self::GitCommandFailed {
                operation: operation.into(),
                source: other,
            },
        }
    }
}

/// Convenience alias used throughout `cu-core`.
pub type Result<T> = std::result::Result<T, Error>;

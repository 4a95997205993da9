//! Value types shared by all callers of [`crate::GitDriver`].

use std::fmt;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// GitOid
// ---------------------------------------------------------------------------

/// A validated 40-character lowercase hex git object id (SHA-1).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GitOid(String);

impl GitOid {
    /// Parse and validate a hex OID string.
    ///
    /// # Errors
    /// Returns [`OidParseError`] if `s` is not exactly 40 lowercase hex
    /// characters.
    pub fn new(s: &str) -> Result<Self, OidParseError> {
        if s.len() != 40 {
            return Err(OidParseError {
                value: s.to_owned(),
                reason: format!("expected 40 hex characters, got {}", s.len()),
            });
        }
        if !s.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()) {
            return Err(OidParseError {
                value: s.to_owned(),
                reason: "must contain only lowercase hex characters (0-9, a-f)".to_owned(),
            });
        }
        Ok(Self(s.to_owned()))
    }

    /// Borrow the hex string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The first 12 hex characters, for human-facing display.
    #[must_use]
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl fmt::Display for GitOid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for GitOid {
    type Err = OidParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Error returned when a string fails to parse as a [`GitOid`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid git oid {value:?}: {reason}")]
pub struct OidParseError {
    /// The raw value that failed validation.
    pub value: String,
    /// Why validation failed.
    pub reason: String,
}

// ---------------------------------------------------------------------------
// RefName
// ---------------------------------------------------------------------------

/// A validated git ref name (`refs/heads/foo`, `refs/notes/bar`, …).
///
/// Rejects empty names, names with a leading `-` (could be parsed as a
/// flag by some git subcommands), and names containing whitespace.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RefName(String);

impl RefName {
    /// Validate and wrap a ref name.
    ///
    /// # Errors
    /// Returns [`RefNameError`] if the name is empty, starts with `-`, or
    /// contains whitespace.
    pub fn new(s: impl Into<String>) -> Result<Self, RefNameError> {
        let s = s.into();
        if s.is_empty() {
            return Err(RefNameError {
                value: s,
                reason: "ref name must not be empty".to_owned(),
            });
        }
        if s.starts_with('-') {
            return Err(RefNameError {
                value: s,
                reason: "ref name must not start with '-'".to_owned(),
            });
        }
        if s.chars().any(char::is_whitespace) {
            return Err(RefNameError {
                value: s,
                reason: "ref name must not contain whitespace".to_owned(),
            });
        }
        Ok(Self(s))
    }

    /// Build the branch ref `refs/heads/<name>`.
    #[must_use]
    pub fn branch(name: &str) -> Self {
        Self(format!("refs/heads/{name}"))
    }

    /// Build a notes ref `refs/notes/<name>`.
    #[must_use]
    pub fn notes(name: &str) -> Self {
        Self(format!("refs/notes/{name}"))
    }

    /// Borrow the ref string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RefName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Error returned when a string fails to validate as a [`RefName`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid ref name {value:?}: {reason}")]
pub struct RefNameError {
    /// The raw value that failed validation.
    pub value: String,
    /// Why validation failed.
    pub reason: String,
}

// ---------------------------------------------------------------------------
// WorktreeEntry
// ---------------------------------------------------------------------------

/// One entry from `git worktree list --porcelain`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorktreeEntry {
    /// Absolute path to the worktree.
    pub path: std::path::PathBuf,
    /// HEAD commit of the worktree, if resolvable.
    pub head: Option<GitOid>,
    /// The branch checked out, if any (detached worktrees have none).
    pub branch: Option<RefName>,
    /// `true` if the worktree is locked (`git worktree lock`).
    pub locked: bool,
}

//! Thin synchronous wrapper around the system `git` executable.
//!
//! This crate is the *only* place that spawns `git` child processes. Every
//! other crate in the workspace programs against [`GitDriver`] and the
//! types in [`types`] — nobody else shells out directly.
//!
//! # Crate layout
//!
//! - [`driver`] — the [`GitDriver`] that runs captured or interactive
//!   invocations with a timeout and a cooperative [`CancellationToken`].
//! - [`types`] — value types used by callers ([`GitOid`], [`RefName`],
//!   [`WorktreeEntry`]).
//! - [`error`] — the [`GitError`] enum returned by all driver methods.

pub mod driver;
pub mod error;
pub mod types;

pub use driver::{CapturedOutput, EnvMode, GitDriver};
pub use error::GitError;
pub use tokio_util::sync::CancellationToken;
pub use types::{GitOid, OidParseError, RefName, RefNameError, WorktreeEntry};

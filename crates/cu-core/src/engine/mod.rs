//! The container engine boundary (§4.7): the only trait the rest of the
//! core depends on for anything that touches a container.
//!
//! `cu-core` ships one concrete implementation, [`local::LocalContainerEngine`],
//! suitable for local development and the test suite. A production
//! deployment plugs in an implementation that drives a real container
//! build/exec daemon behind this same trait — the core never knows the
//! difference, and never interprets a [`ContainerState`] beyond passing it
//! back to the engine that produced it.

pub mod local;

use std::path::Path;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// An opaque handle to a container's filesystem state after some operation.
/// The core persists these via the state store and never interprets their
/// contents.
#[derive(Clone, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct ContainerState(pub String);

impl ContainerState {
    /// Borrow the opaque handle string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Inputs that determine whether a base-image build is reusable across
/// opens (the "setup fingerprint" of §3/§4.7 is computed from these by the
/// caller and threaded through as `fingerprint`).
#[derive(Clone, Debug)]
pub struct BuildSpec<'a> {
    /// Base image reference.
    pub base_image: &'a str,
    /// Container workdir.
    pub workdir: &'a str,
    /// Declared environment variables.
    pub env: &'a [(String, String)],
    /// Setup commands, run serially as cacheable layers.
    pub setup_commands: &'a [String],
    /// The directory to mount as the initial source tree.
    pub source_dir: &'a Path,
    /// The precomputed setup fingerprint — the cache key for this build.
    pub fingerprint: &'a str,
}

/// Outcome of a single setup command, captured for [`crate::error::Error::ContainerBuildFailed`]
/// and for the step log.
#[derive(Clone, Debug)]
pub struct SetupStepResult {
    /// The command that was run.
    pub command: String,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
    /// Process exit code.
    pub exit_code: i32,
}

/// One internal/external address pair for a background run's exposed port.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortBinding {
    /// The port as declared by the caller.
    pub container_port: u16,
    /// Address visible from inside the container.
    pub internal_address: String,
    /// Address visible from the host.
    pub external_address: String,
}

/// A running background process: its exposed ports and a way to describe it
/// for diagnostics. Background runs do not mutate the environment's
/// revision history.
#[derive(Clone, Debug)]
pub struct BackgroundHandle {
    /// Identifier for the background process (engine-specific).
    pub id: String,
    /// Exposed port bindings.
    pub ports: Vec<PortBinding>,
}

/// One file in an exported tree (§4.7 "export tree").
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExportedFile {
    /// Path relative to the workdir.
    pub path: String,
    /// File contents.
    pub contents: Vec<u8>,
}

/// The container build/exec abstraction. Every method is synchronous and
/// cancellation-aware, matching the rest of the core (§5).
///
/// Object-safe: no generics, no `Self` outside `Result`/`Box`, so callers
/// can hold `Box<dyn ContainerEngine>`.
#[allow(clippy::missing_errors_doc)]
pub trait ContainerEngine: Send + Sync {
    /// Build a base container and run setup commands serially. Reuses a
    /// prior build when `spec.fingerprint` matches an already-built state.
    fn build_base(&self, spec: &BuildSpec<'_>, cancel: &CancellationToken) -> Result<ContainerState>;

    /// Read a file's full contents.
    fn file_read(&self, state: &ContainerState, path: &str, cancel: &CancellationToken) -> Result<String>;

    /// Write (create or overwrite) a file, returning the new state.
    fn file_write(
        &self,
        state: &ContainerState,
        path: &str,
        content: &str,
        cancel: &CancellationToken,
    ) -> Result<ContainerState>;

    /// Literal search-and-replace. `match_id`, if given, disambiguates among
    /// multiple occurrences (see [`crate::ids::edit_match_id`]).
    ///
    /// Zero matches is an error; exactly one match (or one selected by
    /// `match_id`) replaces in place; more than one without a `match_id`
    /// returns [`crate::error::Error::AmbiguousEdit`].
    fn file_edit(
        &self,
        state: &ContainerState,
        path: &str,
        search: &str,
        replace: &str,
        match_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<ContainerState>;

    /// Delete a file, returning the new state.
    fn file_delete(&self, state: &ContainerState, path: &str, cancel: &CancellationToken) -> Result<ContainerState>;

    /// Execute `<shell> -c <command>` in the container. Non-zero exit is
    /// *not* an error at this layer — the returned string embeds the exit
    /// code, stdout, and stderr so the caller (the agent) can react.
    fn run_foreground(
        &self,
        state: &ContainerState,
        shell: &str,
        command: &str,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<(ContainerState, String)>;

    /// Start a long-running service and expose `ports`. Does not produce a
    /// new [`ContainerState`] — background runs never mutate history.
    fn run_background(
        &self,
        state: &ContainerState,
        shell: &str,
        command: &str,
        ports: &[u16],
        cancel: &CancellationToken,
    ) -> Result<BackgroundHandle>;

    /// Replace the container's declared environment variables, returning
    /// the new state.
    fn set_env(
        &self,
        state: &ContainerState,
        vars: &[(String, String)],
        cancel: &CancellationToken,
    ) -> Result<ContainerState>;

    /// Export the workdir tree, typically omitting VCS metadata, for
    /// committing into a worktree.
    fn export_tree(&self, state: &ContainerState, cancel: &CancellationToken) -> Result<Vec<ExportedFile>>;

    /// Run `git submodule foreach` (or equivalent) inside the container and
    /// return the detected submodule paths, relative to the workdir.
    fn detect_submodules(&self, state: &ContainerState, cancel: &CancellationToken) -> Result<Vec<String>>;

    /// Attach an interactive shell to the container on the host terminal.
    fn open_terminal(&self, state: &ContainerState, cancel: &CancellationToken) -> Result<()>;
}

//! The [`Environment`] aggregate (§4.8): owns a revision history of
//! container states and a pending notes buffer, and applies file/command
//! operations through a [`ContainerEngine`].

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::config::EnvironmentConfig;
use crate::engine::{BackgroundHandle, BuildSpec, ContainerEngine, ContainerState};
use crate::error::{Error, Result};
use crate::state::{now_rfc3339, EnvironmentState};

/// An immutable snapshot of the container state after one atomic operation.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Revision {
    /// Monotonically increasing version, starting at 1.
    pub version: u64,
    /// The operation name (`create`, `file_write`, `file_edit`, `file_delete`,
    /// `run`, `set_env`, `revert`).
    pub operation: String,
    /// Free-text explanation supplied by the caller.
    pub explanation: String,
    /// Captured stdout/result text, for `run` revisions.
    pub stdout: Option<String>,
    /// RFC 3339 timestamp.
    pub timestamp: String,
    /// The opaque container-state handle this revision captured.
    pub handle: ContainerState,
}

struct Inner {
    current_state: ContainerState,
    history: Vec<Revision>,
    pending_notes: VecDeque<String>,
    title: String,
    updated_at: String,
    tracked_branch: String,
    submodule_paths: Vec<String>,
    setup_fingerprint: String,
}

/// A container workspace bound to a dedicated branch and worktree. Owns its
/// revision history and pending notes buffer exclusively; the fork
/// repository it's attached to is shared and guarded separately by the
/// [`crate::lock::LockManager`].
pub struct Environment {
    id: String,
    engine: Arc<dyn ContainerEngine>,
    inner: Mutex<Inner>,
}

impl Environment {
    /// Construct a new environment: build the base container, run setup,
    /// detect submodules, and record the first revision.
    ///
    /// # Errors
    /// Propagates [`Error::ContainerBuildFailed`] unchanged if setup fails;
    /// no revision or branch state is produced on failure.
    #[instrument(skip(engine, config, source_dir, cancel), fields(env_id = %id))]
    pub fn create(
        id: String,
        description: String,
        config: &EnvironmentConfig,
        source_dir: &Path,
        engine: Arc<dyn ContainerEngine>,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let fingerprint = config.setup_fingerprint(&source_fingerprint(source_dir));
        let spec = BuildSpec {
            base_image: &config.base_image,
            workdir: &config.workdir,
            env: &config.env,
            setup_commands: &config.setup_commands,
            source_dir,
            fingerprint: &fingerprint,
        };
        let state = engine.build_base(&spec, cancel)?;
        let submodule_paths = engine.detect_submodules(&state, cancel)?;

        let now = now_rfc3339();
        let revision = Revision {
            version: 1,
            operation: "create".to_owned(),
            explanation: description.clone(),
            stdout: None,
            timestamp: now.clone(),
            handle: state.clone(),
        };

        Ok(Self {
            id: id.clone(),
            engine,
            inner: Mutex::new(Inner {
                current_state: state,
                history: vec![revision],
                pending_notes: VecDeque::from([format!("created environment: {description}")]),
                title: description,
                updated_at: now,
                tracked_branch: format!("env/{id}"),
                submodule_paths,
                setup_fingerprint: fingerprint,
            }),
        })
    }

    /// Rehydrate an in-memory `Environment` from persisted state and the
    /// last-known container handle, without rebuilding anything. Used when
    /// the coordinator loads an existing environment for a new op.
    #[must_use]
    pub fn from_persisted(id: String, engine: Arc<dyn ContainerEngine>, current_state: ContainerState, state: &EnvironmentState) -> Self {
        Self {
            id,
            engine,
            inner: Mutex::new(Inner {
                current_state,
                history: state.history.clone(),
                pending_notes: VecDeque::new(),
                title: state.title.clone(),
                updated_at: state.updated_at.clone(),
                tracked_branch: state.tracked_branch.clone(),
                submodule_paths: state.submodule_paths.clone(),
                setup_fingerprint: state.setup_fingerprint.clone(),
            }),
        }
    }

    /// The environment id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Snapshot of the revision history, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<Revision> {
        self.inner.lock().expect("environment mutex poisoned").history.clone()
    }

    /// The current container-state handle.
    #[must_use]
    pub fn current_state(&self) -> ContainerState {
        self.inner.lock().expect("environment mutex poisoned").current_state.clone()
    }

    /// Drain the pending notes buffer (FIFO), for the coordinator to persist
    /// on `Update`.
    pub fn drain_notes(&self) -> Vec<String> {
        let mut inner = self.inner.lock().expect("environment mutex poisoned");
        inner.pending_notes.drain(..).collect()
    }

    /// Build the machine-readable state snapshot for the notes ref.
    #[must_use]
    pub fn state_snapshot(&self) -> EnvironmentState {
        let inner = self.inner.lock().expect("environment mutex poisoned");
        EnvironmentState {
            id: self.id.clone(),
            title: inner.title.clone(),
            updated_at: inner.updated_at.clone(),
            tracked_branch: inner.tracked_branch.clone(),
            submodule_paths: inner.submodule_paths.clone(),
            setup_fingerprint: inner.setup_fingerprint.clone(),
            revision_count: u64::try_from(inner.history.len()).unwrap_or(u64::MAX),
            history: inner.history.clone(),
        }
    }

    /// Write a file, refusing paths inside a cached submodule directory.
    pub fn file_write(
        &self,
        path: &str,
        content: &str,
        explanation: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut inner = self.inner.lock().expect("environment mutex poisoned");
        reject_submodule_path(&inner.submodule_paths, path)?;
        let new_state = self.engine.file_write(&inner.current_state, path, content, cancel)?;
        record(&mut inner, "file_write", explanation, None, new_state);
        inner.pending_notes.push_back(format!("wrote {path}: {explanation}"));
        Ok(())
    }

    /// Literal search-and-replace, refusing paths inside a cached submodule
    /// directory. See [`crate::engine::ContainerEngine::file_edit`] for the
    /// disambiguation contract.
    pub fn file_edit(
        &self,
        path: &str,
        search: &str,
        replace: &str,
        match_id: Option<&str>,
        explanation: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut inner = self.inner.lock().expect("environment mutex poisoned");
        reject_submodule_path(&inner.submodule_paths, path)?;
        let new_state = self
            .engine
            .file_edit(&inner.current_state, path, search, replace, match_id, cancel)?;
        record(&mut inner, "file_edit", explanation, None, new_state);
        inner.pending_notes.push_back(format!("edited {path}: {explanation}"));
        Ok(())
    }

    /// Delete a file, refusing paths inside a cached submodule directory.
    pub fn file_delete(&self, path: &str, explanation: &str, cancel: &CancellationToken) -> Result<()> {
        let mut inner = self.inner.lock().expect("environment mutex poisoned");
        reject_submodule_path(&inner.submodule_paths, path)?;
        let new_state = self.engine.file_delete(&inner.current_state, path, cancel)?;
        record(&mut inner, "file_delete", explanation, None, new_state);
        inner.pending_notes.push_back(format!("deleted {path}: {explanation}"));
        Ok(())
    }

    /// Run a foreground command. A non-zero exit is returned embedded in the
    /// result string, not as an `Err` (§7) — infrastructure failures to even
    /// start the command remain errors.
    pub fn run(
        &self,
        shell: &str,
        command: &str,
        explanation: &str,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let mut inner = self.inner.lock().expect("environment mutex poisoned");
        let (new_state, output) = self
            .engine
            .run_foreground(&inner.current_state, shell, command, timeout, cancel)?;
        record(&mut inner, "run", explanation, Some(output.clone()), new_state);
        inner.pending_notes.push_back(format!("ran `{command}`: {explanation}"));
        Ok(output)
    }

    /// Start a background service. Does not mutate revision history.
    pub fn run_background(
        &self,
        shell: &str,
        command: &str,
        ports: &[u16],
        cancel: &CancellationToken,
    ) -> Result<BackgroundHandle> {
        let state = self.current_state();
        self.engine.run_background(&state, shell, command, ports, cancel)
    }

    /// Replace the container's declared environment variables.
    pub fn set_env(&self, vars: &[(String, String)], explanation: &str, cancel: &CancellationToken) -> Result<()> {
        let mut inner = self.inner.lock().expect("environment mutex poisoned");
        let new_state = self.engine.set_env(&inner.current_state, vars, cancel)?;
        record(&mut inner, "set_env", explanation, None, new_state);
        inner.pending_notes.push_back(format!("set env vars: {explanation}"));
        Ok(())
    }

    /// Re-run setup against the current source tree, producing a new
    /// revision (used when `environment.json`'s setup commands change).
    pub fn rerun_setup(&self, config: &EnvironmentConfig, source_dir: &Path, cancel: &CancellationToken) -> Result<()> {
        let fingerprint = config.setup_fingerprint(&source_fingerprint(source_dir));
        let spec = BuildSpec {
            base_image: &config.base_image,
            workdir: &config.workdir,
            env: &config.env,
            setup_commands: &config.setup_commands,
            source_dir,
            fingerprint: &fingerprint,
        };
        let new_state = self.engine.build_base(&spec, cancel)?;
        let mut inner = self.inner.lock().expect("environment mutex poisoned");
        inner.setup_fingerprint = fingerprint;
        record(&mut inner, "setup", "re-ran setup commands", None, new_state);
        inner.pending_notes.push_back("re-ran setup".to_owned());
        Ok(())
    }

    /// Append a new revision pointing back at an earlier handle. History is
    /// never truncated: `revert` is recorded as a new entry, not a rewind.
    ///
    /// # Errors
    /// Returns [`Error::EnvironmentNotFound`]-shaped context via a generic
    /// string error path if `target_version` doesn't exist in history —
    /// modeled here as [`Error::ContainerExecFailed`] since it's a caller
    /// usage error, not an infrastructure one.
    pub fn revert(&self, target_version: u64, explanation: &str) -> Result<()> {
        let mut inner = self.inner.lock().expect("environment mutex poisoned");
        let target = inner
            .history
            .iter()
            .find(|r| r.version == target_version)
            .map(|r| r.handle.clone())
            .ok_or_else(|| Error::ContainerExecFailed {
                reason: format!("no revision with version {target_version} in history"),
            })?;
        record(&mut inner, "revert", explanation, None, target);
        inner.pending_notes.push_back(format!("reverted to v{target_version}: {explanation}"));
        Ok(())
    }
}

fn record(inner: &mut Inner, operation: &str, explanation: &str, stdout: Option<String>, handle: ContainerState) {
    let version = inner.history.last().map_or(1, |r| r.version + 1);
    let now = now_rfc3339();
    inner.history.push(Revision {
        version,
        operation: operation.to_owned(),
        explanation: explanation.to_owned(),
        stdout,
        timestamp: now.clone(),
        handle: handle.clone(),
    });
    inner.current_state = handle;
    inner.updated_at = now;
}

fn reject_submodule_path(submodule_paths: &[String], path: &str) -> Result<()> {
    for submodule in submodule_paths {
        let prefix = submodule.trim_end_matches('/');
        if path == prefix || path.starts_with(&format!("{prefix}/")) {
            return Err(Error::SubmoduleProtected {
                path: path.to_owned(),
                submodule: submodule.clone(),
            });
        }
    }
    Ok(())
}

/// A cheap fingerprint over a source tree's file names and sizes — enough
/// to detect "the mounted source changed" for cache-invalidation purposes
/// without hashing full file contents on every open.
fn source_fingerprint(source_dir: &Path) -> String {
    let mut entries = Vec::new();
    collect_entries(source_dir, source_dir, &mut entries);
    entries.sort();
    let mut hasher = Sha256::new();
    for entry in entries {
        hasher.update(entry.as_bytes());
        hasher.update([0u8]);
    }
    let digest = hasher.finalize();
    digest.iter().take(16).map(|b| format!("{b:02x}")).collect()
}

fn collect_entries(root: &Path, dir: &Path, out: &mut Vec<String>) {
    let Ok(read) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in read.flatten() {
        let name = entry.file_name();
        if name == std::ffi::OsStr::new(".git") {
            continue;
        }
        let path = entry.path();
        if let Ok(file_type) = entry.file_type() {
            if file_type.is_dir() {
                collect_entries(root, &path, out);
                continue;
            }
        }
        let relative = path.strip_prefix(root).unwrap_or(&path).to_string_lossy().into_owned();
        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        out.push(format!("{relative}:{size}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::local::LocalContainerEngine;

    fn test_env(source: &Path, storage: &Path) -> Environment {
        let config = EnvironmentConfig::default();
        let engine: Arc<dyn ContainerEngine> = Arc::new(LocalContainerEngine::new(storage));
        let cancel = CancellationToken::new();
        Environment::create("e1".to_owned(), "test env".to_owned(), &config, source, engine, &cancel).unwrap()
    }

    #[test]
    fn revision_versions_are_monotonic_from_one() {
        let source = tempfile::tempdir().unwrap();
        let storage = tempfile::tempdir().unwrap();
        let env = test_env(source.path(), storage.path());
        let cancel = CancellationToken::new();

        env.file_write("a.txt", "1", "seed", &cancel).unwrap();
        env.file_write("b.txt", "2", "seed2", &cancel).unwrap();

        let history = env.history();
        let versions: Vec<u64> = history.iter().map(|r| r.version).collect();
        assert_eq!(versions, vec![1, 2, 3]);
    }

    #[test]
    fn revert_appends_rather_than_truncates() {
        let source = tempfile::tempdir().unwrap();
        let storage = tempfile::tempdir().unwrap();
        let env = test_env(source.path(), storage.path());
        let cancel = CancellationToken::new();

        env.file_write("a.txt", "1", "first", &cancel).unwrap();
        let first_handle = env.history()[0].handle.clone();
        env.file_write("a.txt", "2", "second", &cancel).unwrap();

        env.revert(1, "back to v1").unwrap();
        let history = env.history();
        assert_eq!(history.len(), 4);
        assert_eq!(history.last().unwrap().handle, first_handle);
        assert_eq!(history.last().unwrap().version, 4);
    }

    #[test]
    fn submodule_paths_are_protected() {
        let source = tempfile::tempdir().unwrap();
        std::fs::write(source.path().join(".gitmodules"), "[submodule \"vendor/lib\"]\n\tpath = vendor/lib\n\turl = x\n").unwrap();
        let storage = tempfile::tempdir().unwrap();
        let env = test_env(source.path(), storage.path());
        let cancel = CancellationToken::new();

        let err = env.file_write("vendor/lib/file.rs", "x", "nope", &cancel).unwrap_err();
        assert!(matches!(err, Error::SubmoduleProtected { .. }));
        assert_eq!(env.history().len(), 1, "history must be unchanged after a rejected op");
    }

    #[test]
    fn run_foreground_records_revision_and_returns_failure_as_result() {
        let source = tempfile::tempdir().unwrap();
        let storage = tempfile::tempdir().unwrap();
        let env = test_env(source.path(), storage.path());
        let cancel = CancellationToken::new();

        let before = env.history().len();
        let output = env.run("sh", "exit 3", "deliberate failure", None, &cancel).unwrap();
        assert!(output.contains("exit code 3"));
        assert_eq!(env.history().len(), before + 1);
    }
}

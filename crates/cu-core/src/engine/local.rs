//! A local, process-based [`ContainerEngine`] implementation.
//!
//! Used for local development and the test suite. There is no actual
//! container isolation here: "the container's workdir" is a plain
//! directory on the host, and setup/run commands are executed with
//! `std::process::Command` directly. A production deployment swaps this
//! for an implementation that drives a real container daemon behind the
//! same trait — see the module doc on [`crate::engine`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::engine::{BackgroundHandle, BuildSpec, ContainerEngine, ContainerState, ExportedFile, PortBinding};
use crate::error::{Error, Result};
use crate::ids::edit_match_id;

/// Names excluded when copying a snapshot forward to a new revision
/// directory — VCS metadata only; engine-internal bookkeeping files (like
/// `.cu-env`, see [`EXPORT_EXCLUDED_NAMES`]) must still carry forward so
/// they survive across operations.
const EXCLUDED_NAMES: &[&str] = &[".git"];

/// Names excluded from [`ContainerEngine::export_tree`] — VCS metadata plus
/// engine-internal bookkeeping files that must never be committed into the
/// environment's worktree as if they were real source files.
const EXPORT_EXCLUDED_NAMES: &[&str] = &[".git", ".cu-env"];

/// Process-based container engine. Every [`ContainerState`] is the absolute
/// path to a directory snapshot under `storage_root`; mutating operations
/// copy the previous snapshot into a fresh directory before applying the
/// change, so earlier handles remain valid (revision history is
/// append-only, and `revert` just points back at one).
pub struct LocalContainerEngine {
    storage_root: PathBuf,
    next_id: AtomicU64,
    fingerprint_cache: Mutex<BTreeMap<String, ContainerState>>,
}

impl LocalContainerEngine {
    /// Build an engine that stores container-state snapshots under
    /// `storage_root` (normally `<base>/containers/`).
    #[must_use]
    pub fn new(storage_root: impl Into<PathBuf>) -> Self {
        Self {
            storage_root: storage_root.into(),
            next_id: AtomicU64::new(0),
            fingerprint_cache: Mutex::new(BTreeMap::new()),
        }
    }

    fn fresh_dir(&self) -> Result<PathBuf> {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let dir = self.storage_root.join(format!("rev-{n:08}"));
        std::fs::create_dir_all(&dir).map_err(|e| Error::io("create container state directory", e))?;
        Ok(dir)
    }

    fn resolve(state: &ContainerState) -> &Path {
        Path::new(&state.0)
    }

    fn snapshot_from(&self, source: &Path) -> Result<PathBuf> {
        let dir = self.fresh_dir()?;
        copy_tree(source, &dir)?;
        Ok(dir)
    }

    fn run_command(dir: &Path, shell: &str, command: &str, timeout: Option<Duration>) -> Result<(i32, String, String)> {
        let mut cmd = Command::new(shell);
        cmd.arg("-c").arg(command).current_dir(dir);
        // `timeout` is accepted for interface parity with the spec's
        // cancellation story; the local engine runs commands to completion
        // (it has no subprocess polling loop of its own — GitDriver owns
        // that pattern for git invocations specifically).
        let _ = timeout;
        let output = cmd.output().map_err(|e| Error::ContainerExecFailed {
            reason: format!("failed to spawn {shell} -c {command:?}: {e}"),
        })?;
        Ok((
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stdout).into_owned(),
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ))
    }
}

impl ContainerEngine for LocalContainerEngine {
    #[instrument(skip(self, spec, cancel), fields(fingerprint = %spec.fingerprint))]
    fn build_base(&self, spec: &BuildSpec<'_>, cancel: &CancellationToken) -> Result<ContainerState> {
        if let Some(cached) = self.fingerprint_cache.lock().expect("cache mutex poisoned").get(spec.fingerprint) {
            debug!("reusing cached build for fingerprint");
            return Ok(cached.clone());
        }

        let dir = self.fresh_dir()?;
        copy_tree(spec.source_dir, &dir)?;

        for command in spec.setup_commands {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled {
                    operation: "build_base setup command".to_owned(),
                });
            }
            let (code, stdout, stderr) = Self::run_command(&dir, "sh", command, None)?;
            if code != 0 {
                return Err(Error::ContainerBuildFailed {
                    reason: format!(
                        "setup command {command:?} exited {code}\nstdout:\n{stdout}\nstderr:\n{stderr}"
                    ),
                });
            }
        }

        let state = ContainerState(dir.display().to_string());
        self.fingerprint_cache
            .lock()
            .expect("cache mutex poisoned")
            .insert(spec.fingerprint.to_owned(), state.clone());
        Ok(state)
    }

    fn file_read(&self, state: &ContainerState, path: &str, _cancel: &CancellationToken) -> Result<String> {
        let full = Self::resolve(state).join(path);
        std::fs::read_to_string(&full).map_err(|e| Error::io(format!("read {path}"), e))
    }

    fn file_write(
        &self,
        state: &ContainerState,
        path: &str,
        content: &str,
        _cancel: &CancellationToken,
    ) -> Result<ContainerState> {
        let new_dir = self.snapshot_from(Self::resolve(state))?;
        let full = new_dir.join(path);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::io("create parent directory", e))?;
        }
        std::fs::write(&full, content).map_err(|e| Error::io(format!("write {path}"), e))?;
        Ok(ContainerState(new_dir.display().to_string()))
    }

    fn file_edit(
        &self,
        state: &ContainerState,
        path: &str,
        search: &str,
        replace: &str,
        match_id: Option<&str>,
        _cancel: &CancellationToken,
    ) -> Result<ContainerState> {
        let source_full = Self::resolve(state).join(path);
        let original = std::fs::read_to_string(&source_full).map_err(|e| Error::io(format!("read {path}"), e))?;

        let offsets: Vec<usize> = original.match_indices(search).map(|(i, _)| i).collect();
        if offsets.is_empty() {
            return Err(Error::ContainerExecFailed {
                reason: format!("no occurrences of {search:?} found in {path}"),
            });
        }

        let chosen_index = if offsets.len() == 1 {
            0
        } else {
            let candidates: Vec<String> = (0..offsets.len())
                .map(|i| edit_match_id(path, search, replace, i))
                .collect();
            match match_id {
                Some(id) => candidates
                    .iter()
                    .position(|c| c == id)
                    .ok_or_else(|| Error::AmbiguousEdit { matches: candidates.clone() })?,
                None => return Err(Error::AmbiguousEdit { matches: candidates }),
            }
        };

        let offset = offsets[chosen_index];
        let mut updated = String::with_capacity(original.len());
        updated.push_str(&original[..offset]);
        updated.push_str(replace);
        updated.push_str(&original[offset + search.len()..]);

        let new_dir = self.snapshot_from(Self::resolve(state))?;
        let target_full = new_dir.join(path);
        std::fs::write(&target_full, updated).map_err(|e| Error::io(format!("write {path}"), e))?;
        Ok(ContainerState(new_dir.display().to_string()))
    }

    fn file_delete(&self, state: &ContainerState, path: &str, _cancel: &CancellationToken) -> Result<ContainerState> {
        let new_dir = self.snapshot_from(Self::resolve(state))?;
        let full = new_dir.join(path);
        std::fs::remove_file(&full).map_err(|e| Error::io(format!("delete {path}"), e))?;
        Ok(ContainerState(new_dir.display().to_string()))
    }

    fn run_foreground(
        &self,
        state: &ContainerState,
        shell: &str,
        command: &str,
        timeout: Option<Duration>,
        _cancel: &CancellationToken,
    ) -> Result<(ContainerState, String)> {
        let new_dir = self.snapshot_from(Self::resolve(state))?;
        let (code, stdout, stderr) = Self::run_command(&new_dir, shell, command, timeout)?;
        let new_state = ContainerState(new_dir.display().to_string());
        if code == 0 {
            Ok((new_state, stdout))
        } else {
            Ok((
                new_state,
                format!("command exited with exit code {code}\n--- stdout ---\n{stdout}\n--- stderr ---\n{stderr}"),
            ))
        }
    }

    fn run_background(
        &self,
        state: &ContainerState,
        shell: &str,
        command: &str,
        ports: &[u16],
        _cancel: &CancellationToken,
    ) -> Result<BackgroundHandle> {
        let dir = Self::resolve(state);
        let child = Command::new(shell)
            .arg("-c")
            .arg(command)
            .current_dir(dir)
            .spawn()
            .map_err(|e| Error::ContainerExecFailed {
                reason: format!("failed to spawn background command: {e}"),
            })?;
        let bindings = ports
            .iter()
            .map(|&p| PortBinding {
                container_port: p,
                internal_address: format!("127.0.0.1:{p}"),
                external_address: format!("127.0.0.1:{p}"),
            })
            .collect();
        Ok(BackgroundHandle {
            id: child.id().to_string(),
            ports: bindings,
        })
    }

    fn set_env(
        &self,
        state: &ContainerState,
        vars: &[(String, String)],
        _cancel: &CancellationToken,
    ) -> Result<ContainerState> {
        let new_dir = self.snapshot_from(Self::resolve(state))?;
        let env_file = new_dir.join(".cu-env");
        let contents: String = vars.iter().map(|(k, v)| format!("{k}={v}\n")).collect();
        std::fs::write(&env_file, contents).map_err(|e| Error::io("write container env file", e))?;
        Ok(ContainerState(new_dir.display().to_string()))
    }

    fn export_tree(&self, state: &ContainerState, _cancel: &CancellationToken) -> Result<Vec<ExportedFile>> {
        let root = Self::resolve(state);
        let mut out = Vec::new();
        collect_files(root, root, &mut out)?;
        Ok(out)
    }

    fn detect_submodules(&self, state: &ContainerState, cancel: &CancellationToken) -> Result<Vec<String>> {
        let dir = Self::resolve(state);
        if !dir.join(".gitmodules").exists() {
            return Ok(Vec::new());
        }
        let _ = cancel;
        let contents = std::fs::read_to_string(dir.join(".gitmodules")).map_err(|e| Error::io("read .gitmodules", e))?;
        Ok(contents
            .lines()
            .filter_map(|line| line.trim().strip_prefix("path = ").map(str::to_owned))
            .collect())
    }

    fn open_terminal(&self, state: &ContainerState, _cancel: &CancellationToken) -> Result<()> {
        let dir = Self::resolve(state);
        let shell = std::env::var("SHELL").unwrap_or_else(|_| "sh".to_owned());
        let status = Command::new(shell)
            .current_dir(dir)
            .status()
            .map_err(|e| Error::ContainerExecFailed {
                reason: format!("failed to attach terminal: {e}"),
            })?;
        if status.success() {
            Ok(())
        } else {
            Err(Error::ContainerExecFailed {
                reason: format!("terminal session exited with status {status}"),
            })
        }
    }
}

fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    if !src.exists() {
        std::fs::create_dir_all(dst).map_err(|e| Error::io("create empty container directory", e))?;
        return Ok(());
    }
    for entry in std::fs::read_dir(src).map_err(|e| Error::io("read source directory", e))? {
        let entry = entry.map_err(|e| Error::io("read directory entry", e))?;
        let name = entry.file_name();
        if EXCLUDED_NAMES.iter().any(|n| name == std::ffi::OsStr::new(n)) {
            continue;
        }
        let from = entry.path();
        let to = dst.join(&name);
        let file_type = entry.file_type().map_err(|e| Error::io("stat directory entry", e))?;
        if file_type.is_dir() {
            std::fs::create_dir_all(&to).map_err(|e| Error::io("create directory", e))?;
            copy_tree(&from, &to)?;
        } else if file_type.is_file() {
            if let Some(parent) = to.parent() {
                std::fs::create_dir_all(parent).map_err(|e| Error::io("create parent directory", e))?;
            }
            std::fs::copy(&from, &to).map_err(|e| Error::io("copy file", e))?;
        }
    }
    Ok(())
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<ExportedFile>) -> Result<()> {
    for entry in std::fs::read_dir(dir).map_err(|e| Error::io("read directory", e))? {
        let entry = entry.map_err(|e| Error::io("read directory entry", e))?;
        let name = entry.file_name();
        if EXPORT_EXCLUDED_NAMES.iter().any(|n| name == std::ffi::OsStr::new(n)) {
            continue;
        }
        let path = entry.path();
        let file_type = entry.file_type().map_err(|e| Error::io("stat directory entry", e))?;
        if file_type.is_dir() {
            collect_files(root, &path, out)?;
        } else if file_type.is_file() {
            let relative = path
                .strip_prefix(root)
                .unwrap_or(&path)
                .to_string_lossy()
                .replace('\\', "/");
            let contents = std::fs::read(&path).map_err(|e| Error::io("read file for export", e))?;
            out.push(ExportedFile { path: relative, contents });
        }
    }
    Ok(())
}

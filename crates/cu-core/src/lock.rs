//! Process-level advisory locking keyed by `(user-repo path, lock class)`.
//!
//! Correctness rests solely on the atomicity of exclusive file creation
//! (`OpenOptions::create_new`); lock file contents (holder pid, acquisition
//! time) are written for operator diagnostics only and are never read back
//! to decide whether a lock is held.

use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// The three lock classes named in the design.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LockClass {
    /// Gates fork creation and remote reconfiguration.
    Repo,
    /// Gates branch create/delete, worktree add/remove, and propagation
    /// commits.
    Worktree,
    /// Gates the two notes-ref updates.
    Notes,
}

impl LockClass {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Repo => "repo",
            Self::Worktree => "worktree",
            Self::Notes => "notes",
        }
    }
}

const BACKOFF_BASE: Duration = Duration::from_millis(50);
const BACKOFF_CAP: Duration = Duration::from_secs(2);
const MAX_ATTEMPTS: u32 = 30;

/// A held advisory lock. Dropping it releases the lock (best-effort unlink).
pub struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), %err, "failed to release lock file");
            }
        }
    }
}

/// Acquires and releases the three named lock classes for a given user-repo
/// path, via exclusive-create lock files under a shared directory.
pub struct LockManager {
    locks_dir: PathBuf,
}

impl LockManager {
    /// Build a manager that places lock files under `locks_dir` (normally
    /// `<base>/locks/`).
    #[must_use]
    pub fn new(locks_dir: impl Into<PathBuf>) -> Self {
        Self {
            locks_dir: locks_dir.into(),
        }
    }

    /// Acquire `class` for `repo_path`, retrying with exponential backoff
    /// (base 50ms, cap 2s, up to 30 attempts) on collision.
    ///
    /// # Errors
    /// Returns [`Error::LockTimeout`] if the retry budget is exhausted, or
    /// [`Error::Cancelled`] if `cancel` fires first.
    pub fn acquire(
        &self,
        repo_path: &Path,
        class: LockClass,
        cancel: &CancellationToken,
    ) -> Result<LockGuard> {
        std::fs::create_dir_all(&self.locks_dir)
            .map_err(|e| Error::io("create locks directory", e))?;
        let path = self.lock_path(repo_path, class);

        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled {
                    operation: format!("acquire {} lock", class.as_str()),
                });
            }
            match self.try_create(&path) {
                Ok(()) => {
                    debug!(class = class.as_str(), attempt, "lock acquired");
                    return Ok(LockGuard { path });
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    attempt += 1;
                    if attempt >= MAX_ATTEMPTS {
                        return Err(Error::LockTimeout {
                            class: class.as_str().to_owned(),
                            repo: repo_path.display().to_string(),
                            attempts: attempt,
                        });
                    }
                    let backoff = BACKOFF_BASE.saturating_mul(1 << attempt.min(16)).min(BACKOFF_CAP);
                    std::thread::sleep(backoff);
                }
                Err(err) => return Err(Error::io("create lock file", err)),
            }
        }
    }

    fn try_create(&self, path: &Path) -> std::io::Result<()> {
        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        let contents = format!("pid={} acquired_at={}\n", std::process::id(), now_unix_secs());
        file.write_all(contents.as_bytes())?;
        Ok(())
    }

    fn lock_path(&self, repo_path: &Path, class: LockClass) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(repo_path.to_string_lossy().as_bytes());
        let digest = hasher.finalize();
        let hash = digest.iter().take(8).fold(String::new(), |mut s, b| {
            use std::fmt::Write as _;
            let _ = write!(s, "{b:02x}");
            s
        });
        self.locks_dir.join(format!("{hash}.{}.lock", class.as_str()))
    }
}

fn now_unix_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_blocks_until_first_released() {
        let dir = tempfile::tempdir().unwrap();
        let manager = LockManager::new(dir.path());
        let repo = PathBuf::from("/some/repo");
        let cancel = CancellationToken::new();

        let guard = manager.acquire(&repo, LockClass::Repo, &cancel).unwrap();
        drop(guard);

        let guard2 = manager.acquire(&repo, LockClass::Repo, &cancel).unwrap();
        drop(guard2);
    }

    #[test]
    fn different_classes_do_not_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let manager = LockManager::new(dir.path());
        let repo = PathBuf::from("/some/repo");
        let cancel = CancellationToken::new();

        let _repo_lock = manager.acquire(&repo, LockClass::Repo, &cancel).unwrap();
        let _worktree_lock = manager.acquire(&repo, LockClass::Worktree, &cancel).unwrap();
    }

    #[test]
    fn cancellation_aborts_acquire() {
        let dir = tempfile::tempdir().unwrap();
        let manager = LockManager::new(dir.path());
        let repo = PathBuf::from("/some/repo");
        let cancel = CancellationToken::new();

        let held = manager.acquire(&repo, LockClass::Notes, &cancel).unwrap();
        cancel.cancel();
        let err = manager.acquire(&repo, LockClass::Notes, &cancel).unwrap_err();
        assert!(matches!(err, Error::Cancelled { .. }));
        drop(held);
    }
}

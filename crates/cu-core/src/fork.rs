//! Creates and maintains the hidden bare mirror ("fork") of a user repo, its
//! `container-use` remote, and the worktrees checked out from it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use cu_git::{EnvMode, GitDriver};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::error::{Error, Result};
use crate::lock::{LockClass, LockManager};

/// Fixed remote name the fork manager maintains on the user repo.
pub const REMOTE_NAME: &str = "container-use";

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Owns the on-disk layout under `<base>/` and all fork/worktree lifecycle
/// operations for one user repository.
pub struct ForkManager {
    base_dir: PathBuf,
    user_repo: PathBuf,
    driver: GitDriver,
}

impl ForkManager {
    /// Derive the fork path for `user_repo` under `base_dir` without doing
    /// any I/O — a pure function of the two paths, as required by §4.3.
    #[must_use]
    pub fn fork_path(base_dir: &Path, user_repo: &Path) -> PathBuf {
        base_dir.join("repos").join(repo_hash(user_repo))
    }

    /// Derive the worktree path for `(base_dir, env_id)` without any I/O.
    #[must_use]
    pub fn worktree_path(base_dir: &Path, env_id: &str) -> PathBuf {
        base_dir.join("worktrees").join(env_id)
    }

    /// Resolve `cwd`'s repository root via `git rev-parse --show-toplevel`,
    /// then build a manager for it.
    ///
    /// # Errors
    /// Returns [`Error::NotInRepository`] if `cwd` is not inside a git
    /// repository (git exit 128).
    pub fn open(base_dir: impl Into<PathBuf>, cwd: &Path, cancel: &CancellationToken) -> Result<Self> {
        let driver = GitDriver::new();
        let out = driver
            .captured(
                cwd,
                &["rev-parse", "--show-toplevel"],
                Some(PROBE_TIMEOUT),
                EnvMode::Inherit,
                cancel,
            )
            .map_err(|e| Error::from_git("resolve user repo root", e))?;
        let user_repo = PathBuf::from(out.stdout.trim());
        Ok(Self {
            base_dir: base_dir.into(),
            user_repo,
            driver,
        })
    }

    /// Build directly from an already-resolved user repo root (used by
    /// tests and by callers that have already validated the path).
    #[must_use]
    pub fn for_repo(base_dir: impl Into<PathBuf>, user_repo: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            user_repo: user_repo.into(),
            driver: GitDriver::new(),
        }
    }

    /// The resolved user repository root.
    #[must_use]
    pub fn user_repo(&self) -> &Path {
        &self.user_repo
    }

    /// The bare fork path for this user repo.
    #[must_use]
    pub fn fork(&self) -> PathBuf {
        Self::fork_path(&self.base_dir, &self.user_repo)
    }

    /// Ensure the fork exists (bare repo) and the `container-use` remote on
    /// the user repo points at it. Idempotent: safe to call on every open.
    ///
    /// Acquires the `repo` lock for the duration.
    #[instrument(skip(self, locks, cancel), fields(user_repo = %self.user_repo.display()))]
    pub fn ensure_fork(&self, locks: &LockManager, cancel: &CancellationToken) -> Result<PathBuf> {
        let _guard = locks.acquire(&self.user_repo, LockClass::Repo, cancel)?;
        let fork = self.fork();
        if !fork.join("HEAD").exists() {
            std::fs::create_dir_all(&fork).map_err(|e| Error::io("create fork directory", e))?;
            self.driver
                .captured(&fork, &["init", "--bare", "-q"], None, EnvMode::Isolated, cancel)
                .map_err(|e| Error::from_git("init bare fork", e))?;
            info!(fork = %fork.display(), "created fork repository");
        }
        self.ensure_remote(&fork, cancel)?;
        Ok(fork)
    }

    fn ensure_remote(&self, fork: &Path, cancel: &CancellationToken) -> Result<()> {
        let existing = self
            .driver
            .captured(
                &self.user_repo,
                &["remote", "get-url", REMOTE_NAME],
                Some(PROBE_TIMEOUT),
                EnvMode::Inherit,
                cancel,
            )
            .ok()
            .map(|o| o.stdout.trim().to_owned());

        let fork_str = fork.display().to_string();
        match existing {
            Some(url) if url == fork_str => Ok(()),
            Some(_) => {
                self.driver
                    .captured(
                        &self.user_repo,
                        &["remote", "set-url", REMOTE_NAME, &fork_str],
                        None,
                        EnvMode::Inherit,
                        cancel,
                    )
                    .map_err(|e| Error::from_git("repair container-use remote", e))?;
                Ok(())
            }
            None => {
                self.driver
                    .captured(
                        &self.user_repo,
                        &["remote", "add", REMOTE_NAME, &fork_str],
                        None,
                        EnvMode::Inherit,
                        cancel,
                    )
                    .map_err(|e| Error::from_git("add container-use remote", e))?;
                Ok(())
            }
        }
    }

    /// Create the environment branch (from the user repo's current HEAD, if
    /// the branch doesn't already exist on the fork) and check out a
    /// worktree for it. Idempotent.
    ///
    /// Acquires the `worktree` lock for the duration.
    #[instrument(skip(self, locks, cancel), fields(env_id))]
    pub fn init_worktree(
        &self,
        env_id: &str,
        locks: &LockManager,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let _guard = locks.acquire(&self.user_repo, LockClass::Worktree, cancel)?;
        let fork = self.fork();
        let branch_ref = format!("refs/heads/{env_id}");

        let branch_exists = self
            .driver
            .captured(
                &fork,
                &["show-ref", "--verify", "--quiet", &branch_ref],
                Some(PROBE_TIMEOUT),
                EnvMode::Isolated,
                cancel,
            )
            .is_ok();

        if !branch_exists {
            let head = self
                .driver
                .captured(
                    &self.user_repo,
                    &["rev-parse", "HEAD"],
                    Some(PROBE_TIMEOUT),
                    EnvMode::Inherit,
                    cancel,
                )
                .map_err(|e| Error::from_git("resolve user repo HEAD", e))?;
            let head_sha = head.stdout.trim();

            // The branch must exist as an object the *fork* knows about:
            // fetch the tip from the user repo into the fork before
            // branching, since the fork has no direct filesystem relation
            // to the user repo's object store.
            self.driver
                .captured(
                    &fork,
                    &["fetch", "-q", self.user_repo.to_string_lossy().as_ref(), head_sha],
                    None,
                    EnvMode::Isolated,
                    cancel,
                )
                .map_err(|e| Error::from_git("fetch user repo HEAD into fork", e))?;
            self.driver
                .captured(
                    &fork,
                    &["branch", env_id, head_sha],
                    None,
                    EnvMode::Isolated,
                    cancel,
                )
                .map_err(|e| Error::from_git("create environment branch", e))?;
            debug!(env_id, head_sha, "created environment branch");
        }

        let worktree_path = Self::worktree_path(&self.base_dir, env_id);
        if !worktree_path.join(".git").exists() {
            std::fs::create_dir_all(worktree_path.parent().unwrap_or(&worktree_path))
                .map_err(|e| Error::io("create worktrees directory", e))?;
            self.driver
                .captured(
                    &fork,
                    &[
                        "worktree",
                        "add",
                        worktree_path.to_string_lossy().as_ref(),
                        env_id,
                    ],
                    None,
                    EnvMode::Isolated,
                    cancel,
                )
                .map_err(|e| Error::from_git("add environment worktree", e))?;
            info!(env_id, path = %worktree_path.display(), "created worktree");
        }

        Ok(worktree_path)
    }

    /// Remove the worktree and delete the branch. Idempotent: a missing
    /// worktree or branch is not an error.
    ///
    /// Acquires the `worktree` lock for the duration.
    pub fn destroy_worktree(
        &self,
        env_id: &str,
        locks: &LockManager,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let _guard = locks.acquire(&self.user_repo, LockClass::Worktree, cancel)?;
        let fork = self.fork();
        let worktree_path = Self::worktree_path(&self.base_dir, env_id);

        if worktree_path.exists() {
            let result = self.driver.captured(
                &fork,
                &["worktree", "remove", "--force", worktree_path.to_string_lossy().as_ref()],
                None,
                EnvMode::Isolated,
                cancel,
            );
            if let Err(err) = result {
                if !err.to_string().contains("is not a working tree") {
                    return Err(Error::from_git("remove environment worktree", err));
                }
            }
        }
        // Belt-and-suspenders: `worktree remove` can leave the directory if
        // the checkout was already half-deleted by hand.
        let _ = std::fs::remove_dir_all(&worktree_path);

        let branch_ref = format!("refs/heads/{env_id}");
        let exists = self
            .driver
            .captured(
                &fork,
                &["show-ref", "--verify", "--quiet", &branch_ref],
                Some(PROBE_TIMEOUT),
                EnvMode::Isolated,
                cancel,
            )
            .is_ok();
        if exists {
            self.driver
                .captured(&fork, &["branch", "-D", env_id], None, EnvMode::Isolated, cancel)
                .map_err(|e| Error::from_git("delete environment branch", e))?;
        }
        Ok(())
    }

    /// Access to the underlying driver, for coordinator operations that
    /// need to run arbitrary git commands against the fork or worktrees.
    #[must_use]
    pub fn driver(&self) -> &GitDriver {
        &self.driver
    }
}

fn repo_hash(user_repo: &Path) -> String {
    let normalized = user_repo
        .canonicalize()
        .unwrap_or_else(|_| user_repo.to_path_buf());
    let mut hasher = Sha256::new();
    hasher.update(normalized.to_string_lossy().as_bytes());
    let digest = hasher.finalize();
    digest.iter().take(12).map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_user_repo(dir: &Path) -> GitDriver {
        let driver = GitDriver::new();
        let cancel = CancellationToken::new();
        driver.captured(dir, &["init", "-q"], None, EnvMode::Isolated, &cancel).unwrap();
        std::fs::write(dir.join("README.md"), "hello\n").unwrap();
        driver.captured(dir, &["add", "."], None, EnvMode::Isolated, &cancel).unwrap();
        driver
            .captured(
                dir,
                &["commit", "-q", "-m", "initial"],
                None,
                EnvMode::Isolated,
                &cancel,
            )
            .unwrap();
        driver
    }

    #[test]
    fn fork_path_is_pure_and_stable() {
        let base = Path::new("/base");
        let repo = Path::new("/repos/foo");
        let a = ForkManager::fork_path(base, repo);
        let b = ForkManager::fork_path(base, repo);
        assert_eq!(a, b);
        assert!(a.starts_with(base.join("repos")));
    }

    #[test]
    fn ensure_fork_creates_bare_repo_and_remote() {
        let user_dir = tempfile::tempdir().unwrap();
        let base_dir = tempfile::tempdir().unwrap();
        init_user_repo(user_dir.path());

        let locks = LockManager::new(base_dir.path().join("locks"));
        let cancel = CancellationToken::new();
        let manager = ForkManager::for_repo(base_dir.path(), user_dir.path());

        let fork = manager.ensure_fork(&locks, &cancel).unwrap();
        assert!(fork.join("HEAD").exists());

        let driver = GitDriver::new();
        let out = driver
            .captured(
                user_dir.path(),
                &["remote", "get-url", REMOTE_NAME],
                None,
                EnvMode::Inherit,
                &cancel,
            )
            .unwrap();
        assert_eq!(PathBuf::from(out.stdout.trim()), fork);

        // Idempotent: calling again does not error or duplicate the remote.
        manager.ensure_fork(&locks, &cancel).unwrap();
    }

    #[test]
    fn init_and_destroy_worktree_round_trips() {
        let user_dir = tempfile::tempdir().unwrap();
        let base_dir = tempfile::tempdir().unwrap();
        init_user_repo(user_dir.path());

        let locks = LockManager::new(base_dir.path().join("locks"));
        let cancel = CancellationToken::new();
        let manager = ForkManager::for_repo(base_dir.path(), user_dir.path());
        manager.ensure_fork(&locks, &cancel).unwrap();

        let worktree = manager.init_worktree("e1", &locks, &cancel).unwrap();
        assert!(worktree.join("README.md").exists());

        // Idempotent re-init.
        let worktree2 = manager.init_worktree("e1", &locks, &cancel).unwrap();
        assert_eq!(worktree, worktree2);

        manager.destroy_worktree("e1", &locks, &cancel).unwrap();
        assert!(!worktree.exists());

        // Idempotent destroy on an already-gone environment.
        manager.destroy_worktree("e1", &locks, &cancel).unwrap();
    }
}

//! The [`RepositoryCoordinator`] façade (§4.9): the top-level entry point
//! that composes the fork manager, state store, lock manager, and
//! container engine. This is where worktree propagation, checkout, diff,
//! log, merge, merge-squash, and the preserve-unstaged `apply` workflow
//! live.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use cu_git::{EnvMode, GitDriver};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::config::EnvironmentConfig;
use crate::engine::ContainerEngine;
use crate::environment::Environment;
use crate::error::{Error, Result};
use crate::fork::ForkManager;
use crate::ids::generate_environment_id;
use crate::lock::LockManager;
use crate::state::{is_notes_ref, EnvironmentState, StateStore};

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const MAX_ID_COLLISION_RETRIES: u32 = 8;

/// One row of the `diagnose()` snapshot (§2.1 ADDED): whether a fork branch
/// parses as an environment, whether its worktree is attached, and whether
/// the branch tip matches the worktree HEAD.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Diagnostic {
    /// The fork branch name.
    pub branch: String,
    /// `true` if a readable state note is attached to the branch tip.
    pub has_state_note: bool,
    /// `true` if a worktree exists at the derived path.
    pub worktree_exists: bool,
    /// `true` if the worktree's HEAD matches the branch tip (only
    /// meaningful when `worktree_exists` is true).
    pub worktree_matches_tip: bool,
}

/// Top-level façade over one user repository's environments.
pub struct RepositoryCoordinator {
    base_dir: PathBuf,
    fork_manager: ForkManager,
    locks: LockManager,
    engine: Arc<dyn ContainerEngine>,
}

impl RepositoryCoordinator {
    /// Resolve `cwd`'s repository root and build a coordinator for it.
    ///
    /// # Errors
    /// Returns [`Error::NotInRepository`] if `cwd` is not inside a git
    /// repository.
    pub fn open(base_dir: impl Into<PathBuf>, cwd: &Path, engine: Arc<dyn ContainerEngine>, cancel: &CancellationToken) -> Result<Self> {
        let base_dir = base_dir.into();
        let fork_manager = ForkManager::open(base_dir.clone(), cwd, cancel)?;
        let locks = LockManager::new(base_dir.join("locks"));
        Ok(Self {
            base_dir,
            fork_manager,
            locks,
            engine,
        })
    }

    /// Build directly from an already-resolved user repo root (tests, or
    /// callers that resolved the root themselves).
    #[must_use]
    pub fn for_repo(base_dir: impl Into<PathBuf>, user_repo: impl Into<PathBuf>, engine: Arc<dyn ContainerEngine>) -> Self {
        let base_dir = base_dir.into();
        Self {
            locks: LockManager::new(base_dir.join("locks")),
            fork_manager: ForkManager::for_repo(base_dir.clone(), user_repo),
            base_dir,
            engine,
        }
    }

    fn driver(&self) -> &GitDriver {
        self.fork_manager.driver()
    }

    fn user_repo(&self) -> &Path {
        self.fork_manager.user_repo()
    }

    /// The resolved user repository root this coordinator operates on.
    #[must_use]
    pub fn repo_root(&self) -> &Path {
        self.fork_manager.user_repo()
    }

    /// Create a new environment: picks a fresh human-memorable id, ensures
    /// the fork and worktree exist, builds the initial container, and
    /// performs the first propagation (worktree commit + notes).
    ///
    /// # Errors
    /// Propagates fork, container, or lock errors unchanged. No partial
    /// environment (branch without worktree, or vice versa) is left behind
    /// on failure of the container build step — the branch/worktree are
    /// only created after the build succeeds.
    #[instrument(skip(self, config, cancel))]
    pub fn create(&self, description: &str, config: &EnvironmentConfig, cancel: &CancellationToken) -> Result<String> {
        self.fork_manager.ensure_fork(&self.locks, cancel)?;

        let id = self.pick_unused_id(cancel)?;
        let environment = Environment::create(
            id.clone(),
            description.to_owned(),
            config,
            self.user_repo(),
            Arc::clone(&self.engine),
            cancel,
        )?;

        self.fork_manager.init_worktree(&id, &self.locks, cancel)?;
        self.propagate(&id, &environment, cancel)?;
        info!(env_id = %id, "environment created");
        Ok(id)
    }

    fn pick_unused_id(&self, cancel: &CancellationToken) -> Result<String> {
        let fork = self.fork_manager.fork();
        for _ in 0..MAX_ID_COLLISION_RETRIES {
            let candidate = generate_environment_id();
            let branch_ref = format!("refs/heads/{candidate}");
            let exists = self
                .driver()
                .captured(
                    &fork,
                    &["show-ref", "--verify", "--quiet", &branch_ref],
                    Some(PROBE_TIMEOUT),
                    EnvMode::Isolated,
                    cancel,
                )
                .is_ok();
            if !exists {
                return Ok(candidate);
            }
        }
        // Word-list space is small enough that this should never trigger in
        // practice; fall back to a longer, collision-resistant id.
        Ok(format!("{}-{}", generate_environment_id(), std::process::id()))
    }

    /// Commit the environment's current container state into its worktree
    /// and branch, then persist the step log and state notes. Drains the
    /// environment's pending notes buffer.
    #[instrument(skip(self, environment, cancel), fields(env_id = %environment.id()))]
    pub fn propagate(&self, env_id: &str, environment: &Environment, cancel: &CancellationToken) -> Result<()> {
        let worktree = ForkManager::worktree_path(&self.base_dir, env_id);
        let files = self.engine.export_tree(&environment.current_state(), cancel)?;

        {
            let _guard = self.locks.acquire(self.user_repo(), crate::lock::LockClass::Worktree, cancel)?;
            materialize_tree(&worktree, &files)?;

            self.driver()
                .captured(&worktree, &["add", "-A"], None, EnvMode::Isolated, cancel)
                .map_err(|e| Error::from_git("stage propagated tree", e))?;

            let dirty = self
                .driver()
                .captured(&worktree, &["status", "--porcelain"], Some(PROBE_TIMEOUT), EnvMode::Isolated, cancel)
                .map_err(|e| Error::from_git("check worktree status", e))?;
            let notes = environment.drain_notes();
            let message = if notes.is_empty() {
                "environment step".to_owned()
            } else {
                notes.join("\n")
            };
            if !dirty.stdout.trim().is_empty() {
                self.driver()
                    .captured(&worktree, &["commit", "-q", "-m", &message], None, EnvMode::Isolated, cancel)
                    .map_err(|e| Error::from_git("commit propagated tree", e))?;
            } else if !notes.is_empty() {
                // A revision was recorded (e.g. a `run` with no file
                // side-effects) but the exported tree is byte-identical to
                // what's already committed. Commit anyway with
                // `--allow-empty` so the branch still advances by one
                // commit per revision, per the ancestry-propagation
                // property: every recorded revision gets its own commit.
                self.driver()
                    .captured(&worktree, &["commit", "-q", "--allow-empty", "-m", &message], None, EnvMode::Isolated, cancel)
                    .map_err(|e| Error::from_git("commit empty propagated revision", e))?;
            }
            // Neither dirty nor any pending notes: nothing happened since
            // the last propagation (e.g. a redundant call); leave the
            // branch untouched.
        }

        let tip = self
            .driver()
            .captured(&worktree, &["rev-parse", "HEAD"], Some(PROBE_TIMEOUT), EnvMode::Isolated, cancel)
            .map_err(|e| Error::from_git("resolve worktree HEAD", e))?
            .stdout
            .trim()
            .to_owned();

        let fork = self.fork_manager.fork();
        let store = StateStore::new(&fork, self.driver());
        store.write_state(self.user_repo(), &tip, &environment.state_snapshot(), &self.locks, cancel)?;
        let log_line = environment.state_snapshot().title;
        store.append_log(self.user_repo(), &tip, &log_line, &self.locks, cancel)?;
        Ok(())
    }

    /// List environments, newest-updated first. Lenient per §4.4: branches
    /// without a readable state note are silently skipped — this is the
    /// known inconsistency surfaced by [`Self::diagnose`].
    pub fn list(&self, cancel: &CancellationToken) -> Result<Vec<EnvironmentState>> {
        let fork = self.fork_manager.fork();
        let branches = self.list_branch_tips(&fork, cancel)?;
        let store = StateStore::new(&fork, self.driver());
        let mut states: Vec<EnvironmentState> = branches
            .into_iter()
            .filter_map(|(_, sha)| store.read_state(&sha, cancel))
            .collect();
        states.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(states)
    }

    /// List environments whose branch tip descends from `head` (i.e. `head`
    /// is an ancestor of the branch tip) — "which environments sprouted
    /// from where I am".
    pub fn list_descendants(&self, head: &str, cancel: &CancellationToken) -> Result<Vec<EnvironmentState>> {
        let fork = self.fork_manager.fork();
        let branches = self.list_branch_tips(&fork, cancel)?;
        let store = StateStore::new(&fork, self.driver());
        let mut out = Vec::new();
        for (_, sha) in branches {
            let is_ancestor = self
                .driver()
                .captured(
                    &fork,
                    &["merge-base", "--is-ancestor", head, &sha],
                    Some(PROBE_TIMEOUT),
                    EnvMode::Isolated,
                    cancel,
                )
                .is_ok();
            if is_ancestor {
                if let Some(state) = store.read_state(&sha, cancel) {
                    out.push(state);
                }
            }
        }
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(out)
    }

    /// Read-only snapshot used by `doctor`-style diagnostics: does each
    /// fork branch parse as an environment, does its worktree exist, and
    /// does the worktree HEAD match the branch tip.
    pub fn diagnose(&self, cancel: &CancellationToken) -> Result<Vec<Diagnostic>> {
        let fork = self.fork_manager.fork();
        let branches = self.list_branch_tips(&fork, cancel)?;
        let store = StateStore::new(&fork, self.driver());
        let mut out = Vec::new();
        for (branch, sha) in branches {
            let has_state_note = store.read_state(&sha, cancel).is_some();
            let worktree = ForkManager::worktree_path(&self.base_dir, &branch);
            let worktree_exists = worktree.join(".git").exists();
            let worktree_matches_tip = worktree_exists
                && self
                    .driver()
                    .captured(&worktree, &["rev-parse", "HEAD"], Some(PROBE_TIMEOUT), EnvMode::Isolated, cancel)
                    .map(|o| o.stdout.trim() == sha)
                    .unwrap_or(false);
            out.push(Diagnostic {
                branch,
                has_state_note,
                worktree_exists,
                worktree_matches_tip,
            });
        }
        Ok(out)
    }

    fn list_branch_tips(&self, fork: &Path, cancel: &CancellationToken) -> Result<Vec<(String, String)>> {
        let out = self
            .driver()
            .captured(
                fork,
                &["for-each-ref", "--format=%(refname)%09%(objectname)", "refs/heads/"],
                Some(PROBE_TIMEOUT),
                EnvMode::Isolated,
                cancel,
            )
            .map_err(|e| Error::from_git("list fork branches", e))?;
        Ok(out
            .stdout
            .lines()
            .filter_map(|line| {
                let (refname, sha) = line.split_once('\t')?;
                if is_notes_ref(refname) {
                    return None;
                }
                let branch = refname.strip_prefix("refs/heads/")?;
                Some((branch.to_owned(), sha.to_owned()))
            })
            .collect())
    }

    /// Delete an environment: removes its worktree and branch. Idempotent.
    pub fn delete(&self, id: &str, cancel: &CancellationToken) -> Result<()> {
        self.fork_manager.destroy_worktree(id, &self.locks, cancel)
    }

    /// Fetch the environment branch tip into a user-repo-visible
    /// remote-tracking ref (`refs/remotes/container-use/<id>`) so merge/diff
    /// commands can reference `container-use/<id>` without relying on a
    /// configured wildcard fetch refspec.
    fn sync_remote_tracking_ref(&self, id: &str, cancel: &CancellationToken) -> Result<()> {
        let fork = self.fork_manager.fork();
        let refspec = format!("{id}:refs/remotes/{}/{id}", crate::fork::REMOTE_NAME);
        self.driver()
            .captured(
                self.user_repo(),
                &["fetch", "-q", fork.to_string_lossy().as_ref(), &refspec],
                None,
                EnvMode::Inherit,
                cancel,
            )
            .map_err(|e| Error::from_git("fetch environment branch into user repo", e))?;
        Ok(())
    }

    /// Unified diff between the user repo's current HEAD and the
    /// environment's branch tip.
    pub fn diff(&self, id: &str, cancel: &CancellationToken) -> Result<String> {
        self.sync_remote_tracking_ref(id, cancel)?;
        let remote_ref = format!("{}/{id}", crate::fork::REMOTE_NAME);
        let out = self
            .driver()
            .captured(self.user_repo(), &["diff", "HEAD", &remote_ref], None, EnvMode::Inherit, cancel)
            .map_err(|e| Error::from_git("diff against environment", e))?;
        Ok(out.stdout)
    }

    /// The environment branch's commit log.
    pub fn log(&self, id: &str, cancel: &CancellationToken) -> Result<String> {
        self.sync_remote_tracking_ref(id, cancel)?;
        let remote_ref = format!("{}/{id}", crate::fork::REMOTE_NAME);
        let out = self
            .driver()
            .captured(self.user_repo(), &["log", "--oneline", &remote_ref], None, EnvMode::Inherit, cancel)
            .map_err(|e| Error::from_git("log environment branch", e))?;
        Ok(out.stdout)
    }

    /// Create (on first use) a local tracking branch `<id>` and switch to
    /// it, fast-forwarding only when the local branch is strictly behind
    /// the remote environment branch. Mixed ahead/behind is reported, not
    /// silently merged — the branch name is returned alongside the error so
    /// callers can still show "checked out <id>, but N commits diverged".
    pub fn checkout(&self, id: &str, cancel: &CancellationToken) -> Result<String> {
        self.sync_remote_tracking_ref(id, cancel)?;
        let remote_ref = format!("{}/{id}", crate::fork::REMOTE_NAME);

        let local_exists = self
            .driver()
            .captured(
                self.user_repo(),
                &["show-ref", "--verify", "--quiet", &format!("refs/heads/{id}")],
                Some(PROBE_TIMEOUT),
                EnvMode::Inherit,
                cancel,
            )
            .is_ok();

        if !local_exists {
            self.driver()
                .captured(self.user_repo(), &["checkout", "-q", "-b", id, &remote_ref], None, EnvMode::Inherit, cancel)
                .map_err(|e| Error::from_git("create local tracking branch", e))?;
            return Ok(id.to_owned());
        }

        self.driver()
            .captured(self.user_repo(), &["checkout", "-q", id], None, EnvMode::Inherit, cancel)
            .map_err(|e| Error::from_git("switch to local tracking branch", e))?;

        let ahead_behind = self
            .driver()
            .captured(
                self.user_repo(),
                &["rev-list", "--left-right", "--count", &format!("{id}...{remote_ref}")],
                Some(PROBE_TIMEOUT),
                EnvMode::Inherit,
                cancel,
            )
            .map_err(|e| Error::from_git("compare local and remote environment branch", e))?;
        let mut parts = ahead_behind.stdout.split_whitespace();
        let ahead: u64 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
        let behind: u64 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);

        if behind > 0 && ahead == 0 {
            self.driver()
                .captured(self.user_repo(), &["merge", "-q", "--ff-only", &remote_ref], None, EnvMode::Inherit, cancel)
                .map_err(|e| Error::from_git("fast-forward local tracking branch", e))?;
        } else if behind > 0 && ahead > 0 {
            return Err(Error::GitCommandFailed {
                operation: format!("checkout {id}"),
                source: cu_git::GitError::CommandFailed {
                    args: vec!["merge".to_owned(), "--ff-only".to_owned()],
                    exit_code: Some(1),
                    stderr: format!(
                        "local branch {id} is {ahead} ahead and {behind} behind {remote_ref}; refusing to fast-forward"
                    ),
                },
            });
        }
        Ok(id.to_owned())
    }

    /// `git merge --no-ff --autostash -m "Merge environment <id>" container-use/<id>`.
    pub fn merge(&self, id: &str, cancel: &CancellationToken) -> Result<()> {
        self.sync_remote_tracking_ref(id, cancel)?;
        let remote_ref = format!("{}/{id}", crate::fork::REMOTE_NAME);
        self.driver()
            .captured(
                self.user_repo(),
                &[
                    "merge",
                    "--no-ff",
                    "--autostash",
                    "-m",
                    &format!("Merge environment {id}"),
                    &remote_ref,
                ],
                None,
                EnvMode::Inherit,
                cancel,
            )
            .map_err(|e| Error::from_git("merge environment", e))?;
        Ok(())
    }

    /// Repeated squash merges using the `theirs` strategy, so the same
    /// environment can be re-merged without manual conflict resolution.
    pub fn merge_squash(&self, id: &str, cancel: &CancellationToken) -> Result<()> {
        self.sync_remote_tracking_ref(id, cancel)?;
        let remote_ref = format!("{}/{id}", crate::fork::REMOTE_NAME);
        self.driver()
            .captured(
                self.user_repo(),
                &["merge", "--squash", "-X", "theirs", &remote_ref],
                None,
                EnvMode::Inherit,
                cancel,
            )
            .map_err(|e| Error::from_git("squash-merge environment", e))?;
        let dirty = self
            .driver()
            .captured(self.user_repo(), &["status", "--porcelain"], Some(PROBE_TIMEOUT), EnvMode::Inherit, cancel)
            .map_err(|e| Error::from_git("check user repo status after squash merge", e))?;
        if !dirty.stdout.trim().is_empty() {
            self.driver()
                .captured(
                    self.user_repo(),
                    &["commit", "-q", "-m", &format!("Merge environment {id} (squash)")],
                    None,
                    EnvMode::Inherit,
                    cancel,
                )
                .map_err(|e| Error::from_git("commit squash merge", e))?;
        }
        Ok(())
    }

    /// Merge an environment into the user's working tree while preserving
    /// any unstaged user edits (§4.9). See the module doc for the exact
    /// five-step sequence; the short version:
    ///
    /// 1. Snapshot the unstaged diff and a safety stash.
    /// 2. Hard-reset to HEAD.
    /// 3. `git merge --squash` the environment branch.
    /// 4. If there was an unstaged diff, thread it back through a temporary
    ///    commit + `git apply` + a `reset --soft HEAD~1` so it ends up
    ///    unstaged again, with the squashed merge left staged.
    ///
    /// Any failure after the safety stash is created surfaces its sha in
    /// the error message (`git stash apply <sha>`), per §7.
    #[instrument(skip(self, cancel), fields(env_id = id))]
    pub fn apply(&self, id: &str, cancel: &CancellationToken) -> Result<()> {
        self.sync_remote_tracking_ref(id, cancel)?;
        let remote_ref = format!("{}/{id}", crate::fork::REMOTE_NAME);
        let repo = self.user_repo();

        // Step 1: snapshot the unstaged diff.
        let unstaged_diff = self
            .driver()
            .captured(repo, &["diff"], None, EnvMode::Inherit, cancel)
            .map_err(|e| Error::from_git("snapshot unstaged diff", e))?
            .stdout;
        let has_unstaged = !unstaged_diff.trim().is_empty();

        // Step 2: safety stash (does not touch the index or working tree).
        let stash_sha = self
            .driver()
            .captured(repo, &["stash", "create"], None, EnvMode::Inherit, cancel)
            .map_err(|e| Error::from_git("create safety stash", e))?
            .stdout
            .trim()
            .to_owned();
        let stash_hint = if stash_sha.is_empty() {
            None
        } else {
            Some(format!("git stash apply {stash_sha}"))
        };

        // Step 3: hard-reset the working tree to HEAD.
        if let Err(err) = self
            .driver()
            .captured(repo, &["reset", "--hard", "HEAD"], None, EnvMode::Inherit, cancel)
        {
            return Err(apply_failed("reset working tree to HEAD", &err, stash_hint.as_deref()));
        }

        // Step 4: squash-merge the environment branch.
        if let Err(err) = self
            .driver()
            .captured(repo, &["merge", "--squash", &remote_ref], None, EnvMode::Inherit, cancel)
        {
            return Err(apply_failed("merge --squash environment branch", &err, stash_hint.as_deref()));
        }

        if !has_unstaged {
            return Ok(());
        }

        // Step 5: thread the user's unstaged diff back through a temporary
        // commit so the net effect is: staged = agent squash, unstaged =
        // user's original edits, HEAD unchanged.
        if let Err(err) = self
            .driver()
            .captured(repo, &["commit", "-q", "-m", "container-use: temporary apply commit"], None, EnvMode::Inherit, cancel)
        {
            return Err(apply_failed("commit squashed changes", &err, stash_hint.as_deref()));
        }
        if let Err(err) = self.driver().captured_with_stdin(
            repo,
            &["apply"],
            unstaged_diff.as_bytes(),
            None,
            EnvMode::Inherit,
            cancel,
        ) {
            return Err(apply_failed("reapply saved unstaged diff", &err, stash_hint.as_deref()));
        }
        if let Err(err) = self.driver().captured(repo, &["reset"], None, EnvMode::Inherit, cancel) {
            return Err(apply_failed("unstage after reapplying diff", &err, stash_hint.as_deref()));
        }
        if let Err(err) = self
            .driver()
            .captured(repo, &["reset", "--soft", "HEAD~1"], None, EnvMode::Inherit, cancel)
        {
            return Err(apply_failed("fold temporary commit back into staged changes", &err, stash_hint.as_deref()));
        }

        Ok(())
    }
}

fn apply_failed(stage: &str, source: &cu_git::GitError, stash_hint: Option<&str>) -> Error {
    warn!(stage, %source, "apply failed; surfacing stash recovery hint");
    let detail = match stash_hint {
        Some(hint) => format!("apply failed during {stage}: {source}; to restore your pending changes run: {hint}"),
        None => format!("apply failed during {stage}: {source}"),
    };
    Error::ApplyFailed { detail }
}

fn materialize_tree(worktree: &Path, files: &[crate::engine::ExportedFile]) -> Result<()> {
    clear_tracked_contents(worktree)?;
    for file in files {
        let target = worktree.join(&file.path);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::io("create worktree parent directory", e))?;
        }
        std::fs::write(&target, &file.contents).map_err(|e| Error::io("write propagated file", e))?;
    }
    Ok(())
}

/// Remove everything in `worktree` except `.git`, so a file deleted in the
/// container is reflected as deleted in the worktree too.
fn clear_tracked_contents(worktree: &Path) -> Result<()> {
    let Ok(entries) = std::fs::read_dir(worktree) else {
        return Ok(());
    };
    for entry in entries.flatten() {
        if entry.file_name() == std::ffi::OsStr::new(".git") {
            continue;
        }
        let path = entry.path();
        if path.is_dir() {
            std::fs::remove_dir_all(&path).map_err(|e| Error::io("clear worktree directory", e))?;
        } else {
            std::fs::remove_file(&path).map_err(|e| Error::io("clear worktree file", e))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::local::LocalContainerEngine;

    fn init_user_repo(dir: &Path) {
        let driver = GitDriver::new();
        let cancel = CancellationToken::new();
        driver.captured(dir, &["init", "-q", "-b", "main"], None, EnvMode::Isolated, &cancel).unwrap();
        std::fs::write(dir.join("README.md"), "hello\n").unwrap();
        driver.captured(dir, &["add", "."], None, EnvMode::Isolated, &cancel).unwrap();
        driver
            .captured(dir, &["commit", "-q", "-m", "initial"], None, EnvMode::Isolated, &cancel)
            .unwrap();
    }

    fn make_coordinator(user_dir: &Path, base_dir: &Path) -> RepositoryCoordinator {
        let engine: Arc<dyn ContainerEngine> = Arc::new(LocalContainerEngine::new(base_dir.join("containers")));
        RepositoryCoordinator::for_repo(base_dir, user_dir, engine)
    }

    #[test]
    fn create_write_read_scenario() {
        let user_dir = tempfile::tempdir().unwrap();
        let base_dir = tempfile::tempdir().unwrap();
        init_user_repo(user_dir.path());
        let coordinator = make_coordinator(user_dir.path(), base_dir.path());
        let cancel = CancellationToken::new();
        let config = EnvironmentConfig::default();

        let id = coordinator.create("e1 test", &config, &cancel).unwrap();
        let worktree = ForkManager::worktree_path(base_dir.path(), &id);
        assert!(worktree.join("README.md").exists());

        let states = coordinator.list(&cancel).unwrap();
        assert!(states.iter().any(|s| s.id == id));
    }

    #[test]
    fn run_command_failure_advances_branch_by_one_commit() {
        let user_dir = tempfile::tempdir().unwrap();
        let base_dir = tempfile::tempdir().unwrap();
        init_user_repo(user_dir.path());
        let coordinator = make_coordinator(user_dir.path(), base_dir.path());
        let cancel = CancellationToken::new();
        let config = EnvironmentConfig::default();

        let id = coordinator.create("e1", &config, &cancel).unwrap();
        let worktree = ForkManager::worktree_path(base_dir.path(), &id);
        let before = GitDriver::new()
            .captured(&worktree, &["rev-list", "--count", "HEAD"], None, EnvMode::Isolated, &cancel)
            .unwrap()
            .stdout;

        let env = Environment::from_persisted(
            id.clone(),
            Arc::new(LocalContainerEngine::new(base_dir.path().join("containers"))),
            coordinator.list(&cancel).unwrap()[0]
                .history
                .last()
                .unwrap()
                .handle
                .clone(),
            &coordinator.list(&cancel).unwrap()[0],
        );
        let output = env.run("sh", "exit 3", "deliberate failure", None, &cancel).unwrap();
        assert!(output.contains("exit code 3"));
        coordinator.propagate(&id, &env, &cancel).unwrap();

        let after = GitDriver::new()
            .captured(&worktree, &["rev-list", "--count", "HEAD"], None, EnvMode::Isolated, &cancel)
            .unwrap()
            .stdout;
        let before_n: u64 = before.trim().parse().unwrap();
        let after_n: u64 = after.trim().parse().unwrap();
        assert_eq!(after_n, before_n + 1, "a failed command still records a revision and must advance the branch by one commit");
    }

    #[test]
    fn apply_preserves_unstaged_user_edits() {
        let user_dir = tempfile::tempdir().unwrap();
        let base_dir = tempfile::tempdir().unwrap();
        init_user_repo(user_dir.path());
        let coordinator = make_coordinator(user_dir.path(), base_dir.path());
        let cancel = CancellationToken::new();
        let config = EnvironmentConfig::default();

        let id = coordinator.create("e1", &config, &cancel).unwrap();
        let worktree = ForkManager::worktree_path(base_dir.path(), &id);
        std::fs::write(worktree.join("NEW.md"), "added by agent\n").unwrap();
        let driver = GitDriver::new();
        driver.captured(&worktree, &["add", "-A"], None, EnvMode::Isolated, &cancel).unwrap();
        driver
            .captured(&worktree, &["commit", "-q", "-m", "agent added NEW.md"], None, EnvMode::Isolated, &cancel)
            .unwrap();

        let head_before = driver
            .captured(user_dir.path(), &["rev-parse", "HEAD"], None, EnvMode::Inherit, &cancel)
            .unwrap()
            .stdout;

        std::fs::write(user_dir.path().join("README.md"), "hello\nedited by user\n").unwrap();

        coordinator.apply(&id, &cancel).unwrap();

        let head_after = driver
            .captured(user_dir.path(), &["rev-parse", "HEAD"], None, EnvMode::Inherit, &cancel)
            .unwrap()
            .stdout;
        assert_eq!(head_before, head_after, "HEAD must be unchanged after apply");

        assert!(user_dir.path().join("NEW.md").exists());
        let staged = driver
            .captured(user_dir.path(), &["diff", "--cached", "--name-only"], None, EnvMode::Inherit, &cancel)
            .unwrap()
            .stdout;
        assert!(staged.contains("NEW.md"));

        let unstaged = driver
            .captured(user_dir.path(), &["diff", "--name-only"], None, EnvMode::Inherit, &cancel)
            .unwrap()
            .stdout;
        assert!(unstaged.contains("README.md"));

        let readme = std::fs::read_to_string(user_dir.path().join("README.md")).unwrap();
        assert!(readme.contains("edited by user"));
    }

    #[test]
    fn list_descendants_filters_by_ancestry() {
        let user_dir = tempfile::tempdir().unwrap();
        let base_dir = tempfile::tempdir().unwrap();
        init_user_repo(user_dir.path());
        let coordinator = make_coordinator(user_dir.path(), base_dir.path());
        let cancel = CancellationToken::new();
        let config = EnvironmentConfig::default();

        let driver = GitDriver::new();
        let head = driver
            .captured(user_dir.path(), &["rev-parse", "HEAD"], None, EnvMode::Inherit, &cancel)
            .unwrap()
            .stdout
            .trim()
            .to_owned();

        let id = coordinator.create("e1", &config, &cancel).unwrap();
        let descendants = coordinator.list_descendants(&head, &cancel).unwrap();
        assert!(descendants.iter().any(|s| s.id == id));

        let unrelated = coordinator.list_descendants("4b825dc642cb6eb9a060e54bf8d69288fbee4904", &cancel);
        // The empty-tree sha is never a real commit, so this is a
        // not-an-ancestor check, not a not-found crash.
        assert!(unrelated.is_ok());
    }
}

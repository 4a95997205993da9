//! Reads and writes the two parallel git-notes refs on the fork: the
//! human-readable step log (`refs/notes/container-use`) and the
//! machine-readable environment state (`refs/notes/container-use-state`).

use std::path::Path;

use cu_git::{EnvMode, GitDriver};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::error::{Error, Result};
use crate::lock::{LockClass, LockManager};

/// Notes ref holding the human-readable step log.
pub const LOG_NOTES_REF: &str = "refs/notes/container-use";
/// Notes ref holding the machine-readable environment state.
pub const STATE_NOTES_REF: &str = "refs/notes/container-use-state";

/// The serialized, machine-readable state attached to an environment
/// branch's tip commit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentState {
    /// Short human-memorable environment id.
    pub id: String,
    /// Free-text title, settable by the agent or operator.
    pub title: String,
    /// RFC 3339 timestamp of the last recorded update.
    pub updated_at: String,
    /// The branch this environment tracks in the fork (`env/<id>` by
    /// convention, but stored explicitly since the config loader's
    /// `tracking_branch` can override it).
    pub tracked_branch: String,
    /// Paths of submodules detected at creation time, cached so later file
    /// ops don't need to re-run `git submodule foreach`.
    pub submodule_paths: Vec<String>,
    /// The setup fingerprint the container build was last keyed on.
    pub setup_fingerprint: String,
    /// The current revision count (history length), for quick display.
    pub revision_count: u64,
    /// The full revision history, so a reloaded environment can resume
    /// `revert` and history display without re-deriving it from the fork's
    /// commit log.
    pub history: Vec<crate::environment::Revision>,
}

/// Reads and writes the two notes refs on a fork repository.
pub struct StateStore<'a> {
    fork: &'a Path,
    driver: &'a GitDriver,
}

impl<'a> StateStore<'a> {
    /// Build a store bound to `fork`'s notes refs.
    #[must_use]
    pub fn new(fork: &'a Path, driver: &'a GitDriver) -> Self {
        Self { fork, driver }
    }

    /// Write (add-or-replace) the state JSON at the branch tip `sha`.
    ///
    /// Acquires the `notes` lock for the duration.
    #[instrument(skip(self, locks, cancel, state), fields(env_id = %state.id))]
    pub fn write_state(
        &self,
        user_repo: &Path,
        sha: &str,
        state: &EnvironmentState,
        locks: &LockManager,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let _guard = locks.acquire(user_repo, LockClass::Notes, cancel)?;
        let json = serde_json::to_string_pretty(state).map_err(|e| Error::ConfigMalformed {
            path: STATE_NOTES_REF.to_owned(),
            reason: e.to_string(),
        })?;
        self.driver
            .captured_with_stdin(
                self.fork,
                &["notes", "--ref", STATE_NOTES_REF, "add", "-f", "-F", "-", sha],
                json.as_bytes(),
                None,
                EnvMode::Isolated,
                cancel,
            )
            .map_err(|e| Error::from_git("write environment state note", e))?;
        Ok(())
    }

    /// Append a free-form log line at the branch tip `sha`.
    ///
    /// Acquires the `notes` lock for the duration.
    pub fn append_log(
        &self,
        user_repo: &Path,
        sha: &str,
        message: &str,
        locks: &LockManager,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let _guard = locks.acquire(user_repo, LockClass::Notes, cancel)?;
        self.driver
            .captured_with_stdin(
                self.fork,
                &["notes", "--ref", LOG_NOTES_REF, "append", "-F", "-", sha],
                message.as_bytes(),
                None,
                EnvMode::Isolated,
                cancel,
            )
            .map_err(|e| Error::from_git("append environment log note", e))?;
        Ok(())
    }

    /// Read the state note at `sha`, lenient per §4.4: a missing ref,
    /// missing note, or invalid JSON all yield `None` rather than an error
    /// (this is how `List` filters non-environment branches on the fork).
    #[must_use]
    pub fn read_state(&self, sha: &str, cancel: &CancellationToken) -> Option<EnvironmentState> {
        let out = self
            .driver
            .captured(
                self.fork,
                &["notes", "--ref", STATE_NOTES_REF, "show", sha],
                None,
                EnvMode::Isolated,
                cancel,
            )
            .ok()?;
        match serde_json::from_str(&out.stdout) {
            Ok(state) => Some(state),
            Err(err) => {
                debug!(sha, %err, "state note present but failed to parse; treating as non-environment");
                None
            }
        }
    }

    /// Read the full human-readable log at `sha`, if any.
    #[must_use]
    pub fn read_log(&self, sha: &str, cancel: &CancellationToken) -> Option<String> {
        self.driver
            .captured(
                self.fork,
                &["notes", "--ref", LOG_NOTES_REF, "show", sha],
                None,
                EnvMode::Isolated,
                cancel,
            )
            .ok()
            .map(|o| o.stdout)
    }
}

/// `true` if `ref_name` looks like one of our fixed notes refs (used by
/// `List` to skip them when enumerating environment branches).
#[must_use]
pub fn is_notes_ref(ref_name: &str) -> bool {
    ref_name == LOG_NOTES_REF || ref_name == STATE_NOTES_REF
}

/// Render the current instant as RFC 3339, for `updated_at` stamping.
///
/// Not `const fn` — relies on the system clock — but deliberately isolated
/// here so callers can't accidentally read the clock from deep inside
/// environment logic without going through one obvious seam.
#[must_use]
pub fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|err| {
            warn!(%err, "failed to format current time as RFC 3339");
            String::from("1970-01-01T00:00:00Z")
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cu_git::GitDriver;

    fn init_bare(dir: &Path, cancel: &CancellationToken) -> GitDriver {
        let driver = GitDriver::new();
        driver.captured(dir, &["init", "--bare", "-q"], None, EnvMode::Isolated, cancel).unwrap();
        driver
    }

    fn commit_on_branch(fork: &Path, driver: &GitDriver, branch: &str, cancel: &CancellationToken) -> String {
        // Build a commit directly with plumbing since the fork is bare.
        let empty_tree = driver
            .captured(fork, &["hash-object", "-t", "tree", "/dev/null"], None, EnvMode::Isolated, cancel)
            .unwrap()
            .stdout
            .trim()
            .to_owned();
        let commit = driver
            .captured(
                fork,
                &["commit-tree", &empty_tree, "-m", "seed"],
                None,
                EnvMode::Isolated,
                cancel,
            )
            .unwrap()
            .stdout
            .trim()
            .to_owned();
        driver
            .captured(fork, &["branch", "-f", branch, &commit], None, EnvMode::Isolated, cancel)
            .unwrap();
        commit
    }

    #[test]
    fn write_then_read_state_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let driver = init_bare(dir.path(), &cancel);
        let sha = commit_on_branch(dir.path(), &driver, "e1", &cancel);

        let locks = LockManager::new(dir.path().join("locks"));
        let store = StateStore::new(dir.path(), &driver);
        let state = EnvironmentState {
            id: "e1".to_owned(),
            title: "test env".to_owned(),
            updated_at: now_rfc3339(),
            tracked_branch: "env/e1".to_owned(),
            submodule_paths: Vec::new(),
            setup_fingerprint: "abc123".to_owned(),
            revision_count: 1,
            history: Vec::new(),
        };
        store.write_state(dir.path(), &sha, &state, &locks, &cancel).unwrap();

        let read_back = store.read_state(&sha, &cancel).unwrap();
        assert_eq!(read_back, state);
    }

    #[test]
    fn missing_note_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let driver = init_bare(dir.path(), &cancel);
        let sha = commit_on_branch(dir.path(), &driver, "e1", &cancel);

        let store = StateStore::new(dir.path(), &driver);
        assert!(store.read_state(&sha, &cancel).is_none());
    }

    #[test]
    fn append_log_accumulates_lines() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let driver = init_bare(dir.path(), &cancel);
        let sha = commit_on_branch(dir.path(), &driver, "e1", &cancel);
        let locks = LockManager::new(dir.path().join("locks"));
        let store = StateStore::new(dir.path(), &driver);

        store.append_log(dir.path(), &sha, "wrote hello.txt", &locks, &cancel).unwrap();
        store.append_log(dir.path(), &sha, "ran tests", &locks, &cancel).unwrap();

        let log = store.read_log(&sha, &cancel).unwrap();
        assert!(log.contains("wrote hello.txt"));
        assert!(log.contains("ran tests"));
    }
}

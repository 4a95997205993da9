//! Behavioral tests for `GitDriver` against real `git` subprocesses.
//!
//! Unlike the inline unit tests in `src/driver.rs`, these exercise the
//! driver the way `cu-core` actually uses it: against a real repository on
//! disk, with no mocking of the `git` binary itself.

use std::process::Command;
use std::time::Duration;

use cu_git::{EnvMode, GitDriver, GitError};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn init_repo() -> TempDir {
    let dir = TempDir::new().expect("tempdir");
    let run = |args: &[&str]| {
        let status = Command::new("git")
            .args(args)
            .current_dir(dir.path())
            .status()
            .expect("spawn git");
        assert!(status.success(), "git {args:?} failed");
    };
    run(&["init", "-q"]);
    run(&["config", "user.email", "test@example.com"]);
    run(&["config", "user.name", "Test"]);
    std::fs::write(dir.path().join("README.md"), "hello\n").expect("write");
    run(&["add", "."]);
    run(&["commit", "-q", "-m", "initial"]);
    dir
}

#[test]
fn captured_output_reports_stdout_and_success() {
    let dir = init_repo();
    let driver = GitDriver::new();
    let cancel = CancellationToken::new();
    let output = driver
        .captured(
            dir.path(),
            &["log", "--format=%s", "-1"],
            None,
            EnvMode::Isolated,
            &cancel,
        )
        .expect("git log");
    assert_eq!(output.stdout.trim(), "initial");
}

#[test]
fn captured_output_fails_on_nonzero_exit_with_stderr() {
    let dir = init_repo();
    let driver = GitDriver::new();
    let cancel = CancellationToken::new();
    let err = driver
        .captured(
            dir.path(),
            &["show", "nonexistent-ref"],
            None,
            EnvMode::Isolated,
            &cancel,
        )
        .expect_err("unresolvable ref must fail");
    match err {
        GitError::CommandFailed { stderr, .. } => assert!(!stderr.is_empty()),
        other => panic!("expected CommandFailed, got {other:?}"),
    }
}

#[test]
fn cancellation_token_aborts_before_spawn_effects_are_observed() {
    let dir = init_repo();
    let driver = GitDriver::new();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = driver
        .captured(dir.path(), &["log"], None, EnvMode::Isolated, &cancel)
        .expect_err("a pre-cancelled token must short-circuit");
    assert!(matches!(err, GitError::Cancelled { .. }));
}

#[test]
fn not_a_repository_is_classified_distinctly() {
    let dir = TempDir::new().expect("tempdir");
    let driver = GitDriver::new();
    let cancel = CancellationToken::new();
    let err = driver
        .captured(
            dir.path(),
            &["rev-parse", "--show-toplevel"],
            None,
            EnvMode::Isolated,
            &cancel,
        )
        .expect_err("a bare temp dir is not a git repository");
    assert!(err.is_not_a_repository());
}

#[test]
fn isolated_env_mode_disables_hooks_for_automated_commits() {
    let dir = init_repo();
    let hook_path = dir.path().join(".git/hooks/pre-commit");
    std::fs::write(&hook_path, "#!/bin/sh\nexit 1\n").expect("write hook");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        let mut perms = std::fs::metadata(&hook_path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&hook_path, perms).unwrap();
    }

    std::fs::write(dir.path().join("new.txt"), "x\n").expect("write");
    let driver = GitDriver::new();
    let cancel = CancellationToken::new();
    driver
        .captured(dir.path(), &["add", "."], None, EnvMode::Isolated, &cancel)
        .expect("add");
    // If the hook ran, this commit would fail with exit 1.
    driver
        .captured(
            dir.path(),
            &["commit", "-q", "-m", "second"],
            None,
            EnvMode::Isolated,
            &cancel,
        )
        .expect("commit must succeed because the failing hook is bypassed");
}

#[test]
fn timeout_kills_a_blocking_command() {
    let dir = init_repo();
    let driver = GitDriver::new();
    let cancel = CancellationToken::new();
    let err = driver
        .captured(
            dir.path(),
            &["hash-object", "--stdin"],
            Some(Duration::from_millis(50)),
            EnvMode::Isolated,
            &cancel,
        )
        .expect_err("reading from stdin with no input must hang until the timeout");
    assert!(matches!(err, GitError::Timeout { .. }));
}

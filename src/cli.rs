//! Command-line surface (§6). Deliberately thin: every subcommand loads
//! the repo's [`EnvironmentConfig`], builds a [`RepositoryCoordinator`],
//! and calls straight through to it. No business logic lives here.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cu_core::engine::local::LocalContainerEngine;
use cu_core::engine::ContainerEngine;
use cu_core::{EnvironmentConfig, RepositoryCoordinator};
use tokio_util::sync::CancellationToken;

/// Containerized, git-backed environments for autonomous coding agents.
///
/// Each environment is a branch + worktree pair on a hidden fork of your
/// repository, with its container state snapshotted into git notes after
/// every step. Work happens inside the environment; `apply`, `merge`, and
/// `merge-squash` bring it back into your checkout.
#[derive(Parser)]
#[command(name = "cu")]
#[command(version, about)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a new environment from the current HEAD.
    Create {
        /// Free-text description, recorded as the first revision's explanation.
        description: String,
    },
    /// List environments, most recently updated first.
    List,
    /// Run a foreground command inside an environment, recording a revision.
    Run {
        /// Environment id.
        id: String,
        /// Command to run with `sh -c`; a non-zero exit is printed, not an error.
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },
    /// Show the diagnostics snapshot: fork branches with missing state
    /// notes or worktrees out of sync with their branch tip.
    Doctor,
    /// Check out an environment's branch locally.
    Checkout {
        /// Environment id.
        id: String,
    },
    /// Show the diff between HEAD and an environment's branch tip.
    Diff {
        /// Environment id.
        id: String,
    },
    /// Show an environment's commit log.
    Log {
        /// Environment id.
        id: String,
    },
    /// Merge an environment with `--no-ff --autostash`.
    Merge {
        /// Environment id.
        id: String,
    },
    /// Squash-merge an environment, re-mergeable without manual conflicts.
    MergeSquash {
        /// Environment id.
        id: String,
    },
    /// Merge an environment while preserving unstaged working-tree edits.
    Apply {
        /// Environment id.
        id: String,
    },
    /// Remove an environment's worktree and branch.
    Delete {
        /// Environment id.
        id: String,
    },
}

/// Run the parsed command against the current directory's repository.
pub fn run(cli: Cli) -> Result<()> {
    let cancel = CancellationToken::new();
    let cwd = std::env::current_dir().context("resolve current directory")?;
    let base_dir = crate::paths::base_dir()?;
    let engine: Arc<dyn ContainerEngine> = Arc::new(LocalContainerEngine::new(base_dir.join("containers")));
    let coordinator = RepositoryCoordinator::open(&base_dir, &cwd, engine.clone(), &cancel)?;

    match cli.command {
        Commands::Create { description } => {
            let config = EnvironmentConfig::load(coordinator.repo_root())?;
            let id = coordinator.create(&description, &config, &cancel)?;
            println!("{id}");
        }
        Commands::List => {
            for state in coordinator.list(&cancel)? {
                println!("{}\t{}\t{}", state.id, state.updated_at, state.title);
            }
        }
        Commands::Run { id, command } => {
            let states = coordinator.list(&cancel)?;
            let state = states
                .iter()
                .find(|s| s.id == id)
                .with_context(|| format!("environment {id:?} not found"))?;
            let handle = state
                .history
                .last()
                .with_context(|| format!("environment {id:?} has no recorded revisions"))?
                .handle
                .clone();
            let environment = cu_core::Environment::from_persisted(id.clone(), engine.clone(), handle, state);
            let joined = command.join(" ");
            let output = environment.run("sh", &joined, "cu run", None, &cancel)?;
            coordinator.propagate(&id, &environment, &cancel)?;
            print!("{output}");
        }
        Commands::Doctor => {
            for entry in coordinator.diagnose(&cancel)? {
                let status = match (entry.has_state_note, entry.worktree_exists, entry.worktree_matches_tip) {
                    (false, _, _) => "not an environment (no state note)",
                    (true, false, _) => "missing worktree",
                    (true, true, false) => "worktree out of sync with branch tip",
                    (true, true, true) => "ok",
                };
                println!("{}\t{status}", entry.branch);
            }
        }
        Commands::Checkout { id } => {
            let branch = coordinator.checkout(&id, &cancel)?;
            println!("checked out {branch}");
        }
        Commands::Diff { id } => {
            print!("{}", coordinator.diff(&id, &cancel)?);
        }
        Commands::Log { id } => {
            print!("{}", coordinator.log(&id, &cancel)?);
        }
        Commands::Merge { id } => {
            coordinator.merge(&id, &cancel)?;
            println!("merged {id}");
        }
        Commands::MergeSquash { id } => {
            coordinator.merge_squash(&id, &cancel)?;
            println!("squash-merged {id}");
        }
        Commands::Apply { id } => {
            coordinator.apply(&id, &cancel)?;
            println!("applied {id}");
        }
        Commands::Delete { id } => {
            coordinator.delete(&id, &cancel)?;
            println!("deleted {id}");
        }
    }
    Ok(())
}

//! Core domain logic for containerized, git-backed agent workspaces:
//! environments, forks, locks, notes-based state, and the apply/merge
//! workflow that reconciles an environment's work back into the user's
//! repository.
//!
//! [`coordinator::RepositoryCoordinator`] is the top-level entry point;
//! everything else in this crate is composed underneath it.

pub mod config;
pub mod coordinator;
pub mod engine;
pub mod environment;
pub mod error;
pub mod fork;
pub mod ids;
pub mod lock;
pub mod secret;
pub mod state;

pub use config::EnvironmentConfig;
pub use coordinator::{Diagnostic, RepositoryCoordinator};
pub use engine::{BackgroundHandle, BuildSpec, ContainerEngine, ContainerState, ExportedFile, PortBinding, SetupStepResult};
pub use environment::{Environment, Revision};
pub use error::{Error, Result};
pub use fork::ForkManager;
pub use lock::{LockClass, LockGuard, LockManager};
pub use secret::{SecretRef, SecretSpec};
pub use state::{EnvironmentState, StateStore};

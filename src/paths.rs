//! Resolves the base directory under which forks, worktrees, and locks
//! live (§6): a platform config-home subdirectory, overridable via
//! `CONTAINER_USE_HOME`.

use std::path::PathBuf;

const HOME_ENV_VAR: &str = "CONTAINER_USE_HOME";

/// Resolve the base directory, creating it if absent.
///
/// # Errors
/// Returns an error if neither `CONTAINER_USE_HOME` nor a platform config
/// directory can be determined, or if the directory cannot be created.
pub fn base_dir() -> anyhow::Result<PathBuf> {
    let dir = if let Ok(override_dir) = std::env::var(HOME_ENV_VAR) {
        PathBuf::from(override_dir)
    } else {
        dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("could not determine a config directory; set {HOME_ENV_VAR}"))?
            .join("container-use")
    };
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

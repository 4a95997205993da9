//! Loads and saves per-repo environment configuration from
//! `<user-repo>/.container-use/`.
//!
//! Loading is best-effort for absence (missing files yield defaults) but
//! strict for malformance (unknown fields or bad JSON are a hard error).
//! Saving is atomic (write to a temp file, then rename) and never escapes
//! shell metacharacters in setup commands.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::secret::SecretSpec;

/// Directory name under the user repo that holds environment configuration.
pub const CONFIG_DIR: &str = ".container-use";
const CONFIG_FILE: &str = "environment.json";
const INSTRUCTIONS_FILE: &str = "AGENT.md";

/// Pinned default base image used when `environment.json` is absent or
/// omits `base_image`.
pub const DEFAULT_BASE_IMAGE: &str = "ghcr.io/container-use/base:2026-01-stable";
/// Default container workdir.
pub const DEFAULT_WORKDIR: &str = "/workdir";

/// The on-disk shape of `environment.json`. Unknown fields are rejected
/// (`#[serde(deny_unknown_fields)]`): a malformed or half-migrated config
/// file must fail loudly rather than silently drop fields.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default = "default_base_image")]
    base_image: String,
    #[serde(default = "default_workdir")]
    workdir: String,
    #[serde(default)]
    env: Vec<(String, String)>,
    #[serde(default)]
    setup_commands: Vec<String>,
    #[serde(default)]
    secrets: Vec<String>,
    #[serde(default)]
    tracking_branch: Option<String>,
}

fn default_base_image() -> String {
    DEFAULT_BASE_IMAGE.to_owned()
}

fn default_workdir() -> String {
    DEFAULT_WORKDIR.to_owned()
}

impl Default for RawConfig {
    fn default() -> Self {
        Self {
            base_image: default_base_image(),
            workdir: default_workdir(),
            env: Vec::new(),
            setup_commands: Vec::new(),
            secrets: Vec::new(),
            tracking_branch: None,
        }
    }
}

/// Fully resolved environment configuration: what the container engine
/// needs to build a base image and what the coordinator needs to track a
/// branch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnvironmentConfig {
    /// The base image reference to build from.
    pub base_image: String,
    /// The workdir inside the container.
    pub workdir: String,
    /// Declared environment variables, in declaration order.
    pub env: Vec<(String, String)>,
    /// Setup commands run serially as cacheable layers.
    pub setup_commands: Vec<String>,
    /// Declared secret references.
    pub secrets: SecretSpec,
    /// Branch this repo's environments should be tracked against, if set.
    pub tracking_branch: Option<String>,
    /// Free-text agent instructions from `AGENT.md`, if present.
    pub instructions: Option<String>,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            base_image: DEFAULT_BASE_IMAGE.to_owned(),
            workdir: DEFAULT_WORKDIR.to_owned(),
            env: Vec::new(),
            setup_commands: Vec::new(),
            secrets: SecretSpec::new(),
            tracking_branch: None,
            instructions: None,
        }
    }
}

impl EnvironmentConfig {
    /// Load configuration from `<user_repo>/.container-use/`.
    ///
    /// Missing `environment.json` yields [`EnvironmentConfig::default`].
    /// Missing `AGENT.md` yields `instructions: None`. A present but
    /// malformed `environment.json` (bad JSON, unknown fields, or an
    /// invalid secret entry) is a hard [`Error::ConfigMalformed`].
    pub fn load(user_repo: &Path) -> Result<Self> {
        let config_path = user_repo.join(CONFIG_DIR).join(CONFIG_FILE);
        let raw = match std::fs::read_to_string(&config_path) {
            Ok(text) => serde_json::from_str::<RawConfig>(&text).map_err(|e| Error::ConfigMalformed {
                path: config_path.display().to_string(),
                reason: e.to_string(),
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => RawConfig::default(),
            Err(e) => return Err(Error::io("read environment.json", e)),
        };

        let mut secrets = SecretSpec::new();
        for entry in &raw.secrets {
            secrets.add(entry).map_err(|e| Error::ConfigMalformed {
                path: config_path.display().to_string(),
                reason: e.to_string(),
            })?;
        }

        let instructions_path = user_repo.join(CONFIG_DIR).join(INSTRUCTIONS_FILE);
        let instructions = match std::fs::read_to_string(&instructions_path) {
            Ok(text) => Some(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(Error::io("read AGENT.md", e)),
        };

        Ok(Self {
            base_image: raw.base_image,
            workdir: raw.workdir,
            env: raw.env,
            setup_commands: raw.setup_commands,
            secrets,
            tracking_branch: raw.tracking_branch,
            instructions,
        })
    }

    /// Atomically write `environment.json` (write to a sibling temp file,
    /// then rename over the target). Shell metacharacters in
    /// `setup_commands` (`&&`, `|`, `<`, `>`) are preserved verbatim —
    /// `serde_json` never escapes them, unlike some JS-oriented serializers
    /// that emit `&`.
    pub fn save(&self, user_repo: &Path) -> Result<()> {
        let dir = user_repo.join(CONFIG_DIR);
        std::fs::create_dir_all(&dir).map_err(|e| Error::io("create .container-use directory", e))?;
        let raw = RawConfig {
            base_image: self.base_image.clone(),
            workdir: self.workdir.clone(),
            env: self.env.clone(),
            setup_commands: self.setup_commands.clone(),
            secrets: self.secrets.entries().iter().map(crate::secret::SecretRef::to_entry).collect(),
            tracking_branch: self.tracking_branch.clone(),
        };
        let json = serde_json::to_string_pretty(&raw).map_err(|e| Error::ConfigMalformed {
            path: dir.join(CONFIG_FILE).display().to_string(),
            reason: e.to_string(),
        })?;

        let target = dir.join(CONFIG_FILE);
        let tmp_path = temp_sibling_path(&target);
        std::fs::write(&tmp_path, json.as_bytes()).map_err(|e| Error::io("write environment.json temp", e))?;
        std::fs::rename(&tmp_path, &target).map_err(|e| Error::io("rename environment.json into place", e))?;
        Ok(())
    }

    /// The setup fingerprint (§4.7): the tuple of inputs that determines
    /// whether a previously built container can be reused. Rendered as a
    /// stable string so the container engine can use it as a cache key.
    #[must_use]
    pub fn setup_fingerprint(&self, source_fingerprint: &str) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(self.base_image.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.workdir.as_bytes());
        for (k, v) in &self.env {
            hasher.update(k.as_bytes());
            hasher.update(b"=");
            hasher.update(v.as_bytes());
            hasher.update([0u8]);
        }
        for cmd in &self.setup_commands {
            hasher.update(cmd.as_bytes());
            hasher.update([0u8]);
        }
        hasher.update(source_fingerprint.as_bytes());
        let digest = hasher.finalize();
        digest.iter().take(16).map(|b| format!("{b:02x}")).collect()
    }
}

fn temp_sibling_path(target: &Path) -> PathBuf {
    let file_name = target.file_name().and_then(|n| n.to_str()).unwrap_or(CONFIG_FILE);
    target.with_file_name(format!(".{file_name}.{}.tmp", std::process::id()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_files_yield_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = EnvironmentConfig::load(dir.path()).unwrap();
        assert_eq!(config, EnvironmentConfig::default());
    }

    #[test]
    fn malformed_json_is_a_hard_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(CONFIG_DIR)).unwrap();
        std::fs::write(dir.path().join(CONFIG_DIR).join(CONFIG_FILE), "{not json").unwrap();
        let err = EnvironmentConfig::load(dir.path()).unwrap_err();
        assert!(matches!(err, Error::ConfigMalformed { .. }));
    }

    #[test]
    fn unknown_field_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(CONFIG_DIR)).unwrap();
        std::fs::write(
            dir.path().join(CONFIG_DIR).join(CONFIG_FILE),
            r#"{"base_image": "x", "bogus_field": true}"#,
        )
        .unwrap();
        let err = EnvironmentConfig::load(dir.path()).unwrap_err();
        assert!(matches!(err, Error::ConfigMalformed { .. }));
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EnvironmentConfig::default();
        config.setup_commands.push("echo hi".to_owned());
        config.secrets.add("X=env://FOO").unwrap();
        config.save(dir.path()).unwrap();

        let loaded = EnvironmentConfig::load(dir.path()).unwrap();
        assert_eq!(loaded.setup_commands, vec!["echo hi".to_owned()]);
        assert_eq!(loaded.secrets.list(), vec!["X"]);
    }

    #[test]
    fn shell_operators_survive_save_and_load_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EnvironmentConfig::default();
        let cmd = "make build && echo done | tee log.txt > out.log < in.txt".to_owned();
        config.setup_commands.push(cmd.clone());
        config.save(dir.path()).unwrap();

        let on_disk = std::fs::read_to_string(dir.path().join(CONFIG_DIR).join(CONFIG_FILE)).unwrap();
        assert!(on_disk.contains("&&"));
        assert!(on_disk.contains('|'));
        assert!(!on_disk.contains("\\u0026"));

        let loaded = EnvironmentConfig::load(dir.path()).unwrap();
        assert_eq!(loaded.setup_commands[0], cmd);
    }

    #[test]
    fn fingerprint_changes_when_setup_commands_change() {
        let mut config = EnvironmentConfig::default();
        let base = config.setup_fingerprint("src-fp");
        config.setup_commands.push("echo hi".to_owned());
        let changed = config.setup_fingerprint("src-fp");
        assert_ne!(base, changed);
    }
}

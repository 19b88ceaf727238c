//! meshlab.toml settings.
//!
//! Every field has a default, so an absent file or an empty section is
//! valid. Settings are loaded once by the binary and handed to the
//! scheduler and deployer explicitly.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::names;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub general: GeneralSettings,
    pub scheduler: SchedulerSettings,
    pub deploy: DeploySettings,
}

/// Backend names `general.backend` accepts.
pub const BACKENDS: &[&str] = &["docker", "memory"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralSettings {
    /// Backend name: "docker" or "memory".
    pub backend: String,
    /// Image used for devices without an explicit one.
    pub image: String,
    pub device_prefix: String,
    pub net_prefix: String,
    /// Shell used to run startup and shutdown scripts inside units.
    pub device_shell: String,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            backend: "docker".to_string(),
            image: "kathara/base".to_string(),
            device_prefix: "meshlab".to_string(),
            net_prefix: "meshlab".to_string(),
            device_shell: "/bin/bash".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Strategy registry key.
    pub strategy: String,
    /// Weighted affinity plus protocol hints when true, binary otherwise.
    pub semantic: bool,
    /// k-means restarts for the spectral strategy.
    pub restarts: u32,
    /// Iteration cap for iterative solvers.
    pub max_iterations: u32,
    pub seed: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            strategy: "spectral".to_string(),
            semantic: true,
            restarts: 32,
            max_iterations: 300,
            seed: 0x6d65_7368,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploySettings {
    /// Maximum number of devices provisioned concurrently.
    pub parallelism: usize,
    /// Node names exposed by the in-memory backend.
    pub memory_nodes: Vec<String>,
}

impl Default for DeploySettings {
    fn default() -> Self {
        Self {
            parallelism: 8,
            memory_nodes: vec!["node-1".to_string()],
        }
    }
}

impl Settings {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let settings: Settings = toml::from_str(&content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load `path` if it exists, otherwise fall back to defaults.
    /// Environment overrides are applied in both cases.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path.map(Path::to_path_buf).or_else(default_path);
        let mut settings = match path {
            Some(p) if p.exists() => Self::from_file(&p)?,
            _ => Self::default(),
        };
        settings.apply_env(|key| std::env::var(key).ok());
        settings.validate()?;
        Ok(settings)
    }

    /// Apply `MESHLAB_*` overrides using `lookup` to read variables.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("MESHLAB_BACKEND") {
            self.general.backend = v;
        }
        if let Some(v) = lookup("MESHLAB_IMAGE") {
            self.general.image = v;
        }
        if let Some(v) = lookup("MESHLAB_STRATEGY") {
            self.scheduler.strategy = v;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.deploy.parallelism == 0 {
            return Err(ConfigError::Invalid("deploy.parallelism must be > 0".into()));
        }
        if self.scheduler.restarts == 0 {
            return Err(ConfigError::Invalid("scheduler.restarts must be > 0".into()));
        }
        if self.scheduler.max_iterations == 0 {
            return Err(ConfigError::Invalid("scheduler.max_iterations must be > 0".into()));
        }
        for (key, prefix) in [
            ("general.device_prefix", &self.general.device_prefix),
            ("general.net_prefix", &self.general.net_prefix),
        ] {
            if !names::is_valid_prefix(prefix) {
                return Err(ConfigError::Invalid(format!("{key} `{prefix}` is not a valid prefix")));
            }
        }
        if !BACKENDS.contains(&self.general.backend.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "general.backend `{}` is not one of {}",
                self.general.backend,
                BACKENDS.join(", ")
            )));
        }
        if self.general.image.is_empty() {
            return Err(ConfigError::Invalid("general.image must not be empty".into()));
        }
        Ok(())
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))
    }
}

/// `$XDG_CONFIG_HOME/meshlab/meshlab.toml`, or `~/.config/meshlab/meshlab.toml`.
pub fn default_path() -> Option<PathBuf> {
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
    Some(base.join("meshlab").join("meshlab.toml"))
}

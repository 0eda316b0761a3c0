use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::workload::ReadinessConfig;

/// Top-level configuration for devswap.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding profiles, descriptor files and locks.
    pub state_dir: PathBuf,
    pub cluster: ClusterConfig,
    pub dev: DevConfig,
    pub sync: SyncConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            cluster: ClusterConfig::default(),
            dev: DevConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

fn default_state_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".devswap")
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("parsing config: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` when given, otherwise use built-in defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let config = Self::default();
                config.validate()?;
                Ok(config)
            }
        }
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            !self.dev.default_image.is_empty(),
            "dev.default_image must not be empty"
        );
        anyhow::ensure!(
            !self.dev.sidecar_image.is_empty(),
            "dev.sidecar_image must not be empty"
        );
        anyhow::ensure!(
            self.dev.work_dir.starts_with('/'),
            "dev.work_dir must be an absolute path"
        );
        anyhow::ensure!(
            self.dev.readiness_timeout_secs >= 1,
            "dev.readiness_timeout_secs must be >= 1"
        );
        anyhow::ensure!(
            self.dev.readiness_poll_millis >= 50,
            "dev.readiness_poll_millis must be >= 50"
        );
        anyhow::ensure!(self.sync.gui_port != 0, "sync.gui_port must not be 0");
        anyhow::ensure!(self.sync.remote_port != 0, "sync.remote_port must not be 0");
        Ok(())
    }

    pub fn readiness(&self) -> ReadinessConfig {
        ReadinessConfig {
            timeout: Duration::from_secs(self.dev.readiness_timeout_secs),
            poll_interval: Duration::from_millis(self.dev.readiness_poll_millis),
        }
    }
}

/// How to reach the cluster API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub kubectl_path: String,
    pub kubeconfig: Option<PathBuf>,
    pub context: Option<String>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            kubectl_path: "kubectl".into(),
            kubeconfig: None,
            context: None,
        }
    }
}

/// Dev container defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DevConfig {
    pub default_image: String,
    pub sidecar_image: String,
    pub work_dir: String,
    pub storage_class: Option<String>,
    pub readiness_timeout_secs: u64,
    pub readiness_poll_millis: u64,
}

impl Default for DevConfig {
    fn default() -> Self {
        Self {
            default_image: "codingcorp/minideb:latest".into(),
            sidecar_image: "codingcorp/devswap-sidecar:latest".into(),
            work_dir: "/home/devswap-dev".into(),
            storage_class: None,
            readiness_timeout_secs: 120,
            readiness_poll_millis: 500,
        }
    }
}

/// Sync engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Path to the sync engine binary started as the local helper.
    pub engine_bin: String,
    /// Local data port the engine listens on.
    pub local_port: u16,
    /// Engine port inside the sidecar, reached through the tunnel.
    pub remote_port: u16,
    /// Local REST/GUI port of the engine.
    pub gui_port: u16,
    /// API key sent with every control-endpoint request.
    pub api_key: String,
    /// Folder id registered with the engine.
    pub folder: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            engine_bin: "syncthing".into(),
            local_port: 22000,
            remote_port: 22000,
            gui_port: 8384,
            api_key: "devswap".into(),
            folder: "devswap".into(),
        }
    }
}

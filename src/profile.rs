//! Per-application profile store.
//!
//! The profile is the collaborator that makes dev sessions discoverable from
//! a later invocation: every state transition of the orchestrator lands here.
//! One JSON document per (namespace, application), written atomically via a
//! temp file and rename.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// One forwarded port pair and the helper process serving it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortForwardRecord {
    pub local_port: u16,
    pub remote_port: u16,
    pub role: String,
    pub status: String,
    pub pod_name: String,
    pub pid: u32,
    #[serde(default)]
    pub sudo: bool,
    pub updated: DateTime<Utc>,
}

/// Per-service dev session flags and endpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SvcProfile {
    pub developing: bool,
    pub syncing: bool,
    pub port_forwarded: bool,
    pub local_sync_port: u16,
    pub local_sync_gui_port: u16,
    pub remote_sync_port: u16,
    /// Name of the remote secret holding the sync engine credentials.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub sync_secret: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sync_dirs: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dev_port_forward_list: Vec<PortForwardRecord>,
}

impl SvcProfile {
    /// Clear every dev-session marker. Applied when the session ends,
    /// regardless of how cleanly the helpers went down.
    pub fn set_end_status(&mut self) {
        self.developing = false;
        self.syncing = false;
        self.port_forwarded = false;
        self.dev_port_forward_list.clear();
        self.sync_secret.clear();
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppProfile {
    /// Schema version for forward-compatible migrations.
    pub schema_version: u32,
    pub namespace: String,
    pub app: String,
    #[serde(default)]
    pub services: BTreeMap<String, SvcProfile>,
}

impl AppProfile {
    fn new(namespace: &str, app: &str) -> Self {
        Self {
            schema_version: 1,
            namespace: namespace.to_string(),
            app: app.to_string(),
            services: BTreeMap::new(),
        }
    }

    /// Fetch the profile for `service`, initializing a default one on first
    /// access.
    pub fn svc_mut(&mut self, service: &str) -> &mut SvcProfile {
        self.services.entry(service.to_string()).or_default()
    }

    pub fn svc(&self, service: &str) -> Option<&SvcProfile> {
        self.services.get(service)
    }
}

pub struct ProfileStore {
    dir: PathBuf,
}

impl ProfileStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            dir: state_dir.join("profiles"),
        }
    }

    fn path(&self, namespace: &str, app: &str) -> PathBuf {
        self.dir.join(format!("{}.{}.json", namespace, app))
    }

    /// True if a profile document exists for (namespace, app).
    pub fn exists(&self, namespace: &str, app: &str) -> bool {
        self.path(namespace, app).exists()
    }

    /// Load the profile, or a fresh default when none was persisted yet.
    pub async fn load(&self, namespace: &str, app: &str) -> Result<AppProfile> {
        let path = self.path(namespace, app);
        let data = match tokio::fs::read_to_string(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no persisted profile, starting fresh");
                return Ok(AppProfile::new(namespace, app));
            }
            Err(e) => {
                return Err(e).with_context(|| format!("reading profile: {}", path.display()))
            }
        };
        serde_json::from_str(&data)
            .with_context(|| format!("parsing profile: {}", path.display()))
    }

    pub async fn save(&self, profile: &AppProfile) -> Result<()> {
        let path = self.path(&profile.namespace, &profile.app);
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating profile directory: {}", self.dir.display()))?;

        let data =
            serde_json::to_string_pretty(profile).context("serializing profile")?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &data)
            .await
            .with_context(|| format!("writing temp profile: {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("publishing profile: {}", path.display()))?;
        Ok(())
    }

    /// Load, mutate, save. The closure sees the fetched-or-default profile.
    pub async fn update<F>(&self, namespace: &str, app: &str, mutate: F) -> Result<AppProfile>
    where
        F: FnOnce(&mut AppProfile),
    {
        let mut profile = self.load(namespace, app).await?;
        mutate(&mut profile);
        self.save(&profile).await?;
        Ok(profile)
    }
}

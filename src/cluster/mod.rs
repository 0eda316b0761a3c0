//! Cluster API access.
//!
//! The dev-mode engine only needs get / create / delete / patch on the
//! workload object (plus secret deletion for cleanup), so the surface is a
//! small trait. The production implementation drives `kubectl`, which keeps
//! auth, API discovery and server-side validation out of this crate.

pub mod objects;

#[cfg(test)]
pub(crate) mod fake;

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, trace};

use objects::PodManifest;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("{kind} {name} not found")]
    NotFound { kind: String, name: String },

    #[error("cluster api error: {0}")]
    Api(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// How a post-creation patch payload is interpreted by the API server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PatchType {
    Strategic,
    Json,
    Merge,
}

impl PatchType {
    pub fn as_str(self) -> &'static str {
        match self {
            PatchType::Strategic => "strategic",
            PatchType::Json => "json",
            PatchType::Merge => "merge",
        }
    }
}

/// A user-declared patch applied to the workload after the dev object is
/// created. Failures are best-effort by policy (see the controller).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchSpec {
    pub patch: String,
    #[serde(rename = "type")]
    pub patch_type: PatchType,
}

/// The cluster operations the transition engine depends on.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<PodManifest, ClusterError>;

    async fn create_pod(
        &self,
        namespace: &str,
        manifest: &PodManifest,
    ) -> Result<PodManifest, ClusterError>;

    /// Delete a pod with the given grace period (seconds).
    async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
        grace_period: u64,
    ) -> Result<(), ClusterError>;

    async fn patch_pod(
        &self,
        namespace: &str,
        name: &str,
        patch: &PatchSpec,
    ) -> Result<(), ClusterError>;

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;
}

/// Production client shelling out to `kubectl`.
pub struct KubectlClient {
    kubectl: PathBuf,
    kubeconfig: Option<PathBuf>,
    context: Option<String>,
}

impl KubectlClient {
    pub fn new(kubectl: PathBuf, kubeconfig: Option<PathBuf>, context: Option<String>) -> Self {
        Self {
            kubectl,
            kubeconfig,
            context,
        }
    }

    /// Run kubectl with the given arguments, optionally feeding stdin.
    /// Returns stdout on success; a non-zero exit maps stderr into the error.
    async fn run(&self, args: &[String], stdin: Option<&[u8]>) -> Result<Vec<u8>, ClusterError> {
        let mut cmd = tokio::process::Command::new(&self.kubectl);
        if let Some(kubeconfig) = &self.kubeconfig {
            cmd.arg("--kubeconfig").arg(kubeconfig);
        }
        if let Some(context) = &self.context {
            cmd.arg("--context").arg(context);
        }
        cmd.args(args);
        cmd.stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        trace!(args = ?args, "running kubectl");

        let mut child = cmd.spawn()?;
        if let Some(data) = stdin {
            let mut handle = child
                .stdin
                .take()
                .ok_or_else(|| ClusterError::Api("failed to open kubectl stdin".to_string()))?;
            handle.write_all(data).await?;
            drop(handle);
        }

        let output = child.wait_with_output().await?;
        if output.status.success() {
            return Ok(output.stdout);
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        debug!(args = ?args, stderr = %stderr, "kubectl failed");

        if stderr.contains("(NotFound)") || stderr.contains("not found") {
            // `args` always starts with the verb followed by kind and name.
            let kind = args.get(1).cloned().unwrap_or_default();
            let name = args.get(2).cloned().unwrap_or_default();
            return Err(ClusterError::NotFound { kind, name });
        }
        Err(ClusterError::Api(stderr))
    }
}

#[async_trait]
impl ClusterClient for KubectlClient {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<PodManifest, ClusterError> {
        let args = vec![
            "get".to_string(),
            "pod".to_string(),
            name.to_string(),
            "-n".to_string(),
            namespace.to_string(),
            "-o".to_string(),
            "json".to_string(),
        ];
        let stdout = self.run(&args, None).await?;
        Ok(serde_json::from_slice(&stdout)?)
    }

    async fn create_pod(
        &self,
        namespace: &str,
        manifest: &PodManifest,
    ) -> Result<PodManifest, ClusterError> {
        let payload = serde_json::to_vec(manifest)?;
        let args = vec![
            "create".to_string(),
            "-n".to_string(),
            namespace.to_string(),
            "-f".to_string(),
            "-".to_string(),
            "-o".to_string(),
            "json".to_string(),
        ];
        let stdout = self.run(&args, Some(&payload)).await?;
        Ok(serde_json::from_slice(&stdout)?)
    }

    async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
        grace_period: u64,
    ) -> Result<(), ClusterError> {
        let args = vec![
            "delete".to_string(),
            "pod".to_string(),
            name.to_string(),
            "-n".to_string(),
            namespace.to_string(),
            format!("--grace-period={}", grace_period),
        ];
        self.run(&args, None).await?;
        Ok(())
    }

    async fn patch_pod(
        &self,
        namespace: &str,
        name: &str,
        patch: &PatchSpec,
    ) -> Result<(), ClusterError> {
        let args = vec![
            "patch".to_string(),
            "pod".to_string(),
            name.to_string(),
            "-n".to_string(),
            namespace.to_string(),
            format!("--type={}", patch.patch_type.as_str()),
            "-p".to_string(),
            patch.patch.clone(),
        ];
        self.run(&args, None).await?;
        Ok(())
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        let args = vec![
            "delete".to_string(),
            "secret".to_string(),
            name.to_string(),
            "-n".to_string(),
            namespace.to_string(),
        ];
        self.run(&args, None).await?;
        Ok(())
    }
}

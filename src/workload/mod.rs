//! Workload controllers: the mutation/rollback state machine.
//!
//! Every workload kind exposes the same four-operation capability set
//! through [`WorkloadController`]; implementations differ only in how they
//! locate and replace the underlying pod. The implementation is selected by
//! a [`WorkloadKind`] tag at construction time.

pub mod raw_pod;
pub mod transform;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::cluster::objects::PodManifest;
use crate::cluster::{ClusterClient, ClusterError, PatchSpec};
use transform::SIDECAR_NAME;

#[derive(Debug, Error)]
pub enum DevModeError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Ambiguous(String),

    #[error("{0}")]
    Conflict(String),

    #[error("rollback unavailable: {0}")]
    RollbackUnavailable(String),

    #[error("cluster api failure: {0}")]
    TransientApi(String),

    #[error("timed out {0}")]
    Timeout(String),
}

impl From<ClusterError> for DevModeError {
    fn from(err: ClusterError) -> Self {
        match err {
            ClusterError::NotFound { kind, name } => {
                DevModeError::NotFound(format!("{} {}", kind, name))
            }
            other => DevModeError::TransientApi(other.to_string()),
        }
    }
}

/// Identifies the mutation target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadRef {
    pub namespace: String,
    pub kind: WorkloadKind,
    pub name: String,
}

impl WorkloadRef {
    /// Stable key used for lock files and descriptor directories.
    pub fn key(&self) -> String {
        format!("{}.{}.{}", self.namespace, self.kind.as_str(), self.name)
    }
}

/// Workload kinds the factory can construct a controller for.
///
/// Bare pods are the fully implemented exemplar. Controller-owned kinds
/// (deployments, statefulsets, ...) slot in behind the same trait; they only
/// differ in how the pod template is located and replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadKind {
    Pod,
}

impl WorkloadKind {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkloadKind::Pod => "pod",
        }
    }
}

impl FromStr for WorkloadKind {
    type Err = DevModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pod" | "pods" => Ok(WorkloadKind::Pod),
            other => Err(DevModeError::NotFound(format!(
                "workload kind {}",
                other
            ))),
        }
    }
}

/// Options for entering dev mode.
#[derive(Debug, Clone)]
pub struct DevStartOptions {
    /// Target container name. When absent, the workload must have exactly
    /// one container.
    pub container: Option<String>,
    pub dev_image: String,
    pub work_dir: String,
    pub sidecar_image: String,
    /// When set, the shared sync volume is backed by a PVC of this class
    /// instead of an emptyDir.
    pub storage_class: Option<String>,
    /// Resource overrides for the dev container (requests/limits object).
    pub resources: Option<serde_json::Value>,
    /// Ordered post-creation patches, applied best-effort.
    pub patches: Vec<PatchSpec>,
}

/// Bounds for the dev-container readiness poll.
#[derive(Debug, Clone, Copy)]
pub struct ReadinessConfig {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

#[async_trait]
pub trait WorkloadController: Send + Sync {
    /// Pods currently backing this workload.
    async fn pod_list(&self) -> Result<Vec<PodManifest>, DevModeError>;

    /// Swap the target container for the dev image plus sidecar, storing the
    /// original definition in the snapshot annotation.
    async fn replace_image(&self, opts: &DevStartOptions) -> Result<(), DevModeError>;

    /// Restore the original definition from the snapshot annotation. With
    /// `reset`, a missing snapshot degrades to a warning.
    async fn roll_back(&self, reset: bool) -> Result<(), DevModeError>;

    /// Name of the pod whose dev container is up and ready.
    async fn dev_container_pod(&self) -> Result<String, DevModeError>;
}

/// Select a controller implementation by workload kind.
pub fn controller_for(
    target: &WorkloadRef,
    client: Arc<dyn ClusterClient>,
    readiness: ReadinessConfig,
) -> Box<dyn WorkloadController> {
    match target.kind {
        WorkloadKind::Pod => Box::new(raw_pod::RawPodController::new(
            client,
            target.namespace.clone(),
            target.name.clone(),
            readiness,
        )),
    }
}

/// Find the pod running a ready dev container among `pods`.
///
/// A pod qualifies when it carries the snapshot annotation, contains the
/// sidecar, and reports a ready container other than the sidecar.
pub fn find_dev_pod(pods: &[PodManifest]) -> Result<String, DevModeError> {
    for pod in pods {
        if !pod.in_dev_mode() {
            continue;
        }
        if !pod.spec.containers.iter().any(|c| c.name == SIDECAR_NAME) {
            continue;
        }
        let ready = pod
            .status
            .as_ref()
            .map(|s| {
                s.container_statuses
                    .iter()
                    .any(|cs| cs.ready && cs.name != SIDECAR_NAME)
            })
            .unwrap_or(false);
        if ready {
            return Ok(pod.metadata.name.clone());
        }
    }
    Err(DevModeError::NotFound("ready dev container".to_string()))
}

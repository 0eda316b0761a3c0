//! In-memory cluster double used by the controller and orchestrator tests.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::objects::{ContainerStatus, PodManifest, PodStatus};
use super::{ClusterClient, ClusterError, PatchSpec};

#[derive(Default)]
pub(crate) struct FakeCluster {
    pods: Mutex<BTreeMap<(String, String), PodManifest>>,
    /// Newly created pods immediately report all containers ready, so the
    /// readiness poll converges on the first probe.
    pub ready_on_create: bool,
    /// Every patch_pod call fails, to exercise the best-effort policy.
    pub fail_patches: bool,
    pub deletes: Mutex<Vec<String>>,
    pub creates: Mutex<Vec<String>>,
    pub patches: Mutex<Vec<PatchSpec>>,
    pub deleted_secrets: Mutex<Vec<String>>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self {
            ready_on_create: true,
            ..Default::default()
        }
    }

    pub fn insert(&self, namespace: &str, manifest: PodManifest) {
        let key = (namespace.to_string(), manifest.metadata.name.clone());
        self.pods.lock().unwrap().insert(key, manifest);
    }

    pub fn pod(&self, namespace: &str, name: &str) -> Option<PodManifest> {
        self.pods
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Total number of mutating API calls observed (delete + create + patch).
    pub fn mutation_count(&self) -> usize {
        self.deletes.lock().unwrap().len()
            + self.creates.lock().unwrap().len()
            + self.patches.lock().unwrap().len()
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<PodManifest, ClusterError> {
        self.pod(namespace, name).ok_or_else(|| ClusterError::NotFound {
            kind: "pod".to_string(),
            name: name.to_string(),
        })
    }

    async fn create_pod(
        &self,
        namespace: &str,
        manifest: &PodManifest,
    ) -> Result<PodManifest, ClusterError> {
        let mut created = manifest.clone();
        if self.ready_on_create {
            created.status = Some(PodStatus {
                phase: Some("Running".to_string()),
                container_statuses: created
                    .spec
                    .containers
                    .iter()
                    .map(|c| ContainerStatus {
                        name: c.name.clone(),
                        ready: true,
                        ..Default::default()
                    })
                    .collect(),
                ..Default::default()
            });
        }
        self.creates
            .lock()
            .unwrap()
            .push(created.metadata.name.clone());
        self.insert(namespace, created.clone());
        Ok(created)
    }

    async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
        _grace_period: u64,
    ) -> Result<(), ClusterError> {
        let removed = self
            .pods
            .lock()
            .unwrap()
            .remove(&(namespace.to_string(), name.to_string()));
        if removed.is_none() {
            return Err(ClusterError::NotFound {
                kind: "pod".to_string(),
                name: name.to_string(),
            });
        }
        self.deletes.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn patch_pod(
        &self,
        _namespace: &str,
        name: &str,
        patch: &PatchSpec,
    ) -> Result<(), ClusterError> {
        if self.fail_patches {
            return Err(ClusterError::Api(format!("patch rejected for {}", name)));
        }
        self.patches.lock().unwrap().push(patch.clone());
        Ok(())
    }

    async fn delete_secret(&self, _namespace: &str, name: &str) -> Result<(), ClusterError> {
        self.deleted_secrets.lock().unwrap().push(name.to_string());
        Ok(())
    }
}

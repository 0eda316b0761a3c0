//! Controller for pods not managed by any higher-level controller.
//!
//! Pod container lists and volumes cannot be patched in place, so entering
//! and leaving dev mode is a delete-then-create of the whole object. The
//! original definition travels with the recreated object in the snapshot
//! annotation, which makes the rollback exact and survives process restarts.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::cluster::objects::{PodManifest, ORIGIN_POD_ANNOTATION};
use crate::cluster::ClusterClient;

use super::transform;
use super::{find_dev_pod, DevModeError, DevStartOptions, ReadinessConfig, WorkloadController};

/// Pause between deleting the original object and creating its replacement.
/// The API server needs a moment to release the name; sub-second is enough
/// in practice and keeps the absence window short.
const RECREATE_DELAY: Duration = Duration::from_millis(500);

pub struct RawPodController {
    client: Arc<dyn ClusterClient>,
    namespace: String,
    name: String,
    readiness: ReadinessConfig,
}

impl RawPodController {
    pub fn new(
        client: Arc<dyn ClusterClient>,
        namespace: String,
        name: String,
        readiness: ReadinessConfig,
    ) -> Self {
        Self {
            client,
            namespace,
            name,
            readiness,
        }
    }

    /// Poll until a dev container reports ready, bounded by the configured
    /// readiness timeout.
    async fn wait_for_dev_container(&self) -> Result<(), DevModeError> {
        let deadline = tokio::time::Instant::now() + self.readiness.timeout;
        loop {
            match self.dev_container_pod().await {
                Ok(pod) => {
                    info!(pod = %pod, "dev container is ready");
                    return Ok(());
                }
                Err(DevModeError::NotFound(_)) => {}
                Err(other) => return Err(other),
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(DevModeError::Timeout(format!(
                    "waiting for dev container of {} after {:?}",
                    self.name, self.readiness.timeout
                )));
            }
            tokio::time::sleep(self.readiness.poll_interval).await;
        }
    }
}

#[async_trait]
impl WorkloadController for RawPodController {
    async fn pod_list(&self) -> Result<Vec<PodManifest>, DevModeError> {
        let pod = self.client.get_pod(&self.namespace, &self.name).await?;
        Ok(vec![pod])
    }

    async fn replace_image(&self, opts: &DevStartOptions) -> Result<(), DevModeError> {
        let mut pod = self.client.get_pod(&self.namespace, &self.name).await?;

        // A pod with owner references belongs to a controller; mutating it
        // directly would be undone by its owner. The owning controller must
        // be targeted instead.
        if !pod.metadata.owner_references.is_empty() {
            return Err(DevModeError::Conflict(format!(
                "pod {} is managed by a controller, target the owning controller instead",
                self.name
            )));
        }

        pod.strip_runtime();
        let snapshot = serde_json::to_string(&pod)
            .map_err(|e| DevModeError::TransientApi(format!("serializing snapshot: {}", e)))?;
        pod.set_annotation(ORIGIN_POD_ANNOTATION, snapshot);

        // Derived before any mutation so resolution failures leave the
        // cluster untouched.
        let materials = transform::dev_materials(&pod.spec, &self.name, opts)?;

        let index = match opts.container.as_deref() {
            Some(name) => pod
                .spec
                .containers
                .iter()
                .position(|c| c.name == name)
                .ok_or_else(|| DevModeError::NotFound(format!("container {}", name)))?,
            None => 0,
        };
        pod.spec.containers[index] = materials.dev_container;
        pod.spec.volumes.extend(materials.volumes);

        // Dev tooling needs broader access than production hardening allows,
        // and half-synced trees must not be killed by health checks.
        pod.spec.security_context = Some(serde_json::json!({}));
        for container in &mut pod.spec.containers {
            container.liveness_probe = None;
            container.readiness_probe = None;
            container.startup_probe = None;
            container.security_context = None;
        }
        pod.spec.containers.push(materials.sidecar);

        info!(pod = %self.name, "deleting original pod");
        self.client
            .delete_pod(&self.namespace, &self.name, 0)
            .await?;

        tokio::time::sleep(RECREATE_DELAY).await;

        info!(pod = %self.name, image = %opts.dev_image, "creating dev pod");
        self.client.create_pod(&self.namespace, &pod).await?;

        for patch in &opts.patches {
            info!(patch = %patch.patch, "applying post-creation patch");
            if let Err(e) = self
                .client
                .patch_pod(&self.namespace, &self.name, patch)
                .await
            {
                warn!(error = %e, "post-creation patch failed, continuing");
            }
        }

        self.wait_for_dev_container().await
    }

    async fn roll_back(&self, reset: bool) -> Result<(), DevModeError> {
        let pod = self.client.get_pod(&self.namespace, &self.name).await?;

        let snapshot = match pod.annotation(ORIGIN_POD_ANNOTATION) {
            Some(s) => s.to_string(),
            None => {
                let err = DevModeError::RollbackUnavailable(format!(
                    "annotation {} not found on {}",
                    ORIGIN_POD_ANNOTATION, self.name
                ));
                if reset {
                    warn!(error = %err, "no snapshot to roll back, clearing markers anyway");
                    return Ok(());
                }
                return Err(err);
            }
        };

        let original: PodManifest = serde_json::from_str(&snapshot).map_err(|e| {
            DevModeError::RollbackUnavailable(format!("snapshot annotation is corrupt: {}", e))
        })?;

        info!(pod = %self.name, "deleting current revision");
        self.client
            .delete_pod(&self.namespace, &self.name, 0)
            .await?;

        tokio::time::sleep(RECREATE_DELAY).await;

        info!(pod = %self.name, "recreating original revision");
        self.client.create_pod(&self.namespace, &original).await?;
        Ok(())
    }

    async fn dev_container_pod(&self) -> Result<String, DevModeError> {
        let pods = self.pod_list().await?;
        find_dev_pod(&pods)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::fake::FakeCluster;
    use crate::cluster::objects::{Container, ObjectMeta, OwnerReference, PodSpec};
    use crate::cluster::{PatchSpec, PatchType};
    use crate::workload::transform::SIDECAR_NAME;

    fn readiness() -> ReadinessConfig {
        ReadinessConfig {
            timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(20),
        }
    }

    fn controller(cluster: &Arc<FakeCluster>, name: &str) -> RawPodController {
        RawPodController::new(
            cluster.clone() as Arc<dyn ClusterClient>,
            "default".to_string(),
            name.to_string(),
            readiness(),
        )
    }

    fn opts() -> DevStartOptions {
        DevStartOptions {
            container: None,
            dev_image: "corp/debug:latest".to_string(),
            work_dir: "/home/devswap".to_string(),
            sidecar_image: "corp/devswap-sidecar:latest".to_string(),
            storage_class: None,
            resources: None,
            patches: Vec::new(),
        }
    }

    fn bare_pod(name: &str, containers: &[&str]) -> PodManifest {
        PodManifest {
            api_version: "v1".into(),
            kind: "Pod".into(),
            metadata: ObjectMeta {
                name: name.to_string(),
                namespace: Some("default".to_string()),
                resource_version: Some("42".to_string()),
                ..Default::default()
            },
            spec: PodSpec {
                containers: containers
                    .iter()
                    .map(|n| Container {
                        name: n.to_string(),
                        image: Some("corp/app:1.0".to_string()),
                        liveness_probe: Some(serde_json::json!({"exec": {"command": ["true"]}})),
                        readiness_probe: Some(serde_json::json!({"exec": {"command": ["true"]}})),
                        security_context: Some(serde_json::json!({"runAsUser": 1000})),
                        ..Default::default()
                    })
                    .collect(),
                security_context: Some(serde_json::json!({"fsGroup": 2000})),
                ..Default::default()
            },
            status: None,
        }
    }

    fn canonical(mut pod: PodManifest) -> serde_json::Value {
        pod.strip_runtime();
        serde_json::to_value(&pod).unwrap()
    }

    #[tokio::test]
    async fn end_to_end_single_container_pod_enters_dev_mode() {
        let cluster = Arc::new(FakeCluster::new());
        let original = bare_pod("web-0", &["app"]);
        cluster.insert("default", original.clone());

        controller(&cluster, "web-0")
            .replace_image(&opts())
            .await
            .unwrap();

        let mutated = cluster.pod("default", "web-0").unwrap();

        // Exactly two containers: the dev container and the sidecar.
        assert_eq!(mutated.spec.containers.len(), 2);
        let app = &mutated.spec.containers[0];
        assert_eq!(app.name, "app");
        assert_eq!(app.image.as_deref(), Some("corp/debug:latest"));
        assert!(app
            .volume_mounts
            .iter()
            .any(|m| m.name == transform::SHARED_VOLUME_NAME));
        assert_eq!(mutated.spec.containers[1].name, SIDECAR_NAME);

        // No probes or security contexts anywhere.
        for c in &mutated.spec.containers {
            assert!(c.liveness_probe.is_none());
            assert!(c.readiness_probe.is_none());
            assert!(c.startup_probe.is_none());
            assert!(c.security_context.is_none());
        }
        assert_eq!(
            mutated.spec.security_context,
            Some(serde_json::json!({}))
        );

        // The snapshot annotation decodes to the original definition.
        let snapshot: PodManifest =
            serde_json::from_str(mutated.annotation(ORIGIN_POD_ANNOTATION).unwrap()).unwrap();
        assert_eq!(canonical(snapshot), canonical(original));
    }

    #[tokio::test]
    async fn replace_then_rollback_restores_original_across_cycles() {
        let cluster = Arc::new(FakeCluster::new());
        let original = bare_pod("web-0", &["app"]);
        cluster.insert("default", original.clone());
        let ctl = controller(&cluster, "web-0");

        for _ in 0..3 {
            ctl.replace_image(&opts()).await.unwrap();
            ctl.roll_back(false).await.unwrap();

            let restored = cluster.pod("default", "web-0").unwrap();
            assert_eq!(canonical(restored), canonical(original.clone()));
        }
    }

    #[tokio::test]
    async fn owner_referenced_pod_fails_conflict_with_zero_mutation() {
        let cluster = Arc::new(FakeCluster::new());
        let mut pod = bare_pod("web-0", &["app"]);
        pod.metadata.owner_references.push(OwnerReference {
            api_version: "apps/v1".into(),
            kind: "ReplicaSet".into(),
            name: "web".into(),
            ..Default::default()
        });
        cluster.insert("default", pod);

        let err = controller(&cluster, "web-0")
            .replace_image(&opts())
            .await
            .unwrap_err();
        assert!(matches!(err, DevModeError::Conflict(_)));
        assert_eq!(cluster.mutation_count(), 0);
    }

    #[tokio::test]
    async fn zero_container_pod_fails_with_zero_mutation() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.insert("default", bare_pod("web-0", &[]));

        let err = controller(&cluster, "web-0")
            .replace_image(&opts())
            .await
            .unwrap_err();
        assert!(matches!(err, DevModeError::NotFound(_)));
        assert_eq!(cluster.mutation_count(), 0);
    }

    #[tokio::test]
    async fn two_container_pod_without_name_fails_ambiguous() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.insert("default", bare_pod("web-0", &["app", "proxy"]));

        let err = controller(&cluster, "web-0")
            .replace_image(&opts())
            .await
            .unwrap_err();
        assert!(matches!(err, DevModeError::Ambiguous(_)));
        assert_eq!(cluster.mutation_count(), 0);
    }

    #[tokio::test]
    async fn explicit_container_is_replaced_in_place() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.insert("default", bare_pod("web-0", &["app", "proxy"]));

        let mut o = opts();
        o.container = Some("proxy".to_string());
        controller(&cluster, "web-0").replace_image(&o).await.unwrap();

        let mutated = cluster.pod("default", "web-0").unwrap();
        assert_eq!(mutated.spec.containers.len(), 3);
        assert_eq!(mutated.spec.containers[0].name, "app");
        assert_eq!(mutated.spec.containers[0].image.as_deref(), Some("corp/app:1.0"));
        assert_eq!(mutated.spec.containers[1].name, "proxy");
        assert_eq!(
            mutated.spec.containers[1].image.as_deref(),
            Some("corp/debug:latest")
        );
        assert_eq!(mutated.spec.containers[2].name, SIDECAR_NAME);
    }

    #[tokio::test]
    async fn patch_failures_are_swallowed() {
        let mut inner = FakeCluster::new();
        inner.fail_patches = true;
        let cluster = Arc::new(inner);
        cluster.insert("default", bare_pod("web-0", &["app"]));

        let mut o = opts();
        o.patches.push(PatchSpec {
            patch: r#"{"metadata":{"labels":{"dev":"true"}}}"#.to_string(),
            patch_type: PatchType::Strategic,
        });

        // Patch failure must not fail the transition.
        controller(&cluster, "web-0").replace_image(&o).await.unwrap();
        assert!(cluster.pod("default", "web-0").unwrap().in_dev_mode());
    }

    #[tokio::test]
    async fn readiness_poll_times_out_when_container_never_ready() {
        let mut inner = FakeCluster::new();
        inner.ready_on_create = false;
        let cluster = Arc::new(inner);
        cluster.insert("default", bare_pod("web-0", &["app"]));

        let ctl = RawPodController::new(
            cluster.clone() as Arc<dyn ClusterClient>,
            "default".to_string(),
            "web-0".to_string(),
            ReadinessConfig {
                timeout: Duration::from_millis(200),
                poll_interval: Duration::from_millis(20),
            },
        );

        let err = ctl.replace_image(&opts()).await.unwrap_err();
        assert!(matches!(err, DevModeError::Timeout(_)));
    }

    #[tokio::test]
    async fn rollback_without_snapshot_fails_unless_reset() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.insert("default", bare_pod("web-0", &["app"]));
        let ctl = controller(&cluster, "web-0");

        let err = ctl.roll_back(false).await.unwrap_err();
        assert!(matches!(err, DevModeError::RollbackUnavailable(_)));

        // With reset the missing snapshot degrades to a warning, and the
        // live object is left untouched.
        ctl.roll_back(true).await.unwrap();
        assert_eq!(cluster.mutation_count(), 0);
    }

    #[tokio::test]
    async fn rollback_of_missing_pod_surfaces_not_found() {
        let cluster = Arc::new(FakeCluster::new());
        let err = controller(&cluster, "ghost").roll_back(false).await.unwrap_err();
        assert!(matches!(err, DevModeError::NotFound(_)));
    }
}

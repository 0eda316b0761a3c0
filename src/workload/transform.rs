//! Pure derivation of the dev container, sidecar and shared volumes from a
//! pod spec. Nothing here mutates its input or talks to the cluster; the
//! controller splices the results into the object it is about to recreate.

use serde_json::json;

use crate::cluster::objects::{Container, PodSpec, PvcSource, Volume, VolumeMount};

use super::{DevModeError, DevStartOptions};

/// Name of the injected sync/tunnel sidecar container.
pub const SIDECAR_NAME: &str = "devswap-sidecar";

/// Name of the volume shared between the dev container and the sidecar.
pub const SHARED_VOLUME_NAME: &str = "devswap-shared-volume";

/// Everything `replace_image` splices into the recreated object.
#[derive(Debug, Clone)]
pub struct DevMaterials {
    pub dev_container: Container,
    pub sidecar: Container,
    pub volumes: Vec<Volume>,
}

/// Resolve the container targeted for development.
///
/// With an explicit name the container must exist. Without one the spec must
/// contain exactly one container; anything else is unresolvable.
pub fn resolve_dev_container<'a>(
    spec: &'a PodSpec,
    container: Option<&str>,
) -> Result<&'a Container, DevModeError> {
    match container {
        Some(name) => spec
            .containers
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| DevModeError::NotFound(format!("container {}", name))),
        None => match spec.containers.len() {
            0 => Err(DevModeError::NotFound(
                "container (workload defines none)".to_string(),
            )),
            1 => Ok(&spec.containers[0]),
            n => Err(DevModeError::Ambiguous(format!(
                "workload defines {} containers, specify one to start developing",
                n
            ))),
        },
    }
}

/// Derive the dev container, sidecar and shared volumes for a workload.
///
/// `service` names the dev session and is only used to derive the PVC claim
/// name when a storage class is requested.
pub fn dev_materials(
    spec: &PodSpec,
    service: &str,
    opts: &DevStartOptions,
) -> Result<DevMaterials, DevModeError> {
    let selected = resolve_dev_container(spec, opts.container.as_deref())?;

    let shared_mount = VolumeMount {
        name: SHARED_VOLUME_NAME.to_string(),
        mount_path: opts.work_dir.clone(),
        ..Default::default()
    };

    let mut dev_container = selected.clone();
    dev_container.image = Some(opts.dev_image.clone());
    dev_container.working_dir = Some(opts.work_dir.clone());
    // The dev container idles; the developer attaches and runs the service
    // by hand against the synced tree.
    dev_container.command = vec![
        "/bin/sh".to_string(),
        "-c".to_string(),
        "tail -f /dev/null".to_string(),
    ];
    dev_container.args = Vec::new();
    dev_container.volume_mounts.push(shared_mount.clone());
    if let Some(resources) = &opts.resources {
        dev_container.resources = Some(resources.clone());
    }

    let sidecar = Container {
        name: SIDECAR_NAME.to_string(),
        image: Some(opts.sidecar_image.clone()),
        working_dir: Some(opts.work_dir.clone()),
        volume_mounts: vec![shared_mount],
        ..Default::default()
    };

    let shared_volume = match &opts.storage_class {
        Some(_class) => Volume {
            name: SHARED_VOLUME_NAME.to_string(),
            persistent_volume_claim: Some(PvcSource {
                claim_name: format!("{}-{}", SHARED_VOLUME_NAME, service),
                ..Default::default()
            }),
            ..Default::default()
        },
        None => Volume {
            name: SHARED_VOLUME_NAME.to_string(),
            empty_dir: Some(json!({})),
            ..Default::default()
        },
    };

    Ok(DevMaterials {
        dev_container,
        sidecar,
        volumes: vec![shared_volume],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec_with(names: &[&str]) -> PodSpec {
        PodSpec {
            containers: names
                .iter()
                .map(|n| Container {
                    name: n.to_string(),
                    image: Some("corp/app:1.0".to_string()),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
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

    #[test]
    fn resolve_explicit_container() {
        let spec = spec_with(&["app", "proxy"]);
        assert_eq!(
            resolve_dev_container(&spec, Some("proxy")).unwrap().name,
            "proxy"
        );
        assert!(matches!(
            resolve_dev_container(&spec, Some("missing")),
            Err(DevModeError::NotFound(_))
        ));
    }

    #[test]
    fn resolve_sole_container_without_name() {
        let spec = spec_with(&["app"]);
        assert_eq!(resolve_dev_container(&spec, None).unwrap().name, "app");
    }

    #[test]
    fn resolve_fails_ambiguous_with_two_containers() {
        let spec = spec_with(&["app", "proxy"]);
        assert!(matches!(
            resolve_dev_container(&spec, None),
            Err(DevModeError::Ambiguous(_))
        ));
    }

    #[test]
    fn resolve_fails_not_found_with_zero_containers() {
        let spec = spec_with(&[]);
        assert!(matches!(
            resolve_dev_container(&spec, None),
            Err(DevModeError::NotFound(_))
        ));
    }

    #[test]
    fn dev_materials_swaps_image_and_mounts_shared_volume() {
        let spec = spec_with(&["app"]);
        let materials = dev_materials(&spec, "web", &opts()).unwrap();

        assert_eq!(materials.dev_container.name, "app");
        assert_eq!(
            materials.dev_container.image.as_deref(),
            Some("corp/debug:latest")
        );
        assert_eq!(
            materials.dev_container.working_dir.as_deref(),
            Some("/home/devswap")
        );
        assert!(materials
            .dev_container
            .volume_mounts
            .iter()
            .any(|m| m.name == SHARED_VOLUME_NAME && m.mount_path == "/home/devswap"));

        assert_eq!(materials.sidecar.name, SIDECAR_NAME);
        assert!(materials
            .sidecar
            .volume_mounts
            .iter()
            .any(|m| m.name == SHARED_VOLUME_NAME));

        assert_eq!(materials.volumes.len(), 1);
        assert!(materials.volumes[0].empty_dir.is_some());
    }

    #[test]
    fn dev_materials_does_not_mutate_input() {
        let spec = spec_with(&["app"]);
        let before = serde_json::to_value(&spec).unwrap();
        dev_materials(&spec, "web", &opts()).unwrap();
        assert_eq!(serde_json::to_value(&spec).unwrap(), before);
    }

    #[test]
    fn storage_class_switches_shared_volume_to_pvc() {
        let spec = spec_with(&["app"]);
        let mut o = opts();
        o.storage_class = Some("fast-ssd".to_string());
        let materials = dev_materials(&spec, "web", &o).unwrap();

        let volume = &materials.volumes[0];
        assert!(volume.empty_dir.is_none());
        assert_eq!(
            volume
                .persistent_volume_claim
                .as_ref()
                .unwrap()
                .claim_name,
            format!("{}-web", SHARED_VOLUME_NAME)
        );
    }

    #[test]
    fn resource_overrides_are_applied() {
        let spec = spec_with(&["app"]);
        let mut o = opts();
        o.resources = Some(json!({"limits": {"memory": "2Gi"}}));
        let materials = dev_materials(&spec, "web", &o).unwrap();
        assert_eq!(
            materials.dev_container.resources.as_ref().unwrap()["limits"]["memory"],
            "2Gi"
        );
    }
}

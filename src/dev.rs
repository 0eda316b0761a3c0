//! Dev-mode orchestration.
//!
//! [`DevModeService`] sequences the pieces the CLI exposes: swap the workload
//! into dev mode, start the helper processes, record the session in the
//! profile, and unwind all of it on exit. Concurrent transitions on the same
//! workload are fenced by an advisory lock file under the state directory.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{info, warn};

use crate::cluster::{ClusterClient, ClusterError, PatchSpec};
use crate::config::Config;
use crate::profile::{PortForwardRecord, ProfileStore};
use crate::supervisor::{process_alive, ProcessKind, ProcessSupervisor};
use crate::sync::client::{HttpSyncGateway, SyncStatusClient};
use crate::sync::SyncStatus;
use crate::workload::{
    controller_for, DevModeError, DevStartOptions, WorkloadKind, WorkloadRef,
};

/// A `local:remote` port mapping. `"8080"` means the same port on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortPair {
    pub local: u16,
    pub remote: u16,
}

impl FromStr for PortPair {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (local, remote) = match s.split_once(':') {
            Some((local, remote)) => (local, remote),
            None => (s, s),
        };
        let local = local
            .parse()
            .with_context(|| format!("invalid local port in {:?}", s))?;
        let remote = remote
            .parse()
            .with_context(|| format!("invalid remote port in {:?}", s))?;
        anyhow::ensure!(local != 0 && remote != 0, "port 0 is not forwardable: {:?}", s);
        Ok(Self { local, remote })
    }
}

/// Advisory per-workload lock. The holder's pid is written into the file so
/// a crashed holder can be detected and the lock stolen.
#[derive(Debug)]
pub struct WorkloadLock {
    path: PathBuf,
}

impl WorkloadLock {
    pub async fn acquire(state_dir: &Path, target: &WorkloadRef) -> Result<Self> {
        let dir = state_dir.join("locks");
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating lock directory: {}", dir.display()))?;
        let path = dir.join(format!("{}.lock", target.key()));

        // One retry: the first pass may find and remove a stale lock.
        for _ in 0..2 {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(mut file) => {
                    use std::io::Write;
                    write!(file, "{}", std::process::id())
                        .with_context(|| format!("writing lock: {}", path.display()))?;
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let holder = std::fs::read_to_string(&path)
                        .ok()
                        .and_then(|s| s.trim().parse::<u32>().ok());
                    if let Some(pid) = holder {
                        if process_alive(pid).await {
                            return Err(DevModeError::Conflict(format!(
                                "{} is locked by pid {}",
                                target.key(),
                                pid
                            ))
                            .into());
                        }
                    }
                    warn!(path = %path.display(), "removing stale lock");
                    let _ = std::fs::remove_file(&path);
                }
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("creating lock: {}", path.display()))
                }
            }
        }
        Err(DevModeError::Conflict(format!("{} lock is contended", target.key())).into())
    }
}

impl Drop for WorkloadLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// What `sync-status` should do once the session guards pass.
#[derive(Debug, Clone, Copy)]
pub enum SyncStatusMode {
    Get,
    Override,
    Wait(Duration),
    Watch,
}

#[derive(Debug, Clone)]
pub struct DevStartRequest {
    pub namespace: String,
    pub app: String,
    pub service: String,
    pub kind: WorkloadKind,
    pub container: Option<String>,
    /// Dev image override; falls back to the configured default.
    pub dev_image: Option<String>,
    pub storage_class: Option<String>,
    /// User-declared forwards, in addition to the sync tunnel.
    pub ports: Vec<PortPair>,
    pub sync_dirs: Vec<String>,
    pub patches: Vec<PatchSpec>,
}

pub struct DevModeService {
    config: Config,
    cluster: Arc<dyn ClusterClient>,
    profiles: ProfileStore,
}

impl DevModeService {
    pub fn new(config: Config, cluster: Arc<dyn ClusterClient>) -> Self {
        let profiles = ProfileStore::new(&config.state_dir);
        Self {
            config,
            cluster,
            profiles,
        }
    }

    fn supervisor(&self, namespace: &str, service: &str) -> ProcessSupervisor {
        ProcessSupervisor::new(self.config.state_dir.clone(), namespace, service)
    }

    fn kubectl_global_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(kubeconfig) = &self.config.cluster.kubeconfig {
            args.push("--kubeconfig".to_string());
            args.push(kubeconfig.display().to_string());
        }
        if let Some(context) = &self.config.cluster.context {
            args.push("--context".to_string());
            args.push(context.clone());
        }
        args
    }

    fn sync_secret_name(service: &str) -> String {
        format!("{}-devswap-sync-secret", service)
    }

    /// Enter dev mode: swap the workload, then bring up the sync engine and
    /// the tunnel, and record the session in the profile.
    pub async fn dev_start(&self, req: &DevStartRequest) -> Result<()> {
        let target = WorkloadRef {
            namespace: req.namespace.clone(),
            kind: req.kind,
            name: req.service.clone(),
        };
        info!(target = %target.key(), "entering dev mode");
        let _lock = WorkloadLock::acquire(&self.config.state_dir, &target).await?;

        let controller = controller_for(&target, self.cluster.clone(), self.config.readiness());
        let opts = DevStartOptions {
            container: req.container.clone(),
            dev_image: req
                .dev_image
                .clone()
                .unwrap_or_else(|| self.config.dev.default_image.clone()),
            work_dir: self.config.dev.work_dir.clone(),
            sidecar_image: self.config.dev.sidecar_image.clone(),
            storage_class: req
                .storage_class
                .clone()
                .or_else(|| self.config.dev.storage_class.clone()),
            resources: None,
            patches: req.patches.clone(),
        };
        controller.replace_image(&opts).await?;
        let pod = controller.dev_container_pod().await?;

        // The swap is live from here on. Record it before the helpers start
        // so a failed helper spawn still leaves a discoverable session.
        self.profiles
            .update(&req.namespace, &req.app, |profile| {
                profile.svc_mut(&req.service).developing = true;
            })
            .await?;

        let sup = self.supervisor(&req.namespace, &req.service);

        let home = self
            .config
            .state_dir
            .join(&req.namespace)
            .join(&req.service)
            .join("sync-home");
        tokio::fs::create_dir_all(&home)
            .await
            .with_context(|| format!("creating sync engine home: {}", home.display()))?;
        let sync_args = vec![
            "serve".to_string(),
            "--home".to_string(),
            home.display().to_string(),
            "--gui-address".to_string(),
            format!("127.0.0.1:{}", self.config.sync.gui_port),
            "--gui-apikey".to_string(),
            self.config.sync.api_key.clone(),
            "--no-browser".to_string(),
        ];
        let sync_handle = sup
            .start(ProcessKind::Sync, &self.config.sync.engine_bin, &sync_args, false)
            .await?;

        // The tunnel always carries the sync data port; user pairs ride along
        // on the same helper.
        let mut forwards = vec![PortPair {
            local: self.config.sync.local_port,
            remote: self.config.sync.remote_port,
        }];
        forwards.extend(req.ports.iter().copied());
        let elevated = forwards.iter().any(|pair| pair.local < 1024);

        let mut tunnel_args = self.kubectl_global_args();
        tunnel_args.extend([
            "port-forward".to_string(),
            format!("pod/{}", pod),
            "-n".to_string(),
            req.namespace.clone(),
        ]);
        tunnel_args.extend(forwards.iter().map(|p| format!("{}:{}", p.local, p.remote)));

        let (program, tunnel_args) = if elevated {
            let mut args = vec![self.config.cluster.kubectl_path.clone()];
            args.extend(tunnel_args);
            ("sudo".to_string(), args)
        } else {
            (self.config.cluster.kubectl_path.clone(), tunnel_args)
        };
        let tunnel_handle = sup
            .start(ProcessKind::PortForward, &program, &tunnel_args, elevated)
            .await?;

        let secret = Self::sync_secret_name(&req.service);
        let sync = self.config.sync.clone();
        self.profiles
            .update(&req.namespace, &req.app, |profile| {
                let svc = profile.svc_mut(&req.service);
                svc.developing = true;
                svc.syncing = true;
                svc.port_forwarded = true;
                svc.local_sync_port = sync.local_port;
                svc.local_sync_gui_port = sync.gui_port;
                svc.remote_sync_port = sync.remote_port;
                svc.sync_secret = secret;
                svc.sync_dirs = req.sync_dirs.clone();
                svc.dev_port_forward_list = forwards
                    .iter()
                    .enumerate()
                    .map(|(i, pair)| PortForwardRecord {
                        local_port: pair.local,
                        remote_port: pair.remote,
                        role: if i == 0 { "sync" } else { "dev" }.to_string(),
                        status: "forwarding".to_string(),
                        pod_name: pod.clone(),
                        pid: tunnel_handle.pid,
                        sudo: elevated,
                        updated: Utc::now(),
                    })
                    .collect();
            })
            .await?;

        info!(
            pod = %pod,
            sync_pid = sync_handle.pid,
            tunnel_pid = tunnel_handle.pid,
            "dev mode ready"
        );
        Ok(())
    }

    /// Stop the helpers for a service and, when asked, remove the remote
    /// sync secret. The profile keeps `developing` as-is: this is the
    /// "pause sync" surface, not the exit.
    pub async fn stop_sync_and_port_forward(
        &self,
        namespace: &str,
        app: &str,
        service: &str,
        clean_remote_secret: bool,
    ) -> Result<()> {
        let sup = self.supervisor(namespace, service);
        sup.stop(ProcessKind::Sync, true).await?;
        sup.stop(ProcessKind::PortForward, true).await?;

        let mut secret_removed = false;
        if clean_remote_secret {
            let profile = self.profiles.load(namespace, app).await?;
            if let Some(svc) = profile.svc(service) {
                if !svc.sync_secret.is_empty() {
                    match self.cluster.delete_secret(namespace, &svc.sync_secret).await {
                        Ok(()) => {
                            info!(secret = %svc.sync_secret, "sync secret removed");
                            secret_removed = true;
                        }
                        Err(ClusterError::NotFound { .. }) => {
                            secret_removed = true;
                        }
                        Err(e) => {
                            warn!(
                                secret = %svc.sync_secret,
                                error = %e,
                                "failed to remove sync secret"
                            );
                        }
                    }
                }
            }
        }

        self.profiles
            .update(namespace, app, |profile| {
                let svc = profile.svc_mut(service);
                svc.syncing = false;
                svc.port_forwarded = false;
                svc.dev_port_forward_list.clear();
                if secret_removed {
                    svc.sync_secret.clear();
                }
            })
            .await?;
        Ok(())
    }

    /// Exit dev mode: roll the workload back, then tear the helpers down.
    ///
    /// Rollback failure aborts the exit unless `reset` is set, in which case
    /// cleanup proceeds over the wreckage.
    pub async fn dev_end(
        &self,
        namespace: &str,
        app: &str,
        service: &str,
        kind: WorkloadKind,
        reset: bool,
    ) -> Result<()> {
        let target = WorkloadRef {
            namespace: namespace.to_string(),
            kind,
            name: service.to_string(),
        };
        info!(target = %target.key(), reset, "leaving dev mode");

        let controller = controller_for(&target, self.cluster.clone(), self.config.readiness());
        match controller.roll_back(reset).await {
            Ok(()) => {}
            Err(e) if reset => {
                warn!(error = %e, "rollback failed, continuing because reset was requested");
            }
            Err(e) => return Err(e.into()),
        }

        if let Err(e) = self
            .stop_sync_and_port_forward(namespace, app, service, true)
            .await
        {
            warn!(error = %e, "helper cleanup failed");
        }

        self.profiles
            .update(namespace, app, |profile| {
                profile.svc_mut(service).set_end_status()
            })
            .await?;
        Ok(())
    }

    /// Resolve the sync status for a service and feed the resulting records
    /// to `emit`. Guard templates short-circuit before any engine traffic:
    /// unknown application, service not in dev mode, or a confirmed-absent
    /// engine process.
    pub async fn sync_status<F>(
        &self,
        namespace: &str,
        app: &str,
        service: &str,
        mode: SyncStatusMode,
        mut emit: F,
    ) -> Result<()>
    where
        F: FnMut(&SyncStatus),
    {
        if !self.profiles.exists(namespace, app) {
            emit(&SyncStatus::app_not_found(app));
            return Ok(());
        }
        let profile = self.profiles.load(namespace, app).await?;
        let svc = match profile.svc(service) {
            Some(svc) if svc.developing => svc.clone(),
            _ => {
                emit(&SyncStatus::not_in_dev_mode(service));
                return Ok(());
            }
        };
        let sup = self.supervisor(namespace, service);
        if sup.locate(ProcessKind::Sync).await?.is_none() {
            emit(&SyncStatus::engine_not_running());
            return Ok(());
        }

        let gui_port = if svc.local_sync_gui_port != 0 {
            svc.local_sync_gui_port
        } else {
            self.config.sync.gui_port
        };
        let gateway = HttpSyncGateway::new(
            gui_port,
            self.config.sync.api_key.clone(),
            self.config.sync.folder.clone(),
        )?;
        let client = SyncStatusClient::new(Box::new(gateway));

        match mode {
            SyncStatusMode::Get => emit(&client.get_status().await),
            SyncStatusMode::Override => match client.override_remote().await {
                Ok(()) => emit(&SyncStatus::idle("override remote accepted")),
                Err(e) => emit(&SyncStatus::error(
                    format!("override remote failed: {:#}", e),
                    "check that the sync engine is still running",
                )),
            },
            SyncStatusMode::Wait(timeout) => emit(&client.wait_for_sync(timeout).await),
            SyncStatusMode::Watch => client.watch(|status| emit(status)).await,
        }
        Ok(())
    }
}

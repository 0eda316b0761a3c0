//! Supervision of the long-lived helper processes (sync engine and
//! port-forward tunnel).
//!
//! Commands come and go, helpers stay. The only coordination channel between
//! invocations is the descriptor file: a small JSON record keyed by
//! (namespace, service, kind) that a later invocation reads to discover and
//! terminate the helper. The descriptor is advisory and never locked.

use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Which helper a descriptor refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessKind {
    Sync,
    PortForward,
}

impl ProcessKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessKind::Sync => "sync",
            ProcessKind::PortForward => "port-forward",
        }
    }
}

/// Persisted handle for a supervised helper process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessHandle {
    pub pid: u32,
    /// The helper was started with elevated privileges and must be signalled
    /// the same way.
    pub elevated: bool,
}

pub struct ProcessSupervisor {
    state_dir: PathBuf,
    namespace: String,
    service: String,
}

impl ProcessSupervisor {
    pub fn new(state_dir: PathBuf, namespace: &str, service: &str) -> Self {
        Self {
            state_dir,
            namespace: namespace.to_string(),
            service: service.to_string(),
        }
    }

    fn service_dir(&self) -> PathBuf {
        self.state_dir.join(&self.namespace).join(&self.service)
    }

    pub fn descriptor_path(&self, kind: ProcessKind) -> PathBuf {
        self.service_dir().join(format!("{}.json", kind.as_str()))
    }

    fn log_path(&self, kind: ProcessKind) -> PathBuf {
        self.service_dir().join(format!("{}.log", kind.as_str()))
    }

    /// Spawn a detached helper and persist its descriptor.
    ///
    /// Helper output is appended to a per-kind log file; the child is not
    /// tied to this process's lifetime.
    pub async fn start(
        &self,
        kind: ProcessKind,
        program: &str,
        args: &[String],
        elevated: bool,
    ) -> Result<ProcessHandle> {
        let dir = self.service_dir();
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating descriptor directory: {}", dir.display()))?;

        let log_path = self.log_path(kind);
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .with_context(|| format!("opening helper log: {}", log_path.display()))?;
        let log_file_err = log_file
            .try_clone()
            .context("cloning helper log handle")?;

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(log_file_err));

        let child = cmd
            .spawn()
            .with_context(|| format!("spawning {} helper: {}", kind.as_str(), program))?;
        let pid = child
            .id()
            .context("helper exited before a pid could be read")?;

        let handle = ProcessHandle { pid, elevated };
        self.write_descriptor(kind, &handle).await?;

        info!(
            kind = kind.as_str(),
            pid,
            log = %log_path.display(),
            "helper process started"
        );
        // The child handle is dropped here; the helper keeps running and is
        // reachable only through the descriptor from now on.
        Ok(handle)
    }

    /// Read the descriptor for `kind`. Returns `None` when the file is
    /// absent or the recorded pid no longer maps to a live process.
    pub async fn locate(&self, kind: ProcessKind) -> Result<Option<ProcessHandle>> {
        let path = self.descriptor_path(kind);
        let data = match tokio::fs::read_to_string(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("reading descriptor: {}", path.display()))
            }
        };

        let handle: ProcessHandle = serde_json::from_str(&data)
            .with_context(|| format!("parsing descriptor: {}", path.display()))?;

        if !process_alive(handle.pid).await {
            debug!(kind = kind.as_str(), pid = handle.pid, "descriptor is stale");
            return Ok(None);
        }
        Ok(Some(handle))
    }

    /// Terminate the helper for `kind`.
    ///
    /// The descriptor file is removed regardless of whether signal delivery
    /// succeeded: a stale handle is worse than a leaked process, and the pid
    /// is surfaced for manual cleanup. Stopping with no descriptor present is
    /// a no-op success.
    pub async fn stop(&self, kind: ProcessKind, graceful: bool) -> Result<()> {
        let path = self.descriptor_path(kind);
        let data = match tokio::fs::read_to_string(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(kind = kind.as_str(), "no descriptor, nothing to stop");
                return Ok(());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("reading descriptor: {}", path.display()))
            }
        };

        match serde_json::from_str::<ProcessHandle>(&data) {
            Ok(handle) => {
                self.signal(kind, &handle, graceful).await;
            }
            Err(e) => {
                warn!(
                    kind = kind.as_str(),
                    error = %e,
                    "descriptor is corrupt, removing it without signalling"
                );
            }
        }

        if let Err(e) = tokio::fs::remove_file(&path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "failed to remove descriptor");
            }
        }
        Ok(())
    }

    async fn signal(&self, kind: ProcessKind, handle: &ProcessHandle, graceful: bool) {
        let signal = if graceful { "-15" } else { "-9" };
        let (program, args) = if handle.elevated {
            (
                "sudo",
                vec![
                    "kill".to_string(),
                    signal.to_string(),
                    handle.pid.to_string(),
                ],
            )
        } else {
            ("kill", vec![signal.to_string(), handle.pid.to_string()])
        };

        let output = tokio::process::Command::new(program)
            .args(&args)
            .output()
            .await;

        match output {
            Ok(output) if output.status.success() => {
                info!(kind = kind.as_str(), pid = handle.pid, "helper process stopped");
            }
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                // Some platforms report a permission-style error even though
                // the helper did terminate. Treat it as done, but tell the
                // operator how to verify.
                if is_permission_error(&stderr) {
                    warn!(
                        kind = kind.as_str(),
                        pid = handle.pid,
                        "termination reported a permission error; verify with `ps -p {}`",
                        handle.pid
                    );
                } else {
                    warn!(
                        kind = kind.as_str(),
                        pid = handle.pid,
                        stderr = %stderr,
                        "failed to stop helper, run `kill -9 {}` manually",
                        handle.pid
                    );
                }
            }
            Err(e) => {
                warn!(
                    kind = kind.as_str(),
                    pid = handle.pid,
                    error = %e,
                    "could not deliver signal, run `kill -9 {}` manually",
                    handle.pid
                );
            }
        }
    }

    async fn write_descriptor(&self, kind: ProcessKind, handle: &ProcessHandle) -> Result<()> {
        let path = self.descriptor_path(kind);
        let data = serde_json::to_string_pretty(handle).context("serializing descriptor")?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &data)
            .await
            .with_context(|| format!("writing descriptor: {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("publishing descriptor: {}", path.display()))?;
        Ok(())
    }
}

fn is_permission_error(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("not permitted") || lower.contains("denied")
}

/// Probe whether `pid` maps to a live process, via signal 0.
///
/// A permission error on the probe still means the process exists.
pub(crate) async fn process_alive(pid: u32) -> bool {
    let output = tokio::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .output()
        .await;
    match output {
        Ok(output) if output.status.success() => true,
        Ok(output) => is_permission_error(&String::from_utf8_lossy(&output.stderr)),
        Err(_) => false,
    }
}

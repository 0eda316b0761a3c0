mod cluster;
mod config;
mod dev;
mod profile;
mod supervisor;
mod sync;
mod workload;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::cluster::{ClusterClient, KubectlClient, PatchSpec};
use crate::config::Config;
use crate::dev::{DevModeService, DevStartRequest, PortPair, SyncStatusMode};
use crate::sync::SyncStatus;
use crate::workload::WorkloadKind;

#[derive(Parser)]
#[command(name = "devswap", about = "Swap a cluster workload into a local dev loop")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enter dev mode: swap the container for a dev image, start file sync
    /// and port forwarding.
    Start {
        /// Application name (groups services in one profile).
        app: String,
        /// Service (workload) to swap.
        #[arg(long, short = 'd')]
        service: String,
        #[arg(long, short = 'n', default_value = "default")]
        namespace: String,
        /// Workload kind.
        #[arg(long, short = 't', default_value = "pod")]
        kind: String,
        /// Target container; required when the pod has more than one.
        #[arg(long, short = 'c')]
        container: Option<String>,
        /// Dev image. Defaults to the configured image.
        #[arg(long, short = 'i')]
        image: Option<String>,
        /// Port forward as local:remote (or a single port for both ends).
        /// Repeatable.
        #[arg(long, short = 'p')]
        port: Vec<String>,
        /// Local directory to sync into the dev container. Repeatable.
        #[arg(long, short = 's')]
        sync: Vec<String>,
        /// Back the shared sync volume with a PVC of this storage class
        /// instead of an emptyDir.
        #[arg(long)]
        storage_class: Option<String>,
        /// Post-creation patch as JSON: {"patch":"...","type":"strategic"}.
        /// Applied best-effort, in order. Repeatable.
        #[arg(long)]
        patch: Vec<String>,
        /// Path to config file (TOML).
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        kubeconfig: Option<PathBuf>,
    },
    /// Leave dev mode: roll the workload back to its original definition and
    /// tear the helpers down.
    End {
        app: String,
        #[arg(long, short = 'd')]
        service: String,
        #[arg(long, short = 'n', default_value = "default")]
        namespace: String,
        #[arg(long, short = 't', default_value = "pod")]
        kind: String,
        /// Continue cleanup even when rollback fails (for wedged sessions).
        #[arg(long)]
        reset: bool,
        /// Path to config file (TOML).
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        kubeconfig: Option<PathBuf>,
    },
    /// Stop the sync engine and port-forward helpers without leaving dev
    /// mode.
    Stop {
        app: String,
        #[arg(long, short = 'd')]
        service: String,
        #[arg(long, short = 'n', default_value = "default")]
        namespace: String,
        /// Keep the remote sync credentials secret instead of deleting it.
        #[arg(long)]
        keep_secret: bool,
        /// Path to config file (TOML).
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        kubeconfig: Option<PathBuf>,
    },
    /// Report file sync status, one JSON record per line.
    SyncStatus {
        /// Application name; omit for usage help.
        app: Option<String>,
        #[arg(long, short = 'd')]
        service: Option<String>,
        #[arg(long, short = 'n', default_value = "default")]
        namespace: String,
        /// Overwrite remote state from local instead of reporting.
        #[arg(long = "override")]
        override_sync: bool,
        /// Block until a sync cycle completes or the timeout elapses.
        #[arg(long)]
        wait: bool,
        /// Keep reporting as new sync cycles complete (Ctrl-C to stop).
        #[arg(long)]
        watch: bool,
        /// Timeout in seconds for --wait.
        #[arg(long, default_value = "600")]
        timeout: u64,
        /// Path to config file (TOML).
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        kubeconfig: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start {
            app,
            service,
            namespace,
            kind,
            container,
            image,
            port,
            sync,
            storage_class,
            patch,
            config: config_path,
            kubeconfig,
        } => {
            let config = load_config(config_path, kubeconfig)?;
            let kind: WorkloadKind = kind.parse()?;
            let ports = port
                .iter()
                .map(|p| p.parse::<PortPair>())
                .collect::<Result<Vec<_>>>()?;
            let patches = patch
                .iter()
                .map(|p| {
                    serde_json::from_str::<PatchSpec>(p)
                        .with_context(|| format!("parsing patch: {}", p))
                })
                .collect::<Result<Vec<_>>>()?;

            let dev = build_service(config);
            dev.dev_start(&DevStartRequest {
                namespace,
                app,
                service,
                kind,
                container,
                dev_image: image,
                storage_class,
                ports,
                sync_dirs: sync,
                patches,
            })
            .await?;
            println!("dev mode is on");
        }
        Commands::End {
            app,
            service,
            namespace,
            kind,
            reset,
            config: config_path,
            kubeconfig,
        } => {
            let config = load_config(config_path, kubeconfig)?;
            let kind: WorkloadKind = kind.parse()?;
            let dev = build_service(config);
            dev.dev_end(&namespace, &app, &service, kind, reset).await?;
            println!("dev mode is off");
        }
        Commands::Stop {
            app,
            service,
            namespace,
            keep_secret,
            config: config_path,
            kubeconfig,
        } => {
            let config = load_config(config_path, kubeconfig)?;
            let dev = build_service(config);
            dev.stop_sync_and_port_forward(&namespace, &app, &service, !keep_secret)
                .await?;
            println!("sync and port-forward stopped");
        }
        Commands::SyncStatus {
            app,
            service,
            namespace,
            override_sync,
            wait,
            watch,
            timeout,
            config: config_path,
            kubeconfig,
        } => {
            let (app, service) = match (app, service) {
                (Some(app), Some(service)) => (app, service),
                _ => {
                    println!("{}", SyncStatus::welcome().to_line());
                    return Ok(());
                }
            };
            let config = load_config(config_path, kubeconfig)?;
            let dev = build_service(config);

            let mode = if override_sync {
                SyncStatusMode::Override
            } else if wait {
                SyncStatusMode::Wait(Duration::from_secs(timeout))
            } else if watch {
                SyncStatusMode::Watch
            } else {
                SyncStatusMode::Get
            };

            let emit = |status: &SyncStatus| println!("{}", status.to_line());
            if matches!(mode, SyncStatusMode::Watch) {
                tokio::select! {
                    result = dev.sync_status(&namespace, &app, &service, mode, emit) => result?,
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("watch interrupted");
                    }
                }
            } else {
                dev.sync_status(&namespace, &app, &service, mode, emit)
                    .await?;
            }
        }
    }

    Ok(())
}

/// Load a config from an optional path, falling back to defaults, with the
/// kubeconfig flag taking precedence over the file.
fn load_config(path: Option<PathBuf>, kubeconfig: Option<PathBuf>) -> Result<Config> {
    let mut config = Config::load_or_default(path.as_deref())?;
    if kubeconfig.is_some() {
        config.cluster.kubeconfig = kubeconfig;
    }
    Ok(config)
}

fn build_service(config: Config) -> DevModeService {
    let client: Arc<dyn ClusterClient> = Arc::new(KubectlClient::new(
        PathBuf::from(&config.cluster.kubectl_path),
        config.cluster.kubeconfig.clone(),
        config.cluster.context.clone(),
    ));
    DevModeService::new(config, client)
}

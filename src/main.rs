use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use build_coordinator::auth::KeyStore;
use build_coordinator::compute::{GceCompute, MetadataClient};
use build_coordinator::config::{self, BuilderConfig, CoordinatorConfig};
use build_coordinator::dashboard::{run_dashboard, DashboardState};
use build_coordinator::error::CoordinatorError;
use build_coordinator::image::ImageCatalog;
use build_coordinator::poller;
use build_coordinator::reaper::{run_container_reaper, run_vm_reaper};
use build_coordinator::registry::StatusRegistry;
use build_coordinator::runtime::{ContainerRuntime, DockerCli};
use build_coordinator::scheduler::Scheduler;
use build_coordinator::watcher;
use build_coordinator::worker::{self, BuildLauncher};

#[derive(Parser, Debug)]
#[command(name = "build-coordinator")]
#[command(about = "Coordinates toolchain builds in Docker containers")]
struct Args {
    /// Path to the builder master key. Else fetched from the GCE project
    /// attribute 'builder-master-key'.
    #[arg(long)]
    master_key_file: Option<PathBuf>,

    /// Max concurrent builds
    #[arg(long, default_value_t = 6)]
    max_builds: usize,

    /// Comma-separated list of zones to periodically clean of stale build
    /// VMs (ones that failed to shut themselves down)
    #[arg(long, default_value = "us-central1-a,us-central1-b,us-central1-f")]
    zones: String,

    /// Address the status HTTP server listens on
    #[arg(long, default_value = "0.0.0.0:80")]
    listen_addr: SocketAddr,

    /// Append -temp to all builder names
    #[arg(long)]
    temp: bool,

    /// If set, run a single build in the foreground. Requires --rev.
    #[arg(long)]
    just: Option<String>,

    /// Revision to build
    #[arg(long)]
    rev: Option<String>,
}

impl Args {
    fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            max_builds: self.max_builds,
            zones: self
                .zones
                .split(',')
                .map(str::trim)
                .filter(|zone| !zone.is_empty())
                .map(str::to_string)
                .collect(),
            master_key_file: self.master_key_file.clone(),
            listen_addr: self.listen_addr,
            ..CoordinatorConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = args.coordinator_config();
    let builders = Arc::new(config::builder_table(args.temp));

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()?;
    let metadata = MetadataClient::new(http.clone());
    let keys = Arc::new(KeyStore::new(config.master_key_file.clone(), metadata.clone()));

    if args.just.is_some() != args.rev.is_some() {
        return Err("--just and --rev must be used together".into());
    }
    if let (Some(just), Some(rev)) = (&args.just, &args.rev) {
        let conf = builders
            .get(just)
            .ok_or_else(|| CoordinatorError::UnknownBuilder(just.clone()))?;
        return run_single_build(conf, rev, &keys, &config).await;
    }

    // Surface master key problems before any build is admitted.
    keys.master_key().await?;

    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerCli);
    let images = Arc::new(ImageCatalog::new(http.clone(), Arc::clone(&runtime)));
    let registry = Arc::new(StatusRegistry::new(config.max_builds));
    let shutdown = install_shutdown_handler();

    let state = DashboardState {
        registry: Arc::clone(&registry),
        keys: Arc::clone(&keys),
        max_builds: config.max_builds,
    };
    tokio::spawn(run_dashboard(config.listen_addr, state));

    tokio::spawn(run_container_reaper(Arc::clone(&runtime), shutdown.clone()));
    if metadata.has_compute_scope().await {
        let compute = GceCompute::new(http.clone(), metadata.clone());
        tokio::spawn(run_vm_reaper(
            Arc::new(compute),
            config.zones.clone(),
            shutdown.clone(),
        ));
    } else {
        tracing::info!("No read-write compute access, background VM cleaning disabled");
    }

    for conf in config::watcher_table() {
        tokio::spawn(watcher::run_watcher(
            conf,
            Arc::clone(&runtime),
            Arc::clone(&images),
            Arc::clone(&keys),
            config.key_dir.clone(),
            shutdown.clone(),
        ));
    }

    let (work_tx, work_rx) = mpsc::channel(1);
    let (done_tx, done_rx) = mpsc::channel(1);
    for (name, conf) in builders.iter() {
        tokio::spawn(poller::run_poller(
            http.clone(),
            name.clone(),
            conf.dash_url.clone(),
            config.poll_interval,
            work_tx.clone(),
            shutdown.clone(),
        ));
    }
    drop(work_tx);

    let launcher = BuildLauncher {
        runtime,
        images,
        keys,
        key_dir: config.key_dir.clone(),
        done_tx,
    };
    let scheduler = Scheduler::new(registry, launcher, builders, config.max_builds);
    scheduler.run(work_rx, done_rx, shutdown).await;
    Ok(())
}

/// Cancelling the returned token on SIGTERM/SIGINT is the coordinator's only
/// shutdown path: the pollers, watchers, both reapers, and the scheduler all
/// select on it and wind down on their own. Exit waiters and log streamers
/// for builds already in flight are left to the process exit; their
/// containers are covered by the reaper on the next coordinator run.
fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let signal_token = token.clone();

    tokio::spawn(async move {
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => tracing::info!("Received SIGTERM, shutting down"),
            _ = sigint.recv() => tracing::info!("Received SIGINT, shutting down"),
        }

        signal_token.cancel();
    });

    token
}

/// Debug path: one build in the foreground with inherited stdio, bypassing
/// the scheduler entirely.
async fn run_single_build(
    conf: &BuilderConfig,
    rev: &str,
    keys: &KeyStore,
    config: &CoordinatorConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let run_args = worker::docker_run_args(conf, rev, keys, &config.key_dir).await?;
    tracing::info!(builder = %conf.name, rev = %rev, "Running single build");
    let status = tokio::process::Command::new("docker")
        .arg("run")
        .args(&run_args)
        .status()
        .await?;
    if !status.success() {
        return Err(format!("build failed: {status}").into());
    }
    Ok(())
}

//! Commit-watcher containers.
//!
//! One watcher container per watched repository feeds the dashboard with
//! newly pushed commits. The coordinator keeps each watcher alive: when its
//! container dies it is removed with its volumes and relaunched after a
//! short delay.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::auth::{materialize_key_file, KeyStore, KEY_MOUNTS};
use crate::config::WatchConfig;
use crate::error::Result;
use crate::image::{ImageCatalog, WATCHER_IMAGE};
use crate::runtime::ContainerRuntime;

const WATCHER_ENTRYPOINT: &str = "/usr/local/bin/watcher";
const RESTART_DELAY: Duration = Duration::from_secs(30);

/// Keeps one repository's watcher container running until shutdown.
pub async fn run_watcher(
    conf: WatchConfig,
    runtime: Arc<dyn ContainerRuntime>,
    images: Arc<ImageCatalog>,
    keys: Arc<KeyStore>,
    key_dir: PathBuf,
    shutdown: CancellationToken,
) {
    loop {
        match launch_watcher(&conf, runtime.as_ref(), &images, &keys, &key_dir).await {
            Ok(container) => {
                tracing::info!(repo = %conf.repo, container = %container, "Watcher started");
                let _ = runtime.wait(&container).await;
                let _ = runtime.remove_with_volumes(&container).await;
                tracing::warn!(repo = %conf.repo, "Watcher container exited, restarting soon");
            }
            Err(e) => {
                tracing::warn!(repo = %conf.repo, error = %e, "Starting watcher failed");
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(RESTART_DELAY) => {}
            _ = shutdown.cancelled() => return,
        }
    }
}

async fn launch_watcher(
    conf: &WatchConfig,
    runtime: &dyn ContainerRuntime,
    images: &ImageCatalog,
    keys: &KeyStore,
    key_dir: &std::path::Path,
) -> Result<String> {
    images.ensure_image(WATCHER_IMAGE).await?;

    let mut args = Vec::new();
    let master = keys.master_key().await?;
    if !master.is_empty() {
        let key_file = key_dir.join("watcher.buildkey");
        materialize_key_file(&key_file, master).await?;
        for mount in KEY_MOUNTS {
            args.push("-v".to_string());
            args.push(format!("{}:{mount}", key_file.display()));
        }
    }
    args.push(WATCHER_IMAGE.to_string());
    args.push(WATCHER_ENTRYPOINT.to_string());
    args.push(format!("-repo={}", conf.repo));
    args.push(format!("-dash={}", conf.dash));
    args.push(format!("-poll={}s", conf.interval.as_secs()));
    runtime.run_detached(&args).await
}

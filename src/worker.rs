//! Launches one build container and tracks it to completion.
//!
//! A successful launch returns its status record immediately; two background
//! tasks then follow the container. The exit waiter parses the exit code,
//! marks the status done, reports on the completion channel, and removes the
//! container. The log streamer copies the container's combined output into
//! the bounded buffer on the status record.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;

use crate::auth::{materialize_key_file, KeyStore, KEY_MOUNTS};
use crate::config::BuilderConfig;
use crate::error::Result;
use crate::image::ImageCatalog;
use crate::registry::{BuildStatus, BuilderRev};
use crate::runtime::{ContainerRuntime, LogStreams};

const BUILDER_ENTRYPOINT: &str = "/usr/local/bin/builder";

/// Arguments after `docker run` for one build of `rev` under `conf`.
pub async fn docker_run_args(
    conf: &BuilderConfig,
    rev: &str,
    keys: &KeyStore,
    key_dir: &Path,
) -> Result<Vec<String>> {
    let mut args = Vec::new();
    let key = keys.builder_key(&conf.name).await?;
    if !key.is_empty() {
        let key_file = key_dir.join(format!("{}.buildkey", conf.name));
        materialize_key_file(&key_file, key.as_bytes()).await?;
        for mount in KEY_MOUNTS {
            args.push("-v".to_string());
            args.push(format!("{}:{mount}", key_file.display()));
        }
    }
    for pair in &conf.env {
        args.push("-e".to_string());
        args.push(pair.clone());
    }
    args.push(conf.image.clone());
    args.push(BUILDER_ENTRYPOINT.to_string());
    args.push(format!("-rev={rev}"));
    args.push(format!("-dashboard={}", conf.dash_url));
    args.push(format!("-tool={}", conf.tool));
    args.push("-buildroot=/".to_string());
    args.push("-v".to_string());
    if let Some(cmd) = &conf.cmd {
        args.push("-cmd".to_string());
        args.push(cmd.clone());
    }
    args.push(conf.name.clone());
    Ok(args)
}

/// Starts build containers and spawns the tasks that track them.
pub struct BuildLauncher {
    pub runtime: Arc<dyn ContainerRuntime>,
    pub images: Arc<ImageCatalog>,
    pub keys: Arc<KeyStore>,
    pub key_dir: PathBuf,
    pub done_tx: mpsc::Sender<BuilderRev>,
}

impl BuildLauncher {
    /// Ensures the builder image is current, starts a detached build
    /// container, and returns once the container is launched, well before
    /// the build finishes. A launch failure creates no status record.
    pub async fn start_building(&self, conf: &BuilderConfig, rev: &str) -> Result<Arc<BuildStatus>> {
        self.images.ensure_image(&conf.image).await?;

        let args = docker_run_args(conf, rev, &self.keys, &self.key_dir).await?;
        let container = self.runtime.run_detached(&args).await?;

        let br = BuilderRev::new(&conf.name, rev);
        let status = Arc::new(BuildStatus::new(br, container.clone()));

        self.spawn_exit_waiter(Arc::clone(&status), container.clone());
        self.spawn_log_streamer(Arc::clone(&status), container);

        Ok(status)
    }

    fn spawn_exit_waiter(&self, status: Arc<BuildStatus>, container: String) {
        let runtime = Arc::clone(&self.runtime);
        let done_tx = self.done_tx.clone();
        tokio::spawn(async move {
            let succeeded = match runtime.wait(&container).await {
                Ok(code) => {
                    tracing::info!(
                        container = %container,
                        build = %status.builder_rev,
                        code,
                        "Build container exited"
                    );
                    code == 0
                }
                Err(e) => {
                    tracing::warn!(container = %container, error = %e, "Waiting for build container failed");
                    false
                }
            };
            status.set_done(succeeded).await;
            let _ = done_tx.send(status.builder_rev.clone()).await;
            if let Err(e) = runtime.remove(&container).await {
                tracing::warn!(container = %container, error = %e, "Removing build container failed");
            }
        });
    }

    fn spawn_log_streamer(&self, status: Arc<BuildStatus>, container: String) {
        let runtime = Arc::clone(&self.runtime);
        tokio::spawn(async move {
            match runtime.follow_logs(&container).await {
                Ok(streams) => stream_output(streams, &status).await,
                Err(e) => {
                    tracing::warn!(container = %container, error = %e, "Following build logs failed")
                }
            }
        });
    }
}

/// Copies both output streams into the status record until they close.
async fn stream_output(mut streams: LogStreams, status: &BuildStatus) {
    tokio::join!(
        copy_stream(streams.stdout.as_mut(), status),
        copy_stream(streams.stderr.as_mut(), status),
    );
    if let Err(e) = streams.finish().await {
        tracing::debug!(error = %e, "Log follower did not exit cleanly");
    }
}

async fn copy_stream(src: &mut (dyn AsyncRead + Send + Unpin), status: &BuildStatus) {
    let mut buf = [0u8; 4096];
    loop {
        match src.read(&mut buf).await {
            Ok(0) => return,
            Ok(n) => status.append_output(&buf[..n]).await,
            Err(e) => {
                tracing::debug!(build = %status.builder_rev, error = %e, "Log stream read failed");
                return;
            }
        }
    }
}

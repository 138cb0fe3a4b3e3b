//! The admission loop.
//!
//! A single task consumes work candidates, build completions, and a periodic
//! tick, so every admission decision is totally ordered. Candidates pass two
//! gates before a build starts: the registry's own view (cap and one-build-
//! per-revision), and the count of build containers the runtime actually has
//! running. The second gate matters when containers outlive the registry,
//! e.g. across a coordinator restart.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{BuilderConfig, BUILDER_IMAGE_PREFIX};
use crate::registry::{BuilderRev, StatusRegistry};
use crate::worker::BuildLauncher;

const TICK_INTERVAL: Duration = Duration::from_secs(60);

/// How long after startup a sustained-idle coordinator waits before calling
/// its idle hook.
const IDLE_GRACE: Duration = Duration::from_secs(10 * 60);

pub struct Scheduler {
    registry: Arc<StatusRegistry>,
    launcher: BuildLauncher,
    builders: Arc<HashMap<String, BuilderConfig>>,
    max_builds: usize,
    started: Instant,
    idle_hook: Box<dyn Fn() + Send + Sync>,
}

impl Scheduler {
    pub fn new(
        registry: Arc<StatusRegistry>,
        launcher: BuildLauncher,
        builders: Arc<HashMap<String, BuilderConfig>>,
        max_builds: usize,
    ) -> Self {
        Self {
            registry,
            launcher,
            builders,
            max_builds,
            started: Instant::now(),
            idle_hook: Box::new(|| tracing::info!("Coordinator has been idle past the grace period")),
        }
    }

    /// Replaces the hook run when the coordinator sits idle past the grace
    /// period. Deployments use this to power the machine down.
    pub fn with_idle_hook(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.idle_hook = Box::new(hook);
        self
    }

    /// Runs until shutdown, consuming candidates and completions.
    pub async fn run(
        self,
        mut work_rx: mpsc::Receiver<BuilderRev>,
        mut done_rx: mpsc::Receiver<BuilderRev>,
        shutdown: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        loop {
            tokio::select! {
                Some(work) = work_rx.recv() => self.handle_candidate(work).await,
                Some(done) = done_rx.recv() => {
                    tracing::info!(build = %done, "Build done");
                    self.registry.mark_done(&done).await;
                }
                _ = ticker.tick() => self.handle_tick().await,
                _ = shutdown.cancelled() => return,
            }
        }
    }

    async fn handle_candidate(&self, work: BuilderRev) {
        let live = self.registry.live_count().await;
        tracing::info!(build = %work, live, max = self.max_builds, "Work candidate received");
        if !self.registry.may_build(&work).await {
            // Already in flight or at the cap; the poller will re-surface the
            // revision if the dashboard still wants it.
            return;
        }
        match self
            .launcher
            .runtime
            .running_image_count(BUILDER_IMAGE_PREFIX)
            .await
        {
            Ok(running) if running > self.max_builds => {
                tracing::warn!(
                    running,
                    max = self.max_builds,
                    "Runtime reports too many build containers, deferring"
                );
                return;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "Could not count running build containers");
            }
        }
        let Some(conf) = self.builders.get(&work.name) else {
            tracing::warn!(builder = %work.name, "Candidate for unknown builder dropped");
            return;
        };
        match self.launcher.start_building(conf, &work.rev).await {
            Ok(status) => {
                tracing::info!(build = %work, container = %status.container, "Build started");
                self.registry.set_status(work, status).await;
            }
            Err(e) => {
                tracing::warn!(build = %work, error = %e, "Starting build failed");
            }
        }
    }

    async fn handle_tick(&self) {
        if self.registry.live_count().await == 0 && self.started.elapsed() > IDLE_GRACE {
            (self.idle_hook)();
        }
    }
}

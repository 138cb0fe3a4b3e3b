//! Shared fixtures: an in-memory container runtime, a scripted compute API,
//! a local image server, and a wired-up coordinator for end-to-end tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::http::header;
use axum::routing::get;
use axum::Router;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use build_coordinator::auth::KeyStore;
use build_coordinator::compute::{
    ComputeApi, Instance, InstanceMetadata, MetadataClient, MetadataItem,
};
use build_coordinator::config::{builder_table, BuilderConfig};
use build_coordinator::error::{CoordinatorError, Result};
use build_coordinator::image::ImageCatalog;
use build_coordinator::registry::{BuilderRev, StatusRegistry};
use build_coordinator::runtime::{ContainerRuntime, LogStreams};
use build_coordinator::scheduler::Scheduler;
use build_coordinator::worker::BuildLauncher;

/// Container runtime backed by in-memory state. Containers "exit" when the
/// test calls [`MockRuntime::finish`], or immediately when built with
/// [`MockRuntime::auto_exit`].
pub struct MockRuntime {
    next_id: AtomicUsize,
    auto_exit: Option<i64>,
    pub fail_run: bool,
    pub fail_load: Mutex<bool>,
    pub default_logs: Mutex<Vec<u8>>,
    pub running_count: AtomicUsize,
    pub exited: Mutex<Vec<String>>,
    pub started: Mutex<Vec<(String, Vec<String>)>>,
    pub removed: Mutex<Vec<String>>,
    pub removed_with_volumes: Mutex<Vec<String>>,
    pub load_attempts: AtomicUsize,
    pub loads: AtomicUsize,
    finishers: Mutex<HashMap<String, oneshot::Sender<i64>>>,
    waiters: Mutex<HashMap<String, oneshot::Receiver<i64>>>,
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRuntime {
    pub fn new() -> Self {
        Self {
            next_id: AtomicUsize::new(0),
            auto_exit: None,
            fail_run: false,
            fail_load: Mutex::new(false),
            default_logs: Mutex::new(Vec::new()),
            running_count: AtomicUsize::new(0),
            exited: Mutex::new(Vec::new()),
            started: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
            removed_with_volumes: Mutex::new(Vec::new()),
            load_attempts: AtomicUsize::new(0),
            loads: AtomicUsize::new(0),
            finishers: Mutex::new(HashMap::new()),
            waiters: Mutex::new(HashMap::new()),
        }
    }

    /// Runtime whose containers exit with `code` as soon as they start.
    pub fn auto_exit(code: i64) -> Self {
        Self {
            auto_exit: Some(code),
            ..Self::new()
        }
    }

    pub fn failing_run() -> Self {
        Self {
            fail_run: true,
            ..Self::new()
        }
    }

    pub fn set_logs(&self, bytes: impl Into<Vec<u8>>) {
        *self.default_logs.lock().unwrap() = bytes.into();
    }

    pub fn set_running(&self, count: usize) {
        self.running_count.store(count, Ordering::SeqCst);
    }

    pub fn set_exited(&self, containers: &[&str]) {
        *self.exited.lock().unwrap() = containers.iter().map(|c| c.to_string()).collect();
    }

    /// Makes a started container exit with the given code.
    pub fn finish(&self, container: &str, code: i64) {
        let sender = self
            .finishers
            .lock()
            .unwrap()
            .remove(container)
            .unwrap_or_else(|| panic!("no pending wait for container {container}"));
        let _ = sender.send(code);
    }

    pub fn started_containers(&self) -> Vec<String> {
        self.started
            .lock()
            .unwrap()
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn run_detached(&self, args: &[String]) -> Result<String> {
        if self.fail_run {
            return Err(CoordinatorError::Runtime(
                "mock runtime configured to fail".to_string(),
            ));
        }
        let id = format!("container-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = oneshot::channel();
        if let Some(code) = self.auto_exit {
            let _ = tx.send(code);
        } else {
            self.finishers.lock().unwrap().insert(id.clone(), tx);
        }
        self.waiters.lock().unwrap().insert(id.clone(), rx);
        self.started
            .lock()
            .unwrap()
            .push((id.clone(), args.to_vec()));
        Ok(id)
    }

    async fn wait(&self, container: &str) -> Result<i64> {
        let rx = self
            .waiters
            .lock()
            .unwrap()
            .remove(container)
            .ok_or_else(|| CoordinatorError::Runtime(format!("unknown container {container}")))?;
        rx.await
            .map_err(|_| CoordinatorError::Runtime("wait abandoned".to_string()))
    }

    async fn follow_logs(&self, _container: &str) -> Result<LogStreams> {
        let logs = self.default_logs.lock().unwrap().clone();
        Ok(LogStreams::from_buffers(logs, Vec::new()))
    }

    async fn remove(&self, container: &str) -> Result<()> {
        self.removed.lock().unwrap().push(container.to_string());
        Ok(())
    }

    async fn remove_with_volumes(&self, container: &str) -> Result<()> {
        self.removed_with_volumes
            .lock()
            .unwrap()
            .push(container.to_string());
        Ok(())
    }

    async fn running_image_count(&self, _image_prefix: &str) -> Result<usize> {
        Ok(self.running_count.load(Ordering::SeqCst))
    }

    async fn exited_containers(&self) -> Result<Vec<String>> {
        Ok(self.exited.lock().unwrap().clone())
    }

    async fn load_image(&self, tarball: &mut (dyn AsyncRead + Send + Unpin)) -> Result<()> {
        let mut sink = Vec::new();
        tarball.read_to_end(&mut sink).await?;
        self.load_attempts.fetch_add(1, Ordering::SeqCst);
        if *self.fail_load.lock().unwrap() {
            return Err(CoordinatorError::Runtime(
                "mock image load failure".to_string(),
            ));
        }
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Compute API over scripted per-zone instance lists.
#[derive(Default)]
pub struct MockCompute {
    pub instances: Mutex<HashMap<String, Vec<Instance>>>,
    pub deleted: Mutex<Vec<(String, String)>>,
    pub fail_list: bool,
    pub fail_delete_names: Vec<String>,
}

impl MockCompute {
    pub fn with_zone(zone: &str, instances: Vec<Instance>) -> Self {
        let compute = Self::default();
        compute
            .instances
            .lock()
            .unwrap()
            .insert(zone.to_string(), instances);
        compute
    }

    pub fn deleted_names(&self) -> Vec<String> {
        self.deleted
            .lock()
            .unwrap()
            .iter()
            .map(|(_, name)| name.clone())
            .collect()
    }
}

#[async_trait]
impl ComputeApi for MockCompute {
    async fn list_instances(&self, zone: &str) -> Result<Vec<Instance>> {
        if self.fail_list {
            return Err(CoordinatorError::Runtime(
                "mock list failure".to_string(),
            ));
        }
        Ok(self
            .instances
            .lock()
            .unwrap()
            .get(zone)
            .cloned()
            .unwrap_or_default())
    }

    async fn delete_instance(&self, zone: &str, name: &str) -> Result<()> {
        if self.fail_delete_names.iter().any(|n| n == name) {
            return Err(CoordinatorError::Runtime(format!(
                "mock delete failure for {name}"
            )));
        }
        self.deleted
            .lock()
            .unwrap()
            .push((zone.to_string(), name.to_string()));
        Ok(())
    }
}

/// An instance with the given metadata pairs.
pub fn instance(name: &str, metadata: &[(&str, &str)]) -> Instance {
    Instance {
        name: name.to_string(),
        metadata: InstanceMetadata {
            items: metadata
                .iter()
                .map(|(key, value)| MetadataItem {
                    key: key.to_string(),
                    value: Some(value.to_string()),
                })
                .collect(),
        },
    }
}

/// Serves one image tarball whose Last-Modified tag the test can change.
pub async fn start_image_server(last_modified: Arc<Mutex<String>>) -> String {
    let app = Router::new().route(
        "/image.tar.gz",
        get(move || {
            let last_modified = Arc::clone(&last_modified);
            async move {
                let tag = last_modified.lock().unwrap().clone();
                ([(header::LAST_MODIFIED, tag)], "tarball contents")
            }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind image server");
    let addr = listener.local_addr().expect("image server addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("image server");
    });
    format!("http://{addr}/image.tar.gz")
}

/// KeyStore reading a fixed master key from a file in `dir`.
pub fn file_key_store(dir: &Path, master: &str) -> Arc<KeyStore> {
    let key_file = dir.join("master.key");
    std::fs::write(&key_file, master).expect("write master key");
    Arc::new(KeyStore::new(
        Some(key_file),
        MetadataClient::new(reqwest::Client::new()),
    ))
}

/// Polls an async condition until it holds or the 5s deadline passes.
pub async fn wait_for<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// A scheduler wired to a mock runtime and a local image server, running in
/// a background task.
pub struct TestCoordinator {
    pub registry: Arc<StatusRegistry>,
    pub runtime: Arc<MockRuntime>,
    pub work_tx: mpsc::Sender<BuilderRev>,
    pub builders: Arc<HashMap<String, BuilderConfig>>,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
    _key_dir: tempfile::TempDir,
}

impl TestCoordinator {
    pub async fn start(max_builds: usize, runtime: MockRuntime) -> Self {
        let runtime: Arc<MockRuntime> = Arc::new(runtime);
        let runtime_dyn: Arc<dyn ContainerRuntime> = Arc::clone(&runtime) as Arc<dyn ContainerRuntime>;

        let key_dir = tempfile::tempdir().expect("temp key dir");
        let keys = file_key_store(key_dir.path(), "test-master-key");

        let tag = Arc::new(Mutex::new("tag-1".to_string()));
        let image_url = start_image_server(tag).await;
        let builders = Arc::new(builder_table(false));
        let images: HashMap<String, String> = builders
            .values()
            .map(|conf| (conf.image.clone(), image_url.clone()))
            .collect();
        let images = Arc::new(ImageCatalog::with_images(
            reqwest::Client::new(),
            Arc::clone(&runtime_dyn),
            images,
        ));

        let registry = Arc::new(StatusRegistry::new(max_builds));
        let (work_tx, work_rx) = mpsc::channel(8);
        let (done_tx, done_rx) = mpsc::channel(8);
        let launcher = BuildLauncher {
            runtime: runtime_dyn,
            images,
            keys,
            key_dir: key_dir.path().to_path_buf(),
            done_tx,
        };
        let scheduler = Scheduler::new(
            Arc::clone(&registry),
            launcher,
            Arc::clone(&builders),
            max_builds,
        );
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(scheduler.run(work_rx, done_rx, shutdown.clone()));

        Self {
            registry,
            runtime,
            work_tx,
            builders,
            shutdown,
            handle,
            _key_dir: key_dir,
        }
    }

    pub async fn submit(&self, builder: &str, rev: &str) {
        self.work_tx
            .send(BuilderRev::new(builder, rev))
            .await
            .expect("scheduler alive");
    }
}

impl Drop for TestCoordinator {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.handle.abort();
    }
}

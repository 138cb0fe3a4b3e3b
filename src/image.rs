//! Lazily keeps worker images loaded in the local runtime.
//!
//! Each image is refreshed against its source URL's `Last-Modified` tag.
//! The per-image lock is held for the whole check-and-load, so concurrent
//! callers for one image do at most one fetch while distinct images proceed
//! in parallel. The stored tag only advances after a successful load; a
//! failed load is retried wholesale on the next call.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::TryStreamExt;
use reqwest::header;
use tokio::sync::Mutex;
use tokio_util::io::StreamReader;

use crate::error::{CoordinatorError, Result};
use crate::runtime::ContainerRuntime;

/// Image the commit-watcher containers run.
pub const WATCHER_IMAGE: &str = "go-commit-watcher";

#[derive(Debug)]
struct ImageInfo {
    url: String,
    last_mod: Mutex<Option<String>>,
}

/// The fixed set of images the coordinator knows how to provision.
pub struct ImageCatalog {
    images: HashMap<String, ImageInfo>,
    client: reqwest::Client,
    runtime: Arc<dyn ContainerRuntime>,
}

impl ImageCatalog {
    pub fn new(client: reqwest::Client, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self::with_images(client, runtime, standard_images())
    }

    /// Catalog over an explicit name→URL table. Tests point this at a local
    /// server.
    pub fn with_images(
        client: reqwest::Client,
        runtime: Arc<dyn ContainerRuntime>,
        images: HashMap<String, String>,
    ) -> Self {
        let images = images
            .into_iter()
            .map(|(name, url)| {
                (
                    name,
                    ImageInfo {
                        url,
                        last_mod: Mutex::new(None),
                    },
                )
            })
            .collect();
        Self {
            images,
            client,
            runtime,
        }
    }

    /// Ensures `name` is loaded locally at a version no older than what its
    /// source URL currently serves. Asking for an image outside the catalog
    /// is a programmer error.
    pub async fn ensure_image(&self, name: &str) -> Result<()> {
        let Some(info) = self.images.get(name) else {
            panic!("image {name:?} not described");
        };
        let mut last_mod = info.last_mod.lock().await;

        let res = self.client.head(&info.url).send().await?;
        if res.status() != reqwest::StatusCode::OK {
            return Err(CoordinatorError::UnexpectedStatus(res.status()));
        }
        let modified = res
            .headers()
            .get(header::LAST_MODIFIED)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if last_mod.as_deref() == Some(modified.as_str()) {
            return Ok(());
        }

        tracing::info!(image = %name, url = %info.url, "Loading image");
        let res = self.client.get(&info.url).send().await?;
        if res.status() != reqwest::StatusCode::OK {
            return Err(CoordinatorError::UnexpectedStatus(res.status()));
        }
        let stream = res.bytes_stream().map_err(std::io::Error::other);
        let mut reader = StreamReader::new(Box::pin(stream));
        self.runtime.load_image(&mut reader).await?;

        *last_mod = Some(modified);
        Ok(())
    }
}

fn standard_images() -> HashMap<String, String> {
    const BUCKET: &str = "https://storage.googleapis.com/go-builder-data";
    [
        (WATCHER_IMAGE, "docker-commit-watcher.tar.gz"),
        ("gobuilders/linux-x86-base", "docker-linux.base.tar.gz"),
        ("gobuilders/linux-x86-clang", "docker-linux.clang.tar.gz"),
        ("gobuilders/linux-x86-gccgo", "docker-linux.gccgo.tar.gz"),
        ("gobuilders/linux-x86-nacl", "docker-linux.nacl.tar.gz"),
        ("gobuilders/linux-x86-sid", "docker-linux.sid.tar.gz"),
    ]
    .into_iter()
    .map(|(name, file)| (name.to_string(), format!("{BUCKET}/{file}")))
    .collect()
}

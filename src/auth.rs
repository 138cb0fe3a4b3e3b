//! Builder authentication keys.
//!
//! A process-wide master key is loaded at most once, from a local file when
//! one is configured and otherwise from the GCE project attribute
//! `builder-master-key`. Per-builder keys are derived from it with HMAC-MD5
//! and mounted into build containers; the same derived value is scrubbed
//! from logs before they are served.

use std::path::{Path, PathBuf};

use hmac::{Hmac, Mac};
use md5::Md5;
use tokio::sync::OnceCell;

use crate::compute::MetadataClient;
use crate::error::{CoordinatorError, Result};

const MASTER_KEY_ATTRIBUTE: &str = "builder-master-key";

/// Paths inside a container where images expect the key file. Some images
/// look in / and some in /root, so both are bound.
pub const KEY_MOUNTS: [&str; 2] = ["/.gobuildkey", "/root/.gobuildkey"];

type HmacMd5 = Hmac<Md5>;

/// Loads the master key once and derives per-builder keys from it.
pub struct KeyStore {
    master_key_file: Option<PathBuf>,
    metadata: MetadataClient,
    master: OnceCell<Vec<u8>>,
}

impl KeyStore {
    pub fn new(master_key_file: Option<PathBuf>, metadata: MetadataClient) -> Self {
        Self {
            master_key_file,
            metadata,
            master: OnceCell::new(),
        }
    }

    /// The master key, loaded on first use and cached for the process
    /// lifetime. A load failure here is fatal to the caller.
    pub async fn master_key(&self) -> Result<&[u8]> {
        let key = self.master.get_or_try_init(|| self.load()).await?;
        Ok(key)
    }

    async fn load(&self) -> Result<Vec<u8>> {
        if let Some(path) = &self.master_key_file {
            let raw = tokio::fs::read(path).await?;
            return Ok(raw.trim_ascii().to_vec());
        }
        let attr = self
            .metadata
            .project_attribute(MASTER_KEY_ATTRIBUTE)
            .await
            .map_err(|e| CoordinatorError::MasterKey(e.to_string()))?;
        Ok(attr.trim().as_bytes().to_vec())
    }

    /// The derived key for one builder, lowercase hex. Empty when the master
    /// key is empty, in which case builds run without authenticated identity.
    pub async fn builder_key(&self, builder: &str) -> Result<String> {
        let master = self.master_key().await?;
        if master.is_empty() {
            return Ok(String::new());
        }
        Ok(derive_key(master, builder))
    }
}

/// hex(HMAC-MD5(master, builder)).
pub fn derive_key(master: &[u8], builder: &str) -> String {
    let mut mac = HmacMd5::new_from_slice(master).expect("hmac accepts any key length");
    mac.update(builder.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Writes a key file for mounting into a container, once. An existing file
/// is left alone so concurrent launches for the same builder don't race.
pub async fn materialize_key_file(path: &Path, key: &[u8]) -> Result<()> {
    if tokio::fs::metadata(path).await.is_ok() {
        return Ok(());
    }
    tokio::fs::write(path, key).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    }
    Ok(())
}

//! GCE metadata and Compute Engine API access.
//!
//! Only the small slice the coordinator needs: project attributes and scopes
//! from the metadata service, and zone-scoped instance listing and deletion
//! from the compute API. The compute side sits behind a trait so the VM
//! reaper can be exercised against a scripted implementation.

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::OnceCell;

use crate::error::{CoordinatorError, Result};

const METADATA_BASE: &str = "http://metadata.google.internal/computeMetadata/v1";
const COMPUTE_BASE: &str = "https://www.googleapis.com/compute/v1";

/// Scope required to list and delete build VMs.
pub const COMPUTE_SCOPE: &str = "https://www.googleapis.com/auth/compute";

/// Client for the instance metadata service.
#[derive(Debug, Clone)]
pub struct MetadataClient {
    client: reqwest::Client,
    base: String,
}

impl MetadataClient {
    pub fn new(client: reqwest::Client) -> Self {
        Self::with_base(client, METADATA_BASE)
    }

    /// Points the client at a different metadata endpoint. Tests use this to
    /// stand in a local server.
    pub fn with_base(client: reqwest::Client, base: impl Into<String>) -> Self {
        Self {
            client,
            base: base.into(),
        }
    }

    async fn get(&self, path: &str) -> Result<String> {
        let res = self
            .client
            .get(format!("{}/{}", self.base, path))
            .header("Metadata-Flavor", "Google")
            .send()
            .await?;
        if res.status() != reqwest::StatusCode::OK {
            return Err(CoordinatorError::UnexpectedStatus(res.status()));
        }
        Ok(res.text().await?)
    }

    pub async fn project_id(&self) -> Result<String> {
        self.get("project/project-id").await
    }

    pub async fn project_attribute(&self, name: &str) -> Result<String> {
        self.get(&format!("project/attributes/{name}")).await
    }

    /// OAuth scopes of the default service account, one per line.
    pub async fn scopes(&self) -> Result<Vec<String>> {
        let body = self.get("instance/service-accounts/default/scopes").await?;
        Ok(body
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Access token of the default service account.
    pub async fn access_token(&self) -> Result<String> {
        #[derive(Deserialize)]
        struct TokenResponse {
            access_token: String,
        }
        let res = self
            .client
            .get(format!(
                "{}/instance/service-accounts/default/token",
                self.base
            ))
            .header("Metadata-Flavor", "Google")
            .send()
            .await?;
        if res.status() != reqwest::StatusCode::OK {
            return Err(CoordinatorError::UnexpectedStatus(res.status()));
        }
        Ok(res.json::<TokenResponse>().await?.access_token)
    }

    /// Whether this process can read and write Compute resources. Metadata
    /// errors (e.g. not running on GCE at all) count as no.
    pub async fn has_compute_scope(&self) -> bool {
        match self.scopes().await {
            Ok(scopes) => scopes.iter().any(|scope| scope == COMPUTE_SCOPE),
            Err(e) => {
                tracing::debug!(error = %e, "Could not query service account scopes");
                false
            }
        }
    }
}

/// One compute instance, as much of it as the reaper looks at.
#[derive(Debug, Clone, Deserialize)]
pub struct Instance {
    pub name: String,
    #[serde(default)]
    pub metadata: InstanceMetadata,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InstanceMetadata {
    #[serde(default)]
    pub items: Vec<MetadataItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetadataItem {
    pub key: String,
    #[serde(default)]
    pub value: Option<String>,
}

/// Zone-scoped compute operations used by the VM reaper.
#[async_trait]
pub trait ComputeApi: Send + Sync {
    /// First page of instances in a zone. Callers tolerate missing the rest;
    /// periodic sweeps will reach them eventually.
    async fn list_instances(&self, zone: &str) -> Result<Vec<Instance>>;

    async fn delete_instance(&self, zone: &str, name: &str) -> Result<()>;
}

/// Compute API over REST, authenticated with metadata-sourced tokens.
pub struct GceCompute {
    client: reqwest::Client,
    metadata: MetadataClient,
    project: OnceCell<String>,
}

impl GceCompute {
    pub fn new(client: reqwest::Client, metadata: MetadataClient) -> Self {
        Self {
            client,
            metadata,
            project: OnceCell::new(),
        }
    }

    /// Project id, fetched on first use so a metadata hiccup only fails the
    /// current sweep; the next sweep retries.
    async fn project(&self) -> Result<&str> {
        let project = self
            .project
            .get_or_try_init(|| self.metadata.project_id())
            .await?;
        Ok(project)
    }
}

#[async_trait]
impl ComputeApi for GceCompute {
    async fn list_instances(&self, zone: &str) -> Result<Vec<Instance>> {
        #[derive(Deserialize)]
        struct ListResponse {
            #[serde(default)]
            items: Vec<Instance>,
        }
        let project = self.project().await?;
        let token = self.metadata.access_token().await?;
        let res = self
            .client
            .get(format!(
                "{COMPUTE_BASE}/projects/{project}/zones/{zone}/instances"
            ))
            .bearer_auth(token)
            .send()
            .await?;
        if res.status() != reqwest::StatusCode::OK {
            return Err(CoordinatorError::UnexpectedStatus(res.status()));
        }
        Ok(res.json::<ListResponse>().await?.items)
    }

    async fn delete_instance(&self, zone: &str, name: &str) -> Result<()> {
        let project = self.project().await?;
        let token = self.metadata.access_token().await?;
        let res = self
            .client
            .delete(format!(
                "{COMPUTE_BASE}/projects/{project}/zones/{zone}/instances/{name}"
            ))
            .bearer_auth(token)
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(CoordinatorError::UnexpectedStatus(res.status()));
        }
        Ok(())
    }
}

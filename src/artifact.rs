//! Durable artifact store for generated images.
//!
//! Every completed job exposes its image from here, whatever the backend
//! returned: inline payloads are written straight to disk and hosted images
//! are downloaded first. Files are keyed by job id.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use reqwest::header::HeaderMap;
use serde::Serialize;
use tracing::{debug, error};

use crate::error::GatewayError;
use crate::jobs::JobId;
use crate::provider::{ProviderError, ProviderResult};
use crate::retry::{OutboundRequest, RetryClient};

/// URL prefix under which artifacts are served.
pub const ARTIFACT_ROUTE: &str = "/static";

/// Location of a materialised artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactRef {
    pub path: PathBuf,
    pub url: String,
}

pub struct ArtifactStore {
    root: PathBuf,
    public_base: String,
    http: Arc<RetryClient>,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>, public_base: impl Into<String>, http: Arc<RetryClient>) -> Self {
        Self {
            root: root.into(),
            public_base: public_base.into().trim_end_matches('/').to_string(),
            http,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn file_name(job_id: &JobId) -> String {
        format!("{job_id}.png")
    }

    pub fn path_for(&self, job_id: &JobId) -> PathBuf {
        self.root.join(Self::file_name(job_id))
    }

    pub fn url_for(&self, job_id: &JobId) -> String {
        format!("{}{ARTIFACT_ROUTE}/{}", self.public_base, Self::file_name(job_id))
    }

    /// Persist a backend result under `job_id` and return its local location.
    pub async fn materialize(
        &self,
        job_id: &JobId,
        result: ProviderResult,
    ) -> Result<ArtifactRef, ProviderError> {
        let bytes = match result {
            ProviderResult::Inline(bytes) => bytes,
            ProviderResult::Hosted(url) => {
                debug!(job_id = %job_id, "fetching hosted artifact");
                self.http.call(&OutboundRequest::get(url, HeaderMap::new())).await?
            }
        };
        if bytes.is_empty() {
            return Err(ProviderError::Permanent("empty_image_payload".into()));
        }
        self.write(job_id, &bytes).await
    }

    async fn write(&self, job_id: &JobId, bytes: &[u8]) -> Result<ArtifactRef, ProviderError> {
        tokio::fs::create_dir_all(&self.root).await?;
        let path = self.path_for(job_id);
        // Write-then-rename so readers never see a partial file.
        let tmp = path.with_extension("png.part");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(ArtifactRef {
            url: self.url_for(job_id),
            path,
        })
    }

    /// Read a stored artifact by file name. Names that are not plain
    /// `<job id>.png` file names, and missing files, yield `None`.
    pub async fn read(&self, file_name: &str) -> Result<Option<Vec<u8>>, GatewayError> {
        let Some(job_id) = file_name.strip_suffix(".png").and_then(JobId::parse) else {
            return Ok(None);
        };
        match tokio::fs::read(self.path_for(&job_id)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => {
                error!(job_id = %job_id, kind = ?err.kind(), "artifact read failed");
                Err(GatewayError::Internal(format!("artifact read: {err}")))
            }
        }
    }

    pub async fn remove(&self, job_id: &JobId) {
        if let Err(err) = tokio::fs::remove_file(self.path_for(job_id)).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                debug!(job_id = %job_id, kind = ?err.kind(), "failed to remove artifact");
            }
        }
    }
}

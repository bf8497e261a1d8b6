//! Blob store: persists the final mix and returns a stable URL
//!
//! Two backends behind one dispatch enum: a filesystem store that copies
//! into a served public directory, and an HTTP gateway store that PUTs
//! the artifact and reads the signed URL from the response.

use revoice_common::{Error, Result, Settings};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Clone)]
pub enum BlobStore {
    Fs(FsBlobStore),
    Http(HttpBlobStore),
}

impl BlobStore {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        match (&settings.blob_base_url, &settings.blob_public_dir) {
            (Some(base_url), None) if base_url.starts_with("http") => {
                Ok(BlobStore::Http(HttpBlobStore::new(base_url.clone())?))
            }
            (base_url, public_dir) => {
                let dir = public_dir
                    .clone()
                    .unwrap_or_else(|| settings.temp_root.join("public"));
                let url_base = base_url
                    .clone()
                    .unwrap_or_else(|| format!("file://{}", dir.display()));
                Ok(BlobStore::Fs(FsBlobStore::new(dir, url_base)))
            }
        }
    }

    /// Persist `local` under `bucket` and return its read URL
    pub async fn upload(&self, local: &Path, bucket: &str) -> Result<String> {
        match self {
            BlobStore::Fs(store) => store.upload(local, bucket).await,
            BlobStore::Http(store) => store.upload(local, bucket).await,
        }
    }
}

/// Copies artifacts into a directory served by something else
#[derive(Clone)]
pub struct FsBlobStore {
    public_dir: PathBuf,
    base_url: String,
}

impl FsBlobStore {
    pub fn new(public_dir: PathBuf, base_url: String) -> Self {
        Self {
            public_dir,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn upload(&self, local: &Path, bucket: &str) -> Result<String> {
        let file_name = local
            .file_name()
            .ok_or_else(|| Error::UploadFailed(format!("no file name in {}", local.display())))?
            .to_string_lossy()
            .to_string();
        let object_name = format!("{}-{file_name}", Uuid::new_v4());

        let bucket_dir = self.public_dir.join(bucket);
        tokio::fs::create_dir_all(&bucket_dir)
            .await
            .map_err(|e| Error::UploadFailed(format!("cannot create bucket dir: {e}")))?;

        let target = bucket_dir.join(&object_name);
        tokio::fs::copy(local, &target)
            .await
            .map_err(|e| Error::UploadFailed(format!("copy to blob store failed: {e}")))?;

        let url = format!("{}/{bucket}/{object_name}", self.base_url);
        info!(url = %url, "Artifact stored");
        Ok(url)
    }
}

/// PUTs artifacts to an object-store gateway that signs URLs
#[derive(Clone)]
pub struct HttpBlobStore {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpBlobStore {
    pub fn new(endpoint: String) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::Internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }

    async fn upload(&self, local: &Path, bucket: &str) -> Result<String> {
        let file_name = local
            .file_name()
            .ok_or_else(|| Error::UploadFailed(format!("no file name in {}", local.display())))?
            .to_string_lossy()
            .to_string();
        let object_name = format!("{}-{file_name}", Uuid::new_v4());
        let bytes = tokio::fs::read(local)
            .await
            .map_err(|e| Error::UploadFailed(format!("cannot read artifact: {e}")))?;

        let url = format!("{}/{bucket}/{object_name}", self.endpoint);
        debug!(url = %url, bytes = bytes.len(), "Uploading artifact");

        let response = self
            .http
            .put(&url)
            .header(reqwest::header::CONTENT_TYPE, "audio/wav")
            .body(bytes)
            .send()
            .await
            .map_err(|e| Error::UploadFailed(format!("upload request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::UploadFailed(format!(
                "gateway returned {}",
                response.status()
            )));
        }

        // the gateway answers with the signed read URL
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Error::UploadFailed(format!("unparseable gateway response: {e}")))?;
        let signed = body
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::UploadFailed("gateway response without url".to_string()))?;

        info!(url = %signed, "Artifact stored");
        Ok(signed.to_string())
    }
}

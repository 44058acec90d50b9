//! Detection artifacts: stage a crop on local disk, upload it, clean up.
//!
//! A staged file never outlives the `stage_and_upload` call that created it:
//! the `StagedArtifact` guard removes it on drop, on the success path and on
//! every failure path alike.

use anyhow::{anyhow, Context, Result};
use image::RgbImage;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

use crate::config::ArtifactSettings;
use crate::error::EdgeError;

const UPLOAD_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_OBJECT_BYTES: u64 = 16 * 1024 * 1024;

/// Remote object storage addressed by `(bucket, key)`.
pub trait ObjectStore: Send + Sync {
    fn put(&self, bucket: &str, key: &str, body: &[u8]) -> Result<()>;

    fn delete(&self, bucket: &str, key: &str) -> Result<()>;

    fn fetch(&self, bucket: &str, key: &str) -> Result<Vec<u8>>;
}

/// Where an uploaded artifact landed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ArtifactMetadata {
    pub size_bytes: u64,
    pub bucket: String,
    pub key: String,
}

/// Stages crops locally and uploads them to an `ObjectStore`.
pub struct ArtifactStore {
    store: Box<dyn ObjectStore>,
    staging_dir: PathBuf,
    bucket: String,
    key_prefix: String,
}

impl ArtifactStore {
    pub fn new(store: Box<dyn ObjectStore>, settings: &ArtifactSettings) -> Self {
        Self {
            store,
            staging_dir: settings.staging_dir.clone(),
            bucket: settings.bucket.clone(),
            key_prefix: settings.key_prefix.clone(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// Object key for an artifact id.
    pub fn key_for(&self, id: &str) -> String {
        let file_name = artifact_file_name(id);
        if self.key_prefix.is_empty() {
            file_name
        } else {
            format!("{}/{}", self.key_prefix, file_name)
        }
    }

    /// Stage `crop` as PNG, upload it, and delete the staged file.
    ///
    /// Errors carry `EdgeError::Staging` or `EdgeError::Upload`; both are
    /// per-detection failures for the caller.
    pub fn stage_and_upload(&self, crop: &RgbImage, id: &str) -> Result<ArtifactMetadata> {
        let staged = StagedArtifact::write(&self.staging_dir, id, crop)?;
        let key = self.key_for(id);

        let body = staged.read()?;
        log::debug!(
            "copying {} to {}/{}",
            staged.path().display(),
            self.bucket,
            key
        );
        self.store
            .put(&self.bucket, &key, &body)
            .map_err(|e| EdgeError::Upload(format!("{}/{}: {:#}", self.bucket, key, e)))?;
        log::debug!("copied {} to {}/{}", staged.path().display(), self.bucket, key);

        Ok(ArtifactMetadata {
            size_bytes: body.len() as u64,
            bucket: self.bucket.clone(),
            key,
        })
    }
}

fn artifact_file_name(id: &str) -> String {
    format!("recognized_face_{}.png", id)
}

/// Random 128-bit hex token, unique across ticks and restarts.
pub fn new_artifact_id() -> String {
    let bytes: [u8; 16] = rand::random();
    hex::encode(bytes)
}

/// A crop written to local disk; removed when dropped.
pub struct StagedArtifact {
    path: PathBuf,
}

impl StagedArtifact {
    fn write(dir: &Path, id: &str, crop: &RgbImage) -> Result<Self> {
        if crop.width() == 0 || crop.height() == 0 {
            return Err(EdgeError::Staging("crop is empty".to_string()).into());
        }
        std::fs::create_dir_all(dir).map_err(|e| {
            EdgeError::Staging(format!("failed to create {}: {}", dir.display(), e))
        })?;
        let path = dir.join(artifact_file_name(id));
        log::debug!("saving crop to {}", path.display());
        // Guard first so a partially written file is removed too.
        let staged = Self { path };
        crop.save_with_format(&staged.path, image::ImageFormat::Png)
            .map_err(|e| {
                EdgeError::Staging(format!("failed to write {}: {}", staged.path.display(), e))
            })?;
        Ok(staged)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        std::fs::File::open(&self.path)
            .and_then(|mut file| file.read_to_end(&mut body))
            .map_err(|e| {
                EdgeError::Staging(format!("failed to read {}: {}", self.path.display(), e))
            })?;
        Ok(body)
    }
}

impl Drop for StagedArtifact {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => log::debug!("deleted {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("the file {} does not exist", self.path.display())
            }
            Err(e) => log::error!("error deleting file {}: {}", self.path.display(), e),
        }
    }
}

// ----------------------------------------------------------------------------
// HTTP object store
// ----------------------------------------------------------------------------

/// S3-compatible object store using path-style `PUT`/`DELETE`
/// `{endpoint}/{bucket}/{key}`.
///
/// Credentials are out of scope: an optional bearer token is forwarded as-is,
/// anything else must be handled by the endpoint (e.g. a local signing proxy).
pub struct HttpObjectStore {
    endpoint: Url,
    token: Option<String>,
    agent: ureq::Agent,
}

impl HttpObjectStore {
    pub fn new(endpoint: &str, token: Option<String>) -> Result<Self> {
        let mut endpoint = Url::parse(endpoint)
            .with_context(|| format!("invalid object store endpoint '{}'", endpoint))?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            return Err(anyhow!(
                "unsupported object store scheme '{}'; expected http(s)",
                endpoint.scheme()
            ));
        }
        if !endpoint.path().ends_with('/') {
            let path = format!("{}/", endpoint.path());
            endpoint.set_path(&path);
        }
        let agent = ureq::AgentBuilder::new().timeout(UPLOAD_TIMEOUT).build();
        Ok(Self {
            endpoint,
            token,
            agent,
        })
    }

    pub fn from_settings(settings: &ArtifactSettings) -> Result<Self> {
        Self::new(&settings.endpoint, settings.token.clone())
    }

    fn object_url(&self, bucket: &str, key: &str) -> Result<Url> {
        self.endpoint
            .join(&format!("{}/{}", bucket, key))
            .with_context(|| format!("invalid object path {}/{}", bucket, key))
    }

    fn authorize(&self, request: ureq::Request) -> ureq::Request {
        match &self.token {
            Some(token) => request.set("Authorization", &format!("Bearer {}", token)),
            None => request,
        }
    }
}

impl ObjectStore for HttpObjectStore {
    fn put(&self, bucket: &str, key: &str, body: &[u8]) -> Result<()> {
        let url = self.object_url(bucket, key)?;
        let request = self
            .agent
            .put(url.as_str())
            .set("Content-Type", "image/png");
        self.authorize(request)
            .send_bytes(body)
            .with_context(|| format!("PUT {}", url))?;
        Ok(())
    }

    fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        let url = self.object_url(bucket, key)?;
        match self.authorize(self.agent.delete(url.as_str())).call() {
            Ok(_) | Err(ureq::Error::Status(404, _)) => Ok(()),
            Err(e) => Err(anyhow!("DELETE {}: {}", url, e)),
        }
    }

    fn fetch(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        let url = self.object_url(bucket, key)?;
        let response = self
            .authorize(self.agent.get(url.as_str()))
            .call()
            .with_context(|| format!("GET {}", url))?;
        let mut body = Vec::new();
        response
            .into_reader()
            .take(MAX_OBJECT_BYTES)
            .read_to_end(&mut body)
            .with_context(|| format!("read body of {}", url))?;
        Ok(body)
    }
}

// ----------------------------------------------------------------------------
// In-memory object store
// ----------------------------------------------------------------------------

/// Object store kept in memory, for tests and dry runs. Clones share storage.
#[derive(Clone, Default)]
pub struct MemoryObjectStore {
    objects: Arc<Mutex<BTreeMap<(String, String), Vec<u8>>>>,
    fail_puts: Arc<Mutex<Option<String>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `put` fail with `message`; `None` restores uploads.
    pub fn fail_puts(&self, message: Option<&str>) {
        let mut guard = self.fail_puts.lock().unwrap_or_else(|p| p.into_inner());
        *guard = message.map(str::to_string);
    }

    pub fn get(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        let guard = self.objects.lock().unwrap_or_else(|p| p.into_inner());
        guard.get(&(bucket.to_string(), key.to_string())).cloned()
    }

    pub fn keys(&self) -> Vec<(String, String)> {
        let guard = self.objects.lock().unwrap_or_else(|p| p.into_inner());
        guard.keys().cloned().collect()
    }
}

impl ObjectStore for MemoryObjectStore {
    fn put(&self, bucket: &str, key: &str, body: &[u8]) -> Result<()> {
        if let Some(message) = self
            .fail_puts
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
        {
            return Err(anyhow!(message));
        }
        let mut guard = self.objects.lock().unwrap_or_else(|p| p.into_inner());
        guard.insert((bucket.to_string(), key.to_string()), body.to_vec());
        Ok(())
    }

    fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        let mut guard = self.objects.lock().unwrap_or_else(|p| p.into_inner());
        guard.remove(&(bucket.to_string(), key.to_string()));
        Ok(())
    }

    fn fetch(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        self.get(bucket, key)
            .ok_or_else(|| anyhow!("no object {}/{}", bucket, key))
    }
}

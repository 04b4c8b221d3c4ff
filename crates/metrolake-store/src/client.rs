//! Object store client
//!
//! A small sync facade over the `object_store` crate. Every call blocks on
//! the shared tokio runtime and is bounded by a timeout; expiry surfaces as
//! a retryable [`StoreError::Timeout`]. No retries happen here.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::TryStreamExt;
use metrolake_core::{StoreError, block_on_timeout};
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use serde::{Deserialize, Serialize};

/// Operations the lake needs from an S3-compatible store.
pub trait ObjectStoreClient: Send + Sync {
    fn put(&self, key: &str, data: Bytes) -> Result<(), StoreError>;

    /// Fetch an object. Missing objects are [`StoreError::NotFound`].
    fn get(&self, key: &str) -> Result<Bytes, StoreError>;

    /// Keys starting with `prefix`, sorted.
    fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    fn exists(&self, key: &str) -> Result<bool, StoreError>;

    fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Move an object. The destination appears whole or not at all.
    fn rename(&self, from: &str, to: &str) -> Result<(), StoreError>;
}

/// Backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    S3,
    Local,
    Memory,
}

/// `[store]` configuration section. Credentials arrive already resolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    #[serde(default = "default_kind")]
    pub kind: StoreKind,
    /// S3 endpoint (MinIO URL); `None` means AWS.
    pub endpoint: Option<String>,
    #[serde(default = "default_bucket")]
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    #[serde(default)]
    pub allow_http: bool,
    /// Root directory for the `local` backend.
    pub path: Option<PathBuf>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_kind() -> StoreKind {
    StoreKind::S3
}

fn default_bucket() -> String {
    "pd1".into()
}

fn default_region() -> String {
    "us-east-1".into()
}

fn default_timeout_secs() -> u64 {
    60
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            kind: default_kind(),
            endpoint: None,
            bucket: default_bucket(),
            region: default_region(),
            access_key: None,
            secret_key: None,
            allow_http: false,
            path: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// [`ObjectStoreClient`] backed by any `object_store` implementation.
pub struct LakeStore {
    inner: Arc<dyn ObjectStore>,
    timeout: Duration,
    description: String,
}

impl std::fmt::Debug for LakeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LakeStore")
            .field("backend", &self.description)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl LakeStore {
    pub fn new(inner: Arc<dyn ObjectStore>, timeout: Duration) -> Self {
        let description = inner.to_string();
        Self {
            inner,
            timeout,
            description,
        }
    }

    /// Build the backend named by `settings.kind`.
    pub fn from_settings(settings: &StoreSettings) -> Result<Self, StoreError> {
        let timeout = Duration::from_secs(settings.timeout_secs);
        match settings.kind {
            StoreKind::S3 => Self::s3(settings),
            StoreKind::Local => {
                let path = settings.path.as_ref().ok_or_else(|| {
                    StoreError::Rejected("local store requires 'path'".to_string())
                })?;
                Self::local(path, timeout)
            }
            StoreKind::Memory => Ok(Self::in_memory(timeout)),
        }
    }

    /// S3-compatible bucket (MinIO in development).
    pub fn s3(settings: &StoreSettings) -> Result<Self, StoreError> {
        let mut builder = AmazonS3Builder::new()
            .with_bucket_name(&settings.bucket)
            .with_region(&settings.region)
            .with_allow_http(settings.allow_http);
        if let Some(endpoint) = &settings.endpoint {
            builder = builder.with_endpoint(endpoint);
        }
        if let Some(key) = &settings.access_key {
            builder = builder.with_access_key_id(key);
        }
        if let Some(secret) = &settings.secret_key {
            builder = builder.with_secret_access_key(secret);
        }

        let store = builder
            .build()
            .map_err(|e| StoreError::Rejected(format!("failed to create S3 store: {e}")))?;
        Ok(Self::new(
            Arc::new(store),
            Duration::from_secs(settings.timeout_secs),
        ))
    }

    /// Directory on the local filesystem; created if missing.
    pub fn local(root: &std::path::Path, timeout: Duration) -> Result<Self, StoreError> {
        std::fs::create_dir_all(root).map_err(|e| {
            StoreError::Rejected(format!("failed to create {}: {e}", root.display()))
        })?;
        let store = LocalFileSystem::new_with_prefix(root)
            .map_err(|e| StoreError::Rejected(format!("failed to create local store: {e}")))?;
        Ok(Self::new(Arc::new(store), timeout))
    }

    pub fn in_memory(timeout: Duration) -> Self {
        Self::new(Arc::new(InMemory::new()), timeout)
    }

    /// Run one store future with the configured timeout.
    fn call<T>(
        &self,
        op: &str,
        fut: impl std::future::Future<Output = Result<T, object_store::Error>>,
    ) -> Result<T, StoreError> {
        match block_on_timeout(self.timeout, fut) {
            Some(result) => result.map_err(map_err),
            None => Err(StoreError::Timeout {
                op: op.to_string(),
                secs: self.timeout.as_secs(),
            }),
        }
    }
}

fn parse_path(key: &str) -> Result<Path, StoreError> {
    Path::parse(key).map_err(|e| StoreError::Rejected(format!("invalid object key {key:?}: {e}")))
}

fn map_err(e: object_store::Error) -> StoreError {
    match e {
        object_store::Error::NotFound { path, .. } => StoreError::NotFound(path),
        e @ (object_store::Error::Precondition { .. }
        | object_store::Error::AlreadyExists { .. }
        | object_store::Error::InvalidPath { .. }
        | object_store::Error::NotSupported { .. }
        | object_store::Error::NotImplemented
        | object_store::Error::UnknownConfigurationKey { .. }) => {
            StoreError::Rejected(e.to_string())
        }
        e => StoreError::Unavailable(e.to_string()),
    }
}

impl ObjectStoreClient for LakeStore {
    fn put(&self, key: &str, data: Bytes) -> Result<(), StoreError> {
        let path = parse_path(key)?;
        self.call("put", self.inner.put(&path, PutPayload::from(data)))
            .map(|_| ())
    }

    fn get(&self, key: &str) -> Result<Bytes, StoreError> {
        let path = parse_path(key)?;
        self.call("get", async {
            let result = self.inner.get(&path).await?;
            result.bytes().await
        })
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        // object_store lists by path segment; list the enclosing directory
        // and filter by string prefix.
        let dir = match prefix.rfind('/') {
            Some(idx) => &prefix[..idx],
            None => "",
        };
        let dir_path = if dir.is_empty() {
            None
        } else {
            Some(parse_path(dir)?)
        };

        let metas: Vec<object_store::ObjectMeta> = self.call("list", async {
            self.inner.list(dir_path.as_ref()).try_collect().await
        })?;

        let mut keys: Vec<String> = metas
            .into_iter()
            .map(|m| m.location.to_string())
            .filter(|k| k.starts_with(prefix))
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let path = parse_path(key)?;
        match self.call("head", self.inner.head(&path)) {
            Ok(_) => Ok(true),
            Err(StoreError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let path = parse_path(key)?;
        match self.call("delete", self.inner.delete(&path)) {
            Ok(()) | Err(StoreError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn rename(&self, from: &str, to: &str) -> Result<(), StoreError> {
        let from = parse_path(from)?;
        let to = parse_path(to)?;
        self.call("rename", self.inner.rename(&from, &to))
    }
}

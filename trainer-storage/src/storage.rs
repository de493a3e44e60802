//! Blob storage over `object_store`.
//!
//! A [`StorageDriver`] is rooted at a URI: `s3://bucket/prefix`, a
//! `file://` URI or a bare filesystem path. Every operation takes a key
//! relative to that root, and both backends report listings with the same
//! relative keys. Paging through S3 listings is handled by `object_store`.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use futures::TryStreamExt;
use object_store::ObjectStore;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::path::Path as ObjectPath;
use object_store::prefix::PrefixStore;
use serde::Serialize;
use url::Url;
use walkdir::WalkDir;

use crate::error::{Result, StorageError};

/// Where a storage URI points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageLocation {
    S3 { bucket: String, prefix: String },
    Local(PathBuf),
}

impl StorageLocation {
    /// Parse `s3://bucket/prefix`, `file:///path` or a bare path. Any other
    /// scheme is rejected.
    pub fn parse(uri: &str) -> Result<Self> {
        let uri = uri.trim();
        if uri.is_empty() {
            return Err(StorageError::InvalidUri {
                uri: uri.to_string(),
                reason: "empty URI".into(),
            });
        }
        let parsed = match Url::parse(uri) {
            Ok(url) => url,
            // No scheme: a plain filesystem path.
            Err(_) => return Ok(Self::Local(PathBuf::from(uri))),
        };
        match parsed.scheme() {
            "s3" => {
                let bucket = parsed.host_str().unwrap_or_default();
                if bucket.is_empty() {
                    return Err(StorageError::InvalidUri {
                        uri: uri.to_string(),
                        reason: "missing bucket".into(),
                    });
                }
                Ok(Self::S3 {
                    bucket: bucket.to_string(),
                    prefix: parsed.path().trim_matches('/').to_string(),
                })
            }
            "file" => Ok(Self::Local(PathBuf::from(parsed.path()))),
            // Windows drive letters parse as one-letter schemes.
            scheme if scheme.len() == 1 => Ok(Self::Local(PathBuf::from(uri))),
            scheme => Err(StorageError::InvalidUri {
                uri: uri.to_string(),
                reason: format!("scheme '{scheme}' is not supported, use s3:// or a filesystem path"),
            }),
        }
    }
}

/// Uniform blob access rooted at one storage URI.
#[derive(Clone)]
pub struct StorageDriver {
    store: Arc<dyn ObjectStore>,
    root: String,
}

impl fmt::Debug for StorageDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageDriver")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl StorageDriver {
    /// Build a driver for `uri`. Local roots are created if missing. S3
    /// credentials and region come from the standard `AWS_*` environment.
    pub fn from_uri(uri: &str) -> Result<Self> {
        let store: Arc<dyn ObjectStore> = match StorageLocation::parse(uri)? {
            StorageLocation::S3 { bucket, prefix } => {
                let s3 = AmazonS3Builder::from_env()
                    .with_bucket_name(bucket)
                    .build()?;
                if prefix.is_empty() {
                    Arc::new(s3)
                } else {
                    Arc::new(PrefixStore::new(s3, prefix))
                }
            }
            StorageLocation::Local(path) => {
                std::fs::create_dir_all(&path)?;
                let root = path.canonicalize()?;
                Arc::new(LocalFileSystem::new_with_prefix(root)?)
            }
        };
        tracing::debug!(uri = %uri, "Storage driver initialized");
        Ok(Self::with_store(store, uri))
    }

    /// Wrap an existing store; `root` is only used for logs.
    pub fn with_store(store: Arc<dyn ObjectStore>, root: impl Into<String>) -> Self {
        Self {
            store,
            root: root.into(),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub async fn upload_bytes(&self, relative: &str, payload: impl Into<Bytes>) -> Result<()> {
        let key = object_key(relative)?;
        let payload: Bytes = payload.into();
        self.store.put(&key, payload.into()).await?;
        tracing::trace!(root = %self.root, key = %key, "Object written");
        Ok(())
    }

    /// Serialize `value` as pretty JSON and upload it.
    pub async fn upload_json<T: Serialize + ?Sized>(&self, relative: &str, value: &T) -> Result<()> {
        let payload = serde_json::to_vec_pretty(value)?;
        self.upload_bytes(relative, payload).await
    }

    pub async fn upload_file(&self, relative: &str, local: &Path) -> Result<()> {
        let payload = tokio::fs::read(local).await?;
        self.upload_bytes(relative, payload).await
    }

    pub async fn download_bytes(&self, relative: &str) -> Result<Bytes> {
        let key = object_key(relative)?;
        let result = self
            .store
            .get(&key)
            .await
            .map_err(|e| StorageError::from_store(e, relative))?;
        result
            .bytes()
            .await
            .map_err(|e| StorageError::from_store(e, relative))
    }

    /// Write the object at `relative` to `destination`, creating parent
    /// directories. `NotFound` if the key does not exist.
    pub async fn download_file(&self, relative: &str, destination: &Path) -> Result<()> {
        let payload = self.download_bytes(relative).await?;
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(destination, &payload).await?;
        Ok(())
    }

    /// Upload every file under `source` to `remote_prefix`, keeping relative
    /// paths. Stops at the first failure; files already sent stay uploaded.
    pub async fn sync_directory(&self, source: &Path, remote_prefix: &str) -> Result<usize> {
        let prefix = remote_prefix.trim_matches('/');
        let mut uploaded = 0;
        for entry in WalkDir::new(source).follow_links(true) {
            let entry = entry.map_err(std::io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(source)
                .map_err(|_| StorageError::InvalidKey {
                    key: entry.path().display().to_string(),
                    reason: "not under the sync source".into(),
                })?;
            let relative = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            let key = if prefix.is_empty() {
                relative
            } else {
                format!("{prefix}/{relative}")
            };
            self.upload_file(&key, entry.path()).await?;
            uploaded += 1;
        }
        tracing::debug!(
            root = %self.root,
            source = %source.display(),
            prefix = %prefix,
            files = uploaded,
            "Directory synced"
        );
        Ok(uploaded)
    }

    /// Download every object under `remote_prefix` into `destination`,
    /// keeping the structure below the prefix.
    pub async fn download_prefix(&self, remote_prefix: &str, destination: &Path) -> Result<usize> {
        let prefix = remote_prefix.trim_matches('/');
        tokio::fs::create_dir_all(destination).await?;
        let keys = self.list_objects(prefix).await?;
        for key in &keys {
            let below = key
                .strip_prefix(prefix)
                .unwrap_or(key)
                .trim_start_matches('/');
            self.download_file(key, &destination.join(below)).await?;
        }
        tracing::debug!(
            root = %self.root,
            prefix = %prefix,
            destination = %destination.display(),
            files = keys.len(),
            "Prefix downloaded"
        );
        Ok(keys.len())
    }

    /// Sorted relative keys under `relative_prefix`. Directory markers are
    /// skipped.
    pub async fn list_objects(&self, relative_prefix: &str) -> Result<Vec<String>> {
        let trimmed = relative_prefix.trim_matches('/');
        let prefix = if trimmed.is_empty() {
            None
        } else {
            Some(object_key(trimmed)?)
        };
        let objects: Vec<_> = self.store.list(prefix.as_ref()).try_collect().await?;
        let mut keys: Vec<String> = objects
            .into_iter()
            .map(|meta| meta.location.to_string())
            .filter(|key| !key.ends_with('/') && key != trimmed)
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// Validate a relative key. Empty keys and `.`/`..` segments are rejected.
fn object_key(relative: &str) -> Result<ObjectPath> {
    let trimmed = relative.trim_matches('/');
    if trimmed.is_empty() {
        return Err(StorageError::InvalidKey {
            key: relative.to_string(),
            reason: "empty key".into(),
        });
    }
    ObjectPath::parse(trimmed).map_err(|e| StorageError::InvalidKey {
        key: relative.to_string(),
        reason: e.to_string(),
    })
}

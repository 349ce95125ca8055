//! Filesystem-backed object storage: one directory per bucket.
//!
//! Intended for single-node deployments and local development. A bucket is
//! `<root>/<bucket name>`; deleting a bucket removes everything under it.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use tenantforge_core::TenantSlug;

use super::{BackendError, ObjectStorage};

#[derive(Debug, Clone)]
pub struct LocalObjectStorage {
    root: PathBuf,
}

impl LocalObjectStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn bucket_path(&self, slug: &TenantSlug) -> PathBuf {
        self.root.join(slug.bucket_name())
    }
}

fn map_io_error(operation: &str, path: &Path, err: std::io::Error) -> BackendError {
    let msg = format!("{operation} {}: {err}", path.display());
    match err.kind() {
        ErrorKind::NotFound => BackendError::NotFound(msg),
        ErrorKind::AlreadyExists => BackendError::AlreadyExists(msg),
        ErrorKind::PermissionDenied => BackendError::Rejected(msg),
        _ => BackendError::Unavailable(msg),
    }
}

#[async_trait]
impl ObjectStorage for LocalObjectStorage {
    async fn create_bucket(&self, slug: &TenantSlug) -> Result<(), BackendError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| map_io_error("create storage root", &self.root, e))?;

        let path = self.bucket_path(slug);
        // `create_dir` (not `_all`) so an existing bucket is reported.
        tokio::fs::create_dir(&path)
            .await
            .map_err(|e| map_io_error("create bucket", &path, e))?;
        debug!(bucket = %path.display(), "bucket created");
        Ok(())
    }

    async fn delete_bucket(&self, slug: &TenantSlug) -> Result<(), BackendError> {
        let path = self.bucket_path(slug);
        tokio::fs::remove_dir_all(&path)
            .await
            .map_err(|e| map_io_error("delete bucket", &path, e))?;
        debug!(bucket = %path.display(), "bucket deleted");
        Ok(())
    }
}

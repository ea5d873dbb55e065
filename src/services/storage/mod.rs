//! Blob storage backends.
//!
//! A backend exposes a small set of primitives (temp write, existence check,
//! server-side copy, public-read grant, delete, download). The commit step
//! that turns a temporary upload into a content-addressed object,
//! [`Storage::move_to_content_address`], is written once on top of those
//! primitives so every backend deduplicates the same way.
//!
//! Two implementations ship with the crate:
//! - [`memory::MemoryStorage`]: bucket → name → bytes map, for tests and
//!   single-process deployments.
//! - [`remote::ObjectStoreStorage`]: any provider reachable through the
//!   `object_store` crate (GCS, S3, local files).

pub mod memory;
pub mod remote;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::io;
use thiserror::Error;
use tokio::io::AsyncWrite;
use tracing::{debug, warn};

/// Body handed to [`Storage::upload_temp`].
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("bucket `{0}` not found")]
    BucketNotFound(String),
    #[error("blob `{name}` not found in bucket `{bucket}`")]
    BlobNotFound { bucket: String, name: String },
    #[error("invalid storage location `{0}`")]
    InvalidLocation(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    ObjectStore(#[from] object_store::Error),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StorageError::BucketNotFound(_) | StorageError::BlobNotFound { .. }
        )
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// How [`Storage::move_to_content_address`] resolved a temporary object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveOutcome {
    /// The content was new and now lives at its address.
    Stored,
    /// Identical content was already stored; the temp object was dropped.
    Deduplicated,
}

#[async_trait]
pub trait Storage: Send + Sync {
    /// Durably write `body` under `bucket/name` and return the bytes written.
    ///
    /// The body is consumed sequentially; an error from it is returned as
    /// [`StorageError::Io`] with the original error inside.
    async fn upload_temp(&self, bucket: &str, name: &str, body: ByteStream) -> StorageResult<u64>;

    /// Remove an object. A missing object is not an error.
    async fn delete(&self, bucket: &str, name: &str) -> StorageResult<()>;

    /// Whether an object exists at `bucket/name`.
    async fn exists(&self, bucket: &str, name: &str) -> StorageResult<bool>;

    /// Copy `from` to `to` within one bucket, overwriting `to`.
    async fn copy(&self, bucket: &str, from: &str, to: &str) -> StorageResult<()>;

    /// Make an object readable without credentials.
    async fn grant_public_read(&self, bucket: &str, name: &str) -> StorageResult<()>;

    /// Stream an object into `sink`, returning the bytes written.
    async fn download(
        &self,
        bucket: &str,
        name: &str,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> StorageResult<u64>;

    /// Commit a temporary object to its content-addressed name.
    ///
    /// If `final_name` already exists the temp object is redundant and is
    /// dropped without copying. Otherwise it is copied (not renamed), made
    /// public and then dropped. Dropping the temp object is best-effort and
    /// never fails the move; a failed copy or grant does.
    async fn move_to_content_address(
        &self,
        bucket: &str,
        temp_name: &str,
        final_name: &str,
    ) -> StorageResult<MoveOutcome> {
        if self.exists(bucket, final_name).await? {
            debug!(bucket, temp = temp_name, address = final_name, "content already stored");
            delete_best_effort(self, bucket, temp_name).await;
            return Ok(MoveOutcome::Deduplicated);
        }

        self.copy(bucket, temp_name, final_name).await?;
        self.grant_public_read(bucket, final_name).await?;
        delete_best_effort(self, bucket, temp_name).await;
        debug!(bucket, temp = temp_name, address = final_name, "stored new content");
        Ok(MoveOutcome::Stored)
    }
}

/// Delete an object and log, rather than return, any failure.
pub async fn delete_best_effort<S>(storage: &S, bucket: &str, name: &str)
where
    S: Storage + ?Sized,
{
    if let Err(err) = storage.delete(bucket, name).await {
        warn!(bucket, name, error = %err, "failed to delete temporary upload");
    }
}

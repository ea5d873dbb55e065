//! In-memory storage backend.

use super::{ByteStream, Storage, StorageError, StorageResult};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use std::collections::HashMap;
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::RwLock,
};

#[derive(Clone, Debug)]
struct StoredObject {
    data: Bytes,
    public_read: bool,
}

/// Bucket → name → bytes, guarded by one lock.
///
/// Buckets are created lazily by the first temp write into them.
#[derive(Default)]
pub struct MemoryStorage {
    buckets: RwLock<HashMap<String, HashMap<String, StoredObject>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
impl MemoryStorage {
    /// Sorted names of every object in `bucket`.
    pub async fn object_names(&self, bucket: &str) -> Vec<String> {
        let buckets = self.buckets.read().await;
        let mut names: Vec<String> = buckets
            .get(bucket)
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Raw bytes of an object, if present.
    pub async fn object(&self, bucket: &str, name: &str) -> Option<Bytes> {
        let buckets = self.buckets.read().await;
        buckets
            .get(bucket)
            .and_then(|objects| objects.get(name))
            .map(|object| object.data.clone())
    }

    pub async fn is_public(&self, bucket: &str, name: &str) -> bool {
        let buckets = self.buckets.read().await;
        buckets
            .get(bucket)
            .and_then(|objects| objects.get(name))
            .is_some_and(|object| object.public_read)
    }
}

fn blob_not_found(bucket: &str, name: &str) -> StorageError {
    StorageError::BlobNotFound {
        bucket: bucket.to_string(),
        name: name.to_string(),
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn upload_temp(
        &self,
        bucket: &str,
        name: &str,
        mut body: ByteStream,
    ) -> StorageResult<u64> {
        // Buffer outside the lock so concurrent uploads don't serialize on it.
        let mut buf = BytesMut::new();
        while let Some(chunk) = body.next().await {
            buf.extend_from_slice(&chunk?);
        }
        let written = buf.len() as u64;

        let mut buckets = self.buckets.write().await;
        buckets.entry(bucket.to_string()).or_default().insert(
            name.to_string(),
            StoredObject {
                data: buf.freeze(),
                public_read: false,
            },
        );
        Ok(written)
    }

    async fn delete(&self, bucket: &str, name: &str) -> StorageResult<()> {
        let mut buckets = self.buckets.write().await;
        if let Some(objects) = buckets.get_mut(bucket) {
            objects.remove(name);
        }
        Ok(())
    }

    async fn exists(&self, bucket: &str, name: &str) -> StorageResult<bool> {
        let buckets = self.buckets.read().await;
        Ok(buckets
            .get(bucket)
            .is_some_and(|objects| objects.contains_key(name)))
    }

    async fn copy(&self, bucket: &str, from: &str, to: &str) -> StorageResult<()> {
        let mut buckets = self.buckets.write().await;
        let objects = buckets
            .get_mut(bucket)
            .ok_or_else(|| StorageError::BucketNotFound(bucket.to_string()))?;
        let data = objects
            .get(from)
            .map(|object| object.data.clone())
            .ok_or_else(|| blob_not_found(bucket, from))?;
        objects.insert(
            to.to_string(),
            StoredObject {
                data,
                public_read: false,
            },
        );
        Ok(())
    }

    async fn grant_public_read(&self, bucket: &str, name: &str) -> StorageResult<()> {
        let mut buckets = self.buckets.write().await;
        let objects = buckets
            .get_mut(bucket)
            .ok_or_else(|| StorageError::BucketNotFound(bucket.to_string()))?;
        let object = objects
            .get_mut(name)
            .ok_or_else(|| blob_not_found(bucket, name))?;
        object.public_read = true;
        Ok(())
    }

    async fn download(
        &self,
        bucket: &str,
        name: &str,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> StorageResult<u64> {
        // Clone the handle so the lock is not held while the sink applies
        // backpressure.
        let data = {
            let buckets = self.buckets.read().await;
            let objects = buckets
                .get(bucket)
                .ok_or_else(|| StorageError::BucketNotFound(bucket.to_string()))?;
            objects
                .get(name)
                .map(|object| object.data.clone())
                .ok_or_else(|| blob_not_found(bucket, name))?
        };
        sink.write_all(&data).await?;
        sink.flush().await?;
        Ok(data.len() as u64)
    }
}

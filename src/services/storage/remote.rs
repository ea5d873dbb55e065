//! Network object-store backend built on the `object_store` crate.
//!
//! Each logical bucket maps to one configured `ObjectStore` plus an optional
//! key prefix. The same code serves GCS, S3 and local files; tests run it
//! against `object_store::memory::InMemory`.

use super::{ByteStream, Storage, StorageError, StorageResult};
use async_trait::async_trait;
use futures::StreamExt;
use object_store::{ObjectStore, WriteMultipart, path::Path};
use std::{collections::HashMap, env, sync::Arc};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};
use url::Url;

#[derive(Clone)]
struct BucketHandle {
    store: Arc<dyn ObjectStore>,
    prefix: Path,
}

impl BucketHandle {
    fn location(&self, name: &str) -> Path {
        if self.prefix.as_ref().is_empty() {
            Path::from(name)
        } else {
            Path::from(format!("{}/{}", self.prefix, name))
        }
    }
}

/// Storage over one or more `object_store` buckets.
#[derive(Clone, Default)]
pub struct ObjectStoreStorage {
    buckets: HashMap<String, BucketHandle>,
}

impl ObjectStoreStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `store` as the backing store for `bucket`.
    pub fn with_bucket(
        mut self,
        bucket: impl Into<String>,
        store: Arc<dyn ObjectStore>,
        prefix: Path,
    ) -> Self {
        self.buckets
            .insert(bucket.into(), BucketHandle { store, prefix });
        self
    }

    /// Build a single-bucket backend from a URL such as `gs://name/prefix`,
    /// `s3://name` or `file:///var/lib/blobs`. Credentials and provider
    /// settings come from `AWS_*` and `GOOGLE_*` environment variables
    /// (e.g. `GOOGLE_SERVICE_ACCOUNT`, `AWS_ACCESS_KEY_ID`).
    pub fn from_url(bucket: &str, url: &str) -> StorageResult<Self> {
        let vars = env::vars_os().filter_map(|(key, value)| {
            Some((key.into_string().ok()?, value.into_string().ok()?))
        });
        Self::from_url_with_options(bucket, url, provider_options(vars))
    }

    /// Like [`from_url`](Self::from_url) with explicit builder options, keyed
    /// the way `object_store` names them (`google_service_account`,
    /// `aws_access_key_id`, ...).
    pub fn from_url_with_options<I, K, V>(
        bucket: &str,
        url: &str,
        options: I,
    ) -> StorageResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let parsed = Url::parse(url).map_err(|_| StorageError::InvalidLocation(url.to_string()))?;
        let (store, prefix) = object_store::parse_url_opts(&parsed, options)?;
        debug!(bucket, url, prefix = %prefix, "configured object store bucket");
        Ok(Self::new().with_bucket(bucket, Arc::from(store), prefix))
    }

    fn handle(&self, bucket: &str) -> StorageResult<&BucketHandle> {
        self.buckets
            .get(bucket)
            .ok_or_else(|| StorageError::BucketNotFound(bucket.to_string()))
    }
}

/// Environment prefixes read by the provider builders.
const PROVIDER_ENV_PREFIXES: [&str; 2] = ["aws_", "google_"];

/// Provider settings among `vars`, with keys lowercased to builder option
/// names. Everything else is dropped so unrelated variables never reach a
/// builder.
fn provider_options<I>(vars: I) -> Vec<(String, String)>
where
    I: IntoIterator<Item = (String, String)>,
{
    vars.into_iter()
        .map(|(key, value)| (key.to_ascii_lowercase(), value))
        .filter(|(key, _)| PROVIDER_ENV_PREFIXES.iter().any(|p| key.starts_with(p)))
        .collect()
}

fn map_not_found(err: object_store::Error, bucket: &str, name: &str) -> StorageError {
    match err {
        object_store::Error::NotFound { .. } => StorageError::BlobNotFound {
            bucket: bucket.to_string(),
            name: name.to_string(),
        },
        other => StorageError::ObjectStore(other),
    }
}

#[async_trait]
impl Storage for ObjectStoreStorage {
    async fn upload_temp(
        &self,
        bucket: &str,
        name: &str,
        mut body: ByteStream,
    ) -> StorageResult<u64> {
        let handle = self.handle(bucket)?;
        let location = handle.location(name);

        let upload = handle.store.put_multipart(&location).await?;
        let mut writer = WriteMultipart::new(upload);
        let mut written: u64 = 0;
        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    if let Err(abort_err) = writer.abort().await {
                        warn!(bucket, name, error = %abort_err, "failed to abort multipart upload");
                    }
                    return Err(StorageError::Io(err));
                }
            };
            writer.wait_for_capacity(1).await?;
            written += chunk.len() as u64;
            writer.write(&chunk);
        }
        writer.finish().await?;
        Ok(written)
    }

    async fn delete(&self, bucket: &str, name: &str) -> StorageResult<()> {
        let handle = self.handle(bucket)?;
        match handle.store.delete(&handle.location(name)).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn exists(&self, bucket: &str, name: &str) -> StorageResult<bool> {
        let handle = self.handle(bucket)?;
        match handle.store.head(&handle.location(name)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn copy(&self, bucket: &str, from: &str, to: &str) -> StorageResult<()> {
        let handle = self.handle(bucket)?;
        handle
            .store
            .copy(&handle.location(from), &handle.location(to))
            .await
            .map_err(|err| map_not_found(err, bucket, from))
    }

    async fn grant_public_read(&self, bucket: &str, name: &str) -> StorageResult<()> {
        // object_store has no per-object ACLs; public access is a bucket
        // policy on every provider it fronts.
        self.handle(bucket)?;
        debug!(bucket, name, "public read governed by bucket policy");
        Ok(())
    }

    async fn download(
        &self,
        bucket: &str,
        name: &str,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> StorageResult<u64> {
        let handle = self.handle(bucket)?;
        let result = handle
            .store
            .get(&handle.location(name))
            .await
            .map_err(|err| map_not_found(err, bucket, name))?;

        let mut stream = result.into_stream();
        let mut written: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            sink.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        sink.flush().await?;
        Ok(written)
    }
}

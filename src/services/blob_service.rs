//! Content-addressed upload pipeline and the matching download path.
//!
//! An upload fans the incoming stream out to a SHA-1 digest and to a
//! temporary object in the backend, concurrently and with bounded buffering.
//! Three tasks take part:
//!
//! - the tee driver, which reads the source and feeds both branches,
//! - the digest task, which hashes its branch,
//! - the write task, which streams its branch into `tmp/<uuid>`.
//!
//! They share one cancellation token. The first task to fail for a reason
//! of its own trips it; the others then fail with an abort echo, which is
//! never reported in place of the original cause. [`BlobService::upload`]
//! always waits for all three to finish before it looks at the outcome.
//!
//! Once everything succeeded the temp object is moved to its content
//! address (the backend deduplicates), indexed in the datastore, and the
//! principal is charged for the bytes.

use crate::{
    models::{collection::Item, content_address::ContentAddress},
    services::{
        datastore::{Datastore, DatastoreError},
        storage::{Storage, StorageError, delete_best_effort},
        tee::{self, TeeError},
        usage_tracker::UsageTracker,
    },
};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use sha1::{Digest, Sha1};
use std::{
    io,
    sync::{Arc, OnceLock},
};
use thiserror::Error;
use tokio::{io::AsyncWrite, runtime::Handle, task::JoinError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Chunks buffered per tee branch.
const TEE_CAPACITY: usize = 8;

/// Namespace for in-flight uploads inside a bucket.
const TEMP_PREFIX: &str = "tmp/";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Tee(#[from] TeeError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Datastore(#[from] DatastoreError),
    #[error("upload task failed: {0}")]
    Task(#[from] JoinError),
}

impl PipelineError {
    /// True for errors that only report that another task already failed.
    fn is_abort_echo(&self) -> bool {
        match self {
            PipelineError::Tee(TeeError::Aborted | TeeError::SinkClosed) => true,
            PipelineError::Io(err) | PipelineError::Storage(StorageError::Io(err)) => {
                tee::is_aborted(err)
            }
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            PipelineError::Storage(err) => err.is_not_found(),
            PipelineError::Datastore(err) => err.is_not_found(),
            _ => false,
        }
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Copy,
    Digest,
    Write,
}

/// Remembers which task failed first and stops the rest.
struct FirstFailure {
    token: CancellationToken,
    stage: OnceLock<Stage>,
}

impl FirstFailure {
    fn new(token: CancellationToken) -> Self {
        Self {
            token,
            stage: OnceLock::new(),
        }
    }

    /// Pass `result` through, recording `stage` if it failed on its own.
    fn observe<T>(&self, stage: Stage, result: PipelineResult<T>) -> PipelineResult<T> {
        if let Err(err) = &result {
            if !err.is_abort_echo() {
                let _ = self.stage.set(stage);
                self.token.cancel();
            }
        }
        result
    }

    fn first(&self) -> Option<Stage> {
        self.stage.get().copied()
    }
}

/// Upload and download entry points shared by every request handler.
#[derive(Clone)]
pub struct BlobService {
    storage: Arc<dyn Storage>,
    datastore: Arc<dyn Datastore>,
    usage: UsageTracker,
    bucket: String,
}

impl BlobService {
    pub fn new(
        storage: Arc<dyn Storage>,
        datastore: Arc<dyn Datastore>,
        usage: UsageTracker,
        bucket: impl Into<String>,
    ) -> Self {
        Self {
            storage,
            datastore,
            usage,
            bucket: bucket.into(),
        }
    }

    /// Store one uploaded file and index it as `tag` in `collection`.
    ///
    /// `body` is read exactly once. On success the returned address names
    /// exactly one committed object (new or reused), the item is indexed and
    /// `principal` is charged. Any failure is returned as-is; if indexing
    /// fails the object stays committed but unindexed.
    pub async fn upload<S>(
        &self,
        principal: &str,
        collection: &str,
        tag: &str,
        body: S,
    ) -> PipelineResult<ContentAddress>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let temp_name = format!("{}{}", TEMP_PREFIX, Uuid::new_v4());
        debug!(principal, collection, tag, temp = %temp_name, "upload started");
        let temp = TempObject::new(self.storage.clone(), &self.bucket, &temp_name);

        let (copied, address) = match self.stream_to_temp(&temp_name, body).await {
            Ok(done) => done,
            Err(err) => {
                temp.discard().await;
                return Err(err);
            }
        };

        if let Err(err) = self
            .storage
            .move_to_content_address(&self.bucket, &temp_name, address.as_str())
            .await
        {
            temp.discard().await;
            return Err(err.into());
        }
        temp.resolved();

        let item = Item {
            tag: tag.to_string(),
            bucket: self.bucket.clone(),
            blob: address.to_string(),
        };
        if let Err(err) = self.datastore.add_item_to_collection(collection, item).await {
            warn!(
                collection,
                tag,
                address = %address,
                error = %err,
                "blob committed but not indexed"
            );
            return Err(err.into());
        }

        let (bytes, requests) = self.usage.track_uploads(principal);
        bytes.record(copied);
        requests.record(1);

        info!(principal, collection, tag, address = %address, bytes = copied, "upload stored");
        Ok(address)
    }

    /// Run the tee, digest and write tasks to completion.
    ///
    /// Returns the number of bytes copied and the content address.
    async fn stream_to_temp<S>(
        &self,
        temp_name: &str,
        body: S,
    ) -> PipelineResult<(u64, ContentAddress)>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let token = CancellationToken::new();
        let failure = FirstFailure::new(token.clone());
        // Trips the token if this future is dropped mid-flight, so the
        // spawned tasks never wait on a driver that is gone.
        let guard = token.clone().drop_guard();

        let cancelled = token.clone();
        let (driver, digest_branch, write_branch) = tee::tee(body, TEE_CAPACITY, token);

        let digest_task = tokio::spawn(digest(digest_branch));
        let storage = self.storage.clone();
        let bucket = self.bucket.clone();
        let name = temp_name.to_string();
        let write_task = tokio::spawn(async move {
            let result = storage
                .upload_temp(&bucket, &name, Box::pin(write_branch))
                .await;
            // The caller may be gone by now; a cancelled write cleans up
            // after itself so nothing lands once the temp object is deleted.
            if cancelled.is_cancelled() {
                delete_best_effort(&*storage, &bucket, &name).await;
            }
            result
        });

        let copy = async { failure.observe(Stage::Copy, driver.run().await.map_err(Into::into)) };
        let hashed = async {
            let result = match digest_task.await {
                Ok(result) => result.map_err(Into::into),
                Err(err) => Err(err.into()),
            };
            failure.observe(Stage::Digest, result)
        };
        let written = async {
            let result = match write_task.await {
                Ok(result) => result.map_err(Into::into),
                Err(err) => Err(err.into()),
            };
            failure.observe(Stage::Write, result)
        };

        let (copied, address, written) = tokio::join!(copy, hashed, written);
        guard.disarm();

        match (copied, address, written) {
            (Ok(copied), Ok(address), Ok(_)) => Ok((copied, address)),
            (copied, address, written) => Err(pick_error(
                failure.first(),
                [
                    (Stage::Copy, copied.err()),
                    (Stage::Digest, address.err()),
                    (Stage::Write, written.err()),
                ],
            )),
        }
    }

    /// Stream the item tagged `tag` in `collection` into `sink` and charge
    /// `principal` for it.
    pub async fn download<W>(
        &self,
        principal: &str,
        collection: &str,
        tag: &str,
        sink: &mut W,
    ) -> PipelineResult<u64>
    where
        W: AsyncWrite + Send + Unpin,
    {
        let item = self
            .datastore
            .get_item_from_collection(collection, tag)
            .await?;
        let written = self.storage.download(&item.bucket, &item.blob, sink).await?;

        let (bytes, requests) = self.usage.track_downloads(principal);
        bytes.record(written);
        requests.record(1);

        debug!(principal, collection, tag, bytes = written, "download served");
        Ok(written)
    }
}

/// A temp object that is deleted unless the move resolved it.
///
/// Dropping it while still pending (the upload future was cancelled)
/// schedules the delete on the runtime.
struct TempObject {
    storage: Arc<dyn Storage>,
    bucket: String,
    name: String,
    pending: bool,
}

impl TempObject {
    fn new(storage: Arc<dyn Storage>, bucket: &str, name: &str) -> Self {
        Self {
            storage,
            bucket: bucket.to_string(),
            name: name.to_string(),
            pending: true,
        }
    }

    async fn discard(mut self) {
        self.pending = false;
        delete_best_effort(&*self.storage, &self.bucket, &self.name).await;
    }

    fn resolved(mut self) {
        self.pending = false;
    }
}

impl Drop for TempObject {
    fn drop(&mut self) {
        if !self.pending {
            return;
        }
        let Ok(runtime) = Handle::try_current() else {
            warn!(
                bucket = %self.bucket,
                temp = %self.name,
                "no runtime to delete temporary upload"
            );
            return;
        };
        let storage = self.storage.clone();
        let bucket = std::mem::take(&mut self.bucket);
        let name = std::mem::take(&mut self.name);
        debug!(bucket = %bucket, temp = %name, "upload abandoned, deleting temporary object");
        runtime.spawn(async move {
            delete_best_effort(&*storage, &bucket, &name).await;
        });
    }
}

async fn digest(mut branch: tee::TeeReader) -> io::Result<ContentAddress> {
    let mut hasher = Sha1::new();
    while let Some(chunk) = branch.next().await {
        hasher.update(&chunk?);
    }
    Ok(ContentAddress::from_digest(&hasher.finalize()))
}

/// Report the first task's own failure, falling back to any error at all.
fn pick_error(
    first: Option<Stage>,
    mut errors: [(Stage, Option<PipelineError>); 3],
) -> PipelineError {
    if let Some(stage) = first {
        if let Some(err) = errors
            .iter_mut()
            .find(|(s, _)| *s == stage)
            .and_then(|(_, err)| err.take())
        {
            return err;
        }
    }
    errors
        .into_iter()
        .find_map(|(_, err)| err)
        .unwrap_or(PipelineError::Tee(TeeError::Aborted))
}

//! HTTP handlers for collections and the blobs indexed in them.
//! Upload and download bodies are streamed; nothing is buffered whole.

use crate::{
    errors::AppError,
    handlers::auth::{ANONYMOUS, Principal},
    models::{
        collection::{Collection, Item},
        content_address::ContentAddress,
    },
    state::AppState,
};
use axum::{
    Json,
    body::Body,
    extract::{Multipart, Path, State, rejection::JsonRejection},
    http::header,
    response::{IntoResponse, Response},
};
use futures::{StreamExt, stream};
use serde::Deserialize;
use std::{collections::BTreeMap, io};
use tokio::sync::oneshot;
use tokio_util::io::ReaderStream;
use tracing::{info, warn};

/// In-flight bytes between the storage read and the response body.
const DOWNLOAD_BUFFER: usize = 64 * 1024;

/// Request body for `POST /` (create collection).
#[derive(Debug, Deserialize)]
pub struct CreateCollectionReq {
    pub slug: String,
    pub name: String,
}

/// `POST /` creates a collection.
pub async fn create_collection(
    State(state): State<AppState>,
    principal: Principal,
    body: Result<Json<CreateCollectionReq>, JsonRejection>,
) -> Result<Json<Collection>, AppError> {
    let Json(req) = body.map_err(|_| AppError::bad_request("invalid request format"))?;
    if req.slug.is_empty() {
        return Err(AppError::bad_request("collection slug must not be empty"));
    }

    let collection = state.datastore.create_collection(&req.slug, &req.name).await?;
    info!(principal = principal.as_str(), slug = %collection.slug, "collection created");
    Ok(Json(collection))
}

/// `POST /{collection}` stores every file part of a multipart body.
///
/// Parts are processed in order; the response lists one content address per
/// part. The first failing part aborts the request.
pub async fn upload_files(
    State(state): State<AppState>,
    principal: Principal,
    Path(collection): Path<String>,
    mut multipart: Multipart,
) -> Result<Json<Vec<ContentAddress>>, AppError> {
    let mut addresses = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::bad_request(format!("malformed multipart body: {}", err)))?
    {
        let tag = match field.file_name().or(field.name()) {
            Some(tag) if !tag.is_empty() => tag.to_string(),
            _ => return Err(AppError::bad_request("every part needs a file name")),
        };

        let body = field.map(|chunk| chunk.map_err(io::Error::other));
        let address = state
            .blobs
            .upload(principal.as_str(), &collection, &tag, body)
            .await?;
        addresses.push(address);
    }

    Ok(Json(addresses))
}

/// `GET /{collection}` lists the collection's items keyed by tag.
pub async fn list_items(
    State(state): State<AppState>,
    Path(collection): Path<String>,
) -> Result<Json<BTreeMap<String, Item>>, AppError> {
    let items = state.datastore.get_collection_items(&collection).await?;
    Ok(Json(items))
}

/// `GET /{collection}/{tag}` streams the blob behind an item.
///
/// The item is resolved before the response starts so a missing one is a
/// 404. A storage failure after that point ends the body with an error.
pub async fn get_blob(
    State(state): State<AppState>,
    principal: Option<Principal>,
    Path((collection, tag)): Path<(String, String)>,
) -> Result<Response, AppError> {
    state
        .datastore
        .get_item_from_collection(&collection, &tag)
        .await?;

    let principal = principal.map_or_else(|| ANONYMOUS.to_string(), |p| p.0);
    let (mut writer, reader) = tokio::io::duplex(DOWNLOAD_BUFFER);
    let (done_tx, done_rx) = oneshot::channel::<io::Result<()>>();

    let blobs = state.blobs.clone();
    tokio::spawn(async move {
        let result = blobs
            .download(&principal, &collection, &tag, &mut writer)
            .await;
        // Close the pipe before reporting so the reader sees EOF first.
        drop(writer);
        let outcome = match result {
            Ok(_) => Ok(()),
            Err(err) => {
                warn!(principal, collection, tag, error = %err, "download failed mid-stream");
                Err(io::Error::other(err))
            }
        };
        let _ = done_tx.send(outcome);
    });

    let tail = stream::once(done_rx).filter_map(|outcome| async move {
        match outcome {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(Err(err)),
            Err(_) => Some(Err(io::Error::other("download task ended early"))),
        }
    });
    let body = Body::from_stream(ReaderStream::new(reader).chain(tail));

    Ok(([(header::CONTENT_TYPE, "application/octet-stream")], body).into_response())
}

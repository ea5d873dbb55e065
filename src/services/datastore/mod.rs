//! Collection and item persistence.
//!
//! The upload pipeline only ever calls [`Datastore::add_item_to_collection`];
//! the rest of the trait serves the HTTP layer.

pub mod memory;
pub mod sqlite;

use crate::models::collection::{Collection, Item};
use async_trait::async_trait;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DatastoreError {
    #[error("collection `{0}` not found")]
    CollectionNotFound(String),
    #[error("collection `{0}` already exists")]
    CollectionAlreadyExists(String),
    #[error("item `{tag}` not found in collection `{collection}`")]
    BlobNotFound { collection: String, tag: String },
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

impl DatastoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            DatastoreError::CollectionNotFound(_) | DatastoreError::BlobNotFound { .. }
        )
    }
}

pub type DatastoreResult<T> = Result<T, DatastoreError>;

#[async_trait]
pub trait Datastore: Send + Sync {
    /// Prepare the backing schema. Safe to call repeatedly.
    async fn init(&self) -> DatastoreResult<()>;

    async fn create_collection(&self, slug: &str, name: &str) -> DatastoreResult<Collection>;

    async fn update_collection(&self, slug: &str, name: &str) -> DatastoreResult<()>;

    /// Collection metadata without its items.
    async fn get_collection(&self, slug: &str) -> DatastoreResult<Collection>;

    async fn get_collection_items(&self, slug: &str) -> DatastoreResult<BTreeMap<String, Item>>;

    /// Index `item` in the collection, replacing any item with the same tag.
    async fn add_item_to_collection(&self, slug: &str, item: Item) -> DatastoreResult<()>;

    async fn get_item_from_collection(&self, slug: &str, tag: &str) -> DatastoreResult<Item>;

    /// Cheap connectivity probe for readiness checks.
    async fn ping(&self) -> DatastoreResult<()>;
}

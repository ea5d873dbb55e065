//! Collections group uploaded items under a human-readable slug.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::BTreeMap;

/// A named group of items.
///
/// `items` is keyed by tag and is left empty when only the collection's
/// metadata was requested.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct Collection {
    /// URL-safe identifier, unique across the datastore.
    pub slug: String,

    /// Display name.
    pub name: String,

    /// Items indexed by tag.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub items: BTreeMap<String, Item>,
}

impl Collection {
    pub fn new(slug: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            slug: slug.into(),
            name: name.into(),
            items: BTreeMap::new(),
        }
    }
}

/// One uploaded file as seen through a collection.
///
/// Several items, in one or many collections, may point at the same blob.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
pub struct Item {
    /// Original filename supplied by the uploader.
    pub tag: String,

    /// Bucket holding the blob.
    pub bucket: String,

    /// Content address of the blob.
    #[sqlx(rename = "sha")]
    pub blob: String,
}

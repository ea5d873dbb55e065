//! In-memory datastore.

use super::{Datastore, DatastoreError, DatastoreResult};
use crate::models::collection::{Collection, Item};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

#[derive(Default)]
pub struct MemoryDatastore {
    collections: RwLock<HashMap<String, Collection>>,
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Datastore for MemoryDatastore {
    async fn init(&self) -> DatastoreResult<()> {
        Ok(())
    }

    async fn create_collection(&self, slug: &str, name: &str) -> DatastoreResult<Collection> {
        let mut collections = self.collections.write().await;
        if collections.contains_key(slug) {
            return Err(DatastoreError::CollectionAlreadyExists(slug.to_string()));
        }
        let collection = Collection::new(slug, name);
        collections.insert(slug.to_string(), collection.clone());
        Ok(collection)
    }

    async fn update_collection(&self, slug: &str, name: &str) -> DatastoreResult<()> {
        let mut collections = self.collections.write().await;
        let collection = collections
            .get_mut(slug)
            .ok_or_else(|| DatastoreError::CollectionNotFound(slug.to_string()))?;
        collection.name = name.to_string();
        Ok(())
    }

    async fn get_collection(&self, slug: &str) -> DatastoreResult<Collection> {
        let collections = self.collections.read().await;
        collections
            .get(slug)
            .map(|c| Collection::new(c.slug.clone(), c.name.clone()))
            .ok_or_else(|| DatastoreError::CollectionNotFound(slug.to_string()))
    }

    async fn get_collection_items(&self, slug: &str) -> DatastoreResult<BTreeMap<String, Item>> {
        let collections = self.collections.read().await;
        collections
            .get(slug)
            .map(|c| c.items.clone())
            .ok_or_else(|| DatastoreError::CollectionNotFound(slug.to_string()))
    }

    async fn add_item_to_collection(&self, slug: &str, item: Item) -> DatastoreResult<()> {
        let mut collections = self.collections.write().await;
        let collection = collections
            .get_mut(slug)
            .ok_or_else(|| DatastoreError::CollectionNotFound(slug.to_string()))?;
        collection.items.insert(item.tag.clone(), item);
        Ok(())
    }

    async fn get_item_from_collection(&self, slug: &str, tag: &str) -> DatastoreResult<Item> {
        let collections = self.collections.read().await;
        let collection = collections
            .get(slug)
            .ok_or_else(|| DatastoreError::CollectionNotFound(slug.to_string()))?;
        collection
            .items
            .get(tag)
            .cloned()
            .ok_or_else(|| DatastoreError::BlobNotFound {
                collection: slug.to_string(),
                tag: tag.to_string(),
            })
    }

    async fn ping(&self) -> DatastoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(tag: &str, blob: &str) -> Item {
        Item {
            tag: tag.into(),
            bucket: "pics".into(),
            blob: blob.into(),
        }
    }

    #[tokio::test]
    async fn items_are_keyed_by_tag() {
        let store = MemoryDatastore::new();
        store.create_collection("cats", "Cats").await.unwrap();
        store.add_item_to_collection("cats", item("a.gif", "111")).await.unwrap();
        store.add_item_to_collection("cats", item("a.gif", "222")).await.unwrap();
        store.add_item_to_collection("cats", item("b.gif", "111")).await.unwrap();

        let items = store.get_collection_items("cats").await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(store.get_item_from_collection("cats", "a.gif").await.unwrap().blob, "222");

        let meta = store.get_collection("cats").await.unwrap();
        assert_eq!(meta.name, "Cats");
        assert!(meta.items.is_empty());
    }

    #[tokio::test]
    async fn missing_collection_and_item() {
        let store = MemoryDatastore::new();
        assert!(matches!(
            store.add_item_to_collection("dogs", item("a", "1")).await,
            Err(DatastoreError::CollectionNotFound(_))
        ));
        store.create_collection("dogs", "Dogs").await.unwrap();
        assert!(matches!(
            store.get_item_from_collection("dogs", "a").await,
            Err(DatastoreError::BlobNotFound { .. })
        ));
        assert!(matches!(
            store.create_collection("dogs", "Again").await,
            Err(DatastoreError::CollectionAlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn rename_collection() {
        let store = MemoryDatastore::new();
        store.create_collection("dogs", "Dogs").await.unwrap();
        store.update_collection("dogs", "Good Dogs").await.unwrap();
        assert_eq!(store.get_collection("dogs").await.unwrap().name, "Good Dogs");
        assert!(store.update_collection("cats", "x").await.is_err());
    }
}

//! SQLite datastore.
//!
//! Schema lives in `migrations/0001_init.sql` and is embedded at build time;
//! [`SqliteDatastore::init`] applies it statement by statement.

use super::{Datastore, DatastoreError, DatastoreResult};
use crate::models::collection::{Collection, Item};
use async_trait::async_trait;
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use std::{collections::BTreeMap, str::FromStr, sync::Arc};
use tracing::{debug, info};

const SCHEMA: &str = include_str!("../../../migrations/0001_init.sql");

#[derive(Clone)]
pub struct SqliteDatastore {
    db: Arc<SqlitePool>,
}

impl SqliteDatastore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Open a pool on `url`, creating the database file if needed.
    pub async fn connect(url: &str, max_connections: u32) -> DatastoreResult<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        Ok(Self::new(Arc::new(pool)))
    }

    async fn ensure_collection(&self, slug: &str) -> DatastoreResult<()> {
        let found = sqlx::query_scalar::<_, i64>("SELECT 1 FROM collections WHERE slug = ?")
            .bind(slug)
            .fetch_optional(&*self.db)
            .await?;
        match found {
            Some(_) => Ok(()),
            None => Err(DatastoreError::CollectionNotFound(slug.to_string())),
        }
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}

#[async_trait]
impl Datastore for SqliteDatastore {
    async fn init(&self) -> DatastoreResult<()> {
        let statements = SCHEMA
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        info!("Running {} schema statements...", statements.len());
        for stmt in statements {
            debug!("Executing schema SQL: {}", stmt);
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(())
    }

    async fn create_collection(&self, slug: &str, name: &str) -> DatastoreResult<Collection> {
        match sqlx::query("INSERT INTO collections (slug, name) VALUES (?, ?)")
            .bind(slug)
            .bind(name)
            .execute(&*self.db)
            .await
        {
            Ok(_) => Ok(Collection::new(slug, name)),
            Err(err) if is_unique_violation(&err) => {
                Err(DatastoreError::CollectionAlreadyExists(slug.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn update_collection(&self, slug: &str, name: &str) -> DatastoreResult<()> {
        let result = sqlx::query("UPDATE collections SET name = ? WHERE slug = ?")
            .bind(name)
            .bind(slug)
            .execute(&*self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DatastoreError::CollectionNotFound(slug.to_string()));
        }
        Ok(())
    }

    async fn get_collection(&self, slug: &str) -> DatastoreResult<Collection> {
        let row = sqlx::query_as::<_, (String, String)>(
            "SELECT slug, name FROM collections WHERE slug = ?",
        )
        .bind(slug)
        .fetch_optional(&*self.db)
        .await?;
        row.map(|(slug, name)| Collection::new(slug, name))
            .ok_or_else(|| DatastoreError::CollectionNotFound(slug.to_string()))
    }

    async fn get_collection_items(&self, slug: &str) -> DatastoreResult<BTreeMap<String, Item>> {
        self.ensure_collection(slug).await?;
        let items = sqlx::query_as::<_, Item>(
            "SELECT tag, bucket, sha FROM items WHERE collection = ? ORDER BY tag",
        )
        .bind(slug)
        .fetch_all(&*self.db)
        .await?;
        Ok(items
            .into_iter()
            .map(|item| (item.tag.clone(), item))
            .collect())
    }

    async fn add_item_to_collection(&self, slug: &str, item: Item) -> DatastoreResult<()> {
        self.ensure_collection(slug).await?;
        sqlx::query(
            r#"
            INSERT INTO items (tag, collection, sha, bucket) VALUES (?, ?, ?, ?)
            ON CONFLICT(collection, tag) DO UPDATE SET
                sha = excluded.sha,
                bucket = excluded.bucket
            "#,
        )
        .bind(&item.tag)
        .bind(slug)
        .bind(&item.blob)
        .bind(&item.bucket)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    async fn get_item_from_collection(&self, slug: &str, tag: &str) -> DatastoreResult<Item> {
        self.ensure_collection(slug).await?;
        sqlx::query_as::<_, Item>(
            "SELECT tag, bucket, sha FROM items WHERE collection = ? AND tag = ?",
        )
        .bind(slug)
        .bind(tag)
        .fetch_optional(&*self.db)
        .await?
        .ok_or_else(|| DatastoreError::BlobNotFound {
            collection: slug.to_string(),
            tag: tag.to_string(),
        })
    }

    async fn ping(&self) -> DatastoreResult<()> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn datastore() -> SqliteDatastore {
        // One connection: every in-memory connection is its own database.
        let store = SqliteDatastore::connect("sqlite::memory:", 1).await.unwrap();
        store.init().await.unwrap();
        store
    }

    fn item(tag: &str, blob: &str) -> Item {
        Item {
            tag: tag.into(),
            bucket: "pics".into(),
            blob: blob.into(),
        }
    }

    #[tokio::test]
    async fn init_is_repeatable() {
        let store = datastore().await;
        store.init().await.unwrap();
        store.ping().await.unwrap();
    }

    #[tokio::test]
    async fn create_and_index_items() {
        let store = datastore().await;
        let created = store.create_collection("cats", "Cats").await.unwrap();
        assert_eq!(created, Collection::new("cats", "Cats"));

        store.add_item_to_collection("cats", item("a.gif", "111")).await.unwrap();
        store.add_item_to_collection("cats", item("b.gif", "111")).await.unwrap();
        store.add_item_to_collection("cats", item("a.gif", "222")).await.unwrap();

        let items = store.get_collection_items("cats").await.unwrap();
        assert_eq!(items.keys().collect::<Vec<_>>(), vec!["a.gif", "b.gif"]);
        assert_eq!(items["a.gif"], item("a.gif", "222"));
        assert_eq!(
            store.get_item_from_collection("cats", "b.gif").await.unwrap(),
            item("b.gif", "111")
        );
    }

    #[tokio::test]
    async fn duplicate_slug_is_rejected() {
        let store = datastore().await;
        store.create_collection("cats", "Cats").await.unwrap();
        assert!(matches!(
            store.create_collection("cats", "More cats").await,
            Err(DatastoreError::CollectionAlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn not_found_cases() {
        let store = datastore().await;
        assert!(matches!(
            store.add_item_to_collection("dogs", item("a", "1")).await,
            Err(DatastoreError::CollectionNotFound(_))
        ));
        assert!(matches!(
            store.get_collection("dogs").await,
            Err(DatastoreError::CollectionNotFound(_))
        ));
        assert!(matches!(
            store.update_collection("dogs", "Dogs").await,
            Err(DatastoreError::CollectionNotFound(_))
        ));

        store.create_collection("dogs", "Dogs").await.unwrap();
        assert!(matches!(
            store.get_item_from_collection("dogs", "a").await,
            Err(DatastoreError::BlobNotFound { .. })
        ));
    }
}

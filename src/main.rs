use anyhow::{Context, Result};
use axum::Router;
use std::{io::ErrorKind, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod config;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;
mod state;

use services::{
    authorizer::{HttpTokenIntrospector, TokenAuthorizer},
    blob_service::BlobService,
    datastore::{Datastore, memory::MemoryDatastore, sqlite::SqliteDatastore},
    storage::{Storage, memory::MemoryStorage, remote::ObjectStoreStorage},
    usage_tracker::UsageTracker,
};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;

    tracing::info!("Starting blobshelf with config: {:?}", cfg);

    // --- Initialize datastore ---
    let datastore: Arc<dyn Datastore> = match &cfg.database_url {
        Some(db_url) => {
            tracing::debug!("Connecting to SQLite at {}", db_url);
            let sqlite = SqliteDatastore::connect(db_url, 5)
                .await
                .with_context(|| format!("opening database {}", db_url))?;
            Arc::new(sqlite)
        }
        None => {
            tracing::warn!("No database configured; collections live in memory");
            Arc::new(MemoryDatastore::new())
        }
    };

    datastore.init().await.context("running migrations")?;

    // --- Handle migration mode ---
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Initialize storage backend ---
    let storage: Arc<dyn Storage> = match &cfg.storage_url {
        Some(url) => {
            let remote = ObjectStoreStorage::from_url(&cfg.bucket, url)
                .with_context(|| format!("configuring object store {}", url))?;
            tracing::info!(bucket = %cfg.bucket, "Using object store at {}", url);
            Arc::new(remote)
        }
        None => {
            tracing::warn!("No storage URL configured; blobs live in memory");
            Arc::new(MemoryStorage::new())
        }
    };

    // --- Initialize core services ---
    let usage = UsageTracker::new();
    let introspector = HttpTokenIntrospector::new(cfg.tokeninfo_url.clone())
        .context("building token introspection client")?;
    let authorizer = TokenAuthorizer::new(cfg.oauth_client_id.clone(), Arc::new(introspector));
    let state = state::AppState {
        blobs: BlobService::new(storage, datastore.clone(), usage.clone(), cfg.bucket.clone()),
        datastore,
        authorizer: Arc::new(authorizer),
        usage,
    };

    // --- Build router ---
    let app: Router = routes::routes::app(state, cfg.root_domain.as_deref());

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}

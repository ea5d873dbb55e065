//! Defines routes for collections, blobs and usage.
//!
//! ## Structure
//! - **Collection-level endpoints**
//!   - `POST   /`              create collection (auth)
//!   - `POST   /{collection}`  multipart upload, one blob per part (auth)
//!   - `GET    /{collection}`  list items
//!
//! - **Blob-level endpoints**
//!   - `GET    /{collection}/{tag}`  download blob
//!
//! - `GET /usage` reports the caller's usage counters (auth).
//!
//! With a root domain configured, `<collection>.<root domain>` hosts reach
//! the same handlers: `POST /` uploads, `GET /` lists and `GET /{tag}`
//! downloads.

use crate::{
    handlers::{
        collection_handlers::{create_collection, get_blob, list_items, upload_files},
        health_handlers::{healthz, readyz},
        usage_handlers::get_usage,
    },
    state::AppState,
};
use axum::{
    Router,
    extract::{DefaultBodyLimit, Request},
    http::{Uri, header, uri::PathAndQuery},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
};
use std::time::Instant;
use tracing::info;

/// Build the router for every endpoint.
///
/// The router carries shared state (`AppState`) to all handlers and logs the
/// timing of every request.
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/usage", get(get_usage))
        .route("/", post(create_collection))
        // Uploads stream straight to storage, so no body cap applies.
        .route(
            "/{collection}",
            post(upload_files)
                .layer(DefaultBodyLimit::disable())
                .get(list_items),
        )
        .route("/{collection}/{tag}", get(get_blob))
        .layer(middleware::from_fn(log_timing))
}

/// The complete application, with host-based collection routing when
/// `root_domain` is set.
pub fn app(state: AppState, root_domain: Option<&str>) -> Router {
    let router = routes().with_state(state);
    let Some(root) = root_domain else {
        return router;
    };
    let root = root.trim_start_matches('.').to_ascii_lowercase();
    // Host rewriting has to happen before the inner router matches a path,
    // so it wraps the whole router as a fallback service.
    Router::new()
        .fallback_service(router)
        .layer(middleware::from_fn(move |req: Request, next: Next| {
            route_by_host(root.clone(), req, next)
        }))
}

/// Collection named by `host` when it is a direct subdomain of `root`.
fn collection_host<'a>(host: &'a str, root: &str) -> Option<&'a str> {
    let host = host.split(':').next()?;
    let prefix = host
        .len()
        .checked_sub(root.len())
        .filter(|&at| host.is_char_boundary(at) && host[at..].eq_ignore_ascii_case(root))
        .map(|at| &host[..at])?;
    let collection = prefix.strip_suffix('.')?;
    (!collection.is_empty() && !collection.contains('.')).then_some(collection)
}

async fn route_by_host(root: String, mut req: Request, next: Next) -> Response {
    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .or_else(|| req.uri().host())
        .map(str::to_string);

    if let Some(collection) = host.as_deref().and_then(|host| collection_host(host, &root)) {
        let path = match req.uri().path() {
            "/" => format!("/{}", collection),
            path => format!("/{}{}", collection, path),
        };
        let path_and_query = match req.uri().query() {
            Some(query) => format!("{}?{}", path, query),
            None => path,
        };
        if let Ok(path_and_query) = PathAndQuery::try_from(path_and_query) {
            let mut parts = req.uri().clone().into_parts();
            parts.path_and_query = Some(path_and_query);
            if let Ok(uri) = Uri::from_parts(parts) {
                *req.uri_mut() = uri;
            }
        }
    }

    next.run(req).await
}

async fn log_timing(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let start = Instant::now();

    let response = next.run(req).await;

    info!(
        %method,
        path,
        status = response.status().as_u16(),
        elapsed = ?start.elapsed(),
        "request handled"
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{
        authorizer::{IntrospectionError, TokenAuthorizer, TokenInfo, TokenIntrospector},
        blob_service::BlobService,
        datastore::{Datastore, memory::MemoryDatastore},
        storage::memory::MemoryStorage,
        usage_tracker::UsageTracker,
    };
    use async_trait::async_trait;
    use reqwest::{Client, StatusCode};
    use serde_json::{Value, json};
    use std::sync::Arc;

    const BOUNDARY: &str = "blobshelf-test-boundary";
    const HELLO_SHA1: &str = "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d";

    struct StaticTokens;

    #[async_trait]
    impl TokenIntrospector for StaticTokens {
        async fn introspect(&self, token: &str) -> Result<TokenInfo, IntrospectionError> {
            match token {
                "alice-token" => Ok(TokenInfo {
                    audience: "client".into(),
                    subject: "alice".into(),
                }),
                _ => Err(IntrospectionError::Status(StatusCode::UNAUTHORIZED)),
            }
        }
    }

    async fn serve() -> String {
        serve_app(None).await
    }

    async fn serve_app(root_domain: Option<&str>) -> String {
        let storage = Arc::new(MemoryStorage::new());
        let datastore: Arc<dyn Datastore> = Arc::new(MemoryDatastore::new());
        let usage = UsageTracker::new();
        let state = AppState {
            blobs: BlobService::new(storage, datastore.clone(), usage.clone(), "pics"),
            datastore,
            authorizer: Arc::new(TokenAuthorizer::new("client", Arc::new(StaticTokens))),
            usage,
        };

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = app(state, root_domain);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn multipart(files: &[(&str, &str)]) -> String {
        let mut body = String::new();
        for (name, content) in files {
            body.push_str(&format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{name}\"\r\n\
                 Content-Type: application/octet-stream\r\n\r\n{content}\r\n"
            ));
        }
        body.push_str(&format!("--{BOUNDARY}--\r\n"));
        body
    }

    async fn upload(
        client: &Client,
        base: &str,
        collection: &str,
        files: &[(&str, &str)],
    ) -> reqwest::Response {
        client
            .post(format!("{base}/{collection}"))
            .bearer_auth("alice-token")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(multipart(files))
            .send()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn collection_lifecycle_over_http() {
        let base = serve().await;
        let client = Client::new();

        let created = client
            .post(format!("{base}/"))
            .bearer_auth("alice-token")
            .json(&json!({"slug": "dogs", "name": "Dogs"}))
            .send()
            .await
            .unwrap();
        assert_eq!(created.status(), StatusCode::OK);
        let again = client
            .post(format!("{base}/"))
            .bearer_auth("alice-token")
            .json(&json!({"slug": "dogs", "name": "Dogs"}))
            .send()
            .await
            .unwrap();
        assert_eq!(again.status(), StatusCode::CONFLICT);

        let files = [("a.txt", "hello"), ("b.txt", "hello")];
        let uploaded = upload(&client, &base, "dogs", &files).await;
        assert_eq!(uploaded.status(), StatusCode::OK);
        let addresses: Vec<String> = uploaded.json().await.unwrap();
        assert_eq!(addresses, vec![HELLO_SHA1, HELLO_SHA1]);

        let items: Value = client
            .get(format!("{base}/dogs"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(items["a.txt"]["blob"], HELLO_SHA1);
        assert_eq!(items["b.txt"]["bucket"], "pics");

        let blob = client
            .get(format!("{base}/dogs/a.txt"))
            .bearer_auth("alice-token")
            .send()
            .await
            .unwrap();
        assert_eq!(blob.status(), StatusCode::OK);
        assert_eq!(blob.bytes().await.unwrap().as_ref(), b"hello");

        let usage: Value = client
            .get(format!("{base}/usage"))
            .bearer_auth("alice-token")
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(usage["principal"], "alice");
        assert_eq!(usage["uploaded_bytes"], 10);
        assert_eq!(usage["upload_requests"], 2);
        assert_eq!(usage["downloaded_bytes"], 5);
        assert_eq!(usage["download_requests"], 1);
    }

    #[tokio::test]
    async fn missing_and_bad_tokens_are_rejected() {
        let base = serve().await;
        let client = Client::new();

        let anonymous = client
            .post(format!("{base}/"))
            .json(&json!({"slug": "cats", "name": "Cats"}))
            .send()
            .await
            .unwrap();
        assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);
        let body: Value = anonymous.json().await.unwrap();
        assert_eq!(body["error"], "must be logged in");

        let forged = client
            .get(format!("{base}/usage"))
            .bearer_auth("forged")
            .send()
            .await
            .unwrap();
        assert_eq!(forged.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn unknown_collection_and_item_are_not_found() {
        let base = serve().await;
        let client = Client::new();

        let uploaded = upload(&client, &base, "nowhere", &[("a.txt", "hello")]).await;
        assert_eq!(uploaded.status(), StatusCode::NOT_FOUND);

        let listed = client.get(format!("{base}/nowhere")).send().await.unwrap();
        assert_eq!(listed.status(), StatusCode::NOT_FOUND);

        let blob = client
            .get(format!("{base}/nowhere/a.txt"))
            .send()
            .await
            .unwrap();
        assert_eq!(blob.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn health_endpoints_answer() {
        let base = serve().await;
        let client = Client::new();

        let live = client.get(format!("{base}/healthz")).send().await.unwrap();
        assert_eq!(live.status(), StatusCode::OK);
        let ready: Value = client
            .get(format!("{base}/readyz"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(ready["status"], "ok");
        assert_eq!(ready["checks"]["datastore"]["ok"], true);
    }

    #[test]
    fn collection_hosts_are_direct_subdomains() {
        assert_eq!(collection_host("dogs.gifs.example", "gifs.example"), Some("dogs"));
        assert_eq!(collection_host("dogs.GIFS.example:8080", "gifs.example"), Some("dogs"));
        assert_eq!(collection_host("gifs.example", "gifs.example"), None);
        assert_eq!(collection_host("a.b.gifs.example", "gifs.example"), None);
        assert_eq!(collection_host("dogsgifs.example", "gifs.example"), None);
        assert_eq!(collection_host("dogs.other.example", "gifs.example"), None);
    }

    #[tokio::test]
    async fn collection_subdomains_route_to_collection_handlers() {
        let base = serve_app(Some(".gifs.example")).await;
        let client = Client::new();

        let created = client
            .post(format!("{base}/"))
            .header("host", "gifs.example")
            .bearer_auth("alice-token")
            .json(&json!({"slug": "dogs", "name": "Dogs"}))
            .send()
            .await
            .unwrap();
        assert_eq!(created.status(), StatusCode::OK);

        let uploaded = client
            .post(format!("{base}/"))
            .header("host", "dogs.gifs.example")
            .bearer_auth("alice-token")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(multipart(&[("a.txt", "hello")]))
            .send()
            .await
            .unwrap();
        assert_eq!(uploaded.status(), StatusCode::OK);
        let addresses: Vec<String> = uploaded.json().await.unwrap();
        assert_eq!(addresses, vec![HELLO_SHA1]);

        let items: Value = client
            .get(format!("{base}/"))
            .header("host", "dogs.gifs.example")
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(items["a.txt"]["blob"], HELLO_SHA1);

        let blob = client
            .get(format!("{base}/a.txt"))
            .header("host", "dogs.gifs.example")
            .send()
            .await
            .unwrap();
        assert_eq!(blob.status(), StatusCode::OK);
        assert_eq!(blob.bytes().await.unwrap().as_ref(), b"hello");

        // Path-style routing keeps working on the bare address.
        let listed = client.get(format!("{base}/dogs")).send().await.unwrap();
        assert_eq!(listed.status(), StatusCode::OK);
    }
}

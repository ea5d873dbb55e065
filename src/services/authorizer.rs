//! Bearer-token authorization against an external identity provider.
//!
//! Successful verifications are cached per raw token for a fixed TTL. The
//! whole lookup-and-refresh path runs under one async lock, including the
//! provider call, so a token is verified at most once at a time. Expired
//! entries are evicted only when the same token is looked up again.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::{collections::HashMap, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{sync::Mutex, time::Instant};
use tracing::{debug, warn};

/// How long a verified token is trusted without asking the provider again.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(15 * 60);

/// Upper bound on one introspection call. The cache lock is held across it.
pub const DEFAULT_INTROSPECTION_TIMEOUT: Duration = Duration::from_secs(10);

pub const DEFAULT_TOKENINFO_URL: &str = "https://www.googleapis.com/oauth2/v2/tokeninfo";

/// What the identity provider says about a token.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct TokenInfo {
    /// Client id the token was issued to.
    pub audience: String,
    /// Principal the token acts as.
    #[serde(alias = "user_id", alias = "sub")]
    pub subject: String,
}

#[derive(Debug, Error)]
pub enum IntrospectionError {
    #[error("identity provider answered with status {0}")]
    Status(StatusCode),
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
}

#[derive(Debug, Error)]
pub enum AuthError {
    /// Bad, expired or wrong-audience token.
    #[error("invalid bearer token")]
    InvalidCredential,
    /// The provider could not be asked.
    #[error("token introspection failed: {0}")]
    Provider(#[source] IntrospectionError),
}

pub type AuthResult<T> = Result<T, AuthError>;

#[async_trait]
pub trait TokenIntrospector: Send + Sync {
    async fn introspect(&self, token: &str) -> Result<TokenInfo, IntrospectionError>;
}

/// Token-info endpoint client (`GET <url>?access_token=<token>`).
#[derive(Clone)]
pub struct HttpTokenIntrospector {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTokenIntrospector {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, IntrospectionError> {
        Self::with_timeout(endpoint, DEFAULT_INTROSPECTION_TIMEOUT)
    }

    pub fn with_timeout(
        endpoint: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, IntrospectionError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl TokenIntrospector for HttpTokenIntrospector {
    async fn introspect(&self, token: &str) -> Result<TokenInfo, IntrospectionError> {
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("access_token", token)])
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(IntrospectionError::Status(status));
        }
        Ok(response.json::<TokenInfo>().await?)
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    principal: String,
    expires: Instant,
}

pub struct TokenAuthorizer {
    client_id: String,
    ttl: Duration,
    introspector: Arc<dyn TokenIntrospector>,
    cache: Mutex<HashMap<String, CacheEntry>>,
}

impl TokenAuthorizer {
    pub fn new(client_id: impl Into<String>, introspector: Arc<dyn TokenIntrospector>) -> Self {
        Self::with_ttl(client_id, introspector, DEFAULT_TOKEN_TTL)
    }

    pub fn with_ttl(
        client_id: impl Into<String>,
        introspector: Arc<dyn TokenIntrospector>,
        ttl: Duration,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            ttl,
            introspector,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve `token` to the principal it acts as.
    pub async fn authorize(&self, token: &str) -> AuthResult<String> {
        let mut cache = self.cache.lock().await;

        if let Some(entry) = cache.get(token) {
            if Instant::now() < entry.expires {
                return Ok(entry.principal.clone());
            }
            cache.remove(token);
        }

        let info = self.introspector.introspect(token).await.map_err(|err| match err {
            IntrospectionError::Status(status) if status.is_client_error() => {
                debug!(%status, "identity provider rejected token");
                AuthError::InvalidCredential
            }
            other => {
                warn!(error = %other, "token introspection failed");
                AuthError::Provider(other)
            }
        })?;

        if info.audience != self.client_id {
            debug!(audience = %info.audience, "token issued to another client");
            return Err(AuthError::InvalidCredential);
        }

        cache.insert(
            token.to_string(),
            CacheEntry {
                principal: info.subject.clone(),
                expires: Instant::now() + self.ttl,
            },
        );
        Ok(info.subject)
    }
}

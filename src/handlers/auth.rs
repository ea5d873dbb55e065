//! Bearer-token extraction.
//!
//! `Principal` rejects requests without a usable token; `Option<Principal>`
//! lets anonymous requests through but still rejects a token that is present
//! and invalid.

use crate::{errors::AppError, state::AppState};
use axum::{
    extract::{FromRequestParts, OptionalFromRequestParts},
    http::{HeaderMap, header, request::Parts},
};

/// Principal charged for downloads made without a token.
pub const ANONYMOUS: &str = "anonymous";

/// The authenticated identity a request acts as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal(pub String);

impl Principal {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ").unwrap_or(value).trim();
    (!token.is_empty()).then_some(token)
}

async fn resolve(token: &str, state: &AppState) -> Result<Principal, AppError> {
    let principal = state.authorizer.authorize(token).await?;
    Ok(Principal(principal))
}

impl FromRequestParts<AppState> for Principal {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers)
            .ok_or_else(|| AppError::unauthorized("must be logged in"))?;
        resolve(token, state).await
    }
}

impl OptionalFromRequestParts<AppState> for Principal {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Option<Self>, Self::Rejection> {
        match bearer_token(&parts.headers) {
            Some(token) => resolve(token, state).await.map(Some),
            None => Ok(None),
        }
    }
}

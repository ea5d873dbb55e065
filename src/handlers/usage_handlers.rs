use crate::{handlers::auth::Principal, models::usage::Usage, state::AppState};
use axum::{Json, extract::State};
use serde::Serialize;

#[derive(Serialize)]
pub struct UsageResponse {
    pub principal: String,
    #[serde(flatten)]
    pub usage: Usage,
}

/// `GET /usage` reports the caller's own counters.
pub async fn get_usage(State(state): State<AppState>, principal: Principal) -> Json<UsageResponse> {
    let usage = state.usage.usage(principal.as_str()).await.unwrap_or_default();
    Json(UsageResponse {
        principal: principal.0,
        usage,
    })
}

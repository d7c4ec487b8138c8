//! REST API route handlers.
//!
//! Provides the readiness check and the item endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};

use lodestore_store::{CacheStatsSnapshot, Item};

use crate::error::ApiError;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// GET /healthz
// ---------------------------------------------------------------------------

/// Response payload for the `/healthz` endpoint.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub ready: bool,
    pub version: String,
    pub cache: CacheStatsSnapshot,
}

/// 200 once startup has completed, 503 before.
pub async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let ready = state.is_ready();
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = HealthResponse {
        ready,
        version: env!("CARGO_PKG_VERSION").to_owned(),
        cache: state.items.stats().snapshot(),
    };
    (status, Json(body))
}

// ---------------------------------------------------------------------------
// /items
// ---------------------------------------------------------------------------

/// Request body for creating or renaming an item.
#[derive(Debug, Serialize, Deserialize)]
pub struct ItemBody {
    pub name: String,
}

/// `POST /items`
pub async fn create_item(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ItemBody>,
) -> Result<(StatusCode, Json<Item>), ApiError> {
    let item = state.items.create(&body.name).await?;
    Ok((StatusCode::CREATED, Json(item)))
}

/// `GET /items/{id}`
pub async fn get_item(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Item>, ApiError> {
    Ok(Json(state.items.get(&id).await?))
}

/// `PUT /items/{id}`
pub async fn update_item(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<ItemBody>,
) -> Result<Json<Item>, ApiError> {
    let item = state
        .items
        .update(Item {
            id,
            name: body.name,
        })
        .await?;
    Ok(Json(item))
}

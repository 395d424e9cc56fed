use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::core::errors::ApiError;
use crate::state::AppState;

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 500;

#[derive(Debug, Deserialize)]
pub struct ListThreadsQuery {
    pub limit: Option<usize>,
}

pub async fn list_threads(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListThreadsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let threads = state.store().list_threads(limit).await?;
    Ok(Json(json!({ "threads": threads })))
}

pub async fn get_thread(
    State(state): State<Arc<AppState>>,
    Path(thread_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let checkpoint = state
        .store()
        .load(&thread_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Thread not found".to_string()))?;

    Ok(Json(json!({
        "thread_id": checkpoint.thread_id,
        "seq": checkpoint.seq,
        "updated_at": checkpoint.created_at,
        "state": checkpoint.state,
    })))
}

pub async fn delete_thread(
    State(state): State<Arc<AppState>>,
    Path(thread_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let deleted = state.store().delete(&thread_id).await?;
    if deleted {
        tracing::info!("Deleted thread {}", thread_id);
    }
    Ok(Json(json!({ "deleted": deleted })))
}

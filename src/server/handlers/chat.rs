use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::core::errors::ApiError;
use crate::graph::ChatTurnRequest;
use crate::state::AppState;

pub async fn chat(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ChatTurnRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if payload.message.trim().is_empty() {
        return Err(ApiError::BadRequest("message must not be empty".to_string()));
    }

    let answer = state.controller.handle(payload).await?;
    Ok(Json(json!({ "response": answer })))
}

use axum::{Json, extract::State, response::IntoResponse};

use crate::AppState;

/// Per-topic diagnostics: subscribers, whether the watch runs, last error
pub async fn list_topics(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.hub.broker().snapshot().await)
}

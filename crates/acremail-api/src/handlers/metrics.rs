//! Prometheus scrape endpoint

use axum::{extract::State, http::header, response::IntoResponse};
use std::sync::Arc;

use crate::state::AppState;

pub async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

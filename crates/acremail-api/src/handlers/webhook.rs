//! SendGrid event webhook

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

use crate::handlers::MessageResponse;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub message: String,
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// The body must be a JSON array; individual bad events are skipped
pub async fn handle_webhook(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<Json<WebhookResponse>, (StatusCode, Json<MessageResponse>)> {
    let Value::Array(events) = body else {
        warn!("Rejected webhook payload that is not an array");
        return Err((
            StatusCode::BAD_REQUEST,
            Json(MessageResponse::new("Invalid webhook payload")),
        ));
    };

    let summary = state.tracking.process_webhook(events).await;
    info!(
        processed = summary.processed,
        skipped = summary.skipped,
        failed = summary.failed,
        "Webhook batch processed"
    );

    Ok(Json(WebhookResponse {
        message: "Webhook processed successfully".to_string(),
        processed: summary.processed,
        skipped: summary.skipped,
        failed: summary.failed,
    }))
}

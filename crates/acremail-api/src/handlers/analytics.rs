//! Per-campaign engagement numbers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use acremail_core::{CampaignError, EmailStats};
use serde::Serialize;
use std::sync::Arc;
use tracing::error;
use uuid::Uuid;

use crate::handlers::MessageResponse;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct CampaignAnalyticsResponse {
    pub analytics: EmailStats,
}

pub async fn campaign_analytics(
    State(state): State<Arc<AppState>>,
    Path(campaign_id): Path<Uuid>,
) -> Result<Json<CampaignAnalyticsResponse>, (StatusCode, Json<MessageResponse>)> {
    match state.campaigns.analytics(campaign_id).await {
        Ok(analytics) => Ok(Json(CampaignAnalyticsResponse { analytics })),
        Err(CampaignError::NotFound(_)) => Err((
            StatusCode::NOT_FOUND,
            Json(MessageResponse::new("Campaign not found")),
        )),
        Err(e) => {
            error!(campaign_id = %campaign_id, error = %e, "Failed to fetch campaign analytics");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(MessageResponse::new("Failed to fetch campaign analytics")),
            ))
        }
    }
}

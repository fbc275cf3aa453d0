//! API routes

use axum::{
    http::HeaderValue,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::warn;

use crate::handlers::{analytics, health, metrics, tracking, unsubscribe, webhook};
use crate::state::AppState;

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() {
        return layer.allow_origin(Any);
    }

    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(parsed))
}

/// Create the API router
pub fn create_router(state: AppState, cors_origins: &[String]) -> Router {
    let state = Arc::new(state);

    let health_routes = Router::new()
        .route("/", get(health::health))
        .route("/live", get(health::liveness))
        .route("/ready", get(health::readiness));

    // Public endpoints reached from inside emails and from the provider
    let tracking_routes = Router::new()
        .route("/pixel/:token", get(tracking::track_open))
        .route("/click/:token", get(tracking::track_click))
        .route("/webhook", post(webhook::handle_webhook))
        .route(
            "/unsubscribe",
            get(unsubscribe::unsubscribe_page).post(unsubscribe::unsubscribe),
        )
        .route(
            "/campaigns/:campaign_id/analytics",
            get(analytics::campaign_analytics),
        );

    Router::new()
        .nest("/health", health_routes)
        .nest("/api/email-tracking", tracking_routes)
        .route("/metrics", get(metrics::metrics))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors_layer(cors_origins)),
        )
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use acremail_common::config::TrackingConfig;
    use acremail_core::queue::{EmailJobExecutor, JobQueue, QueueSettings};
    use acremail_core::tokens::{encode_tracking_token, TrackingUrls, UnsubscribeSigner};
    use acremail_core::{
        CampaignManager, DeliveryConfig, DeliveryEngine, LogTransport, Metrics, TrackingService,
    };
    use acremail_storage::models::Buyer;
    use acremail_storage::{MemoryStore, Repositories};
    use axum::http::StatusCode;
    use axum_test::TestServer;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;
    use uuid::Uuid;

    const SECRET: &str = "route-test-secret";

    fn buyer(email: &str) -> Buyer {
        let now = Utc::now();
        Buyer {
            id: Uuid::new_v4(),
            email: email.to_string(),
            first_name: "Ana".into(),
            last_name: "Buyer".into(),
            buyer_type: None,
            preferred_areas: Vec::new(),
            source: None,
            email_opt_in: true,
            email_status: "active".into(),
            last_email_sent: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn server(store: Arc<MemoryStore>) -> TestServer {
        let repos = Repositories::in_memory(store);
        let config = TrackingConfig::default();
        let signer = UnsubscribeSigner::new(SECRET);

        let delivery = Arc::new(DeliveryEngine::new(
            Arc::new(LogTransport::new()),
            repos.tracking.clone(),
            signer.clone(),
            TrackingUrls::new(config.base_url.clone()),
            DeliveryConfig {
                from_name: "Landivo".into(),
                from_email: "deals@landivo.com".into(),
                reply_to: None,
                unsubscribe_group_id: None,
                pacing: Duration::ZERO,
            },
        ));
        let executor = Arc::new(EmailJobExecutor::new(&repos, delivery.clone()));
        let queue = JobQueue::new(repos.jobs.clone(), executor, QueueSettings::default());

        let state = AppState::new(
            Arc::new(TrackingService::new(&repos, signer, &config)),
            Arc::new(CampaignManager::new(&repos, queue, delivery)),
            Metrics::new().unwrap(),
        );
        TestServer::new(create_router(state, &[])).unwrap()
    }

    #[tokio::test]
    async fn test_pixel_always_returns_gif() {
        let store = Arc::new(MemoryStore::new());
        let server = server(store.clone());

        let response = server.get("/api/email-tracking/pixel/not-a-token").await;
        assert_eq!(response.status_code(), StatusCode::OK);
        assert_eq!(response.header("content-type"), "image/gif");
        assert_eq!(response.header("cache-control"), "no-cache, no-store, must-revalidate");
        assert!(response.as_bytes().starts_with(b"GIF89a"));
        assert!(store.tracking_events().await.is_empty());

        let token = encode_tracking_token(Uuid::new_v4(), Uuid::new_v4(), Utc::now());
        let response = server.get(&format!("/api/email-tracking/pixel/{}", token)).await;
        assert_eq!(response.status_code(), StatusCode::OK);
        assert_eq!(store.tracking_events().await.len(), 1);
    }

    #[tokio::test]
    async fn test_click_redirects() {
        let store = Arc::new(MemoryStore::new());
        let server = server(store.clone());
        let token = encode_tracking_token(Uuid::new_v4(), Uuid::new_v4(), Utc::now());

        let response = server
            .get(&format!("/api/email-tracking/click/{}", token))
            .add_query_param("url", "https://landivo.com/properties/42")
            .await;
        assert_eq!(response.status_code(), StatusCode::FOUND);
        assert_eq!(response.header("location"), "https://landivo.com/properties/42");
        assert_eq!(store.tracking_events().await[0].event_type, "clicked");

        let response = server.get("/api/email-tracking/click/garbage").await;
        assert_eq!(response.status_code(), StatusCode::FOUND);
        assert_eq!(response.header("location"), "http://localhost:3000");
    }

    #[tokio::test]
    async fn test_webhook_requires_array() {
        let server = server(Arc::new(MemoryStore::new()));

        let response = server
            .post("/api/email-tracking/webhook")
            .json(&json!({ "event": "open" }))
            .await;
        assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);

        let response = server
            .post("/api/email-tracking/webhook")
            .json(&json!([{ "event": "open" }]))
            .await;
        assert_eq!(response.status_code(), StatusCode::OK);
        let body: serde_json::Value = response.json();
        assert_eq!(body["processed"], 0);
        assert_eq!(body["skipped"], 1);
        assert_eq!(body["failed"], 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_flow() {
        let store = Arc::new(MemoryStore::new());
        store.insert_buyer(buyer("ana@x.com")).await;
        let server = server(store.clone());
        let token = UnsubscribeSigner::new(SECRET).sign("ana@x.com");

        let page = server
            .get("/api/email-tracking/unsubscribe")
            .add_query_param("email", "ana@x.com")
            .add_query_param("token", &token)
            .await;
        assert_eq!(page.status_code(), StatusCode::OK);
        assert!(page.text().contains("ana@x.com"));

        let missing = server
            .post("/api/email-tracking/unsubscribe")
            .json(&json!({ "email": "ana@x.com" }))
            .await;
        assert_eq!(missing.status_code(), StatusCode::BAD_REQUEST);

        let forged = server
            .post("/api/email-tracking/unsubscribe")
            .json(&json!({ "email": "ana@x.com", "token": "forged" }))
            .await;
        assert_eq!(forged.status_code(), StatusCode::BAD_REQUEST);

        let ok = server
            .post("/api/email-tracking/unsubscribe")
            .form(&[("email", "ana@x.com"), ("token", token.as_str())])
            .await;
        assert_eq!(ok.status_code(), StatusCode::OK);

        let unknown_token = UnsubscribeSigner::new(SECRET).sign("nobody@x.com");
        let unknown = server
            .post("/api/email-tracking/unsubscribe")
            .json(&json!({ "email": "nobody@x.com", "token": unknown_token }))
            .await;
        assert_eq!(unknown.status_code(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_health_and_metrics() {
        let server = server(Arc::new(MemoryStore::new()));

        assert_eq!(server.get("/health/live").await.status_code(), StatusCode::OK);
        assert_eq!(server.get("/health/ready").await.status_code(), StatusCode::OK);
        let body: serde_json::Value = server.get("/health").await.json();
        assert_eq!(body["database"], false);

        let metrics = server.get("/metrics").await;
        assert_eq!(metrics.status_code(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_campaign_analytics_not_found() {
        let server = server(Arc::new(MemoryStore::new()));
        let response = server
            .get(&format!("/api/email-tracking/campaigns/{}/analytics", Uuid::new_v4()))
            .await;
        assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
    }
}

//! Unsubscribe confirmation page and form target

use axum::{
    async_trait,
    extract::{FromRequest, Query, Request, State},
    http::{header, StatusCode},
    response::Html,
    Form, Json,
};
use acremail_core::UnsubscribeError;
use minijinja::{context, Environment};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{error, info};

use crate::handlers::MessageResponse;
use crate::state::AppState;

const PAGE: &str = r#"<!DOCTYPE html>
<html>
<head>
    <title>Unsubscribe - Landivo</title>
    <style>
        body { font-family: Arial, sans-serif; max-width: 600px; margin: 50px auto; padding: 20px; }
        .container { text-align: center; }
        .btn { background: #d32f2f; color: white; padding: 10px 20px; border: none; cursor: pointer; }
        .btn:hover { background: #b71c1c; }
    </style>
</head>
<body>
    <div class="container">
        <h2>Unsubscribe from Landivo Emails</h2>
        <p>Click the button below to stop receiving our email communications.</p>
        <p><strong>Email:</strong> {{ email }}</p>
        <form method="POST" action="/api/email-tracking/unsubscribe">
            <input type="hidden" name="email" value="{{ email }}" />
            <input type="hidden" name="token" value="{{ token }}" />
            <button type="submit" class="btn">Unsubscribe</button>
        </form>
        <p><small>You can re-subscribe at any time from your account preferences.</small></p>
    </div>
</body>
</html>
"#;

#[derive(Debug, Default, Deserialize)]
pub struct UnsubscribeParams {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub token: String,
}

/// Accepts the fields as JSON or as a urlencoded form
pub struct UnsubscribeBody(pub UnsubscribeParams);

#[async_trait]
impl<S> FromRequest<S> for UnsubscribeBody
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, Json<MessageResponse>);

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let is_json = req
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("application/json"));

        let params = if is_json {
            Json::<UnsubscribeParams>::from_request(req, state)
                .await
                .map(|Json(p)| p)
                .ok()
        } else {
            Form::<UnsubscribeParams>::from_request(req, state)
                .await
                .map(|Form(p)| p)
                .ok()
        };

        params.map(UnsubscribeBody).ok_or_else(|| {
            (
                StatusCode::BAD_REQUEST,
                Json(MessageResponse::new("Email and token are required")),
            )
        })
    }
}

pub fn render_page(params: &UnsubscribeParams) -> Result<String, minijinja::Error> {
    let mut env = Environment::new();
    env.set_auto_escape_callback(|_| minijinja::AutoEscape::Html);
    env.add_template("unsubscribe.html", PAGE)?;
    env.get_template("unsubscribe.html")?.render(context! {
        email => params.email,
        token => params.token,
    })
}

pub async fn unsubscribe_page(
    Query(params): Query<UnsubscribeParams>,
) -> Result<Html<String>, StatusCode> {
    render_page(&params).map(Html).map_err(|e| {
        error!(error = %e, "Failed to render unsubscribe page");
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

pub async fn unsubscribe(
    State(state): State<Arc<AppState>>,
    UnsubscribeBody(params): UnsubscribeBody,
) -> Result<Json<MessageResponse>, (StatusCode, Json<MessageResponse>)> {
    match state.tracking.unsubscribe(&params.email, &params.token).await {
        Ok(()) => {
            info!(email = %params.email, "Unsubscribed via link");
            Ok(Json(MessageResponse::new(
                "Successfully unsubscribed from email communications",
            )))
        }
        Err(e) => {
            let status = match &e {
                UnsubscribeError::MissingFields | UnsubscribeError::InvalidToken => {
                    StatusCode::BAD_REQUEST
                }
                UnsubscribeError::NotFound => StatusCode::NOT_FOUND,
                UnsubscribeError::Storage(inner) => {
                    error!(error = %inner, "Unsubscribe failed");
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            };
            Err((status, Json(MessageResponse::new(e.to_string()))))
        }
    }
}

//! GitHub webhook receiver
//!
//! Verifies `X-Hub-Signature-256`, then routes events to their handlers:
//! newly opened pull requests get a welcome comment, and uninstalled or
//! suspended installations are dropped from the client cache.

use crate::installations::Installations;
use crate::pr::{self, PullRequestEvent};
use crate::token::InstallationId;
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::sync::Arc;
use tracing::{error, info, info_span, warn, Instrument};

pub const SIGNATURE_HEADER: &str = "X-Hub-Signature-256";
pub const EVENT_HEADER: &str = "X-GitHub-Event";
pub const DELIVERY_HEADER: &str = "X-GitHub-Delivery";

#[derive(Clone)]
pub struct AppState {
    pub installations: Arc<Installations>,
    /// `None` disables signature verification
    pub webhook_secret: Option<Arc<[u8]>>,
}

impl AppState {
    pub fn new(installations: Arc<Installations>, webhook_secret: Option<&str>) -> Self {
        Self {
            installations,
            webhook_secret: webhook_secret
                .filter(|secret| !secret.is_empty())
                .map(|secret| Arc::from(secret.as_bytes())),
        }
    }
}

#[derive(Debug, Deserialize)]
struct InstallationEvent {
    action: String,
    installation: InstallationPayload,
}

#[derive(Debug, Deserialize)]
struct InstallationPayload {
    id: InstallationId,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/github/event", post(handle_webhook))
        .route("/healthz", get(healthz))
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({"status": "ok"})))
}

async fn handle_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let event = header_str(&headers, EVENT_HEADER).unwrap_or("unknown").to_string();
    let delivery = header_str(&headers, DELIVERY_HEADER)
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let span = info_span!("webhook", event = %event, delivery = %delivery);
    async move {
        if let Some(secret) = &state.webhook_secret {
            match header_str(&headers, SIGNATURE_HEADER) {
                Some(signature) if verify_signature(secret, &body, signature) => {}
                _ => {
                    warn!("Webhook signature verification failed");
                    return StatusCode::UNAUTHORIZED;
                }
            }
        }

        dispatch(&state, &event, &body).await
    }
    .instrument(span)
    .await
}

async fn dispatch(state: &AppState, event: &str, body: &[u8]) -> StatusCode {
    match event {
        "ping" => {
            info!("Received ping event");
            StatusCode::OK
        }
        "pull_request" => match serde_json::from_slice::<PullRequestEvent>(body) {
            Ok(payload) if payload.action == "opened" => {
                if payload.installation_id().is_none() {
                    warn!(
                        repository = %payload.repository.full_name,
                        "pull_request event does not name an installation"
                    );
                    return StatusCode::BAD_REQUEST;
                }

                match pr::welcome(&state.installations, &payload).await {
                    Ok(_) => StatusCode::OK,
                    Err(err) => {
                        error!(
                            repository = %payload.repository.full_name,
                            pr_number = payload.pull_request.number,
                            transient = err.is_transient(),
                            error = %err,
                            "Failed to welcome pull request"
                        );
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                }
            }
            Ok(payload) => {
                info!(action = %payload.action, "Ignoring pull_request action");
                StatusCode::OK
            }
            Err(err) => {
                error!(error = %err, "Failed to parse pull_request payload");
                StatusCode::BAD_REQUEST
            }
        },
        "installation" => match serde_json::from_slice::<InstallationEvent>(body) {
            Ok(payload) => {
                if matches!(payload.action.as_str(), "deleted" | "suspend") {
                    state.installations.remove(payload.installation.id);
                }
                info!(
                    action = %payload.action,
                    installation_id = %payload.installation.id,
                    "Handled installation event"
                );
                StatusCode::OK
            }
            Err(err) => {
                error!(error = %err, "Failed to parse installation payload");
                StatusCode::BAD_REQUEST
            }
        },
        other => {
            info!("Ignoring GitHub event: {other}");
            StatusCode::OK
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Check a `sha256=<hex>` signature against the HMAC of `body`
pub fn verify_signature(secret: &[u8], body: &[u8], signature: &str) -> bool {
    let Some(signature_hex) = signature.strip_prefix("sha256=") else {
        return false;
    };

    let Ok(expected) = hex::decode(signature_hex) else {
        return false;
    };

    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

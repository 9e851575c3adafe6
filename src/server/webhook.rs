//! Provider webhook endpoints: subscription verification and status
//! callbacks.
//!
//! The GET side implements the provider's subscription handshake: echo the
//! challenge iff the mode is `subscribe` and the verify token matches. The
//! POST side accepts status batches; when an app secret is configured the
//! `X-Hub-Signature-256` header is verified against the raw body before
//! anything is parsed or persisted.

use std::collections::HashMap;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use tracing::{debug, warn};

use super::{ApiError, AppState};
use crate::callback::{CallbackPayload, verify_signature};
use crate::ingest::ValidationError;

/// Header carrying the callback body signature.
const SIGNATURE_HEADER: &str = "x-hub-signature-256";

/// `GET /v1/webhooks/provider?hub.mode&hub.verify_token&hub.challenge`
///
/// Returns the challenge verbatim iff the subscription handshake checks
/// out; 403 otherwise. The parameter names contain dots, so they arrive
/// through a plain map rather than a derived struct.
pub async fn verify_handler(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<String, ApiError> {
    let mode = params.get("hub.mode").map(String::as_str);
    let token = params.get("hub.verify_token").map(String::as_str);
    let challenge = params.get("hub.challenge");

    let expected = state.webhook_verify_token();
    if mode == Some("subscribe") && !expected.is_empty() && token == Some(expected) {
        debug!("webhook subscription verified");
        return Ok(challenge.cloned().unwrap_or_default());
    }

    warn!(?mode, "webhook verification rejected");
    Err(ApiError::Forbidden)
}

/// `POST /v1/webhooks/provider`
///
/// 200 after the batch is applied; 400 for an unparseable body; 403 for a
/// bad signature; 500 if persistence fails mid-batch.
pub async fn callback_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    // Signature first: nothing is parsed or persisted for a forged body.
    if let Some(secret) = state.webhook_app_secret() {
        let header = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !verify_signature(&body, header, secret) {
            warn!("callback signature verification failed");
            return Err(ApiError::Forbidden);
        }
    }

    let payload: CallbackPayload = serde_json::from_slice(&body)
        .map_err(|e| ValidationError::new("body", format!("invalid callback payload: {e}")))?;

    let summary = state
        .callbacks()
        .handle(payload)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    Ok((
        StatusCode::OK,
        Json(serde_json::to_value(summary).unwrap_or_default()),
    ))
}

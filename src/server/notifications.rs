//! Notification ingestion and status endpoints.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::auth::authenticate;
use super::{ApiError, AppState};
use crate::ingest::{BulkEntryOutcome, NotificationRequest};
use crate::store::NotificationStore;
use crate::types::{DeliveryLogEntry, Notification, NotificationId};

/// Header carrying the client idempotency key.
const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

/// `POST /v1/notifications`
///
/// 201 with `{id, status}` on acceptance; a replayed `Idempotency-Key`
/// returns the prior record with 200.
pub async fn create_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<NotificationRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let tenant = authenticate(&headers, &state)?;
    let idempotency_key = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let outcome = state
        .ingestion()
        .create_notification(request, &tenant, idempotency_key)
        .await?;

    let status = if outcome.replayed {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((
        status,
        Json(json!({ "id": outcome.id, "status": outcome.state })),
    ))
}

#[derive(Debug, Deserialize)]
pub struct BulkRequest {
    pub notifications: Vec<NotificationRequest>,
}

#[derive(Debug, Serialize)]
struct BulkResponse {
    accepted: usize,
    rejected: usize,
    results: Vec<BulkEntryOutcome>,
}

/// `POST /v1/notifications/bulk`
pub async fn create_bulk_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<BulkRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let tenant = authenticate(&headers, &state)?;
    let results = state
        .ingestion()
        .create_bulk(request.notifications, &tenant)
        .await?;

    let accepted = results
        .iter()
        .filter(|r| matches!(r, BulkEntryOutcome::Accepted { .. }))
        .count();
    let response = BulkResponse {
        accepted,
        rejected: results.len() - accepted,
        results,
    };
    Ok(Json(serde_json::to_value(response).unwrap_or_default()))
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    id: NotificationId,
    status: crate::state::DeliveryState,
    event_type: String,
    recipient: String,
    priority: crate::types::Priority,
    provider_message_id: Option<String>,
    attempt_number: u32,
    max_attempts: u32,
    created_at: chrono::DateTime<chrono::Utc>,
    scheduled_for: Option<chrono::DateTime<chrono::Utc>>,
    sent_at: Option<chrono::DateTime<chrono::Utc>>,
    delivered_at: Option<chrono::DateTime<chrono::Utc>>,
    read_at: Option<chrono::DateTime<chrono::Utc>>,
    failed_at: Option<chrono::DateTime<chrono::Utc>>,
    next_retry_at: Option<chrono::DateTime<chrono::Utc>>,
    last_error_code: Option<String>,
    last_error_message: Option<String>,
    logs: Vec<DeliveryLogEntry>,
}

impl StatusResponse {
    fn from_row(row: Notification, logs: Vec<DeliveryLogEntry>) -> Self {
        StatusResponse {
            id: row.id,
            status: row.state,
            event_type: row.event_type,
            recipient: row.recipient.as_str().to_string(),
            priority: row.priority,
            provider_message_id: row.provider_message_id.map(|p| p.as_str().to_string()),
            attempt_number: row.attempt_number,
            max_attempts: row.max_attempts,
            created_at: row.created_at,
            scheduled_for: row.scheduled_for,
            sent_at: row.sent_at,
            delivered_at: row.delivered_at,
            read_at: row.read_at,
            failed_at: row.failed_at,
            next_retry_at: row.next_retry_at,
            last_error_code: row.last_error_code,
            last_error_message: row.last_error_message,
            logs,
        }
    }
}

/// `GET /v1/notifications/{id}/status`
///
/// Tenant-scoped: a notification belonging to another tenant returns 403.
pub async fn status_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let tenant = authenticate(&headers, &state)?;
    let id = NotificationId::parse(&id).map_err(|_| ApiError::NotFound)?;

    let row = state
        .store()
        .find_by_id(id)
        .await?
        .ok_or(ApiError::NotFound)?;
    if row.tenant_id != tenant {
        return Err(ApiError::Forbidden);
    }

    let logs = state.store().logs_for(id, 10).await?;
    let response = StatusResponse::from_row(row, logs);
    Ok(Json(serde_json::to_value(response).unwrap_or_default()))
}

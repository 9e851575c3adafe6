//! Tenant analytics endpoints.

use axum::Json;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use serde_json::json;

use super::auth::authenticate;
use super::{ApiError, AppState};
use crate::clock::Clock;
use crate::ingest::ValidationError;
use crate::state::DeliveryState;
use crate::store::{ListFilter, NotificationStore, Page};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsQuery {
    start_date: Option<String>,
    end_date: Option<String>,
}

/// `GET /v1/analytics/stats?startDate&endDate`
///
/// Aggregate counts and average latency over a creation-date range; the
/// range defaults to the trailing 30 days.
pub async fn stats_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<StatsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let tenant = authenticate(&headers, &state)?;

    let to = match query.end_date {
        Some(raw) => parse_date(&raw, "endDate", true)?,
        None => state.clock().now(),
    };
    let from = match query.start_date {
        Some(raw) => parse_date(&raw, "startDate", false)?,
        None => to - chrono::Duration::days(30),
    };
    if from > to {
        return Err(ValidationError::new("startDate", "must not be after endDate").into());
    }

    let stats = state.store().stats(&tenant, from, to).await?;
    Ok(Json(json!({
        "start_date": from,
        "end_date": to,
        "total": stats.total,
        "by_state": stats.by_state,
        "average_latency_ms": stats.average_latency_ms,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    status: Option<String>,
    event_type: Option<String>,
    page: Option<usize>,
    limit: Option<usize>,
}

/// `GET /v1/analytics/notifications?status&eventType&page&limit`
pub async fn list_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let tenant = authenticate(&headers, &state)?;

    let status = query
        .status
        .map(|s| parse_state(&s))
        .transpose()?;
    let page = Page {
        page: query.page.unwrap_or(1).max(1),
        limit: query.limit.unwrap_or(20).clamp(1, 100),
    };

    let (rows, total) = state
        .store()
        .list_by_tenant(
            &tenant,
            ListFilter {
                state: status,
                event_type: query.event_type,
            },
            page,
        )
        .await?;

    let notifications: Vec<serde_json::Value> = rows
        .into_iter()
        .map(|n| {
            json!({
                "id": n.id,
                "status": n.state,
                "event_type": n.event_type,
                "recipient": n.recipient.as_str(),
                "priority": n.priority,
                "provider_message_id": n.provider_message_id,
                "created_at": n.created_at,
            })
        })
        .collect();

    Ok(Json(json!({
        "notifications": notifications,
        "page": page.page,
        "limit": page.limit,
        "total": total,
    })))
}

/// Accepts `YYYY-MM-DD` or a full RFC3339 timestamp. A bare end date is
/// widened to the end of its day so ranges are inclusive.
fn parse_date(raw: &str, field: &str, end_of_day: bool) -> Result<DateTime<Utc>, ApiError> {
    if let Ok(timestamp) = raw.parse::<DateTime<Utc>>() {
        return Ok(timestamp);
    }
    if let Ok(date) = raw.parse::<NaiveDate>() {
        let time = if end_of_day {
            date.and_hms_opt(23, 59, 59).expect("valid time of day")
        } else {
            date.and_hms_opt(0, 0, 0).expect("valid time of day")
        };
        return Ok(time.and_utc());
    }
    Err(ValidationError::new(field, "expected YYYY-MM-DD or an RFC3339 timestamp").into())
}

fn parse_state(raw: &str) -> Result<DeliveryState, ApiError> {
    serde_json::from_value(serde_json::Value::String(raw.to_string()))
        .map_err(|_| ValidationError::new("status", "unknown delivery state").into())
}

//! API error taxonomy and its HTTP mapping.
//!
//! Every handler error funnels through [`ApiError`], which owns the status
//! code, the JSON body shape, and the rule that internal details never
//! reach the caller — they go to the log, keyed by trace id, and the body
//! says only "internal error".

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::ingest::{IngestError, ValidationError};
use crate::store::StoreError;

/// Errors a handler can surface to the caller.
#[derive(Debug, Error)]
pub enum ApiError {
    /// 400 with the offending field path.
    #[error("{0}")]
    Validation(#[from] ValidationError),

    /// 401: missing or unknown API key.
    #[error("missing or invalid API key")]
    Unauthorized,

    /// 403: authenticated, but not allowed (cross-tenant access, failed
    /// webhook verification).
    #[error("forbidden")]
    Forbidden,

    /// 404.
    #[error("not found")]
    NotFound,

    /// 429 with a retry hint.
    #[error("rate limited")]
    RateLimited { retry_after_seconds: u64 },

    /// 500. The message is logged, never returned.
    #[error("internal error")]
    Internal(String),
}

impl From<IngestError> for ApiError {
    fn from(e: IngestError) -> Self {
        match e {
            IngestError::Validation(v) => ApiError::Validation(v),
            IngestError::RateLimited {
                retry_after_seconds,
            } => ApiError::RateLimited {
                retry_after_seconds,
            },
            IngestError::Store(s) => s.into(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => ApiError::NotFound,
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Validation(v) => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": v.message, "field": v.field })),
            )
                .into_response(),

            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": "missing or invalid API key" })),
            )
                .into_response(),

            ApiError::Forbidden => (
                StatusCode::FORBIDDEN,
                Json(json!({ "error": "forbidden" })),
            )
                .into_response(),

            ApiError::NotFound => (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": "not found" })),
            )
                .into_response(),

            ApiError::RateLimited {
                retry_after_seconds,
            } => {
                let mut response = (
                    StatusCode::TOO_MANY_REQUESTS,
                    Json(json!({
                        "error": "rate limit exceeded",
                        "retry_after_seconds": retry_after_seconds,
                    })),
                )
                    .into_response();
                if let Ok(value) = HeaderValue::from_str(&retry_after_seconds.to_string()) {
                    response.headers_mut().insert(header::RETRY_AFTER, value);
                }
                response
            }

            ApiError::Internal(detail) => {
                error!(detail = %detail, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": "internal error" })),
                )
                    .into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn validation_carries_field_path() {
        let response =
            ApiError::Validation(ValidationError::new("recipient.phone_number", "bad"))
                .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["field"], "recipient.phone_number");
    }

    #[tokio::test]
    async fn rate_limited_sets_retry_after_header() {
        let response = ApiError::RateLimited {
            retry_after_seconds: 1800,
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).unwrap(),
            "1800"
        );
        let body = body_json(response).await;
        assert_eq!(body["retry_after_seconds"], 1800);
    }

    #[tokio::test]
    async fn internal_error_hides_detail() {
        let response = ApiError::Internal("connection pool exhausted".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["error"], "internal error");
        assert!(!body.to_string().contains("pool"));
    }
}

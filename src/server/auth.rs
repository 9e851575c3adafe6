//! API-key authentication.
//!
//! Keys arrive in the `X-API-Key` header and resolve to a [`TenantId`]
//! through the configured key map. The key string is a credential, not an
//! identity: tenants survive key rotation.

use axum::http::HeaderMap;

use super::{ApiError, AppState};
use crate::types::TenantId;

/// Header carrying the API key.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Resolves the calling tenant or rejects with 401.
pub fn authenticate(headers: &HeaderMap, state: &AppState) -> Result<TenantId, ApiError> {
    let key = headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::Unauthorized)?;

    state
        .api_keys()
        .get(key)
        .cloned()
        .ok_or(ApiError::Unauthorized)
}

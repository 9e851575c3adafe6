//! HTTP client for the WhatsApp Business (Graph) API.
//!
//! Builds the `/{version}/{phone_number_id}/messages` request for template
//! and text sends, authenticates with a bearer credential, and maps the
//! response into [`SendResult`] or a classified [`ProviderError`]. The
//! client never retries; every call is bounded by a single request timeout.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use super::{ProviderClient, ProviderError, SendResult};
use crate::types::{
    MessagePayload, PhoneNumber, ProviderMessageId, TemplateParameter, TemplateParameterKind,
};

/// Connection settings for the provider.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    /// e.g. `https://graph.facebook.com`
    pub base_url: String,
    /// e.g. `v18.0`
    pub api_version: String,
    pub phone_number_id: String,
    pub access_token: String,
    pub timeout: Duration,
}

/// Error body shape of the Graph API.
#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
    code: Option<i64>,
}

/// Success body shape: `{"messages": [{"id": "wamid..."}], ...}`.
#[derive(Debug, Deserialize)]
struct SendResponse {
    messages: Vec<SentMessage>,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    id: String,
}

/// Production [`ProviderClient`] over reqwest.
#[derive(Debug, Clone)]
pub struct WhatsAppClient {
    http: reqwest::Client,
    endpoint: String,
}

impl WhatsAppClient {
    pub fn new(settings: &ProviderSettings) -> Result<Self, ProviderError> {
        let mut headers = HeaderMap::new();
        let bearer = format!("Bearer {}", settings.access_token);
        let mut auth = HeaderValue::from_str(&bearer)
            .map_err(|e| ProviderError::permanent(format!("invalid access token: {e}")))?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(settings.timeout)
            .build()
            .map_err(|e| ProviderError::permanent(format!("failed to build HTTP client: {e}")))?;

        let endpoint = format!(
            "{}/{}/{}/messages",
            settings.base_url.trim_end_matches('/'),
            settings.api_version,
            settings.phone_number_id
        );

        Ok(WhatsAppClient { http, endpoint })
    }
}

/// Builds the Graph API message object for a payload.
fn message_body(recipient: &PhoneNumber, payload: &MessagePayload) -> Value {
    let mut body = json!({
        "messaging_product": "whatsapp",
        "recipient_type": "individual",
        "to": recipient.as_str(),
    });

    match payload {
        MessagePayload::Text { body: text } => {
            body["type"] = json!("text");
            body["text"] = json!({ "body": text });
        }
        MessagePayload::Template(template) => {
            body["type"] = json!("template");
            let mut t = json!({
                "name": template.name,
                "language": { "code": template.language },
            });
            if !template.parameters.is_empty() {
                t["components"] = json!([{
                    "type": "body",
                    "parameters": template
                        .parameters
                        .iter()
                        .map(parameter_object)
                        .collect::<Vec<_>>(),
                }]);
            }
            body["template"] = t;
        }
    }

    body
}

fn parameter_object(parameter: &TemplateParameter) -> Value {
    match parameter.kind {
        TemplateParameterKind::Text => json!({ "type": "text", "text": parameter.value }),
        TemplateParameterKind::Currency => json!({
            "type": "currency",
            "currency": { "fallback_value": parameter.value },
        }),
        TemplateParameterKind::DateTime => json!({
            "type": "date_time",
            "date_time": { "fallback_value": parameter.value },
        }),
    }
}

#[async_trait]
impl ProviderClient for WhatsAppClient {
    async fn send(
        &self,
        recipient: &PhoneNumber,
        payload: &MessagePayload,
    ) -> Result<SendResult, ProviderError> {
        let body = message_body(recipient, payload);

        let response = self
            .http
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                // Everything below the HTTP layer is transient by definition.
                ProviderError::transient(format!("request failed: {e}"))
            })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ProviderError::transient(format!("failed to read response: {e}")))?;

        debug!(status = %status, kind = payload.kind(), "provider response");

        if !status.is_success() {
            let (code, message) = match serde_json::from_str::<ApiErrorResponse>(&text) {
                Ok(parsed) => (parsed.error.code, parsed.error.message),
                Err(_) => (None, text.chars().take(500).collect()),
            };
            return Err(ProviderError::classify(status.as_u16(), code, message));
        }

        let raw_response: Value = serde_json::from_str(&text)
            .map_err(|e| ProviderError::permanent(format!("unparseable success body: {e}")))?;
        let parsed: SendResponse = serde_json::from_value(raw_response.clone())
            .map_err(|e| ProviderError::permanent(format!("unexpected success shape: {e}")))?;

        let id = parsed
            .messages
            .first()
            .map(|m| m.id.clone())
            .ok_or_else(|| ProviderError::permanent("success response carried no message id"))?;

        Ok(SendResult {
            provider_message_id: ProviderMessageId::new(id),
            raw_response,
        })
    }
}

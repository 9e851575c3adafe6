//! The ingestion request contract and its validation.
//!
//! Wire shapes stay close to the JSON body; validation turns them into the
//! typed domain payload, reporting the offending field path on failure so
//! the API can return a useful 400.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::types::notification::MAX_TEXT_LENGTH;
use crate::types::{
    CountryCode, MessagePayload, PhoneNumber, Priority, TemplateParameter, TemplateParameterKind,
    TemplateRef,
};

/// Maximum length of an event-type tag.
const MAX_EVENT_TYPE_LENGTH: usize = 100;

/// A validation failure, carrying the path of the offending field.
#[derive(Debug, Clone, Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        ValidationError {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// The notification creation request body.
#[derive(Debug, Clone, Deserialize)]
pub struct NotificationRequest {
    pub event_type: String,
    pub recipient: RecipientRequest,
    #[serde(default)]
    pub template: Option<TemplateRequest>,
    #[serde(default)]
    pub message: Option<TextRequest>,
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecipientRequest {
    pub phone_number: String,
    #[serde(default)]
    pub country_code: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TemplateRequest {
    pub name: String,
    pub language: String,
    #[serde(default)]
    pub parameters: Vec<ParameterRequest>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ParameterRequest {
    #[serde(rename = "type")]
    pub kind: TemplateParameterKind,
    pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TextRequest {
    pub text: String,
}

/// The validated, typed form of a request.
#[derive(Debug, Clone)]
pub struct ValidatedNotification {
    pub event_type: String,
    pub recipient: PhoneNumber,
    pub country_code: Option<CountryCode>,
    pub payload: MessagePayload,
    pub metadata: Map<String, Value>,
    pub priority: Priority,
    pub scheduled_for: Option<DateTime<Utc>>,
}

impl NotificationRequest {
    /// Validates the request into its typed form.
    pub fn validate(self) -> Result<ValidatedNotification, ValidationError> {
        if self.event_type.is_empty() || self.event_type.len() > MAX_EVENT_TYPE_LENGTH {
            return Err(ValidationError::new(
                "event_type",
                format!("must be 1 to {MAX_EVENT_TYPE_LENGTH} characters"),
            ));
        }

        let recipient = PhoneNumber::parse(&self.recipient.phone_number)
            .map_err(|e| ValidationError::new("recipient.phone_number", e.to_string()))?;

        let country_code = self
            .recipient
            .country_code
            .map(|c| {
                CountryCode::parse(&c)
                    .map_err(|e| ValidationError::new("recipient.country_code", e.to_string()))
            })
            .transpose()?;

        let payload = match (self.template, self.message) {
            (Some(template), None) => MessagePayload::Template(validate_template(template)?),
            (None, Some(message)) => {
                if message.text.is_empty() || message.text.len() > MAX_TEXT_LENGTH {
                    return Err(ValidationError::new(
                        "message.text",
                        format!("must be 1 to {MAX_TEXT_LENGTH} characters"),
                    ));
                }
                MessagePayload::Text { body: message.text }
            }
            (Some(_), Some(_)) | (None, None) => {
                return Err(ValidationError::new(
                    "template",
                    "exactly one of template or message is required",
                ));
            }
        };

        Ok(ValidatedNotification {
            event_type: self.event_type,
            recipient,
            country_code,
            payload,
            metadata: self.metadata.unwrap_or_default(),
            priority: self.priority.unwrap_or_default(),
            scheduled_for: self.scheduled_for,
        })
    }
}

fn validate_template(template: TemplateRequest) -> Result<TemplateRef, ValidationError> {
    if template.name.is_empty() {
        return Err(ValidationError::new("template.name", "must not be empty"));
    }
    if template.language.len() != 2 || !template.language.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(ValidationError::new(
            "template.language",
            "must be a 2-letter language code",
        ));
    }

    let parameters = template
        .parameters
        .into_iter()
        .enumerate()
        .map(|(i, p)| {
            if p.value.is_empty() {
                Err(ValidationError::new(
                    format!("template.parameters[{i}].value"),
                    "must not be empty",
                ))
            } else {
                Ok(TemplateParameter {
                    kind: p.kind,
                    value: p.value,
                })
            }
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(TemplateRef {
        name: template.name,
        language: template.language.to_ascii_lowercase(),
        parameters,
    })
}

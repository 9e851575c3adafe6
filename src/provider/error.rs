//! Provider error classification.
//!
//! The distinction between transient and permanent failures drives the
//! retry decision in the processor:
//!
//! - **Transient** errors are retried with backoff: network failures,
//!   HTTP 408/429/5xx, and the provider codes it documents as retryable.
//! - **Permanent** errors fail the notification immediately: other 4xx
//!   responses and everything else. Unknown provider codes default to
//!   permanent, because blindly retrying an unclassified rejection mostly
//!   burns the attempt budget against the same wall.

use std::fmt;

use thiserror::Error;

/// Provider codes documented as transient (throttling and temporary
/// capacity conditions).
const TRANSIENT_PROVIDER_CODES: [i64; 4] = [1, 2, 4, 80007];

/// The kind of provider error, categorized for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// Safe to retry with backoff.
    Transient,
    /// Retrying will not help; fail the notification.
    Permanent,
}

/// A classified provider error.
#[derive(Debug, Clone, Error)]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    /// Provider-reported error code, when the response carried one.
    pub code: Option<i64>,
    /// HTTP status, when the failure happened above the transport layer.
    pub status: Option<u16>,
    pub message: String,
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.status, self.code) {
            (Some(status), Some(code)) => {
                write!(f, "provider error (HTTP {status}, code {code}): {}", self.message)
            }
            (Some(status), None) => write!(f, "provider error (HTTP {status}): {}", self.message),
            (None, Some(code)) => write!(f, "provider error (code {code}): {}", self.message),
            (None, None) => write!(f, "provider error: {}", self.message),
        }
    }
}

impl ProviderError {
    pub fn transient(message: impl Into<String>) -> Self {
        ProviderError {
            kind: ProviderErrorKind::Transient,
            code: None,
            status: None,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        ProviderError {
            kind: ProviderErrorKind::Permanent,
            code: None,
            status: None,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == ProviderErrorKind::Transient
    }

    /// The error code as it appears in delivery logs: the provider code if
    /// present, otherwise the HTTP status.
    pub fn log_code(&self) -> String {
        match (self.code, self.status) {
            (Some(code), _) => code.to_string(),
            (None, Some(status)) => status.to_string(),
            (None, None) => "network".to_string(),
        }
    }

    /// Classifies an error response from its HTTP status and the provider
    /// code extracted from the body.
    ///
    /// Status takes precedence for the retryable HTTP classes (408, 429,
    /// 5xx); inside other 4xx responses only a documented transient
    /// provider code rescues the call from permanent failure.
    pub fn classify(status: u16, code: Option<i64>, message: impl Into<String>) -> Self {
        let transient_status = status == 408 || status == 429 || (500..600).contains(&status);
        let transient_code = code.is_some_and(|c| TRANSIENT_PROVIDER_CODES.contains(&c));

        ProviderError {
            kind: if transient_status || transient_code {
                ProviderErrorKind::Transient
            } else {
                ProviderErrorKind::Permanent
            },
            code,
            status: Some(status),
            message: message.into(),
        }
    }
}

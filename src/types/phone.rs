//! Validated recipient identifiers.
//!
//! Phone numbers are E.164 (`+<country><subscriber>`, 2-15 digits total).
//! Construction is only possible via `PhoneNumber::parse`, so any
//! `PhoneNumber` in the system is known-valid.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Error returned when parsing an invalid phone number.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid E.164 phone number: {preview}")]
pub struct InvalidPhoneNumber {
    preview: String,
}

/// An E.164 phone number.
///
/// Guaranteed to match `^\+[1-9]\d{1,14}$`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct PhoneNumber(String);

impl PhoneNumber {
    /// Parses a string as an E.164 phone number.
    pub fn parse(s: impl Into<String>) -> Result<Self, InvalidPhoneNumber> {
        let s = s.into();
        let digits = match s.strip_prefix('+') {
            Some(d) => d,
            None => return Err(InvalidPhoneNumber::new(&s)),
        };

        let valid = digits.len() >= 2
            && digits.len() <= 15
            && digits.chars().all(|c| c.is_ascii_digit())
            && !digits.starts_with('0');

        if valid {
            Ok(PhoneNumber(s))
        } else {
            Err(InvalidPhoneNumber::new(&s))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl InvalidPhoneNumber {
    fn new(s: &str) -> Self {
        InvalidPhoneNumber {
            preview: s.chars().take(20).collect(),
        }
    }
}

impl fmt::Display for PhoneNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<'de> Deserialize<'de> for PhoneNumber {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        PhoneNumber::parse(s).map_err(serde::de::Error::custom)
    }
}

/// Error returned when parsing an invalid country code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid ISO-3166 alpha-2 country code")]
pub struct InvalidCountryCode;

/// An ISO-3166 alpha-2 country code, normalized to uppercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct CountryCode(String);

impl CountryCode {
    pub fn parse(s: impl Into<String>) -> Result<Self, InvalidCountryCode> {
        let s = s.into();
        if s.len() == 2 && s.chars().all(|c| c.is_ascii_alphabetic()) {
            Ok(CountryCode(s.to_ascii_uppercase()))
        } else {
            Err(InvalidCountryCode)
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CountryCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<'de> Deserialize<'de> for CountryCode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        CountryCode::parse(s).map_err(serde::de::Error::custom)
    }
}

//! Callback body authentication.
//!
//! With an app secret configured, the provider sends
//! `X-Hub-Signature-256: sha256=<hex hmac>` alongside every callback POST,
//! where the digest is the HMAC-SHA256 of the raw body. Verification runs
//! before the body is parsed; without a configured secret the header is
//! ignored entirely, matching the unsigned baseline wire contract.

use hmac::{Hmac, Mac};
use sha2::Sha256;

/// Checks a callback body against its `X-Hub-Signature-256` header value.
///
/// Any malformed header (wrong prefix, bad hex) fails verification rather
/// than erroring: a forged request and a garbled one get the same 403.
/// The digest comparison itself is constant-time via the HMAC library.
pub fn verify_signature(payload: &[u8], signature_header: &str, secret: &[u8]) -> bool {
    let Some(hex_digest) = signature_header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(claimed) = hex::decode(hex_digest) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(&claimed).is_ok()
}

/// Produces the header value the provider would send for `payload`.
///
/// The relay never signs anything in production; this exists so tests can
/// forge valid callbacks.
pub fn sign_payload(payload: &[u8], secret: &[u8]) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(payload);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

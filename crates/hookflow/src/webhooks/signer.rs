//! HMAC-SHA256 payload signing.
//!
//! The signature covers the exact request body bytes and is sent as
//! `X-Webhook-Signature: sha256=<lowercase hex>`. A receiver verifies by
//! recomputing the HMAC over the raw body it read off the socket (before any
//! JSON parsing) with the shared secret and comparing in constant time, which
//! is what [`verify`] does.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::DeliveryError;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_PREFIX: &str = "sha256=";

/// Hex-encoded HMAC-SHA256 of `payload` keyed with `secret`.
pub fn sign(secret: &str, payload: &[u8]) -> Result<String, DeliveryError> {
    let mut mac = new_mac(secret)?;
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Header value for a hex digest produced by [`sign`].
pub fn signature_header(hex_digest: &str) -> String {
    format!("{SIGNATURE_PREFIX}{hex_digest}")
}

/// Accepts either the bare hex digest or the `sha256=` header form.
pub fn verify(secret: &str, payload: &[u8], signature: &str) -> bool {
    let digest = signature
        .trim()
        .strip_prefix(SIGNATURE_PREFIX)
        .unwrap_or(signature.trim());

    let Ok(expected) = hex::decode(digest) else {
        return false;
    };
    let Ok(mut mac) = new_mac(secret) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(&expected).is_ok()
}

fn new_mac(secret: &str) -> Result<HmacSha256, DeliveryError> {
    if secret.is_empty() {
        return Err(DeliveryError::Signature("webhook secret is empty".into()));
    }
    HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| DeliveryError::Signature(e.to_string()))
}

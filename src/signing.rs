//! Verification of platform webhook signatures.
//!
//! Platforms that sign their deliveries send `sha256=<hex hmac>` computed
//! over the raw body with a shared app secret.

use hmac::{Hmac, Mac};
use sha2::Sha256;

/// Header carrying the SHA-256 platform signature.
pub const PLATFORM_SIGNATURE_HEADER: &str = "X-Hub-Signature-256";

const SIGNATURE_PREFIX: &str = "sha256=";

const KEY_COMPARISON_CONTEXT: &[u8] = b"webhook-relay api key";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationError {
    MissingSignature,
    MalformedSignature,
    InvalidSignature,
}

/// Compute the signature header value for a body.
pub fn compute_signature(secret: &[u8], payload: &[u8]) -> String {
    let mut mac = new_mac(secret);
    mac.update(payload);
    format!("{}{}", SIGNATURE_PREFIX, hex::encode(mac.finalize().into_bytes()))
}

/// Verify a `sha256=<hex>` signature header value in constant time.
pub fn verify_signature(secret: &[u8], payload: &[u8], header_value: &str) -> Result<(), VerificationError> {
    let hex_part = header_value
        .trim()
        .strip_prefix(SIGNATURE_PREFIX)
        .ok_or(VerificationError::MalformedSignature)?;
    let Ok(signature) = hex::decode(hex_part) else {
        return Err(VerificationError::MalformedSignature);
    };

    let mut mac = new_mac(secret);
    mac.update(payload);
    mac.verify_slice(&signature).map_err(|_| VerificationError::InvalidSignature)
}

/// Find the platform signature among request headers and verify it.
pub fn verify_webhook_request<'a, I>(
    headers: I,
    payload: &[u8],
    secret: &[u8],
) -> Result<(), VerificationError>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let signature = headers
        .into_iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(PLATFORM_SIGNATURE_HEADER))
        .map(|(_, value)| value)
        .ok_or(VerificationError::MissingSignature)?;
    verify_signature(secret, payload, signature)
}

/// Compare a presented API key against the configured one in constant time.
///
/// Both keys are reduced to fixed-length HMAC digests first, so timing
/// depends on neither the mismatch position nor the key lengths.
pub fn keys_match(expected: &str, presented: &str) -> bool {
    let digest = |key: &str| {
        let mut mac = new_mac(KEY_COMPARISON_CONTEXT);
        mac.update(key.as_bytes());
        mac
    };
    let expected = digest(expected).finalize().into_bytes();
    digest(presented).verify_slice(&expected).is_ok()
}

fn new_mac(secret: &[u8]) -> Hmac<Sha256> {
    match Hmac::<Sha256>::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => unreachable!("hmac accepts keys of any length"),
    }
}

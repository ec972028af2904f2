//! HMAC-SHA256 Standard Webhooks signing, offered as an opt-in convenience on
//! [`crate::http_client::ReqwestWebhookHttpClient`].
//!
//! Standard Webhooks uses the following signature scheme:
//! - Signature is computed over: `{msg_id}.{timestamp}.{payload}`
//! - The signature is base64-encoded HMAC-SHA256
//! - Headers included: `webhook-id`, `webhook-timestamp`, `webhook-signature`
//!
//! See: <https://www.standardwebhooks.com/>
//!
//! Not part of the dispatch engine's core invariants (SPEC_FULL only requires
//! a `{ url, body, headers }` request); grounded on the teacher's
//! `dwctl/src/webhooks/signing.rs`.

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Prefix for webhook signing secrets.
pub const SECRET_PREFIX: &str = "whsec_";

/// Generate a new `whsec_`-prefixed base64-encoded 32-byte random secret.
pub fn generate_secret() -> String {
    use rand::RngCore;

    let mut secret_bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut secret_bytes);
    format!("{}{}", SECRET_PREFIX, BASE64_STANDARD.encode(secret_bytes))
}

/// Extract the raw secret bytes from a `whsec_`-prefixed secret. `None` if the
/// prefix or base64 encoding is invalid.
pub fn decode_secret(secret: &str) -> Option<Vec<u8>> {
    let encoded = secret.strip_prefix(SECRET_PREFIX)?;
    BASE64_STANDARD.decode(encoded).ok()
}

/// Sign a dispatch body according to the Standard Webhooks scheme. Returns
/// the signature in `v1,{base64-hmac-sha256}` format.
pub fn sign_payload(msg_id: &str, timestamp: i64, payload: &str, secret: &str) -> Option<String> {
    let secret_bytes = decode_secret(secret)?;

    let signed_content = format!("{msg_id}.{timestamp}.{payload}");

    let mut mac = HmacSha256::new_from_slice(&secret_bytes).ok()?;
    mac.update(signed_content.as_bytes());
    let signature = mac.finalize().into_bytes();

    Some(format!("v1,{}", BASE64_STANDARD.encode(signature)))
}

/// Build the `webhook-id` / `webhook-timestamp` / `webhook-signature` header
/// triple for a dispatch body, or `None` if `secret` is malformed.
pub fn signing_headers(msg_id: &str, timestamp: i64, payload: &str, secret: &str) -> Option<[(String, String); 3]> {
    let signature = sign_payload(msg_id, timestamp, payload, secret)?;
    Some([
        ("webhook-id".to_string(), msg_id.to_string()),
        ("webhook-timestamp".to_string(), timestamp.to_string()),
        ("webhook-signature".to_string(), signature),
    ])
}

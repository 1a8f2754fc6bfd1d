//! Webhook signature verification.
//!
//! Deliveries carry an HMAC-SHA256 over the raw request body in the
//! `X-Hub-Signature-256` header, formatted `sha256=<hex>`. Verification is
//! constant-time via the `Mac` comparison; the payload itself is never
//! logged.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Check a delivery signature against the shared secret. Any malformed
/// header is a plain rejection, not an error.
pub fn verify(secret: &[u8], body: &[u8], header: &str) -> bool {
    let Some(hex_digest) = header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Compute the header value for a body; used by tests and dev tooling.
pub fn sign(secret: &[u8], body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_accepts() {
        let secret = b"it's a secret to everybody";
        let body = br#"{"action":"opened"}"#;
        assert!(verify(secret, body, &sign(secret, body)));
    }

    #[test]
    fn wrong_secret_rejects() {
        let body = b"payload";
        let header = sign(b"secret-a", body);
        assert!(!verify(b"secret-b", body, &header));
    }

    #[test]
    fn tampered_body_rejects() {
        let secret = b"secret";
        let header = sign(secret, b"payload");
        assert!(!verify(secret, b"payload2", &header));
    }

    #[test]
    fn malformed_headers_reject() {
        let secret = b"secret";
        assert!(!verify(secret, b"payload", ""));
        assert!(!verify(secret, b"payload", "sha1=deadbeef"));
        assert!(!verify(secret, b"payload", "sha256=not-hex"));
    }
}

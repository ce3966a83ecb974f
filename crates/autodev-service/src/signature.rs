//! Webhook signature verification.
//!
//! Signatures are HMAC-SHA256 over the exact received byte stream in
//! `sha256=<hex-digest>` format. Verification must happen on the raw body
//! before any JSON parsing; re-serialization is forbidden because it would
//! change the signed bytes. The comparison is constant time.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Signature verification failures; all collapse to `401` at the edge.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature header missing")]
    Missing,

    #[error("signature is not valid hex")]
    MalformedHex,

    #[error("HMAC-SHA256 digest does not match")]
    Mismatch,
}

/// Verifies webhook signatures against a shared secret.
pub struct SignatureVerifier {
    secret: String,
}

impl SignatureVerifier {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Verify `signature` over `payload`.
    ///
    /// Accepts a `sha256=` prefix (the format most trackers send) and bare
    /// hex digests.
    pub fn verify(&self, payload: &[u8], signature: &str) -> Result<(), SignatureError> {
        let hex_part = signature.strip_prefix("sha256=").unwrap_or(signature);
        let sig_bytes = hex::decode(hex_part).map_err(|_| SignatureError::MalformedHex)?;

        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|_| SignatureError::Mismatch)?;
        mac.update(payload);

        mac.verify_slice(&sig_bytes)
            .map_err(|_| SignatureError::Mismatch)
    }

    /// Produce the signature for a payload; used by tests and loopback
    /// tooling.
    pub fn sign(&self, payload: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(payload);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureVerifier")
            .field("secret", &"<REDACTED>")
            .finish()
    }
}

#[cfg(test)]
#[path = "signature_tests.rs"]
mod tests;

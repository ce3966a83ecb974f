//! Tests for webhook signature verification.

use super::*;

#[test]
fn valid_signature_passes() {
    let verifier = SignatureVerifier::new("test-secret");
    let payload = br#"{"action":"create"}"#;

    let signature = verifier.sign(payload);
    assert!(verifier.verify(payload, &signature).is_ok());
}

#[test]
fn bare_hex_without_prefix_passes() {
    let verifier = SignatureVerifier::new("test-secret");
    let payload = b"body";

    let signature = verifier.sign(payload);
    let bare = signature.strip_prefix("sha256=").unwrap();
    assert!(verifier.verify(payload, bare).is_ok());
}

#[test]
fn tampered_payload_fails() {
    let verifier = SignatureVerifier::new("test-secret");
    let signature = verifier.sign(b"original");

    assert_eq!(
        verifier.verify(b"tampered", &signature),
        Err(SignatureError::Mismatch)
    );
}

#[test]
fn wrong_secret_fails() {
    let signer = SignatureVerifier::new("secret-a");
    let verifier = SignatureVerifier::new("secret-b");
    let payload = b"body";

    let signature = signer.sign(payload);
    assert_eq!(
        verifier.verify(payload, &signature),
        Err(SignatureError::Mismatch)
    );
}

#[test]
fn non_hex_signature_is_malformed() {
    let verifier = SignatureVerifier::new("test-secret");
    assert_eq!(
        verifier.verify(b"body", "sha256=not-hex!"),
        Err(SignatureError::MalformedHex)
    );
}

#[test]
fn debug_redacts_the_secret() {
    let verifier = SignatureVerifier::new("super-secret-value");
    let debug = format!("{verifier:?}");
    assert!(!debug.contains("super-secret-value"));
    assert!(debug.contains("REDACTED"));
}

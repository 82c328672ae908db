//! Canonical signing form and Ed25519 verification.
//!
//! Every privileged frame the server forwards or persists carries a `sig`.
//! The signed content is the canonical string
//!
//! ```text
//! v1\n<messageType>\n<messageId>\n<from>\n<toOrGroupId>\n<timestamp>\n<nonce>\n<ciphertext>\n
//! ```
//!
//! with fields in fixed order, literal newlines, values exactly as the sender
//! produced them, and omitted optional fields contributing no line at all.
//! The signature is Ed25519 over `SHA-256(canonical)`.
//!
//! Session tokens authenticate the *socket*; signatures authenticate the
//! *message*. Any discrepancy in field order, separator, or version tag
//! invalidates a signature by construction.

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};

use crate::error::WhisperError;

/// Version tag — the first line of every canonical form.
pub const CANONICAL_VERSION: &str = "v1";

/// Borrowed view of the signed fields of a frame.
#[derive(Debug, Clone, Copy)]
pub struct CanonicalFields<'a> {
    pub message_type: &'a str,
    pub message_id: &'a str,
    pub from: &'a str,
    pub to_or_group_id: &'a str,
    pub timestamp: i64,
    pub nonce: Option<&'a str>,
    pub ciphertext: Option<&'a str>,
}

/// Build the canonical string for a frame.
pub fn canonical_form(f: &CanonicalFields<'_>) -> String {
    let mut s = String::with_capacity(
        64 + f.ciphertext.map_or(0, str::len) + f.nonce.map_or(0, str::len),
    );
    s.push_str(CANONICAL_VERSION);
    s.push('\n');
    s.push_str(f.message_type);
    s.push('\n');
    s.push_str(f.message_id);
    s.push('\n');
    s.push_str(f.from);
    s.push('\n');
    s.push_str(f.to_or_group_id);
    s.push('\n');
    s.push_str(&f.timestamp.to_string());
    s.push('\n');
    if let Some(nonce) = f.nonce {
        s.push_str(nonce);
        s.push('\n');
    }
    if let Some(ct) = f.ciphertext {
        s.push_str(ct);
        s.push('\n');
    }
    s
}

/// Parse a stored/base64 verifying key. Any defect maps to `AUTH_FAILED`.
pub fn verifying_key(sign_public_key_b64: &str) -> Result<VerifyingKey, WhisperError> {
    let bytes = B64
        .decode(sign_public_key_b64)
        .map_err(|_| WhisperError::AuthFailed)?;
    let arr: [u8; 32] = bytes.as_slice().try_into().map_err(|_| WhisperError::AuthFailed)?;
    VerifyingKey::from_bytes(&arr).map_err(|_| WhisperError::AuthFailed)
}

fn parse_signature(sig_b64: &str) -> Result<Signature, WhisperError> {
    let bytes = B64.decode(sig_b64).map_err(|_| WhisperError::AuthFailed)?;
    let arr: [u8; 64] = bytes.as_slice().try_into().map_err(|_| WhisperError::AuthFailed)?;
    Ok(Signature::from_bytes(&arr))
}

/// Verify `sig` over the SHA-256 digest of `canonical` under the sender's key.
pub fn verify_canonical(
    sign_public_key_b64: &str,
    sig_b64: &str,
    canonical: &str,
) -> Result<(), WhisperError> {
    let key = verifying_key(sign_public_key_b64)?;
    let sig = parse_signature(sig_b64)?;
    let digest = Sha256::digest(canonical.as_bytes());
    key.verify(&digest, &sig).map_err(|_| WhisperError::AuthFailed)
}

/// Convenience: build the canonical form and verify in one step.
pub fn verify_fields(
    sign_public_key_b64: &str,
    sig_b64: &str,
    fields: &CanonicalFields<'_>,
) -> Result<(), WhisperError> {
    verify_canonical(sign_public_key_b64, sig_b64, &canonical_form(fields))
}

/// Verify a registration proof: Ed25519 over `SHA-256(challengeBytes)`.
pub fn verify_challenge_proof(
    sign_public_key_b64: &str,
    sig_b64: &str,
    challenge: &[u8],
) -> Result<(), WhisperError> {
    let key = verifying_key(sign_public_key_b64)?;
    let sig = parse_signature(sig_b64)?;
    let digest = Sha256::digest(challenge);
    key.verify(&digest, &sig).map_err(|_| WhisperError::AuthFailed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};

    fn test_key() -> (SigningKey, String) {
        let sk = SigningKey::from_bytes(&[42u8; 32]);
        let pk = B64.encode(sk.verifying_key().as_bytes());
        (sk, pk)
    }

    fn sign_canonical(sk: &SigningKey, canonical: &str) -> String {
        let digest = Sha256::digest(canonical.as_bytes());
        B64.encode(sk.sign(&digest).to_bytes())
    }

    #[test]
    fn canonical_form_layout() {
        let f = CanonicalFields {
            message_type: "text",
            message_id: "11111111-2222-3333-4444-555555555555",
            from: "WSP-AAAA-BBBB-CCCC",
            to_or_group_id: "WSP-DDDD-EEEE-FFFF",
            timestamp: 1700000000123,
            nonce: Some("bm9uY2U"),
            ciphertext: Some("Y3Q"),
        };
        assert_eq!(
            canonical_form(&f),
            "v1\ntext\n11111111-2222-3333-4444-555555555555\nWSP-AAAA-BBBB-CCCC\nWSP-DDDD-EEEE-FFFF\n1700000000123\nbm9uY2U\nY3Q\n"
        );
    }

    #[test]
    fn omitted_optionals_contribute_no_line() {
        let f = CanonicalFields {
            message_type: "delivery_receipt",
            message_id: "m1",
            from: "a",
            to_or_group_id: "b",
            timestamp: 5,
            nonce: None,
            ciphertext: None,
        };
        assert_eq!(canonical_form(&f), "v1\ndelivery_receipt\nm1\na\nb\n5\n");
    }

    #[test]
    fn round_trip_verifies() {
        let (sk, pk) = test_key();
        let f = CanonicalFields {
            message_type: "text",
            message_id: "m1",
            from: "a",
            to_or_group_id: "b",
            timestamp: 1,
            nonce: Some("n"),
            ciphertext: Some("c"),
        };
        let sig = sign_canonical(&sk, &canonical_form(&f));
        verify_fields(&pk, &sig, &f).expect("signature should verify");
    }

    #[test]
    fn any_field_change_invalidates() {
        let (sk, pk) = test_key();
        let f = CanonicalFields {
            message_type: "text",
            message_id: "m1",
            from: "a",
            to_or_group_id: "b",
            timestamp: 1,
            nonce: Some("n"),
            ciphertext: Some("c"),
        };
        let sig = sign_canonical(&sk, &canonical_form(&f));
        let tampered = CanonicalFields { timestamp: 2, ..f };
        assert!(verify_fields(&pk, &sig, &tampered).is_err());
        let tampered = CanonicalFields { ciphertext: Some("d"), ..f };
        assert!(verify_fields(&pk, &sig, &tampered).is_err());
    }

    #[test]
    fn wrong_key_fails() {
        let (sk, _) = test_key();
        let other = SigningKey::from_bytes(&[43u8; 32]);
        let other_pk = B64.encode(other.verifying_key().as_bytes());
        let f = CanonicalFields {
            message_type: "text",
            message_id: "m1",
            from: "a",
            to_or_group_id: "b",
            timestamp: 1,
            nonce: None,
            ciphertext: None,
        };
        let sig = sign_canonical(&sk, &canonical_form(&f));
        assert!(verify_fields(&other_pk, &sig, &f).is_err());
    }

    #[test]
    fn challenge_proof_round_trip() {
        let (sk, pk) = test_key();
        let challenge = [9u8; 32];
        let digest = Sha256::digest(challenge);
        let sig = B64.encode(sk.sign(&digest).to_bytes());
        verify_challenge_proof(&pk, &sig, &challenge).expect("proof should verify");
        assert!(verify_challenge_proof(&pk, &sig, &[8u8; 32]).is_err());
    }
}

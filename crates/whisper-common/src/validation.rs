//! Field-level validation helpers used by the frame codec and HTTP routes.
//!
//! The server never decrypts anything, but it does enforce shape: base64
//! fields must decode to their exact expected lengths, UUIDs must parse, and
//! opaque blobs are bounded so a client cannot feed the broker unbounded junk.

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use uuid::Uuid;

use crate::error::{invalid_payload, WhisperError};

/// Byte length of an Ed25519 or X25519 public key.
pub const PUBLIC_KEY_LEN: usize = 32;
/// Byte length of an Ed25519 signature.
pub const SIGNATURE_LEN: usize = 64;
/// Byte length of an XChaCha20 nonce.
pub const NONCE_LEN: usize = 24;
/// Largest ciphertext accepted in a single envelope (256 KiB of base64).
pub const MAX_CIPHERTEXT_B64_LEN: usize = 256 * 1024;

/// Decode a base64 field and require an exact byte length.
pub fn decode_exact(encoded: &str, expected_len: usize, label: &str) -> Result<Vec<u8>, WhisperError> {
    let bytes = B64
        .decode(encoded)
        .map_err(|_| invalid_payload(format!("{label} is not valid base64")))?;
    if bytes.len() != expected_len {
        return Err(invalid_payload(format!(
            "{label} must decode to {expected_len} bytes, got {}",
            bytes.len()
        )));
    }
    Ok(bytes)
}

/// Validate a 32-byte public key field (X25519 or Ed25519).
pub fn check_public_key(encoded: &str, label: &str) -> Result<[u8; 32], WhisperError> {
    let bytes = decode_exact(encoded, PUBLIC_KEY_LEN, label)?;
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

/// Validate a 64-byte Ed25519 signature field.
pub fn check_signature(encoded: &str, label: &str) -> Result<[u8; 64], WhisperError> {
    let bytes = decode_exact(encoded, SIGNATURE_LEN, label)?;
    let mut out = [0u8; 64];
    out.copy_from_slice(&bytes);
    Ok(out)
}

/// Validate a 24-byte nonce field.
pub fn check_nonce(encoded: &str) -> Result<(), WhisperError> {
    decode_exact(encoded, NONCE_LEN, "nonce").map(|_| ())
}

/// Validate an opaque ciphertext field: base64, non-empty, bounded.
pub fn check_ciphertext(encoded: &str) -> Result<(), WhisperError> {
    if encoded.is_empty() || encoded.len() > MAX_CIPHERTEXT_B64_LEN {
        return Err(invalid_payload("ciphertext length out of range"));
    }
    B64.decode(encoded)
        .map(|_| ())
        .map_err(|_| invalid_payload("ciphertext is not valid base64"))
}

/// Parse a UUID field.
pub fn check_uuid(value: &str, label: &str) -> Result<Uuid, WhisperError> {
    Uuid::parse_str(value).map_err(|_| invalid_payload(format!("{label} is not a valid UUID")))
}

/// Bound a free-text field (titles, platform names, message types).
pub fn check_text(value: &str, max_len: usize, label: &str) -> Result<(), WhisperError> {
    if value.is_empty() || value.len() > max_len {
        return Err(invalid_payload(format!("{label} length out of range")));
    }
    Ok(())
}

/// Attachment object keys: fixed prefix, no traversal, bounded length.
pub fn check_object_key(key: &str) -> Result<(), WhisperError> {
    if !key.starts_with("whisper/att/") {
        return Err(invalid_payload("objectKey must start with whisper/att/"));
    }
    if key.contains("..") {
        return Err(invalid_payload("objectKey must not contain '..'"));
    }
    if key.len() > 255 {
        return Err(invalid_payload("objectKey exceeds 255 bytes"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b64(bytes: &[u8]) -> String {
        B64.encode(bytes)
    }

    #[test]
    fn exact_length_enforced() {
        assert!(check_public_key(&b64(&[0u8; 32]), "key").is_ok());
        assert!(check_public_key(&b64(&[0u8; 31]), "key").is_err());
        assert!(check_public_key("not base64!!", "key").is_err());
        assert!(check_signature(&b64(&[0u8; 64]), "sig").is_ok());
        assert!(check_signature(&b64(&[0u8; 63]), "sig").is_err());
        assert!(check_nonce(&b64(&[0u8; 24])).is_ok());
        assert!(check_nonce(&b64(&[0u8; 12])).is_err());
    }

    #[test]
    fn object_key_hygiene() {
        assert!(check_object_key("whisper/att/2026/07/a/b.bin").is_ok());
        assert!(check_object_key("whisper/avatars/x.png").is_err());
        assert!(check_object_key("whisper/att/../secrets").is_err());
        let long = format!("whisper/att/{}", "x".repeat(300));
        assert!(check_object_key(&long).is_err());
    }

    #[test]
    fn ciphertext_bounds() {
        assert!(check_ciphertext(&b64(b"hello")).is_ok());
        assert!(check_ciphertext("").is_err());
        assert!(check_ciphertext("!!!").is_err());
    }
}

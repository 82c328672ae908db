//! WhisperID — the public user handle.
//!
//! Format: `WSP-XXXX-XXXX-XXXX` over the 32-symbol alphabet `A–Z2–7`
//! (base32-like; `0/1/8/9` are excluded to avoid transcription ambiguity).
//!
//! Fresh identities derive their WhisperID deterministically from the Ed25519
//! signing public key: the first 60 bits of `SHA-256(signPublicKey)` map to
//! 12 alphabet symbols. Re-registering with the same key pair therefore yields
//! the same handle.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::error::{invalid_payload, WhisperError};

/// The 32-symbol WhisperID alphabet.
pub const ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

/// Total length of a formatted WhisperID, e.g. `WSP-K3QA-7ZPM-XW2B`.
pub const FORMATTED_LEN: usize = 18;

/// A validated WhisperID.
///
/// The inner string is always in canonical `WSP-XXXX-XXXX-XXXX` form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WhisperId(String);

impl WhisperId {
    /// Parse and validate a WhisperID string.
    pub fn parse(s: &str) -> Result<Self, WhisperError> {
        if s.len() != FORMATTED_LEN {
            return Err(invalid_payload("malformed WhisperID"));
        }
        let bytes = s.as_bytes();
        if &bytes[..4] != b"WSP-" || bytes[8] != b'-' || bytes[13] != b'-' {
            return Err(invalid_payload("malformed WhisperID"));
        }
        for (i, &b) in bytes.iter().enumerate() {
            if matches!(i, 0..=3 | 8 | 13) {
                continue;
            }
            if !ALPHABET.contains(&b) {
                return Err(invalid_payload("malformed WhisperID"));
            }
        }
        Ok(Self(s.to_owned()))
    }

    /// Derive the WhisperID bound to an Ed25519 signing public key.
    pub fn derive(sign_public_key: &[u8; 32]) -> Self {
        let digest = Sha256::digest(sign_public_key);
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        // Top 60 bits of the digest → 12 symbols of 5 bits each.
        let mut acc = u64::from_be_bytes(prefix) >> 4;
        let mut symbols = [0u8; 12];
        for slot in symbols.iter_mut().rev() {
            *slot = ALPHABET[(acc & 0x1f) as usize];
            acc >>= 5;
        }
        let s = std::str::from_utf8(&symbols).expect("alphabet is ASCII");
        Self(format!("WSP-{}-{}-{}", &s[0..4], &s[4..8], &s[8..12]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WhisperId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for WhisperId {
    type Err = WhisperError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for WhisperId {
    type Error = WhisperError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<WhisperId> for String {
    fn from(id: WhisperId) -> String {
        id.0
    }
}

impl AsRef<str> for WhisperId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_is_deterministic_and_well_formed() {
        let key = [7u8; 32];
        let a = WhisperId::derive(&key);
        let b = WhisperId::derive(&key);
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), FORMATTED_LEN);
        WhisperId::parse(a.as_str()).expect("derived id must parse");
    }

    #[test]
    fn distinct_keys_give_distinct_ids() {
        let a = WhisperId::derive(&[1u8; 32]);
        let b = WhisperId::derive(&[2u8; 32]);
        assert_ne!(a, b);
    }

    #[test]
    fn rejects_bad_shapes() {
        for bad in [
            "",
            "WSP-ABCD-ABCD-ABC",    // too short
            "WSP-ABCD-ABCD-ABCDE",  // too long
            "WXP-ABCD-ABCD-ABCD",   // wrong prefix
            "WSP-ABCD.ABCD-ABCD",   // wrong separator
            "WSP-ABC0-ABCD-ABCD",   // 0 not in alphabet
            "WSP-abcd-ABCD-ABCD",   // lowercase
            "WSP-AB1D-ABCD-ABCD",   // 1 not in alphabet
        ] {
            assert!(WhisperId::parse(bad).is_err(), "should reject {bad:?}");
        }
    }

    #[test]
    fn accepts_full_alphabet() {
        WhisperId::parse("WSP-ABYZ-2345-67QK").expect("valid id");
    }

    #[test]
    fn serde_round_trip() {
        let id = WhisperId::derive(&[9u8; 32]);
        let json = serde_json::to_string(&id).unwrap();
        let back: WhisperId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
        assert!(serde_json::from_str::<WhisperId>("\"WSP-bad\"").is_err());
    }
}

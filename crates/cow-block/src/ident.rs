//! Block identifiers and their hex codec.
//!
//! An identifier is the 8-byte content digest. On disk and in upper-layer
//! metadata it is spelled as exactly 16 lowercase hex characters; any other
//! spelling is rejected rather than normalized.

use std::fmt;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::{BlockError, Result};

/// Digest width in bytes.
pub const DIGEST_LEN: usize = 8;

/// Length of the printable identifier.
pub const ID_HEX_LEN: usize = DIGEST_LEN * 2;

/// Opaque content identifier of a stored block.
///
/// Identifiers compare for equality only.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId([u8; DIGEST_LEN]);

impl BlockId {
    #[inline]
    pub const fn from_bytes(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        encode(&self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        decode(s).map(Self)
    }

    /// First two hex characters, used as the fan-out directory name.
    pub fn fanout_prefix(&self) -> String {
        hex::encode(&self.0[..1])
    }
}

/// Encode digest bytes as 16 lowercase hex characters.
pub fn encode(bytes: &[u8; DIGEST_LEN]) -> String {
    hex::encode(bytes)
}

/// Decode a 16-character lowercase hex identifier.
pub fn decode(s: &str) -> Result<[u8; DIGEST_LEN]> {
    if s.len() != ID_HEX_LEN {
        return Err(malformed(
            s,
            format!("expected {} hex characters, got {}", ID_HEX_LEN, s.len()),
        ));
    }
    if let Some(c) = s.chars().find(|c| !matches!(c, '0'..='9' | 'a'..='f')) {
        return Err(malformed(s, format!("invalid character {:?}", c)));
    }

    let mut bytes = [0u8; DIGEST_LEN];
    hex::decode_to_slice(s, &mut bytes).map_err(|e| malformed(s, e.to_string()))?;
    Ok(bytes)
}

fn malformed(input: &str, reason: String) -> BlockError {
    // Identifiers can come from arbitrary upper-layer metadata; keep the
    // error bounded.
    let input = input.chars().take(64).collect();
    BlockError::MalformedIdentifier { input, reason }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockId({})", self.to_hex())
    }
}

impl FromStr for BlockId {
    type Err = BlockError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl From<[u8; DIGEST_LEN]> for BlockId {
    fn from(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }
}

impl Serialize for BlockId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for BlockId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        BlockId::from_hex(&s).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_encode_is_lowercase_fixed_width() {
        let id = BlockId::from_bytes([0x00, 0x01, 0xAB, 0xCD, 0xEF, 0x10, 0x99, 0xFF]);
        assert_eq!(id.to_string(), "0001abcdef1099ff");
        assert_eq!(id.to_string().len(), ID_HEX_LEN);
    }

    #[test]
    fn test_decode_rejects_wrong_length() {
        for input in ["", "abc", "0001abcdef1099f", "0001abcdef1099ff0"] {
            let err = decode(input).unwrap_err();
            assert!(matches!(err, BlockError::MalformedIdentifier { .. }), "{}", input);
        }
    }

    #[test]
    fn test_decode_rejects_non_hex() {
        for input in [
            "0001abcdef1099fg",
            "0001ABCDEF1099FF",
            "0001abcdef1099f ",
            "+001abcdef1099ff",
        ] {
            let err = decode(input).unwrap_err();
            assert!(matches!(err, BlockError::MalformedIdentifier { .. }), "{}", input);
        }
    }

    #[test]
    fn test_decode_rejects_multibyte_chars() {
        // 16 bytes, but not 16 hex characters
        let input = "0001abcdef10ü9f";
        assert_eq!(input.len(), 16);
        assert!(matches!(
            decode(input),
            Err(BlockError::MalformedIdentifier { .. })
        ));
    }

    #[test]
    fn test_fanout_prefix() {
        let id: BlockId = "995dc9bbdf1939fa".parse().unwrap();
        assert_eq!(id.fanout_prefix(), "99");
    }

    #[test]
    fn test_serde_as_string() {
        let id: BlockId = "995dc9bbdf1939fa".parse().unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"995dc9bbdf1939fa\"");
        let back: BlockId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);

        assert!(serde_json::from_str::<BlockId>("\"not-an-id\"").is_err());
    }

    proptest! {
        #[test]
        fn prop_roundtrip(bytes in any::<[u8; DIGEST_LEN]>()) {
            let hex = encode(&bytes);
            prop_assert_eq!(decode(&hex).unwrap(), bytes);
        }

        #[test]
        fn prop_decode_only_accepts_canonical(s in "[0-9a-fA-Fg-z]{0,20}") {
            let canonical = s.len() == ID_HEX_LEN
                && s.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f'));
            match decode(&s) {
                Ok(bytes) => {
                    prop_assert!(canonical);
                    prop_assert_eq!(encode(&bytes), s);
                }
                Err(BlockError::MalformedIdentifier { .. }) => prop_assert!(!canonical),
                Err(other) => prop_assert!(false, "unexpected error {}", other),
            }
        }
    }
}

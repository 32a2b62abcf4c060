//! Typed ID definitions.
//!
//! Hash IDs are SHA-256 digests rendered as URL-safe base64. Node numbers
//! are small integers assigned by the network configuration.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use sha2::{Digest, Sha256};

use crate::{define_hash_id, IdError, HASH_LEN};

// =============================================================================
// Hash IDs
// =============================================================================

define_hash_id!(PoolId, "pool");
define_hash_id!(ContractId, "contract");
define_hash_id!(ResultHash, "result");
define_hash_id!(SessionHash, "session");

impl From<PoolId> for SessionHash {
    /// A download session is keyed by the pool it serves.
    fn from(pool_id: PoolId) -> Self {
        Self::from_bytes(*pool_id.as_bytes())
    }
}

#[doc(hidden)]
pub fn digest(data: &[u8]) -> [u8; HASH_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

#[doc(hidden)]
pub fn encode_base64(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

#[doc(hidden)]
pub fn decode_base64(s: &str) -> Result<Vec<u8>, IdError> {
    URL_SAFE_NO_PAD
        .decode(s.trim_end_matches('='))
        .map_err(|e| IdError::InvalidBase64(e.to_string()))
}

#[doc(hidden)]
pub fn short_hex(bytes: &[u8]) -> String {
    hex::encode(&bytes[..bytes.len().min(6)])
}

// =============================================================================
// Node Numbers
// =============================================================================

/// Integer identity of a UBot within the network configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeNumber(u32);

impl NodeNumber {
    /// Creates a node number.
    #[must_use]
    pub const fn new(number: u32) -> Self {
        Self(number)
    }

    /// Returns the underlying value.
    #[must_use]
    pub const fn value(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for NodeNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for NodeNumber {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }
        s.parse::<u32>()
            .map(Self)
            .map_err(|_| IdError::InvalidNodeNumber(s.to_string()))
    }
}

impl From<u32> for NodeNumber {
    fn from(number: u32) -> Self {
        Self(number)
    }
}

impl From<NodeNumber> for u32 {
    fn from(number: NodeNumber) -> Self {
        number.0
    }
}

impl serde::Serialize for NodeNumber {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u32(self.0)
    }
}

impl<'de> serde::Deserialize<'de> for NodeNumber {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let number = u32::deserialize(deserializer)?;
        Ok(Self(number))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_pool_id_roundtrip() {
        let id = PoolId::of(b"starting contract");
        let s = id.to_string();
        let parsed: PoolId = s.parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_pool_id_is_url_safe() {
        for i in 0..64u8 {
            let s = PoolId::of(&[i; 7]).to_string();
            assert!(!s.contains('/') && !s.contains('+') && !s.contains('='));
        }
    }

    #[test]
    fn test_hash_id_matches_content() {
        let id = ResultHash::of(b"42");
        assert!(id.matches(b"42"));
        assert!(!id.matches(b"43"));
    }

    #[test]
    fn test_hash_id_empty() {
        let result: Result<PoolId, _> = "".parse();
        assert!(matches!(result.unwrap_err(), IdError::Empty));
    }

    #[test]
    fn test_hash_id_invalid_base64() {
        let result: Result<PoolId, _> = "not base64 !!".parse();
        assert!(matches!(result.unwrap_err(), IdError::InvalidBase64(_)));
    }

    #[test]
    fn test_hash_id_wrong_length() {
        let short = encode_base64(&[1, 2, 3]);
        let result: Result<ContractId, _> = short.parse();
        assert_eq!(
            result.unwrap_err(),
            IdError::InvalidLength {
                expected: 32,
                actual: 3
            }
        );
    }

    #[test]
    fn test_hash_id_accepts_padded_input() {
        let id = PoolId::of(b"padded");
        let padded = format!("{id}=");
        assert_eq!(padded.parse::<PoolId>().unwrap(), id);
    }

    #[test]
    fn test_hash_id_json_roundtrip() {
        let id = SessionHash::of(b"session");
        let json = serde_json::to_string(&id).unwrap();
        let parsed: SessionHash = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_session_hash_from_pool_id() {
        let pool_id = PoolId::of(b"pool");
        let session = SessionHash::from(pool_id);
        assert_eq!(session.as_bytes(), pool_id.as_bytes());
    }

    #[test]
    fn test_node_number_parse() {
        assert_eq!("17".parse::<NodeNumber>().unwrap(), NodeNumber::new(17));
        assert!(matches!(
            "x".parse::<NodeNumber>().unwrap_err(),
            IdError::InvalidNodeNumber(_)
        ));
    }

    proptest! {
        #[test]
        fn prop_hash_id_text_roundtrip(bytes in proptest::array::uniform32(any::<u8>())) {
            let id = ResultHash::from_bytes(bytes);
            let parsed: ResultHash = id.to_string().parse().unwrap();
            prop_assert_eq!(id, parsed);
        }
    }
}

//! Identifier and contact types
//!
//! 160-bit identifiers compared under the XOR metric. Application keys are
//! hashed with SHA-1 so stored values share the identifier address space.

use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

use rand::rngs::OsRng;
use rand::RngCore;
use serde::de;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::{Digest, Sha1};

use crate::error::WireError;

/// Identifier width in bytes (160 bits)
pub const ID_LEN: usize = 20;

/// Identifier width in bits; also the number of routing-table buckets
pub const ID_BITS: usize = ID_LEN * 8;

/// 160-bit node identifier, rendered as 40 lowercase hex chars on the wire
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; ID_LEN]);

impl NodeId {
    pub fn new(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Generate a uniformly random identifier
    pub fn random() -> Self {
        let mut bytes = [0u8; ID_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Parse from exactly 40 hex characters
    pub fn from_hex(s: &str) -> Result<Self, WireError> {
        let bytes = hex::decode(s).map_err(|_| WireError::InvalidNodeId)?;
        let bytes: [u8; ID_LEN] = bytes.try_into().map_err(|_| WireError::InvalidNodeId)?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// XOR distance to another identifier
    pub fn distance(&self, other: &NodeId) -> Distance {
        let mut out = [0u8; ID_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        Distance(out)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.to_hex())
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        NodeId::from_hex(&s).map_err(de::Error::custom)
    }
}

/// XOR distance between two identifiers, compared as a big-endian unsigned
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Distance([u8; ID_LEN]);

impl Distance {
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Bucket index: position of the most significant set bit, counting
    /// bit 0 as the MSB. The zero distance maps to the last bucket, which
    /// is reserved for the node itself.
    pub fn bucket_index(&self) -> usize {
        for (byte_idx, byte) in self.0.iter().enumerate() {
            if *byte != 0 {
                return byte_idx * 8 + byte.leading_zeros() as usize;
            }
        }
        ID_BITS - 1
    }
}

impl fmt::Debug for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Distance({})", hex::encode(self.0))
    }
}

/// Hash an application key into the 160-bit identifier space
pub fn key_hash(key: &str) -> NodeId {
    let digest = Sha1::digest(key.as_bytes());
    NodeId(digest.into())
}

/// A peer known to the routing table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    pub id: NodeId,
    /// Datagram endpoint the peer answers routing frames on
    pub addr: SocketAddr,
    pub last_seen: Instant,
}

impl Contact {
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            last_seen: Instant::now(),
        }
    }
}

/// One relay position of an onion circuit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hop {
    pub id: NodeId,
    /// X25519 encryption key the relay published
    pub public_key: [u8; 32],
    /// Stream endpoint the relay accepts envelopes on
    pub addr: SocketAddr,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id_from(hex40: &str) -> NodeId {
        NodeId::from_hex(hex40).unwrap()
    }

    #[test]
    fn test_hex_roundtrip() {
        let id = NodeId::random();
        let restored = NodeId::from_hex(&id.to_hex()).unwrap();
        assert_eq!(id, restored);
        assert_eq!(id.to_hex().len(), 40);
    }

    #[test]
    fn test_from_hex_rejects_bad_input() {
        assert!(NodeId::from_hex("abcd").is_err());
        assert!(NodeId::from_hex(&"zz".repeat(20)).is_err());
        assert!(NodeId::from_hex(&"00".repeat(21)).is_err());
    }

    #[test]
    fn test_distance_is_symmetric_and_zero_on_equal() {
        let a = NodeId::random();
        let b = NodeId::random();
        assert_eq!(a.distance(&b), b.distance(&a));
        assert!(a.distance(&a).is_zero());
        assert!(!a.distance(&b).is_zero());
    }

    #[test]
    fn test_bucket_index_msb() {
        let zero = id_from(&"00".repeat(20));
        let top = id_from(&format!("80{}", "00".repeat(19)));
        assert_eq!(zero.distance(&top).bucket_index(), 0);
    }

    #[test]
    fn test_bucket_index_lsb() {
        let zero = id_from(&"00".repeat(20));
        let bottom = id_from(&format!("{}01", "00".repeat(19)));
        assert_eq!(zero.distance(&bottom).bucket_index(), 159);
    }

    #[test]
    fn test_bucket_index_zero_distance_is_self_bucket() {
        let id = NodeId::random();
        assert_eq!(id.distance(&id).bucket_index(), ID_BITS - 1);
    }

    #[test]
    fn test_distance_ordering_big_endian() {
        let zero = id_from(&"00".repeat(20));
        let near = id_from(&format!("{}01", "00".repeat(19)));
        let far = id_from(&format!("01{}", "00".repeat(19)));
        assert!(zero.distance(&near) < zero.distance(&far));
    }

    #[test]
    fn test_key_hash_known_vector() {
        // SHA-1("abc")
        assert_eq!(
            key_hash("abc").to_hex(),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
    }

    #[test]
    fn test_serde_hex_string() {
        let id = id_from(&"ab".repeat(20));
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", "ab".repeat(20)));
        let back: NodeId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}

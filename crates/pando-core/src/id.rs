//! DHT identifier types.
//!
//! Defines the 160-bit identifiers used by the overlay:
//! - `NodeId` - a peer's identity, chosen uniformly at random at first start
//! - `Key` - the hash of a textual key form, locating a value in the keyspace
//!
//! Distance between two identifiers is their bitwise XOR interpreted as an
//! unsigned integer.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};

use crate::ID_LEN;

/// Macro to define a 160-bit identifier type with common implementations.
macro_rules! define_id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        pub struct $name(pub [u8; ID_LEN]);

        impl $name {
            /// Creates a new identifier from a 20-byte array.
            pub const fn new(bytes: [u8; ID_LEN]) -> Self {
                Self(bytes)
            }

            /// Returns the inner bytes.
            pub const fn as_bytes(&self) -> &[u8; ID_LEN] {
                &self.0
            }

            /// Parses from a 40-character lowercase hex string.
            pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
                let bytes = hex::decode(s)?;
                if bytes.len() != ID_LEN {
                    return Err(hex::FromHexError::InvalidStringLength);
                }
                let mut arr = [0u8; ID_LEN];
                arr.copy_from_slice(&bytes);
                Ok(Self(arr))
            }

            /// Returns the lowercase hex form.
            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            /// Computes the XOR distance to another identifier.
            pub fn distance(&self, other: &[u8; ID_LEN]) -> [u8; ID_LEN] {
                let mut result = [0u8; ID_LEN];
                for i in 0..ID_LEN {
                    result[i] = self.0[i] ^ other[i];
                }
                result
            }

            /// Returns the number of leading zero bits.
            pub fn leading_zeros(&self) -> u32 {
                let mut zeros = 0u32;
                for byte in &self.0 {
                    if *byte == 0 {
                        zeros += 8;
                    } else {
                        zeros += byte.leading_zeros();
                        break;
                    }
                }
                zeros
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), &self.to_hex()[..12])
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", &self.to_hex()[..12])
            }
        }

        impl From<[u8; ID_LEN]> for $name {
            fn from(bytes: [u8; ID_LEN]) -> Self {
                Self(bytes)
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                Self::from_hex(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}

define_id_type!(
    /// A peer's identity in the overlay keyspace.
    ///
    /// Chosen uniformly at random when a node first starts and persisted
    /// thereafter.
    NodeId
);

define_id_type!(
    /// A value's location in the overlay keyspace.
    ///
    /// Derived by hashing the textual key form into 160 bits.
    Key
);

impl NodeId {
    /// Generates a random node id.
    pub fn random() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; ID_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// XOR distance to a key.
    pub fn distance_to_key(&self, key: &Key) -> [u8; ID_LEN] {
        self.distance(&key.0)
    }
}

impl Key {
    /// Derives a key from its textual form.
    ///
    /// The first 160 bits of SHA-256 over the UTF-8 bytes of the text.
    pub fn for_text(text: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        let full: [u8; 32] = hasher.finalize().into();
        let mut arr = [0u8; ID_LEN];
        arr.copy_from_slice(&full[..ID_LEN]);
        Self(arr)
    }

    /// Reinterprets the key as a point in the node keyspace.
    pub fn as_node_id(&self) -> NodeId {
        NodeId(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_symmetry() {
        let a = NodeId::random();
        let b = NodeId::random();
        assert_eq!(a.distance(&b.0), b.distance(&a.0));
        assert_eq!(a.distance(&a.0), [0u8; ID_LEN]);
    }

    #[test]
    fn test_leading_zeros() {
        let zero = NodeId::new([0x00; ID_LEN]);
        assert_eq!(zero.leading_zeros(), 160);

        let mut bytes = [0x00; ID_LEN];
        bytes[0] = 0x80;
        assert_eq!(NodeId::new(bytes).leading_zeros(), 0);

        bytes[0] = 0x01;
        assert_eq!(NodeId::new(bytes).leading_zeros(), 7);

        bytes = [0x00; ID_LEN];
        bytes[19] = 0x01;
        assert_eq!(NodeId::new(bytes).leading_zeros(), 159);
    }

    #[test]
    fn test_key_for_text_deterministic() {
        let a = Key::for_text("chunk:abc123");
        let b = Key::for_text("chunk:abc123");
        let c = Key::for_text("chunk:abc124");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_hex_roundtrip() {
        let id = NodeId::random();
        let parsed = NodeId::from_hex(&id.to_hex()).unwrap();
        assert_eq!(id, parsed);
        assert_eq!(id.to_hex().len(), 40);
    }

    #[test]
    fn test_json_form() {
        let id = NodeId::random();
        let json = serde_json::to_string(&id).unwrap();
        let back: NodeId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn test_distance_ordering() {
        // Distances compare as big-endian unsigned integers, which is the
        // lexicographic order of the byte arrays.
        let target = NodeId::new([0x00; ID_LEN]);
        let mut near = [0x00; ID_LEN];
        near[19] = 0x01;
        let mut far = [0x00; ID_LEN];
        far[0] = 0x01;
        assert!(target.distance(&near) < target.distance(&far));
    }
}

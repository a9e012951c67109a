// 256-bit node identifier with XOR distance
//
// Byte 0 is the most significant; ordering is lexicographic on the raw
// bytes. Bucket indices come from the highest set bit of the XOR distance.

use rand::RngCore;
use sha2::{Digest, Sha256};

pub const NODE_ID_LEN: usize = 32;

/// Opaque 256-bit identifier for nodes and DHT keys.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct NodeId([u8; NODE_ID_LEN]);

impl NodeId {
    pub fn from_bytes(bytes: [u8; NODE_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Key derivation for string keys (usernames): SHA-256 of the UTF-8 bytes.
    pub fn from_string(value: &str) -> Self {
        Self(Sha256::digest(value.as_bytes()).into())
    }

    /// Node ids are the SHA-256 hash of the node's encryption public key.
    pub fn from_public_key(public_key: &[u8]) -> Self {
        Self(Sha256::digest(public_key).into())
    }

    pub fn random() -> Self {
        let mut bytes = [0u8; NODE_ID_LEN];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    /// XOR distance to another id.
    pub fn distance_to(&self, other: &NodeId) -> Distance {
        let mut out = [0u8; NODE_ID_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        Distance(out)
    }

    /// Index of the k-bucket `other` falls into relative to `self`:
    /// the position of the highest set bit of the distance. `None` when the
    /// ids are equal.
    pub fn bucket_index(&self, other: &NodeId) -> Option<usize> {
        self.distance_to(other).highest_bit_index()
    }

    /// Bit at `position`, where position 0 is the least significant bit.
    pub fn get_bit(&self, position: usize) -> bool {
        debug_assert!(position < NODE_ID_LEN * 8);
        let byte = self.0[NODE_ID_LEN - 1 - position / 8];
        (byte >> (position % 8)) & 1 == 1
    }
}

// XOR-fold the id into 32 bits so adversarially chosen ids cannot force
// predictable hash-table collisions through the default byte-slice hasher.
impl std::hash::Hash for NodeId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        let mut folded = [0u8; 4];
        for (i, byte) in self.0.iter().enumerate() {
            folded[i % 4] ^= byte;
        }
        state.write_u32(u32::from_le_bytes(folded));
    }
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeId({}…)", hex::encode(&self.0[..4]))
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// XOR distance between two ids. Orders lexicographically, which is the
/// numeric order of the underlying 256-bit value.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Distance([u8; NODE_ID_LEN]);

impl Distance {
    pub const ZERO: Distance = Distance([0u8; NODE_ID_LEN]);

    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    /// Position of the highest set bit (255 = bit 7 of byte 0), or `None`
    /// for a zero distance.
    pub fn highest_bit_index(&self) -> Option<usize> {
        for (i, byte) in self.0.iter().enumerate() {
            if *byte != 0 {
                let bit_in_byte = 7 - byte.leading_zeros() as usize;
                return Some((NODE_ID_LEN - 1 - i) * 8 + bit_in_byte);
            }
        }
        None
    }
}

impl std::fmt::Debug for Distance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Distance({}…)", hex::encode(&self.0[..4]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn id_with_low_byte(value: u8) -> NodeId {
        let mut bytes = [0u8; NODE_ID_LEN];
        bytes[NODE_ID_LEN - 1] = value;
        NodeId::from_bytes(bytes)
    }

    #[test]
    fn distance_to_self_is_zero() {
        let id = NodeId::random();
        assert_eq!(id.distance_to(&id), Distance::ZERO);
        assert_eq!(id.bucket_index(&id), None);
    }

    #[test]
    fn bucket_index_of_low_bit() {
        let zero = NodeId::from_bytes([0u8; NODE_ID_LEN]);
        assert_eq!(zero.bucket_index(&id_with_low_byte(1)), Some(0));
        assert_eq!(zero.bucket_index(&id_with_low_byte(2)), Some(1));
        assert_eq!(zero.bucket_index(&id_with_low_byte(0x80)), Some(7));
    }

    #[test]
    fn bucket_index_of_high_bit() {
        let zero = NodeId::from_bytes([0u8; NODE_ID_LEN]);
        let mut bytes = [0u8; NODE_ID_LEN];
        bytes[0] = 0x80;
        assert_eq!(zero.bucket_index(&NodeId::from_bytes(bytes)), Some(255));
    }

    #[test]
    fn get_bit_matches_bucket_index() {
        let zero = NodeId::from_bytes([0u8; NODE_ID_LEN]);
        let id = id_with_low_byte(0b0000_0100);
        assert!(id.get_bit(2));
        assert!(!id.get_bit(1));
        assert_eq!(zero.bucket_index(&id), Some(2));
    }

    #[test]
    fn string_keys_are_stable() {
        assert_eq!(NodeId::from_string("alice"), NodeId::from_string("alice"));
        assert_ne!(NodeId::from_string("alice"), NodeId::from_string("bob"));
    }

    #[test]
    fn ordering_is_lexicographic() {
        let small = id_with_low_byte(1);
        let big = id_with_low_byte(2);
        assert!(small < big);
    }

    proptest! {
        #[test]
        fn distance_is_symmetric(a in any::<[u8; 32]>(), b in any::<[u8; 32]>()) {
            let a = NodeId::from_bytes(a);
            let b = NodeId::from_bytes(b);
            prop_assert_eq!(a.distance_to(&b), b.distance_to(&a));
        }

        #[test]
        fn distance_to_self_is_always_zero(a in any::<[u8; 32]>()) {
            let a = NodeId::from_bytes(a);
            prop_assert_eq!(a.distance_to(&a), Distance::ZERO);
        }

        #[test]
        fn unequal_ids_have_nonzero_distance(a in any::<[u8; 32]>(), b in any::<[u8; 32]>()) {
            prop_assume!(a != b);
            let a = NodeId::from_bytes(a);
            let b = NodeId::from_bytes(b);
            prop_assert!(a.distance_to(&b) > Distance::ZERO);
            prop_assert!(a.bucket_index(&b).is_some());
        }
    }
}

//! 256-bit overlay identifiers with the XOR distance metric.

use rand::RngCore;
use serde::de::Visitor;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;

pub const ID_BYTES: usize = 32;
pub const ID_BITS: usize = 256;

/// A point in the overlay keyspace. Node ids are the raw bytes of the
/// node's Ed25519 public key; value ids are SHA-256 digests.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Id([u8; ID_BYTES]);

impl Id {
    pub const MIN: Id = Id([0u8; ID_BYTES]);
    pub const MAX: Id = Id([0xffu8; ID_BYTES]);

    pub fn from_bytes(bytes: [u8; ID_BYTES]) -> Self {
        Id(bytes)
    }

    pub fn try_from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != ID_BYTES {
            return None;
        }
        let mut b = [0u8; ID_BYTES];
        b.copy_from_slice(bytes);
        Some(Id(b))
    }

    pub fn as_bytes(&self) -> &[u8; ID_BYTES] {
        &self.0
    }

    pub fn random() -> Self {
        let mut b = [0u8; ID_BYTES];
        rand::rngs::OsRng.fill_bytes(&mut b);
        Id(b)
    }

    /// Bitwise XOR distance to `other`.
    pub fn distance(&self, other: &Id) -> Id {
        let mut d = [0u8; ID_BYTES];
        for (i, b) in d.iter_mut().enumerate() {
            *b = self.0[i] ^ other.0[i];
        }
        Id(d)
    }

    /// Number of leading zero bits; 256 for the zero id.
    pub fn leading_zeros(&self) -> usize {
        for (i, b) in self.0.iter().enumerate() {
            if *b != 0 {
                return i * 8 + b.leading_zeros() as usize;
            }
        }
        ID_BITS
    }

    /// Bit at position `i`, counting from the most significant bit.
    pub fn bit(&self, i: usize) -> bool {
        debug_assert!(i < ID_BITS);
        self.0[i / 8] & (0x80 >> (i % 8)) != 0
    }

    pub(crate) fn with_bit(&self, i: usize, set: bool) -> Id {
        debug_assert!(i < ID_BITS);
        let mut b = self.0;
        if set {
            b[i / 8] |= 0x80 >> (i % 8);
        } else {
            b[i / 8] &= !(0x80 >> (i % 8));
        }
        Id(b)
    }

    /// Keep the first `n` bits, zeroing the rest.
    pub(crate) fn keep_bits(&self, n: usize) -> Id {
        let mut b = [0u8; ID_BYTES];
        if n == 0 {
            return Id(b);
        }
        let full = n / 8;
        b[..full].copy_from_slice(&self.0[..full]);
        if full < ID_BYTES && n % 8 != 0 {
            let mask = !(0xffu8 >> (n % 8));
            b[full] = self.0[full] & mask;
        }
        Id(b)
    }

    /// Order `a` and `b` by distance to `self`: `Less` when `a` is closer.
    ///
    /// Equivalent to comparing full XOR distances but without materializing
    /// them.
    pub fn three_way_compare(&self, a: &Id, b: &Id) -> Ordering {
        for i in 0..ID_BYTES {
            let da = self.0[i] ^ a.0[i];
            let db = self.0[i] ^ b.0[i];
            match da.cmp(&db) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }
        Ordering::Equal
    }

    pub fn to_base58(&self) -> String {
        bs58::encode(&self.0).into_string()
    }

    pub fn from_base58(s: &str) -> Option<Self> {
        let bytes = bs58::decode(s).into_vec().ok()?;
        Self::try_from_slice(&bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base58())
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({}..)", &self.to_hex()[..8])
    }
}

impl From<[u8; ID_BYTES]> for Id {
    fn from(b: [u8; ID_BYTES]) -> Self {
        Id(b)
    }
}

// CBOR byte string, exactly 32 bytes.
impl Serialize for Id {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct IdVisitor;

        impl<'de> Visitor<'de> for IdVisitor {
            type Value = Id;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "a 32-byte string")
            }

            fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
                Id::try_from_slice(v)
                    .ok_or_else(|| serde::de::Error::invalid_length(v.len(), &self))
            }

            fn visit_byte_buf<E: serde::de::Error>(self, v: Vec<u8>) -> Result<Self::Value, E> {
                self.visit_bytes(&v)
            }

            fn visit_seq<A: serde::de::SeqAccess<'de>>(
                self,
                mut seq: A,
            ) -> Result<Self::Value, A::Error> {
                let mut b = [0u8; ID_BYTES];
                for (i, slot) in b.iter_mut().enumerate() {
                    *slot = seq
                        .next_element()?
                        .ok_or_else(|| serde::de::Error::invalid_length(i, &self))?;
                }
                if seq.next_element::<u8>()?.is_some() {
                    return Err(serde::de::Error::invalid_length(ID_BYTES + 1, &self));
                }
                Ok(Id(b))
            }
        }

        deserializer.deserialize_bytes(IdVisitor)
    }
}

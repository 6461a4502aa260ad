//! Keyspace prefixes for the routing-table trie.

use crate::id::{Id, ID_BITS, ID_BYTES};
use rand::RngCore;
use std::fmt;

/// A prefix of the 256-bit keyspace: the first `depth` bits of `bits` are
/// significant, the rest are zero. Depth 0 covers the whole space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Prefix {
    bits: Id,
    depth: usize,
}

impl Prefix {
    /// The whole keyspace.
    pub fn whole() -> Self {
        Self {
            bits: Id::MIN,
            depth: 0,
        }
    }

    pub fn new(bits: Id, depth: usize) -> Self {
        debug_assert!(depth <= ID_BITS);
        Self {
            bits: bits.keep_bits(depth),
            depth,
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn is_prefix_of(&self, id: &Id) -> bool {
        id.keep_bits(self.depth) == self.bits
    }

    /// One level up. The whole-space prefix is its own parent.
    pub fn parent(&self) -> Prefix {
        if self.depth == 0 {
            return *self;
        }
        Prefix::new(self.bits, self.depth - 1)
    }

    /// Extend by one bit, choosing the high or low branch.
    pub fn split_branch(&self, high: bool) -> Prefix {
        debug_assert!(self.depth < ID_BITS);
        Prefix {
            bits: self.bits.with_bit(self.depth, high),
            depth: self.depth + 1,
        }
    }

    /// Siblings share the parent and differ in the last bit only.
    pub fn is_sibling_of(&self, other: &Prefix) -> bool {
        if self.depth != other.depth || self.depth == 0 {
            return false;
        }
        let flipped = self
            .bits
            .with_bit(self.depth - 1, !self.bits.bit(self.depth - 1));
        flipped == other.bits
    }

    /// A bucket prefix can split while a child prefix remains shorter than
    /// a full id.
    pub fn is_splittable(&self) -> bool {
        self.depth < ID_BITS - 1
    }

    pub fn first_id(&self) -> Id {
        self.bits
    }

    pub fn last_id(&self) -> Id {
        let mut bytes = *self.bits.as_bytes();
        let full = self.depth / 8;
        if full < ID_BYTES {
            bytes[full] |= 0xffu8
                .checked_shr((self.depth % 8) as u32)
                .unwrap_or(0);
            for b in bytes.iter_mut().skip(full + 1) {
                *b = 0xff;
            }
        }
        Id::from_bytes(bytes)
    }

    /// A uniformly random id under this prefix.
    pub fn random_id(&self) -> Id {
        let mut bytes = [0u8; ID_BYTES];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        let random = Id::from_bytes(bytes);
        let mut out = *self.bits.as_bytes();
        let tail = random.as_bytes();
        let full = self.depth / 8;
        if full < ID_BYTES {
            let mask = 0xffu8.checked_shr((self.depth % 8) as u32).unwrap_or(0);
            out[full] |= tail[full] & mask;
            for i in full + 1..ID_BYTES {
                out[i] = tail[i];
            }
        }
        Id::from_bytes(out)
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.depth == 0 {
            return f.write_str("*/0");
        }
        let nibbles = self.depth.div_ceil(4);
        write!(f, "{}/{}", &self.bits.to_hex()[..nibbles], self.depth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whole_space_covers_everything() {
        let whole = Prefix::whole();
        for _ in 0..16 {
            assert!(whole.is_prefix_of(&Id::random()));
        }
        assert_eq!(whole.first_id(), Id::MIN);
        assert_eq!(whole.last_id(), Id::MAX);
    }

    #[test]
    fn split_partitions_the_space() {
        let whole = Prefix::whole();
        let low = whole.split_branch(false);
        let high = whole.split_branch(true);

        assert_eq!(low.depth(), 1);
        assert!(low.is_sibling_of(&high));
        assert!(high.is_sibling_of(&low));
        assert_eq!(low.parent(), whole);
        assert_eq!(high.parent(), whole);

        for _ in 0..32 {
            let id = Id::random();
            assert!(low.is_prefix_of(&id) != high.is_prefix_of(&id));
        }
    }

    #[test]
    fn bounds_are_tight() {
        let p = Prefix::whole().split_branch(true).split_branch(false);
        // prefix 10…
        assert_eq!(p.first_id().as_bytes()[0], 0b1000_0000);
        assert_eq!(p.last_id().as_bytes()[0], 0b1011_1111);
        assert_eq!(p.last_id().as_bytes()[31], 0xff);
    }

    #[test]
    fn random_id_stays_inside() {
        let mut p = Prefix::whole();
        for i in 0..19 {
            p = p.split_branch(i % 3 == 0);
        }
        for _ in 0..64 {
            assert!(p.is_prefix_of(&p.random_id()));
        }
    }

    #[test]
    fn siblings_require_same_depth() {
        let a = Prefix::whole().split_branch(false);
        let b = Prefix::whole().split_branch(true).split_branch(false);
        assert!(!a.is_sibling_of(&b));
        assert!(!Prefix::whole().is_sibling_of(&Prefix::whole()));
    }

    #[test]
    fn splittable_until_one_short_of_full_depth() {
        let mut p = Prefix::whole();
        for _ in 0..ID_BITS - 1 {
            assert!(p.is_splittable());
            p = p.split_branch(false);
        }
        assert!(!p.is_splittable());
    }
}

//! Core overlay types and wall-clock helpers.

use crate::id::Id;
use serde::de::{SeqAccess, Visitor};
use serde::ser::SerializeTuple;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{SystemTime, UNIX_EPOCH};

/// Current unix time in seconds.
pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Current unix time in milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Protocol version word: two ascii name bytes plus a 16-bit revision.
pub mod version {
    pub const NAME: [u8; 2] = *b"MR";
    pub const REVISION: u16 = 1;

    pub fn build() -> u32 {
        u32::from_be_bytes([NAME[0], NAME[1], (REVISION >> 8) as u8, REVISION as u8])
    }

    /// Human-readable form, e.g. `MR/1`. Unknown encodings print as hex.
    pub fn readable(v: u32) -> String {
        if v == 0 {
            return "unknown".to_string();
        }
        let b = v.to_be_bytes();
        if b[0].is_ascii_alphanumeric() && b[1].is_ascii_alphanumeric() {
            format!(
                "{}{}/{}",
                b[0] as char,
                b[1] as char,
                u16::from_be_bytes([b[2], b[3]])
            )
        } else {
            format!("0x{:08x}", v)
        }
    }
}

/// How a lookup forks across address families and when it completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LookupOption {
    /// Local storage only, no network traffic.
    Local,
    /// First family to succeed wins.
    Arbitrary,
    /// First non-empty result wins; lookups may early-terminate on a match.
    Optimistic,
    /// All active families run to full termination and results are merged.
    Conservative,
}

impl Default for LookupOption {
    fn default() -> Self {
        LookupOption::Conservative
    }
}

/// A known overlay node: id plus reachable UDP address.
///
/// Equality covers id and address. `version` is gossip metadata and
/// deliberately excluded from comparisons.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub id: Id,
    pub addr: SocketAddr,
    pub version: Option<u32>,
}

impl NodeInfo {
    pub fn new(id: Id, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            version: None,
        }
    }

    pub fn with_version(id: Id, addr: SocketAddr, version: u32) -> Self {
        Self {
            id,
            addr,
            version: Some(version),
        }
    }

    pub fn is_ipv4(&self) -> bool {
        self.addr.is_ipv4()
    }

    pub fn is_ipv6(&self) -> bool {
        self.addr.is_ipv6()
    }

    /// Two infos refer to the same peer if either the id or the address
    /// coincide. Used for conflict detection, not equality.
    pub fn matches(&self, other: &NodeInfo) -> bool {
        self.id == other.id || self.addr == other.addr
    }
}

impl PartialEq for NodeInfo {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.addr == other.addr
    }
}

impl Eq for NodeInfo {}

impl fmt::Display for NodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.addr)
    }
}

// Wire form is a 3-tuple (id, ip bytes, port): compact, order-fixed, and
// identical between datagrams and cache files.
impl Serialize for NodeInfo {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut t = serializer.serialize_tuple(3)?;
        t.serialize_element(&self.id)?;
        let ip_bytes: Vec<u8> = match self.addr.ip() {
            IpAddr::V4(ip) => ip.octets().to_vec(),
            IpAddr::V6(ip) => ip.octets().to_vec(),
        };
        t.serialize_element(&WireBytes(&ip_bytes))?;
        t.serialize_element(&self.addr.port())?;
        t.end()
    }
}

impl<'de> Deserialize<'de> for NodeInfo {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct NodeInfoVisitor;

        impl<'de> Visitor<'de> for NodeInfoVisitor {
            type Value = NodeInfo;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "a (id, ip, port) tuple")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let id: Id = seq
                    .next_element()?
                    .ok_or_else(|| serde::de::Error::invalid_length(0, &self))?;
                let ip: ByteBuf = seq
                    .next_element()?
                    .ok_or_else(|| serde::de::Error::invalid_length(1, &self))?;
                let port: u16 = seq
                    .next_element()?
                    .ok_or_else(|| serde::de::Error::invalid_length(2, &self))?;
                let ip = match ip.0.len() {
                    4 => {
                        let mut b = [0u8; 4];
                        b.copy_from_slice(&ip.0);
                        IpAddr::V4(Ipv4Addr::from(b))
                    }
                    16 => {
                        let mut b = [0u8; 16];
                        b.copy_from_slice(&ip.0);
                        IpAddr::V6(Ipv6Addr::from(b))
                    }
                    n => {
                        return Err(serde::de::Error::invalid_length(
                            n,
                            &"4 or 16 address bytes",
                        ))
                    }
                };
                Ok(NodeInfo::new(id, SocketAddr::new(ip, port)))
            }
        }

        deserializer.deserialize_tuple(3, NodeInfoVisitor)
    }
}

/// Check if an address is globally routable.
///
/// Filters private networks, loopback, link-local, documentation ranges,
/// multicast and unspecified addresses before routing-table admission.
/// Developer mode bypasses this so loopback overlays can form.
pub fn is_routable(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ip) => {
            !ip.is_private()
                && !ip.is_loopback()
                && !ip.is_link_local()
                && !ip.is_broadcast()
                && !ip.is_documentation()
                && !ip.is_unspecified()
                && !ip.is_multicast()
        }
        IpAddr::V6(ip) => {
            if ip.is_loopback() || ip.is_unspecified() || ip.is_multicast() {
                return false;
            }

            let segments = ip.segments();

            // fc00::/7 unique local
            if (segments[0] & 0xfe00) == 0xfc00 {
                return false;
            }

            // fe80::/10 link-local
            if (segments[0] & 0xffc0) == 0xfe80 {
                return false;
            }

            // 2001:db8::/32 documentation
            if segments[0] == 0x2001 && segments[1] == 0x0db8 {
                return false;
            }

            // ::ffff:0:0/96 IPv4-mapped, check the embedded address
            if segments[..5] == [0, 0, 0, 0, 0] && segments[5] == 0xffff {
                let v4 = Ipv4Addr::new(
                    (segments[6] >> 8) as u8,
                    segments[6] as u8,
                    (segments[7] >> 8) as u8,
                    segments[7] as u8,
                );
                return is_routable(&IpAddr::V4(v4));
            }

            true
        }
    }
}

// =============================================================================
// BYTE-STRING SERDE HELPERS
// =============================================================================
// serde turns Vec<u8> into an integer array by default; the wire wants CBOR
// byte strings. These wrappers and `with`-modules force the byte form.

pub(crate) struct WireBytes<'a>(pub &'a [u8]);

impl Serialize for WireBytes<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(self.0)
    }
}

pub(crate) struct ByteBuf(pub Vec<u8>);

impl<'de> Deserialize<'de> for ByteBuf {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct BytesVisitor;

        impl<'de> Visitor<'de> for BytesVisitor {
            type Value = ByteBuf;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "a byte string")
            }

            fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
                Ok(ByteBuf(v.to_vec()))
            }

            fn visit_byte_buf<E: serde::de::Error>(self, v: Vec<u8>) -> Result<Self::Value, E> {
                Ok(ByteBuf(v))
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let mut v = Vec::with_capacity(seq.size_hint().unwrap_or(0).min(64));
                while let Some(b) = seq.next_element::<u8>()? {
                    v.push(b);
                }
                Ok(ByteBuf(v))
            }
        }

        deserializer.deserialize_bytes(BytesVisitor)
    }
}

/// `#[serde(with = "bytes_serde")]` for `Vec<u8>` fields.
pub(crate) mod bytes_serde {
    use super::{ByteBuf, WireBytes};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(v: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error> {
        WireBytes(v).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        Ok(ByteBuf::deserialize(deserializer)?.0)
    }
}

/// `#[serde(with = "opt_bytes_serde")]` for `Option<Vec<u8>>` fields.
pub(crate) mod opt_bytes_serde {
    use super::{ByteBuf, WireBytes};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        v: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match v {
            Some(b) => serializer.serialize_some(&WireBytes(b)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        Ok(Option::<ByteBuf>::deserialize(deserializer)?.map(|b| b.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_word_is_readable() {
        let v = version::build();
        assert_eq!(version::readable(v), "MR/1");
        assert_eq!(version::readable(0), "unknown");
    }

    #[test]
    fn node_info_matches_on_either_key() {
        let a = NodeInfo::new(Id::random(), "1.2.3.4:1234".parse().unwrap());
        let mut b = NodeInfo::new(Id::random(), "1.2.3.4:1234".parse().unwrap());
        assert!(a.matches(&b));
        assert_ne!(a, b);

        b.addr = "5.6.7.8:9".parse().unwrap();
        assert!(!a.matches(&b));

        b.id = a.id;
        assert!(a.matches(&b));
    }

    #[test]
    fn node_info_cbor_round_trip() {
        for addr in ["9.8.7.6:42", "[2001:4860::8888]:4242"] {
            let info = NodeInfo::new(Id::random(), addr.parse().unwrap());
            let mut buf = Vec::new();
            ciborium::into_writer(&info, &mut buf).unwrap();
            let back: NodeInfo = ciborium::from_reader(buf.as_slice()).unwrap();
            assert_eq!(info, back);
        }
    }

    #[test]
    fn routability_filters_bogons() {
        assert!(!is_routable(&"127.0.0.1".parse().unwrap()));
        assert!(!is_routable(&"10.1.2.3".parse().unwrap()));
        assert!(!is_routable(&"192.168.0.1".parse().unwrap()));
        assert!(!is_routable(&"169.254.1.1".parse().unwrap()));
        assert!(is_routable(&"8.8.8.8".parse().unwrap()));

        assert!(!is_routable(&"::1".parse().unwrap()));
        assert!(!is_routable(&"fe80::1".parse().unwrap()));
        assert!(!is_routable(&"fc00::1".parse().unwrap()));
        assert!(!is_routable(&"::ffff:192.168.0.1".parse().unwrap()));
        assert!(is_routable(&"2001:4860::8888".parse().unwrap()));
    }
}

//! Application-level service peers.
//!
//! A service peer is an announcement that the key behind `peer_id` offers a
//! service reachable through `node_id` on `port`, optionally behind an
//! alternative URI. The record is signed by the peer key; a node may also
//! announce on behalf of another provider, in which case `origin` names the
//! delegating node.

use crate::crypto::{self, Identity, SIGNATURE_BYTES};
use crate::error::{Error, Result};
use crate::id::Id;
use serde::{Deserialize, Serialize};

pub const MAX_ALTERNATIVE_URI: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Public key of the service owner; the record's lookup id.
    #[serde(rename = "id")]
    pub peer_id: Id,
    /// The node providing the service.
    #[serde(rename = "nid")]
    pub node_id: Id,
    /// Delegating node, when the announcement is made on behalf of
    /// `node_id` by another node.
    #[serde(rename = "orig")]
    pub origin: Option<Id>,
    #[serde(rename = "p")]
    pub port: u16,
    #[serde(rename = "alt")]
    pub alternative_uri: Option<String>,
    #[serde(rename = "sig", with = "crate::types::bytes_serde")]
    pub signature: Vec<u8>,
}

impl PeerInfo {
    /// Sign a new announcement with the service owner's identity.
    pub fn new(
        peer_key: &Identity,
        node_id: Id,
        origin: Option<Id>,
        port: u16,
        alternative_uri: Option<String>,
    ) -> Result<Self> {
        if port == 0 {
            return Err(Error::InvalidArgument("peer port must be non-zero".into()));
        }
        if let Some(uri) = &alternative_uri {
            if uri.is_empty() || uri.len() > MAX_ALTERNATIVE_URI {
                return Err(Error::InvalidArgument(format!(
                    "alternative uri must be 1..={} bytes",
                    MAX_ALTERNATIVE_URI
                )));
            }
        }
        let mut peer = Self {
            peer_id: *peer_key.id(),
            node_id,
            origin,
            port,
            alternative_uri,
            signature: Vec::new(),
        };
        peer.signature = peer_key.sign(&peer.signing_data());
        Ok(peer)
    }

    fn signing_data(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(128);
        buf.extend_from_slice(self.peer_id.as_bytes());
        buf.extend_from_slice(self.node_id.as_bytes());
        if let Some(origin) = &self.origin {
            buf.extend_from_slice(origin.as_bytes());
        }
        buf.extend_from_slice(&self.port.to_le_bytes());
        if let Some(uri) = &self.alternative_uri {
            buf.extend_from_slice(uri.as_bytes());
        }
        buf
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(Error::Protocol("peer port must be non-zero".into()));
        }
        if let Some(uri) = &self.alternative_uri {
            if uri.is_empty() || uri.len() > MAX_ALTERNATIVE_URI {
                return Err(Error::Protocol("bad alternative uri length".into()));
            }
        }
        if self.signature.len() != SIGNATURE_BYTES {
            return Err(Error::InvalidSignature);
        }
        crypto::verify(&self.peer_id, &self.signing_data(), &self.signature)
    }

    /// Disambiguates multiple announcements under one `peer_id`. Computed
    /// locally over the signature; never on the wire.
    pub fn fingerprint(&self) -> u64 {
        let digest = crypto::sha256(&self.signature);
        u64::from_le_bytes([
            digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6],
            digest[7],
        ])
    }

    /// Key under which announcements replace each other.
    pub fn storage_key(&self) -> (Id, Id) {
        (self.peer_id, self.node_id)
    }

    /// Key under which lookup results are deduplicated.
    pub fn dedup_key(&self) -> (Id, Id, Option<Id>, u64) {
        (self.peer_id, self.node_id, self.origin, self.fingerprint())
    }
}

impl std::fmt::Display for PeerInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "peer[{} via {}:{}]", self.peer_id, self.node_id, self.port)
    }
}

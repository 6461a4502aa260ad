//! Immutable, mutable and encrypted values.
//!
//! An immutable value is addressed by the SHA-256 of its content. A
//! mutable value is addressed by `SHA256(publicKey || nonce)` and carries a
//! monotonic sequence number and an Ed25519 signature by the owner key. An
//! encrypted value is a mutable value whose data is boxed for a single
//! recipient.

use crate::crypto::{self, Identity, NONCE_BYTES, SIGNATURE_BYTES};
use crate::error::{Error, Result};
use crate::id::Id;
use serde::{Deserialize, Serialize};

/// Data cap for a single value. Values travel in one datagram; the codec
/// enforces the final envelope size against the MTU.
pub const MAX_VALUE_DATA: usize = 1200;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Value {
    /// Owner public key; present iff the value is mutable.
    #[serde(rename = "k")]
    pub public_key: Option<Id>,
    /// Recipient id; present iff the value is encrypted.
    #[serde(rename = "rec")]
    pub recipient: Option<Id>,
    /// 24-byte nonce; bound into the id and reused as the box nonce.
    #[serde(rename = "n", with = "crate::types::opt_bytes_serde")]
    pub nonce: Option<Vec<u8>>,
    #[serde(rename = "s")]
    pub sequence_number: i32,
    #[serde(rename = "sig", with = "crate::types::opt_bytes_serde")]
    pub signature: Option<Vec<u8>>,
    #[serde(rename = "d", with = "crate::types::bytes_serde")]
    pub data: Vec<u8>,
}

impl Value {
    /// An immutable value: plain content, content-addressed.
    pub fn immutable(data: Vec<u8>) -> Result<Self> {
        check_data_len(&data)?;
        Ok(Self {
            public_key: None,
            recipient: None,
            nonce: None,
            sequence_number: 0,
            signature: None,
            data,
        })
    }

    /// A signed mutable value owned by `identity`. A fresh nonce is drawn
    /// when none is given.
    pub fn signed(
        identity: &Identity,
        nonce: Option<Vec<u8>>,
        sequence_number: i32,
        data: Vec<u8>,
    ) -> Result<Self> {
        Self::build(identity, None, nonce, sequence_number, data)
    }

    /// A signed mutable value whose data is boxed for `recipient`.
    pub fn encrypted(
        identity: &Identity,
        recipient: Id,
        nonce: Option<Vec<u8>>,
        sequence_number: i32,
        data: Vec<u8>,
    ) -> Result<Self> {
        Self::build(identity, Some(recipient), nonce, sequence_number, data)
    }

    fn build(
        identity: &Identity,
        recipient: Option<Id>,
        nonce: Option<Vec<u8>>,
        sequence_number: i32,
        data: Vec<u8>,
    ) -> Result<Self> {
        check_data_len(&data)?;
        let nonce = match nonce {
            Some(n) if n.len() == NONCE_BYTES => n,
            Some(n) => {
                return Err(Error::InvalidArgument(format!(
                    "nonce must be {} bytes, got {}",
                    NONCE_BYTES,
                    n.len()
                )))
            }
            None => crypto::random_nonce(),
        };
        let data = match &recipient {
            Some(rec) => crypto::encrypt_with_nonce(identity, rec, &nonce, &data)?,
            None => data,
        };
        let mut value = Self {
            public_key: Some(*identity.id()),
            recipient,
            nonce: Some(nonce),
            sequence_number,
            signature: None,
            data,
        };
        value.signature = Some(identity.sign(&value.signing_data()));
        Ok(value)
    }

    /// A new version of this mutable value: same id, incremented sequence,
    /// re-signed (and re-boxed for encrypted values).
    pub fn update(&self, identity: &Identity, data: Vec<u8>) -> Result<Self> {
        if !self.is_mutable() {
            return Err(Error::InvalidArgument(
                "immutable values cannot be updated".into(),
            ));
        }
        if self.public_key != Some(*identity.id()) {
            return Err(Error::NotValueOwner);
        }
        // Nonce is bound into the id and must survive updates.
        Self::build(
            identity,
            self.recipient,
            self.nonce.clone(),
            self.sequence_number + 1,
            data,
        )
    }

    pub fn is_mutable(&self) -> bool {
        self.public_key.is_some()
    }

    pub fn is_encrypted(&self) -> bool {
        self.recipient.is_some()
    }

    /// Identifier contract: `SHA256(publicKey || nonce)` for mutable,
    /// `SHA256(data)` for immutable.
    pub fn id(&self) -> Id {
        match (&self.public_key, &self.nonce) {
            (Some(pk), Some(nonce)) => {
                Id::from_bytes(crypto::sha256_parts(&[pk.as_bytes(), nonce]))
            }
            _ => Id::from_bytes(crypto::sha256(&self.data)),
        }
    }

    fn signing_data(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(ID_SIG_PREFIX + self.data.len());
        if let Some(pk) = &self.public_key {
            buf.extend_from_slice(pk.as_bytes());
        }
        if let Some(nonce) = &self.nonce {
            buf.extend_from_slice(nonce);
        }
        buf.extend_from_slice(&self.sequence_number.to_le_bytes());
        if let Some(rec) = &self.recipient {
            buf.extend_from_slice(rec.as_bytes());
        }
        buf.extend_from_slice(&self.data);
        buf
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// Structural and cryptographic validation.
    pub fn validate(&self) -> Result<()> {
        // encrypted payloads carry a 16-byte AEAD tag on top of the cap
        let cap = if self.recipient.is_some() {
            MAX_VALUE_DATA + BOX_TAG_BYTES
        } else {
            MAX_VALUE_DATA
        };
        if self.data.is_empty() || self.data.len() > cap {
            return Err(Error::Protocol("bad value data length".into()));
        }
        match &self.public_key {
            None => {
                if self.nonce.is_some() || self.signature.is_some() || self.recipient.is_some() {
                    return Err(Error::Protocol(
                        "immutable value carries mutable fields".into(),
                    ));
                }
                Ok(())
            }
            Some(pk) => {
                match &self.nonce {
                    Some(n) if n.len() == NONCE_BYTES => {}
                    _ => return Err(Error::Protocol("mutable value without nonce".into())),
                }
                match &self.signature {
                    Some(sig) if sig.len() == SIGNATURE_BYTES => {
                        crypto::verify(pk, &self.signing_data(), sig)
                    }
                    _ => Err(Error::InvalidSignature),
                }
            }
        }
    }

    /// Open an encrypted value's box. `identity` must be the recipient.
    pub fn decrypt_data(&self, identity: &Identity) -> Result<Vec<u8>> {
        let recipient = self
            .recipient
            .ok_or_else(|| Error::InvalidArgument("value is not encrypted".into()))?;
        if recipient != *identity.id() {
            return Err(Error::Crypto("not the recipient of this value".into()));
        }
        let sender = self
            .public_key
            .ok_or_else(|| Error::Protocol("encrypted value without owner".into()))?;
        let nonce = self
            .nonce
            .as_ref()
            .ok_or_else(|| Error::Protocol("encrypted value without nonce".into()))?;
        crypto::decrypt_with_nonce(identity, &sender, nonce, &self.data)
    }
}

const ID_SIG_PREFIX: usize = 32 + NONCE_BYTES + 4 + 32;
const BOX_TAG_BYTES: usize = 16;

fn check_data_len(data: &[u8]) -> Result<()> {
    if data.is_empty() || data.len() > MAX_VALUE_DATA {
        return Err(Error::InvalidArgument(format!(
            "value data must be 1..={} bytes, got {}",
            MAX_VALUE_DATA,
            data.len()
        )));
    }
    Ok(())
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = if self.is_encrypted() {
            "encrypted"
        } else if self.is_mutable() {
            "mutable"
        } else {
            "immutable"
        };
        write!(
            f,
            "{}[{}, seq={}, {} bytes]",
            kind,
            self.id(),
            self.sequence_number,
            self.data.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn immutable_id_is_content_hash() {
        let value = Value::immutable(b"Hello from A".to_vec()).unwrap();
        assert_eq!(
            value.id(),
            Id::from_bytes(crypto::sha256(b"Hello from A"))
        );
        assert!(!value.is_mutable());
        assert!(value.is_valid());
    }

    #[test]
    fn mutable_id_is_key_nonce_hash() {
        let identity = Identity::generate();
        let value = Value::signed(&identity, None, 0, b"v0".to_vec()).unwrap();
        let nonce = value.nonce.clone().unwrap();
        let expected =
            Id::from_bytes(crypto::sha256_parts(&[identity.id().as_bytes(), &nonce]));
        assert_eq!(value.id(), expected);
        assert!(value.is_valid());
    }

    #[test]
    fn update_keeps_id_and_bumps_sequence() {
        let identity = Identity::generate();
        let v0 = Value::signed(&identity, None, 0, b"v0".to_vec()).unwrap();
        let v1 = v0.update(&identity, b"updated".to_vec()).unwrap();
        assert_eq!(v0.id(), v1.id());
        assert_eq!(v1.sequence_number, 1);
        assert!(v1.is_valid());

        let stranger = Identity::generate();
        assert!(matches!(
            v0.update(&stranger, b"hijack".to_vec()),
            Err(Error::NotValueOwner)
        ));
    }

    #[test]
    fn tampered_signature_is_invalid() {
        let identity = Identity::generate();
        let mut value = Value::signed(&identity, None, 3, b"payload".to_vec()).unwrap();
        assert!(value.is_valid());

        if let Some(sig) = value.signature.as_mut() {
            sig[0] ^= 0x40;
        }
        assert!(!value.is_valid());
        assert!(matches!(value.validate(), Err(Error::InvalidSignature)));
    }

    #[test]
    fn tampered_data_is_invalid() {
        let identity = Identity::generate();
        let mut value = Value::signed(&identity, None, 0, b"payload".to_vec()).unwrap();
        value.data[0] ^= 0x01;
        assert!(matches!(value.validate(), Err(Error::InvalidSignature)));
    }

    #[test]
    fn encrypted_value_round_trip() {
        let alice = Identity::generate();
        let bob = Identity::generate();

        let value =
            Value::encrypted(&alice, *bob.id(), None, 0, b"for bob only".to_vec()).unwrap();
        assert!(value.is_encrypted());
        assert!(value.is_valid());
        assert_ne!(value.data, b"for bob only");

        assert_eq!(value.decrypt_data(&bob).unwrap(), b"for bob only");

        let eve = Identity::generate();
        assert!(value.decrypt_data(&eve).is_err());
        assert!(value.decrypt_data(&alice).is_err());
    }

    #[test]
    fn data_length_is_bounded() {
        assert!(Value::immutable(Vec::new()).is_err());
        assert!(Value::immutable(vec![0u8; MAX_VALUE_DATA]).is_ok());
        assert!(Value::immutable(vec![0u8; MAX_VALUE_DATA + 1]).is_err());

        let identity = Identity::generate();
        assert!(Value::signed(&identity, None, 0, vec![0u8; MAX_VALUE_DATA + 1]).is_err());

        // the AEAD-tag headroom applies to encrypted values only
        let mut oversized = Value::immutable(vec![0u8; MAX_VALUE_DATA]).unwrap();
        oversized.data = vec![0u8; MAX_VALUE_DATA + 1];
        assert!(oversized.validate().is_err());
        let full = Value::encrypted(&identity, *identity.id(), None, 0, vec![0u8; MAX_VALUE_DATA])
            .unwrap();
        assert_eq!(full.data.len(), MAX_VALUE_DATA + 16);
        assert!(full.is_valid());
    }

    #[test]
    fn immutable_with_signature_rejected() {
        let mut value = Value::immutable(b"x".to_vec()).unwrap();
        value.signature = Some(vec![0u8; SIGNATURE_BYTES]);
        assert!(value.validate().is_err());
    }

    #[test]
    fn cbor_round_trip() {
        let identity = Identity::generate();
        let value = Value::signed(&identity, None, 7, b"wire".to_vec()).unwrap();
        let mut buf = Vec::new();
        ciborium::into_writer(&value, &mut buf).unwrap();
        let back: Value = ciborium::from_reader(buf.as_slice()).unwrap();
        assert_eq!(value, back);
        assert!(back.is_valid());
    }
}

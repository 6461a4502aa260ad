//! Identity keys, signatures and box encryption.
//!
//! A node identity is an Ed25519 keypair; the node id is the raw public
//! key. The same keypair is converted to X25519 for box encryption, so one
//! key file covers both signing and sealing. Boxes are XChaCha20-Poly1305
//! under a SHA-256-derived shared key, with the 24-byte nonce carried next
//! to the ciphertext (or, for encrypted values, taken from the value's own
//! nonce).

use crate::error::{Error, Result};
use crate::id::Id;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as XPublicKey, StaticSecret};

pub const PRIVATE_KEY_BYTES: usize = 32;
pub const SIGNATURE_BYTES: usize = 64;
pub const NONCE_BYTES: usize = 24;

/// The process identity: signing key, derived encryption key, derived id.
/// Immutable after construction and safe to share.
pub struct Identity {
    signing: SigningKey,
    encryption: StaticSecret,
    id: Id,
}

impl Identity {
    pub fn generate() -> Self {
        let signing = SigningKey::generate(&mut rand::rngs::OsRng);
        Self::from_signing_key(signing)
    }

    pub fn from_private_key(bytes: &[u8; PRIVATE_KEY_BYTES]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(bytes))
    }

    fn from_signing_key(signing: SigningKey) -> Self {
        let id = Id::from_bytes(signing.verifying_key().to_bytes());
        let encryption = StaticSecret::from(signing.to_scalar_bytes());
        Self {
            signing,
            encryption,
            id,
        }
    }

    pub fn id(&self) -> &Id {
        &self.id
    }

    /// Raw private key bytes, for the persisted key file. Callers should
    /// wrap the result in `Zeroizing` when it outlives the write.
    pub fn private_key(&self) -> [u8; PRIVATE_KEY_BYTES] {
        self.signing.to_bytes()
    }

    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        self.signing.sign(data).to_bytes().to_vec()
    }

    fn box_key(&self, peer: &Id) -> Result<[u8; 32]> {
        let shared = self.encryption.diffie_hellman(&x25519_public(peer)?);
        Ok(sha256(shared.as_bytes()))
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity").field("id", &self.id).finish()
    }
}

/// Verify an Ed25519 signature made by the key behind `id`.
pub fn verify(id: &Id, data: &[u8], signature: &[u8]) -> Result<()> {
    let key = VerifyingKey::from_bytes(id.as_bytes()).map_err(|_| Error::InvalidSignature)?;
    let sig = Signature::from_slice(signature).map_err(|_| Error::InvalidSignature)?;
    key.verify(data, &sig).map_err(|_| Error::InvalidSignature)
}

/// X25519 public key derived from an overlay id (birational map from the
/// Ed25519 point).
fn x25519_public(id: &Id) -> Result<XPublicKey> {
    let key = VerifyingKey::from_bytes(id.as_bytes())
        .map_err(|_| Error::Crypto(format!("id {} is not a valid public key", id)))?;
    Ok(XPublicKey::from(key.to_montgomery().to_bytes()))
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

pub fn sha256_parts(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Encrypt `plaintext` from `identity` to `recipient` under an explicit
/// 24-byte nonce. Used by encrypted values, whose nonce doubles as the box
/// nonce.
pub fn encrypt_with_nonce(
    identity: &Identity,
    recipient: &Id,
    nonce: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>> {
    if nonce.len() != NONCE_BYTES {
        return Err(Error::Crypto(format!("bad nonce length {}", nonce.len())));
    }
    let key = identity.box_key(recipient)?;
    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));
    cipher
        .encrypt(XNonce::from_slice(nonce), plaintext)
        .map_err(|_| Error::Crypto("encryption failed".into()))
}

pub fn decrypt_with_nonce(
    identity: &Identity,
    sender: &Id,
    nonce: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>> {
    if nonce.len() != NONCE_BYTES {
        return Err(Error::Crypto(format!("bad nonce length {}", nonce.len())));
    }
    let key = identity.box_key(sender)?;
    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));
    cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| Error::Crypto("decryption failed".into()))
}

/// Encrypt with a random nonce, prepended to the ciphertext.
pub fn encrypt(identity: &Identity, recipient: &Id, plaintext: &[u8]) -> Result<Vec<u8>> {
    let mut nonce = [0u8; NONCE_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    let ct = encrypt_with_nonce(identity, recipient, &nonce, plaintext)?;
    let mut out = Vec::with_capacity(NONCE_BYTES + ct.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ct);
    Ok(out)
}

/// Counterpart of [`encrypt`]: expects `nonce || ciphertext`.
pub fn decrypt(identity: &Identity, sender: &Id, data: &[u8]) -> Result<Vec<u8>> {
    if data.len() <= NONCE_BYTES {
        return Err(Error::Crypto("ciphertext too short".into()));
    }
    decrypt_with_nonce(identity, sender, &data[..NONCE_BYTES], &data[NONCE_BYTES..])
}

/// A fresh random 24-byte nonce.
pub fn random_nonce() -> Vec<u8> {
    let mut nonce = vec![0u8; NONCE_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

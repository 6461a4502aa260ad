//! Rolling write-authorization tokens.
//!
//! A token binds (requester id, requester address, target id) to the
//! current epoch and a process-lifetime secret. Store and announce
//! requests must echo a token minted by an earlier lookup response;
//! verification accepts the current and the previous epoch, so a token
//! stays valid for at least one epoch length.

use super::TOKEN_EPOCH;
use crate::crypto::sha256_parts;
use crate::id::Id;
use crate::types::now;
use rand::RngCore;
use std::net::SocketAddr;

pub struct TokenManager {
    session_secret: [u8; 32],
}

impl TokenManager {
    pub fn new() -> Self {
        let mut session_secret = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut session_secret);
        Self { session_secret }
    }

    fn epoch() -> u64 {
        now() / TOKEN_EPOCH.as_secs()
    }

    fn compute(&self, requester: &Id, addr: &SocketAddr, target: &Id, epoch: u64) -> u32 {
        let ip_bytes: Vec<u8> = match addr.ip() {
            std::net::IpAddr::V4(ip) => ip.octets().to_vec(),
            std::net::IpAddr::V6(ip) => ip.octets().to_vec(),
        };
        let port = addr.port().to_be_bytes();
        let epoch_bytes = epoch.to_be_bytes();
        let digest = sha256_parts(&[
            requester.as_bytes(),
            &ip_bytes,
            &port,
            target.as_bytes(),
            &epoch_bytes,
            &self.session_secret,
        ]);
        u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
    }

    /// Mint a token for the requester at `addr` targeting `target`.
    pub fn generate(&self, requester: &Id, addr: &SocketAddr, target: &Id) -> u32 {
        self.compute(requester, addr, target, Self::epoch())
    }

    /// Accepts tokens from the current or the previous epoch.
    pub fn verify(&self, token: u32, requester: &Id, addr: &SocketAddr, target: &Id) -> bool {
        let epoch = Self::epoch();
        token == self.compute(requester, addr, target, epoch)
            || token == self.compute(requester, addr, target, epoch.wrapping_sub(1))
    }
}

impl Default for TokenManager {
    fn default() -> Self {
        Self::new()
    }
}

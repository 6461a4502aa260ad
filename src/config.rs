//! Node configuration.

use crate::error::{Error, Result};
use crate::types::{LookupOption, NodeInfo};
use std::net::IpAddr;
use std::path::PathBuf;
use zeroize::Zeroize;

/// Default UDP port for the overlay.
pub const DEFAULT_PORT: u16 = 39001;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Raw Ed25519 private key. Generated (and persisted when `data_dir`
    /// is set) if absent.
    pub private_key: Option<[u8; 32]>,

    /// Local IPv4 address to bind; at least one family must be set.
    pub addr4: Option<IpAddr>,
    /// Local IPv6 address to bind.
    pub addr6: Option<IpAddr>,
    /// UDP port; 0 binds an OS-assigned ephemeral port.
    pub port: u16,

    /// Enables persistence of the key file, id file and routing caches.
    pub data_dir: Option<PathBuf>,
    /// Backing store for values and peers; in-memory when absent.
    pub storage_path: Option<PathBuf>,

    pub bootstrap_nodes: Vec<NodeInfo>,

    pub enable_suspicious_node_detector: bool,
    pub enable_spam_throttling: bool,
    /// Relaxes bogon checks so private/loopback overlays can form.
    pub developer_mode: bool,
    pub default_lookup_option: LookupOption,

    /// Per-ip inbound request rate (requests per second).
    pub throttle_rate: u32,
    /// Per-ip burst allowance.
    pub throttle_burst: u32,
    /// Observations within the sliding window that promote a host to the
    /// ban list.
    pub sentinel_threshold: u32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            private_key: None,
            addr4: None,
            addr6: None,
            port: DEFAULT_PORT,
            data_dir: None,
            storage_path: None,
            bootstrap_nodes: Vec::new(),
            enable_suspicious_node_detector: true,
            enable_spam_throttling: true,
            developer_mode: false,
            default_lookup_option: LookupOption::Conservative,
            throttle_rate: 32,
            throttle_burst: 128,
            sentinel_threshold: 32,
        }
    }
}

impl NodeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.addr4.is_none() && self.addr6.is_none() {
            return Err(Error::InvalidArgument(
                "at least one of addr4/addr6 must be configured".into(),
            ));
        }
        if let Some(addr) = &self.addr4 {
            if !addr.is_ipv4() {
                return Err(Error::InvalidArgument(format!(
                    "addr4 is not an IPv4 address: {}",
                    addr
                )));
            }
        }
        if let Some(addr) = &self.addr6 {
            if !addr.is_ipv6() {
                return Err(Error::InvalidArgument(format!(
                    "addr6 is not an IPv6 address: {}",
                    addr
                )));
            }
        }
        if self.throttle_rate == 0 || self.throttle_burst == 0 {
            return Err(Error::InvalidArgument(
                "throttle rate and burst must be non-zero".into(),
            ));
        }
        if self.sentinel_threshold == 0 {
            return Err(Error::InvalidArgument(
                "sentinel threshold must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Forget key material explicitly, for callers that keep a config
    /// around after node construction.
    pub fn scrub_private_key(&mut self) {
        if let Some(key) = self.private_key.as_mut() {
            key.zeroize();
        }
        self.private_key = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_requires_an_address() {
        let config = NodeConfig::default();
        assert!(config.validate().is_err());

        let config = NodeConfig {
            addr4: Some("127.0.0.1".parse().unwrap()),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn ephemeral_port_is_allowed() {
        let config = NodeConfig {
            addr4: Some("127.0.0.1".parse().unwrap()),
            port: 0,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn family_mismatch_rejected() {
        let config = NodeConfig {
            addr4: Some("::1".parse().unwrap()),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = NodeConfig {
            addr6: Some("10.0.0.1".parse().unwrap()),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn scrub_clears_key() {
        let mut config = NodeConfig {
            private_key: Some([9u8; 32]),
            ..Default::default()
        };
        config.scrub_private_key();
        assert!(config.private_key.is_none());
    }
}

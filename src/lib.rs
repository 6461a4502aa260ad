//! Meridian: a Kademlia-style DHT overlay node.
//!
//! A node joins a 256-bit XOR keyspace, maintains a bucketed routing
//! table of known peers, exchanges CBOR datagrams over UDP and exposes
//! four primitives: locate nodes near a key, publish and retrieve
//! (immutable, mutable or encrypted) values, and publish and retrieve
//! application-level service peers.

pub mod config;
pub mod crypto;
pub mod dht;
pub mod error;
pub mod id;
pub mod peer;
pub mod storage;
pub mod types;
pub mod value;

pub use config::{NodeConfig, DEFAULT_PORT};
pub use crypto::Identity;
pub use dht::node::FoundNode;
pub use dht::{ConnectionState, Node, NodeEvent, NodeState};
pub use error::{Error, Result};
pub use id::Id;
pub use peer::PeerInfo;
pub use storage::{MemoryStorage, SledStorage, Storage};
pub use types::{LookupOption, NodeInfo};
pub use value::Value;

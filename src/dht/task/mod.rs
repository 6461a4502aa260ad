//! Iterative lookup and announce tasks.
//!
//! Tasks are flat state machines owned by the reactor: they never touch
//! the socket themselves but emit [`CallRequest`]s that the reactor turns
//! into RPC calls, and they are stepped by response/timeout events routed
//! back through the [`TaskManager`].

pub mod announce;
pub mod closest;
pub mod lookup;
pub mod manager;
pub mod ping;

pub use announce::{AnnouncePayload, AnnounceTask};
pub use closest::{Candidate, CandidateState, ClosestSet};
pub use lookup::{LookupKind, LookupTask};
pub use manager::{Task, TaskManager};
pub use ping::PingRefreshTask;

use crate::dht::codec::Request;
use crate::id::Id;
use crate::peer::PeerInfo;
use crate::types::{is_routable, NodeInfo};
use crate::value::Value;
use std::net::SocketAddr;

pub type TaskId = u64;

/// An outgoing call a task wants sent.
#[derive(Debug)]
pub struct CallRequest {
    pub target: NodeInfo,
    pub request: Request,
}

/// Result of a finished task.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Nodes {
        closest: Vec<NodeInfo>,
        exact: Option<NodeInfo>,
    },
    Value(Option<Value>),
    Peers(Vec<PeerInfo>),
    Announced {
        stored: usize,
        conflicts: usize,
    },
    Refreshed {
        pinged: usize,
    },
}

/// Address family served by one reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn contains(&self, addr: &SocketAddr) -> bool {
        match self {
            Family::V4 => addr.is_ipv4(),
            Family::V6 => addr.is_ipv6(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Family::V4 => "v4",
            Family::V6 => "v6",
        }
    }
}

/// Gate on candidates entering a lookup: own family, not ourselves, and
/// routable unless developer mode relaxes bogon checks.
#[derive(Debug, Clone)]
pub struct CandidateFilter {
    pub family: Family,
    pub local_id: Id,
    pub developer_mode: bool,
}

impl CandidateFilter {
    pub fn allows(&self, info: &NodeInfo) -> bool {
        info.id != self.local_id
            && self.family.contains(&info.addr)
            && info.addr.port() != 0
            && (self.developer_mode || is_routable(&info.addr.ip()))
    }
}

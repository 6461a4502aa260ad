//! DHT engine: routing table, wire codec, RPC reactor, task engine.

pub mod bucket;
pub mod codec;
pub mod entry;
pub mod node;
pub mod prefix;
pub mod rpc;
pub mod sentinel;
pub mod table;
pub mod task;
pub mod throttle;
pub mod token;

pub use bucket::KBucket;
pub use codec::{Message, Method, Request, Response};
pub use entry::KBucketEntry;
pub use node::{FoundNode, Node, NodeEvent, NodeState};
pub use prefix::Prefix;
pub use rpc::ConnectionState;
pub use table::RoutingTable;
pub use token::TokenManager;

use std::time::Duration;

/// Bucket capacity, and the size of a lookup's result set.
pub const K: usize = 8;

/// Lookup parallelism.
pub const ALPHA: usize = 3;

/// Datagram budget; encode fails and ingress drops beyond this.
pub const MTU: usize = 1400;

/// Consecutive non-responses before an entry is dropped from the table.
pub const MAX_FAILED_REQUESTS: u32 = 5;

/// Adaptive RPC timeout bounds.
pub const CALL_TIMEOUT_MIN: Duration = Duration::from_secs(2);
pub const CALL_TIMEOUT_MAX: Duration = Duration::from_secs(10);

/// Routing-table upkeep cadence.
pub const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// A bucket unused for this long gets a random-id refresh lookup.
pub const BUCKET_REFRESH_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Write-token epoch length; the previous epoch stays valid.
pub const TOKEN_EPOCH: Duration = Duration::from_secs(5 * 60);

/// Minimum spacing between bootstrap rounds.
pub const BOOTSTRAP_MIN_INTERVAL: Duration = Duration::from_secs(4 * 60);

/// Cadence of the persistent-entry re-announce scan.
pub const REANNOUNCE_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Hard ceiling on a single iterative lookup.
pub const TASK_DEADLINE: Duration = Duration::from_secs(2 * 60);
